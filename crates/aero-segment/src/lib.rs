//! x86 segmentation: offset-to-linear translation with limit checks.
//!
//! A segment register holds a [`StandardSegment`] (real-mode, virtual-8086 or protected-mode),
//! the GDT/LDT are [`DescriptorTableSegment`]s, and loading a null selector leaves a
//! [`NullSegment`]. [`Segment`] erases the variant for callers that store any of them.

mod descriptor;
mod fault;
mod io;
mod segment;
mod snapshot;

pub use crate::descriptor::{AccessRights, Descriptor, DescriptorFlags, Selector};
pub use crate::fault::{
    IllegalSegmentOperation, SegmentAccessError, SegmentFault, VECTOR_GENERAL_PROTECTION,
    VECTOR_SEGMENT_NOT_PRESENT,
};
pub use crate::segment::{
    AddressTranslation, DescriptorTableSegment, NullSegment, Segment, SegmentKind,
    StandardSegment,
};
pub use crate::snapshot::{
    Result as SnapshotResult, SnapshotError, TAG_DESCRIPTOR_TABLE, TAG_NULL, TAG_PROTECTED,
    TAG_REAL, TAG_VIRTUAL8086,
};

//! Instruction fetch front-end: segment translation of CS:EIP followed by decode dispatch.
//!
//! [`FetchCpu`] owns the guest address space, the code segment and the instruction pointer, and
//! turns "fetch the next block" into either a [`CodeBlock`], a guest-visible fault, or `#UD`.

mod cpu;

pub use crate::cpu::{FetchCpu, StepError, VECTOR_INVALID_OPCODE};

pub use aero_segment::{
    AddressTranslation, DescriptorTableSegment, Segment, SegmentAccessError, SegmentFault,
    StandardSegment,
};
pub use aero_x86::{CodeBlock, CpuMode, DecodeDispatcher, DispatchConfig};
pub use memory::{DenseMemory, GuestMemory, GuestMemoryError, SparseMemory};

//! Persisted segment encoding.
//!
//! Layout (little-endian):
//!
//! | field | width |
//! | --- | --- |
//! | tag | u32 |
//! | base | u32 |
//! | limit | u32 |
//! | selector (standard only) | u16 |
//! | access (standard only) | u8 |
//! | flags (standard only) | u8 |

use std::io::{self, Read, Write};

use thiserror::Error;

use crate::descriptor::{AccessRights, DescriptorFlags, Selector};
use crate::io::{ReadLeExt, WriteLeExt};
use crate::segment::{
    AddressTranslation, DescriptorTableSegment, NullSegment, Segment, SegmentKind,
    StandardSegment,
};

pub type Result<T> = std::result::Result<T, SnapshotError>;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("unknown segment tag {0}")]
    UnknownSegmentTag(u32),

    #[error("corrupt segment state: {0}")]
    Corrupt(&'static str),
}

pub const TAG_NULL: u32 = 0;
pub const TAG_REAL: u32 = 1;
pub const TAG_VIRTUAL8086: u32 = 2;
pub const TAG_PROTECTED: u32 = 3;
pub const TAG_DESCRIPTOR_TABLE: u32 = 4;

impl Segment {
    pub fn tag(&self) -> u32 {
        match self {
            Segment::Null(_) => TAG_NULL,
            Segment::DescriptorTable(_) => TAG_DESCRIPTOR_TABLE,
            Segment::Standard(seg) => match seg.kind() {
                SegmentKind::Real => TAG_REAL,
                SegmentKind::Virtual8086 => TAG_VIRTUAL8086,
                SegmentKind::Protected => TAG_PROTECTED,
            },
        }
    }

    pub fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u32_le(self.tag())?;
        w.write_u32_le(self.base())?;
        w.write_u32_le(self.limit())?;
        if let Segment::Standard(seg) = self {
            w.write_u16_le(seg.selector().0)?;
            w.write_u8(seg.access().bits())?;
            w.write_u8(seg.flags().bits())?;
        }
        Ok(())
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<Self> {
        let tag = r.read_u32_le()?;
        let base = r.read_u32_le()?;
        let limit = r.read_u32_le()?;

        let kind = match tag {
            TAG_NULL => {
                if base != 0 || limit != 0 {
                    return Err(SnapshotError::Corrupt("null segment with base or limit"));
                }
                return Ok(Segment::Null(NullSegment));
            }
            TAG_DESCRIPTOR_TABLE => {
                return Ok(Segment::DescriptorTable(DescriptorTableSegment::new(
                    base, limit,
                )))
            }
            TAG_REAL => SegmentKind::Real,
            TAG_VIRTUAL8086 => SegmentKind::Virtual8086,
            TAG_PROTECTED => SegmentKind::Protected,
            other => return Err(SnapshotError::UnknownSegmentTag(other)),
        };

        let selector = Selector(r.read_u16_le()?);
        let access = AccessRights::from_bits_retain(r.read_u8()?);
        let flags = r.read_u8()?;
        if flags & 0xF0 != 0 {
            return Err(SnapshotError::Corrupt("descriptor flags use reserved bits"));
        }
        Ok(Segment::Standard(StandardSegment::from_parts(
            kind,
            selector,
            base,
            limit,
            access,
            DescriptorFlags::from_bits_retain(flags),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(seg: Segment) -> Segment {
        let mut buf = Vec::new();
        seg.encode(&mut buf).unwrap();
        Segment::decode(&mut Cursor::new(buf)).unwrap()
    }

    #[test]
    fn descriptor_table_wire_layout() {
        let seg = Segment::DescriptorTable(DescriptorTableSegment::new(0x0008_0000, 0x0000_FFFF));
        let mut buf = Vec::new();
        seg.encode(&mut buf).unwrap();
        assert_eq!(
            buf,
            [
                0x04, 0x00, 0x00, 0x00, // tag
                0x00, 0x00, 0x08, 0x00, // base
                0xFF, 0xFF, 0x00, 0x00, // limit
            ]
        );
        let back = roundtrip(seg);
        assert_eq!(back.base(), 0x0008_0000);
        assert_eq!(back.limit(), 0x0000_FFFF);
    }

    #[test]
    fn standard_segments_roundtrip() {
        let protected =
            StandardSegment::from_descriptor(Selector(0x0b), 0x00CF9A000000FFFF).unwrap();
        for seg in [
            Segment::Standard(StandardSegment::real_mode(0xf000)),
            Segment::Standard(StandardSegment::virtual8086(0x1234)),
            Segment::Standard(protected),
            Segment::Null(NullSegment),
        ] {
            assert_eq!(roundtrip(seg), seg);
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut bytes = vec![0x09, 0, 0, 0];
        bytes.extend_from_slice(&[0; 8]);
        let err = Segment::decode(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, SnapshotError::UnknownSegmentTag(9)));
    }

    #[test]
    fn truncated_standard_segment_is_an_io_error() {
        let mut buf = Vec::new();
        Segment::Standard(StandardSegment::real_mode(0x40))
            .encode(&mut buf)
            .unwrap();
        buf.truncate(buf.len() - 1);
        let err = Segment::decode(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, SnapshotError::Io(_)));
    }
}

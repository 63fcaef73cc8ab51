//! Guest-visible segmentation faults and host-side misuse signals.
//!
//! A [`SegmentFault`] is delivered to the guest through the IDT. An [`IllegalSegmentOperation`]
//! is an emulator bug: a segment was asked for something its variant does not have.

use memory::GuestMemoryError;
use thiserror::Error;

/// #GP vector.
pub const VECTOR_GENERAL_PROTECTION: u8 = 13;
/// #NP vector.
pub const VECTOR_SEGMENT_NOT_PRESENT: u8 = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SegmentFault {
    /// #GP. For limit violations `code` is the offending offset.
    #[error("general protection fault (code {code:#x})")]
    GeneralProtection { code: u32 },
    /// #NP raised while loading a descriptor whose present bit is clear.
    #[error("segment not present (selector {selector:#06x})")]
    NotPresent { selector: u16 },
}

impl SegmentFault {
    #[inline]
    pub const fn vector(self) -> u8 {
        match self {
            SegmentFault::GeneralProtection { .. } => VECTOR_GENERAL_PROTECTION,
            SegmentFault::NotPresent { .. } => VECTOR_SEGMENT_NOT_PRESENT,
        }
    }

    /// Error code pushed on the exception frame.
    #[inline]
    pub const fn error_code(self) -> u32 {
        match self {
            SegmentFault::GeneralProtection { code } => code,
            SegmentFault::NotPresent { selector } => (selector & !0x3) as u32,
        }
    }
}

/// An operation was invoked on a segment variant that does not support it.
///
/// This is a bug in the caller, never a guest-visible condition, and must not be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("`{operation}` is not supported on {variant} segments")]
pub struct IllegalSegmentOperation {
    pub operation: &'static str,
    pub variant: &'static str,
}

/// Failure of a segment-relative memory access.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SegmentAccessError {
    #[error(transparent)]
    Fault(#[from] SegmentFault),
    #[error(transparent)]
    Memory(#[from] GuestMemoryError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_vectors_and_error_codes() {
        let gp = SegmentFault::GeneralProtection { code: 0x1_0000 };
        assert_eq!(gp.vector(), 13);
        assert_eq!(gp.error_code(), 0x1_0000);

        let np = SegmentFault::NotPresent { selector: 0x2b };
        assert_eq!(np.vector(), 11);
        assert_eq!(np.error_code(), 0x28);
    }
}

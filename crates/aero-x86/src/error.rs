use aero_segment::SegmentFault;
use memory::GuestMemoryError;
use thiserror::Error;

/// A decoder cannot produce a block from the current byte stream.
///
/// This is the only failure a factory chain recovers from by trying the next factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeAbort {
    #[error("byte source is not bound to an address space")]
    Unbound,
    #[error("instruction runs past the end of its region at {address:#x}")]
    EndOfRegion { address: u64 },
    /// The instruction would run past the CS limit or wrap the instruction pointer.
    #[error("instruction runs past the code segment limit at {address:#x}")]
    SegmentLimit { address: u64 },
    #[error("unsupported opcode {opcode:#04x}")]
    UnsupportedOpcode { opcode: u8 },
    #[error("invalid instruction encoding")]
    InvalidInstruction,
    #[error("instruction exceeds the 15-byte length limit")]
    TooLong,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("decode aborted: {0}")]
    Abort(#[from] DecodeAbort),
    #[error(transparent)]
    Memory(#[from] GuestMemoryError),
    #[error(transparent)]
    Fault(#[from] SegmentFault),
}

impl DecodeAbort {
    /// `true` when the abort means the byte stream ended rather than that the bytes were wrong.
    #[inline]
    pub fn is_fetch_boundary(&self) -> bool {
        matches!(
            self,
            DecodeAbort::EndOfRegion { .. } | DecodeAbort::SegmentLimit { .. }
        )
    }
}

impl DecodeError {
    #[inline]
    pub fn is_abort(&self) -> bool {
        matches!(self, DecodeError::Abort(_))
    }
}

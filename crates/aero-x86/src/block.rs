use iced_x86::Instruction;

use crate::decoder::basic::BasicOp;
use crate::mode::CpuMode;

/// Decoded form of a single instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Produced by the fast-path decoder.
    Basic(BasicOp),
    /// Produced by the full table decoder.
    Full(Instruction),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedOp {
    /// Offset of the first byte within CS.
    pub ip: u32,
    pub len: u8,
    pub op: Op,
}

/// A run of consecutively decoded instructions starting at one linear address.
///
/// Instructions are contiguous: each starts where the previous one ends. A block always holds at
/// least one instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    linear_address: u64,
    ip: u32,
    len: u32,
    mode: CpuMode,
    ops: Vec<DecodedOp>,
}

impl CodeBlock {
    /// Returns `None` for an empty instruction list.
    pub fn new(linear_address: u64, mode: CpuMode, ops: Vec<DecodedOp>) -> Option<Self> {
        let first = ops.first()?;
        let ip = first.ip;
        let len = ops.iter().map(|op| u32::from(op.len)).sum();
        debug_assert!(ops.windows(2).all(|w| {
            w[1].ip == w[0].ip.wrapping_add(u32::from(w[0].len)) & mode.ip_mask()
        }));
        Some(Self {
            linear_address,
            ip,
            len,
            mode,
            ops,
        })
    }

    #[inline]
    pub fn linear_address(&self) -> u64 {
        self.linear_address
    }

    #[inline]
    pub fn ip(&self) -> u32 {
        self.ip
    }

    /// Total encoded length in bytes.
    #[inline]
    pub fn len(&self) -> u32 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    #[inline]
    pub fn mode(&self) -> CpuMode {
        self.mode
    }

    #[inline]
    pub fn ops(&self) -> &[DecodedOp] {
        &self.ops
    }

    #[inline]
    pub fn instruction_count(&self) -> usize {
        self.ops.len()
    }

    /// Linear address one past the last byte of the block.
    #[inline]
    pub fn end_linear_address(&self) -> u64 {
        self.linear_address + u64::from(self.len)
    }

    /// IP of the instruction following the block when execution falls through.
    #[inline]
    pub fn fallthrough_ip(&self) -> u32 {
        self.ip.wrapping_add(self.len) & self.mode.ip_mask()
    }

    /// `true` when the block's bytes overlap `[addr, addr + len)`.
    pub fn overlaps(&self, addr: u64, len: u64) -> bool {
        addr < self.end_linear_address() && self.linear_address < addr.saturating_add(len)
    }
}

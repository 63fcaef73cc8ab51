//! Guest memory backends used by instruction fetch and segment-relative accesses.
//!
//! An address space is split into contiguous regions. [`DenseMemory`] is one region spanning
//! everything; [`SparseMemory`] makes every fixed-size chunk its own region, the way guest pages
//! are backed by separate host allocations.

mod dense;
mod sparse;

use thiserror::Error;

pub use crate::dense::DenseMemory;
pub use crate::sparse::SparseMemory;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuestMemoryError {
    #[error("guest memory access out of range: paddr=0x{paddr:x} len={len} size=0x{size:x}")]
    OutOfRange { paddr: u64, len: usize, size: u64 },
    #[error("guest memory size {size} does not fit in usize")]
    SizeTooLarge { size: u64 },
    #[error("invalid guest memory chunk size {chunk_size}")]
    InvalidChunkSize { chunk_size: usize },
}

pub type GuestMemoryResult<T> = Result<T, GuestMemoryError>;

/// A byte-addressable guest address space.
pub trait GuestMemory {
    fn size(&self) -> u64;

    fn read_into(&self, paddr: u64, dst: &mut [u8]) -> GuestMemoryResult<()>;

    fn write_from(&mut self, paddr: u64, src: &[u8]) -> GuestMemoryResult<()>;

    /// Bytes readable from `paddr` before the region holding it ends; 0 outside the address
    /// space. Instruction fetch uses this to tell a region boundary from the end of memory.
    fn contiguous_len(&self, paddr: u64) -> u64 {
        self.size().saturating_sub(paddr)
    }

    fn read_u8_le(&self, paddr: u64) -> GuestMemoryResult<u8> {
        let mut b = [0u8; 1];
        self.read_into(paddr, &mut b)?;
        Ok(b[0])
    }

    fn read_u16_le(&self, paddr: u64) -> GuestMemoryResult<u16> {
        let mut b = [0u8; 2];
        self.read_into(paddr, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    fn read_u32_le(&self, paddr: u64) -> GuestMemoryResult<u32> {
        let mut b = [0u8; 4];
        self.read_into(paddr, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn read_u64_le(&self, paddr: u64) -> GuestMemoryResult<u64> {
        let mut b = [0u8; 8];
        self.read_into(paddr, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    fn write_u8_le(&mut self, paddr: u64, value: u8) -> GuestMemoryResult<()> {
        self.write_from(paddr, &[value])
    }

    fn write_u16_le(&mut self, paddr: u64, value: u16) -> GuestMemoryResult<()> {
        self.write_from(paddr, &value.to_le_bytes())
    }

    fn write_u32_le(&mut self, paddr: u64, value: u32) -> GuestMemoryResult<()> {
        self.write_from(paddr, &value.to_le_bytes())
    }

    fn write_u64_le(&mut self, paddr: u64, value: u64) -> GuestMemoryResult<()> {
        self.write_from(paddr, &value.to_le_bytes())
    }
}

/// `[paddr, paddr + len)` must lie inside `[0, size)`.
pub(crate) fn check_range(size: u64, paddr: u64, len: usize) -> GuestMemoryResult<()> {
    let out_of_range = GuestMemoryError::OutOfRange { paddr, len, size };
    match paddr.checked_add(len as u64) {
        Some(end) if end <= size => Ok(()),
        _ => Err(out_of_range),
    }
}

use crate::{check_range, GuestMemory, GuestMemoryError, GuestMemoryResult};

/// One contiguous allocation covering the whole address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenseMemory {
    bytes: Vec<u8>,
}

impl DenseMemory {
    pub fn new(size: u64) -> GuestMemoryResult<Self> {
        let len = usize::try_from(size).map_err(|_| GuestMemoryError::SizeTooLarge { size })?;
        Ok(Self {
            bytes: vec![0; len],
        })
    }

    /// Memory whose size and contents are exactly `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    fn span(&self, paddr: u64, len: usize) -> GuestMemoryResult<core::ops::Range<usize>> {
        check_range(self.size(), paddr, len)?;
        // In range, so `paddr` fits the allocation's usize length.
        let start = paddr as usize;
        Ok(start..start + len)
    }
}

impl GuestMemory for DenseMemory {
    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_into(&self, paddr: u64, dst: &mut [u8]) -> GuestMemoryResult<()> {
        let span = self.span(paddr, dst.len())?;
        dst.copy_from_slice(&self.bytes[span]);
        Ok(())
    }

    fn write_from(&mut self, paddr: u64, src: &[u8]) -> GuestMemoryResult<()> {
        let span = self.span(paddr, src.len())?;
        self.bytes[span].copy_from_slice(src);
        Ok(())
    }
}

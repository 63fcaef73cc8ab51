use std::collections::BTreeMap;

use crate::{check_range, GuestMemory, GuestMemoryError, GuestMemoryResult};

/// Address space made of fixed-size chunks allocated on first write.
///
/// Each chunk is a separate region: [`GuestMemory::contiguous_len`] stops at the end of the chunk
/// holding the queried address even if the next chunk is allocated. Unwritten chunks read as
/// zero.
#[derive(Debug, Clone)]
pub struct SparseMemory {
    size: u64,
    chunk_size: u64,
    chunks: BTreeMap<u64, Box<[u8]>>,
}

impl SparseMemory {
    pub const DEFAULT_CHUNK_SIZE: usize = 4096;

    pub fn new(size: u64) -> GuestMemoryResult<Self> {
        Self::with_chunk_size(size, Self::DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(size: u64, chunk_size: usize) -> GuestMemoryResult<Self> {
        if chunk_size == 0 {
            return Err(GuestMemoryError::InvalidChunkSize { chunk_size });
        }
        Ok(Self {
            size,
            chunk_size: chunk_size as u64,
            chunks: BTreeMap::new(),
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size as usize
    }

    /// Number of chunks that have been written to.
    pub fn allocated_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Split `[paddr, paddr + len)` at chunk boundaries, yielding
    /// `(chunk index, offset in chunk, offset in buffer, length)`.
    fn pieces(&self, paddr: u64, len: usize) -> impl Iterator<Item = (u64, usize, usize, usize)> {
        let chunk_size = self.chunk_size;
        let mut done = 0usize;
        std::iter::from_fn(move || {
            if done == len {
                return None;
            }
            let addr = paddr + done as u64;
            let index = addr / chunk_size;
            let offset = (addr % chunk_size) as usize;
            let take = (chunk_size as usize - offset).min(len - done);
            let piece = (index, offset, done, take);
            done += take;
            Some(piece)
        })
    }
}

impl GuestMemory for SparseMemory {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_into(&self, paddr: u64, dst: &mut [u8]) -> GuestMemoryResult<()> {
        check_range(self.size, paddr, dst.len())?;
        for (index, offset, at, len) in self.pieces(paddr, dst.len()) {
            let out = &mut dst[at..at + len];
            match self.chunks.get(&index) {
                Some(chunk) => out.copy_from_slice(&chunk[offset..offset + len]),
                None => out.fill(0),
            }
        }
        Ok(())
    }

    fn write_from(&mut self, paddr: u64, src: &[u8]) -> GuestMemoryResult<()> {
        check_range(self.size, paddr, src.len())?;
        let chunk_size = self.chunk_size as usize;
        let pieces: Vec<_> = self.pieces(paddr, src.len()).collect();
        for (index, offset, at, len) in pieces {
            let chunk = self
                .chunks
                .entry(index)
                .or_insert_with(|| vec![0; chunk_size].into_boxed_slice());
            chunk[offset..offset + len].copy_from_slice(&src[at..at + len]);
        }
        Ok(())
    }

    fn contiguous_len(&self, paddr: u64) -> u64 {
        if paddr >= self.size {
            return 0;
        }
        let to_chunk_end = self.chunk_size - paddr % self.chunk_size;
        to_chunk_end.min(self.size - paddr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwritten_chunks_read_zero_and_stay_unallocated() {
        let mem = SparseMemory::with_chunk_size(128, 16).unwrap();
        assert_eq!(mem.read_u64_le(60).unwrap(), 0);
        assert_eq!(mem.allocated_chunks(), 0);
    }

    #[test]
    fn writes_split_across_chunks() {
        let mut mem = SparseMemory::with_chunk_size(64, 16).unwrap();
        mem.write_from(12, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert_eq!(mem.allocated_chunks(), 2);

        let mut back = [0u8; 10];
        mem.read_into(11, &mut back).unwrap();
        assert_eq!(back, [0, 1, 2, 3, 4, 5, 6, 7, 8, 0]);
    }

    #[test]
    fn regions_end_at_chunk_boundaries() {
        let mem = SparseMemory::with_chunk_size(40, 16).unwrap();
        assert_eq!(mem.contiguous_len(0), 16);
        assert_eq!(mem.contiguous_len(13), 3);
        assert_eq!(mem.contiguous_len(16), 16);
        // The last chunk is cut short by the memory size.
        assert_eq!(mem.contiguous_len(33), 7);
        assert_eq!(mem.contiguous_len(40), 0);
    }

    #[test]
    fn out_of_range_and_bad_chunk_size() {
        let mut mem = SparseMemory::with_chunk_size(16, 8).unwrap();
        assert!(matches!(
            mem.read_into(15, &mut [0u8; 2]),
            Err(GuestMemoryError::OutOfRange { .. })
        ));
        assert!(mem.write_u8_le(16, 1).is_err());
        assert_eq!(
            SparseMemory::with_chunk_size(16, 0).unwrap_err(),
            GuestMemoryError::InvalidChunkSize { chunk_size: 0 }
        );
    }
}

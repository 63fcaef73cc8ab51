use std::sync::Arc;

use memory::GuestMemory;

use crate::block::CodeBlock;
use crate::error::DecodeError;
use crate::factory::FactoryChain;
use crate::source::{ByteSource, FetchMode};

/// A code block at a linear address whose first instruction crosses into the next region.
///
/// Decoding runs the same factory chain as a regular decode, but over a byte source that keeps
/// reading across region boundaries. The block is decoded on first use and kept until
/// [`invalidate`](Self::invalidate) is called.
#[derive(Debug)]
pub struct SpanningCodeBlock {
    chain: Arc<FactoryChain>,
    linear_address: u64,
    ip: u32,
    limit: Option<u64>,
    resolved: Option<CodeBlock>,
}

impl SpanningCodeBlock {
    pub fn new(chain: Arc<FactoryChain>, linear_address: u64, ip: u32) -> Self {
        Self {
            chain,
            linear_address,
            ip,
            limit: None,
            resolved: None,
        }
    }

    /// Allow at most `limit` bytes from the start address, the room left in the code segment.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    #[inline]
    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    #[inline]
    pub fn linear_address(&self) -> u64 {
        self.linear_address
    }

    #[inline]
    pub fn ip(&self) -> u32 {
        self.ip
    }

    #[inline]
    pub fn is_resolved(&self) -> bool {
        self.resolved.is_some()
    }

    /// Decode without touching the memoized block. `source` is detached afterwards.
    pub fn decode<'m>(
        &self,
        source: &mut ByteSource<'m>,
        memory: &'m dyn GuestMemory,
    ) -> Result<Option<CodeBlock>, DecodeError> {
        self.chain.decode_with(
            source,
            memory,
            self.linear_address,
            self.ip,
            FetchMode::Spanning,
            self.limit,
        )
    }

    /// The decoded block, decoding it now if this is the first use since creation or the last
    /// invalidation. A failed or empty decode is not memoized.
    pub fn resolve<'m>(
        &mut self,
        source: &mut ByteSource<'m>,
        memory: &'m dyn GuestMemory,
    ) -> Result<Option<&CodeBlock>, DecodeError> {
        if self.resolved.is_none() {
            self.resolved = self.decode(source, memory)?;
        }
        Ok(self.resolved.as_ref())
    }

    /// Drop the memoized block; called when guest memory under it has been written.
    pub fn invalidate(&mut self) {
        self.resolved = None;
    }

    /// Invalidate if a write to `[addr, addr + len)` touched the decoded bytes.
    pub fn invalidate_range(&mut self, addr: u64, len: u64) -> bool {
        let hit = self
            .resolved
            .as_ref()
            .is_some_and(|block| block.overlaps(addr, len));
        if hit {
            self.invalidate();
        }
        hit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Op;
    use crate::decoder::BasicOp;
    use crate::dispatch::DispatchConfig;
    use crate::mode::CpuMode;
    use memory::{DenseMemory, SparseMemory};

    fn straddling_memory() -> SparseMemory {
        let mut mem = SparseMemory::with_chunk_size(0x2000, 0x1000).unwrap();
        // mov eax, 0x04030201; hlt
        mem.write_from(0x0FFE, &[0xB8, 0x01, 0x02, 0x03, 0x04, 0xF4])
            .unwrap();
        mem
    }

    fn chain() -> Arc<FactoryChain> {
        Arc::new(FactoryChain::for_mode(
            CpuMode::Protected32,
            &DispatchConfig::default(),
        ))
    }

    #[test]
    fn spanning_decode_matches_contiguous_buffer() {
        let sparse = straddling_memory();
        let mut contiguous = DenseMemory::new(0x2000).unwrap();
        contiguous
            .write_from(0x0FFE, &[0xB8, 0x01, 0x02, 0x03, 0x04, 0xF4])
            .unwrap();

        let mut src = ByteSource::detached();
        assert_eq!(chain().decode(&mut src, &sparse, 0x0FFE, 0x0FFE), Ok(None));

        let spanning = SpanningCodeBlock::new(chain(), 0x0FFE, 0x0FFE);
        let crossed = spanning.decode(&mut src, &sparse).unwrap().unwrap();
        assert!(!src.is_bound());
        let flat = chain()
            .decode(&mut src, &contiguous, 0x0FFE, 0x0FFE)
            .unwrap()
            .unwrap();
        assert_eq!(crossed, flat);
        assert_eq!(crossed.len(), 6);
    }

    #[test]
    fn resolve_memoizes_until_invalidated() {
        let mut mem = straddling_memory();
        let mut block = SpanningCodeBlock::new(chain(), 0x0FFE, 0x0FFE);
        assert!(!block.is_resolved());

        let first = block
            .resolve(&mut ByteSource::detached(), &mem)
            .unwrap()
            .cloned()
            .unwrap();
        assert!(block.is_resolved());

        // nop over the hlt; the memoized block is stale until invalidated.
        mem.write_u8_le(0x1003, 0x90).unwrap();
        assert_eq!(
            block.resolve(&mut ByteSource::detached(), &mem).unwrap(),
            Some(&first)
        );

        assert!(!block.invalidate_range(0x2000, 4));
        assert!(block.invalidate_range(0x1003, 1));
        let second = block
            .resolve(&mut ByteSource::detached(), &mem)
            .unwrap()
            .cloned()
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(second.ops()[1].op, Op::Basic(BasicOp::Nop));
    }

    #[test]
    fn limit_applies_across_the_region_boundary() {
        let mem = straddling_memory();
        let mut src = ByteSource::detached();

        // mov eax, imm32 needs 5 bytes; only 4 are left in the segment.
        let limited = SpanningCodeBlock::new(chain(), 0x0FFE, 0xFFFC).with_limit(4);
        assert_eq!(
            limited.decode(&mut src, &mem),
            Err(aero_segment::SegmentFault::GeneralProtection { code: 0x1_0000 }.into())
        );
        assert!(!src.is_bound());

        let block = SpanningCodeBlock::new(chain(), 0x0FFE, 0xFFF0)
            .with_limit(5)
            .decode(&mut src, &mem)
            .unwrap()
            .unwrap();
        assert_eq!(block.instruction_count(), 1);
        assert_eq!(block.len(), 5);
    }
}

//! Mode-aware decode dispatch: pick the chain for the current mode, decode within the region, and
//! fall back to a spanning decode when the first instruction runs into the next region.

use std::sync::Arc;

use aero_segment::{AddressTranslation, Segment};
use memory::GuestMemory;
use tracing::debug;

use crate::block::CodeBlock;
use crate::decoder::MAX_INSTRUCTION_LEN;
use crate::error::DecodeError;
use crate::factory::FactoryChain;
use crate::mode::CpuMode;
use crate::source::{ByteSource, FetchMode};
use crate::spanning::SpanningCodeBlock;

/// Configuration knobs for [`DecodeDispatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Upper bound on instructions per block. Zero is treated as one.
    pub max_block_instructions: usize,
    /// Put the fast-path subset decoder ahead of the full decoder.
    pub fast_path: bool,
    /// Retry with a spanning decode when the first instruction crosses its region's end.
    pub allow_spanning: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_block_instructions: 64,
            fast_path: true,
            allow_spanning: true,
        }
    }
}

/// One factory chain per [`CpuMode`].
#[derive(Debug, Clone)]
pub struct ChainSet {
    chains: [Arc<FactoryChain>; 4],
}

impl ChainSet {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            chains: CpuMode::ALL.map(|mode| Arc::new(FactoryChain::for_mode(mode, config))),
        }
    }

    /// Replace the chain used for `mode`.
    pub fn with_chain(mut self, mode: CpuMode, chain: FactoryChain) -> Self {
        self.chains[mode.index()] = Arc::new(chain);
        self
    }

    pub fn chain(&self, mode: CpuMode) -> &Arc<FactoryChain> {
        &self.chains[mode.index()]
    }
}

/// Processor state the dispatcher needs to locate the next instruction.
pub trait DecodeContext {
    fn memory(&self) -> &dyn GuestMemory;
    fn mode(&self) -> CpuMode;
    fn code_segment(&self) -> &Segment;
    fn instruction_pointer(&self) -> u32;
}

#[derive(Debug, Clone)]
pub struct DecodeDispatcher {
    config: DispatchConfig,
    chains: ChainSet,
}

impl DecodeDispatcher {
    pub fn new(config: DispatchConfig) -> Self {
        Self {
            chains: ChainSet::from_config(&config),
            config,
        }
    }

    pub fn with_chains(config: DispatchConfig, chains: ChainSet) -> Self {
        Self { config, chains }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn chains(&self) -> &ChainSet {
        &self.chains
    }

    /// Decode the block at CS:IP of `cpu`.
    ///
    /// The block stays inside the code segment: it never reads past the CS limit and never wraps
    /// the instruction pointer. An IP beyond the limit, or a first instruction crossing it,
    /// surfaces as #GP in [`DecodeError::Fault`]. `Ok(None)` means no decoder accepted the bytes
    /// at that address.
    pub fn decode_at<C: DecodeContext + ?Sized>(
        &self,
        cpu: &C,
    ) -> Result<Option<CodeBlock>, DecodeError> {
        let mode = cpu.mode();
        let ip = cpu.instruction_pointer();
        let cs = cpu.code_segment();
        let linear = cs.translate_address_read(ip)?;
        let to_limit = u64::from(cs.limit()) - u64::from(ip) + 1;
        let to_wrap = (u64::from(mode.ip_mask()) + 1).saturating_sub(u64::from(ip));
        let mut source = ByteSource::detached();
        self.decode_limited(
            &mut source,
            cpu.memory(),
            mode,
            u64::from(linear),
            ip,
            Some(to_limit.min(to_wrap)),
        )
    }

    /// Decode the block at `linear` (CS offset `ip`) using the chain for `mode`.
    ///
    /// `source` is detached on return.
    pub fn decode<'m>(
        &self,
        source: &mut ByteSource<'m>,
        memory: &'m dyn GuestMemory,
        mode: CpuMode,
        linear: u64,
        ip: u32,
    ) -> Result<Option<CodeBlock>, DecodeError> {
        self.decode_limited(source, memory, mode, linear, ip, None)
    }

    /// [`decode`](Self::decode) with at most `limit` bytes readable from `linear`.
    pub fn decode_limited<'m>(
        &self,
        source: &mut ByteSource<'m>,
        memory: &'m dyn GuestMemory,
        mode: CpuMode,
        linear: u64,
        ip: u32,
        limit: Option<u64>,
    ) -> Result<Option<CodeBlock>, DecodeError> {
        let chain = self.chains.chain(mode);
        let region = chain.decode_with(source, memory, linear, ip, FetchMode::Region, limit)?;
        if region.is_some() {
            return Ok(region);
        }
        if !self.config.allow_spanning || !straddles_region_end(memory, linear) {
            return Ok(None);
        }

        debug!(linear, ip, ?mode, "retrying as a spanning code block");
        let mut spanning = SpanningCodeBlock::new(Arc::clone(chain), linear, ip);
        if let Some(limit) = limit {
            spanning = spanning.with_limit(limit);
        }
        spanning.decode(source, memory)
    }
}

impl Default for DecodeDispatcher {
    fn default() -> Self {
        Self::new(DispatchConfig::default())
    }
}

/// `true` when an instruction starting at `linear` could run off the end of its region into a
/// mapped neighbour.
fn straddles_region_end(memory: &dyn GuestMemory, linear: u64) -> bool {
    let region = memory.contiguous_len(linear);
    region > 0
        && region < MAX_INSTRUCTION_LEN as u64
        && linear
            .checked_add(region)
            .is_some_and(|next| memory.contiguous_len(next) > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Op;
    use crate::decoder::BasicOp;
    use aero_segment::{SegmentFault, StandardSegment};
    use memory::{DenseMemory, SparseMemory};

    struct Cpu {
        memory: SparseMemory,
        mode: CpuMode,
        cs: Segment,
        ip: u32,
    }

    impl DecodeContext for Cpu {
        fn memory(&self) -> &dyn GuestMemory {
            &self.memory
        }
        fn mode(&self) -> CpuMode {
            self.mode
        }
        fn code_segment(&self) -> &Segment {
            &self.cs
        }
        fn instruction_pointer(&self) -> u32 {
            self.ip
        }
    }

    fn real_mode_cpu(cs: u16, ip: u32, code: &[u8]) -> Cpu {
        let mut memory = SparseMemory::with_chunk_size(0x10_0000, 0x1000).unwrap();
        let cs = Segment::from(StandardSegment::real_mode(cs));
        memory
            .write_from(u64::from(cs.base() + ip), code)
            .unwrap();
        Cpu {
            memory,
            mode: CpuMode::Real,
            cs,
            ip,
        }
    }

    #[test]
    fn default_config() {
        let config = DispatchConfig::default();
        assert_eq!(config.max_block_instructions, 64);
        assert!(config.fast_path);
        assert!(config.allow_spanning);
    }

    #[test]
    fn decodes_at_cs_ip() {
        let cpu = real_mode_cpu(0x07C0, 0, &[0xFA, 0xF4]);
        let block = DecodeDispatcher::default().decode_at(&cpu).unwrap().unwrap();
        assert_eq!(block.linear_address(), 0x7C00);
        assert_eq!(block.ip(), 0);
        assert_eq!(block.mode(), CpuMode::Real);
        assert_eq!(block.ops()[0].op, Op::Basic(BasicOp::Cli));
        assert_eq!(block.ops()[1].op, Op::Basic(BasicOp::Hlt));
    }

    #[test]
    fn ip_past_cs_limit_is_general_protection() {
        let cpu = real_mode_cpu(0, 0x1_0000, &[]);
        let err = DecodeDispatcher::default().decode_at(&cpu).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Fault(SegmentFault::GeneralProtection { code: 0x1_0000 })
        );
    }

    #[test]
    fn falls_back_to_spanning_decode() {
        // mov ax, 0x1234 straddling the 0x1000 chunk boundary.
        let cpu = real_mode_cpu(0, 0x0FFE, &[0xB8, 0x34, 0x12, 0xF4]);
        let block = DecodeDispatcher::default().decode_at(&cpu).unwrap().unwrap();
        assert_eq!(block.linear_address(), 0x0FFE);
        assert_eq!(block.len(), 4);

        let no_spanning = DecodeDispatcher::new(DispatchConfig {
            allow_spanning: false,
            ..DispatchConfig::default()
        });
        assert_eq!(no_spanning.decode_at(&cpu), Ok(None));
    }

    #[test]
    fn fast_path_can_be_disabled() {
        let mem = DenseMemory::from_bytes(&[0x90, 0xC3]);
        let dispatcher = DecodeDispatcher::new(DispatchConfig {
            fast_path: false,
            ..DispatchConfig::default()
        });
        let names: Vec<_> = dispatcher.chains().chain(CpuMode::Real).names().collect();
        assert_eq!(names, ["full"]);

        let mut src = ByteSource::detached();
        let block = dispatcher
            .decode(&mut src, &mem, CpuMode::Real, 0, 0)
            .unwrap()
            .unwrap();
        assert!(matches!(block.ops()[0].op, Op::Full(_)));
    }

    #[test]
    fn with_chain_replaces_one_mode() {
        let chains = ChainSet::from_config(&DispatchConfig::default())
            .with_chain(CpuMode::Protected32, FactoryChain::new());
        assert!(chains.chain(CpuMode::Protected32).is_empty());
        assert_eq!(chains.chain(CpuMode::Real).len(), 2);

        let mem = DenseMemory::from_bytes(&[0x90]);
        let dispatcher = DecodeDispatcher::with_chains(DispatchConfig::default(), chains);
        let mut src = ByteSource::detached();
        assert_eq!(
            dispatcher.decode(&mut src, &mem, CpuMode::Protected32, 0, 0),
            Ok(None)
        );
        assert!(!src.is_bound());
    }

    #[test]
    fn block_stops_at_ip_wrap() {
        // CS=0 has limit 0xFFFF; the bytes at linear 0x10000 are not at CS:0000.
        let mut cpu = real_mode_cpu(0, 0xFFFF, &[0x90, 0x90, 0x90, 0xF4]);
        cpu.memory.write_u8_le(0, 0xCC).unwrap();
        let block = DecodeDispatcher::default().decode_at(&cpu).unwrap().unwrap();
        assert_eq!(block.instruction_count(), 1);
        assert_eq!(block.end_linear_address(), 0x1_0000);
        assert_eq!(block.fallthrough_ip(), 0);

        cpu.ip = 0;
        let block = DecodeDispatcher::default().decode_at(&cpu).unwrap().unwrap();
        assert_eq!(block.ops()[0].op, Op::Basic(BasicOp::Int { vector: 3 }));
    }

    #[test]
    fn first_instruction_past_limit_is_general_protection() {
        // mov ax, 0x1234 at CS:FFFE needs one byte past the limit.
        let cpu = real_mode_cpu(0x1000, 0xFFFE, &[0xB8, 0x34, 0x12]);
        assert_eq!(
            DecodeDispatcher::default().decode_at(&cpu),
            Err(DecodeError::Fault(SegmentFault::GeneralProtection {
                code: 0x1_0000
            }))
        );
    }

    #[test]
    fn dispatcher_is_shared_across_threads() {
        let dispatcher = Arc::new(DecodeDispatcher::default());
        let handles: Vec<_> = [0x90u8, 0xF4]
            .into_iter()
            .map(|byte| {
                let dispatcher = Arc::clone(&dispatcher);
                std::thread::spawn(move || {
                    let mem = DenseMemory::from_bytes(&[byte, 0xF4]);
                    let mut src = ByteSource::detached();
                    dispatcher
                        .decode(&mut src, &mem, CpuMode::Real, 0, 0)
                        .unwrap()
                        .map(|block| block.instruction_count())
                })
            })
            .collect();
        let counts: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(counts, [Some(2), Some(1)]);
    }
}

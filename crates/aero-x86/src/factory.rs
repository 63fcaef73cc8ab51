//! Ordered decoder chains.

use aero_segment::SegmentFault;
use memory::GuestMemory;
use tracing::{debug, trace, warn};

use crate::block::CodeBlock;
use crate::decoder::{BasicDecoder, FullDecoder};
use crate::dispatch::DispatchConfig;
use crate::error::{DecodeAbort, DecodeError};
use crate::mode::CpuMode;
use crate::source::{ByteSource, FetchMode};

/// Something that can turn a bound byte stream into a [`CodeBlock`].
///
/// Returning [`DecodeError::Abort`] means "not mine": the chain moves on to the next factory.
/// Any other error is final and stops the chain.
pub trait CodeBlockFactory: Send + Sync {
    fn name(&self) -> &'static str;

    /// Decode a block whose first instruction sits at `source.start_address()` and has the
    /// CS-relative offset `ip`.
    fn decode(&self, source: &mut ByteSource<'_>, ip: u32) -> Result<CodeBlock, DecodeError>;
}

impl<F: CodeBlockFactory + ?Sized> CodeBlockFactory for Box<F> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn decode(&self, source: &mut ByteSource<'_>, ip: u32) -> Result<CodeBlock, DecodeError> {
        (**self).decode(source, ip)
    }
}

/// Factories tried strictly in order; the first one to produce a block wins.
#[derive(Default)]
pub struct FactoryChain {
    factories: Vec<Box<dyn CodeBlockFactory>>,
}

impl FactoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stock chain for `mode`: the fast-path decoder (when enabled) ahead of the full decoder.
    pub fn for_mode(mode: CpuMode, config: &DispatchConfig) -> Self {
        let max = config.max_block_instructions;
        let mut chain = Self::new();
        if config.fast_path {
            chain.push(BasicDecoder::new(mode, max));
        }
        chain.push(FullDecoder::new(mode, max));
        chain
    }

    pub fn push(&mut self, factory: impl CodeBlockFactory + 'static) {
        self.factories.push(Box::new(factory));
    }

    pub fn with(mut self, factory: impl CodeBlockFactory + 'static) -> Self {
        self.push(factory);
        self
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.iter().map(|f| f.name())
    }

    /// Decode one block at `linear` without reading past the region that contains it.
    ///
    /// Every factory sees `source` freshly bound at `linear`. `Ok(None)` means every factory
    /// aborted. `source` is detached when this returns, whatever the outcome.
    pub fn decode<'m>(
        &self,
        source: &mut ByteSource<'m>,
        memory: &'m dyn GuestMemory,
        linear: u64,
        ip: u32,
    ) -> Result<Option<CodeBlock>, DecodeError> {
        self.decode_with(source, memory, linear, ip, FetchMode::Region, None)
    }

    /// [`decode`](Self::decode) with at most `limit` bytes readable from `linear`.
    ///
    /// If every factory aborts and one of them ran into the limit, the first instruction crosses
    /// the end of the code segment and the result is #GP, with the CS offset of the first byte
    /// past the limit as error code.
    pub fn decode_limited<'m>(
        &self,
        source: &mut ByteSource<'m>,
        memory: &'m dyn GuestMemory,
        linear: u64,
        ip: u32,
        limit: u64,
    ) -> Result<Option<CodeBlock>, DecodeError> {
        self.decode_with(source, memory, linear, ip, FetchMode::Region, Some(limit))
    }

    pub(crate) fn decode_with<'m>(
        &self,
        source: &mut ByteSource<'m>,
        memory: &'m dyn GuestMemory,
        linear: u64,
        ip: u32,
        fetch: FetchMode,
        limit: Option<u64>,
    ) -> Result<Option<CodeBlock>, DecodeError> {
        let mut past_limit = None;
        for factory in &self.factories {
            let mut bound = source.bind_scoped(memory, linear, fetch, limit);
            trace!(
                factory = factory.name(),
                linear,
                ip,
                ?fetch,
                ?limit,
                "trying code block factory"
            );
            match factory.decode(&mut bound, ip) {
                Ok(block) => return Ok(Some(block)),
                Err(DecodeError::Abort(abort)) => {
                    trace!(factory = factory.name(), linear, %abort, "factory aborted");
                    if let DecodeAbort::SegmentLimit { address } = abort {
                        past_limit.get_or_insert(address);
                    }
                }
                Err(err) => {
                    warn!(factory = factory.name(), linear, error = %err, "code block decode failed");
                    return Err(err);
                }
            }
        }
        if let Some(address) = past_limit {
            let code = ip.wrapping_add(address.wrapping_sub(linear) as u32);
            debug!(linear, ip, code, "first instruction crosses the code segment limit");
            return Err(SegmentFault::GeneralProtection { code }.into());
        }
        debug!(linear, ip, ?fetch, "no factory produced a code block");
        Ok(None)
    }
}

impl core::fmt::Debug for FactoryChain {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

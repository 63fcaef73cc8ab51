//! x86 instruction fetch and decode dispatch.
//!
//! A [`ByteSource`] streams instruction bytes out of guest memory. A [`FactoryChain`] offers the
//! bytes to each [`CodeBlockFactory`] in turn and keeps the first [`CodeBlock`] produced; a
//! [`DecodeAbort`] from a factory moves on to the next one, any other error stops the chain. The
//! [`DecodeDispatcher`] picks the chain for the current [`CpuMode`] and retries with a
//! [`SpanningCodeBlock`] when the first instruction runs off the end of its memory region.

mod block;
pub mod decoder;
mod dispatch;
mod error;
mod factory;
mod mode;
mod source;
mod spanning;

pub use crate::block::{CodeBlock, DecodedOp, Op};
pub use crate::decoder::{BasicDecoder, FullDecoder, MAX_INSTRUCTION_LEN};
pub use crate::dispatch::{ChainSet, DecodeContext, DecodeDispatcher, DispatchConfig};
pub use crate::error::{DecodeAbort, DecodeError};
pub use crate::factory::{CodeBlockFactory, FactoryChain};
pub use crate::mode::CpuMode;
pub use crate::source::{BoundSource, ByteSource, FetchMode};
pub use crate::spanning::SpanningCodeBlock;

pub use iced_x86::{Code, FlowControl, Instruction};

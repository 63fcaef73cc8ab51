//! Stock [`CodeBlockFactory`](crate::CodeBlockFactory) implementations.

pub(crate) mod basic;
mod full;

pub use basic::{AluOp, BasicDecoder, BasicOp, Reg, Width};
pub use full::FullDecoder;

use crate::block::{CodeBlock, DecodedOp};
use crate::error::{DecodeAbort, DecodeError};
use crate::mode::CpuMode;
use crate::source::ByteSource;

/// Architectural upper bound on instruction length.
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// Decode instructions back to back until one ends the block.
///
/// `decode_one` returns the decoded instruction and whether it terminates the block. An abort on
/// the first instruction aborts the block; an abort on a later one ends the block just before
/// that instruction, leaving it for the next block. Non-abort errors always propagate.
pub(crate) fn decode_block<F>(
    source: &mut ByteSource<'_>,
    ip: u32,
    mode: CpuMode,
    max_instructions: usize,
    mut decode_one: F,
) -> Result<CodeBlock, DecodeError>
where
    F: FnMut(&mut ByteSource<'_>, u32) -> Result<(DecodedOp, bool), DecodeError>,
{
    let linear = source.start_address();
    let max_instructions = max_instructions.max(1);
    let mut ops = Vec::new();
    let mut next_ip = ip & mode.ip_mask();

    loop {
        let mark = source.consumed();
        match decode_one(&mut *source, next_ip) {
            Ok((op, terminator)) => {
                next_ip = next_ip.wrapping_add(u32::from(op.len)) & mode.ip_mask();
                ops.push(op);
                if terminator || ops.len() >= max_instructions {
                    break;
                }
            }
            Err(DecodeError::Abort(_)) if !ops.is_empty() => {
                source.rewind_to(mark);
                break;
            }
            Err(err) => return Err(err),
        }
    }

    // The loop only exits with at least one instruction decoded.
    CodeBlock::new(linear, mode, ops).ok_or(DecodeAbort::InvalidInstruction.into())
}

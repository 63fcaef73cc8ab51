//! General decoder backed by `iced-x86`, covering the whole 16/32-bit instruction set.

use iced_x86::{Decoder, DecoderError, DecoderOptions, FlowControl, Instruction};

use crate::block::{CodeBlock, DecodedOp, Op};
use crate::error::{DecodeAbort, DecodeError};
use crate::factory::CodeBlockFactory;
use crate::mode::CpuMode;
use crate::source::ByteSource;

use super::{decode_block, MAX_INSTRUCTION_LEN};

#[derive(Debug, Clone, Copy)]
pub struct FullDecoder {
    mode: CpuMode,
    max_block_instructions: usize,
}

impl FullDecoder {
    pub fn new(mode: CpuMode, max_block_instructions: usize) -> Self {
        Self {
            mode,
            max_block_instructions,
        }
    }

    pub fn mode(&self) -> CpuMode {
        self.mode
    }

    /// Decode one instruction at the cursor, whose CS offset is `ip`.
    pub fn decode_instruction(
        &self,
        source: &mut ByteSource<'_>,
        ip: u32,
    ) -> Result<(DecodedOp, bool), DecodeError> {
        let mut window = [0u8; MAX_INSTRUCTION_LEN];
        let available = source.peek_into(&mut window)?;

        let mut decoder = Decoder::with_ip(
            self.mode.bitness(),
            &window[..available],
            u64::from(ip),
            DecoderOptions::NONE,
        );
        let instr: Instruction = decoder.decode();
        if instr.is_invalid() {
            if matches!(decoder.last_error(), DecoderError::NoMoreBytes) {
                // Report whichever boundary cut the window short.
                source.peek_byte(available as u64)?;
                return Err(DecodeAbort::TooLong.into());
            }
            return Err(DecodeAbort::InvalidInstruction.into());
        }

        source.skip(instr.len())?;
        let ends_block = instr.flow_control() != FlowControl::Next;
        Ok((
            DecodedOp {
                ip,
                len: instr.len() as u8,
                op: Op::Full(instr),
            },
            ends_block,
        ))
    }
}

impl CodeBlockFactory for FullDecoder {
    fn name(&self) -> &'static str {
        "full"
    }

    fn decode(&self, source: &mut ByteSource<'_>, ip: u32) -> Result<CodeBlock, DecodeError> {
        decode_block(
            source,
            ip,
            self.mode,
            self.max_block_instructions,
            |source, ip| self.decode_instruction(source, ip),
        )
    }
}

//! Fast-path decoder for the handful of encodings that dominate real-mode and early boot code.
//!
//! Anything outside the subset aborts with [`DecodeAbort::UnsupportedOpcode`] so the next decoder
//! in the chain gets a chance.

use core::fmt;

use crate::block::{CodeBlock, DecodedOp, Op};
use crate::error::{DecodeAbort, DecodeError};
use crate::factory::CodeBlockFactory;
use crate::mode::CpuMode;
use crate::source::ByteSource;

use super::{decode_block, MAX_INSTRUCTION_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    W8,
    W16,
    W32,
}

impl Width {
    pub const fn bytes(self) -> usize {
        match self {
            Width::W8 => 1,
            Width::W16 => 2,
            Width::W32 => 4,
        }
    }

    pub const fn mask(self) -> u32 {
        match self {
            Width::W8 => 0xFF,
            Width::W16 => 0xFFFF,
            Width::W32 => 0xFFFF_FFFF,
        }
    }
}

/// A general purpose register operand. For [`Width::W8`], codes 4..=7 name AH, CH, DH and BH.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg {
    pub code: u8,
    pub width: Width,
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const R8: [&str; 8] = ["al", "cl", "dl", "bl", "ah", "ch", "dh", "bh"];
        const R16: [&str; 8] = ["ax", "cx", "dx", "bx", "sp", "bp", "si", "di"];
        let code = usize::from(self.code & 0x7);
        match self.width {
            Width::W8 => f.write_str(R8[code]),
            Width::W16 => f.write_str(R16[code]),
            Width::W32 => write!(f, "e{}", R16[code]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AluOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    /// From bits 3..6 of a classic `00..3F` ALU opcode.
    fn from_opcode(opcode: u8) -> Self {
        match (opcode >> 3) & 0x7 {
            0 => AluOp::Add,
            1 => AluOp::Or,
            2 => AluOp::Adc,
            3 => AluOp::Sbb,
            4 => AluOp::And,
            5 => AluOp::Sub,
            6 => AluOp::Xor,
            _ => AluOp::Cmp,
        }
    }

    fn mnemonic(self) -> &'static str {
        match self {
            AluOp::Add => "add",
            AluOp::Or => "or",
            AluOp::Adc => "adc",
            AluOp::Sbb => "sbb",
            AluOp::And => "and",
            AluOp::Sub => "sub",
            AluOp::Xor => "xor",
            AluOp::Cmp => "cmp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BasicOp {
    Nop,
    Hlt,
    Cli,
    Sti,
    Cld,
    Std,
    Clc,
    Stc,
    Cmc,
    Inc { reg: Reg },
    Dec { reg: Reg },
    Push { reg: Reg },
    Pop { reg: Reg },
    MovImm { dst: Reg, imm: u32 },
    Mov { dst: Reg, src: Reg },
    Alu { op: AluOp, dst: Reg, src: Reg },
    /// Branch targets are CS offsets, already truncated to the operand size.
    Jmp { target: u32 },
    Jcc { cond: u8, target: u32 },
    Call { target: u32 },
    Ret,
    Int { vector: u8 },
}

impl BasicOp {
    /// `true` for instructions after which decode cannot continue linearly.
    pub fn ends_block(&self) -> bool {
        matches!(
            self,
            BasicOp::Hlt
                | BasicOp::Jmp { .. }
                | BasicOp::Jcc { .. }
                | BasicOp::Call { .. }
                | BasicOp::Ret
                | BasicOp::Int { .. }
        )
    }
}

impl fmt::Display for BasicOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            BasicOp::Nop => f.write_str("nop"),
            BasicOp::Hlt => f.write_str("hlt"),
            BasicOp::Cli => f.write_str("cli"),
            BasicOp::Sti => f.write_str("sti"),
            BasicOp::Cld => f.write_str("cld"),
            BasicOp::Std => f.write_str("std"),
            BasicOp::Clc => f.write_str("clc"),
            BasicOp::Stc => f.write_str("stc"),
            BasicOp::Cmc => f.write_str("cmc"),
            BasicOp::Inc { reg } => write!(f, "inc {reg}"),
            BasicOp::Dec { reg } => write!(f, "dec {reg}"),
            BasicOp::Push { reg } => write!(f, "push {reg}"),
            BasicOp::Pop { reg } => write!(f, "pop {reg}"),
            BasicOp::MovImm { dst, imm } => write!(f, "mov {dst}, {imm:#x}"),
            BasicOp::Mov { dst, src } => write!(f, "mov {dst}, {src}"),
            BasicOp::Alu { op, dst, src } => write!(f, "{} {dst}, {src}", op.mnemonic()),
            BasicOp::Jmp { target } => write!(f, "jmp {target:#x}"),
            BasicOp::Jcc { cond, target } => {
                write!(f, "j{} {target:#x}", CONDITIONS[usize::from(cond & 0xF)])
            }
            BasicOp::Call { target } => write!(f, "call {target:#x}"),
            BasicOp::Ret => f.write_str("ret"),
            BasicOp::Int { vector } => write!(f, "int {vector:#x}"),
        }
    }
}

const CONDITIONS: [&str; 16] = [
    "o", "no", "b", "ae", "e", "ne", "be", "a", "s", "ns", "p", "np", "l", "ge", "le", "g",
];

fn op_width(bitness: u32, operand_override: bool) -> Width {
    match (bitness, operand_override) {
        (16, false) | (32, true) => Width::W16,
        _ => Width::W32,
    }
}

fn unsupported(opcode: u8) -> DecodeError {
    DecodeAbort::UnsupportedOpcode { opcode }.into()
}

/// Register-direct ModRM operands as `(dst, src)`. Memory forms are outside the subset.
fn reg_reg(
    source: &mut ByteSource<'_>,
    opcode: u8,
    width: Width,
) -> Result<(Reg, Reg), DecodeError> {
    let modrm = source.next_byte()?;
    if modrm >> 6 != 0b11 {
        return Err(unsupported(opcode));
    }
    let width = if opcode & 1 == 0 { Width::W8 } else { width };
    let reg = Reg {
        code: (modrm >> 3) & 0x7,
        width,
    };
    let rm = Reg {
        code: modrm & 0x7,
        width,
    };
    // Direction bit set: reg is the destination.
    Ok(if opcode & 0x2 != 0 { (reg, rm) } else { (rm, reg) })
}

#[derive(Debug, Clone, Copy)]
pub struct BasicDecoder {
    mode: CpuMode,
    max_block_instructions: usize,
}

impl BasicDecoder {
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
    ) -> Result<DecodedOp, DecodeError> {
        let start = source.consumed();
        let bitness = self.mode.bitness();

        let mut operand_override = false;
        let opcode = loop {
            let b = source.next_byte()?;
            if b != 0x66 {
                break b;
            }
            operand_override = true;
            if source.consumed() - start >= MAX_INSTRUCTION_LEN as u64 {
                return Err(DecodeAbort::TooLong.into());
            }
        };
        let width = op_width(bitness, operand_override);

        let op = match opcode {
            0x90 => BasicOp::Nop,
            0xF4 => BasicOp::Hlt,
            0xFA => BasicOp::Cli,
            0xFB => BasicOp::Sti,
            0xFC => BasicOp::Cld,
            0xFD => BasicOp::Std,
            0xF8 => BasicOp::Clc,
            0xF9 => BasicOp::Stc,
            0xF5 => BasicOp::Cmc,
            0x40..=0x47 => BasicOp::Inc {
                reg: Reg { code: opcode - 0x40, width },
            },
            0x48..=0x4F => BasicOp::Dec {
                reg: Reg { code: opcode - 0x48, width },
            },
            0x50..=0x57 => BasicOp::Push {
                reg: Reg { code: opcode - 0x50, width },
            },
            0x58..=0x5F => BasicOp::Pop {
                reg: Reg { code: opcode - 0x58, width },
            },
            0xB0..=0xB7 => BasicOp::MovImm {
                dst: Reg {
                    code: opcode - 0xB0,
                    width: Width::W8,
                },
                imm: u32::from(source.next_byte()?),
            },
            0xB8..=0xBF => BasicOp::MovImm {
                dst: Reg { code: opcode - 0xB8, width },
                imm: source.read_le(width.bytes())? as u32,
            },
            0x88..=0x8B => {
                let (dst, src) = reg_reg(source, opcode, width)?;
                BasicOp::Mov { dst, src }
            }
            0x00..=0x3F if opcode & 0x7 <= 3 => {
                let (dst, src) = reg_reg(source, opcode, width)?;
                BasicOp::Alu {
                    op: AluOp::from_opcode(opcode),
                    dst,
                    src,
                }
            }
            0xC3 => BasicOp::Ret,
            0xCC => BasicOp::Int { vector: 3 },
            0xCD => BasicOp::Int {
                vector: source.next_byte()?,
            },
            0xEB | 0x70..=0x7F => {
                let rel = source.next_byte()? as i8 as i32 as u32;
                let target = self.branch_target(source, start, ip, rel, width);
                if opcode == 0xEB {
                    BasicOp::Jmp { target }
                } else {
                    BasicOp::Jcc {
                        cond: opcode & 0xF,
                        target,
                    }
                }
            }
            0xE8 | 0xE9 => {
                let rel = read_rel(source, width)?;
                let target = self.branch_target(source, start, ip, rel, width);
                if opcode == 0xE8 {
                    BasicOp::Call { target }
                } else {
                    BasicOp::Jmp { target }
                }
            }
            0x0F => match source.next_byte()? {
                op2 @ 0x80..=0x8F => {
                    let rel = read_rel(source, width)?;
                    BasicOp::Jcc {
                        cond: op2 & 0xF,
                        target: self.branch_target(source, start, ip, rel, width),
                    }
                }
                _ => return Err(unsupported(opcode)),
            },
            _ => return Err(unsupported(opcode)),
        };

        let len = source.consumed() - start;
        if len > MAX_INSTRUCTION_LEN as u64 {
            return Err(DecodeAbort::TooLong.into());
        }
        Ok(DecodedOp {
            ip,
            len: len as u8,
            op: Op::Basic(op),
        })
    }

    fn branch_target(
        &self,
        source: &ByteSource<'_>,
        start: u64,
        ip: u32,
        rel: u32,
        width: Width,
    ) -> u32 {
        let len = (source.consumed() - start) as u32;
        ip.wrapping_add(len).wrapping_add(rel) & width.mask() & self.mode.ip_mask()
    }
}

/// Sign-extended `rel16`/`rel32` displacement.
fn read_rel(source: &mut ByteSource<'_>, width: Width) -> Result<u32, DecodeError> {
    let raw = source.read_le(width.bytes())?;
    Ok(match width {
        Width::W16 => raw as u16 as i16 as i32 as u32,
        _ => raw as u32,
    })
}

impl CodeBlockFactory for BasicDecoder {
    fn name(&self) -> &'static str {
        "basic"
    }

    fn decode(&self, source: &mut ByteSource<'_>, ip: u32) -> Result<CodeBlock, DecodeError> {
        decode_block(
            source,
            ip,
            self.mode,
            self.max_block_instructions,
            |source, ip| {
                let op = self.decode_instruction(source, ip)?;
                let ends = matches!(op.op, Op::Basic(b) if b.ends_block());
                Ok((op, ends))
            },
        )
    }
}

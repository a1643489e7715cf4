//! Bit-level layout of the 64-bit instruction word, shared by the CPU's
//! decoder and the assembler's encoder.

use std::fmt::{self, Display, Formatter};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use strum_macros::{Display as StrumDisplay, EnumString, IntoStaticStr};
use thiserror::Error;

use crate::regs::{operand_name, ABSOLUTE_SENTINEL};
use crate::Trap;

/// Every mnemonic with its 6-bit opcode.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    TryFromPrimitive,
    IntoPrimitive,
    StrumDisplay,
    EnumString,
    IntoStaticStr,
)]
#[repr(u8)]
#[strum(ascii_case_insensitive, serialize_all = "UPPERCASE")]
pub enum Opcode {
    Add = 0x01,
    Sub = 0x02,
    And = 0x03,
    Or = 0x04,
    Xor = 0x05,
    Lsl = 0x06,
    Lsr = 0x07,
    Ldr = 0x08,
    Str = 0x09,
    Jmp = 0x0A,
    Jal = 0x0B,
    Beq = 0x0C,
    Bne = 0x0D,
    Mov = 0x0E,
    Cmp = 0x0F,
    Push = 0x10,
    Pop = 0x11,
    Call = 0x12,
    Ret = 0x13,
    Iret = 0x14,
    Nop = 0x15,
    Hlt = 0x16,
    Mul = 0x17,
    Div = 0x18,
    Mod = 0x19,
    Not = 0x1A,
    Neg = 0x1B,
    Inc = 0x1C,
    Dec = 0x1D,
    Asl = 0x1E,
    Asr = 0x1F,
    Swi = 0x20,
    Sext = 0x21,
    Zext = 0x22,
    Mfs = 0x23,
    Mts = 0x24,
    Out = 0x25,
    In = 0x26,
}

/// The three instruction shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    R,
    I,
    J,
}

impl Opcode {
    pub fn class(self) -> Class {
        use Opcode::*;
        match self {
            Add | Sub | And | Or | Xor | Lsl | Lsr | Mul | Div | Mod | Not | Neg | Inc | Dec
            | Asl | Asr => Class::R,
            Ldr | Str | Beq | Bne | Mov | Cmp | Push | Pop | Swi | Sext | Zext | Mfs | Mts
            | Out | In => Class::I,
            Jmp | Jal | Call | Ret | Iret | Nop | Hlt => Class::J,
        }
    }
}

/// A decoded instruction.
///
/// R-type register fields are 5 bits (general registers only). I-type
/// register fields are 6 bits so they cover the full operand space: the
/// special registers addressed by MFS/MTS and the LDR/STR absolute
/// sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    R { op: Opcode, rd: u8, rs1: u8, rs2: u8, shamt: u8, func: u8 },
    I { op: Opcode, rd: u8, rs1: u8, imm: u32 },
    J { op: Opcode, addr: u32 },
}

// Field positions within the 64-bit word (bit 63 is the MSB).
const OPCODE_SHIFT: u32 = 58;

const R_RD_SHIFT: u32 = 53;
const R_RS1_SHIFT: u32 = 48;
const R_RS2_SHIFT: u32 = 43;
const R_SHAMT_SHIFT: u32 = 37;
const R_FUNC_SHIFT: u32 = 29;

const I_RD_SHIFT: u32 = 52;
const I_RS1_SHIFT: u32 = 46;
const I_IMM_SHIFT: u32 = 14;

const J_ADDR_SHIFT: u32 = 26;

const REG5_MASK: u64 = 0x1F;
const REG6_MASK: u64 = 0x3F;

/// Malformed fields handed to [`encode`]. These are host-tier errors: the
/// assembler reports them textually, they are never delivered to a guest.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("{field} value {value:#x} does not fit in {bits} bits")]
    FieldRange { field: &'static str, value: u64, bits: u32 },

    #[error("{op} is not {class:?}-shaped")]
    ShapeMismatch { op: Opcode, class: Class },
}

fn check_field(field: &'static str, value: u64, bits: u32) -> Result<u64, EncodeError> {
    if value >> bits != 0 {
        return Err(EncodeError::FieldRange { field, value, bits });
    }
    Ok(value)
}

/// Classify and decode a 64-bit word.
pub fn decode(word: u64) -> Result<Instruction, Trap> {
    let code = ((word >> OPCODE_SHIFT) & 0x3F) as u8;
    let op = Opcode::try_from(code).map_err(|_| Trap::InvalidOpcode(word))?;
    Ok(match op.class() {
        Class::R => Instruction::R {
            op,
            rd: ((word >> R_RD_SHIFT) & REG5_MASK) as u8,
            rs1: ((word >> R_RS1_SHIFT) & REG5_MASK) as u8,
            rs2: ((word >> R_RS2_SHIFT) & REG5_MASK) as u8,
            shamt: ((word >> R_SHAMT_SHIFT) & 0x3F) as u8,
            func: ((word >> R_FUNC_SHIFT) & 0xFF) as u8,
        },
        Class::I => Instruction::I {
            op,
            rd: ((word >> I_RD_SHIFT) & REG6_MASK) as u8,
            rs1: ((word >> I_RS1_SHIFT) & REG6_MASK) as u8,
            imm: ((word >> I_IMM_SHIFT) & 0xFFFF_FFFF) as u32,
        },
        Class::J => Instruction::J {
            op,
            addr: ((word >> J_ADDR_SHIFT) & 0xFFFF_FFFF) as u32,
        },
    })
}

/// Encode an instruction into its 64-bit word. Out-of-range fields are
/// rejected, never truncated.
pub fn encode(instr: &Instruction) -> Result<u64, EncodeError> {
    match *instr {
        Instruction::R { op, rd, rs1, rs2, shamt, func } => {
            if op.class() != Class::R {
                return Err(EncodeError::ShapeMismatch { op, class: Class::R });
            }
            Ok((u8::from(op) as u64) << OPCODE_SHIFT
                | check_field("rd", rd as u64, 5)? << R_RD_SHIFT
                | check_field("rs1", rs1 as u64, 5)? << R_RS1_SHIFT
                | check_field("rs2", rs2 as u64, 5)? << R_RS2_SHIFT
                | check_field("shamt", shamt as u64, 6)? << R_SHAMT_SHIFT
                | (func as u64) << R_FUNC_SHIFT)
        }
        Instruction::I { op, rd, rs1, imm } => {
            if op.class() != Class::I {
                return Err(EncodeError::ShapeMismatch { op, class: Class::I });
            }
            Ok((u8::from(op) as u64) << OPCODE_SHIFT
                | check_field("rd", rd as u64, 6)? << I_RD_SHIFT
                | check_field("rs1", rs1 as u64, 6)? << I_RS1_SHIFT
                | (imm as u64) << I_IMM_SHIFT)
        }
        Instruction::J { op, addr } => {
            if op.class() != Class::J {
                return Err(EncodeError::ShapeMismatch { op, class: Class::J });
            }
            Ok((u8::from(op) as u64) << OPCODE_SHIFT | (addr as u64) << J_ADDR_SHIFT)
        }
    }
}

impl Instruction {
    pub fn opcode(&self) -> Opcode {
        match *self {
            Instruction::R { op, .. } | Instruction::I { op, .. } | Instruction::J { op, .. } => op,
        }
    }
}

/// Canonical assembly rendering, accepted back by the assembler.
impl Display for Instruction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        use Opcode::*;
        match *self {
            Instruction::R { op, rd, rs1, shamt, .. } if matches!(op, Lsl | Lsr | Asl | Asr) => {
                write!(f, "{} {}, {}, {}", op, operand_name(rd), operand_name(rs1), shamt)
            }
            Instruction::R { op, rd, rs1, .. } if matches!(op, Not | Neg) => {
                write!(f, "{} {}, {}", op, operand_name(rd), operand_name(rs1))
            }
            Instruction::R { op, rd, .. } if matches!(op, Inc | Dec) => {
                write!(f, "{} {}", op, operand_name(rd))
            }
            Instruction::R { op, rd, rs1, rs2, .. } => {
                write!(
                    f,
                    "{} {}, {}, {}",
                    op,
                    operand_name(rd),
                    operand_name(rs1),
                    operand_name(rs2)
                )
            }
            Instruction::I { op, rd, rs1, imm } => match op {
                Ldr | Str if rs1 == ABSOLUTE_SENTINEL => {
                    write!(f, "{} {}, {:#x}", op, operand_name(rd), imm)
                }
                Ldr | Str => {
                    write!(f, "{} {}, {}, {:#x}", op, operand_name(rd), operand_name(rs1), imm)
                }
                Beq | Bne => write!(
                    f,
                    "{} {}, {}, {}",
                    op,
                    operand_name(rd),
                    operand_name(rs1),
                    imm as i32
                ),
                Push | Pop => write!(f, "{} {}", op, operand_name(rd)),
                Swi => write!(f, "{} {}", op, imm),
                _ => write!(f, "{} {}, {}", op, operand_name(rd), operand_name(rs1)),
            },
            Instruction::J { op, addr } => match op {
                Ret | Iret | Nop | Hlt => write!(f, "{}", op),
                _ => write!(f, "{} {:#x}", op, addr),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn r_type_field_positions() {
        // ADD R5, R6, R7
        let instr = Instruction::R { op: Opcode::Add, rd: 5, rs1: 6, rs2: 7, shamt: 0, func: 0 };
        let word = encode(&instr).unwrap();
        assert_eq!(word, (0x01 << 58) | (5 << 53) | (6 << 48) | (7 << 43));
        assert_eq!(decode(word).unwrap(), instr);
    }

    #[test]
    fn i_type_round_trip_covers_special_operands() {
        // MFS R3, MSR: rs1 carries a special-register code.
        let instr = Instruction::I { op: Opcode::Mfs, rd: 3, rs1: 0x2C, imm: 0 };
        let word = encode(&instr).unwrap();
        assert_eq!(decode(word).unwrap(), instr);

        // Absolute LDR keeps the 0x2D sentinel through a round trip.
        let ldr = Instruction::I { op: Opcode::Ldr, rd: 1, rs1: ABSOLUTE_SENTINEL, imm: 0x40 };
        let word = encode(&ldr).unwrap();
        match decode(word).unwrap() {
            Instruction::I { rs1, imm, .. } => {
                assert_eq!(rs1, ABSOLUTE_SENTINEL);
                assert_eq!(imm, 0x40);
            }
            other => panic!("expected I-type, got {:?}", other),
        }
    }

    #[test]
    fn j_type_round_trip() {
        let instr = Instruction::J { op: Opcode::Jal, addr: 0xDEAD_BEEF };
        let word = encode(&instr).unwrap();
        assert_eq!(word, (0x0B << 58) | (0xDEAD_BEEF_u64 << 26));
        assert_eq!(decode(word).unwrap(), instr);
    }

    #[test]
    fn every_opcode_round_trips() {
        for code in 0x01..=0x26_u8 {
            let op = Opcode::try_from(code).unwrap();
            let instr = match op.class() {
                Class::R => Instruction::R { op, rd: 1, rs1: 2, rs2: 3, shamt: 4, func: 0 },
                Class::I => Instruction::I { op, rd: 1, rs1: 2, imm: 0x8000_0001 },
                Class::J => Instruction::J { op, addr: 0x1234_5678 },
            };
            let word = encode(&instr).unwrap();
            assert_eq!(decode(word).unwrap(), instr, "opcode {:#04x}", code);
        }
    }

    #[test]
    fn unknown_opcodes_fail_to_decode() {
        for code in [0x00_u64, 0x27, 0x3F] {
            let word = code << OPCODE_SHIFT;
            assert!(matches!(decode(word), Err(Trap::InvalidOpcode(_))), "{:#04x}", code);
        }
    }

    #[test]
    fn encode_rejects_out_of_range_fields() {
        let instr = Instruction::R { op: Opcode::Add, rd: 32, rs1: 0, rs2: 0, shamt: 0, func: 0 };
        assert_eq!(
            encode(&instr),
            Err(EncodeError::FieldRange { field: "rd", value: 32, bits: 5 })
        );

        let instr = Instruction::I { op: Opcode::Mov, rd: 0x40, rs1: 0, imm: 0 };
        assert!(matches!(encode(&instr), Err(EncodeError::FieldRange { field: "rd", .. })));
    }

    #[test]
    fn encode_rejects_shape_mismatch() {
        let instr = Instruction::J { op: Opcode::Add, addr: 0 };
        assert!(matches!(encode(&instr), Err(EncodeError::ShapeMismatch { .. })));
    }

    #[test]
    fn display_is_canonical_assembly() {
        let add = Instruction::R { op: Opcode::Add, rd: 5, rs1: 6, rs2: 7, shamt: 0, func: 0 };
        assert_eq!(add.to_string(), "ADD R5, R6, R7");

        let ldr = Instruction::I { op: Opcode::Ldr, rd: 1, rs1: ABSOLUTE_SENTINEL, imm: 0x40 };
        assert_eq!(ldr.to_string(), "LDR R1, 0x40");

        let beq = Instruction::I { op: Opcode::Beq, rd: 1, rs1: 2, imm: (-16_i32) as u32 };
        assert_eq!(beq.to_string(), "BEQ R1, R2, -16");

        let mts = Instruction::I { op: Opcode::Mts, rd: 0x29, rs1: 4, imm: 0 };
        assert_eq!(mts.to_string(), "MTS TPDR, R4");

        let hlt = Instruction::J { op: Opcode::Hlt, addr: 0 };
        assert_eq!(hlt.to_string(), "HLT");
    }
}

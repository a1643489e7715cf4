//! Line-oriented assembler for the XR-32 mnemonic language, and the
//! matching disassembly printer.
//!
//! A line is one instruction: mnemonic first, operands separated by
//! whitespace (commas are treated as whitespace), `;` starts a comment.
//! Each line assembles to exactly one 64-bit word or fails with a textual
//! error; nothing is partially emitted.

use std::str::FromStr;

use thiserror::Error;

use crate::isa::{self, EncodeError, Instruction, Opcode};
use crate::regs::{self, SPECIAL_BASE, ABSOLUTE_SENTINEL};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AsmError {
    #[error("empty line")]
    EmptyLine,

    #[error("unknown mnemonic `{0}`")]
    UnknownMnemonic(String),

    #[error("`{mnemonic}` expects {expected} operand(s), got {got}")]
    WrongArity { mnemonic: &'static str, expected: &'static str, got: usize },

    #[error("invalid register name `{0}`")]
    InvalidRegister(String),

    #[error("`{0}` is not a general register")]
    NotGeneral(String),

    #[error("`{0}` is not a special register")]
    NotSpecial(String),

    #[error("invalid immediate `{0}`")]
    InvalidImmediate(String),

    #[error("immediate {0} does not fit in 32 bits")]
    ImmediateRange(i64),

    #[error("shift amount {0} does not fit in 6 bits")]
    ShiftRange(i64),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("line {line}: {source}")]
    AtLine { line: usize, source: Box<AsmError> },
}

/// Assemble one source line into its 64-bit word.
pub fn assemble_line(text: &str) -> Result<u64, AsmError> {
    Ok(isa::encode(&parse_line(text)?)?)
}

/// Assemble a whole source text. Blank and comment-only lines are skipped;
/// errors carry the 1-based line number.
pub fn assemble(source: &str) -> Result<Vec<u64>, AsmError> {
    let mut words = Vec::new();
    for (idx, line) in source.lines().enumerate() {
        let code = strip_comment(line);
        if code.trim().is_empty() {
            continue;
        }
        let word = assemble_line(code)
            .map_err(|e| AsmError::AtLine { line: idx + 1, source: Box::new(e) })?;
        words.push(word);
    }
    Ok(words)
}

/// Render an image as assembly text, one line per word. Words that decode
/// to nothing are kept as data comments so the listing stays aligned with
/// the image.
pub fn disassemble(words: &[u64]) -> String {
    let mut out = String::new();
    for &word in words {
        match isa::decode(word) {
            Ok(instr) => out.push_str(&instr.to_string()),
            Err(_) => out.push_str(&format!("; .word {:#018x}", word)),
        }
        out.push('\n');
    }
    out
}

fn strip_comment(line: &str) -> &str {
    line.split(';').next().unwrap_or("")
}

fn tokenize(line: &str) -> Vec<&str> {
    line.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty())
        .collect()
}

fn parse_line(text: &str) -> Result<Instruction, AsmError> {
    let tokens = tokenize(strip_comment(text));
    let Some((&mnemonic, args)) = tokens.split_first() else {
        return Err(AsmError::EmptyLine);
    };
    let op =
        Opcode::from_str(mnemonic).map_err(|_| AsmError::UnknownMnemonic(mnemonic.to_string()))?;

    use Opcode::*;
    match op {
        Add | Sub | And | Or | Xor | Mul | Div | Mod => {
            let [rd, rs1, rs2] = expect::<3>(op, "3", args)?;
            Ok(Instruction::R {
                op,
                rd: parse_general(rd)?,
                rs1: parse_general(rs1)?,
                rs2: parse_general(rs2)?,
                shamt: 0,
                func: 0,
            })
        }
        Lsl | Lsr | Asl | Asr => {
            let [rd, rs1, amount] = expect::<3>(op, "3", args)?;
            let amount = parse_immediate(amount)?;
            if !(0..64).contains(&amount) {
                return Err(AsmError::ShiftRange(amount));
            }
            Ok(Instruction::R {
                op,
                rd: parse_general(rd)?,
                rs1: parse_general(rs1)?,
                rs2: 0,
                shamt: amount as u8,
                func: 0,
            })
        }
        Not | Neg => {
            let [rd, rs1] = expect::<2>(op, "2", args)?;
            Ok(Instruction::R {
                op,
                rd: parse_general(rd)?,
                rs1: parse_general(rs1)?,
                rs2: 0,
                shamt: 0,
                func: 0,
            })
        }
        Inc | Dec => {
            let [rd] = expect::<1>(op, "1", args)?;
            Ok(Instruction::R { op, rd: parse_general(rd)?, rs1: 0, rs2: 0, shamt: 0, func: 0 })
        }
        Ldr | Str => match args {
            // Absolute form: the address is the immediate.
            [rd, imm] => Ok(Instruction::I {
                op,
                rd: parse_general(rd)?,
                rs1: ABSOLUTE_SENTINEL,
                imm: parse_imm32(imm)?,
            }),
            [rd, rs1, imm] => Ok(Instruction::I {
                op,
                rd: parse_general(rd)?,
                rs1: parse_general(rs1)?,
                imm: parse_imm32(imm)?,
            }),
            _ => Err(AsmError::WrongArity {
                mnemonic: op.into(),
                expected: "2 or 3",
                got: args.len(),
            }),
        },
        Beq | Bne => {
            let [rd, rs1, imm] = expect::<3>(op, "3", args)?;
            Ok(Instruction::I {
                op,
                rd: parse_general(rd)?,
                rs1: parse_general(rs1)?,
                imm: parse_imm32(imm)?,
            })
        }
        Mov | Cmp | Sext | Zext => {
            let [rd, rs1] = expect::<2>(op, "2", args)?;
            Ok(Instruction::I {
                op,
                rd: parse_general(rd)?,
                rs1: parse_general(rs1)?,
                imm: 0,
            })
        }
        Mfs => {
            let [rd, rs1] = expect::<2>(op, "2", args)?;
            Ok(Instruction::I {
                op,
                rd: parse_general(rd)?,
                rs1: parse_special(rs1)?,
                imm: 0,
            })
        }
        Mts => {
            let [rd, rs1] = expect::<2>(op, "2", args)?;
            Ok(Instruction::I {
                op,
                rd: parse_special(rd)?,
                rs1: parse_general(rs1)?,
                imm: 0,
            })
        }
        Out | In => {
            // The first operand names the port, the second the data
            // register.
            let [port, rs1] = expect::<2>(op, "2", args)?;
            Ok(Instruction::I {
                op,
                rd: parse_register(port)?,
                rs1: parse_general(rs1)?,
                imm: 0,
            })
        }
        Push | Pop => {
            let [rd] = expect::<1>(op, "1", args)?;
            Ok(Instruction::I { op, rd: parse_general(rd)?, rs1: 0, imm: 0 })
        }
        Swi => {
            let [imm] = expect::<1>(op, "1", args)?;
            Ok(Instruction::I { op, rd: 0, rs1: 0, imm: parse_imm32(imm)? })
        }
        Jmp | Jal | Call => {
            let [addr] = expect::<1>(op, "1", args)?;
            Ok(Instruction::J { op, addr: parse_imm32(addr)? })
        }
        Ret | Iret | Nop | Hlt => {
            expect::<0>(op, "no", args)?;
            Ok(Instruction::J { op, addr: 0 })
        }
    }
}

fn expect<'a, const N: usize>(
    op: Opcode,
    expected: &'static str,
    args: &[&'a str],
) -> Result<[&'a str; N], AsmError> {
    <[&str; N]>::try_from(args).map_err(|_| AsmError::WrongArity {
        mnemonic: op.into(),
        expected,
        got: args.len(),
    })
}

fn parse_register(token: &str) -> Result<u8, AsmError> {
    regs::parse_operand(token).ok_or_else(|| AsmError::InvalidRegister(token.to_string()))
}

fn parse_general(token: &str) -> Result<u8, AsmError> {
    let code = parse_register(token)?;
    if code >= 32 {
        return Err(AsmError::NotGeneral(token.to_string()));
    }
    Ok(code)
}

fn parse_special(token: &str) -> Result<u8, AsmError> {
    let code = parse_register(token)?;
    if code < SPECIAL_BASE {
        return Err(AsmError::NotSpecial(token.to_string()));
    }
    Ok(code)
}

/// Decimal or `0x`-prefixed hex, optionally negative.
fn parse_immediate(token: &str) -> Result<i64, AsmError> {
    let (negative, digits) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token),
    };
    let magnitude = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16)
    } else {
        digits.parse::<i64>()
    }
    .map_err(|_| AsmError::InvalidImmediate(token.to_string()))?;
    Ok(if negative { -magnitude } else { magnitude })
}

fn parse_imm32(token: &str) -> Result<u32, AsmError> {
    let value = parse_immediate(token)?;
    if value < i32::MIN as i64 || value > u32::MAX as i64 {
        return Err(AsmError::ImmediateRange(value));
    }
    Ok(value as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn r_type_encodes_into_the_documented_positions() {
        let word = assemble_line("ADD R5, R6, R7").unwrap();
        assert_eq!(word, (0x01 << 58) | (5 << 53) | (6 << 48) | (7 << 43));
    }

    #[test]
    fn commas_are_optional_and_case_folds() {
        assert_eq!(
            assemble_line("add r5 r6 r7").unwrap(),
            assemble_line("ADD R5, R6, R7").unwrap()
        );
    }

    #[test]
    fn ldr_two_operand_form_uses_the_sentinel() {
        let word = assemble_line("LDR R1, 0x40").unwrap();
        match isa::decode(word).unwrap() {
            Instruction::I { op: Opcode::Ldr, rd: 1, rs1, imm: 0x40 } => {
                assert_eq!(rs1, ABSOLUTE_SENTINEL);
            }
            other => panic!("unexpected decode: {:?}", other),
        }

        let word = assemble_line("STR R2, R3, 16").unwrap();
        match isa::decode(word).unwrap() {
            Instruction::I { op: Opcode::Str, rd: 2, rs1: 3, imm: 16 } => {}
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn shifts_take_an_immediate_amount() {
        let word = assemble_line("LSL R1, R2, 12").unwrap();
        match isa::decode(word).unwrap() {
            Instruction::R { op: Opcode::Lsl, rd: 1, rs1: 2, shamt: 12, .. } => {}
            other => panic!("unexpected decode: {:?}", other),
        }
        assert_eq!(assemble_line("LSL R1, R2, 64"), Err(AsmError::ShiftRange(64)));
    }

    #[test]
    fn mfs_and_mts_take_special_names() {
        let word = assemble_line("MFS R3, MSR").unwrap();
        match isa::decode(word).unwrap() {
            Instruction::I { op: Opcode::Mfs, rd: 3, rs1: 0x2C, .. } => {}
            other => panic!("unexpected decode: {:?}", other),
        }

        let word = assemble_line("MTS TPDR, R4").unwrap();
        match isa::decode(word).unwrap() {
            Instruction::I { op: Opcode::Mts, rd: 0x29, rs1: 4, .. } => {}
            other => panic!("unexpected decode: {:?}", other),
        }

        assert_eq!(
            assemble_line("MFS R3, R4"),
            Err(AsmError::NotSpecial("R4".to_string()))
        );
        assert_eq!(
            assemble_line("MTS TPDR, MSR"),
            Err(AsmError::NotGeneral("MSR".to_string()))
        );
    }

    #[test]
    fn branches_accept_negative_offsets() {
        let word = assemble_line("BNE R1, R2, -16").unwrap();
        match isa::decode(word).unwrap() {
            Instruction::I { op: Opcode::Bne, imm, .. } => assert_eq!(imm as i32, -16),
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn bare_mnemonics_encode_to_a_lone_opcode() {
        assert_eq!(assemble_line("HLT").unwrap(), 0x16_u64 << 58);
        assert_eq!(assemble_line("NOP").unwrap(), 0x15_u64 << 58);
        assert_eq!(assemble_line("RET").unwrap(), 0x13_u64 << 58);
        assert_eq!(assemble_line("IRET").unwrap(), 0x14_u64 << 58);
    }

    #[test]
    fn errors_are_local_and_descriptive() {
        assert_eq!(assemble_line(""), Err(AsmError::EmptyLine));
        assert_eq!(
            assemble_line("FROB R1"),
            Err(AsmError::UnknownMnemonic("FROB".to_string()))
        );
        assert!(matches!(
            assemble_line("ADD R1, R2"),
            Err(AsmError::WrongArity { mnemonic: "ADD", got: 2, .. })
        ));
        assert_eq!(
            assemble_line("PUSH R99"),
            Err(AsmError::InvalidRegister("R99".to_string()))
        );
        assert_eq!(
            assemble_line("SWI zero"),
            Err(AsmError::InvalidImmediate("zero".to_string()))
        );
        assert_eq!(
            assemble_line("JMP 0x1_0000_0000"),
            Err(AsmError::InvalidImmediate("0x1_0000_0000".to_string()))
        );
    }

    #[test]
    fn assemble_skips_blanks_and_reports_line_numbers() {
        let source = "\n; boot stub\nMOV R1, R2\n\nADD R3, R1, R1 ; double\nHLT\n";
        let words = assemble(source).unwrap();
        assert_eq!(words.len(), 3);
        assert_eq!(words[2], 0x16_u64 << 58);

        let bad = "NOP\nBADOP R1\n";
        match assemble(bad) {
            Err(AsmError::AtLine { line: 2, source }) => {
                assert_eq!(*source, AsmError::UnknownMnemonic("BADOP".to_string()));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn disassembly_round_trips_through_the_assembler() {
        let source = "LDR R1, 0x40\nADD R5, R6, R7\nMFS R3, MSR\nBEQ R1, R2, -8\nJMP 0x1000\nHLT\n";
        let words = assemble(source).unwrap();
        let listing = disassemble(&words);
        let words_again = assemble(&listing).unwrap();
        assert_eq!(words, words_again);
    }

    #[test]
    fn undecodable_words_disassemble_as_comments() {
        let listing = disassemble(&[0x3F_u64 << 58]);
        assert!(listing.starts_with("; .word"));
    }
}

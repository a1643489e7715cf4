use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use strum_macros::{Display as StrumDisplay, EnumString};

// FR bit positions.
pub const FLAG_CARRY: u8 = 1 << 0;
pub const FLAG_ZERO: u8 = 1 << 1;
pub const FLAG_SIGN: u8 = 1 << 2;
pub const FLAG_OVERFLOW: u8 = 1 << 6;

/// MSR bit 31 selects kernel mode.
pub const MSR_KERNEL: u32 = 1 << 31;
/// MSR value after reset: user mode, running.
pub const MSR_RESET: u32 = 0x1;

/// First operand code of the special-register space. Codes below this are
/// the general registers R0..R31.
pub const SPECIAL_BASE: u8 = 0x20;
/// rs1 operand value marking the absolute-addressing form of LDR/STR.
pub const ABSOLUTE_SENTINEL: u8 = 0x2D;

/// Special registers, numbered in the operand space shared by MFS/MTS and
/// the assembler. The space is disjoint from the general registers; IE4 is
/// interrupt save state only and has no operand code.
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
)]
#[repr(u8)]
#[strum(ascii_case_insensitive, serialize_all = "UPPERCASE")]
pub enum SpecialReg {
    I0 = 0x20,
    S0 = 0x21,
    S1 = 0x22,
    Fr = 0x23,
    Ivtr = 0x24,
    Ie0 = 0x25,
    Ie1 = 0x26,
    Ie2 = 0x27,
    Ie3 = 0x28,
    Tpdr = 0x29,
    Tsp = 0x2A,
    Prr = 0x2B,
    Msr = 0x2C,
}

/// The complete register file.
///
/// All registers are zeroed on reset except MSR. FR, IE0, IE3 and PRR are
/// architecturally 8 bits wide: writes truncate, reads zero-extend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registers {
    /// General-purpose registers R0..R31.
    pub r: [u32; 32],
    /// Instruction pointer.
    pub i0: u32,
    /// User stack pointer.
    pub s0: u32,
    /// Kernel stack pointer.
    pub s1: u32,
    /// Flags register.
    pub fr: u8,
    /// Interrupt vector table base (physical).
    pub ivtr: u32,
    /// Last interrupt error code.
    pub ie0: u8,
    /// Saved I0.
    pub ie1: u32,
    /// Saved S0.
    pub ie2: u32,
    /// Saved FR.
    pub ie3: u8,
    /// Saved MSR.
    pub ie4: u32,
    /// Top page directory base (physical).
    pub tpdr: u32,
    /// Task state pointer (opaque to the core).
    pub tsp: u32,
    /// Processor revision, read-only.
    pub prr: u8,
    /// Mode/status register.
    pub msr: u32,
}

impl Registers {
    pub fn new() -> Self {
        let mut regs = Self::default();
        regs.msr = MSR_RESET;
        regs
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    #[inline]
    pub fn kernel_mode(&self) -> bool {
        self.msr & MSR_KERNEL != 0
    }

    #[inline]
    pub fn flag(&self, bit: u8) -> bool {
        self.fr & bit != 0
    }

    #[inline]
    pub fn set_flag(&mut self, bit: u8, on: bool) {
        if on {
            self.fr |= bit;
        } else {
            self.fr &= !bit;
        }
    }

    pub fn read_special(&self, reg: SpecialReg) -> u32 {
        match reg {
            SpecialReg::I0 => self.i0,
            SpecialReg::S0 => self.s0,
            SpecialReg::S1 => self.s1,
            SpecialReg::Fr => self.fr as u32,
            SpecialReg::Ivtr => self.ivtr,
            SpecialReg::Ie0 => self.ie0 as u32,
            SpecialReg::Ie1 => self.ie1,
            SpecialReg::Ie2 => self.ie2,
            SpecialReg::Ie3 => self.ie3 as u32,
            SpecialReg::Tpdr => self.tpdr,
            SpecialReg::Tsp => self.tsp,
            SpecialReg::Prr => self.prr as u32,
            SpecialReg::Msr => self.msr,
        }
    }

    /// Raw write into the special space. Protection (PRR, privileged
    /// registers in user mode) is enforced by the execution engine, not
    /// here, so host code can freely seed state.
    pub fn write_special(&mut self, reg: SpecialReg, value: u32) {
        match reg {
            SpecialReg::I0 => self.i0 = value,
            SpecialReg::S0 => self.s0 = value,
            SpecialReg::S1 => self.s1 = value,
            SpecialReg::Fr => self.fr = value as u8,
            SpecialReg::Ivtr => self.ivtr = value,
            SpecialReg::Ie0 => self.ie0 = value as u8,
            SpecialReg::Ie1 => self.ie1 = value,
            SpecialReg::Ie2 => self.ie2 = value,
            SpecialReg::Ie3 => self.ie3 = value as u8,
            SpecialReg::Tpdr => self.tpdr = value,
            SpecialReg::Tsp => self.tsp = value,
            SpecialReg::Prr => self.prr = value as u8,
            SpecialReg::Msr => self.msr = value,
        }
    }
}

/// Parse a register operand by case-insensitive name: `R0`..`R31` or a
/// special-register name. Returns the operand-space code.
pub fn parse_operand(name: &str) -> Option<u8> {
    if let Ok(special) = name.parse::<SpecialReg>() {
        return Some(special.into());
    }
    let index = name.strip_prefix('r').or_else(|| name.strip_prefix('R'))?;
    // Reject leading '+', whitespace and "R01"-style zero padding.
    if !index.bytes().all(|b| b.is_ascii_digit()) || (index.len() > 1 && index.starts_with('0')) {
        return None;
    }
    match index.parse::<u8>() {
        Ok(n) if n < 32 => Some(n),
        _ => None,
    }
}

/// Render an operand-space code as the canonical register name.
pub fn operand_name(code: u8) -> String {
    if code < SPECIAL_BASE {
        return format!("R{}", code);
    }
    match SpecialReg::try_from(code) {
        Ok(special) => special.to_string(),
        Err(_) => format!("?{:#04x}", code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_state() {
        let regs = Registers::new();
        assert_eq!(regs.msr, MSR_RESET);
        assert!(!regs.kernel_mode());
        assert_eq!(regs.r, [0; 32]);
        assert_eq!(regs.i0, 0);
        assert_eq!(regs.fr, 0);
    }

    #[test]
    fn narrow_registers_truncate_on_write() {
        let mut regs = Registers::new();
        regs.write_special(SpecialReg::Fr, 0x1_47);
        assert_eq!(regs.fr, 0x47);
        assert_eq!(regs.read_special(SpecialReg::Fr), 0x47);
        regs.write_special(SpecialReg::Ie0, 0xABCD);
        assert_eq!(regs.read_special(SpecialReg::Ie0), 0xCD);
    }

    #[test]
    fn special_codes_match_operand_space() {
        assert_eq!(u8::from(SpecialReg::I0), 0x20);
        assert_eq!(u8::from(SpecialReg::Msr), 0x2C);
        assert_eq!(SpecialReg::try_from(0x29).unwrap(), SpecialReg::Tpdr);
        assert!(SpecialReg::try_from(ABSOLUTE_SENTINEL).is_err());
        assert!(SpecialReg::try_from(0x1F).is_err());
    }

    #[test]
    fn operand_parsing() {
        assert_eq!(parse_operand("R0"), Some(0));
        assert_eq!(parse_operand("r31"), Some(31));
        assert_eq!(parse_operand("ivtr"), Some(0x24));
        assert_eq!(parse_operand("MSR"), Some(0x2C));
        assert_eq!(parse_operand("R32"), None);
        assert_eq!(parse_operand("R01"), None);
        assert_eq!(parse_operand("X5"), None);
        assert_eq!(parse_operand(""), None);
    }

    #[test]
    fn operand_names_round_trip() {
        for code in 0..=0x2C_u8 {
            let name = operand_name(code);
            assert_eq!(parse_operand(&name), Some(code), "code {:#04x}", code);
        }
    }

    #[test]
    fn flag_helpers_set_and_clear() {
        let mut regs = Registers::new();
        regs.set_flag(FLAG_ZERO, true);
        regs.set_flag(FLAG_SIGN, true);
        assert!(regs.flag(FLAG_ZERO));
        regs.set_flag(FLAG_ZERO, false);
        assert!(!regs.flag(FLAG_ZERO));
        assert!(regs.flag(FLAG_SIGN));
    }
}

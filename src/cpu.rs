//! Fetch/decode/dispatch pipeline and per-opcode execution.

use crate::interrupts;
use crate::io::IoFabric;
use crate::isa::{self, Instruction, Opcode};
use crate::memory::Memory;
use crate::mmu;
use crate::regs::{
    Registers, SpecialReg, ABSOLUTE_SENTINEL, FLAG_CARRY, FLAG_OVERFLOW, FLAG_SIGN, FLAG_ZERO,
};
use crate::Trap;

/// Bytes per encoded instruction.
pub const INSTRUCTION_BYTES: u32 = 8;

/// Whether the executed instruction already wrote I0.
enum Flow {
    Next,
    Jump,
}

/// One XR-32 hart: the register file plus the dispatch logic. Memory and
/// I/O are borrowed per step; there are no long-lived cross references.
pub struct Cpu {
    pub regs: Registers,
    /// `(vector, error code)` delivered by the most recent step, if any.
    pub last_interrupt: Option<(u8, u8)>,
}

impl Cpu {
    pub fn new() -> Self {
        Self { regs: Registers::new(), last_interrupt: None }
    }

    pub fn reset(&mut self) {
        self.regs.reset();
        self.last_interrupt = None;
    }

    /// Fetch, decode and execute exactly one instruction.
    ///
    /// Architectural faults are delivered through the vector table and
    /// complete the step normally; only [`Trap::Halted`] and
    /// [`Trap::Fatal`] reach the caller.
    pub fn step(&mut self, mem: &mut Memory, io: &mut IoFabric) -> Result<(), Trap> {
        self.last_interrupt = None;
        match self.step_inner(mem, io) {
            Ok(()) => Ok(()),
            Err(trap) => match trap.vector() {
                Some((vector, code)) => {
                    log::debug!(
                        "delivering interrupt {vector:#04x} (error code {code}) for {trap} at i0={:#010x}",
                        self.regs.i0
                    );
                    interrupts::trigger(&mut self.regs, mem, vector, code)?;
                    self.last_interrupt = Some((vector, code));
                    Ok(())
                }
                None => Err(trap),
            },
        }
    }

    fn step_inner(&mut self, mem: &mut Memory, io: &mut IoFabric) -> Result<(), Trap> {
        let word = self.fetch(mem)?;
        let instr = isa::decode(word)?;
        if log::log_enabled!(log::Level::Trace) {
            log::trace!("{:#010x}: {}", self.regs.i0, instr);
        }
        match self.execute(&instr, mem, io)? {
            Flow::Next => {
                self.regs.i0 = self.regs.i0.wrapping_add(INSTRUCTION_BYTES);
            }
            Flow::Jump => {}
        }
        Ok(())
    }

    fn fetch(&self, mem: &Memory) -> Result<u64, Trap> {
        let i0 = self.regs.i0;
        if i0 % INSTRUCTION_BYTES != 0 {
            return Err(Trap::AlignmentCheck { vaddr: i0, code: 3 });
        }
        let kernel = self.regs.kernel_mode();
        let lo = mmu::read32(mem, self.regs.tpdr, kernel, i0)?;
        let hi = mmu::read32(mem, self.regs.tpdr, kernel, i0.wrapping_add(4))?;
        Ok(lo as u64 | (hi as u64) << 32)
    }

    fn execute(
        &mut self,
        instr: &Instruction,
        mem: &mut Memory,
        io: &mut IoFabric,
    ) -> Result<Flow, Trap> {
        match *instr {
            Instruction::R { op, rd, rs1, rs2, shamt, .. } => self.execute_r(op, rd, rs1, rs2, shamt),
            Instruction::I { op, rd, rs1, imm } => self.execute_i(op, rd, rs1, imm, mem, io),
            Instruction::J { op, addr } => self.execute_j(op, addr, mem),
        }
    }

    fn execute_r(&mut self, op: Opcode, rd: u8, rs1: u8, rs2: u8, shamt: u8) -> Result<Flow, Trap> {
        // R-type register fields are 5 bits wide, so indices are in range.
        let rd = rd as usize;
        let a = self.regs.r[rs1 as usize];
        let b = self.regs.r[rs2 as usize];

        let result = match op {
            Opcode::Add => {
                let (res, carry) = a.overflowing_add(b);
                let overflow = (!(a ^ b) & (a ^ res)) >> 31 != 0;
                self.set_flags(res, Some(carry), Some(overflow));
                res
            }
            Opcode::Sub => self.sub_with_flags(a, b),
            Opcode::And => {
                let res = a & b;
                self.set_flags(res, None, None);
                res
            }
            Opcode::Or => {
                let res = a | b;
                self.set_flags(res, None, None);
                res
            }
            Opcode::Xor => {
                let res = a ^ b;
                self.set_flags(res, None, None);
                res
            }
            Opcode::Mul => {
                let wide = a as u64 * b as u64;
                let res = wide as u32;
                let carry = wide >> 32 != 0;
                let signed = a as i32 as i64 * b as i32 as i64;
                let overflow = signed != signed as i32 as i64;
                self.set_flags(res, Some(carry), Some(overflow));
                res
            }
            Opcode::Div | Opcode::Mod => {
                if b == 0 {
                    return Err(Trap::DivideByZero);
                }
                let res = if op == Opcode::Div { a / b } else { a % b };
                self.set_flags(res, None, None);
                res
            }
            Opcode::Lsl | Opcode::Asl => {
                let res = a.checked_shl(shamt as u32).unwrap_or(0);
                let carry = match shamt {
                    0 => None,
                    1..=32 => Some((a >> (32 - shamt as u32)) & 1 != 0),
                    _ => Some(false),
                };
                self.set_flags(res, carry, None);
                res
            }
            Opcode::Lsr => {
                let res = a.checked_shr(shamt as u32).unwrap_or(0);
                let carry = match shamt {
                    0 => None,
                    1..=32 => Some((a >> (shamt as u32 - 1)) & 1 != 0),
                    _ => Some(false),
                };
                self.set_flags(res, carry, None);
                res
            }
            Opcode::Asr => {
                let sign = a >> 31 != 0;
                let res = if shamt >= 32 {
                    if sign { u32::MAX } else { 0 }
                } else {
                    ((a as i32) >> shamt) as u32
                };
                let carry = match shamt {
                    0 => None,
                    1..=32 => Some((a >> (shamt as u32 - 1)) & 1 != 0),
                    _ => Some(sign),
                };
                self.set_flags(res, carry, None);
                res
            }
            Opcode::Not => {
                let res = !a;
                self.set_flags(res, None, None);
                res
            }
            Opcode::Neg => {
                let res = a.wrapping_neg();
                self.set_flags(res, None, None);
                res
            }
            Opcode::Inc => {
                let res = self.regs.r[rd].wrapping_add(1);
                self.set_flags(res, None, None);
                res
            }
            Opcode::Dec => {
                let res = self.regs.r[rd].wrapping_sub(1);
                self.set_flags(res, None, None);
                res
            }
            _ => {
                return Err(Trap::Fatal(format!("{op} dispatched as R-type")));
            }
        };

        self.regs.r[rd] = result;
        Ok(Flow::Next)
    }

    fn execute_i(
        &mut self,
        op: Opcode,
        rd: u8,
        rs1: u8,
        imm: u32,
        mem: &mut Memory,
        io: &mut IoFabric,
    ) -> Result<Flow, Trap> {
        let kernel = self.regs.kernel_mode();
        let tpdr = self.regs.tpdr;

        match op {
            Opcode::Ldr => {
                let rd = general(rd)?;
                let addr = self.effective_address(rs1, imm)?;
                self.regs.r[rd] = mmu::read32(mem, tpdr, kernel, addr)?;
            }
            Opcode::Str => {
                let value = self.regs.r[general(rd)?];
                let addr = self.effective_address(rs1, imm)?;
                mmu::write32(mem, tpdr, kernel, addr, value)?;
            }
            Opcode::Beq | Opcode::Bne => {
                let equal = self.regs.r[general(rd)?] == self.regs.r[general(rs1)?];
                let taken = if op == Opcode::Beq { equal } else { !equal };
                if taken {
                    // Byte offset, already sign-extended to 32 bits.
                    self.regs.i0 = self.regs.i0.wrapping_add(imm);
                    return Ok(Flow::Jump);
                }
            }
            Opcode::Mov => {
                let src = self.regs.r[general(rs1)?];
                self.regs.r[general(rd)?] = src;
            }
            Opcode::Cmp => {
                let a = self.regs.r[general(rs1)?];
                let b = self.regs.r[general(rd)?];
                self.sub_with_flags(a, b);
            }
            Opcode::Push => {
                let value = self.regs.r[general(rd)?];
                let top = self.regs.s0.wrapping_sub(4);
                mmu::write32(mem, tpdr, kernel, top, value)?;
                self.regs.s0 = top;
            }
            Opcode::Pop => {
                let rd = general(rd)?;
                self.regs.r[rd] = mmu::read32(mem, tpdr, kernel, self.regs.s0)?;
                self.regs.s0 = self.regs.s0.wrapping_add(4);
            }
            Opcode::Swi => {
                // Voluntary: resume past the SWI, unlike faults which save
                // the faulting address for retry.
                self.regs.i0 = self.regs.i0.wrapping_add(INSTRUCTION_BYTES);
                return Err(Trap::Software((imm & 0xFF) as u8));
            }
            Opcode::Sext => {
                let src = self.regs.r[general(rs1)?];
                self.regs.r[general(rd)?] = src as u16 as i16 as i32 as u32;
            }
            Opcode::Zext => {
                let src = self.regs.r[general(rs1)?];
                self.regs.r[general(rd)?] = src & 0xFFFF;
            }
            Opcode::Mfs => {
                let source = special(rs1)?;
                self.regs.r[general(rd)?] = self.regs.read_special(source);
            }
            Opcode::Mts => {
                let target = special(rd)?;
                let value = self.regs.r[general(rs1)?];
                self.write_special_checked(target, value)?;
            }
            Opcode::Out => {
                let value = self.regs.r[general(rs1)?];
                io.write(rd as u16, value);
            }
            Opcode::In => {
                let rs1 = general(rs1)?;
                self.regs.r[rs1] = io.read(rd as u16);
            }
            _ => {
                return Err(Trap::Fatal(format!("{op} dispatched as I-type")));
            }
        }

        Ok(Flow::Next)
    }

    fn execute_j(&mut self, op: Opcode, addr: u32, mem: &mut Memory) -> Result<Flow, Trap> {
        let kernel = self.regs.kernel_mode();
        let tpdr = self.regs.tpdr;

        match op {
            Opcode::Jmp => {
                self.regs.i0 = addr;
                Ok(Flow::Jump)
            }
            Opcode::Jal => {
                self.regs.r[31] = self.regs.i0.wrapping_add(INSTRUCTION_BYTES);
                self.regs.i0 = addr;
                Ok(Flow::Jump)
            }
            Opcode::Call => {
                let ret = self.regs.i0.wrapping_add(INSTRUCTION_BYTES);
                let top = self.regs.s0.wrapping_sub(4);
                mmu::write32(mem, tpdr, kernel, top, ret)?;
                self.regs.s0 = top;
                self.regs.i0 = addr;
                Ok(Flow::Jump)
            }
            Opcode::Ret => {
                self.regs.i0 = mmu::read32(mem, tpdr, kernel, self.regs.s0)?;
                self.regs.s0 = self.regs.s0.wrapping_add(4);
                Ok(Flow::Jump)
            }
            Opcode::Iret => {
                interrupts::iret(&mut self.regs);
                Ok(Flow::Jump)
            }
            Opcode::Nop => Ok(Flow::Next),
            Opcode::Hlt => Err(Trap::Halted),
            _ => Err(Trap::Fatal(format!("{op} dispatched as J-type"))),
        }
    }

    fn effective_address(&self, rs1: u8, imm: u32) -> Result<u32, Trap> {
        if rs1 == ABSOLUTE_SENTINEL {
            Ok(imm)
        } else {
            Ok(self.regs.r[general(rs1)?].wrapping_add(imm))
        }
    }

    fn sub_with_flags(&mut self, a: u32, b: u32) -> u32 {
        let (res, borrow) = a.overflowing_sub(b);
        let overflow = ((a ^ b) & (a ^ res)) >> 31 != 0;
        self.set_flags(res, Some(borrow), Some(overflow));
        res
    }

    /// Zero and Sign always track the result; Carry and Overflow are only
    /// touched by operations whose algebra defines them.
    fn set_flags(&mut self, result: u32, carry: Option<bool>, overflow: Option<bool>) {
        self.regs.set_flag(FLAG_ZERO, result == 0);
        self.regs.set_flag(FLAG_SIGN, result >> 31 != 0);
        if let Some(carry) = carry {
            self.regs.set_flag(FLAG_CARRY, carry);
        }
        if let Some(overflow) = overflow {
            self.regs.set_flag(FLAG_OVERFLOW, overflow);
        }
    }

    fn write_special_checked(&mut self, reg: SpecialReg, value: u32) -> Result<(), Trap> {
        if reg == SpecialReg::Prr {
            return Err(Trap::GeneralProtectionFault { code: 7 });
        }
        if !self.regs.kernel_mode() && !matches!(reg, SpecialReg::S0 | SpecialReg::Fr) {
            return Err(Trap::GeneralProtectionFault { code: 7 });
        }
        self.regs.write_special(reg, value);
        Ok(())
    }
}

fn general(code: u8) -> Result<usize, Trap> {
    if code < 32 {
        Ok(code as usize)
    } else {
        Err(Trap::GeneralProtectionFault { code: 6 })
    }
}

fn special(code: u8) -> Result<SpecialReg, Trap> {
    SpecialReg::try_from(code).map_err(|_| Trap::GeneralProtectionFault { code: 6 })
}

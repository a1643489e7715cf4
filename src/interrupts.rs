//! Interrupt delivery and return.
//!
//! Delivery saves the interrupted context into the IE slots, forces kernel
//! mode and redirects execution through the vector table at IVTR. The save
//! area is a single slot: a trigger while a handler is in flight
//! overwrites it, so handlers that re-enable traps must spill the IE
//! registers themselves.

use crate::memory::Memory;
use crate::regs::{Registers, MSR_KERNEL};
use crate::Trap;

pub const VEC_DIVIDE_BY_ZERO: u8 = 0x00;
pub const VEC_INVALID_OPCODE: u8 = 0x01;
pub const VEC_PAGE_FAULT: u8 = 0x02;
pub const VEC_PROTECTION_FAULT: u8 = 0x03;
pub const VEC_OVERFLOW: u8 = 0x04;
pub const VEC_DOUBLE_FAULT: u8 = 0x05;
pub const VEC_ALIGNMENT_CHECK: u8 = 0x06;
pub const VEC_NON_MASKABLE: u8 = 0x07;
/// 0x08..0x0A are free for software use.
pub const VEC_USER_BASE: u8 = 0x08;

/// Vector table entries are 32-bit handler addresses.
pub const VECTOR_ENTRY_SIZE: u32 = 4;

/// Deliver interrupt `vector` with `error_code`.
///
/// The handler address is fetched first (raw, physical) so that a corrupt
/// IVTR surfaces as a host error before any context is clobbered.
pub fn trigger(
    regs: &mut Registers,
    mem: &Memory,
    vector: u8,
    error_code: u8,
) -> Result<(), Trap> {
    let slot = regs.ivtr.wrapping_add(vector as u32 * VECTOR_ENTRY_SIZE);
    let handler = mem
        .load_32(slot)
        .map_err(|e| Trap::Fatal(format!("vector table entry {vector:#04x}: {e}")))?;

    regs.ie1 = regs.i0;
    regs.ie2 = regs.s0;
    regs.ie3 = regs.fr;
    regs.ie4 = regs.msr;
    regs.ie0 = error_code;
    regs.msr |= MSR_KERNEL;
    regs.i0 = handler;
    Ok(())
}

/// Return from the current handler, restoring the saved context.
pub fn iret(regs: &mut Registers) {
    regs.i0 = regs.ie1;
    regs.s0 = regs.ie2;
    regs.fr = regs.ie3;
    regs.msr = regs.ie4;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::MSR_RESET;

    #[test]
    fn trigger_saves_context_and_escalates() {
        let mut mem = Memory::new(4096);
        mem.store_32(0x100 + 2 * 4, 0x2000).unwrap();

        let mut regs = Registers::new();
        regs.ivtr = 0x100;
        regs.i0 = 0x440;
        regs.s0 = 0x9000;
        regs.fr = 0b0000_0110;

        trigger(&mut regs, &mem, VEC_PAGE_FAULT, 0).unwrap();

        assert_eq!(regs.i0, 0x2000);
        assert_eq!(regs.ie0, 0);
        assert_eq!(regs.ie1, 0x440);
        assert_eq!(regs.ie2, 0x9000);
        assert_eq!(regs.ie3, 0b0000_0110);
        assert_eq!(regs.ie4, MSR_RESET);
        assert!(regs.kernel_mode());
    }

    #[test]
    fn iret_restores_the_saved_context() {
        let mut mem = Memory::new(4096);
        mem.store_32(0x100 + 8 * 4, 0x3000).unwrap();

        let mut regs = Registers::new();
        regs.ivtr = 0x100;
        regs.i0 = 0x20;
        regs.s0 = 0x8000;
        regs.fr = 0b0100_0001;

        let (i0, s0, fr, msr) = (regs.i0, regs.s0, regs.fr, regs.msr);
        trigger(&mut regs, &mem, VEC_USER_BASE, 0x55).unwrap();
        assert_eq!(regs.ie0, 0x55);

        // Handler trashes everything it is allowed to.
        regs.s0 = 0;
        regs.fr = 0xFF;

        iret(&mut regs);
        assert_eq!((regs.i0, regs.s0, regs.fr, regs.msr), (i0, s0, fr, msr));
        assert!(!regs.kernel_mode());
    }

    #[test]
    fn corrupt_vector_table_is_a_host_error() {
        let mem = Memory::new(64);
        let mut regs = Registers::new();
        regs.ivtr = 0xFFFF_0000;
        let before = regs.clone();
        let err = trigger(&mut regs, &mem, VEC_DIVIDE_BY_ZERO, 0);
        assert!(matches!(err, Err(Trap::Fatal(_))));
        // No context was clobbered.
        assert_eq!(regs, before);
    }
}

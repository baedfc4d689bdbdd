//! Branch and condition register instructions

use gk_memory::GuestMemory;

use super::{program_cause, ExecResult, Trap};
use crate::decoder::{Instruction, Op};
use crate::state::{MachineState, XER_CA, XER_OV, XER_SO};

/// Evaluate the BO/BI condition of a conditional branch, decrementing CTR
/// when BO asks for it
#[inline]
pub fn branch_taken(state: &mut MachineState, bo: u32, bi: u32) -> bool {
    if bo & 0x04 == 0 {
        let ctr = state.ctr().wrapping_sub(1);
        state.set_ctr(ctr);
    }
    let ctr_ok = bo & 0x04 != 0 || ((state.ctr() != 0) ^ (bo & 0x02 != 0));
    let cond_ok = bo & 0x10 != 0 || (state.cr_bit(bi) == (bo & 0x08 != 0));
    ctr_ok && cond_ok
}

/// Condition-only evaluation used by `bcctr`
#[inline]
pub fn condition_true(state: &MachineState, bo: u32, bi: u32) -> bool {
    bo & 0x10 != 0 || (state.cr_bit(bi) == (bo & 0x08 != 0))
}

pub fn execute(op: Op, state: &mut MachineState, _mem: &mut GuestMemory, inst: Instruction) -> ExecResult {
    let pc = state.pc;
    match op {
        Op::B => {
            let offset = inst.li() as u32;
            let target = if inst.aa() { offset } else { pc.wrapping_add(offset) };
            if inst.lk() {
                state.set_lr(pc.wrapping_add(4));
            }
            state.npc = target;
        }
        Op::Bc => {
            if branch_taken(state, inst.bo(), inst.bi()) {
                let offset = inst.bd() as u32;
                state.npc = if inst.aa() { offset } else { pc.wrapping_add(offset) };
            }
            if inst.lk() {
                state.set_lr(pc.wrapping_add(4));
            }
        }
        Op::Bclr => {
            let target = state.lr() & !3;
            if branch_taken(state, inst.bo(), inst.bi()) {
                state.npc = target;
            }
            if inst.lk() {
                state.set_lr(pc.wrapping_add(4));
            }
        }
        Op::Bcctr => {
            if condition_true(state, inst.bo(), inst.bi()) {
                state.npc = state.ctr() & !3;
            }
            if inst.lk() {
                state.set_lr(pc.wrapping_add(4));
            }
        }

        Op::Mcrf => {
            let field = state.cr_field(inst.crfs());
            state.set_cr_field(inst.crfd(), field);
        }
        Op::Crand
        | Op::Crandc
        | Op::Creqv
        | Op::Crnand
        | Op::Crnor
        | Op::Cror
        | Op::Crorc
        | Op::Crxor => {
            let a = state.cr_bit(inst.ra() as u32);
            let b = state.cr_bit(inst.rb() as u32);
            let result = match op {
                Op::Crand => a & b,
                Op::Crandc => a & !b,
                Op::Creqv => !(a ^ b),
                Op::Crnand => !(a & b),
                Op::Crnor => !(a | b),
                Op::Cror => a | b,
                Op::Crorc => a | !b,
                _ => a ^ b,
            };
            state.set_cr_bit(inst.rd() as u32, result);
        }
        Op::Mcrxr => {
            state.set_cr_field(inst.crfd(), state.xer >> 28);
            state.xer &= !(XER_SO | XER_OV | XER_CA | 0x1000_0000);
        }
        Op::Mfcr => state.gpr[inst.rd()] = state.cr,
        Op::Mtcrf => {
            let crm = inst.crm();
            let mut mask = 0u32;
            for field in 0..8 {
                if crm & (0x80 >> field) != 0 {
                    mask |= 0xF000_0000 >> (field * 4);
                }
            }
            state.cr = (state.cr & !mask) | (state.gpr[inst.rd()] & mask);
        }

        _ => return Err(Trap::Program(program_cause::ILLEGAL)),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_always() {
        let mut state = MachineState::new();
        assert!(branch_taken(&mut state, 0x14, 0));
        assert_eq!(state.ctr(), 0);
    }

    #[test]
    fn test_bdnz_decrements_ctr() {
        let mut state = MachineState::new();
        state.set_ctr(2);
        // bdnz: BO = 16
        assert!(branch_taken(&mut state, 0x10, 0));
        assert_eq!(state.ctr(), 1);
        assert!(!branch_taken(&mut state, 0x10, 0));
        assert_eq!(state.ctr(), 0);
    }

    #[test]
    fn test_condition_bit() {
        let mut state = MachineState::new();
        state.set_cr_bit(2, true);
        // beq: BO = 12, BI = 2
        assert!(branch_taken(&mut state, 0x0C, 2));
        // bne: BO = 4
        assert!(!branch_taken(&mut state, 0x04, 2));
        assert!(condition_true(&state, 0x0C, 2));
    }
}

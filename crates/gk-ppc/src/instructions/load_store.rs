//! Integer and floating point loads and stores
//!
//! Every load reads memory before touching a register, so a faulting access
//! leaves the destination (and rA of update forms) unchanged.

use gk_memory::{GuestMemory, MemoryFault, Primitive, TranslationMode};

use super::float::{convert_to_double, convert_to_single};
use super::{ea_d, ea_du, ea_x, ea_xu, program_cause, ExecResult, Trap};
use crate::decoder::{Instruction, Op};
use crate::state::{MachineState, CR_EQ, CR_SO};

/// Load through fastmem when possible, the translating path otherwise
#[inline]
pub fn load<T: Primitive>(mem: &mut GuestMemory, ea: u32, mode: TranslationMode) -> Result<T, MemoryFault> {
    match mem.fast_read::<T>(ea, mode) {
        Some(value) => Ok(value),
        None => mem.read::<T>(ea, mode),
    }
}

/// Store through fastmem when possible, the translating path otherwise
#[inline]
pub fn store<T: Primitive>(
    mem: &mut GuestMemory,
    ea: u32,
    value: T,
    mode: TranslationMode,
) -> Result<(), MemoryFault> {
    match mem.fast_write::<T>(ea, value, mode) {
        Some(()) => Ok(()),
        None => mem.write::<T>(ea, value, mode),
    }
}

#[inline]
fn require_word_aligned(ea: u32) -> Result<(), Trap> {
    if ea & 3 != 0 {
        return Err(Trap::Memory(MemoryFault::Alignment { address: ea }));
    }
    Ok(())
}

/// Effective address and whether rA is updated afterwards
fn effective_address(op: Op, state: &MachineState, inst: Instruction) -> (u32, bool) {
    use Op::*;
    match op {
        Lwzu | Lbzu | Lhzu | Lhau | Stwu | Stbu | Sthu | Lfsu | Lfdu | Stfsu | Stfdu => {
            (ea_du(state, inst), true)
        }
        Lwzux | Lbzux | Lhzux | Lhaux | Stwux | Stbux | Sthux | Lfsux | Lfdux | Stfsux
        | Stfdux => (ea_xu(state, inst), true),
        Lwzx | Lbzx | Lhzx | Lhax | Lhbrx | Lwbrx | Lwarx | Stwx | Stbx | Sthx | Sthbrx
        | Stwbrx | StwcxRc | Lfsx | Lfdx | Stfsx | Stfdx | Stfiwx | Lswx | Stswx => {
            (ea_x(state, inst), false)
        }
        Lswi | Stswi => (super::ra_or_zero(state, inst), false),
        _ => (ea_d(state, inst), false),
    }
}

/// Load `count` bytes into consecutive registers starting at `start`
fn load_string(
    state: &mut MachineState,
    mem: &mut GuestMemory,
    ea: u32,
    start: usize,
    count: u32,
) -> ExecResult {
    let mode = state.data_mode();
    let mut words = [0u32; 32];
    for i in 0..count {
        let byte = mem.read::<u8>(ea.wrapping_add(i), mode)?;
        words[(i / 4) as usize] |= (byte as u32) << (24 - 8 * (i % 4));
    }
    for (k, &word) in words.iter().enumerate().take(count.div_ceil(4) as usize) {
        state.gpr[(start + k) % 32] = word;
    }
    Ok(())
}

/// Store `count` bytes from consecutive registers starting at `start`
fn store_string(
    state: &MachineState,
    mem: &mut GuestMemory,
    ea: u32,
    start: usize,
    count: u32,
) -> ExecResult {
    let mode = state.data_mode();
    for i in 0..count {
        let word = state.gpr[(start + (i / 4) as usize) % 32];
        let byte = (word >> (24 - 8 * (i % 4))) as u8;
        mem.write::<u8>(ea.wrapping_add(i), byte, mode)?;
    }
    Ok(())
}

pub fn execute(op: Op, state: &mut MachineState, mem: &mut GuestMemory, inst: Instruction) -> ExecResult {
    let mode = state.data_mode();
    let rd = inst.rd();
    let (ea, update) = effective_address(op, state, inst);

    match op {
        Op::Lwz | Op::Lwzu | Op::Lwzx | Op::Lwzux => state.gpr[rd] = load::<u32>(mem, ea, mode)?,
        Op::Lbz | Op::Lbzu | Op::Lbzx | Op::Lbzux => {
            state.gpr[rd] = load::<u8>(mem, ea, mode)? as u32
        }
        Op::Lhz | Op::Lhzu | Op::Lhzx | Op::Lhzux => {
            state.gpr[rd] = load::<u16>(mem, ea, mode)? as u32
        }
        Op::Lha | Op::Lhau | Op::Lhax | Op::Lhaux => {
            state.gpr[rd] = load::<u16>(mem, ea, mode)? as i16 as i32 as u32
        }
        Op::Lhbrx => state.gpr[rd] = load::<u16>(mem, ea, mode)?.swap_bytes() as u32,
        Op::Lwbrx => state.gpr[rd] = load::<u32>(mem, ea, mode)?.swap_bytes(),
        Op::Lwarx => {
            require_word_aligned(ea)?;
            let value = mem.read::<u32>(ea, mode)?;
            mem.reserve(ea);
            state.gpr[rd] = value;
        }
        Op::Lmw => {
            require_word_aligned(ea)?;
            let mut values = [0u32; 32];
            for (i, slot) in values.iter_mut().enumerate().skip(rd) {
                *slot = mem.read::<u32>(ea.wrapping_add(((i - rd) * 4) as u32), mode)?;
            }
            state.gpr[rd..].copy_from_slice(&values[rd..]);
        }
        Op::Lswi => {
            let count = match inst.sh() {
                0 => 32,
                n => n,
            };
            load_string(state, mem, ea, rd, count)?;
        }
        Op::Lswx => {
            let count = state.xer & 0x7F;
            load_string(state, mem, ea, rd, count)?;
        }

        Op::Stw | Op::Stwu | Op::Stwx | Op::Stwux => store::<u32>(mem, ea, state.gpr[rd], mode)?,
        Op::Stb | Op::Stbu | Op::Stbx | Op::Stbux => {
            store::<u8>(mem, ea, state.gpr[rd] as u8, mode)?
        }
        Op::Sth | Op::Sthu | Op::Sthx | Op::Sthux => {
            store::<u16>(mem, ea, state.gpr[rd] as u16, mode)?
        }
        Op::Sthbrx => store::<u16>(mem, ea, (state.gpr[rd] as u16).swap_bytes(), mode)?,
        Op::Stwbrx => store::<u32>(mem, ea, state.gpr[rd].swap_bytes(), mode)?,
        Op::StwcxRc => {
            require_word_aligned(ea)?;
            let so = if state.xer_so() { CR_SO } else { 0 };
            if mem.check_and_clear_reservation(ea) {
                mem.write::<u32>(ea, state.gpr[rd], mode)?;
                state.set_cr_field(0, CR_EQ | so);
            } else {
                state.set_cr_field(0, so);
            }
        }
        Op::Stmw => {
            require_word_aligned(ea)?;
            for reg in rd..32 {
                let addr = ea.wrapping_add(((reg - rd) * 4) as u32);
                mem.write::<u32>(addr, state.gpr[reg], mode)?;
            }
        }
        Op::Stswi => {
            let count = match inst.sh() {
                0 => 32,
                n => n,
            };
            store_string(state, mem, ea, rd, count)?;
        }
        Op::Stswx => {
            let count = state.xer & 0x7F;
            store_string(state, mem, ea, rd, count)?;
        }

        Op::Lfs | Op::Lfsu | Op::Lfsx | Op::Lfsux => {
            let wide = convert_to_double(load::<u32>(mem, ea, mode)?);
            state.ps[rd].ps0 = wide;
            state.ps[rd].ps1 = wide;
        }
        Op::Lfd | Op::Lfdu | Op::Lfdx | Op::Lfdux => state.ps[rd].ps0 = load::<u64>(mem, ea, mode)?,
        Op::Stfs | Op::Stfsu | Op::Stfsx | Op::Stfsux => {
            store::<u32>(mem, ea, convert_to_single(state.ps[rd].ps0), mode)?
        }
        Op::Stfd | Op::Stfdu | Op::Stfdx | Op::Stfdux => store::<u64>(mem, ea, state.ps[rd].ps0, mode)?,
        Op::Stfiwx => store::<u32>(mem, ea, state.ps[rd].ps0 as u32, mode)?,

        _ => return Err(Trap::Program(program_cause::ILLEGAL)),
    }

    if update {
        state.gpr[inst.ra()] = ea;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_forms_are_detected() {
        let mut state = MachineState::new();
        state.gpr[1] = 0x100;
        state.gpr[2] = 0x20;
        // lwzu r3, 8(r1)
        let (ea, update) = effective_address(Op::Lwzu, &state, Instruction(0x8461_0008));
        assert_eq!((ea, update), (0x108, true));
        // lwzx r3, r1, r2
        let (ea, update) = effective_address(Op::Lwzx, &state, Instruction(0x7C61_102E));
        assert_eq!((ea, update), (0x120, false));
        // lwz r3, 8(r0) ignores r0
        state.gpr[0] = 0x5000;
        let (ea, _) = effective_address(Op::Lwz, &state, Instruction(0x8060_0008));
        assert_eq!(ea, 8);
    }
}

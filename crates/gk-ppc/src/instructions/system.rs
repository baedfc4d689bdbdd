//! Supervisor, SPR, cache and synchronization instructions

use gk_memory::GuestMemory;

use super::{ea_x, program_cause, ExecResult, Trap};
use crate::decoder::{Instruction, Op};
use crate::state::{spr, ExceptionFlags, MachineState, Msr};

/// MSR bits restored from SRR1 by `rfi`
pub const RFI_MSR_MASK: u32 = 0x87C0_FFFF;

#[inline]
fn check_supervisor(state: &MachineState) -> ExecResult {
    if state.msr & Msr::PR.bits() != 0 {
        return Err(Trap::Program(program_cause::PRIVILEGED));
    }
    Ok(())
}

/// Read an SPR, routing registers that live outside the SPR file
pub fn read_spr(state: &MachineState, mem: &GuestMemory, n: usize) -> u32 {
    match n {
        spr::XER => state.xer,
        spr::DEC => state.decrementer(),
        spr::TBL_READ => state.timebase() as u32,
        spr::TBU_READ => (state.timebase() >> 32) as u32,
        spr::SDR1 => mem.sdr1(),
        n if spr::is_bat(n) => mem.bat(n - spr::IBAT0U),
        n => state.spr[n],
    }
}

/// Write an SPR, applying its side effects
pub fn write_spr(state: &mut MachineState, mem: &mut GuestMemory, n: usize, value: u32) {
    match n {
        spr::XER => state.xer = value,
        spr::DEC => {
            if state.write_decrementer(value) {
                state.exceptions |= ExceptionFlags::DECREMENTER;
            }
        }
        spr::TBL_WRITE => state.write_timebase(false, value),
        spr::TBU_WRITE => state.write_timebase(true, value),
        spr::SDR1 => mem.set_sdr1(value),
        n if spr::is_bat(n) => mem.set_bat(n - spr::IBAT0U, value),
        spr::PVR => gk_core::cpu_debug!("Ignoring write of 0x{:08x} to PVR", value),
        spr::HID0 => {
            if value & spr::HID0_ICFI != 0 {
                gk_core::cpu_debug!("HID0 instruction cache flash invalidate");
                mem.invalidate_all_code();
            }
            state.spr[n] = value & !spr::HID0_ICFI;
        }
        n => state.spr[n] = value,
    }
}

pub fn execute(op: Op, state: &mut MachineState, mem: &mut GuestMemory, inst: Instruction) -> ExecResult {
    let rd = inst.rd();
    match op {
        Op::Sc => return Err(Trap::Syscall),
        Op::Rfi => {
            let srr1 = state.spr[spr::SRR1];
            state.msr = (state.msr & !RFI_MSR_MASK) | (srr1 & RFI_MSR_MASK);
            // POW is never restored
            state.msr &= !Msr::POW.bits();
            state.npc = state.spr[spr::SRR0] & !3;
        }
        Op::Mfmsr => state.gpr[rd] = state.msr,
        Op::Mtmsr => state.msr = state.gpr[rd],
        Op::Mfspr => {
            let n = inst.spr();
            if spr::is_privileged(n) {
                check_supervisor(state)?;
            }
            state.gpr[rd] = read_spr(state, mem, n);
        }
        Op::Mtspr => {
            let n = inst.spr();
            if spr::is_privileged(n) {
                check_supervisor(state)?;
            }
            let value = state.gpr[rd];
            write_spr(state, mem, n, value);
        }
        Op::Mftb => {
            let n = inst.spr();
            state.gpr[rd] = match n {
                spr::TBL_READ => state.timebase() as u32,
                spr::TBU_READ => (state.timebase() >> 32) as u32,
                _ => return Err(Trap::Program(program_cause::ILLEGAL)),
            };
        }
        Op::Mfsr => state.gpr[rd] = mem.sr(inst.sr()),
        Op::Mfsrin => state.gpr[rd] = mem.sr((state.gpr[inst.rb()] >> 28) as usize),
        Op::Mtsr => mem.set_sr(inst.sr(), state.gpr[rd]),
        Op::Mtsrin => mem.set_sr((state.gpr[inst.rb()] >> 28) as usize, state.gpr[rd]),

        Op::Dcbz => {
            let ea = ea_x(state, inst);
            mem.zero_line(ea, state.data_mode())?;
        }
        Op::Icbi => {
            let ea = ea_x(state, inst);
            mem.invalidate_icache(ea, state.instruction_mode());
        }
        Op::Tlbie => mem.tlbie(state.gpr[inst.rb()]),
        Op::Dcbf | Op::Dcbst | Op::Dcbi | Op::Dcbt | Op::Dcbtst | Op::Sync | Op::Isync
        | Op::Eieio | Op::Tlbsync => {}

        _ => return Err(Trap::Program(program_cause::ILLEGAL)),
    }
    Ok(())
}

//! Gekko interpreter
//!
//! The interpreter is the reference implementation of every instruction. The
//! JIT falls back to [`execute_word`] for anything it does not translate.

use gk_memory::{GuestMemory, MemoryFault};

use crate::decoder::{decode, Instruction, Op, OpFlags, Unit};
use crate::instructions::{self, program_cause, ExecResult, Trap};
use crate::state::{spr, ExceptionFlags, MachineState, Msr};

/// Result of executing one instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepOutcome {
    /// Cycles charged
    pub cycles: u32,
    /// Pending exceptions or the MSR changed; the caller should run the
    /// exception check before the next instruction
    pub exception_check: bool,
}

/// DSISR reported for an alignment exception, built from the instruction
pub fn alignment_dsisr(word: u32) -> u32 {
    let bit = |k: u32| (word >> (31 - k)) & 1;
    let registers = (word >> 16) & 0x3FF;
    if word >> 26 == 31 {
        let low_xo = (bit(29) << 1) | bit(30);
        (low_xo << 15) | (bit(25) << 14) | (((word >> 7) & 0xF) << 10) | registers
    } else {
        (bit(5) << 14) | (((word >> 27) & 0xF) << 10) | registers
    }
}

/// Record a trap as a pending exception
pub fn raise_trap(state: &mut MachineState, trap: Trap, word: u32) {
    match trap {
        Trap::Memory(fault @ MemoryFault::Dsi { address, .. }) => {
            state.spr[spr::DAR] = address;
            state.spr[spr::DSISR] = fault.dsisr();
            state.exceptions |= ExceptionFlags::DSI;
        }
        Trap::Memory(MemoryFault::Isi { .. }) => state.exceptions |= ExceptionFlags::ISI,
        Trap::Memory(MemoryFault::Alignment { address }) => {
            state.spr[spr::DAR] = address;
            state.spr[spr::DSISR] = alignment_dsisr(word);
            state.exceptions |= ExceptionFlags::ALIGNMENT;
        }
        Trap::Program(cause) => {
            state.program_reason = cause;
            state.exceptions |= ExceptionFlags::PROGRAM;
        }
        Trap::FpUnavailable => state.exceptions |= ExceptionFlags::FPU_UNAVAILABLE,
        Trap::Syscall => state.exceptions |= ExceptionFlags::SYSCALL,
    }
}

/// Checks that apply before any handler runs
#[inline]
fn check_permissions(op: Op, state: &MachineState) -> ExecResult {
    let flags = op.info().flags;
    if op == Op::Illegal {
        return Err(Trap::Program(program_cause::ILLEGAL));
    }
    if flags.contains(OpFlags::FP) && state.msr & Msr::FP.bits() == 0 {
        return Err(Trap::FpUnavailable);
    }
    if flags.contains(OpFlags::PRIVILEGED) && state.msr & Msr::PR.bits() != 0 {
        return Err(Trap::Program(program_cause::PRIVILEGED));
    }
    Ok(())
}

/// Run the handler of a decoded instruction
#[inline]
pub fn dispatch(op: Op, state: &mut MachineState, mem: &mut GuestMemory, inst: Instruction) -> ExecResult {
    check_permissions(op, state)?;
    match op.info().unit {
        Unit::Integer => instructions::integer::execute(op, state, mem, inst),
        Unit::Branch => instructions::branch::execute(op, state, mem, inst),
        Unit::LoadStore => instructions::load_store::execute(op, state, mem, inst),
        Unit::Float => instructions::float::execute(op, state, mem, inst),
        Unit::Paired => instructions::paired::execute(op, state, mem, inst),
        Unit::System => instructions::system::execute(op, state, mem, inst),
    }
}

/// Execute `word` as the instruction at `state.pc`
///
/// On success the PC moves to `state.npc`. On a trap the PC stays on the
/// faulting instruction and the matching exception becomes pending.
pub fn execute_word(state: &mut MachineState, mem: &mut GuestMemory, word: u32) -> StepOutcome {
    let op = decode(word);
    let msr_before = state.msr;
    let exceptions_before = state.exceptions;

    state.npc = state.pc.wrapping_add(4);
    let result = dispatch(op, state, mem, Instruction(word));
    let cycles = op.info().cycles;
    state.cycles += cycles as u64;

    let trapped = match result {
        Ok(()) => {
            state.pc = state.npc;
            false
        }
        Err(trap) => {
            gk_core::cpu_trace!("{:?} at 0x{:08x} ({:?})", trap, state.pc, op);
            raise_trap(state, trap, word);
            true
        }
    };

    StepOutcome {
        cycles,
        // A DEC write must reach the checkpoint so the decrementer is re-armed
        exception_check: trapped
            || state.msr != msr_before
            || state.exceptions != exceptions_before
            || state.timers.dec_written,
    }
}

/// Interpreter engine
#[derive(Debug, Default)]
pub struct Interpreter {
    instructions: u64,
}

impl Interpreter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch and execute one instruction
    pub fn step(&mut self, state: &mut MachineState, mem: &mut GuestMemory) -> StepOutcome {
        self.instructions += 1;
        match mem.fetch(state.pc, state.instruction_mode()) {
            Ok(word) => execute_word(state, mem, word),
            Err(fault) => {
                gk_core::cpu_debug!("Instruction fetch fault at 0x{:08x}", fault.address());
                state.exceptions |= ExceptionFlags::ISI;
                state.cycles += 1;
                StepOutcome { cycles: 1, exception_check: true }
            }
        }
    }

    /// Execute an already-fetched word at `state.pc`
    pub fn execute(&mut self, state: &mut MachineState, mem: &mut GuestMemory, word: u32) -> StepOutcome {
        self.instructions += 1;
        execute_word(state, mem, word)
    }

    /// Instructions executed (including faulting fetches)
    pub fn instructions_executed(&self) -> u64 {
        self.instructions
    }
}

//! Gekko instruction implementations
//!
//! Each family module exposes an `execute` entry point that handles the
//! operations of its unit. Handlers run with `state.npc` already pointing at
//! the next sequential instruction; branches overwrite it. A handler that
//! fails returns a [`Trap`] and must not have modified architectural state.

pub mod branch;
pub mod float;
pub mod integer;
pub mod load_store;
pub mod paired;
pub mod system;

use gk_memory::MemoryFault;

use crate::decoder::Instruction;
use crate::state::MachineState;

/// SRR1 cause bits of a program exception
pub mod program_cause {
    pub const FLOATING_POINT: u32 = 0x0010_0000;
    pub const ILLEGAL: u32 = 0x0008_0000;
    pub const PRIVILEGED: u32 = 0x0004_0000;
    pub const TRAP: u32 = 0x0002_0000;
}

/// Why an instruction did not complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    /// Translation or alignment fault on a data access
    Memory(MemoryFault),
    /// Program exception with its SRR1 cause bits
    Program(u32),
    /// Floating point instruction with MSR.FP clear
    FpUnavailable,
    /// `sc`
    Syscall,
}

impl From<MemoryFault> for Trap {
    fn from(fault: MemoryFault) -> Self {
        Trap::Memory(fault)
    }
}

/// Result of a single instruction handler
pub type ExecResult = Result<(), Trap>;

/// `(rA|0)`
#[inline]
pub(crate) fn ra_or_zero(state: &MachineState, inst: Instruction) -> u32 {
    match inst.ra() {
        0 => 0,
        ra => state.gpr[ra],
    }
}

/// D-form effective address
#[inline]
pub(crate) fn ea_d(state: &MachineState, inst: Instruction) -> u32 {
    ra_or_zero(state, inst).wrapping_add(inst.simm() as u32)
}

/// D-form effective address of an update form
#[inline]
pub(crate) fn ea_du(state: &MachineState, inst: Instruction) -> u32 {
    state.gpr[inst.ra()].wrapping_add(inst.simm() as u32)
}

/// X-form effective address
#[inline]
pub(crate) fn ea_x(state: &MachineState, inst: Instruction) -> u32 {
    ra_or_zero(state, inst).wrapping_add(state.gpr[inst.rb()])
}

/// X-form effective address of an update form
#[inline]
pub(crate) fn ea_xu(state: &MachineState, inst: Instruction) -> u32 {
    state.gpr[inst.ra()].wrapping_add(state.gpr[inst.rb()])
}

/// Set CR1 from the FPSCR exception summary bits
#[inline]
pub(crate) fn update_cr1(state: &mut MachineState) {
    let field = state.fpscr >> 28;
    state.set_cr_field(1, field);
}

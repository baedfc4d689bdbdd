//! Debugger front end
//!
//! Runs on any thread and talks to the CPU thread through a [`CpuHandle`].
//! Every call blocks until the CPU thread has serviced it at a slice
//! boundary.

use gk_core::error::CpuError;
use gk_debug::{DisassembledInstruction, StackFrame};
use gk_ppc::MachineState;

use crate::control::{CpuHandle, CpuRequest, RegisterSnapshot};

/// Debugger attached to a running CPU
#[derive(Debug, Clone)]
pub struct Debugger {
    handle: CpuHandle,
}

impl Debugger {
    pub fn attach(handle: CpuHandle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &CpuHandle {
        &self.handle
    }

    /// Stop execution at the next slice boundary
    pub fn pause(&self) {
        self.handle.pause();
    }

    pub fn resume(&self) {
        self.handle.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.handle.is_paused()
    }

    /// Registers as of the last slice boundary, without a round trip
    pub fn snapshot(&self) -> RegisterSnapshot {
        self.handle.snapshot()
    }

    /// Add an execution breakpoint; returns its id
    pub fn add_breakpoint(&self, address: u32) -> Result<u32, CpuError> {
        self.handle.call(|reply| CpuRequest::AddBreakpoint { address, reply })
    }

    /// Remove the breakpoint at `address`; false when there was none
    pub fn remove_breakpoint(&self, address: u32) -> Result<bool, CpuError> {
        self.handle.call(|reply| CpuRequest::RemoveBreakpoint { address, reply })
    }

    /// Execute one instruction. The CPU must be paused.
    pub fn step(&self) -> Result<RegisterSnapshot, CpuError> {
        self.handle.call(|reply| CpuRequest::SingleStep { reply })?
    }

    /// Full architectural state
    pub fn registers(&self) -> Result<MachineState, CpuError> {
        self.handle
            .call(|reply| CpuRequest::ReadRegisters { reply })
            .map(|state| *state)
    }

    pub fn set_gpr(&self, index: usize, value: u32) -> Result<(), CpuError> {
        self.handle.call(|reply| CpuRequest::WriteGpr { index, value, reply })?
    }

    /// Redirect execution
    pub fn set_pc(&self, pc: u32) -> Result<(), CpuError> {
        self.handle.call(|reply| CpuRequest::WritePc { pc, reply })
    }

    /// Disassemble `count` instructions from `start` using the current
    /// instruction translation
    pub fn disassemble(&self, start: u32, count: usize) -> Result<Vec<DisassembledInstruction>, CpuError> {
        self.handle.call(|reply| CpuRequest::Disassemble { start, count, reply })
    }

    /// Walk the guest back chain
    pub fn callstack(&self) -> Result<Vec<StackFrame>, CpuError> {
        self.handle.call(|reply| CpuRequest::Callstack { reply })
    }
}

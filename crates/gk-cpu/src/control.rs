//! Cross-thread control of a running CPU
//!
//! The CPU thread owns all emulation state. Other threads talk to it through
//! a [`CpuHandle`]: a pause gate, a stop flag polled at slice boundaries, a
//! request channel serviced between slices and a register snapshot
//! republished after every slice.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};

use gk_core::config::CpuCore;
use gk_core::error::{CpuError, StateError};
use gk_core::InterruptKind;
use gk_debug::{DisassembledInstruction, StackFrame};
use gk_ppc::MachineState;

use crate::cpu::RunState;

/// Register view published by the CPU thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterSnapshot {
    pub pc: u32,
    pub gpr: [u32; 32],
    pub lr: u32,
    pub ctr: u32,
    pub cr: u32,
    pub xer: u32,
    pub msr: u32,
    pub cycles: u64,
    pub run_state: RunState,
}

impl RegisterSnapshot {
    pub fn capture(state: &MachineState, run_state: RunState) -> Self {
        Self {
            pc: state.pc,
            gpr: state.gpr,
            lr: state.lr(),
            ctr: state.ctr(),
            cr: state.cr,
            xer: state.xer,
            msr: state.msr,
            cycles: state.cycles,
            run_state,
        }
    }
}

impl Default for RegisterSnapshot {
    fn default() -> Self {
        Self::capture(&MachineState::new(), RunState::Stopped)
    }
}

/// Request serviced on the CPU thread between slices
pub enum CpuRequest {
    RaiseInterrupt(InterruptKind),
    ClearInterrupt(InterruptKind),
    AddBreakpoint { address: u32, reply: Sender<u32> },
    RemoveBreakpoint { address: u32, reply: Sender<bool> },
    /// Execute one instruction; only honoured while paused
    SingleStep { reply: Sender<Result<RegisterSnapshot, CpuError>> },
    ReadRegisters { reply: Sender<Box<MachineState>> },
    WriteGpr { index: usize, value: u32, reply: Sender<Result<(), CpuError>> },
    WritePc { pc: u32, reply: Sender<()> },
    SaveState { reply: Sender<Result<Vec<u8>, StateError>> },
    LoadState { bytes: Vec<u8>, reply: Sender<Result<(), StateError>> },
    SetEngine { core: CpuCore, reply: Sender<()> },
    Disassemble { start: u32, count: usize, reply: Sender<Vec<DisassembledInstruction>> },
    Callstack { reply: Sender<Vec<StackFrame>> },
}

impl std::fmt::Debug for CpuRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::RaiseInterrupt(_) => "RaiseInterrupt",
            Self::ClearInterrupt(_) => "ClearInterrupt",
            Self::AddBreakpoint { .. } => "AddBreakpoint",
            Self::RemoveBreakpoint { .. } => "RemoveBreakpoint",
            Self::SingleStep { .. } => "SingleStep",
            Self::ReadRegisters { .. } => "ReadRegisters",
            Self::WriteGpr { .. } => "WriteGpr",
            Self::WritePc { .. } => "WritePc",
            Self::SaveState { .. } => "SaveState",
            Self::LoadState { .. } => "LoadState",
            Self::SetEngine { .. } => "SetEngine",
            Self::Disassemble { .. } => "Disassemble",
            Self::Callstack { .. } => "Callstack",
        };
        f.write_str(name)
    }
}

/// State shared between the CPU thread and its handles
#[derive(Debug)]
pub struct ControlBlock {
    paused: Mutex<bool>,
    wake: Condvar,
    stop: AtomicBool,
    snapshot: RwLock<RegisterSnapshot>,
}

impl ControlBlock {
    pub fn new() -> Self {
        Self {
            paused: Mutex::new(false),
            wake: Condvar::new(),
            stop: AtomicBool::new(false),
            snapshot: RwLock::new(RegisterSnapshot::default()),
        }
    }

    pub fn pause(&self) {
        *self.paused.lock() = true;
    }

    pub fn resume(&self) {
        *self.paused.lock() = false;
        self.wake.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.lock()
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.wake.notify_all();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Clear a previous stop request before running again
    pub fn clear_stop(&self) {
        self.stop.store(false, Ordering::Release);
    }

    /// Wake the CPU thread so it services a freshly queued request
    pub fn notify(&self) {
        let _guard = self.paused.lock();
        self.wake.notify_all();
    }

    /// Block while paused, for at most `timeout`
    ///
    /// Returns true when the gate is open.
    pub fn wait_while_paused(&self, timeout: Duration) -> bool {
        let mut paused = self.paused.lock();
        if *paused && !self.stop_requested() {
            self.wake.wait_for(&mut paused, timeout);
        }
        !*paused
    }

    pub fn publish(&self, snapshot: RegisterSnapshot) {
        *self.snapshot.write() = snapshot;
    }

    pub fn snapshot(&self) -> RegisterSnapshot {
        self.snapshot.read().clone()
    }
}

impl Default for ControlBlock {
    fn default() -> Self {
        Self::new()
    }
}

/// Create the control block and request channel of a new CPU
pub fn control_pair() -> (Arc<ControlBlock>, Sender<CpuRequest>, Receiver<CpuRequest>) {
    let (tx, rx) = channel::unbounded();
    (Arc::new(ControlBlock::new()), tx, rx)
}

/// Cloneable handle for controlling a CPU from other threads
#[derive(Debug, Clone)]
pub struct CpuHandle {
    control: Arc<ControlBlock>,
    requests: Sender<CpuRequest>,
}

impl CpuHandle {
    pub(crate) fn new(control: Arc<ControlBlock>, requests: Sender<CpuRequest>) -> Self {
        Self { control, requests }
    }

    pub fn pause(&self) {
        self.control.pause();
        tracing::info!("CPU pause requested");
    }

    pub fn resume(&self) {
        self.control.resume();
        tracing::info!("CPU resume requested");
    }

    pub fn is_paused(&self) -> bool {
        self.control.is_paused()
    }

    /// Ask the CPU thread to leave its run loop at the next slice boundary
    pub fn stop(&self) {
        self.control.request_stop();
        tracing::info!("CPU stop requested");
    }

    /// Latest published registers
    pub fn snapshot(&self) -> RegisterSnapshot {
        self.control.snapshot()
    }

    /// Queue a request without waiting for it to be serviced
    pub fn post(&self, request: CpuRequest) -> Result<(), CpuError> {
        self.requests.send(request).map_err(|_| CpuError::ThreadGone)?;
        self.control.notify();
        Ok(())
    }

    /// Queue a request and block until the CPU thread replies
    pub fn call<T>(&self, make: impl FnOnce(Sender<T>) -> CpuRequest) -> Result<T, CpuError> {
        let (reply, response) = channel::bounded(1);
        self.post(make(reply))?;
        response.recv().map_err(|_| CpuError::ThreadGone)
    }

    pub fn raise_interrupt(&self, kind: InterruptKind) -> Result<(), CpuError> {
        self.post(CpuRequest::RaiseInterrupt(kind))
    }

    pub fn clear_interrupt(&self, kind: InterruptKind) -> Result<(), CpuError> {
        self.post(CpuRequest::ClearInterrupt(kind))
    }

    pub fn save_state(&self) -> Result<Result<Vec<u8>, StateError>, CpuError> {
        self.call(|reply| CpuRequest::SaveState { reply })
    }

    pub fn load_state(&self, bytes: Vec<u8>) -> Result<Result<(), StateError>, CpuError> {
        self.call(|reply| CpuRequest::LoadState { bytes, reply })
    }

    /// Swap the execution engine without touching guest state
    pub fn set_engine(&self, core: CpuCore) -> Result<(), CpuError> {
        self.call(|reply| CpuRequest::SetEngine { core, reply })
    }
}

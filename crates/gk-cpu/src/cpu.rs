//! CPU run-loop and core selector
//!
//! Execution proceeds in slices. Each slice checks for a breakpoint, runs
//! the active engine up to the next scheduled event, then reaches a
//! checkpoint: code invalidations are applied, the scheduler advances by the
//! cycles just executed, the decrementer is re-armed if DEC was written, the
//! external interrupt line is resampled and one pending exception is
//! delivered.
//!
//! The scheduler's tick counter and `MachineState::cycles` move together, so
//! `timing.ticks() == state.cycles` holds at every checkpoint.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender};

use gk_core::config::{Config, CpuConfig, CpuCore, JitConfig};
use gk_core::error::{CpuError, EmulatorError};
use gk_debug::{walk_callstack, BreakpointManager, GekkoDisassembler};
use gk_ppc::{check_exceptions, MachineState, StepOutcome};
use gk_timing::{CoreTiming, EventType, TimedCallback};

use crate::control::{control_pair, ControlBlock, CpuHandle, CpuRequest, RegisterSnapshot};
use crate::engine::ExecutionEngine;
use crate::machine::Machine;
use crate::timers;

/// How long a paused CPU thread sleeps between request polls
const REQUEST_POLL: Duration = Duration::from_millis(5);

/// Run-loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Stopped,
    Running,
    Stepping,
    BreakpointHit,
}

impl RunState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Stepping => "stepping",
            Self::BreakpointHit => "breakpoint",
        }
    }
}

/// Why [`Cpu::run_for`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The requested number of cycles elapsed
    CyclesElapsed,
    /// Execution reached an enabled breakpoint (not yet executed)
    Breakpoint(u32),
    /// A handle asked the CPU to stop
    StopRequested,
}

/// The emulated CPU together with its machine, scheduler and engine
pub struct Cpu {
    pub(crate) machine: Machine,
    pub(crate) timing: CoreTiming<Machine>,
    pub(crate) engine: ExecutionEngine,
    pub(crate) breakpoints: BreakpointManager,
    run_state: RunState,
    cpu_config: CpuConfig,
    jit_config: JitConfig,
    pub(crate) compress_savestates: bool,
    decrementer: EventType,
    /// Breakpoint execution stopped on; skipped once when execution resumes
    parked_on: Option<u32>,
    control: Arc<ControlBlock>,
    requests: Sender<CpuRequest>,
    inbox: Receiver<CpuRequest>,
}

impl Cpu {
    /// Create a CPU with a fresh machine
    pub fn new(config: &Config) -> Result<Self, EmulatorError> {
        let machine = Machine::new(&config.memory)?;
        Ok(Self::with_machine(machine, config))
    }

    /// Create a CPU around an existing machine
    pub fn with_machine(machine: Machine, config: &Config) -> Self {
        let mut timing = CoreTiming::new();
        let decrementer = timers::register_events(&mut timing);
        let (control, requests, inbox) = control_pair();
        let engine = ExecutionEngine::new(config.cpu.core, &config.jit);
        tracing::info!("CPU created with the {} engine", engine.name());

        let cpu = Self {
            machine,
            timing,
            engine,
            breakpoints: BreakpointManager::new(),
            run_state: RunState::Stopped,
            cpu_config: config.cpu.clone(),
            jit_config: config.jit.clone(),
            compress_savestates: config.savestate.compress,
            decrementer,
            parked_on: None,
            control,
            requests,
            inbox,
        };
        cpu.publish();
        cpu
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut Machine {
        &mut self.machine
    }

    pub fn state(&self) -> &MachineState {
        &self.machine.state
    }

    pub fn state_mut(&mut self) -> &mut MachineState {
        &mut self.machine.state
    }

    pub fn timing(&self) -> &CoreTiming<Machine> {
        &self.timing
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    pub fn breakpoints(&self) -> &BreakpointManager {
        &self.breakpoints
    }

    /// Handle for controlling this CPU from another thread
    pub fn handle(&self) -> CpuHandle {
        CpuHandle::new(Arc::clone(&self.control), self.requests.clone())
    }

    /// Register a device event with the scheduler
    pub fn register_event(&mut self, name: &str, callback: TimedCallback<Machine>) -> EventType {
        self.timing.register_event(name, callback)
    }

    /// Schedule a device event `cycles_from_now` cycles ahead
    pub fn schedule_event(&mut self, cycles_from_now: u64, event_type: EventType, userdata: u64) {
        self.timing.schedule_event(cycles_from_now, event_type, userdata);
    }

    /// Add an execution breakpoint, returning its id
    pub fn add_breakpoint(&mut self, address: u32) -> u32 {
        self.breakpoints.add(address)
    }

    /// Remove the breakpoint at `address`
    pub fn remove_breakpoint(&mut self, address: u32) -> bool {
        self.breakpoints.remove_at(address).is_some()
    }

    /// Swap the execution engine; guest state is left untouched
    pub fn set_engine(&mut self, core: CpuCore) {
        if self.engine.kind() == core {
            return;
        }
        self.engine.clear_cache(&mut self.machine.memory);
        self.engine = ExecutionEngine::new(core, &self.jit_config);
        tracing::info!("Switched to the {} engine", self.engine.name());
    }

    /// Execute exactly one instruction and reach a checkpoint
    pub fn single_step(&mut self) -> StepOutcome {
        self.run_state = RunState::Stepping;
        let Machine { state, memory, .. } = &mut self.machine;
        let step = self.engine.single_step(state, memory);
        self.checkpoint(step.cycles as u64, false);
        self.parked_on = None;
        self.run_state = RunState::Stopped;
        self.publish();
        step
    }

    /// Run for `cycles` CPU cycles, or until a breakpoint or stop request
    pub fn run_for(&mut self, cycles: u64) -> StopReason {
        self.run_state = RunState::Running;
        let target = self.machine.state.cycles.saturating_add(cycles);
        let slice_cycles = self.cpu_config.slice_cycles.max(1) as u64;

        let reason = loop {
            if self.control.stop_requested() {
                self.control.clear_stop();
                break StopReason::StopRequested;
            }
            let now = self.machine.state.cycles;
            if now >= target {
                break StopReason::CyclesElapsed;
            }
            if let Some(pc) = self.run_slice((target - now).min(slice_cycles)) {
                break StopReason::Breakpoint(pc);
            }
        };

        if self.run_state == RunState::Running {
            self.run_state = RunState::Stopped;
        }
        self.publish();
        reason
    }

    /// CPU thread body: run slices, service requests and honour the pause
    /// gate until a stop is requested
    ///
    /// Hitting a breakpoint closes the pause gate; a handle must resume.
    pub fn run_until_stopped(&mut self) {
        tracing::info!("CPU thread running ({})", self.engine.name());
        let slice_cycles = self.cpu_config.slice_cycles.max(1) as u64;

        loop {
            self.process_requests();
            if self.control.stop_requested() {
                self.control.clear_stop();
                break;
            }
            if self.control.is_paused() {
                if self.run_state == RunState::Running {
                    self.run_state = RunState::Stopped;
                    self.publish();
                }
                self.control.wait_while_paused(REQUEST_POLL);
                continue;
            }

            self.run_state = RunState::Running;
            if let Some(pc) = self.run_slice(slice_cycles) {
                tracing::info!("Breakpoint hit at 0x{:08x}", pc);
                self.control.pause();
            }
            self.publish();
        }

        self.process_requests();
        self.run_state = RunState::Stopped;
        self.publish();
        tracing::info!("CPU thread stopped at 0x{:08x}", self.machine.state.pc);
    }

    /// Move the CPU onto its own thread
    ///
    /// The thread runs [`Cpu::run_until_stopped`] and hands the CPU back
    /// through the join handle.
    pub fn spawn(self) -> std::io::Result<(CpuHandle, JoinHandle<Cpu>)> {
        let handle = self.handle();
        let thread = std::thread::Builder::new()
            .name("gekko-cpu".to_string())
            .spawn(move || {
                let mut cpu = self;
                cpu.run_until_stopped();
                cpu
            })?;
        Ok((handle, thread))
    }

    /// Run one slice of at most `max_cycles`; returns the breakpoint address
    /// when execution stopped on one
    fn run_slice(&mut self, max_cycles: u64) -> Option<u32> {
        if self.breakpoints.take_changed() {
            // Blocks are cut at breakpoint addresses; stale cuts must go
            self.engine.clear_cache(&mut self.machine.memory);
        }

        // Interrupts raised while stopped are taken before anything runs
        self.deliver_exceptions();

        let pc = self.machine.state.pc;
        if self.parked_on.take() != Some(pc) && self.breakpoints.check(pc).is_some() {
            gk_core::cpu_debug!("Breakpoint at 0x{:08x}", pc);
            self.parked_on = Some(pc);
            self.run_state = RunState::BreakpointHit;
            return Some(pc);
        }

        let budget = match self.timing.cycles_until_next_event() {
            Some(until_event) => until_event.min(max_cycles),
            None => max_cycles,
        }
        .max(1);

        let Machine { state, memory, .. } = &mut self.machine;
        let outcome = self
            .engine
            .compile_and_run(state, memory, budget, self.breakpoints.addresses());
        gk_core::cpu_trace!(
            "Slice: {} cycles, {} instructions, stop at 0x{:08x}",
            outcome.cycles,
            outcome.instructions,
            self.machine.state.pc
        );
        self.checkpoint(outcome.cycles, outcome.idle);
        None
    }

    fn checkpoint(&mut self, cycles: u64, idle: bool) {
        self.engine.sync_memory(&mut self.machine.memory);
        self.timing.advance(cycles, &mut self.machine);

        if idle && self.cpu_config.skip_idle_loops {
            if let Some(skip) = self.timing.cycles_until_next_event() {
                self.machine.state.cycles += skip;
                self.timing.idle(&mut self.machine);
            }
        }

        timers::reschedule_decrementer(&mut self.machine, &mut self.timing, self.decrementer);
        self.deliver_exceptions();
    }

    /// Resample the external line and deliver at most one exception
    fn deliver_exceptions(&mut self) {
        self.machine.sync_external_line();
        let Machine { state, memory, .. } = &mut self.machine;
        if state.exceptions.is_empty() {
            return;
        }
        if let Some(kind) = check_exceptions(state, memory) {
            // A handler entry moves execution off any parked breakpoint
            self.parked_on = None;
            gk_core::cpu_trace!("Delivered {:?}, continuing at 0x{:08x}", kind, state.pc);
        }
    }

    fn publish(&self) {
        self.control
            .publish(RegisterSnapshot::capture(&self.machine.state, self.run_state));
    }

    /// Service every queued request
    pub fn process_requests(&mut self) {
        while let Ok(request) = self.inbox.try_recv() {
            gk_core::cpu_trace!("Servicing {:?}", request);
            self.handle_request(request);
        }
    }

    // Replies are best effort: a requester that gave up has dropped its end
    fn handle_request(&mut self, request: CpuRequest) {
        match request {
            CpuRequest::RaiseInterrupt(kind) => self.machine.raise_interrupt(kind),
            CpuRequest::ClearInterrupt(kind) => self.machine.clear_interrupt(kind),
            CpuRequest::AddBreakpoint { address, reply } => {
                let _ = reply.send(self.add_breakpoint(address));
            }
            CpuRequest::RemoveBreakpoint { address, reply } => {
                let _ = reply.send(self.remove_breakpoint(address));
            }
            CpuRequest::SingleStep { reply } => {
                let result = if self.control.is_paused() {
                    self.single_step();
                    Ok(RegisterSnapshot::capture(&self.machine.state, self.run_state))
                } else {
                    Err(CpuError::NotStopped(self.run_state.name()))
                };
                let _ = reply.send(result);
            }
            CpuRequest::ReadRegisters { reply } => {
                let _ = reply.send(Box::new(self.machine.state.clone()));
            }
            CpuRequest::WriteGpr { index, value, reply } => {
                let result = match self.machine.state.gpr.get_mut(index) {
                    Some(reg) => {
                        *reg = value;
                        Ok(())
                    }
                    None => Err(CpuError::InvalidRegister(index)),
                };
                let _ = reply.send(result);
            }
            CpuRequest::WritePc { pc, reply } => {
                self.machine.state.pc = pc;
                self.machine.state.npc = pc.wrapping_add(4);
                self.parked_on = None;
                let _ = reply.send(());
            }
            CpuRequest::SaveState { reply } => {
                let _ = reply.send(self.save_state());
            }
            CpuRequest::LoadState { bytes, reply } => {
                let _ = reply.send(self.load_state(&bytes));
            }
            CpuRequest::SetEngine { core, reply } => {
                self.set_engine(core);
                let _ = reply.send(());
            }
            CpuRequest::Disassemble { start, count, reply } => {
                let mode = self.machine.state.instruction_mode();
                let listing = GekkoDisassembler::disassemble_range(&mut self.machine.memory, start, count, mode);
                let _ = reply.send(listing);
            }
            CpuRequest::Callstack { reply } => {
                let Machine { state, memory, .. } = &mut self.machine;
                let _ = reply.send(walk_callstack(state, memory));
            }
        }
        self.publish();
    }

    /// Forget the parked breakpoint (state was replaced wholesale)
    pub(crate) fn reset_parked(&mut self) {
        self.parked_on = None;
        self.run_state = RunState::Stopped;
    }
}

impl std::fmt::Debug for Cpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cpu")
            .field("machine", &self.machine)
            .field("engine", &self.engine)
            .field("run_state", &self.run_state)
            .field("ticks", &self.timing.ticks())
            .finish()
    }
}

//! Execution engines
//!
//! The interpreter and the JIT share one calling convention: run until a
//! cycle budget is spent, a breakpoint address comes up or the exception
//! check is due. The run-loop never needs to know which one is active.

use gk_core::config::{CpuCore, JitConfig};
use gk_jit::{Backend, Jit, RunOutcome};
use gk_memory::GuestMemory;
use gk_ppc::{Interpreter, MachineState, StepOutcome};

/// Active execution engine
pub enum ExecutionEngine {
    Interpreter(Interpreter),
    Jit(Box<Jit>),
}

impl ExecutionEngine {
    /// Build the engine selected by `core`
    pub fn new(core: CpuCore, config: &JitConfig) -> Self {
        match core {
            CpuCore::Interpreter => Self::Interpreter(Interpreter::new()),
            CpuCore::Jit => Self::Jit(Box::new(Jit::new(config, Backend::Threaded))),
            CpuCore::JitNative => Self::Jit(Box::new(Jit::new(config, Backend::Native))),
        }
    }

    /// The configuration value that selects this engine
    pub fn kind(&self) -> CpuCore {
        match self {
            Self::Interpreter(_) => CpuCore::Interpreter,
            Self::Jit(jit) => match jit.backend() {
                Backend::Threaded => CpuCore::Jit,
                Backend::Native => CpuCore::JitNative,
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Interpreter(_) => "interpreter",
            Self::Jit(jit) => match jit.backend() {
                Backend::Threaded => "jit (threaded)",
                Backend::Native => "jit (x86-64)",
            },
        }
    }

    /// The JIT, when it is the active engine
    pub fn jit(&self) -> Option<&Jit> {
        match self {
            Self::Jit(jit) => Some(&**jit),
            Self::Interpreter(_) => None,
        }
    }

    pub fn jit_mut(&mut self) -> Option<&mut Jit> {
        match self {
            Self::Jit(jit) => Some(&mut **jit),
            Self::Interpreter(_) => None,
        }
    }

    /// Run one dispatch unit: an instruction or a block
    pub fn step(&mut self, state: &mut MachineState, mem: &mut GuestMemory, breakpoints: &[u32]) -> RunOutcome {
        self.compile_and_run(state, mem, 1, breakpoints)
    }

    /// Execute until `budget` cycles have been spent or the caller must act
    ///
    /// Stops before a breakpoint address unless it is the very first
    /// instruction, after any instruction requesting the exception check,
    /// and (JIT only) after one iteration of a detected idle loop.
    pub fn compile_and_run(
        &mut self,
        state: &mut MachineState,
        mem: &mut GuestMemory,
        budget: u64,
        breakpoints: &[u32],
    ) -> RunOutcome {
        match self {
            Self::Jit(jit) => jit.run(state, mem, budget, breakpoints),
            Self::Interpreter(interp) => {
                let mut outcome = RunOutcome::default();
                while outcome.cycles < budget {
                    if outcome.instructions > 0 && breakpoints.contains(&state.pc) {
                        outcome.breakpoint = true;
                        break;
                    }
                    let step = interp.step(state, mem);
                    outcome.cycles += step.cycles as u64;
                    outcome.instructions += 1;
                    if step.exception_check {
                        outcome.exception_check = true;
                        break;
                    }
                }
                outcome
            }
        }
    }

    /// Execute exactly one instruction
    ///
    /// Both engines step through the interpreter; JIT blocks covering code
    /// the step wrote to are dropped at the next `sync_memory`.
    pub fn single_step(&mut self, state: &mut MachineState, mem: &mut GuestMemory) -> StepOutcome {
        match self {
            Self::Interpreter(interp) => interp.step(state, mem),
            Self::Jit(_) => Interpreter::new().step(state, mem),
        }
    }

    /// Apply pending code invalidations and translation changes
    pub fn sync_memory(&mut self, mem: &mut GuestMemory) {
        match self {
            Self::Jit(jit) => {
                jit.sync_memory(mem);
            }
            Self::Interpreter(_) => {
                // Nothing is cached; keep the invalidation log from growing
                if mem.code_written() {
                    mem.take_invalidations();
                }
                mem.take_translation_changed();
            }
        }
    }

    /// Drop every translation
    pub fn clear_cache(&mut self, mem: &mut GuestMemory) {
        if let Self::Jit(jit) = self {
            jit.clear_cache(mem);
        }
    }

    /// Drop translations of a physical RAM range, returning how many went away
    pub fn invalidate_range(&mut self, offset: u32, len: u32) -> usize {
        match self {
            Self::Jit(jit) => jit.invalidate_range(offset, len),
            Self::Interpreter(_) => 0,
        }
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interpreter(interp) => f
                .debug_struct("Interpreter")
                .field("instructions", &interp.instructions_executed())
                .finish(),
            Self::Jit(jit) => std::fmt::Debug::fmt(&**jit, f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gk_ppc::asm::*;

    const ENTRY: u32 = 0x3100;

    fn create_test_env(program: &[u32]) -> (MachineState, GuestMemory) {
        let mut mem = GuestMemory::new(0x0180_0000).unwrap();
        mem.write_physical(ENTRY, &assemble(program)).unwrap();
        let mut state = MachineState::new();
        state.pc = ENTRY;
        (state, mem)
    }

    #[test]
    fn test_engine_kinds() {
        let config = JitConfig::default();
        assert_eq!(ExecutionEngine::new(CpuCore::Interpreter, &config).kind(), CpuCore::Interpreter);
        assert_eq!(ExecutionEngine::new(CpuCore::Jit, &config).kind(), CpuCore::Jit);
        let native = ExecutionEngine::new(CpuCore::JitNative, &config);
        assert!(native.jit().is_some());
    }

    #[test]
    fn test_interpreter_stops_at_breakpoint() {
        let program = [li(3, 1), li(4, 2), li(5, 3), b(0)];
        let (mut state, mut mem) = create_test_env(&program);
        let mut engine = ExecutionEngine::new(CpuCore::Interpreter, &JitConfig::default());

        let outcome = engine.compile_and_run(&mut state, &mut mem, 1000, &[ENTRY + 8]);
        assert!(outcome.breakpoint);
        assert_eq!(outcome.instructions, 2);
        assert_eq!(state.pc, ENTRY + 8);

        // The breakpoint at the first instruction does not stop it again
        let outcome = engine.compile_and_run(&mut state, &mut mem, 2, &[ENTRY + 8]);
        assert_eq!(state.gpr[5], 3);
        assert_eq!(outcome.cycles, 2);
    }

    #[test]
    fn test_single_step_under_jit() {
        let program = [li(3, 7), addi(3, 3, 1)];
        let (mut state, mut mem) = create_test_env(&program);
        let mut engine = ExecutionEngine::new(CpuCore::Jit, &JitConfig::default());
        let step = engine.single_step(&mut state, &mut mem);
        assert_eq!(step.cycles, 1);
        assert_eq!(state.gpr[3], 7);
        assert_eq!(state.pc, ENTRY + 4);
        assert_eq!(engine.invalidate_range(0, 0x1000), 0);
    }
}

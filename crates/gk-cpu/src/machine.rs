//! The machine a CPU runs on: architectural state, guest memory and the
//! interrupt lines devices drive

use std::sync::Arc;

use gk_core::config::MemoryConfig;
use gk_core::error::MemoryError;
use gk_core::{InterruptKind, InterruptLines};
use gk_memory::GuestMemory;
use gk_ppc::exception::set_external_line;
use gk_ppc::MachineState;

use crate::pi;

/// Architectural state plus everything it can address
pub struct Machine {
    pub state: MachineState,
    pub memory: GuestMemory,
    interrupts: Arc<InterruptLines>,
}

impl Machine {
    /// Create a machine with freshly allocated memory
    pub fn new(config: &MemoryConfig) -> Result<Self, MemoryError> {
        Self::with_memory(GuestMemory::from_config(config)?)
    }

    /// Wrap existing memory; the processor interface registers are mapped
    /// onto its MMIO bus
    pub fn with_memory(mut memory: GuestMemory) -> Result<Self, MemoryError> {
        let interrupts = Arc::new(InterruptLines::new());
        pi::register(&mut memory, Arc::clone(&interrupts))?;
        Ok(Self {
            state: MachineState::new(),
            memory,
            interrupts,
        })
    }

    /// Shared handle for device code living outside the CPU thread
    pub fn interrupts(&self) -> Arc<InterruptLines> {
        Arc::clone(&self.interrupts)
    }

    /// Assert an interrupt cause
    pub fn raise_interrupt(&mut self, kind: InterruptKind) {
        self.interrupts.raise(kind);
        self.sync_external_line();
    }

    /// Deassert an interrupt cause
    pub fn clear_interrupt(&mut self, kind: InterruptKind) {
        self.interrupts.clear(kind);
        self.sync_external_line();
    }

    /// Mirror `cause & mask` into the external exception bit
    pub fn sync_external_line(&mut self) {
        set_external_line(&mut self.state, self.interrupts.is_asserted());
    }
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("pc", &format_args!("0x{:08x}", self.state.pc))
            .field("cycles", &self.state.cycles)
            .field("ram_size", &self.memory.ram_size())
            .field("interrupt_cause", &format_args!("0x{:08x}", self.interrupts.cause()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gk_ppc::ExceptionFlags;

    fn create_test_env() -> Machine {
        Machine::new(&MemoryConfig::default()).unwrap()
    }

    #[test]
    fn test_interrupt_line_follows_mask() {
        let mut machine = create_test_env();
        machine.raise_interrupt(InterruptKind::VI);
        assert!(machine.state.exceptions.contains(ExceptionFlags::EXTERNAL));

        machine.interrupts().set_mask(0);
        machine.sync_external_line();
        assert!(!machine.state.exceptions.contains(ExceptionFlags::EXTERNAL));

        machine.interrupts().set_mask(u32::MAX);
        machine.clear_interrupt(InterruptKind::VI);
        assert!(!machine.state.exceptions.contains(ExceptionFlags::EXTERNAL));
    }

    #[test]
    fn test_shared_lines_are_the_same() {
        let machine = create_test_env();
        let lines = machine.interrupts();
        lines.raise(InterruptKind::SI);
        assert_eq!(machine.interrupts().cause(), InterruptKind::SI.bits());
    }
}

//! Exception delivery
//!
//! Pending exceptions accumulate in `MachineState::exceptions`. Delivery picks
//! the highest-priority pending one, saves SRR0/SRR1, switches the MSR to the
//! handler context and redirects the PC to the vector. At most one exception
//! is delivered per check.

use gk_memory::{GuestMemory, Reservation};

use crate::state::{spr, ExceptionFlags, MachineState, Msr};

/// MSR bits copied into SRR1
pub const SRR1_MSR_MASK: u32 = 0x87C0_FFFF;
/// MSR bits cleared on exception entry
pub const MSR_CLEARED_ON_ENTRY: u32 = 0x0004_EF36;
/// SRR1 bit reported for an instruction fetch with no translation
pub const SRR1_ISI_NOT_FOUND: u32 = 1 << 30;
/// Vector base when MSR.IP is set
pub const HIGH_VECTOR_BASE: u32 = 0xFFF0_0000;

/// Deliverable exception types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    Dsi,
    Isi,
    External,
    Alignment,
    Program,
    FpUnavailable,
    Decrementer,
    Syscall,
    PerformanceMonitor,
}

impl ExceptionKind {
    /// Vector offset
    pub const fn vector(self) -> u32 {
        match self {
            Self::Dsi => 0x300,
            Self::Isi => 0x400,
            Self::External => 0x500,
            Self::Alignment => 0x600,
            Self::Program => 0x700,
            Self::FpUnavailable => 0x800,
            Self::Decrementer => 0x900,
            Self::Syscall => 0xC00,
            Self::PerformanceMonitor => 0xF00,
        }
    }

    /// Pending flag that requests this exception
    pub const fn flag(self) -> ExceptionFlags {
        match self {
            Self::Dsi => ExceptionFlags::DSI,
            Self::Isi => ExceptionFlags::ISI,
            Self::External => ExceptionFlags::EXTERNAL,
            Self::Alignment => ExceptionFlags::ALIGNMENT,
            Self::Program => ExceptionFlags::PROGRAM,
            Self::FpUnavailable => ExceptionFlags::FPU_UNAVAILABLE,
            Self::Decrementer => ExceptionFlags::DECREMENTER,
            Self::Syscall => ExceptionFlags::SYSCALL,
            Self::PerformanceMonitor => ExceptionFlags::PERFORMANCE_MONITOR,
        }
    }
}

/// Synchronous exceptions in delivery priority order
const SYNCHRONOUS_ORDER: [ExceptionKind; 6] = [
    ExceptionKind::Isi,
    ExceptionKind::Program,
    ExceptionKind::Syscall,
    ExceptionKind::FpUnavailable,
    ExceptionKind::Dsi,
    ExceptionKind::Alignment,
];

/// Asynchronous exceptions in delivery priority order (require MSR.EE)
const ASYNCHRONOUS_ORDER: [ExceptionKind; 3] = [
    ExceptionKind::External,
    ExceptionKind::PerformanceMonitor,
    ExceptionKind::Decrementer,
];

/// Switch to the handler of `kind`
fn enter(state: &mut MachineState, mem: &mut GuestMemory, kind: ExceptionKind, srr0: u32, srr1_bits: u32) {
    state.spr[spr::SRR0] = srr0;
    state.spr[spr::SRR1] = (state.msr & SRR1_MSR_MASK) | srr1_bits;

    let ile = state.msr & Msr::ILE.bits() != 0;
    state.msr &= !MSR_CLEARED_ON_ENTRY;
    if ile {
        state.msr |= Msr::LE.bits();
    } else {
        state.msr &= !Msr::LE.bits();
    }

    let base = if state.msr & Msr::IP.bits() != 0 { HIGH_VECTOR_BASE } else { 0 };
    state.pc = base | kind.vector();
    state.npc = state.pc.wrapping_add(4);
    mem.set_reservation(Reservation::new());

    gk_core::cpu_debug!(
        "{:?} exception: SRR0=0x{:08x} SRR1=0x{:08x} -> 0x{:08x}",
        kind,
        srr0,
        state.spr[spr::SRR1],
        state.pc
    );
}

/// Deliver the highest-priority pending exception, if any can be delivered
///
/// Synchronous exceptions are always delivered; external, performance
/// monitor and decrementer exceptions wait for MSR.EE. The external flag
/// mirrors a level-triggered line and is left set.
pub fn check_exceptions(state: &mut MachineState, mem: &mut GuestMemory) -> Option<ExceptionKind> {
    let pending = state.exceptions;
    if pending.is_empty() {
        return None;
    }

    if pending.intersects(ExceptionFlags::SYNCHRONOUS) {
        for kind in SYNCHRONOUS_ORDER {
            if !pending.contains(kind.flag()) {
                continue;
            }
            let (srr0, bits) = match kind {
                ExceptionKind::Isi => (state.pc, SRR1_ISI_NOT_FOUND),
                ExceptionKind::Program => (state.pc, std::mem::take(&mut state.program_reason)),
                // The syscall returns to the instruction after `sc`
                ExceptionKind::Syscall => (state.npc, 0),
                _ => (state.pc, 0),
            };
            state.exceptions.remove(kind.flag());
            enter(state, mem, kind, srr0, bits);
            return Some(kind);
        }
    }

    check_external_exceptions(state, mem)
}

/// Deliver a pending asynchronous exception when MSR.EE allows it
pub fn check_external_exceptions(state: &mut MachineState, mem: &mut GuestMemory) -> Option<ExceptionKind> {
    if state.msr & Msr::EE.bits() == 0 {
        return None;
    }
    for kind in ASYNCHRONOUS_ORDER {
        if !state.exceptions.contains(kind.flag()) {
            continue;
        }
        if kind != ExceptionKind::External {
            state.exceptions.remove(kind.flag());
        }
        let srr0 = state.pc;
        enter(state, mem, kind, srr0, 0);
        return Some(kind);
    }
    None
}

/// Drive the external interrupt line
pub fn set_external_line(state: &mut MachineState, asserted: bool) {
    state.exceptions.set(ExceptionFlags::EXTERNAL, asserted);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_env() -> (MachineState, GuestMemory) {
        let mut state = MachineState::new();
        state.pc = 0x8000_1000;
        state.npc = 0x8000_1004;
        state.msr = (Msr::EE | Msr::IR | Msr::DR | Msr::FP | Msr::ME).bits();
        (state, GuestMemory::new(0x0180_0000).unwrap())
    }

    #[test]
    fn test_no_pending() {
        let (mut state, mut mem) = create_test_env();
        assert_eq!(check_exceptions(&mut state, &mut mem), None);
        assert_eq!(state.pc, 0x8000_1000);
    }

    #[test]
    fn test_syscall_saves_next_pc() {
        let (mut state, mut mem) = create_test_env();
        let msr = state.msr;
        state.exceptions |= ExceptionFlags::SYSCALL;
        assert_eq!(check_exceptions(&mut state, &mut mem), Some(ExceptionKind::Syscall));
        assert_eq!(state.spr[spr::SRR0], 0x8000_1004);
        assert_eq!(state.spr[spr::SRR1], msr & SRR1_MSR_MASK);
        assert_eq!(state.pc, 0xC00);
        assert_eq!(state.msr & (Msr::EE | Msr::IR | Msr::DR | Msr::FP).bits(), 0);
        assert_ne!(state.msr & Msr::ME.bits(), 0);
        assert!(state.exceptions.is_empty());
    }

    #[test]
    fn test_synchronous_priority() {
        let (mut state, mut mem) = create_test_env();
        state.exceptions |= ExceptionFlags::DSI | ExceptionFlags::PROGRAM | ExceptionFlags::DECREMENTER;
        state.program_reason = 0x0002_0000;
        assert_eq!(check_exceptions(&mut state, &mut mem), Some(ExceptionKind::Program));
        assert_eq!(state.spr[spr::SRR1] & 0x0002_0000, 0x0002_0000);
        assert_eq!(state.spr[spr::SRR0], 0x8000_1000);
        // DSI is still pending and EE is now off, so the decrementer waits
        assert!(state.exceptions.contains(ExceptionFlags::DSI));
        assert_eq!(check_exceptions(&mut state, &mut mem), Some(ExceptionKind::Dsi));
        assert_eq!(check_exceptions(&mut state, &mut mem), None);
        assert!(state.exceptions.contains(ExceptionFlags::DECREMENTER));
    }

    #[test]
    fn test_external_requires_ee_and_stays_pending() {
        let (mut state, mut mem) = create_test_env();
        set_external_line(&mut state, true);
        state.msr &= !Msr::EE.bits();
        assert_eq!(check_exceptions(&mut state, &mut mem), None);

        state.msr |= Msr::EE.bits();
        assert_eq!(check_exceptions(&mut state, &mut mem), Some(ExceptionKind::External));
        assert_eq!(state.pc, 0x500);
        assert!(state.exceptions.contains(ExceptionFlags::EXTERNAL));
    }

    #[test]
    fn test_high_vectors_and_reservation() {
        let (mut state, mut mem) = create_test_env();
        state.msr |= Msr::IP.bits();
        mem.reserve(0x100);
        state.exceptions |= ExceptionFlags::DECREMENTER;
        assert_eq!(check_exceptions(&mut state, &mut mem), Some(ExceptionKind::Decrementer));
        assert_eq!(state.pc, 0xFFF0_0900);
        assert_eq!(mem.reservation().line(), None);
    }
}

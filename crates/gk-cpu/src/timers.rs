//! Decrementer event
//!
//! The time base and DEC are derived from retired cycles (see
//! `MachineState::timebase`); only the decrementer needs a scheduler event,
//! armed whenever the guest writes DEC.

use gk_ppc::state::TIMER_RATIO;
use gk_ppc::ExceptionFlags;
use gk_timing::{CoreTiming, EventType};

use crate::machine::Machine;

/// Scheduler name of the decrementer event
pub const DECREMENTER_EVENT: &str = "Decrementer";

fn decrementer_fired(machine: &mut Machine, _timing: &mut CoreTiming<Machine>, _userdata: u64, late: u64) {
    gk_core::timing_trace!("Decrementer underflow ({} cycles late)", late);
    machine.state.exceptions |= ExceptionFlags::DECREMENTER;
}

/// Register the timer events
pub fn register_events(timing: &mut CoreTiming<Machine>) -> EventType {
    timing.register_event(DECREMENTER_EVENT, decrementer_fired)
}

/// Re-arm the decrementer after a guest write to DEC
///
/// A DEC that is already negative is left alone; the write itself raised the
/// exception when bit 0 went from clear to set.
pub fn reschedule_decrementer(machine: &mut Machine, timing: &mut CoreTiming<Machine>, event: EventType) {
    if !std::mem::take(&mut machine.state.timers.dec_written) {
        return;
    }
    timing.remove_event(event);
    let dec = machine.state.decrementer();
    if dec & 0x8000_0000 == 0 {
        timing.schedule_event(dec as u64 * TIMER_RATIO, event, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gk_core::config::MemoryConfig;

    fn create_test_env() -> (Machine, CoreTiming<Machine>, EventType) {
        let machine = Machine::new(&MemoryConfig::default()).unwrap();
        let mut timing = CoreTiming::new();
        let event = register_events(&mut timing);
        (machine, timing, event)
    }

    #[test]
    fn test_decrementer_fires_after_dec_ticks() {
        let (mut machine, mut timing, event) = create_test_env();
        machine.state.write_decrementer(10);
        reschedule_decrementer(&mut machine, &mut timing, event);
        assert!(!machine.state.timers.dec_written);
        assert_eq!(timing.cycles_until_next_event(), Some(10 * TIMER_RATIO));

        timing.advance(10 * TIMER_RATIO - 1, &mut machine);
        assert!(!machine.state.exceptions.contains(ExceptionFlags::DECREMENTER));
        timing.advance(1, &mut machine);
        assert!(machine.state.exceptions.contains(ExceptionFlags::DECREMENTER));
    }

    #[test]
    fn test_rewrite_replaces_pending_event() {
        let (mut machine, mut timing, event) = create_test_env();
        machine.state.write_decrementer(100);
        reschedule_decrementer(&mut machine, &mut timing, event);
        machine.state.write_decrementer(5);
        reschedule_decrementer(&mut machine, &mut timing, event);
        assert_eq!(timing.pending_events().len(), 1);
        assert_eq!(timing.cycles_until_next_event(), Some(5 * TIMER_RATIO));

        machine.state.write_decrementer(0x8000_0000);
        reschedule_decrementer(&mut machine, &mut timing, event);
        assert!(!timing.is_scheduled(event));
    }
}

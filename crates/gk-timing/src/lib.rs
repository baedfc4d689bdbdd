//! CoreTiming event scheduler for oxidized-gekko
//!
//! Hardware models schedule callbacks a number of CPU cycles into the
//! future. The run-loop reports executed cycles with
//! [`CoreTiming::advance`], which fires everything that became due in
//! (due cycle, insertion order) order.

pub mod scheduler;

pub use scheduler::{CoreTiming, EventType, PendingEvent, TimedCallback, TimingSnapshot};

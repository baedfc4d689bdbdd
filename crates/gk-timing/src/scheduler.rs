//! Event queue and global tick counter

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use gk_core::error::StateError;
use gk_core::savestate::{expect_consumed, ReadLeExt, WriteLeExt};

/// Event callback
///
/// Receives the context, the scheduler itself (so it can schedule follow-up
/// events), the userdata passed at scheduling time and how many cycles late
/// the event fires.
pub type TimedCallback<C> = fn(&mut C, &mut CoreTiming<C>, u64, u64);

/// Section payload version written by [`CoreTiming::save`]
pub const TIMING_SECTION_VERSION: u16 = 1;

const MAX_EVENT_NAME: usize = 256;

/// Handle of a registered event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventType(u32);

impl EventType {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

struct Registration<C> {
    name: String,
    callback: TimedCallback<C>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Event {
    due: u64,
    seq: u64,
    event_type: EventType,
    userdata: u64,
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A queued event as seen from outside the scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEvent {
    pub name: String,
    pub event_type: EventType,
    pub due: u64,
    pub userdata: u64,
}

/// Scheduler contents decoded from a savestate, not yet applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingSnapshot {
    ticks: u64,
    next_seq: u64,
    events: Vec<(EventType, u64, u64, u64)>,
}

impl TimingSnapshot {
    /// Global tick count captured in the snapshot
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Number of queued events captured in the snapshot
    pub fn event_count(&self) -> usize {
        self.events.len()
    }
}

/// Cycle-driven event scheduler
///
/// `C` is the context handed to callbacks, typically the machine the events
/// act on. The scheduler does not own it so callbacks can borrow both.
pub struct CoreTiming<C> {
    registrations: Vec<Registration<C>>,
    queue: BinaryHeap<Reverse<Event>>,
    ticks: u64,
    next_seq: u64,
}

impl<C> CoreTiming<C> {
    pub fn new() -> Self {
        Self {
            registrations: Vec::new(),
            queue: BinaryHeap::new(),
            ticks: 0,
            next_seq: 0,
        }
    }

    /// Register an event type
    ///
    /// Names identify events across savestates, so registering the same name
    /// twice returns the existing handle and keeps the first callback.
    pub fn register_event(&mut self, name: &str, callback: TimedCallback<C>) -> EventType {
        if let Some(existing) = self.event_type(name) {
            tracing::warn!(target: "timing", "Event type '{}' registered twice", name);
            return existing;
        }
        let event_type = EventType(self.registrations.len() as u32);
        self.registrations.push(Registration {
            name: name.to_string(),
            callback,
        });
        gk_core::timing_debug!("Registered event type '{}' as {:?}", name, event_type);
        event_type
    }

    /// Look up a registered event type by name
    pub fn event_type(&self, name: &str) -> Option<EventType> {
        self.registrations
            .iter()
            .position(|r| r.name == name)
            .map(|i| EventType(i as u32))
    }

    /// Name of a registered event type
    pub fn event_name(&self, event_type: EventType) -> Option<&str> {
        self.registrations
            .get(event_type.index())
            .map(|r| r.name.as_str())
    }

    /// Queue `event_type` to fire `cycles_from_now` cycles after the current tick
    ///
    /// An event scheduled from inside a callback never fires during the
    /// `advance` that ran the callback, even with a delay of zero.
    pub fn schedule_event(&mut self, cycles_from_now: u64, event_type: EventType, userdata: u64) {
        if event_type.index() >= self.registrations.len() {
            tracing::error!(target: "timing", "Scheduling unregistered event type {:?}", event_type);
            return;
        }
        let event = Event {
            due: self.ticks.saturating_add(cycles_from_now),
            seq: self.next_seq,
            event_type,
            userdata,
        };
        self.next_seq += 1;
        gk_core::timing_trace!(
            "Schedule '{}' at {} (userdata {:#x})",
            self.registrations[event_type.index()].name,
            event.due,
            userdata
        );
        self.queue.push(Reverse(event));
    }

    /// Drop every queued instance of `event_type`
    pub fn remove_event(&mut self, event_type: EventType) {
        self.queue.retain(|Reverse(e)| e.event_type != event_type);
    }

    /// Move time forward by `cycles` and fire every event that became due
    ///
    /// Events are popped one at a time in (due cycle, insertion order) order,
    /// so a callback that removes a later event keeps it from firing. Events
    /// queued by callbacks wait for the next `advance`.
    pub fn advance(&mut self, cycles: u64, ctx: &mut C) {
        self.ticks += cycles;
        let seq_limit = self.next_seq;

        while let Some(Reverse(event)) = self.queue.peek() {
            if event.due > self.ticks || event.seq >= seq_limit {
                break;
            }
            let event = *event;
            self.queue.pop();

            let callback = self.registrations[event.event_type.index()].callback;
            let late = self.ticks - event.due;
            gk_core::timing_trace!(
                "Fire '{}' due {} at {} ({} late)",
                self.registrations[event.event_type.index()].name,
                event.due,
                self.ticks,
                late
            );
            callback(ctx, self, event.userdata, late);
        }
    }

    /// Skip forward to the next queued event and fire it
    ///
    /// Returns the number of cycles skipped; zero when the queue is empty.
    pub fn idle(&mut self, ctx: &mut C) -> u64 {
        match self.cycles_until_next_event() {
            Some(skip) => {
                gk_core::timing_debug!("Idle skip of {} cycles at {}", skip, self.ticks);
                self.advance(skip, ctx);
                skip
            }
            None => 0,
        }
    }

    /// Global tick count
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Cycles until the earliest queued event, zero when it is already due
    pub fn cycles_until_next_event(&self) -> Option<u64> {
        self.queue
            .peek()
            .map(|Reverse(e)| e.due.saturating_sub(self.ticks))
    }

    /// Queued events in firing order
    pub fn pending_events(&self) -> Vec<PendingEvent> {
        let mut events: Vec<Event> = self.queue.iter().map(|Reverse(e)| *e).collect();
        events.sort();
        events
            .into_iter()
            .map(|e| PendingEvent {
                name: self.registrations[e.event_type.index()].name.clone(),
                event_type: e.event_type,
                due: e.due,
                userdata: e.userdata,
            })
            .collect()
    }

    /// True when `event_type` has at least one queued instance
    pub fn is_scheduled(&self, event_type: EventType) -> bool {
        self.queue.iter().any(|Reverse(e)| e.event_type == event_type)
    }

    /// Serialize the tick counter and the queue, naming event types
    pub fn save(&self, out: &mut Vec<u8>) -> Result<(), StateError> {
        let mut events: Vec<Event> = self.queue.iter().map(|Reverse(e)| *e).collect();
        events.sort();

        out.write_u64_le(self.ticks)?;
        out.write_u64_le(self.next_seq)?;
        out.write_u32_le(events.len() as u32)?;
        for event in events {
            out.write_string_u32(&self.registrations[event.event_type.index()].name)?;
            out.write_u64_le(event.due)?;
            out.write_u64_le(event.seq)?;
            out.write_u64_le(event.userdata)?;
        }
        Ok(())
    }

    /// Decode a payload written by [`CoreTiming::save`] without touching the queue
    ///
    /// Every event name must be registered in this scheduler.
    pub fn parse_snapshot(&self, mut payload: &[u8]) -> Result<TimingSnapshot, StateError> {
        let ticks = payload.read_u64_le()?;
        let next_seq = payload.read_u64_le()?;
        let count = payload.read_u32_le()? as usize;

        let mut events = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let name = payload.read_string_u32(MAX_EVENT_NAME)?;
            let event_type = self
                .event_type(&name)
                .ok_or(StateError::UnknownEvent(name))?;
            let due = payload.read_u64_le()?;
            let seq = payload.read_u64_le()?;
            let userdata = payload.read_u64_le()?;
            if seq >= next_seq {
                return Err(StateError::Corrupt(format!(
                    "event sequence {seq} not below counter {next_seq}"
                )));
            }
            events.push((event_type, due, seq, userdata));
        }
        expect_consumed(payload, "TIME")?;

        Ok(TimingSnapshot {
            ticks,
            next_seq,
            events,
        })
    }

    /// Replace the queue and tick counter with a parsed snapshot
    pub fn restore(&mut self, snapshot: TimingSnapshot) {
        self.ticks = snapshot.ticks;
        self.next_seq = snapshot.next_seq;
        self.queue = snapshot
            .events
            .into_iter()
            .map(|(event_type, due, seq, userdata)| {
                Reverse(Event {
                    due,
                    seq,
                    event_type,
                    userdata,
                })
            })
            .collect();
        gk_core::timing_debug!("Restored scheduler at tick {} with {} events", self.ticks, self.queue.len());
    }
}

impl<C> Default for CoreTiming<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> std::fmt::Debug for CoreTiming<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreTiming")
            .field("ticks", &self.ticks)
            .field("events", &self.queue.len())
            .field("types", &self.registrations.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Log {
        fired: Vec<(u64, u64, u64)>,
    }

    fn record(ctx: &mut Log, timing: &mut CoreTiming<Log>, userdata: u64, late: u64) {
        ctx.fired.push((timing.ticks(), userdata, late));
    }

    fn create_test_env() -> (CoreTiming<Log>, EventType, Log) {
        let mut timing = CoreTiming::new();
        let ev = timing.register_event("record", record);
        (timing, ev, Log::default())
    }

    #[test]
    fn test_fires_after_exact_cycles() {
        let (mut timing, ev, mut log) = create_test_env();
        timing.schedule_event(100, ev, 7);
        timing.advance(99, &mut log);
        assert!(log.fired.is_empty());
        timing.advance(1, &mut log);
        assert_eq!(log.fired, vec![(100, 7, 0)]);
    }

    #[test]
    fn test_late_cycles_reported() {
        let (mut timing, ev, mut log) = create_test_env();
        timing.schedule_event(10, ev, 1);
        timing.advance(25, &mut log);
        assert_eq!(log.fired, vec![(25, 1, 15)]);
    }

    #[test]
    fn test_duplicate_registration() {
        let (mut timing, ev, _) = create_test_env();
        assert_eq!(timing.register_event("record", record), ev);
        assert_eq!(timing.event_name(ev), Some("record"));
    }

    #[test]
    fn test_remove_event() {
        let (mut timing, ev, mut log) = create_test_env();
        timing.schedule_event(5, ev, 0);
        timing.schedule_event(6, ev, 1);
        assert!(timing.is_scheduled(ev));
        timing.remove_event(ev);
        assert!(!timing.is_scheduled(ev));
        timing.advance(10, &mut log);
        assert!(log.fired.is_empty());
    }

    #[derive(Default)]
    struct Script {
        fired: Vec<(&'static str, u64)>,
        victim: Option<EventType>,
        tick: Option<EventType>,
        rearms: u32,
    }

    fn killer(ctx: &mut Script, timing: &mut CoreTiming<Script>, _userdata: u64, _late: u64) {
        ctx.fired.push(("killer", timing.ticks()));
        if let Some(victim) = ctx.victim {
            timing.remove_event(victim);
        }
    }

    fn victim(ctx: &mut Script, timing: &mut CoreTiming<Script>, _userdata: u64, _late: u64) {
        ctx.fired.push(("victim", timing.ticks()));
    }

    fn periodic(ctx: &mut Script, timing: &mut CoreTiming<Script>, userdata: u64, _late: u64) {
        ctx.fired.push(("tick", timing.ticks()));
        if ctx.rearms > 0 {
            ctx.rearms -= 1;
            if let Some(tick) = ctx.tick {
                timing.schedule_event(userdata, tick, userdata);
            }
        }
    }

    #[test]
    fn test_event_removed_by_earlier_callback_does_not_fire() {
        let mut timing = CoreTiming::new();
        let k = timing.register_event("killer", killer);
        let v = timing.register_event("victim", victim);
        let mut script = Script {
            victim: Some(v),
            ..Script::default()
        };
        timing.schedule_event(10, k, 0);
        timing.schedule_event(20, v, 0);

        timing.advance(30, &mut script);
        assert_eq!(script.fired, vec![("killer", 30)]);
        assert!(!timing.is_scheduled(v));
    }

    #[test]
    fn test_removal_of_same_tick_event_from_callback() {
        let mut timing = CoreTiming::new();
        let k = timing.register_event("killer", killer);
        let v = timing.register_event("victim", victim);
        let mut script = Script {
            victim: Some(v),
            ..Script::default()
        };
        timing.schedule_event(5, k, 0);
        timing.schedule_event(5, v, 0);

        timing.advance(5, &mut script);
        assert_eq!(script.fired, vec![("killer", 5)]);
        assert_eq!(timing.cycles_until_next_event(), None);
    }

    #[test]
    fn test_rearm_from_callback_fires_on_later_advance() {
        let mut timing = CoreTiming::new();
        let t = timing.register_event("tick", periodic);
        let mut script = Script {
            tick: Some(t),
            rearms: 2,
            ..Script::default()
        };
        timing.schedule_event(10, t, 10);

        // One advance covering several periods fires only the first instance
        timing.advance(35, &mut script);
        assert_eq!(script.fired, vec![("tick", 35)]);
        assert_eq!(timing.cycles_until_next_event(), Some(10));

        timing.advance(10, &mut script);
        timing.advance(10, &mut script);
        assert_eq!(script.fired, vec![("tick", 35), ("tick", 45), ("tick", 55)]);
        assert!(!timing.is_scheduled(t));
    }

    #[test]
    fn test_zero_delay_schedule_waits_for_next_advance() {
        let mut timing = CoreTiming::new();
        let t = timing.register_event("tick", periodic);
        let mut script = Script {
            tick: Some(t),
            rearms: 1,
            ..Script::default()
        };
        timing.schedule_event(4, t, 0);

        timing.advance(4, &mut script);
        assert_eq!(script.fired, vec![("tick", 4)]);
        assert_eq!(timing.cycles_until_next_event(), Some(0));

        timing.advance(0, &mut script);
        assert_eq!(script.fired, vec![("tick", 4), ("tick", 4)]);
        assert_eq!(timing.cycles_until_next_event(), None);
    }

    #[test]
    fn test_cycles_until_next_event() {
        let (mut timing, ev, mut log) = create_test_env();
        assert_eq!(timing.cycles_until_next_event(), None);
        timing.schedule_event(40, ev, 0);
        timing.advance(15, &mut log);
        assert_eq!(timing.cycles_until_next_event(), Some(25));
    }

    #[test]
    fn test_unknown_event_name_rejected() {
        let (mut timing, ev, _) = create_test_env();
        timing.schedule_event(3, ev, 0);
        let mut payload = Vec::new();
        timing.save(&mut payload).unwrap();

        let mut other: CoreTiming<Log> = CoreTiming::new();
        other.register_event("something-else", record);
        assert!(matches!(
            other.parse_snapshot(&payload),
            Err(StateError::UnknownEvent(name)) if name == "record"
        ));
    }
}

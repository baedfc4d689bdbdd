//! Scheduler ordering and savestate tests

use gk_timing::{CoreTiming, EventType};

#[derive(Default)]
struct Recorder {
    fired: Vec<(&'static str, u64, u64)>,
    chain: Option<EventType>,
}

fn first(ctx: &mut Recorder, timing: &mut CoreTiming<Recorder>, userdata: u64, _late: u64) {
    ctx.fired.push(("first", timing.ticks(), userdata));
}

fn second(ctx: &mut Recorder, timing: &mut CoreTiming<Recorder>, userdata: u64, _late: u64) {
    ctx.fired.push(("second", timing.ticks(), userdata));
}

fn rescheduling(ctx: &mut Recorder, timing: &mut CoreTiming<Recorder>, userdata: u64, _late: u64) {
    ctx.fired.push(("rescheduling", timing.ticks(), userdata));
    if let Some(chain) = ctx.chain {
        timing.schedule_event(0, chain, userdata + 1);
    }
}

fn create_test_env() -> (CoreTiming<Recorder>, EventType, EventType, Recorder) {
    let mut timing = CoreTiming::new();
    let a = timing.register_event("first", first);
    let b = timing.register_event("second", second);
    (timing, a, b, Recorder::default())
}

#[test]
fn test_ties_fire_in_insertion_order() {
    let (mut timing, a, b, mut rec) = create_test_env();
    timing.schedule_event(50, b, 1);
    timing.schedule_event(50, a, 2);
    timing.schedule_event(50, b, 3);
    timing.advance(50, &mut rec);
    assert_eq!(
        rec.fired,
        vec![("second", 50, 1), ("first", 50, 2), ("second", 50, 3)]
    );
}

#[test]
fn test_due_order_beats_insertion_order() {
    let (mut timing, a, b, mut rec) = create_test_env();
    timing.schedule_event(30, a, 0);
    timing.schedule_event(10, b, 0);
    timing.advance(100, &mut rec);
    assert_eq!(rec.fired, vec![("second", 100, 0), ("first", 100, 0)]);
}

#[test]
fn test_event_scheduled_in_callback_waits_for_next_advance() {
    let mut timing = CoreTiming::new();
    let ev = timing.register_event("rescheduling", rescheduling);
    let mut rec = Recorder {
        chain: Some(ev),
        ..Default::default()
    };

    timing.schedule_event(5, ev, 0);
    timing.advance(5, &mut rec);
    assert_eq!(rec.fired, vec![("rescheduling", 5, 0)]);
    assert_eq!(timing.pending_events().len(), 1);

    timing.advance(0, &mut rec);
    assert_eq!(rec.fired.len(), 2);
    assert_eq!(rec.fired[1], ("rescheduling", 5, 1));
}

#[test]
fn test_ticks_are_monotonic() {
    let (mut timing, a, _, mut rec) = create_test_env();
    let mut last = timing.ticks();
    for step in [3u64, 0, 17, 1, 250] {
        timing.schedule_event(step / 2, a, step);
        timing.advance(step, &mut rec);
        assert!(timing.ticks() >= last);
        last = timing.ticks();
    }
    assert_eq!(last, 271);
}

#[test]
fn test_idle_skips_to_next_event() {
    let (mut timing, a, _, mut rec) = create_test_env();
    assert_eq!(timing.idle(&mut rec), 0);
    timing.schedule_event(1_000, a, 9);
    timing.advance(10, &mut rec);
    assert_eq!(timing.idle(&mut rec), 990);
    assert_eq!(timing.ticks(), 1_000);
    assert_eq!(rec.fired, vec![("first", 1_000, 9)]);
}

#[test]
fn test_save_restore_preserves_queue_and_order() {
    let (mut timing, a, b, mut rec) = create_test_env();
    timing.advance(123, &mut rec);
    timing.schedule_event(20, b, 1);
    timing.schedule_event(20, a, 2);
    timing.schedule_event(5, a, 3);

    let mut payload = Vec::new();
    timing.save(&mut payload).unwrap();

    // Register in a different order: events are matched by name
    let mut restored: CoreTiming<Recorder> = CoreTiming::new();
    restored.register_event("second", second);
    restored.register_event("first", first);
    let snapshot = restored.parse_snapshot(&payload).unwrap();
    assert_eq!(snapshot.ticks(), 123);
    assert_eq!(snapshot.event_count(), 3);
    restored.restore(snapshot);

    let names: Vec<_> = restored.pending_events().into_iter().map(|e| (e.name, e.due)).collect();
    assert_eq!(
        names,
        vec![
            ("first".to_string(), 128),
            ("second".to_string(), 143),
            ("first".to_string(), 143)
        ]
    );

    let mut rec2 = Recorder::default();
    restored.advance(20, &mut rec2);
    assert_eq!(
        rec2.fired,
        vec![("first", 143, 3), ("second", 143, 1), ("first", 143, 2)]
    );
}

#[test]
fn test_truncated_snapshot_leaves_scheduler_untouched() {
    let (mut timing, a, _, mut rec) = create_test_env();
    timing.schedule_event(8, a, 0);
    let mut payload = Vec::new();
    timing.save(&mut payload).unwrap();

    timing.advance(2, &mut rec);
    assert!(timing.parse_snapshot(&payload[..payload.len() - 4]).is_err());
    assert_eq!(timing.ticks(), 2);
    assert_eq!(timing.pending_events().len(), 1);
}

//! Savestate round trips and rejection of damaged streams

use gk_core::config::{Config, CpuCore};
use gk_core::error::StateError;
use gk_core::InterruptKind;
use gk_cpu::{Cpu, Machine};
use gk_ppc::asm::*;
use gk_ppc::state::spr;
use gk_timing::CoreTiming;

const ENTRY: u32 = 0x3100;

fn create_test_env(core: CpuCore, compress: bool) -> Cpu {
    let mut config = Config::default();
    config.cpu.core = core;
    config.savestate.compress = compress;
    let mut cpu = Cpu::new(&config).unwrap();

    // Arms the decrementer far in the future, then counts in a loop
    let program = [
        lis(3, 0x0001),
        mtspr(spr::DEC as u32, 3),
        addi(4, 4, 1),
        stw(4, 0x100, 0),
        b(-8),
    ];
    cpu.machine_mut()
        .memory
        .write_physical(ENTRY, &assemble(&program))
        .unwrap();
    cpu.state_mut().pc = ENTRY;
    cpu.state_mut().npc = ENTRY + 4;
    cpu
}

fn video_interrupt(machine: &mut Machine, _timing: &mut CoreTiming<Machine>, _userdata: u64, _late: u64) {
    machine.raise_interrupt(InterruptKind::VI);
}

#[test]
fn test_round_trip_restores_everything() {
    for (core, compress) in [(CpuCore::Jit, true), (CpuCore::Interpreter, false)] {
        let mut cpu = create_test_env(core, compress);
        cpu.run_for(5_000);
        cpu.machine_mut().raise_interrupt(InterruptKind::SI);
        cpu.machine().interrupts().set_mask(0x0000_FFFF);
        cpu.machine_mut().memory.reserve(0x1234);

        let saved_state = cpu.state().clone();
        let saved_pending = cpu.timing().pending_events();
        let saved_blocks = cpu.engine().jit().map(|jit| jit.valid_blocks());
        let bytes = cpu.save_state().unwrap();

        cpu.run_for(5_000);
        cpu.machine_mut().clear_interrupt(InterruptKind::SI);
        assert_ne!(cpu.state(), &saved_state);

        cpu.load_state(&bytes).unwrap();
        assert_eq!(cpu.state(), &saved_state, "{core:?}");
        assert_eq!(cpu.timing().ticks(), saved_state.cycles);
        assert_eq!(cpu.timing().pending_events(), saved_pending);
        assert_eq!(cpu.machine().interrupts().cause(), InterruptKind::SI.bits());
        assert_eq!(cpu.machine().interrupts().mask(), 0x0000_FFFF);
        assert_eq!(cpu.machine().memory.reservation().line(), Some(0x1220));

        if let Some(mut expected) = saved_blocks {
            let mut restored = cpu.engine().jit().map(|jit| jit.valid_blocks()).unwrap_or_default();
            expected.sort();
            restored.sort();
            assert_eq!(restored, expected);
        }
    }
}

#[test]
fn test_restored_run_is_deterministic() {
    let mut original = create_test_env(CpuCore::Jit, true);
    original.run_for(3_000);
    let bytes = original.save_state().unwrap();

    let mut copy = create_test_env(CpuCore::Jit, true);
    copy.load_state(&bytes).unwrap();

    original.run_for(20_000);
    copy.run_for(20_000);
    assert_eq!(copy.state(), original.state());
    assert_eq!(copy.machine().memory.ram()[0x100..0x104], original.machine().memory.ram()[0x100..0x104]);
}

#[test]
fn test_state_loads_into_other_engine() {
    let mut jit = create_test_env(CpuCore::Jit, true);
    jit.run_for(2_000);
    let bytes = jit.save_state().unwrap();

    let mut interp = create_test_env(CpuCore::Interpreter, true);
    interp.load_state(&bytes).unwrap();
    assert_eq!(interp.state(), jit.state());
}

#[test]
fn test_damaged_streams_leave_machine_untouched() {
    let mut cpu = create_test_env(CpuCore::Jit, false);
    cpu.run_for(1_000);
    let good = cpu.save_state().unwrap();
    cpu.run_for(1_000);
    let before = cpu.state().clone();
    let ticks = cpu.timing().ticks();

    let mut bad_magic = good.clone();
    bad_magic[0] ^= 0xFF;
    assert!(matches!(cpu.load_state(&bad_magic), Err(StateError::InvalidMagic)));

    let truncated = &good[..good.len() - 16];
    assert!(matches!(cpu.load_state(truncated), Err(StateError::Truncated(_))));

    let mut flipped = good.clone();
    let last = flipped.len() - 1;
    flipped[last] ^= 0x01;
    assert!(matches!(cpu.load_state(&flipped), Err(StateError::ChecksumMismatch(_))));

    assert!(matches!(cpu.load_state(&good[..8]), Err(StateError::Truncated(_))));

    assert_eq!(cpu.state(), &before);
    assert_eq!(cpu.timing().ticks(), ticks);
}

#[test]
fn test_unknown_event_is_rejected() {
    let mut source = create_test_env(CpuCore::Interpreter, true);
    let vi = source.register_event("VideoInterface", video_interrupt);
    source.schedule_event(100_000, vi, 0);
    let bytes = source.save_state().unwrap();

    let mut target = create_test_env(CpuCore::Interpreter, true);
    target.run_for(500);
    let before = target.state().clone();
    match target.load_state(&bytes) {
        Err(StateError::UnknownEvent(name)) => assert_eq!(name, "VideoInterface"),
        other => panic!("expected an unknown event error, got {other:?}"),
    }
    assert_eq!(target.state(), &before);

    // Registering the event makes the same stream acceptable
    target.register_event("VideoInterface", video_interrupt);
    target.load_state(&bytes).unwrap();
    assert!(target.timing().pending_events().len() >= 1);
}

#[test]
fn test_device_event_fires_after_restore() {
    let mut cpu = create_test_env(CpuCore::Jit, true);
    let vi = cpu.register_event("VideoInterface", video_interrupt);
    cpu.schedule_event(500, vi, 0);
    let bytes = cpu.save_state().unwrap();

    cpu.run_for(1_000);
    assert_eq!(cpu.machine().interrupts().cause(), InterruptKind::VI.bits());

    cpu.machine_mut().clear_interrupt(InterruptKind::VI);
    cpu.load_state(&bytes).unwrap();
    assert_eq!(cpu.machine().interrupts().cause(), 0);
    cpu.run_for(1_000);
    assert_eq!(cpu.machine().interrupts().cause(), InterruptKind::VI.bits());
}

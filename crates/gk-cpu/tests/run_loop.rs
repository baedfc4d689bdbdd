//! Run-loop behaviour shared by every execution engine

use std::time::{Duration, Instant};

use gk_core::config::{Config, CpuCore};
use gk_core::error::CpuError;
use gk_core::InterruptKind;
use gk_cpu::{Cpu, Debugger, RunState, StopReason};
use gk_ppc::asm::*;
use gk_ppc::state::{spr, TIMER_RATIO};
use gk_ppc::Msr;

const ENTRY: u32 = 0x3100;
const ENGINES: [CpuCore; 2] = [CpuCore::Interpreter, CpuCore::Jit];

fn create_test_env(core: CpuCore, program: &[u32]) -> Cpu {
    let mut config = Config::default();
    config.cpu.core = core;
    let mut cpu = Cpu::new(&config).unwrap();
    load(&mut cpu, ENTRY, program);
    cpu.state_mut().pc = ENTRY;
    cpu.state_mut().npc = ENTRY + 4;
    cpu
}

fn load(cpu: &mut Cpu, address: u32, program: &[u32]) {
    cpu.machine_mut()
        .memory
        .write_physical(address, &assemble(program))
        .unwrap();
}

fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_straight_line_code() {
    for core in ENGINES {
        let program = [li(3, 10), addi(4, 3, 32), add(5, 3, 4), b(0)];
        let mut cpu = create_test_env(core, &program);
        cpu.run_for(50);
        let state = cpu.state();
        assert_eq!(state.gpr[3], 10, "{core:?}");
        assert_eq!(state.gpr[4], 42, "{core:?}");
        assert_eq!(state.gpr[5], 52, "{core:?}");
        assert_eq!(state.pc, ENTRY + 12, "{core:?}");
    }
}

#[test]
fn test_engines_agree_on_loop() {
    // r3 = sum of 1..=100 via bdnz
    let program = [li(3, 0), li(4, 100), mtctr(4), add(3, 3, 4), addi(4, 4, -1), bdnz(-8), b(0)];
    let results: Vec<_> = ENGINES
        .iter()
        .map(|&core| {
            let mut cpu = create_test_env(core, &program);
            cpu.run_for(2_000);
            (cpu.state().gpr[3], cpu.state().ctr())
        })
        .collect();
    assert_eq!(results[0], (5050, 0));
    assert_eq!(results[0], results[1]);
}

#[test]
fn test_scheduler_ticks_track_cycles() {
    for core in ENGINES {
        let mut cpu = create_test_env(core, &[addi(3, 3, 1), cmpwi(0, 3, 0), b(-8)]);
        for budget in [1, 7, 300, 5_000] {
            cpu.run_for(budget);
            assert_eq!(cpu.timing().ticks(), cpu.state().cycles, "{core:?}");
        }
    }
}

#[test]
fn test_decrementer_exception() {
    for core in ENGINES {
        let program = [li(3, 10), mtspr(spr::DEC as u32, 3), addi(4, 4, 1), b(-4)];
        let mut cpu = create_test_env(core, &program);
        load(&mut cpu, 0x900, &[li(5, 0x55), b(0)]);
        cpu.state_mut().msr |= Msr::EE.bits();

        cpu.run_for(10 * TIMER_RATIO + 200);
        let state = cpu.state();
        assert_eq!(state.gpr[5], 0x55, "{core:?}");
        assert_eq!(state.msr & Msr::EE.bits(), 0, "{core:?}");
        let srr0 = state.spr[spr::SRR0];
        assert!(srr0 == ENTRY + 8 || srr0 == ENTRY + 12, "{core:?}: srr0 0x{srr0:08x}");
        assert!(state.gpr[4] > 0);
    }
}

#[test]
fn test_decrementer_waits_for_ee() {
    let program = [li(3, 1), mtspr(spr::DEC as u32, 3), addi(4, 4, 1), b(-4)];
    let mut cpu = create_test_env(CpuCore::Interpreter, &program);
    load(&mut cpu, 0x900, &[b(0)]);
    cpu.run_for(500);
    // Pending but masked
    assert!(cpu.state().pc >= ENTRY && cpu.state().pc < ENTRY + 16);

    cpu.state_mut().msr |= Msr::EE.bits();
    cpu.run_for(10);
    assert_eq!(cpu.state().pc, 0x900);
    assert_eq!(cpu.state().spr[spr::SRR1] & Msr::EE.bits(), Msr::EE.bits());
}

#[test]
fn test_external_interrupt_through_pi() {
    for core in ENGINES {
        let mut cpu = create_test_env(core, &[addi(3, 3, 1), b(-4)]);
        // Handler reads the cause register, acknowledges it and parks
        let handler = [lis(6, 0x0C00), lwz(7, 0x3000, 6), stw(7, 0x3000, 6), b(0)];
        load(&mut cpu, 0x500, &handler);
        cpu.state_mut().msr |= Msr::EE.bits();

        cpu.run_for(100);
        assert_eq!(cpu.state().gpr[7], 0);

        cpu.machine_mut().raise_interrupt(InterruptKind::VI);
        cpu.run_for(100);
        assert_eq!(cpu.state().gpr[7], InterruptKind::VI.bits(), "{core:?}");
        assert_eq!(cpu.machine().interrupts().cause(), 0, "{core:?}");
        assert_eq!(cpu.state().pc, 0x50C, "{core:?}");
    }
}

#[test]
fn test_masked_interrupt_is_not_delivered() {
    let mut cpu = create_test_env(CpuCore::Jit, &[addi(3, 3, 1), b(-4)]);
    cpu.state_mut().msr |= Msr::EE.bits();
    let lines = cpu.machine().interrupts();
    lines.set_mask(InterruptKind::SI.bits());

    cpu.machine_mut().raise_interrupt(InterruptKind::VI);
    cpu.run_for(100);
    assert!(cpu.state().pc >= ENTRY && cpu.state().pc < ENTRY + 8);
}

#[test]
fn test_breakpoint_under_both_engines() {
    for core in ENGINES {
        let program = [li(3, 1), li(4, 2), li(5, 3), li(6, 4), b(0)];
        let mut cpu = create_test_env(core, &program);
        cpu.add_breakpoint(ENTRY + 8);

        assert_eq!(cpu.run_for(1000), StopReason::Breakpoint(ENTRY + 8), "{core:?}");
        assert_eq!(cpu.state().gpr[5], 0);
        assert_eq!(cpu.breakpoints().get_all()[0].hit_count, 1);

        // Resuming executes the instruction under the breakpoint
        assert_eq!(cpu.run_for(20), StopReason::CyclesElapsed);
        assert_eq!(cpu.state().gpr[6], 4);

        assert!(cpu.remove_breakpoint(ENTRY + 8));
        assert!(!cpu.remove_breakpoint(ENTRY + 8));
    }
}

#[test]
fn test_breakpoint_added_after_compilation() {
    let program = [addi(3, 3, 1), addi(4, 4, 1), b(-8)];
    let mut cpu = create_test_env(CpuCore::Jit, &program);
    cpu.run_for(100);
    let valid = cpu.engine().jit().map(|jit| jit.valid_blocks().len()).unwrap_or(0);
    assert!(valid > 0);

    cpu.add_breakpoint(ENTRY + 4);
    assert_eq!(cpu.run_for(100), StopReason::Breakpoint(ENTRY + 4));
}

#[test]
fn test_engine_swap_mid_run() {
    let program = [addi(3, 3, 1), addi(4, 4, 2), b(-8)];
    let mut reference = create_test_env(CpuCore::Interpreter, &program);
    reference.run_for(3_000);

    // Budgets are whole loop iterations so block granularity cannot overshoot
    let mut swapped = create_test_env(CpuCore::Jit, &program);
    swapped.run_for(999);
    swapped.set_engine(CpuCore::Interpreter);
    swapped.run_for(999);
    swapped.set_engine(CpuCore::Jit);
    swapped.run_for(1_002);

    assert_eq!(reference.state().gpr[3], 1_000);
    assert_eq!(swapped.state().cycles, reference.state().cycles);
    assert_eq!(swapped.state().gpr[3], reference.state().gpr[3]);
    assert_eq!(swapped.state().gpr[4], reference.state().gpr[4]);
}

#[test]
fn test_self_modifying_code() {
    for core in ENGINES {
        // Overwrite the `li r5, 1` at ENTRY+16 with `li r5, 2`, then run it
        let program = [
            lis(6, 0),
            ori(6, 6, (ENTRY + 16) as u16),
            lis(7, 0x38A0),
            ori(7, 7, 2),
            li(5, 1),
            stw(7, 0, 6),
            b(-8),
        ];
        let mut cpu = create_test_env(core, &program);
        cpu.run_for(200);
        assert_eq!(cpu.state().gpr[5], 2, "{core:?}");
    }
}

#[test]
fn test_spawned_cpu_with_debugger() {
    let program = [addi(3, 3, 1), b(-4)];
    let cpu = create_test_env(CpuCore::Jit, &program);
    let (handle, thread) = cpu.spawn().unwrap();
    let debugger = Debugger::attach(handle.clone());

    assert!(matches!(debugger.step(), Err(CpuError::NotStopped(_))));

    debugger.pause();
    wait_for("pause", || debugger.snapshot().run_state == RunState::Stopped);

    debugger.set_gpr(3, 0).unwrap();
    assert_eq!(debugger.set_gpr(40, 0), Err(CpuError::InvalidRegister(40)));
    let regs = debugger.registers().unwrap();
    assert_eq!(regs.gpr[3], 0);

    let listing = debugger.disassemble(ENTRY, 2).unwrap();
    assert_eq!(listing[0].mnemonic, "addi");
    assert_eq!(listing[1].mnemonic, "b");

    debugger.set_pc(ENTRY).unwrap();
    let snapshot = debugger.step().unwrap();
    assert_eq!(snapshot.gpr[3], 1);
    assert_eq!(snapshot.pc, ENTRY + 4);

    debugger.add_breakpoint(ENTRY).unwrap();
    debugger.resume();
    wait_for("breakpoint", || {
        let snapshot = debugger.snapshot();
        debugger.is_paused() && snapshot.run_state == RunState::BreakpointHit
    });
    assert_eq!(debugger.snapshot().pc, ENTRY);
    assert!(debugger.remove_breakpoint(ENTRY).unwrap());

    handle.stop();
    let cpu = thread.join().unwrap();
    assert_eq!(cpu.run_state(), RunState::Stopped);
    assert_eq!(cpu.timing().ticks(), cpu.state().cycles);
    drop(cpu);
    assert!(matches!(handle.set_engine(CpuCore::Interpreter), Err(CpuError::ThreadGone)));
}

#[test]
fn test_interrupt_posted_from_another_thread() {
    let mut cpu = create_test_env(CpuCore::Jit, &[addi(3, 3, 1), b(-4)]);
    load(&mut cpu, 0x500, &[li(9, 0x77), b(0)]);
    cpu.state_mut().msr |= Msr::EE.bits();
    let (handle, thread) = cpu.spawn().unwrap();

    handle.raise_interrupt(InterruptKind::SI).unwrap();
    wait_for("external exception", || handle.snapshot().gpr[9] == 0x77);

    handle.stop();
    let cpu = thread.join().unwrap();
    assert_eq!(cpu.machine().interrupts().cause(), InterruptKind::SI.bits());
}

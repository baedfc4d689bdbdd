//! JIT against interpreter
//!
//! Every program runs once in the interpreter and once per backend in the
//! JIT, starting from identical machines. The final register file, pending
//! exceptions, cycle count and RAM must match exactly.

use gk_core::config::JitConfig;
use gk_jit::{Backend, BlockCode, Jit};
use gk_memory::bat::{batl, batu};
use gk_memory::{GuestMemory, TranslationMode};
use gk_ppc::asm::*;
use gk_ppc::state::spr;
use gk_ppc::{ExceptionFlags, Interpreter, MachineState, Msr};

const ENTRY: u32 = 0x8000_3100;
const DATA: u32 = 0x8000_4000;
const UNCACHED_DATA: u32 = 0xC000_4800;
const RAM_SIZE: u32 = 0x0180_0000;

fn create_test_env(program: &[u32]) -> (MachineState, GuestMemory) {
    let mut mem = GuestMemory::new(RAM_SIZE).unwrap();
    mem.set_bat(0, batu(0x8000_0000, 0x1000_0000, true, false));
    mem.set_bat(1, batl(0, 0, 2));
    mem.set_bat(8, batu(0x8000_0000, 0x1000_0000, true, false));
    mem.set_bat(9, batl(0, 0, 2));
    mem.set_bat(10, batu(0xC000_0000, 0x1000_0000, true, false));
    mem.set_bat(11, batl(0, 0b0101, 2));
    mem.write_physical(ENTRY & 0x0FFF_FFFF, &assemble(program)).unwrap();

    let mut state = MachineState::new();
    state.pc = ENTRY;
    state.msr = (Msr::IR | Msr::DR | Msr::FP | Msr::ME).bits();
    state.spr[spr::HID2] = spr::HID2_LSQE | spr::HID2_PSE;
    (state, mem)
}

fn end_of(program: &[u32]) -> u32 {
    ENTRY + 4 * program.len() as u32
}

fn backends() -> Vec<Backend> {
    let mut backends = vec![Backend::Threaded];
    if Backend::Native.is_supported() {
        backends.push(Backend::Native);
    }
    backends
}

/// Step until the program falls off its end or an exception becomes pending
fn run_interpreter(program: &[u32]) -> (MachineState, GuestMemory) {
    let (mut state, mut mem) = create_test_env(program);
    let mut interp = Interpreter::new();
    let end = end_of(program);
    for _ in 0..100_000 {
        if state.pc == end {
            return (state, mem);
        }
        if interp.step(&mut state, &mut mem).exception_check {
            return (state, mem);
        }
    }
    panic!("interpreter did not reach the end of the program");
}

fn run_jit_with(program: &[u32], backend: Backend, config: &JitConfig) -> (MachineState, GuestMemory, Jit) {
    let (mut state, mut mem) = create_test_env(program);
    let mut jit = Jit::new(config, backend);
    let end = end_of(program);
    for _ in 0..1_000 {
        if state.pc == end {
            return (state, mem, jit);
        }
        let outcome = jit.run(&mut state, &mut mem, 10_000, &[end]);
        if outcome.exception_check {
            return (state, mem, jit);
        }
    }
    panic!("{backend:?} JIT did not reach the end of the program");
}

fn run_jit(program: &[u32], backend: Backend) -> (MachineState, GuestMemory, Jit) {
    run_jit_with(program, backend, &JitConfig::default())
}

fn assert_equivalent(program: &[u32]) -> MachineState {
    let (expected, expected_mem) = run_interpreter(program);
    for backend in backends() {
        let (state, mem, _) = run_jit(program, backend);
        assert_eq!(state, expected, "{backend:?} register state");
        assert!(mem.ram() == expected_mem.ram(), "{backend:?} RAM contents");
    }
    expected
}

#[test]
fn test_counted_loop() {
    let program = [li(3, 0), li(4, 10), mtctr(4), add(3, 3, 4), addi(4, 4, -1), bdnz(-8)];
    let state = assert_equivalent(&program);
    assert_eq!(state.gpr[3], 55);
}

#[test]
fn test_integer_mix() {
    let program = [
        lis(3, 0x1234),
        ori(3, 3, 0x5678),
        li(4, -7),
        add(5, 3, 4),
        subf(6, 4, 3),
        mullw(7, 4, 4),
        and(8, 3, 4),
        or(9, 3, 4),
        xor(10, 3, 4),
        nor(11, 3, 4),
        nand(12, 3, 4),
        eqv(13, 3, 4),
        andc(14, 3, 4),
        li(15, 5),
        slw(16, 3, 15),
        srw(17, 3, 15),
        rlwinm(18, 3, 8, 16, 23),
        rlwimi(18, 4, 0, 28, 31),
        extsb(19, 4),
        extsh(20, 3),
        neg(21, 4),
        cntlzw(22, 3),
        add_rc(23, 4, 4),
        addo(24, 3, 3),
        cmpw(3, 3, 4),
        cmplw(4, 3, 4),
        srawi(25, 4, 1),
        addc(26, 4, 4),
        adde(27, 3, 3),
    ];
    let state = assert_equivalent(&program);
    assert_eq!(state.gpr[3], 0x1234_5678);
    assert_eq!(state.gpr[5], 0x1234_5671);
}

#[test]
fn test_loads_and_stores() {
    let program = [
        lis(3, -0x8000),
        ori(3, 3, 0x4000),
        lis(4, -0x1235),
        ori(4, 4, 0x5678),
        stw(4, 0, 3),
        sth(4, 4, 3),
        stb(4, 7, 3),
        lwz(5, 0, 3),
        lhz(6, 0, 3),
        lha(7, 0, 3),
        lbz(8, 7, 3),
        li(9, 8),
        stwx(4, 3, 9),
        lwzx(10, 3, 9),
        lhbrx(11, 3, 9),
        stwbrx(4, 3, 9),
        lwzu(12, 4, 3),
        stwu(12, 12, 3),
        stmw(28, 16, 3),
        lmw(28, 16, 3),
    ];
    let state = assert_equivalent(&program);
    assert_eq!(state.gpr[5], 0xEDCB_5678);
    assert_eq!(state.gpr[3], DATA + 16);
}

#[test]
fn test_call_and_return() {
    let program = [bl(12), li(5, 7), b(12), mflr(6), blr(), li(7, 1)];
    let state = assert_equivalent(&program);
    assert_eq!(state.gpr[5], 7);
    assert_eq!(state.gpr[6], ENTRY + 4);
    assert_eq!(state.gpr[7], 1);
}

#[test]
fn test_reservation_pair() {
    let program = [
        lis(3, -0x8000),
        ori(3, 3, 0x4100),
        li(4, 0),
        lwarx(5, 3, 4),
        addi(5, 5, 1),
        stwcx_rc(5, 3, 4),
        lwz(6, 0, 3),
    ];
    let state = assert_equivalent(&program);
    assert_eq!(state.gpr[6], 1);
}

#[test]
fn test_data_fault_mid_block_is_exact() {
    let program = [li(3, 1), lis(6, -0x7000), li(5, 0x55), lwz(5, 0, 6), li(3, 2)];
    let state = assert_equivalent(&program);
    assert!(state.exceptions.contains(ExceptionFlags::DSI));
    assert_eq!(state.pc, ENTRY + 12);
    assert_eq!(state.gpr[3], 1);
    assert_eq!(state.gpr[5], 0x55);
    assert_eq!(state.spr[spr::DAR], 0x9000_0000);
}

#[test]
fn test_faulting_update_store_keeps_base() {
    let program = [lis(6, -0x7000), li(3, 9), stwu(3, 8, 6), li(3, 10)];
    let state = assert_equivalent(&program);
    assert_eq!(state.gpr[6], 0x9000_0000);
    assert_eq!(state.gpr[3], 9);
}

#[test]
fn test_store_into_same_block() {
    let patched = li(6, 99);
    let target = (ENTRY + 4 * 6) as u16;
    let program = [
        lis(3, -0x8000),
        ori(3, 3, target),
        lis(4, (patched >> 16) as u16 as i16),
        ori(4, 4, patched as u16),
        stw(4, 0, 3),
        nop(),
        li(6, 1),
        addi(7, 6, 1),
    ];
    let state = assert_equivalent(&program);
    assert_eq!(state.gpr[6], 99);
    assert_eq!(state.gpr[7], 100);
}

#[test]
fn test_uncached_access_takes_slow_path() {
    let program = [
        lis(3, -0x4000),
        ori(3, 3, UNCACHED_DATA as u16),
        li(4, 0x77),
        stw(4, 0, 3),
        lwz(5, 0, 3),
        addi(5, 5, 1),
    ];
    let state = assert_equivalent(&program);
    assert_eq!(state.gpr[5], 0x78);

    let (_, _, jit) = run_jit(&program, Backend::Threaded);
    let patched: usize = jit
        .cache()
        .blocks()
        .map(|block| match &block.code {
            BlockCode::Threaded(code) => code.patched_sites(),
            #[allow(unreachable_patterns)]
            _ => 0,
        })
        .sum();
    assert_eq!(patched, 2);
}

#[test]
fn test_system_call_stops_block() {
    let program = [li(3, 4), sc(), li(3, 5)];
    let state = assert_equivalent(&program);
    assert!(state.exceptions.contains(ExceptionFlags::SYSCALL));
    assert_eq!(state.gpr[3], 4);
}

#[test]
fn test_consistency_check_accepts_matching_blocks() {
    let program = [
        lis(3, -0x8000),
        ori(3, 3, 0x4000),
        li(4, 3),
        mtctr(4),
        stw(4, 0, 3),
        lwz(5, 0, 3),
        add(6, 6, 5),
        bdnz(-12),
    ];
    let config = JitConfig { consistency_check: true, ..JitConfig::default() };
    let (expected, _) = run_interpreter(&program);
    for backend in backends() {
        let (state, _, jit) = run_jit_with(&program, backend, &config);
        assert_eq!(state, expected);
        assert!(jit.stats().consistency_checks > 0);
    }
}

#[test]
fn test_idle_loop_is_reported() {
    let program = [
        lis(3, -0x8000),
        ori(3, 3, 0x4200),
        lwz(4, 0, 3),
        cmpwi(0, 4, 0),
        beq(-8),
    ];
    for backend in backends() {
        let (mut state, mut mem) = create_test_env(&program);
        let mut jit = Jit::new(&JitConfig::default(), backend);
        let mut outcome = jit.run(&mut state, &mut mem, 100_000, &[]);
        for _ in 0..4 {
            if outcome.idle {
                break;
            }
            outcome = jit.run(&mut state, &mut mem, 100_000, &[]);
        }
        assert!(outcome.idle, "{backend:?}");
        assert!(outcome.cycles < 100_000);
        assert_eq!(state.pc, ENTRY + 8);
    }
}

#[test]
fn test_linked_blocks_are_followed() {
    let program = [li(3, 0), li(4, 50), mtctr(4), add(3, 3, 4), addi(4, 4, -1), bdnz(-8)];
    let (state, _, jit) = run_jit(&program, Backend::Threaded);
    assert_eq!(state.gpr[3], 1275);
    assert!(jit.stats().links_followed > 0);
}

#[test]
fn test_code_write_retranslates() {
    let program = [li(3, 1), li(4, 2)];
    let end = end_of(&program);
    for backend in backends() {
        let (mut state, mut mem) = create_test_env(&program);
        let mut jit = Jit::new(&JitConfig::default(), backend);
        jit.run(&mut state, &mut mem, 1_000, &[end]);
        assert_eq!(state.gpr[3], 1);
        assert_eq!(jit.valid_blocks().len(), 1);

        mem.write::<u32>(ENTRY, li(3, 42), TranslationMode::Virtual).unwrap();
        state.pc = ENTRY;
        jit.run(&mut state, &mut mem, 1_000, &[end]);
        assert_eq!(state.gpr[3], 42);
        assert_eq!(jit.stats().blocks_invalidated, 1);
        assert_eq!(jit.stats().blocks_compiled, 2);
    }
}

#[test]
fn test_unmapped_entry_raises_isi() {
    let (mut state, mut mem) = create_test_env(&[nop()]);
    state.pc = 0x9000_0000;
    let mut jit = Jit::new(&JitConfig::default(), Backend::Threaded);
    let outcome = jit.run(&mut state, &mut mem, 1_000, &[]);
    assert!(outcome.exception_check);
    assert!(state.exceptions.contains(ExceptionFlags::ISI));
    assert_eq!(state.pc, 0x9000_0000);
    assert_eq!(state.cycles, 1);
}

#[test]
fn test_validity_list_rebuilds_cache() {
    let program = [li(3, 0), li(4, 10), mtctr(4), add(3, 3, 4), addi(4, 4, -1), bdnz(-8)];
    let (_, mut mem, jit) = run_jit(&program, Backend::Threaded);
    let mut payload = Vec::new();
    jit.encode_validity(&mut payload).unwrap();

    let keys = Jit::decode_validity(&payload).unwrap();
    assert_eq!(keys, jit.valid_blocks());

    let mut restored = Jit::new(&JitConfig::default(), Backend::Threaded);
    assert_eq!(restored.restore_validity(&keys, &mut mem, &[]), keys.len());
    assert_eq!(restored.valid_blocks(), keys);

    assert!(Jit::decode_validity(&payload[..payload.len() - 1]).is_err());
}

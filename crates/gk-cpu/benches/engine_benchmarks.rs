//! Interpreter vs JIT throughput on small guest loops

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use gk_core::config::{Config, CpuCore};
use gk_cpu::Cpu;
use gk_ppc::asm::*;

const ENTRY: u32 = 0x3100;
const CYCLES: u64 = 100_000;

fn cpu_with(core: CpuCore, program: &[u32]) -> Cpu {
    let mut config = Config::default();
    config.cpu.core = core;
    config.cpu.skip_idle_loops = false;
    let mut cpu = Cpu::new(&config).expect("cpu");
    cpu.machine_mut()
        .memory
        .write_physical(ENTRY, &assemble(program))
        .expect("program");
    cpu.state_mut().pc = ENTRY;
    cpu
}

fn bench_loops(c: &mut Criterion) {
    let workloads: [(&str, Vec<u32>); 2] = [
        ("alu", vec![addi(3, 3, 1), xor(4, 4, 3), rlwinm(5, 4, 3, 0, 31), add(6, 5, 3), b(-16)]),
        (
            "memory",
            vec![lis(7, 0), ori(7, 7, 0x8000), lwz(3, 0, 7), addi(3, 3, 1), stw(3, 0, 7), b(-12)],
        ),
    ];

    let mut group = c.benchmark_group("run_for");
    group.throughput(Throughput::Elements(CYCLES));
    for (name, program) in &workloads {
        for core in [CpuCore::Interpreter, CpuCore::Jit, CpuCore::JitNative] {
            let mut cpu = cpu_with(core, program);
            group.bench_with_input(BenchmarkId::new(*name, format!("{core:?}")), &core, |b, _| {
                b.iter(|| black_box(cpu.run_for(CYCLES)))
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_loops);
criterion_main!(benches);

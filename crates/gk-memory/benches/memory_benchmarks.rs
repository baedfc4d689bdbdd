use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use gk_memory::bat::{batl, batu};
use gk_memory::constants::DEFAULT_RAM_SIZE;
use gk_memory::{GuestMemory, TranslationMode};

fn bench_memory() -> GuestMemory {
    let mut mem = GuestMemory::new(DEFAULT_RAM_SIZE).unwrap();
    mem.set_bat(8, batu(0x8000_0000, 0x1000_0000, true, false));
    mem.set_bat(9, batl(0, 0b0010, 2));
    mem
}

fn access_paths(c: &mut Criterion) {
    let mut group = c.benchmark_group("guest_memory");
    group.throughput(Throughput::Elements(1024));

    let mut mem = bench_memory();
    group.bench_function("slow_read_u32_virtual", |b| {
        b.iter(|| {
            let mut sum = 0u32;
            for i in 0..1024u32 {
                sum = sum.wrapping_add(
                    mem.read::<u32>(0x8000_0000 + i * 4, TranslationMode::Virtual)
                        .unwrap_or(0),
                );
            }
            black_box(sum)
        })
    });

    let mem = bench_memory();
    group.bench_function("fast_read_u32_virtual", |b| {
        b.iter(|| {
            let mut sum = 0u32;
            for i in 0..1024u32 {
                sum = sum.wrapping_add(
                    mem.fast_read::<u32>(0x8000_0000 + i * 4, TranslationMode::Virtual)
                        .unwrap_or(0),
                );
            }
            black_box(sum)
        })
    });

    let mut mem = bench_memory();
    mem.mark_code(0x10_0000, 0x1000);
    group.bench_function("fast_write_u32_untracked", |b| {
        b.iter(|| {
            for i in 0..1024u32 {
                let _ = mem.fast_write::<u32>(0x8000_0000 + i * 4, i, TranslationMode::Virtual);
            }
        })
    });

    group.finish();
}

criterion_group!(benches, access_paths);
criterion_main!(benches);

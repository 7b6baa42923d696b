//! JIT allocator benchmarks

use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use qen_jit::{JitAllocator, JitAllocatorConfig, JitAllocatorOptions, JitSpan};

fn allocate_release_pair(c: &mut Criterion) {
    let jit = JitAllocator::new(&JitAllocatorConfig::default());
    c.bench_function("allocate_release_128", |b| {
        b.iter(|| {
            let span = jit.allocate(black_box(128)).unwrap();
            jit.release(span.rx()).unwrap();
        })
    });
}

fn fill_block(c: &mut Criterion) {
    let config = JitAllocatorConfig::default().with_options(JitAllocatorOptions::USE_MULTIPLE_POOLS);
    let jit = JitAllocator::new(&config);
    c.bench_function("allocate_1000_mixed_then_release", |b| {
        b.iter_batched(
            || Vec::with_capacity(1000),
            |mut spans: Vec<JitSpan>| {
                for i in 0..1000usize {
                    spans.push(jit.allocate(16 + (i * 97) % 4000).unwrap());
                }
                for span in &spans {
                    jit.release(span.rx()).unwrap();
                }
                spans
            },
            BatchSize::SmallInput,
        )
    });
}

fn fragmented_search(c: &mut Criterion) {
    let jit = JitAllocator::new(&JitAllocatorConfig::default());
    // Leave every other slot live so free runs are one slot long.
    let spans: Vec<JitSpan> = (0..4096).map(|_| jit.allocate(64).unwrap()).collect();
    for span in spans.iter().step_by(2) {
        jit.release(span.rx()).unwrap();
    }
    c.bench_function("allocate_256_fragmented", |b| {
        b.iter(|| {
            let span = jit.allocate(black_box(256)).unwrap();
            jit.release(span.rx()).unwrap();
        })
    });
}

fn statistics(c: &mut Criterion) {
    let jit = JitAllocator::new(&JitAllocatorConfig::default());
    let _spans: Vec<JitSpan> = (0..256).map(|i| jit.allocate(64 + i).unwrap()).collect();
    c.bench_function("statistics", |b| b.iter(|| black_box(jit.statistics())));
}

criterion_group!(benches, allocate_release_pair, fill_block, fragmented_search, statistics);
criterion_main!(benches);

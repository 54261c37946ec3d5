//! Pool overhead benchmarks.
//!
//! Measures registration, bounds checks and raw interval lookups at several
//! pool populations.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use poolguard_membrane::{
    AllocKind, CheckMode, IntervalIndex, MemoryRegion, Pool, RetentionPolicy,
};

const OBJECT_SIZE: usize = 64;
const STRIDE: usize = 128;
const BASE: usize = 0x1000_0000;

fn populated_pool(objects: usize) -> Pool {
    let pool = Pool::new(RetentionPolicy::default());
    for i in 0..objects {
        let _ = pool.register_raw(BASE + i * STRIDE, OBJECT_SIZE, AllocKind::Heap, None);
    }
    pool
}

fn bench_register_unregister(c: &mut Criterion) {
    let mut group = c.benchmark_group("register_unregister");
    for &population in &[0usize, 1_000, 100_000] {
        let pool = populated_pool(population);
        let addr = BASE + (population + 1) * STRIDE;
        group.bench_with_input(BenchmarkId::from_parameter(population), &addr, |b, &addr| {
            b.iter(|| {
                let _ = pool.register_raw(black_box(addr), OBJECT_SIZE, AllocKind::Heap, None);
                let _ = black_box(pool.unregister_object(addr, None));
            });
        });
    }
    group.finish();
}

fn bench_check_bounds(c: &mut Criterion) {
    let mut group = c.benchmark_group("check_bounds");
    group.throughput(Throughput::Elements(1));
    for &population in &[16usize, 1_000, 100_000] {
        let pool = populated_pool(population);

        // Repeated hits on one object stay in the lookup cache.
        group.bench_with_input(BenchmarkId::new("same_object", population), &pool, |b, pool| {
            let ptr = BASE + (population / 2) * STRIDE + 8;
            b.iter(|| black_box(pool.check_bounds(black_box(ptr), 8, CheckMode::complete_read())));
        });

        group.bench_with_input(BenchmarkId::new("scattered", population), &pool, |b, pool| {
            let mut i = 0usize;
            b.iter(|| {
                i = (i + 7919) % population;
                let ptr = BASE + i * STRIDE + 8;
                black_box(pool.check_bounds(ptr, 8, CheckMode::complete_read()))
            });
        });

        group.bench_with_input(BenchmarkId::new("miss", population), &pool, |b, pool| {
            let ptr = BASE + OBJECT_SIZE + 8;
            b.iter(|| black_box(pool.check_bounds(black_box(ptr), 8, CheckMode::default())));
        });
    }
    group.finish();
}

fn bench_interval_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("interval_lookup");
    for &population in &[1_000usize, 100_000] {
        let mut index = IntervalIndex::new();
        for i in 0..population {
            if let Ok(region) = MemoryRegion::with_len(BASE + i * STRIDE, OBJECT_SIZE) {
                let _ = index.insert(region, i);
            }
        }
        group.bench_function(BenchmarkId::new("sequential", population), |b| {
            let mut i = 0usize;
            b.iter(|| {
                i = (i + 1) % population;
                black_box(index.lookup(BASE + i * STRIDE + 1))
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_register_unregister,
    bench_check_bounds,
    bench_interval_lookup
);
criterion_main!(benches);

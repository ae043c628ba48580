//! Benchmark: pause times of young, full and concurrent-mark cycles.
//!
//! Each iteration builds a fresh object graph, so the measured time covers
//! allocation plus one collection.

use criterion::{criterion_group, criterion_main, Criterion};
use region_gc::{AllocationKind, GcHeap, GcSettings, GcTaskCause};
use std::time::Duration;

const RS: usize = 256 * 1024;

fn heap() -> GcHeap {
    GcHeap::new(GcSettings {
        region_size: RS,
        heap_size: 256 * RS,
        init_heap_size: 256 * RS,
        young_size: 64 * RS,
        enable_gc_thread: false,
        ..GcSettings::default()
    })
    .unwrap()
}

fn bench_young_pause(c: &mut Criterion) {
    let heap = heap();
    let mutator = heap.mutator();
    c.bench_function("young_pause_1000_live_9000_dead", |b| {
        b.iter(|| {
            let scope = mutator.handle_scope();
            for _ in 0..1000 {
                let node = mutator.allocate(1, 16, AllocationKind::Movable).unwrap();
                scope.handle(Some(node));
                for _ in 0..9 {
                    mutator.allocate(0, 16, AllocationKind::Movable).unwrap();
                }
            }
            mutator.collect(GcTaskCause::Young);
        });
    });
}

fn bench_full_pause(c: &mut Criterion) {
    let heap = heap();
    let mutator = heap.mutator();
    c.bench_function("full_pause_1000_live", |b| {
        b.iter(|| {
            let scope = mutator.handle_scope();
            let head = scope.handle(None);
            for _ in 0..1000 {
                let node = mutator.allocate(1, 16, AllocationKind::Movable).unwrap();
                mutator.write_ref(node, 0, head.get());
                head.set(Some(node));
            }
            mutator.collect(GcTaskCause::Explicit);
        });
    });
}

fn bench_concurrent_mark_cycle(c: &mut Criterion) {
    let heap = heap();
    let mutator = heap.mutator();
    let scope = mutator.handle_scope();
    let tenured = scope.handle(None);
    for _ in 0..5000 {
        let node = mutator.allocate(1, 16, AllocationKind::NonMovable).unwrap();
        mutator.write_ref(node, 0, tenured.get());
        tenured.set(Some(node));
    }
    c.bench_function("concurrent_mark_5000_nonmovable", |b| {
        b.iter(|| mutator.collect(GcTaskCause::HeapUsageThreshold));
    });
}

criterion_group!(
    name = pauses;
    config = Criterion::default()
        .sample_size(20)
        .measurement_time(Duration::from_secs(2));
    targets =
        bench_young_pause,
        bench_full_pause,
        bench_concurrent_mark_cycle,
);
criterion_main!(pauses);

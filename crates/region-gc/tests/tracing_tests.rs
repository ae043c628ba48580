//! Integration tests for the `tracing` feature.
//!
//! A capturing layer records span names and event messages emitted on the
//! test thread while a collection runs there.

#![cfg(feature = "tracing")]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::prelude::*;

use region_gc::tracing::internal::next_gc_id;
use region_gc::{
    AllocationKind, G1Gc, GcHeap, GcListener, GcPhase, GcSettings, GcTask, GcTaskCause,
    RootProvider,
};

const RS: usize = 64 * 1024;

fn settings() -> GcSettings {
    GcSettings {
        region_size: RS,
        heap_size: 64 * RS,
        init_heap_size: 64 * RS,
        young_size: 16 * RS,
        tlab_size: 4096,
        enable_gc_thread: false,
        concurrent_update_remset: false,
        parallel_marking: false,
        parallel_compacting: false,
        ..GcSettings::default()
    }
}

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<String>>>);

impl Captured {
    fn contains(&self, name: &str) -> bool {
        self.0.lock().unwrap().iter().any(|n| n == name)
    }

    fn count(&self, name: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|n| *n == name).count()
    }
}

struct Message<'a>(&'a mut Option<String>);

impl Visit for Message<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            *self.0 = Some(format!("{value:?}"));
        }
    }
}

impl<S: Subscriber> Layer<S> for Captured {
    fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
        self.0.lock().unwrap().push(attrs.metadata().name().to_string());
    }

    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut message = None;
        event.record(&mut Message(&mut message));
        if let Some(message) = message {
            self.0.lock().unwrap().push(message);
        }
    }
}

fn capture() -> (Captured, tracing::dispatcher::DefaultGuard) {
    let captured = Captured::default();
    let guard = tracing_subscriber::registry()
        .with(captured.clone())
        .set_default();
    (captured, guard)
}

#[test]
fn test_gc_ids_increase() {
    let first = next_gc_id();
    let second = next_gc_id();
    assert!(second.0 > first.0);
}

#[test]
fn test_young_collection_spans() {
    let (captured, _guard) = capture();
    let heap = GcHeap::new(settings()).unwrap();
    let mutator = heap.mutator();
    let scope = mutator.handle_scope();
    let _kept = scope.handle(Some(mutator.allocate(0, 16, AllocationKind::Movable).unwrap()));
    mutator.collect(GcTaskCause::Young);

    assert_eq!(captured.count("gc_cycle"), 1);
    assert!(captured.count("gc_phase") >= 2);
    assert!(captured.contains("collection_set"));
    assert!(captured.contains("cycle_stats"));
    assert!(captured.contains("new_region"));
}

#[test]
fn test_dense_region_logs_promotion() {
    let (captured, _guard) = capture();
    let heap = GcHeap::new(GcSettings {
        promotion_region_alive_rate: 0.0,
        ..settings()
    })
    .unwrap();
    let mutator = heap.mutator();
    let scope = mutator.handle_scope();
    let _kept = scope.handle(Some(mutator.allocate(0, 16, AllocationKind::Movable).unwrap()));
    mutator.collect(GcTaskCause::Young);

    assert!(captured.contains("promote_region"));
}

#[test]
fn test_full_collection_spans() {
    let (captured, _guard) = capture();
    let heap = GcHeap::new(settings()).unwrap();
    let mutator = heap.mutator();
    mutator.allocate(0, 16, AllocationKind::NonMovable).unwrap();
    mutator.collect(GcTaskCause::Explicit);

    assert_eq!(captured.count("gc_cycle"), 1);
    assert!(captured.count("gc_phase") >= 2);
    assert!(captured.contains("cycle_stats"));
}

struct Interrupter {
    gc: Weak<G1Gc>,
    armed: AtomicBool,
}

impl GcListener for Interrupter {
    fn gc_phase_started(&self, phase: GcPhase) {
        if phase == GcPhase::Mark && self.armed.swap(false, Ordering::SeqCst) {
            if let Some(gc) = self.gc.upgrade() {
                gc.on_wait_for_idle_fail();
            }
        }
    }
}

struct Roots(Vec<AtomicUsize>);

impl RootProvider for Roots {
    fn visit_roots(&self, visitor: &mut dyn FnMut(&AtomicUsize)) {
        for slot in &self.0 {
            visitor(slot);
        }
    }
}

#[test]
fn test_interrupted_marking_is_logged() {
    let (captured, _guard) = capture();
    let gc = Arc::new(G1Gc::new(settings()).unwrap());
    gc.add_listener(Arc::new(Interrupter {
        gc: Arc::downgrade(&gc),
        armed: AtomicBool::new(true),
    }));
    // Long enough for the concurrent drain to poll the interrupt flag.
    let chain: Vec<_> = (0..1000)
        .map(|_| {
            gc.object_allocator()
                .allocate(1, 8, AllocationKind::NonMovable)
                .unwrap()
                .0
        })
        .collect();
    for pair in chain.windows(2) {
        pair[0].store_ref_raw(0, Some(pair[1]));
    }
    gc.add_root_provider(Arc::new(Roots(vec![AtomicUsize::new(chain[0].addr())])));
    gc.wait_for_gc(GcTask::new(GcTaskCause::HeapUsageThreshold));

    assert!(captured.contains("concurrent_mark_interrupted"));
    assert!(gc.history().last().interrupted);
}

//! Memory statistics.
//!
//! [`GenerationalMemStats`] counts what one collection freed and moved per
//! generation; the collector resets it at the start of every collection.
//! [`HeapMemStats`] is cumulative over the life of the heap.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::heap::region::SpaceType;

#[inline]
fn bump<const ATOMIC: bool>(counter: &AtomicUsize, value: usize) {
    if ATOMIC {
        counter.fetch_add(value, Ordering::Relaxed);
    } else {
        // Single writer: plain load/store is enough.
        counter.store(counter.load(Ordering::Relaxed) + value, Ordering::Relaxed);
    }
}

/// Per-collection freed and moved counters, split by generation.
#[derive(Debug, Default)]
pub struct GenerationalMemStats {
    young_freed_objects: AtomicUsize,
    young_freed_bytes: AtomicUsize,
    young_moved_objects: AtomicUsize,
    young_moved_bytes: AtomicUsize,
    tenured_freed_objects: AtomicUsize,
    tenured_freed_bytes: AtomicUsize,
    tenured_moved_objects: AtomicUsize,
    tenured_moved_bytes: AtomicUsize,
}

/// A point-in-time copy of [`GenerationalMemStats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GenerationalSnapshot {
    /// Young objects freed.
    pub young_freed_objects: usize,
    /// Young bytes freed.
    pub young_freed_bytes: usize,
    /// Young objects moved or promoted.
    pub young_moved_objects: usize,
    /// Young bytes moved or promoted.
    pub young_moved_bytes: usize,
    /// Tenured objects freed from movable regions.
    pub tenured_freed_objects: usize,
    /// Tenured bytes freed.
    pub tenured_freed_bytes: usize,
    /// Tenured objects moved.
    pub tenured_moved_objects: usize,
    /// Tenured bytes moved.
    pub tenured_moved_bytes: usize,
}

impl GenerationalMemStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `count` young objects of `bytes` in total as freed.
    pub fn record_young_freed<const ATOMIC: bool>(&self, count: usize, bytes: usize) {
        bump::<ATOMIC>(&self.young_freed_objects, count);
        bump::<ATOMIC>(&self.young_freed_bytes, bytes);
    }

    /// Records `count` young objects of `bytes` in total as moved.
    pub fn record_young_moved<const ATOMIC: bool>(&self, count: usize, bytes: usize) {
        bump::<ATOMIC>(&self.young_moved_objects, count);
        bump::<ATOMIC>(&self.young_moved_bytes, bytes);
    }

    /// Records `count` tenured objects of `bytes` in total as freed.
    pub fn record_tenured_freed<const ATOMIC: bool>(&self, count: usize, bytes: usize) {
        bump::<ATOMIC>(&self.tenured_freed_objects, count);
        bump::<ATOMIC>(&self.tenured_freed_bytes, bytes);
    }

    /// Records `count` tenured objects of `bytes` in total as moved.
    pub fn record_tenured_moved<const ATOMIC: bool>(&self, count: usize, bytes: usize) {
        bump::<ATOMIC>(&self.tenured_moved_objects, count);
        bump::<ATOMIC>(&self.tenured_moved_bytes, bytes);
    }

    /// Zeroes every counter.
    pub fn reset(&self) {
        for counter in [
            &self.young_freed_objects,
            &self.young_freed_bytes,
            &self.young_moved_objects,
            &self.young_moved_bytes,
            &self.tenured_freed_objects,
            &self.tenured_freed_bytes,
            &self.tenured_moved_objects,
            &self.tenured_moved_bytes,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Copies the counters.
    #[must_use]
    pub fn snapshot(&self) -> GenerationalSnapshot {
        GenerationalSnapshot {
            young_freed_objects: self.young_freed_objects.load(Ordering::Relaxed),
            young_freed_bytes: self.young_freed_bytes.load(Ordering::Relaxed),
            young_moved_objects: self.young_moved_objects.load(Ordering::Relaxed),
            young_moved_bytes: self.young_moved_bytes.load(Ordering::Relaxed),
            tenured_freed_objects: self.tenured_freed_objects.load(Ordering::Relaxed),
            tenured_freed_bytes: self.tenured_freed_bytes.load(Ordering::Relaxed),
            tenured_moved_objects: self.tenured_moved_objects.load(Ordering::Relaxed),
            tenured_moved_bytes: self.tenured_moved_bytes.load(Ordering::Relaxed),
        }
    }

    /// Adds this collection's counters to the cumulative heap counters.
    ///
    /// Nonmovable and humongous frees are recorded by the sweep itself.
    pub fn update_heap_stats(&self, heap: &HeapMemStats) {
        let s = self.snapshot();
        heap.record_freed(
            SpaceType::Object,
            s.young_freed_objects + s.tenured_freed_objects,
            s.young_freed_bytes + s.tenured_freed_bytes,
        );
        heap.record_moved(
            s.young_moved_objects + s.tenured_moved_objects,
            s.young_moved_bytes + s.tenured_moved_bytes,
        );
    }
}

#[derive(Debug, Default)]
struct SpaceCounters {
    allocated_objects: AtomicUsize,
    allocated_bytes: AtomicUsize,
    freed_objects: AtomicUsize,
    freed_bytes: AtomicUsize,
}

impl SpaceCounters {
    fn footprint(&self) -> usize {
        self.allocated_bytes
            .load(Ordering::Relaxed)
            .saturating_sub(self.freed_bytes.load(Ordering::Relaxed))
    }
}

/// Cumulative heap counters.
///
/// The footprint of a space is `allocated - freed` bytes. It is exact only
/// when freed objects are tracked individually (see
/// [`GcSettings::track_freed_objects`](crate::GcSettings::track_freed_objects)).
#[derive(Debug, Default)]
pub struct HeapMemStats {
    object: SpaceCounters,
    nonmovable: SpaceCounters,
    humongous: SpaceCounters,
    moved_objects: AtomicUsize,
    moved_bytes: AtomicUsize,
    pauses: AtomicUsize,
    pause_ns: AtomicU64,
    max_pause_ns: AtomicU64,
    young_collections: AtomicUsize,
    mixed_collections: AtomicUsize,
    full_collections: AtomicUsize,
    concurrent_marks: AtomicUsize,
}

impl HeapMemStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn space(&self, space: SpaceType) -> &SpaceCounters {
        match space {
            SpaceType::NonMovable => &self.nonmovable,
            SpaceType::Humongous => &self.humongous,
            SpaceType::Object | SpaceType::Free => &self.object,
        }
    }

    /// Records an allocation of `bytes` in `space`.
    pub fn record_allocation(&self, space: SpaceType, bytes: usize) {
        let counters = self.space(space);
        counters.allocated_objects.fetch_add(1, Ordering::Relaxed);
        counters.allocated_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records `count` objects of `bytes` in total freed from `space`.
    pub fn record_freed(&self, space: SpaceType, count: usize, bytes: usize) {
        let counters = self.space(space);
        counters.freed_objects.fetch_add(count, Ordering::Relaxed);
        counters.freed_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records `count` objects of `bytes` in total moved.
    pub fn record_moved(&self, count: usize, bytes: usize) {
        self.moved_objects.fetch_add(count, Ordering::Relaxed);
        self.moved_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records a stop-the-world pause.
    #[allow(clippy::cast_possible_truncation)]
    pub fn record_pause(&self, duration: Duration) {
        let ns = duration.as_nanos().min(u128::from(u64::MAX)) as u64;
        self.pauses.fetch_add(1, Ordering::Relaxed);
        self.pause_ns.fetch_add(ns, Ordering::Relaxed);
        self.max_pause_ns.fetch_max(ns, Ordering::Relaxed);
    }

    pub(crate) fn record_young_collection(&self) {
        self.young_collections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_mixed_collection(&self) {
        self.mixed_collections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_full_collection(&self) {
        self.full_collections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_concurrent_mark(&self) {
        self.concurrent_marks.fetch_add(1, Ordering::Relaxed);
    }

    /// Bytes ever allocated in `space`.
    #[must_use]
    pub fn allocated_bytes(&self, space: SpaceType) -> usize {
        self.space(space).allocated_bytes.load(Ordering::Relaxed)
    }

    /// Objects ever allocated in `space`.
    #[must_use]
    pub fn allocated_objects(&self, space: SpaceType) -> usize {
        self.space(space).allocated_objects.load(Ordering::Relaxed)
    }

    /// Bytes ever freed from `space`.
    #[must_use]
    pub fn freed_bytes(&self, space: SpaceType) -> usize {
        self.space(space).freed_bytes.load(Ordering::Relaxed)
    }

    /// Objects ever freed from `space`.
    #[must_use]
    pub fn freed_objects(&self, space: SpaceType) -> usize {
        self.space(space).freed_objects.load(Ordering::Relaxed)
    }

    /// `allocated - freed` bytes of `space`.
    #[must_use]
    pub fn footprint(&self, space: SpaceType) -> usize {
        self.space(space).footprint()
    }

    /// Footprint summed over all spaces.
    #[must_use]
    pub fn footprint_heap(&self) -> usize {
        self.object.footprint() + self.nonmovable.footprint() + self.humongous.footprint()
    }

    /// Objects ever moved.
    #[must_use]
    pub fn moved_objects(&self) -> usize {
        self.moved_objects.load(Ordering::Relaxed)
    }

    /// Bytes ever moved.
    #[must_use]
    pub fn moved_bytes(&self) -> usize {
        self.moved_bytes.load(Ordering::Relaxed)
    }

    /// Number of stop-the-world pauses.
    #[must_use]
    pub fn pause_count(&self) -> usize {
        self.pauses.load(Ordering::Relaxed)
    }

    /// Total time spent in pauses.
    #[must_use]
    pub fn total_pause(&self) -> Duration {
        Duration::from_nanos(self.pause_ns.load(Ordering::Relaxed))
    }

    /// Longest single pause.
    #[must_use]
    pub fn max_pause(&self) -> Duration {
        Duration::from_nanos(self.max_pause_ns.load(Ordering::Relaxed))
    }

    /// Young collections run.
    #[must_use]
    pub fn young_collections(&self) -> usize {
        self.young_collections.load(Ordering::Relaxed)
    }

    /// Mixed collections run.
    #[must_use]
    pub fn mixed_collections(&self) -> usize {
        self.mixed_collections.load(Ordering::Relaxed)
    }

    /// Full collections run.
    #[must_use]
    pub fn full_collections(&self) -> usize {
        self.full_collections.load(Ordering::Relaxed)
    }

    /// Concurrent marking cycles run.
    #[must_use]
    pub fn concurrent_marks(&self) -> usize {
        self.concurrent_marks.load(Ordering::Relaxed)
    }
}

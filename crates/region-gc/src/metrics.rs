//! GC metrics and statistics.
//!
//! Every finished cycle produces a [`GcMetrics`] record. Records go into the
//! heap's [`GcHistory`] ring buffer and are folded into the process-wide
//! [`GlobalMetrics`], which aggregates over every heap of the process.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::gc::task::{GcCollectionType, GcTaskCause};

/// Statistics of one collection cycle.
#[derive(Debug, Clone, Copy)]
pub struct GcMetrics {
    /// Wall time of the whole cycle, concurrent marking included.
    pub duration: Duration,
    /// Sum of the stop-the-world pauses of the cycle.
    pub pause_duration: Duration,
    /// Why the cycle ran.
    pub cause: Option<GcTaskCause>,
    /// What the cycle did.
    pub collection_type: GcCollectionType,
    /// Bytes freed in all spaces.
    pub bytes_reclaimed: usize,
    /// Objects freed in all spaces.
    pub objects_reclaimed: usize,
    /// Bytes moved or promoted.
    pub bytes_moved: usize,
    /// Objects moved or promoted.
    pub objects_moved: usize,
    /// Regions in the collection set(s) of the cycle.
    pub collection_set_regions: usize,
    /// Young regions promoted in place.
    pub promoted_regions: usize,
    /// Whether concurrent marking ran.
    pub concurrent_mark: bool,
    /// Whether concurrent marking was interrupted.
    pub interrupted: bool,
    /// Time spent marking under pauses.
    pub mark_duration: Duration,
    /// Time spent evacuating and promoting.
    pub compact_duration: Duration,
    /// Time spent rewriting references.
    pub update_refs_duration: Duration,
    /// Time spent sweeping nonmovable and humongous objects.
    pub sweep_duration: Duration,
    /// Time spent in concurrent marking.
    pub concurrent_mark_duration: Duration,
    /// Collections of this heap so far, this one included.
    pub total_collections: usize,
}

impl Default for GcMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GcMetrics {
    /// Create a new `GcMetrics` with all fields set to zero/defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            duration: Duration::ZERO,
            pause_duration: Duration::ZERO,
            cause: None,
            collection_type: GcCollectionType::None,
            bytes_reclaimed: 0,
            objects_reclaimed: 0,
            bytes_moved: 0,
            objects_moved: 0,
            collection_set_regions: 0,
            promoted_regions: 0,
            concurrent_mark: false,
            interrupted: false,
            mark_duration: Duration::ZERO,
            compact_duration: Duration::ZERO,
            update_refs_duration: Duration::ZERO,
            sweep_duration: Duration::ZERO,
            concurrent_mark_duration: Duration::ZERO,
            total_collections: 0,
        }
    }
}

/// Accumulates phase durations of one cycle.
///
/// # Example
///
/// ```
/// use region_gc::metrics::PhaseTimer;
///
/// let mut timer = PhaseTimer::new();
/// timer.start();
/// // ... marking ...
/// timer.end_mark();
///
/// timer.start();
/// // ... evacuation ...
/// timer.end_compact();
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimer {
    /// Accumulated marking time.
    pub mark: Duration,
    /// Accumulated evacuation time.
    pub compact: Duration,
    /// Accumulated reference update time.
    pub update_refs: Duration,
    /// Accumulated sweep time.
    pub sweep: Duration,
    current_start: Option<Instant>,
}

impl PhaseTimer {
    /// Create a new `PhaseTimer` with all durations set to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mark: Duration::ZERO,
            compact: Duration::ZERO,
            update_refs: Duration::ZERO,
            sweep: Duration::ZERO,
            current_start: None,
        }
    }

    /// Start timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    fn take(&mut self) -> Duration {
        self.current_start
            .take()
            .map_or(Duration::ZERO, |start| start.elapsed())
    }

    /// End a marking phase.
    pub fn end_mark(&mut self) {
        let elapsed = self.take();
        self.mark += elapsed;
    }

    /// End an evacuation phase.
    pub fn end_compact(&mut self) {
        let elapsed = self.take();
        self.compact += elapsed;
    }

    /// End a reference update phase.
    pub fn end_update_refs(&mut self) {
        let elapsed = self.take();
        self.update_refs += elapsed;
    }

    /// End a sweep phase.
    pub fn end_sweep(&mut self) {
        let elapsed = self.take();
        self.sweep += elapsed;
    }
}

/// Process-wide counters over all heaps.
#[derive(Debug)]
pub struct GlobalMetrics {
    collections: AtomicUsize,
    young_collections: AtomicUsize,
    mixed_collections: AtomicUsize,
    tenured_collections: AtomicUsize,
    full_collections: AtomicUsize,
    interrupted_marks: AtomicUsize,
    bytes_reclaimed: AtomicUsize,
    objects_reclaimed: AtomicUsize,
    pause_ns: AtomicU64,
}

impl Default for GlobalMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalMetrics {
    /// Create zeroed counters.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            collections: AtomicUsize::new(0),
            young_collections: AtomicUsize::new(0),
            mixed_collections: AtomicUsize::new(0),
            tenured_collections: AtomicUsize::new(0),
            full_collections: AtomicUsize::new(0),
            interrupted_marks: AtomicUsize::new(0),
            bytes_reclaimed: AtomicUsize::new(0),
            objects_reclaimed: AtomicUsize::new(0),
            pause_ns: AtomicU64::new(0),
        }
    }

    /// Total collections.
    #[inline]
    #[must_use]
    pub fn total_collections(&self) -> usize {
        self.collections.load(Ordering::Relaxed)
    }

    /// Young-only collections.
    #[inline]
    #[must_use]
    pub fn total_young_collections(&self) -> usize {
        self.young_collections.load(Ordering::Relaxed)
    }

    /// Mixed collections.
    #[inline]
    #[must_use]
    pub fn total_mixed_collections(&self) -> usize {
        self.mixed_collections.load(Ordering::Relaxed)
    }

    /// Whole-heap collections that could not compact.
    #[inline]
    #[must_use]
    pub fn total_tenured_collections(&self) -> usize {
        self.tenured_collections.load(Ordering::Relaxed)
    }

    /// Full compacting collections.
    #[inline]
    #[must_use]
    pub fn total_full_collections(&self) -> usize {
        self.full_collections.load(Ordering::Relaxed)
    }

    /// Concurrent markings cut short by an interrupt.
    #[inline]
    #[must_use]
    pub fn total_interrupted_marks(&self) -> usize {
        self.interrupted_marks.load(Ordering::Relaxed)
    }

    /// Bytes reclaimed.
    #[inline]
    #[must_use]
    pub fn total_bytes_reclaimed(&self) -> usize {
        self.bytes_reclaimed.load(Ordering::Relaxed)
    }

    /// Objects reclaimed.
    #[inline]
    #[must_use]
    pub fn total_objects_reclaimed(&self) -> usize {
        self.objects_reclaimed.load(Ordering::Relaxed)
    }

    /// Sum of all pauses in nanoseconds.
    #[inline]
    #[must_use]
    pub fn total_pause_ns(&self) -> u64 {
        self.pause_ns.load(Ordering::Relaxed)
    }

    fn record(&self, metrics: &GcMetrics) {
        self.collections.fetch_add(1, Ordering::Relaxed);
        self.bytes_reclaimed
            .fetch_add(metrics.bytes_reclaimed, Ordering::Relaxed);
        self.objects_reclaimed
            .fetch_add(metrics.objects_reclaimed, Ordering::Relaxed);
        self.pause_ns.fetch_add(
            metrics.pause_duration.as_nanos().try_into().unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        let counter = match metrics.collection_type {
            GcCollectionType::Young => &self.young_collections,
            GcCollectionType::Mixed => &self.mixed_collections,
            GcCollectionType::Tenured => &self.tenured_collections,
            GcCollectionType::Full => &self.full_collections,
            GcCollectionType::None => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if metrics.interrupted {
            self.interrupted_marks.fetch_add(1, Ordering::Relaxed);
        }
    }
}

static GLOBAL_METRICS: GlobalMetrics = GlobalMetrics::new();

/// The process-wide counters.
#[must_use]
pub fn global_metrics() -> &'static GlobalMetrics {
    &GLOBAL_METRICS
}

const HISTORY_SIZE: usize = 64;

/// Ring buffer of the most recent cycles of one heap.
///
/// # Example
///
/// ```
/// use region_gc::{GcHeap, GcSettings, GcTask, GcTaskCause};
///
/// let heap = GcHeap::new(GcSettings {
///     enable_gc_thread: false,
///     concurrent_update_remset: false,
///     ..GcSettings::default()
/// })
/// .unwrap();
/// heap.wait_for_gc(GcTask::new(GcTaskCause::Young));
/// assert_eq!(heap.history().total_recorded(), 1);
/// ```
#[derive(Debug)]
pub struct GcHistory {
    buffer: UnsafeCell<[GcMetrics; HISTORY_SIZE]>,
    write_idx: AtomicUsize,
}

/// SAFETY: `GcHistory` is safe to share across threads because:
///
/// 1. **Single writer guarantee**: only the thread holding the heap's GC lock
///    calls `push()`, so writes are serialized.
///
/// 2. **Atomic publish**: the write index is advanced with `Release` after the
///    slot is written; readers load it with `Acquire`.
///
/// 3. **Torn read tolerance**: `GcMetrics` is `Copy` with only primitive
///    fields, so a reader racing a writer sees a valid, if mixed, record.
unsafe impl Sync for GcHistory {}

impl Default for GcHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl GcHistory {
    /// Create an empty history.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub const fn new() -> Self {
        Self {
            buffer: UnsafeCell::new([GcMetrics::new(); HISTORY_SIZE]),
            write_idx: AtomicUsize::new(0),
        }
    }

    /// Appends a record and folds it into the process-wide counters.
    ///
    /// Must only be called by the thread holding the heap's GC lock.
    pub(crate) fn push(&self, metrics: GcMetrics) {
        let idx = self.write_idx.load(Ordering::Relaxed);
        let mut metrics = metrics;
        metrics.total_collections = idx + 1;
        // SAFETY: single writer, see the `Sync` impl.
        unsafe {
            let buffer = &mut *self.buffer.get();
            buffer[idx % HISTORY_SIZE] = metrics;
        }
        self.write_idx.store(idx + 1, Ordering::Release);
        GLOBAL_METRICS.record(&metrics);
    }

    /// Number of records ever pushed.
    #[inline]
    #[must_use]
    pub fn total_recorded(&self) -> usize {
        self.write_idx.load(Ordering::Acquire)
    }

    /// The most recent record, or an empty one.
    #[must_use]
    pub fn last(&self) -> GcMetrics {
        self.recent(1).pop().unwrap_or_default()
    }

    /// Up to `n` most recent records, oldest first.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<GcMetrics> {
        let total = self.total_recorded();
        if total == 0 {
            return Vec::new();
        }
        let n = n.min(HISTORY_SIZE).min(total);
        let start = total - n;
        // SAFETY: see the `Sync` impl.
        let buffer = unsafe { &*self.buffer.get() };
        (start..total).map(|i| buffer[i % HISTORY_SIZE]).collect()
    }

    /// Average pause of the `n` most recent cycles.
    #[must_use]
    pub fn average_pause_time(&self, n: usize) -> Duration {
        let recent = self.recent(n);
        if recent.is_empty() {
            return Duration::ZERO;
        }
        let total_ns: u128 = recent.iter().map(|m| m.pause_duration.as_nanos()).sum();
        Duration::from_nanos(
            (total_ns / recent.len() as u128)
                .try_into()
                .unwrap_or(u64::MAX),
        )
    }

    /// Longest pause of the `n` most recent cycles.
    #[must_use]
    pub fn max_pause_time(&self, n: usize) -> Duration {
        self.recent(n)
            .iter()
            .map(|m| m.pause_duration)
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_timer_captures_durations() {
        let mut timer = PhaseTimer::new();
        assert!(timer.current_start.is_none());

        timer.start();
        std::thread::sleep(Duration::from_millis(1));
        timer.end_mark();
        assert!(timer.mark > Duration::ZERO);
        assert!(timer.current_start.is_none());

        // Ending without a start adds nothing.
        timer.end_sweep();
        assert_eq!(timer.sweep, Duration::ZERO);

        timer.start();
        std::thread::sleep(Duration::from_millis(1));
        timer.end_compact();
        assert!(timer.compact > Duration::ZERO);

        // Repeated phases accumulate.
        timer.start();
        timer.end_update_refs();
        let first = timer.update_refs;
        timer.start();
        std::thread::sleep(Duration::from_millis(1));
        timer.end_update_refs();
        assert!(timer.update_refs > first);
    }

    #[test]
    fn test_gc_history_ring() {
        let history = GcHistory::new();
        assert!(history.recent(10).is_empty());
        assert_eq!(history.last().collection_type, GcCollectionType::None);

        for i in 0..HISTORY_SIZE + 3 {
            history.push(GcMetrics {
                pause_duration: Duration::from_micros(i as u64),
                collection_type: GcCollectionType::Young,
                ..GcMetrics::new()
            });
        }
        assert_eq!(history.total_recorded(), HISTORY_SIZE + 3);
        assert_eq!(history.recent(1000).len(), HISTORY_SIZE);
        let last = history.last();
        assert_eq!(last.total_collections, HISTORY_SIZE + 3);
        assert_eq!(last.pause_duration, Duration::from_micros((HISTORY_SIZE + 2) as u64));
        assert_eq!(
            history.max_pause_time(2),
            Duration::from_micros((HISTORY_SIZE + 2) as u64)
        );
        assert!(global_metrics().total_young_collections() >= HISTORY_SIZE + 3);
    }

    #[test]
    fn test_global_metrics_new() {
        let metrics = GlobalMetrics::new();
        assert_eq!(metrics.total_collections(), 0);
        assert_eq!(metrics.total_full_collections(), 0);
        assert_eq!(metrics.total_bytes_reclaimed(), 0);
        assert_eq!(metrics.total_pause_ns(), 0);
    }
}

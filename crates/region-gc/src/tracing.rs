//! GC tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! tracing spans and events for collection cycles. Without the feature only
//! [`GcId`] remains and every call site compiles away.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    use crate::gc::task::{GcCollectionType, GcPhase, GcTaskCause};
    use crate::heap::region::RegionId;
    use crate::mem_stats::GenerationalSnapshot;

    /// Stable identifier for a collection cycle.
    ///
    /// Used to correlate all events of one cycle. Monotonically increasing,
    /// starting at 1, shared by every heap of the process.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next unique GC ID.
    pub fn next_gc_id() -> GcId {
        GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Span covering one whole cycle.
    pub fn trace_gc_cycle(gc_id: GcId, cause: GcTaskCause) -> span::EnteredSpan {
        span!(
            Level::DEBUG,
            "gc_cycle",
            gc_id = gc_id.0,
            cause = %cause
        )
        .entered()
    }

    /// Span covering one phase.
    pub fn trace_phase(phase: GcPhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_phase", phase = phase.name()).entered()
    }

    /// Logs the chosen collection set.
    pub fn log_collection_set(young: usize, tenured: usize, humongous: usize) {
        tracing::debug!(young, tenured, humongous, "collection_set");
    }

    /// Logs an in-place promotion.
    pub fn log_promotion(region: RegionId, live_bytes: usize) {
        tracing::debug!(region = region.index(), live_bytes, "promote_region");
    }

    /// Logs a fallback from a young or mixed collection to the whole-heap path.
    pub fn log_full_fallback(reason: &'static str) {
        tracing::debug!(reason, "full_gc_fallback");
    }

    /// Logs an interrupted concurrent marking.
    pub fn log_mark_interrupted() {
        tracing::debug!("concurrent_mark_interrupted");
    }

    /// Logs what the cycle freed and moved.
    pub fn log_cycle_stats(collection_type: GcCollectionType, stats: &GenerationalSnapshot) {
        tracing::debug!(
            collection_type = ?collection_type,
            young_freed = stats.young_freed_objects,
            young_moved = stats.young_moved_objects,
            tenured_freed = stats.tenured_freed_objects,
            tenured_moved = stats.tenured_moved_objects,
            "cycle_stats"
        );
    }
}

#[cfg(not(feature = "tracing"))]
pub mod internal {
    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    /// Stub function when tracing is disabled.
    pub const fn next_gc_id() -> GcId {
        GcId(0)
    }
}

pub use internal::GcId;

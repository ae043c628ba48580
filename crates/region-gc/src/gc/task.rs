//! Collection requests and phases.

use std::fmt;
use std::time::Instant;

/// Why a collection was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcTaskCause {
    /// Eden is full.
    Young,
    /// Tenured regions with enough garbage were found by the last marking.
    Mixed,
    /// Tenured occupancy crossed the usage threshold.
    HeapUsageThreshold,
    /// The embedder finished its startup.
    StartupComplete,
    /// Native memory pressure.
    NativeAlloc,
    /// Explicit request from the embedder.
    Explicit,
    /// An allocation failed after a young collection.
    Oom,
}

impl GcTaskCause {
    /// Causes that compact the whole tenured generation.
    #[must_use]
    pub const fn is_full(self) -> bool {
        matches!(self, Self::Explicit | Self::Oom)
    }

    /// Causes that start concurrent marking after the young pause.
    #[must_use]
    pub const fn triggers_concurrent_mark(self) -> bool {
        matches!(
            self,
            Self::Oom | Self::HeapUsageThreshold | Self::StartupComplete | Self::Mixed
        )
    }
}

impl fmt::Display for GcTaskCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Young => "young",
            Self::Mixed => "mixed",
            Self::HeapUsageThreshold => "heap-usage-threshold",
            Self::StartupComplete => "startup-complete",
            Self::NativeAlloc => "native-alloc",
            Self::Explicit => "explicit",
            Self::Oom => "oom",
        };
        f.write_str(name)
    }
}

/// What the last collection actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum GcCollectionType {
    /// Nothing ran.
    #[default]
    None = 0,
    /// Young regions only.
    Young = 1,
    /// Young plus selected tenured regions.
    Mixed = 2,
    /// Marking of the whole heap without moving tenured objects.
    Tenured = 3,
    /// Whole-heap marking with tenured compaction.
    Full = 4,
}

/// A collection request.
#[derive(Debug, Clone, Copy)]
pub struct GcTask {
    /// Why the collection runs.
    pub cause: GcTaskCause,
    /// When the request was made.
    pub created: Instant,
    /// Set by the collector: what kind of collection ran.
    pub collection_type: GcCollectionType,
}

impl GcTask {
    /// Creates a request.
    #[must_use]
    pub fn new(cause: GcTaskCause) -> Self {
        Self {
            cause,
            created: Instant::now(),
            collection_type: GcCollectionType::None,
        }
    }
}

/// Collector phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum GcPhase {
    /// No collection running.
    #[default]
    Idle = 0,
    /// Root marking under a pause.
    InitialMark = 1,
    /// Concurrent drain of the mark stack.
    Mark = 2,
    /// Final marking under a pause.
    Remark = 3,
    /// Marking of the collection set.
    MarkYoung = 4,
    /// Evacuation and reference update.
    CollectYoungAndMove = 5,
    /// Sweep of nonmovable and humongous objects.
    Sweep = 6,
}

impl GcPhase {
    /// Decodes a stored phase; unknown values map to [`GcPhase::Idle`].
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::InitialMark,
            2 => Self::Mark,
            3 => Self::Remark,
            4 => Self::MarkYoung,
            5 => Self::CollectYoungAndMove,
            6 => Self::Sweep,
            _ => Self::Idle,
        }
    }

    /// Short name used in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::InitialMark => "initial_mark",
            Self::Mark => "mark",
            Self::Remark => "remark",
            Self::MarkYoung => "mark_young",
            Self::CollectYoungAndMove => "collect_young_and_move",
            Self::Sweep => "sweep",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cause_policy() {
        assert!(GcTaskCause::Explicit.is_full());
        assert!(GcTaskCause::Oom.is_full());
        assert!(!GcTaskCause::Young.is_full());

        assert!(GcTaskCause::Oom.triggers_concurrent_mark());
        assert!(GcTaskCause::Mixed.triggers_concurrent_mark());
        assert!(!GcTaskCause::Young.triggers_concurrent_mark());
        assert!(!GcTaskCause::Explicit.triggers_concurrent_mark());
        assert!(!GcTaskCause::NativeAlloc.triggers_concurrent_mark());
    }

    #[test]
    fn test_phase_roundtrip() {
        for phase in [
            GcPhase::Idle,
            GcPhase::InitialMark,
            GcPhase::Mark,
            GcPhase::Remark,
            GcPhase::MarkYoung,
            GcPhase::CollectYoungAndMove,
            GcPhase::Sweep,
        ] {
            assert_eq!(GcPhase::from_u8(phase as u8), phase);
        }
        assert_eq!(GcPhase::from_u8(42), GcPhase::Idle);
    }
}

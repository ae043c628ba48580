//! A region-based, generational, mostly-concurrent garbage collector.
//!
//! `region-gc` manages a fixed-size heap carved into equal regions. New
//! objects are bump-allocated into young regions through thread-local
//! allocation buffers; survivors are evacuated into tenured regions or, when
//! a young region is dense enough, promoted in place. Objects that must not
//! move live in a free-list space, and objects too large for a region get
//! regions of their own.
//!
//! # Collections
//!
//! - **Young**: every young region is evacuated in a short pause. References
//!   from tenured objects are found through per-region remembered sets, kept
//!   current by a card-marking post-write barrier.
//! - **Concurrent marking**: a snapshot-at-the-beginning marking of the whole
//!   heap runs between two short pauses while mutators keep working. It
//!   sweeps the nonmovable and humongous spaces and measures the garbage of
//!   every tenured region.
//! - **Mixed**: a young collection that also evacuates the tenured regions
//!   marking found mostly dead.
//! - **Full**: a whole-heap marking and compaction in one pause, used for
//!   explicit requests and as a last resort before out-of-memory.
//!
//! # Quick Start
//!
//! ```
//! use region_gc::{AllocationKind, GcHeap, GcSettings, GcTaskCause};
//!
//! let heap = GcHeap::new(GcSettings {
//!     enable_gc_thread: false,
//!     ..GcSettings::default()
//! })
//! .unwrap();
//! let mutator = heap.mutator();
//! let scope = mutator.handle_scope();
//!
//! // A two-element list; `head` is a root, the tail is reachable from it.
//! let head = scope.handle(Some(mutator.allocate(1, 16, AllocationKind::Movable).unwrap()));
//! let tail = mutator.allocate(0, 16, AllocationKind::Movable).unwrap();
//! mutator.write_ref(head.get().unwrap(), 0, Some(tail));
//!
//! mutator.collect(GcTaskCause::Young);
//! let head = head.get().unwrap();
//! assert!(mutator.read_ref(head, 0).is_some());
//! ```
//!
//! # Threads
//!
//! A [`Mutator`] belongs to one thread. Pauses wait for every mutator inside
//! a [`MutatorScope`] to reach a safepoint; allocation is a safepoint, and
//! long-running code without allocation should call [`Mutator::safepoint`].

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod config;
mod error;
mod gc_heap;
mod mutator;

/// Collection machinery.
///
/// Public for embedders that drive collections themselves and for tests.
pub mod gc;
/// Regions, the region pool and the allocators.
///
/// Public for testing and advanced use cases.
pub mod heap;
pub mod handles;
pub mod mem_stats;
pub mod metrics;
pub mod object;
pub mod tracing;

pub use config::{
    GcSettings, DEFAULT_HEAP_SIZE, DEFAULT_HEAP_USAGE_THRESHOLD, DEFAULT_INIT_HEAP_SIZE,
    DEFAULT_MIN_CONCURRENT_CARDS_TO_PROCESS, DEFAULT_NUMBER_OF_MIXED_TENURED_REGIONS,
    DEFAULT_PROMOTION_REGION_ALIVE_RATE, DEFAULT_REGION_GARBAGE_RATE_THRESHOLD,
    DEFAULT_REGION_SIZE, DEFAULT_TLAB_SIZE, DEFAULT_WORKERS_COUNT, DEFAULT_YOUNG_SIZE,
};
pub use error::GcError;
pub use gc::{
    CollectionSet, G1Gc, GcCollectionType, GcListener, GcPhase, GcTask, GcTaskCause,
    RootProvider,
};
pub use gc_heap::GcHeap;
pub use handles::{EscapeableHandleScope, Handle, HandleScope};
pub use heap::{AllocationClass, AllocationKind, Region, RegionId, SpaceType};
pub use mem_stats::{GenerationalMemStats, GenerationalSnapshot, HeapMemStats};
pub use metrics::{global_metrics, GcHistory, GcMetrics, GlobalMetrics};
pub use mutator::{Mutator, MutatorScope};
pub use object::ObjectRef;

#[cfg(any(test, feature = "test-util"))]
#[doc(hidden)]
pub mod test_util {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::gc::RootProvider;
    use crate::object::ObjectRef;
    use crate::GcSettings;

    /// Region size used by [`small_settings`].
    pub const SMALL_REGION: usize = 64 * 1024;

    /// A heap of `regions` regions of [`SMALL_REGION`] bytes, a quarter of
    /// them young, all reserved upfront and without background threads.
    #[must_use]
    pub fn small_settings(regions: usize) -> GcSettings {
        GcSettings {
            region_size: SMALL_REGION,
            heap_size: regions * SMALL_REGION,
            init_heap_size: regions * SMALL_REGION,
            young_size: (regions / 4).max(1) * SMALL_REGION,
            tlab_size: 4096,
            enable_gc_thread: false,
            concurrent_update_remset: false,
            ..GcSettings::default()
        }
    }

    /// A fixed set of root slots.
    #[derive(Default)]
    pub struct SlotRoots(Vec<AtomicUsize>);

    impl SlotRoots {
        /// `count` empty slots.
        #[must_use]
        pub fn new(count: usize) -> Self {
            Self((0..count).map(|_| AtomicUsize::new(0)).collect())
        }

        /// Stores `obj` in slot `index`.
        pub fn set(&self, index: usize, obj: Option<ObjectRef>) {
            self.0[index].store(obj.map_or(0, ObjectRef::addr), Ordering::Release);
        }

        /// The object in slot `index`.
        #[must_use]
        pub fn get(&self, index: usize) -> Option<ObjectRef> {
            // SAFETY: slots hold zero or object addresses maintained by the collector.
            unsafe { ObjectRef::from_addr(self.0[index].load(Ordering::Acquire)) }
        }
    }

    impl RootProvider for SlotRoots {
        fn visit_roots(&self, visitor: &mut dyn FnMut(&AtomicUsize)) {
            for slot in &self.0 {
                visitor(slot);
            }
        }
    }
}

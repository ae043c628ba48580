//! The public face of a heap: settings in, mutators and statistics out.
//!
//! ```
//! use region_gc::{AllocationKind, GcHeap, GcSettings, GcTask, GcTaskCause};
//!
//! let heap = GcHeap::new(GcSettings {
//!     enable_gc_thread: false,
//!     ..GcSettings::default()
//! })
//! .unwrap();
//! let mutator = heap.mutator();
//! let scope = mutator.handle_scope();
//! let node = scope.handle(Some(mutator.allocate(1, 32, AllocationKind::Movable).unwrap()));
//! let _garbage = mutator.allocate(0, 32, AllocationKind::Movable).unwrap();
//!
//! mutator.collect(GcTaskCause::Young);
//! assert!(!heap.object_allocator().region_of(node.get().unwrap()).is_young());
//! ```

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel;

use crate::config::GcSettings;
use crate::error::GcError;
use crate::gc::g1::{G1Gc, GcListener, RootProvider};
use crate::gc::task::{GcPhase, GcTask};
use crate::heap::object_allocator::G1ObjectAllocator;
use crate::mem_stats::{GenerationalSnapshot, HeapMemStats};
use crate::metrics::GcHistory;
use crate::mutator::Mutator;

/// A garbage-collected heap and, optionally, its collector thread.
pub struct GcHeap {
    gc: Arc<G1Gc>,
    gc_thread: Option<JoinHandle<()>>,
}

impl GcHeap {
    /// Reserves the heap and starts its background threads.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::InvalidSettings`] for inconsistent settings,
    /// [`GcError::Map`] if the heap cannot be reserved and
    /// [`GcError::Spawn`] if a background thread cannot be started.
    pub fn new(settings: GcSettings) -> Result<Self, GcError> {
        let enable_gc_thread = settings.enable_gc_thread;
        let gc = Arc::new(G1Gc::new(settings)?);
        let gc_thread = if enable_gc_thread {
            let (tx, rx) = channel::unbounded::<GcTask>();
            gc.set_task_sender(tx);
            let worker = Arc::clone(&gc);
            let handle = thread::Builder::new()
                .name("region-gc".into())
                .spawn(move || {
                    while let Ok(task) = rx.recv() {
                        worker.wait_for_gc(task);
                    }
                })
                .map_err(GcError::Spawn)?;
            Some(handle)
        } else {
            None
        };
        Ok(Self { gc, gc_thread })
    }

    /// Registers the calling thread as a mutator.
    #[must_use]
    pub fn mutator(&self) -> Mutator {
        Mutator::new(Arc::clone(&self.gc))
    }

    /// The collector.
    #[must_use]
    pub fn gc(&self) -> &G1Gc {
        &self.gc
    }

    /// Runs a collection on the calling thread and waits for it.
    ///
    /// Must not be called from inside a [`MutatorScope`](crate::MutatorScope);
    /// use [`Mutator::collect`] there.
    pub fn wait_for_gc(&self, task: GcTask) -> GcTask {
        self.gc.wait_for_gc(task)
    }

    /// Queues `task` for the collector thread, or runs it right away when
    /// the heap has none.
    pub fn trigger(&self, task: GcTask) {
        let sender = self.gc.task_sender();
        match sender {
            Some(tx) => {
                if let Err(channel::SendError(task)) = tx.send(task) {
                    self.gc.wait_for_gc(task);
                }
            }
            None => {
                self.gc.wait_for_gc(task);
            }
        }
    }

    /// Counters of the last cycle.
    #[must_use]
    pub fn stats(&self) -> GenerationalSnapshot {
        self.gc.stats()
    }

    /// Cumulative heap counters.
    #[must_use]
    pub fn mem_stats(&self) -> &HeapMemStats {
        self.gc.mem_stats()
    }

    /// Recent cycles.
    #[must_use]
    pub fn history(&self) -> &GcHistory {
        self.gc.history()
    }

    /// Adds a cycle observer.
    pub fn add_listener(&self, listener: Arc<dyn GcListener>) {
        self.gc.add_listener(listener);
    }

    /// Adds embedder roots.
    pub fn add_root_provider(&self, provider: Arc<dyn RootProvider>) {
        self.gc.add_root_provider(provider);
    }

    /// Interrupts a running concurrent marking.
    pub fn on_wait_for_idle_fail(&self) {
        self.gc.on_wait_for_idle_fail();
    }

    /// The object allocator.
    #[must_use]
    pub fn object_allocator(&self) -> &G1ObjectAllocator {
        self.gc.object_allocator()
    }

    /// The settings the heap was built with.
    #[must_use]
    pub fn settings(&self) -> &GcSettings {
        self.gc.settings()
    }

    /// The phase currently running.
    #[must_use]
    pub fn phase(&self) -> GcPhase {
        self.gc.phase()
    }
}

impl Drop for GcHeap {
    fn drop(&mut self) {
        // Closing the channel ends the collector loop.
        drop(self.gc.take_task_sender());
        if let Some(handle) = self.gc_thread.take() {
            let _ = handle.join();
        }
    }
}

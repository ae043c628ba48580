//! Mutator threads: allocation, barriered stores and safepoints.
//!
//! A [`Mutator`] is the per-thread view of a heap. While a [`MutatorScope`]
//! is alive the thread counts as *running* and pauses wait for it to reach a
//! safepoint; outside any scope it is parked and collections proceed without
//! it. Every allocation is a safepoint, so objects held only as raw
//! [`ObjectRef`]s may move across an allocation. Keep them in handles.

use std::cell::Cell;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::GcError;
use crate::gc::barrier::BarrierBuffers;
use crate::gc::g1::G1Gc;
use crate::gc::task::{GcTask, GcTaskCause};
use crate::handles::{EscapeableHandleScope, HandleScope};
use crate::heap::object_allocator::{AllocationClass, AllocationKind};
use crate::heap::tlab::Tlab;
use crate::object::{checked_object_size, ObjectRef};

/// What the collector sees of a mutator.
#[derive(Default)]
pub(crate) struct MutatorState {
    pub(crate) handles: Mutex<Vec<AtomicUsize>>,
    pub(crate) buffers: BarrierBuffers,
    pub(crate) tlab: Mutex<Option<Arc<Tlab>>>,
}

/// A thread's access point to the heap.
pub struct Mutator {
    gc: Arc<G1Gc>,
    state: Arc<MutatorState>,
    depth: Cell<usize>,
}

impl Mutator {
    pub(crate) fn new(gc: Arc<G1Gc>) -> Self {
        let state = Arc::new(MutatorState::default());
        gc.register_mutator(Arc::clone(&state));
        Self {
            gc,
            state,
            depth: Cell::new(0),
        }
    }

    pub(crate) fn state(&self) -> &MutatorState {
        &self.state
    }

    /// Marks the thread as running until the scope is dropped. Scopes nest.
    pub fn enter(&self) -> MutatorScope<'_> {
        if self.depth.get() == 0 {
            self.gc.rendezvous().attach();
        }
        self.depth.set(self.depth.get() + 1);
        MutatorScope { mutator: self }
    }

    /// Whether the thread is inside a [`MutatorScope`].
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.depth.get() > 0
    }

    /// Parks the thread for the length of a pending pause.
    pub fn safepoint(&self) {
        if self.is_running() && self.gc.rendezvous().is_stop_requested() {
            self.gc.rendezvous().detach();
            self.gc.rendezvous().attach();
        }
    }

    /// Runs `f` with the thread parked.
    pub fn with_released<R>(&self, f: impl FnOnce() -> R) -> R {
        let running = self.is_running();
        if running {
            self.gc.rendezvous().detach();
        }
        let result = f();
        if running {
            self.gc.rendezvous().attach();
        }
        result
    }

    /// Runs a collection for `cause` and waits for it.
    pub fn collect(&self, cause: GcTaskCause) -> GcTask {
        self.with_released(|| self.gc.wait_for_gc(GcTask::new(cause)))
    }

    /// Allocates an object with `ref_count` null reference slots and
    /// `payload` zeroed bytes.
    ///
    /// Tries a young collection and then a full one before giving up.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::OutOfMemory`] if the heap cannot hold the object
    /// even after a full collection.
    pub fn allocate(
        &self,
        ref_count: usize,
        payload: usize,
        kind: AllocationKind,
    ) -> Result<ObjectRef, GcError> {
        let Some(size) = checked_object_size(ref_count, payload) else {
            return Err(GcError::OutOfMemory { requested: payload });
        };
        let _scope = self.enter();
        self.safepoint();
        if let Some(obj) = self.try_allocate(ref_count, payload, kind) {
            return Ok(obj);
        }
        for cause in [GcTaskCause::Young, GcTaskCause::Oom] {
            self.collect(cause);
            if let Some(obj) = self.try_allocate(ref_count, payload, kind) {
                return Ok(obj);
            }
        }
        Err(GcError::OutOfMemory { requested: size })
    }

    fn try_allocate(
        &self,
        ref_count: usize,
        payload: usize,
        kind: AllocationKind,
    ) -> Option<ObjectRef> {
        let allocator = self.gc.object_allocator();
        let size = checked_object_size(ref_count, payload)?;
        let class = allocator.classify(size, kind);
        if class == AllocationClass::Regular && allocator.fits_tlab(size) {
            let current = self.state.tlab.lock().clone();
            if let Some(obj) = current
                .as_deref()
                .and_then(|tlab| allocator.allocate_in_tlab(tlab, ref_count, payload))
            {
                return Some(obj);
            }
            let tlab = allocator.create_new_tlab(size)?;
            let obj = allocator.allocate_in_tlab(&tlab, ref_count, payload);
            *self.state.tlab.lock() = Some(tlab);
            return obj;
        }

        let (obj, class) = allocator.allocate(ref_count, payload, kind)?;
        if class != AllocationClass::Regular && self.gc.barrier().is_concurrent_marking() {
            self.gc.record_new_object(obj);
        }
        Some(obj)
    }

    /// Stores `value` into reference slot `index` of `obj` through the write
    /// barriers.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn write_ref(&self, obj: ObjectRef, index: usize, value: Option<ObjectRef>) {
        let _scope = self.enter();
        let barrier = self.gc.barrier();
        barrier.pre_write_barrier(&self.state.buffers, obj.load_ref(index));
        obj.store_ref_raw(index, value);
        barrier.post_write_barrier(&self.state.buffers, obj, value);
    }

    /// Loads reference slot `index` of `obj`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[must_use]
    pub fn read_ref(&self, obj: ObjectRef, index: usize) -> Option<ObjectRef> {
        obj.load_ref(index)
    }

    /// Opens a handle scope.
    pub fn handle_scope(&self) -> HandleScope<'_> {
        HandleScope::new(self)
    }

    /// Opens a handle scope that can pass one handle to its parent.
    pub fn escapeable_handle_scope(&self) -> EscapeableHandleScope<'_> {
        EscapeableHandleScope::new(self)
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.gc.unregister_mutator(&self.state);
    }
}

/// Keeps the mutator running. See [`Mutator::enter`].
#[must_use = "the thread is parked again as soon as the scope is dropped"]
pub struct MutatorScope<'a> {
    mutator: &'a Mutator,
}

impl Drop for MutatorScope<'_> {
    fn drop(&mut self) {
        let depth = self.mutator.depth.get() - 1;
        self.mutator.depth.set(depth);
        if depth == 0 {
            self.mutator.gc.rendezvous().detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcSettings;
    use crate::gc::task::GcCollectionType;
    use crate::gc_heap::GcHeap;

    const RS: usize = 64 * 1024;

    fn heap() -> GcHeap {
        GcHeap::new(GcSettings {
            region_size: RS,
            heap_size: 32 * RS,
            init_heap_size: 16 * RS,
            young_size: 4 * RS,
            tlab_size: 4096,
            enable_gc_thread: false,
            concurrent_update_remset: false,
            ..GcSettings::default()
        })
        .unwrap()
    }

    #[test]
    fn test_scopes_nest() {
        let heap = heap();
        let mutator = heap.mutator();
        assert!(!mutator.is_running());
        {
            let _outer = mutator.enter();
            let _inner = mutator.enter();
            assert!(mutator.is_running());
            assert_eq!(heap.gc().rendezvous().running(), 1);
        }
        assert!(!mutator.is_running());
        assert_eq!(heap.gc().rendezvous().running(), 0);
    }

    #[test]
    fn test_small_objects_share_a_tlab() {
        let heap = heap();
        let mutator = heap.mutator();
        let a = mutator.allocate(0, 16, AllocationKind::Movable).unwrap();
        let b = mutator.allocate(0, 16, AllocationKind::Movable).unwrap();
        assert_eq!(b.addr(), a.end());
        let tlab = mutator.state().tlab.lock().clone().unwrap();
        assert!(tlab.start() <= a.addr() && b.end() <= tlab.end());
    }

    #[test]
    fn test_collect_while_running_releases_the_thread() {
        let heap = heap();
        let mutator = heap.mutator();
        let _scope = mutator.enter();
        let task = mutator.collect(GcTaskCause::Young);
        assert_eq!(task.collection_type, GcCollectionType::Young);
        assert!(mutator.is_running());
    }

    #[test]
    fn test_young_gc_drops_tlab() {
        let heap = heap();
        let mutator = heap.mutator();
        mutator.allocate(0, 16, AllocationKind::Movable).unwrap();
        assert!(mutator.state().tlab.lock().is_some());
        mutator.collect(GcTaskCause::Young);
        assert!(mutator.state().tlab.lock().is_none());
    }

    #[test]
    fn test_out_of_memory() {
        let heap = heap();
        let mutator = heap.mutator();
        let err = mutator
            .allocate(0, 64 * RS, AllocationKind::Movable)
            .unwrap_err();
        assert!(matches!(err, GcError::OutOfMemory { .. }));
    }

    #[test]
    fn test_unrepresentable_size_fails_without_collecting() {
        let heap = heap();
        let mutator = heap.mutator();
        let err = mutator
            .allocate(0, u32::MAX as usize, AllocationKind::NonMovable)
            .unwrap_err();
        assert!(matches!(err, GcError::OutOfMemory { .. }));
        assert_eq!(heap.history().total_recorded(), 0);
    }

    #[test]
    fn test_write_ref_records_remset_after_pause() {
        let heap = heap();
        let mutator = heap.mutator();
        let scope = mutator.handle_scope();
        let holder = scope.handle(Some(
            mutator.allocate(1, 0, AllocationKind::NonMovable).unwrap(),
        ));
        let big = mutator.allocate(0, 2 * RS, AllocationKind::NonMovable).unwrap();
        let holder = holder.get().unwrap();
        mutator.write_ref(holder, 0, Some(big));
        assert_eq!(mutator.read_ref(holder, 0), Some(big));

        mutator.collect(GcTaskCause::Young);
        let big_region = heap.object_allocator().region_of(big);
        let holder_region = heap.object_allocator().region_of(holder);
        assert!(big_region.rem_set().contains_region(holder_region.id()));
    }
}

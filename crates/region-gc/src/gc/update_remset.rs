//! Remembered-set digestion.
//!
//! Cards queued by the post-write barrier are turned into remembered-set
//! entries: each live object starting in the card is scanned and every
//! cross-region reference is recorded in the target's remembered set.
//!
//! Digestion runs on a background thread between pauses. The collector takes
//! the processing lock for the length of each pause, which both suspends the
//! thread and lets the collector drain the queue synchronously.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use super::barrier::G1BarrierSet;
use super::sync::{LockGuard, LockOrder};
use crate::heap::card_table::CardIndex;
use crate::heap::pool::RegionPool;
use crate::heap::region::Region;

const IDLE_WAIT: Duration = Duration::from_millis(50);

/// Owner of card digestion for one heap.
pub struct UpdateRemsetWorker {
    pool: Arc<RegionPool>,
    barrier: Arc<G1BarrierSet>,
    process: Mutex<()>,
    stop: AtomicBool,
    processed: AtomicUsize,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl UpdateRemsetWorker {
    /// Creates the worker; no thread runs until [`start`](Self::start).
    #[must_use]
    pub fn new(pool: Arc<RegionPool>, barrier: Arc<G1BarrierSet>) -> Self {
        Self {
            pool,
            barrier,
            process: Mutex::new(()),
            stop: AtomicBool::new(false),
            processed: AtomicUsize::new(0),
            thread: Mutex::new(None),
        }
    }

    /// Spawns the background digestion thread.
    ///
    /// # Errors
    ///
    /// Returns the spawn error if the OS refuses a new thread.
    pub fn start(self: &Arc<Self>) -> std::io::Result<()> {
        let worker = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("region-gc-update-remset".into())
            .spawn(move || worker.run())?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    fn run(&self) {
        while !self.stop.load(Ordering::Acquire) {
            self.barrier
                .wait_for_cards(IDLE_WAIT, || self.stop.load(Ordering::Acquire));
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            self.process_pending_cards();
        }
    }

    /// Stops and joins the background thread.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.barrier.notify_all();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    /// Whether the background thread is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.thread.lock().is_some()
    }

    /// Digests every queued card. Returns the number of cards scanned.
    pub fn process_pending_cards(&self) -> usize {
        self.pause().drain()
    }

    /// Suspends digestion until the guard is dropped.
    pub fn pause(&self) -> UpdateRemsetPause<'_> {
        let order = LockGuard::new(LockOrder::UpdateRemset);
        let lock = self.process.lock();
        UpdateRemsetPause {
            worker: self,
            _lock: lock,
            _order: order,
        }
    }

    /// Total number of cards scanned so far.
    #[must_use]
    pub fn processed_cards(&self) -> usize {
        self.processed.load(Ordering::Relaxed)
    }

    fn digest_card(&self, card: CardIndex) -> bool {
        let table = self.pool.card_table();
        // A card cleared by a region release is no longer pending.
        if !table.clear_card(card) {
            return false;
        }
        let (start, end) = table.memory_range(card);
        let Some(region) = self.pool.get_region(start) else {
            return false;
        };
        if region.is_young() {
            return false;
        }
        region.iterate_over_live_objects_in_range(start, end, |obj| {
            obj.for_each_ref(|_, target| self.pool.add_ref_with_addr(obj, target));
        });
        true
    }
}

/// Digestion is suspended while this guard lives.
pub struct UpdateRemsetPause<'a> {
    worker: &'a UpdateRemsetWorker,
    _lock: MutexGuard<'a, ()>,
    _order: LockGuard,
}

impl UpdateRemsetPause<'_> {
    /// Digests every queued card on the calling thread.
    pub fn drain(&self) -> usize {
        let mut scanned = 0;
        while let Some(card) = self.worker.barrier.pop_card() {
            if self.worker.digest_card(card) {
                scanned += 1;
            }
        }
        self.worker.processed.fetch_add(scanned, Ordering::Relaxed);
        scanned
    }

    /// Drops queued cards that belong to `regions`, which are about to be freed.
    pub fn invalidate_regions(&self, regions: &[&Region]) {
        if regions.is_empty() {
            return;
        }
        let table = self.worker.pool.card_table();
        let mut kept = Vec::new();
        while let Some(card) = self.worker.barrier.pop_card() {
            let (start, _) = table.memory_range(card);
            if !regions.iter().any(|region| region.contains(start)) {
                kept.push(card);
            }
        }
        for card in kept {
            self.worker.barrier.push_card(card);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcSettings;
    use crate::gc::barrier::BarrierBuffers;
    use crate::heap::region::{RegionFlags, SpaceType};
    use crate::object::{object_size, ObjectRef};

    const RS: usize = 64 * 1024;

    fn setup() -> (Arc<RegionPool>, Arc<G1BarrierSet>, Arc<UpdateRemsetWorker>) {
        let settings = GcSettings {
            region_size: RS,
            heap_size: 16 * RS,
            init_heap_size: 8 * RS,
            young_size: 4 * RS,
            ..GcSettings::default()
        };
        let pool = Arc::new(RegionPool::new(&settings).unwrap());
        let barrier = Arc::new(G1BarrierSet::new(Arc::clone(&pool), 1));
        let worker = Arc::new(UpdateRemsetWorker::new(
            Arc::clone(&pool),
            Arc::clone(&barrier),
        ));
        (pool, barrier, worker)
    }

    fn old_object(pool: &RegionPool, refs: usize) -> ObjectRef {
        let region = pool
            .new_region(SpaceType::Object, RegionFlags::IS_OLD, RS)
            .unwrap();
        let size = object_size(refs, 0);
        let mem = region.alloc::<false>(size).unwrap();
        let obj = unsafe { ObjectRef::init(mem, size, refs) };
        region.set_live_bit(obj);
        obj
    }

    #[test]
    fn test_sync_drain_fills_rem_set() {
        let (pool, barrier, worker) = setup();
        let buffers = BarrierBuffers::new();
        let src = old_object(&pool, 1);
        let dst = old_object(&pool, 0);

        src.store_ref_raw(0, Some(dst));
        assert!(barrier.post_write_barrier(&buffers, src, Some(dst)));
        barrier.flush_cards(&buffers);

        assert_eq!(worker.process_pending_cards(), 1);
        let dst_region = pool.object_region(dst);
        let src_region = pool.object_region(src);
        assert!(dst_region.rem_set().contains_region(src_region.id()));
        // The card can be marked again after digestion.
        assert!(pool.card_table().is_clear(pool.card_table().card_of(src.addr())));
    }

    #[test]
    fn test_freed_region_cards_are_dropped() {
        let (pool, barrier, worker) = setup();
        let buffers = BarrierBuffers::new();
        let src = old_object(&pool, 1);
        let dst = old_object(&pool, 0);
        src.store_ref_raw(0, Some(dst));
        barrier.post_write_barrier(&buffers, src, Some(dst));
        barrier.flush_cards(&buffers);

        {
            let pause = worker.pause();
            pause.invalidate_regions(&[pool.object_region(src)]);
            assert_eq!(barrier.pending_cards(), 0);
            assert_eq!(pause.drain(), 0);
        }
        assert!(pool.object_region(dst).rem_set().is_empty());
    }

    #[test]
    fn test_background_thread_digests() {
        let (pool, barrier, worker) = setup();
        worker.start().unwrap();
        assert!(worker.is_running());
        let buffers = BarrierBuffers::new();
        let src = old_object(&pool, 1);
        let dst = old_object(&pool, 0);
        src.store_ref_raw(0, Some(dst));
        barrier.post_write_barrier(&buffers, src, Some(dst));
        barrier.flush_cards(&buffers);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while worker.processed_cards() == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        worker.stop();
        assert!(!worker.is_running());
        assert_eq!(worker.processed_cards(), 1);
        assert!(!pool.object_region(dst).rem_set().is_empty());
    }
}

//! Mark-stack drain.
//!
//! A [`Marker`] marks objects in the mark bitmap of their region and traces
//! their reference slots. The `filter` decides which regions take part: the
//! whole heap for concurrent and full marking, only collection-set regions for
//! young and mixed pauses. References into filtered-out regions are not
//! followed.
//!
//! The single-threaded drain polls an interrupt flag so concurrent marking can
//! stop early. The parallel drain splits the stack over the GC workers with
//! work stealing and runs only under a pause.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam::deque::{Injector, Steal, Stealer, Worker};
use parking_lot::Mutex;

use super::workers::GcWorkers;
use crate::heap::pool::RegionPool;
use crate::heap::region::Region;
use crate::object::ObjectRef;

/// Objects processed between two interrupt polls.
const INTERRUPT_POLL_INTERVAL: usize = 256;

/// Marks and traces objects of the regions accepted by `filter`.
pub struct Marker<'a, F> {
    pool: &'a RegionPool,
    filter: F,
}

impl<'a, F> Marker<'a, F>
where
    F: Fn(&Region) -> bool,
{
    /// Creates a marker over `pool`.
    pub const fn new(pool: &'a RegionPool, filter: F) -> Self {
        Self { pool, filter }
    }

    /// Marks `obj` if its region takes part; pushes it on first mark.
    ///
    /// Returns `true` if this call marked the object.
    #[inline]
    pub fn mark_object(&self, obj: ObjectRef, stack: &mut Vec<ObjectRef>) -> bool {
        let Some(region) = self.pool.get_region(obj.addr()) else {
            return false;
        };
        if !(self.filter)(region) || !region.mark_if_not_marked(obj) {
            return false;
        }
        stack.push(obj);
        true
    }

    /// Whether `obj` is marked, or lives in a region outside the filter.
    #[must_use]
    pub fn is_marked_or_outside(&self, obj: ObjectRef) -> bool {
        self.pool
            .get_region(obj.addr())
            .is_none_or(|region| !(self.filter)(region) || region.is_marked(obj))
    }

    /// Marks the targets of `obj` without marking `obj` itself.
    pub fn mark_refs_of(&self, obj: ObjectRef, stack: &mut Vec<ObjectRef>) {
        obj.for_each_ref(|_, target| {
            self.mark_object(target, stack);
        });
    }

    /// Traces until `stack` is empty.
    pub fn drain(&self, stack: &mut Vec<ObjectRef>) {
        while let Some(obj) = stack.pop() {
            self.mark_refs_of(obj, stack);
        }
    }

    /// Traces until `stack` is empty or `interrupt` is raised.
    ///
    /// Returns `false` if the drain was interrupted; the stack then still
    /// holds unprocessed objects. An interrupt raised after the last object
    /// does not undo a finished drain.
    pub fn drain_interruptible(&self, stack: &mut Vec<ObjectRef>, interrupt: &AtomicBool) -> bool {
        let mut processed = 0usize;
        while let Some(obj) = stack.pop() {
            self.mark_refs_of(obj, stack);
            processed += 1;
            if processed % INTERRUPT_POLL_INTERVAL == 0 && interrupt.load(Ordering::Acquire) {
                return false;
            }
        }
        true
    }
}

impl<F> Marker<'_, F>
where
    F: Fn(&Region) -> bool + Sync,
{
    /// Traces the objects of `stack` on all workers.
    pub fn drain_parallel(&self, workers: &GcWorkers, stack: Vec<ObjectRef>) {
        let count = workers.count();
        if count == 1 || stack.len() < 2 {
            let mut stack = stack;
            self.drain(&mut stack);
            return;
        }

        let injector = Injector::new();
        for obj in stack {
            injector.push(obj);
        }
        let locals: Vec<Worker<ObjectRef>> = (0..count).map(|_| Worker::new_lifo()).collect();
        let stealers: Vec<Stealer<ObjectRef>> = locals.iter().map(Worker::stealer).collect();
        let slots: Vec<Mutex<Option<Worker<ObjectRef>>>> =
            locals.into_iter().map(|w| Mutex::new(Some(w))).collect();
        let idle = AtomicUsize::new(0);

        workers.run(|index| {
            let Some(local) = slots[index].lock().take() else {
                return;
            };
            let mut scratch = Vec::new();
            loop {
                if let Some(obj) = find_task(&local, &injector, &stealers) {
                    self.mark_refs_of(obj, &mut scratch);
                    for child in scratch.drain(..) {
                        local.push(child);
                    }
                    continue;
                }
                idle.fetch_add(1, Ordering::AcqRel);
                loop {
                    if idle.load(Ordering::Acquire) == count {
                        return;
                    }
                    if !injector.is_empty() || stealers.iter().any(|s| !s.is_empty()) {
                        idle.fetch_sub(1, Ordering::AcqRel);
                        break;
                    }
                    std::hint::spin_loop();
                }
            }
        });
    }
}

fn find_task(
    local: &Worker<ObjectRef>,
    injector: &Injector<ObjectRef>,
    stealers: &[Stealer<ObjectRef>],
) -> Option<ObjectRef> {
    local.pop().or_else(|| {
        std::iter::repeat_with(|| {
            injector
                .steal_batch_and_pop(local)
                .or_else(|| stealers.iter().map(Stealer::steal).collect::<Steal<_>>())
        })
        .find(|steal| !steal.is_retry())
        .and_then(Steal::success)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcSettings;
    use crate::heap::region::{RegionFlags, SpaceType};
    use crate::object::object_size;

    const RS: usize = 64 * 1024;

    fn pool() -> RegionPool {
        let settings = GcSettings {
            region_size: RS,
            heap_size: 16 * RS,
            init_heap_size: 8 * RS,
            young_size: 4 * RS,
            ..GcSettings::default()
        };
        RegionPool::new(&settings).unwrap()
    }

    fn new_object(region: &Region, refs: usize) -> ObjectRef {
        let size = object_size(refs, 0);
        let mem = region.alloc::<false>(size).unwrap();
        unsafe { ObjectRef::init(mem, size, refs) }
    }

    /// A linked list of `len` objects; returns the head.
    fn chain(region: &Region, len: usize) -> Vec<ObjectRef> {
        let objs: Vec<_> = (0..len).map(|_| new_object(region, 2)).collect();
        for pair in objs.windows(2) {
            pair[0].store_ref_raw(0, Some(pair[1]));
        }
        objs
    }

    #[test]
    fn test_drain_marks_reachable_only() {
        let pool = pool();
        let region = pool
            .new_region(SpaceType::Object, RegionFlags::IS_OLD, RS)
            .unwrap();
        let objs = chain(region, 10);
        let unreachable = new_object(region, 0);

        let marker = Marker::new(&pool, |_: &Region| true);
        let mut stack = Vec::new();
        assert!(marker.mark_object(objs[0], &mut stack));
        assert!(!marker.mark_object(objs[0], &mut stack));
        marker.drain(&mut stack);

        assert!(objs.iter().all(|o| region.is_marked(*o)));
        assert!(!region.is_marked(unreachable));
        assert_eq!(region.calc_mark_bytes(), 10 * objs[0].size());
    }

    #[test]
    fn test_filter_stops_at_region_boundary() {
        let pool = pool();
        let young = pool
            .new_region(SpaceType::Object, RegionFlags::IS_EDEN, RS)
            .unwrap();
        let old = pool
            .new_region(SpaceType::Object, RegionFlags::IS_OLD, RS)
            .unwrap();
        let a = new_object(young, 1);
        let b = new_object(old, 1);
        let c = new_object(young, 0);
        a.store_ref_raw(0, Some(b));
        b.store_ref_raw(0, Some(c));

        let marker = Marker::new(&pool, |r: &Region| r.is_young());
        let mut stack = Vec::new();
        marker.mark_object(a, &mut stack);
        marker.drain(&mut stack);

        assert!(young.is_marked(a));
        assert!(!old.is_marked(b));
        assert!(!young.is_marked(c));
        assert!(marker.is_marked_or_outside(b));
        assert!(!marker.is_marked_or_outside(c));
    }

    #[test]
    fn test_interrupt_leaves_work() {
        let pool = pool();
        let region = pool
            .new_region(SpaceType::Object, RegionFlags::IS_OLD, RS)
            .unwrap();
        let objs = chain(region, 2 * INTERRUPT_POLL_INTERVAL);
        let marker = Marker::new(&pool, |_: &Region| true);
        let interrupt = AtomicBool::new(true);
        let mut stack = Vec::new();
        marker.mark_object(objs[0], &mut stack);
        assert!(!marker.drain_interruptible(&mut stack, &interrupt));
        assert!(!stack.is_empty());

        interrupt.store(false, Ordering::Release);
        assert!(marker.drain_interruptible(&mut stack, &interrupt));
        assert!(objs.iter().all(|o| region.is_marked(*o)));
    }

    #[test]
    fn test_late_interrupt_keeps_finished_drain() {
        let pool = pool();
        let region = pool
            .new_region(SpaceType::Object, RegionFlags::IS_OLD, RS)
            .unwrap();
        // Shorter than one poll interval: the flag is never consulted.
        let objs = chain(region, INTERRUPT_POLL_INTERVAL / 2);
        let marker = Marker::new(&pool, |_: &Region| true);
        let interrupt = AtomicBool::new(true);
        let mut stack = Vec::new();
        marker.mark_object(objs[0], &mut stack);
        assert!(marker.drain_interruptible(&mut stack, &interrupt));
        assert!(stack.is_empty());
        assert!(objs.iter().all(|o| region.is_marked(*o)));
    }

    #[test]
    fn test_parallel_drain_matches_serial() {
        let pool = pool();
        let region = pool
            .new_region(SpaceType::Object, RegionFlags::IS_OLD, RS)
            .unwrap();
        let roots: Vec<_> = (0..8).map(|_| chain(region, 50)).collect();
        let marker = Marker::new(&pool, |_: &Region| true);
        let mut stack = Vec::new();
        for chain in &roots {
            marker.mark_object(chain[0], &mut stack);
        }
        marker.drain_parallel(&GcWorkers::new(4), stack);
        assert!(roots.iter().flatten().all(|o| region.is_marked(*o)));
    }
}

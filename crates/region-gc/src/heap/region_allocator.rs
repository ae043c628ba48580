//! Bump-pointer allocation in movable regions.
//!
//! Eden allocation goes through a single current region (atomically
//! published, CAS-bumped by all mutators) or through TLABs carved from
//! dedicated eden regions. Tenured allocation is only used by the collector to
//! evacuate objects; it takes destination regions from a queue so concurrent
//! compaction workers never share one.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::pool::{RegionPool, RegionSpace};
use super::region::{Region, RegionFlags, RegionId, SpaceType};
use super::tlab::Tlab;
use crate::gc::sync::{LockGuard, LockOrder};
use crate::object::{align_up, ObjectRef, OBJECT_ALIGNMENT};

const NO_REGION: u32 = u32::MAX;

/// Which kind of region an allocation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Young region for new objects.
    Eden,
    /// Tenured region, destination of evacuation.
    Old,
}

/// Verdict of a death checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectStatus {
    /// Reachable; keep or move.
    Alive,
    /// Garbage.
    Dead,
}

/// Allocator for the movable object space.
pub struct RegionAllocator {
    space: RegionSpace,
    eden_current: AtomicU32,
    /// Eden regions with space left for TLABs, largest remainder first.
    retained_tlabs: Mutex<BTreeMap<Reverse<usize>, Vec<RegionId>>>,
    old_queue: Mutex<Vec<RegionId>>,
}

impl RegionAllocator {
    /// Creates an allocator over `pool`.
    #[must_use]
    pub const fn new(pool: Arc<RegionPool>) -> Self {
        Self {
            space: RegionSpace::new(SpaceType::Object, pool),
            eden_current: AtomicU32::new(NO_REGION),
            retained_tlabs: Mutex::new(BTreeMap::new()),
            old_queue: Mutex::new(Vec::new()),
        }
    }

    /// The space backing this allocator.
    #[must_use]
    pub const fn space(&self) -> &RegionSpace {
        &self.space
    }

    fn pool(&self) -> &RegionPool {
        self.space.pool()
    }

    /// Largest object this allocator accepts.
    #[must_use]
    pub fn max_regular_object_size(&self) -> usize {
        self.pool().region_size()
    }

    fn current_eden(&self) -> Option<&Region> {
        match self.eden_current.load(Ordering::Acquire) {
            NO_REGION => None,
            id => Some(self.pool().region(RegionId::new(id))),
        }
    }

    /// Allocates `size` bytes in a region of `kind`.
    ///
    /// Requests above [`max_regular_object_size`](Self::max_regular_object_size)
    /// are refused; they belong to the humongous allocator.
    pub fn alloc(&self, size: usize, kind: RegionKind) -> Option<NonNull<u8>> {
        let size = align_up(size, OBJECT_ALIGNMENT);
        if size > self.max_regular_object_size() {
            return None;
        }
        match kind {
            RegionKind::Eden => self.alloc_eden(size),
            RegionKind::Old => self.alloc_old(size).map(|(mem, _)| mem),
        }
    }

    fn alloc_eden(&self, size: usize) -> Option<NonNull<u8>> {
        if let Some(mem) = self.current_eden().and_then(|r| r.alloc::<true>(size)) {
            return Some(mem);
        }
        let _order = LockGuard::new(LockOrder::Allocator);
        let _lock = self.retained_tlabs.lock();
        // Another thread may have installed a fresh region meanwhile.
        if let Some(mem) = self.current_eden().and_then(|r| r.alloc::<true>(size)) {
            return Some(mem);
        }
        let region = self
            .space
            .new_region(RegionFlags::IS_EDEN, self.pool().region_size())?;
        let mem = region.alloc::<true>(size);
        self.eden_current
            .store(region.id().raw(), Ordering::Release);
        mem
    }

    fn alloc_old(&self, size: usize) -> Option<(NonNull<u8>, &Region)> {
        let queued = {
            let _order = LockGuard::new(LockOrder::Allocator);
            self.old_queue.lock().pop()
        };
        if let Some(id) = queued {
            let region = self.pool().region(id);
            if let Some(mem) = region.alloc::<false>(size) {
                self.push_old(id);
                return Some((mem, region));
            }
        }
        let region = self
            .space
            .new_region(RegionFlags::IS_OLD, self.pool().region_size())?;
        let mem = region.alloc::<false>(size)?;
        self.push_old(region.id());
        Some((mem, region))
    }

    fn push_old(&self, id: RegionId) {
        let _order = LockGuard::new(LockOrder::Allocator);
        self.old_queue.lock().push(id);
    }

    /// Creates a TLAB of `size` bytes, or of at least `min_size` bytes when a
    /// retained eden remainder can be reused.
    pub fn create_new_tlab(&self, size: usize, min_size: usize) -> Option<Arc<Tlab>> {
        debug_assert!(min_size <= size);
        let _order = LockGuard::new(LockOrder::Allocator);
        let mut retained = self.retained_tlabs.lock();
        if let Some(mut entry) = retained.first_entry() {
            let remaining = entry.key().0;
            if remaining >= min_size {
                let ids = entry.get_mut();
                let id = ids.pop();
                if ids.is_empty() {
                    entry.remove();
                }
                if let Some(id) = id {
                    let region = self.pool().region(id);
                    let tlab = region.create_tlab(remaining.min(size))?;
                    retain(&mut retained, region);
                    return Some(tlab);
                }
            }
        }
        let region = self.space.new_region(
            RegionFlags::IS_EDEN | RegionFlags::IS_TLAB,
            self.pool().region_size(),
        )?;
        let tlab = region.create_tlab(size)?;
        retain(&mut retained, region);
        Some(tlab)
    }

    /// Number of regions waiting for further TLABs.
    #[must_use]
    pub fn retained_tlab_regions(&self) -> usize {
        self.retained_tlabs.lock().values().map(Vec::len).sum()
    }

    /// The `count` tenured regions with the most garbage, skipping the
    /// regions currently used as evacuation destinations.
    #[must_use]
    pub fn get_top_garbage_regions(&self, count: usize) -> Vec<RegionId> {
        let current: BTreeSet<RegionId> = self.old_queue.lock().iter().copied().collect();
        let mut candidates = Vec::new();
        self.space.iterate_regions(|region| {
            if region.is_old() && !current.contains(&region.id()) {
                candidates.push((region.garbage_bytes(), region.id()));
            }
        });
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        candidates
            .into_iter()
            .take(count)
            .map(|(_, id)| id)
            .collect()
    }

    /// Every region carrying all bits of `flag`.
    #[must_use]
    pub fn get_all_specific_regions(&self, flag: RegionFlags) -> Vec<RegionId> {
        let mut ids = Vec::new();
        self.space.iterate_regions(|region| {
            if region.has_flag(flag) {
                ids.push(region.id());
            }
        });
        ids
    }

    /// Evacuates the alive objects of `region` into tenured regions.
    ///
    /// Objects are visited through the mark bitmap when `use_marked_bitmap`
    /// is set, otherwise every object is offered to `death_checker`. Each copy
    /// gets a live bit in its destination and is reported to `move_handler`
    /// as `(from, to)`. The source region itself is left for the caller to free.
    ///
    /// # Panics
    ///
    /// Panics if no tenured memory is left for a live object. Collections
    /// check for enough free regions before evacuating, so this means the
    /// accounting is broken.
    pub fn compact_specific_region(
        &self,
        region: &Region,
        use_marked_bitmap: bool,
        mut death_checker: impl FnMut(ObjectRef) -> ObjectStatus,
        mut move_handler: impl FnMut(ObjectRef, ObjectRef),
    ) {
        debug_assert!(region.is_young() || region.is_old());
        let visitor = |obj: ObjectRef| {
            if death_checker(obj) == ObjectStatus::Dead {
                return;
            }
            let size = obj.size();
            let Some((mem, dst)) = self.alloc_old(size) else {
                panic!("no tenured space left to evacuate {obj:?}");
            };
            // SAFETY: `mem` is a fresh reservation of `size` bytes that cannot
            // overlap the source region.
            let copy = unsafe {
                ptr::copy_nonoverlapping(obj.as_ptr(), mem.as_ptr(), size);
                ObjectRef::from_addr(mem.as_ptr() as usize)
            }
            .unwrap_or_else(|| unreachable!("allocation returned null"));
            copy.clear_forwarded();
            dst.set_live_bit(copy);
            dst.add_live_bytes(size);
            move_handler(obj, copy);
        };
        if use_marked_bitmap {
            region.iterate_over_marked_objects(visitor);
        } else {
            region.iterate_over_objects(visitor);
        }
    }

    /// Turns a young region into a tenured one without moving its objects.
    ///
    /// Alive objects get live bits and are reported to `alive_handler`.
    /// Promoting a region that is already tenured does nothing.
    pub fn promote_young_region(
        &self,
        region: &Region,
        use_marked_bitmap: bool,
        mut death_checker: impl FnMut(ObjectRef) -> ObjectStatus,
        mut alive_handler: impl FnMut(ObjectRef),
    ) {
        if !region.is_young() {
            return;
        }
        region.live_bitmap().clear();
        let visitor = |obj: ObjectRef| {
            if death_checker(obj) == ObjectStatus::Alive {
                region.set_live_bit(obj);
                alive_handler(obj);
            }
        };
        if use_marked_bitmap {
            region.iterate_over_marked_objects(visitor);
        } else {
            region.iterate_over_objects(visitor);
        }
        self.space.promote_young_region(region);
    }

    /// Frees every eden region and forgets the current eden region and TLAB remainders.
    ///
    /// Promoted regions are no longer eden and survive.
    pub fn reset_all_eden_regions(&self) {
        {
            let _order = LockGuard::new(LockOrder::Allocator);
            let mut retained = self.retained_tlabs.lock();
            retained.clear();
            self.eden_current.store(NO_REGION, Ordering::Release);
        }
        for id in self.space.region_ids() {
            let region = self.pool().region(id);
            if region.is_eden() {
                self.space.free_region(region);
            }
        }
    }

    /// Frees the given tenured regions.
    pub fn reset_several_specific_regions(&self, ids: &[RegionId]) {
        {
            let _order = LockGuard::new(LockOrder::Allocator);
            self.old_queue.lock().retain(|id| !ids.contains(id));
        }
        for id in ids {
            self.space.free_region(self.pool().region(*id));
        }
    }

    /// Stops allocating into the current region(s) of `kind`.
    pub fn clear_current_region(&self, kind: RegionKind) {
        let _order = LockGuard::new(LockOrder::Allocator);
        match kind {
            RegionKind::Eden => {
                self.retained_tlabs.lock().clear();
                self.eden_current.store(NO_REGION, Ordering::Release);
            }
            RegionKind::Old => self.old_queue.lock().clear(),
        }
    }

    /// Calls `f` for every object of the space.
    pub fn iterate_over_objects(&self, mut f: impl FnMut(ObjectRef)) {
        self.space
            .iterate_regions(|region| region.iterate_over_objects(&mut f));
    }
}

fn retain(retained: &mut BTreeMap<Reverse<usize>, Vec<RegionId>>, region: &Region) {
    let rest = region.remaining_tlab_size();
    if rest > 0 {
        retained.entry(Reverse(rest)).or_default().push(region.id());
    }
}

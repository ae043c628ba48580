//! The region pool and the spaces built on it.
//!
//! # Layout
//!
//! The pool reserves one contiguous virtual range of `heap_size` bytes and
//! splits it into region-sized slots. The first `init_heap_size` bytes form the
//! pre-reserved region block; the rest is the extension area, used only when
//! `extend_heap` is set and released back to the OS when its regions are freed.
//!
//! ```text
//! base                     block end                         base + heap_size
//! | slot 0 | slot 1 | ...  | ext slot | ext slot | ...       |
//! ```
//!
//! Every slot has a [`Region`] metadata entry and an owner entry. A humongous
//! region covering several slots is the owner of all of them, so an address
//! anywhere inside a humongous object maps back to its head region in O(1).

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use sys_alloc::Reservation;

use super::card_table::{CardState, CardTable};
use super::region::{Region, RegionFlags, RegionId, SpaceType};
use crate::config::GcSettings;
use crate::error::GcError;
use crate::gc::sync::{LockGuard, LockOrder};
use crate::object::ObjectRef;

const NO_OWNER: u32 = u32::MAX;

struct PoolState {
    free_block: BTreeSet<u32>,
    free_extend: BTreeSet<u32>,
}

/// Backing memory and slot table for all regions.
pub struct RegionPool {
    reservation: Reservation,
    base: usize,
    region_size: usize,
    block_regions: usize,
    total_regions: usize,
    usable_regions: usize,
    regions: Box<[Region]>,
    owners: Box<[AtomicU32]>,
    state: Mutex<PoolState>,
    free_count: AtomicUsize,
    young_regions: AtomicUsize,
    tenured_regions: AtomicUsize,
    max_young_regions: usize,
    max_tenured_regions: usize,
    card_table: CardTable,
}

impl RegionPool {
    /// Reserves the heap range described by `settings`.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::InvalidSettings`] for inconsistent settings and
    /// [`GcError::Map`] if the range cannot be reserved.
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(settings: &GcSettings) -> Result<Self, GcError> {
        settings.validate()?;
        let region_size = settings.region_size;
        let reservation = Reservation::new(settings.heap_size)?;
        let base = reservation.base() as usize;
        let total_regions = settings.heap_size / region_size;
        let block_regions = (settings.init_heap_size / region_size).min(total_regions);
        let usable_regions = if settings.extend_heap {
            total_regions
        } else {
            block_regions
        };
        let max_young_regions = settings.young_size / region_size;

        let regions = (0..total_regions)
            .map(|i| Region::new(RegionId::new(i as u32), base + i * region_size, region_size))
            .collect();
        let owners = (0..total_regions).map(|_| AtomicU32::new(NO_OWNER)).collect();
        let free_block = (0..block_regions as u32).collect();
        let free_extend = if settings.extend_heap {
            (block_regions as u32..total_regions as u32).collect()
        } else {
            BTreeSet::new()
        };

        Ok(Self {
            base,
            region_size,
            block_regions,
            total_regions,
            usable_regions,
            regions,
            owners,
            state: Mutex::new(PoolState {
                free_block,
                free_extend,
            }),
            free_count: AtomicUsize::new(usable_regions),
            young_regions: AtomicUsize::new(0),
            tenured_regions: AtomicUsize::new(0),
            max_young_regions,
            max_tenured_regions: usable_regions.saturating_sub(max_young_regions),
            card_table: CardTable::new(base, total_regions * region_size),
            reservation,
        })
    }

    /// Size of one region slot.
    #[must_use]
    pub const fn region_size(&self) -> usize {
        self.region_size
    }

    /// Number of slots that may be used.
    #[must_use]
    pub const fn usable_regions(&self) -> usize {
        self.usable_regions
    }

    /// Number of slots in the pre-reserved block.
    #[must_use]
    pub const fn block_regions(&self) -> usize {
        self.block_regions
    }

    /// The card table covering the whole reserved range.
    #[must_use]
    pub const fn card_table(&self) -> &CardTable {
        &self.card_table
    }

    /// Whether `addr` lies inside the reserved range.
    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.total_regions * self.region_size
    }

    /// Region metadata by id.
    #[must_use]
    pub fn region(&self, id: RegionId) -> &Region {
        &self.regions[id.index()]
    }

    /// Maps any address inside an allocated region to that region.
    ///
    /// Addresses inside the tail slots of a humongous region resolve to its
    /// head. Returns `None` for addresses outside the heap or in free slots.
    #[must_use]
    pub fn get_region(&self, addr: usize) -> Option<&Region> {
        if !self.contains(addr) {
            return None;
        }
        let slot = (addr - self.base) / self.region_size;
        match self.owners[slot].load(Ordering::Acquire) {
            NO_OWNER => None,
            owner => Some(&self.regions[owner as usize]),
        }
    }

    /// Region containing `obj`.
    ///
    /// # Panics
    ///
    /// Panics if `obj` is not inside an allocated region, which means a
    /// dangling reference reached the collector.
    #[must_use]
    pub fn object_region(&self, obj: ObjectRef) -> &Region {
        self.get_region(obj.addr())
            .unwrap_or_else(|| panic!("{obj:?} is not inside an allocated region"))
    }

    /// Carves a region of `size` bytes (a multiple of the region size).
    ///
    /// Searches the pre-reserved block first and the extension area second.
    /// Returns `None` when no run of free slots is long enough or the young
    /// or tenured budget would be exceeded.
    #[allow(clippy::cast_possible_truncation)]
    pub fn new_region(&self, space: SpaceType, flags: RegionFlags, size: usize) -> Option<&Region> {
        debug_assert!(size > 0 && size % self.region_size == 0);
        let count = size / self.region_size;
        let young = flags.intersects(RegionFlags::IS_EDEN | RegionFlags::IS_SURVIVOR);
        let head = {
            let _order = LockGuard::new(LockOrder::Pool);
            let mut state = self.state.lock();
            let (used, limit) = if young {
                (&self.young_regions, self.max_young_regions)
            } else {
                (&self.tenured_regions, self.max_tenured_regions)
            };
            if used.load(Ordering::Relaxed) + count > limit {
                return None;
            }
            let head = take_run(&mut state.free_block, count)
                .or_else(|| take_run(&mut state.free_extend, count))?;
            for slot in head..head + count as u32 {
                self.owners[slot as usize].store(head, Ordering::Release);
            }
            used.fetch_add(count, Ordering::Relaxed);
            self.free_count.fetch_sub(count, Ordering::Relaxed);
            head
        };

        let region = &self.regions[head as usize];
        region.init(region.begin() + size, flags, space);
        let card_state = if young {
            CardState::Young
        } else {
            CardState::Clear
        };
        self.card_table
            .set_range(region.begin(), region.end(), card_state);
        std::sync::atomic::fence(Ordering::SeqCst);

        #[cfg(feature = "tracing")]
        tracing::trace!(region = head, ?flags, size, "new_region");
        Some(region)
    }

    /// Returns a region and all of its slots to the pool.
    ///
    /// Physical pages of extension slots are handed back to the OS.
    #[allow(clippy::cast_possible_truncation)]
    pub fn free_region(&self, region: &Region) {
        let head = region.id().index();
        let count = region.size() / self.region_size;
        let young = region.is_young();
        let (begin, end) = (region.begin(), region.end());

        region.destroy(self.region_size);
        self.card_table.set_range(begin, end, CardState::Clear);
        if head + count > self.block_regions {
            let first = head.max(self.block_regions);
            let offset = first * self.region_size;
            let len = (head + count - first) * self.region_size;
            if let Err(_err) = self.reservation.release(offset, len) {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %_err, "failed to release region pages");
            }
        }

        let _order = LockGuard::new(LockOrder::Pool);
        let mut state = self.state.lock();
        for slot in head..head + count {
            self.owners[slot].store(NO_OWNER, Ordering::Release);
            if slot < self.block_regions {
                state.free_block.insert(slot as u32);
            } else {
                state.free_extend.insert(slot as u32);
            }
        }
        let used = if young {
            &self.young_regions
        } else {
            &self.tenured_regions
        };
        used.fetch_sub(count, Ordering::Relaxed);
        self.free_count.fetch_add(count, Ordering::Relaxed);
    }

    /// Reclassifies a young region as tenured in place.
    pub fn promote_young_region(&self, region: &Region) {
        debug_assert!(region.is_young());
        let count = region.size() / self.region_size;
        {
            let _order = LockGuard::new(LockOrder::Pool);
            let _state = self.state.lock();
            region.rm_flag(RegionFlags::IS_EDEN | RegionFlags::IS_SURVIVOR);
            region.add_flag(RegionFlags::IS_OLD | RegionFlags::IS_PROMOTED);
            self.young_regions.fetch_sub(count, Ordering::Relaxed);
            self.tenured_regions.fetch_add(count, Ordering::Relaxed);
        }
        self.card_table
            .set_range(region.begin(), region.end(), CardState::Clear);
    }

    /// Whether at least `count` slots are free. Advisory.
    #[must_use]
    pub fn have_free_regions(&self, count: usize) -> bool {
        self.free_count.load(Ordering::Relaxed) >= count
    }

    /// Whether `count` more tenured regions fit the tenured budget. Advisory.
    #[must_use]
    pub fn have_tenured_size(&self, count: usize) -> bool {
        self.tenured_regions.load(Ordering::Relaxed) + count <= self.max_tenured_regions
    }

    /// Number of free slots.
    #[must_use]
    pub fn free_regions_count(&self) -> usize {
        self.free_count.load(Ordering::Relaxed)
    }

    /// Number of slots used by young regions.
    #[must_use]
    pub fn young_regions_count(&self) -> usize {
        self.young_regions.load(Ordering::Relaxed)
    }

    /// Number of slots used by tenured regions.
    #[must_use]
    pub fn tenured_regions_count(&self) -> usize {
        self.tenured_regions.load(Ordering::Relaxed)
    }

    /// Maximum number of young slots.
    #[must_use]
    pub const fn max_young_regions(&self) -> usize {
        self.max_young_regions
    }

    /// Maximum number of tenured slots.
    #[must_use]
    pub const fn max_tenured_regions(&self) -> usize {
        self.max_tenured_regions
    }

    /// Bytes of all slots in use.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        (self.usable_regions - self.free_regions_count()) * self.region_size
    }

    /// Calls `f` for every allocated region.
    pub fn iterate_regions(&self, mut f: impl FnMut(&Region)) {
        for (slot, owner) in self.owners.iter().enumerate() {
            if owner.load(Ordering::Acquire) as usize == slot {
                let region = &self.regions[slot];
                if !region.is_free() {
                    f(region);
                }
            }
        }
    }

    /// Records a reference from `from` to `to` in the target's remembered set.
    ///
    /// Same-region references and references from young objects are skipped.
    pub fn add_ref_with_addr(&self, from: ObjectRef, to: ObjectRef) {
        let (Some(from_region), Some(to_region)) =
            (self.get_region(from.addr()), self.get_region(to.addr()))
        else {
            return;
        };
        if from_region.id() == to_region.id() || from_region.is_young() {
            return;
        }
        to_region
            .rem_set()
            .add_ref(from_region.id(), self.card_table.card_of(from.addr()));
    }

    /// Drops the cards of `ids` from every remembered set.
    pub fn invalidate_rem_sets(&self, ids: &[RegionId]) {
        if ids.is_empty() {
            return;
        }
        self.iterate_regions(|region| {
            for id in ids {
                region.rem_set().invalidate_region(*id);
            }
        });
    }
}

fn take_run(free: &mut BTreeSet<u32>, count: usize) -> Option<u32> {
    let mut run_start = 0;
    let mut run_len = 0;
    let mut prev: Option<u32> = None;
    let mut found = None;
    for &slot in free.iter() {
        if prev.is_some_and(|p| p + 1 == slot) {
            run_len += 1;
        } else {
            run_start = slot;
            run_len = 1;
        }
        prev = Some(slot);
        if run_len == count {
            found = Some(run_start);
            break;
        }
    }
    let start = found?;
    for slot in start..start + run_len as u32 {
        free.remove(&slot);
    }
    Some(start)
}

// ============================================================================
// RegionSpace
// ============================================================================

/// The set of regions owned by one allocator.
pub struct RegionSpace {
    space_type: SpaceType,
    pool: Arc<RegionPool>,
    regions: Mutex<Vec<RegionId>>,
}

impl RegionSpace {
    /// Creates an empty space on `pool`.
    #[must_use]
    pub const fn new(space_type: SpaceType, pool: Arc<RegionPool>) -> Self {
        Self {
            space_type,
            pool,
            regions: Mutex::new(Vec::new()),
        }
    }

    /// Kind of space.
    #[must_use]
    pub const fn space_type(&self) -> SpaceType {
        self.space_type
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &Arc<RegionPool> {
        &self.pool
    }

    /// Creates a region owned by this space.
    pub fn new_region(&self, flags: RegionFlags, size: usize) -> Option<&Region> {
        let region = self.pool.new_region(self.space_type, flags, size)?;
        self.regions.lock().push(region.id());
        Some(region)
    }

    /// Returns a region of this space to the pool.
    pub fn free_region(&self, region: &Region) {
        debug_assert_eq!(region.space(), self.space_type);
        self.regions.lock().retain(|id| *id != region.id());
        self.pool.free_region(region);
    }

    /// Reclassifies a young region of this space as tenured.
    pub fn promote_young_region(&self, region: &Region) {
        self.pool.promote_young_region(region);
    }

    /// Ids of the regions owned right now.
    #[must_use]
    pub fn region_ids(&self) -> Vec<RegionId> {
        self.regions.lock().clone()
    }

    /// Number of regions owned.
    #[must_use]
    pub fn region_count(&self) -> usize {
        self.regions.lock().len()
    }

    /// Calls `f` for each region; regions created or freed by `f` do not
    /// disturb the iteration.
    pub fn iterate_regions(&self, mut f: impl FnMut(&Region)) {
        for id in self.region_ids() {
            f(self.pool.region(id));
        }
    }

    /// Frees every region of the space.
    pub fn free_all_regions(&self) {
        let ids = std::mem::take(&mut *self.regions.lock());
        for id in ids {
            self.pool.free_region(self.pool.region(id));
        }
    }

    /// Whether `addr` lies in a region of this space.
    #[must_use]
    pub fn contain_object(&self, addr: usize) -> bool {
        self.pool
            .get_region(addr)
            .is_some_and(|region| region.space() == self.space_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> GcSettings {
        GcSettings {
            region_size: 64 * 1024,
            heap_size: 16 * 64 * 1024,
            init_heap_size: 8 * 64 * 1024,
            young_size: 4 * 64 * 1024,
            ..GcSettings::default()
        }
    }

    #[test]
    fn test_new_and_free_region() {
        let pool = RegionPool::new(&settings()).unwrap();
        let rs = pool.region_size();
        assert_eq!(pool.free_regions_count(), 16);

        let region = pool
            .new_region(SpaceType::Object, RegionFlags::IS_OLD, rs)
            .unwrap();
        assert_eq!(region.size(), rs);
        assert!(region.is_old());
        assert_eq!(pool.free_regions_count(), 15);
        assert_eq!(pool.get_region(region.begin() + 100).unwrap().id(), region.id());

        pool.free_region(region);
        assert!(pool.get_region(region.begin()).is_none());
        assert_eq!(pool.free_regions_count(), 16);
    }

    #[test]
    fn test_humongous_lookup_from_any_byte() {
        let pool = RegionPool::new(&settings()).unwrap();
        let rs = pool.region_size();
        let region = pool
            .new_region(
                SpaceType::Humongous,
                RegionFlags::IS_OLD | RegionFlags::IS_LARGE_OBJECT,
                3 * rs,
            )
            .unwrap();
        for offset in [0, rs, 2 * rs + 5, 3 * rs - 8] {
            let found = pool.get_region(region.begin() + offset).unwrap();
            assert_eq!(found.id(), region.id());
        }
        assert_eq!(pool.free_regions_count(), 13);
        pool.free_region(region);
        assert_eq!(pool.free_regions_count(), 16);
    }

    #[test]
    fn test_block_before_extension() {
        let pool = RegionPool::new(&settings()).unwrap();
        let rs = pool.region_size();
        let mut taken = Vec::new();
        for _ in 0..pool.block_regions() {
            let r = pool
                .new_region(SpaceType::Object, RegionFlags::IS_OLD, rs)
                .unwrap();
            assert!(r.id().index() < pool.block_regions());
            taken.push(r.id());
        }
        let ext = pool
            .new_region(SpaceType::Object, RegionFlags::IS_OLD, rs)
            .unwrap();
        assert!(ext.id().index() >= pool.block_regions());
        pool.free_region(ext);
    }

    #[test]
    fn test_no_extension_when_disabled() {
        let pool = RegionPool::new(&GcSettings {
            extend_heap: false,
            ..settings()
        })
        .unwrap();
        assert_eq!(pool.usable_regions(), pool.block_regions());
        assert!(pool.have_free_regions(8));
        assert!(!pool.have_free_regions(9));
    }

    #[test]
    fn test_young_budget_and_promotion() {
        let pool = RegionPool::new(&settings()).unwrap();
        let rs = pool.region_size();
        let young: Vec<_> = (0..4)
            .map(|_| {
                pool.new_region(SpaceType::Object, RegionFlags::IS_EDEN, rs)
                    .unwrap()
            })
            .collect();
        assert!(pool
            .new_region(SpaceType::Object, RegionFlags::IS_EDEN, rs)
            .is_none());
        let card = pool.card_table().card_of(young[0].begin());
        assert!(pool.card_table().is_young(card));

        pool.promote_young_region(young[0]);
        assert!(young[0].has_flag(RegionFlags::IS_OLD | RegionFlags::IS_PROMOTED));
        assert!(!young[0].is_young());
        assert!(pool.card_table().is_clear(card));
        assert_eq!(pool.young_regions_count(), 3);
        assert_eq!(pool.tenured_regions_count(), 1);
        assert!(pool
            .new_region(SpaceType::Object, RegionFlags::IS_EDEN, rs)
            .is_some());
    }

    #[test]
    fn test_space_tracks_regions() {
        let pool = Arc::new(RegionPool::new(&settings()).unwrap());
        let space = RegionSpace::new(SpaceType::NonMovable, Arc::clone(&pool));
        let rs = pool.region_size();
        let a = space
            .new_region(RegionFlags::IS_NONMOVABLE, rs)
            .unwrap();
        let _b = space
            .new_region(RegionFlags::IS_NONMOVABLE, rs)
            .unwrap();
        assert_eq!(space.region_count(), 2);
        assert!(space.contain_object(a.begin()));

        space.free_region(a);
        assert_eq!(space.region_count(), 1);
        space.free_all_regions();
        assert_eq!(space.region_count(), 0);
        assert_eq!(pool.free_regions_count(), 16);
    }
}

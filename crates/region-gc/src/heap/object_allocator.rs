//! The allocation entry point.
//!
//! Every request is classified once by size and movability and then handed
//! to exactly one of the three space allocators. Regular requests that fit a
//! TLAB are served by the mutator's buffer; everything else takes a shared path.

use std::ptr::NonNull;
use std::sync::Arc;

use super::humongous::RegionHumongousAllocator;
use super::nonmovable::{Reclaimed, RegionNonmovableAllocator};
use super::pool::RegionPool;
use super::region::{region_size_for, Region, RegionFlags, RegionId, SpaceType};
use super::region_allocator::{ObjectStatus, RegionAllocator, RegionKind};
use super::tlab::Tlab;
use crate::config::GcSettings;
use crate::error::GcError;
use crate::mem_stats::HeapMemStats;
use crate::object::{checked_object_size, ObjectRef};

/// Whether an object may be moved by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocationKind {
    /// Regular object; may be evacuated.
    #[default]
    Movable,
    /// The object keeps its address for its whole life.
    NonMovable,
}

/// The allocator family a request is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationClass {
    /// Bump allocation in eden.
    Regular,
    /// Free-list allocation in nonmovable regions.
    NonMovable,
    /// Dedicated regions.
    Humongous,
}

impl AllocationClass {
    /// The space objects of this class live in.
    #[must_use]
    pub const fn space(self) -> SpaceType {
        match self {
            Self::Regular => SpaceType::Object,
            Self::NonMovable => SpaceType::NonMovable,
            Self::Humongous => SpaceType::Humongous,
        }
    }
}

/// Object allocator for all spaces of one heap.
pub struct G1ObjectAllocator {
    pool: Arc<RegionPool>,
    object: RegionAllocator,
    nonmovable: RegionNonmovableAllocator,
    humongous: RegionHumongousAllocator,
    tlab_size: usize,
    mem_stats: Arc<HeapMemStats>,
}

impl G1ObjectAllocator {
    /// Reserves the heap and sets up the three spaces.
    ///
    /// # Errors
    ///
    /// See [`RegionPool::new`].
    pub fn new(settings: &GcSettings, mem_stats: Arc<HeapMemStats>) -> Result<Self, GcError> {
        let pool = Arc::new(RegionPool::new(settings)?);
        Ok(Self {
            object: RegionAllocator::new(Arc::clone(&pool)),
            nonmovable: RegionNonmovableAllocator::new(Arc::clone(&pool)),
            humongous: RegionHumongousAllocator::new(Arc::clone(&pool)),
            pool,
            tlab_size: settings.tlab_size,
            mem_stats,
        })
    }

    /// The region pool.
    #[must_use]
    pub const fn pool(&self) -> &Arc<RegionPool> {
        &self.pool
    }

    /// The movable-object allocator.
    #[must_use]
    pub const fn object_allocator(&self) -> &RegionAllocator {
        &self.object
    }

    /// The nonmovable allocator.
    #[must_use]
    pub const fn nonmovable_allocator(&self) -> &RegionNonmovableAllocator {
        &self.nonmovable
    }

    /// The humongous allocator.
    #[must_use]
    pub const fn humongous_allocator(&self) -> &RegionHumongousAllocator {
        &self.humongous
    }

    /// Cumulative heap counters.
    #[must_use]
    pub fn mem_stats(&self) -> &HeapMemStats {
        &self.mem_stats
    }

    /// Size of a full TLAB.
    #[must_use]
    pub const fn tlab_size(&self) -> usize {
        self.tlab_size
    }

    /// Largest object served by bump allocation.
    #[must_use]
    pub fn max_regular_object_size(&self) -> usize {
        self.object.max_regular_object_size()
    }

    /// Routes a request of `size` bytes.
    #[must_use]
    pub fn classify(&self, size: usize, kind: AllocationKind) -> AllocationClass {
        match kind {
            AllocationKind::Movable if size <= self.max_regular_object_size() => {
                AllocationClass::Regular
            }
            AllocationKind::NonMovable if size <= self.nonmovable.max_size() => {
                AllocationClass::NonMovable
            }
            _ => AllocationClass::Humongous,
        }
    }

    /// Whether a regular object of `size` bytes is served from TLABs.
    #[must_use]
    pub const fn fits_tlab(&self, size: usize) -> bool {
        size <= self.tlab_size
    }

    /// Allocates and formats an object on the shared path.
    ///
    /// Nonmovable and humongous objects are recorded in their region's live
    /// bitmap once their header is written. Requests above
    /// [`MAX_OBJECT_SIZE`](crate::object::MAX_OBJECT_SIZE) fail.
    pub fn allocate(
        &self,
        ref_count: usize,
        payload: usize,
        kind: AllocationKind,
    ) -> Option<(ObjectRef, AllocationClass)> {
        let size = checked_object_size(ref_count, payload)?;
        let class = self.classify(size, kind);
        let mem = match class {
            AllocationClass::Regular => self.object.alloc(size, RegionKind::Eden),
            AllocationClass::NonMovable => self.nonmovable.alloc(size),
            AllocationClass::Humongous => self.humongous.alloc(size),
        }?;
        Some((self.format(mem, size, ref_count, class), class))
    }

    /// Allocates a regular object inside `tlab`.
    pub fn allocate_in_tlab(&self, tlab: &Tlab, ref_count: usize, payload: usize) -> Option<ObjectRef> {
        let size = checked_object_size(ref_count, payload)?;
        let mem = tlab.alloc(size)?;
        Some(self.format(mem, size, ref_count, AllocationClass::Regular))
    }

    fn format(&self, mem: NonNull<u8>, size: usize, ref_count: usize, class: AllocationClass) -> ObjectRef {
        // SAFETY: `mem` was just reserved for `size` bytes by one of our allocators.
        let obj = unsafe { ObjectRef::init(mem, size, ref_count) };
        let recorded = match class {
            AllocationClass::Regular => size,
            AllocationClass::NonMovable => {
                let region = self.pool.object_region(obj);
                region.set_live_bit(obj);
                region.add_live_bytes(size);
                size
            }
            AllocationClass::Humongous => {
                let region = self.pool.object_region(obj);
                region.set_live_bit(obj);
                region_size_for(size, self.pool.region_size())
            }
        };
        self.mem_stats.record_allocation(class.space(), recorded);
        obj
    }

    /// Creates a TLAB able to hold at least `min_size` bytes.
    pub fn create_new_tlab(&self, min_size: usize) -> Option<Arc<Tlab>> {
        self.object
            .create_new_tlab(self.tlab_size.max(min_size), min_size)
    }

    /// Ids of all eden regions.
    #[must_use]
    pub fn young_regions(&self) -> Vec<RegionId> {
        self.object.get_all_specific_regions(RegionFlags::IS_EDEN)
    }

    /// Ids of all regions of the movable space.
    #[must_use]
    pub fn movable_regions(&self) -> Vec<RegionId> {
        self.object.space().region_ids()
    }

    /// Ids of every allocated region.
    #[must_use]
    pub fn all_regions(&self) -> Vec<RegionId> {
        let mut ids = Vec::new();
        self.pool.iterate_regions(|region| ids.push(region.id()));
        ids
    }

    /// Whether at least `count` region slots are free.
    #[must_use]
    pub fn have_free_regions(&self, count: usize) -> bool {
        self.pool.have_free_regions(count)
    }

    /// Whether `count` more tenured regions fit the tenured budget.
    #[must_use]
    pub fn have_tenured_size(&self, count: usize) -> bool {
        self.pool.have_tenured_size(count)
    }

    /// Frees all eden regions and forgets TLAB remainders.
    pub fn reset_young_allocator(&self) {
        self.object.reset_all_eden_regions();
    }

    /// Sweeps the nonmovable and humongous spaces.
    ///
    /// `region_visitor` sees every region about to return to the pool.
    /// Returns what was reclaimed in the nonmovable and humongous spaces.
    pub fn collect_non_regular_regions(
        &self,
        mut death_checker: impl FnMut(ObjectRef) -> ObjectStatus,
        mut region_visitor: impl FnMut(&Region),
    ) -> (Reclaimed, Reclaimed) {
        let nonmovable = self.nonmovable.collect(&mut death_checker);
        self.nonmovable
            .visit_and_remove_free_regions(&mut region_visitor);
        let humongous = self
            .humongous
            .collect_and_remove_free_regions(&mut region_visitor, &mut death_checker);
        self.mem_stats
            .record_freed(SpaceType::NonMovable, nonmovable.objects, nonmovable.bytes);
        self.mem_stats
            .record_freed(SpaceType::Humongous, humongous.objects, humongous.bytes);
        (nonmovable, humongous)
    }

    /// Region containing `obj`.
    #[must_use]
    pub fn region_of(&self, obj: ObjectRef) -> &Region {
        self.pool.object_region(obj)
    }

    /// Whether `obj` lives in a young region.
    #[must_use]
    pub fn is_young(&self, obj: ObjectRef) -> bool {
        self.pool
            .get_region(obj.addr())
            .is_some_and(Region::is_young)
    }

    /// Calls `f` for every object in every space.
    pub fn iterate_over_objects(&self, mut f: impl FnMut(ObjectRef)) {
        self.object.iterate_over_objects(&mut f);
        self.nonmovable.iterate_over_objects(&mut f);
        self.humongous.iterate_over_objects(&mut f);
    }

    /// Returns every region to the pool.
    pub fn free_all_regions(&self) {
        self.object.clear_current_region(RegionKind::Eden);
        self.object.clear_current_region(RegionKind::Old);
        self.object.space().free_all_regions();
        self.nonmovable.free_all_regions();
        self.humongous.space().free_all_regions();
    }
}

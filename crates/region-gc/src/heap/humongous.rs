//! Humongous objects: one object per (multi-slot) region.

use std::ptr::NonNull;
use std::sync::Arc;

use super::nonmovable::Reclaimed;
use super::pool::{RegionPool, RegionSpace};
use super::region::{region_size_for, Region, RegionFlags, SpaceType};
use super::region_allocator::ObjectStatus;
use crate::object::{align_up, ObjectRef, OBJECT_ALIGNMENT};

/// Allocator for the humongous space.
pub struct RegionHumongousAllocator {
    space: RegionSpace,
}

impl RegionHumongousAllocator {
    /// Creates an allocator over `pool`.
    #[must_use]
    pub const fn new(pool: Arc<RegionPool>) -> Self {
        Self {
            space: RegionSpace::new(SpaceType::Humongous, pool),
        }
    }

    /// The space backing this allocator.
    #[must_use]
    pub const fn space(&self) -> &RegionSpace {
        &self.space
    }

    /// Allocates a dedicated region of `region_size_for(size)` bytes.
    ///
    /// The object starts at the region's first byte; nothing else is ever
    /// placed in the region.
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let size = align_up(size, OBJECT_ALIGNMENT);
        let pool = self.space.pool();
        let region = self.space.new_region(
            RegionFlags::IS_OLD | RegionFlags::IS_LARGE_OBJECT,
            region_size_for(size, pool.region_size()),
        )?;
        region.alloc::<false>(size)
    }

    /// Frees every humongous region whose object `death_checker` declares dead.
    ///
    /// `region_visitor` sees each region before it is freed. Freed bytes are
    /// the full region size.
    pub fn collect_and_remove_free_regions(
        &self,
        mut region_visitor: impl FnMut(&Region),
        mut death_checker: impl FnMut(ObjectRef) -> ObjectStatus,
    ) -> Reclaimed {
        let pool = self.space.pool();
        let mut reclaimed = Reclaimed::default();
        for id in self.space.region_ids() {
            let region = pool.region(id);
            let mut dead = true;
            region.iterate_over_objects(|obj| {
                dead = death_checker(obj) == ObjectStatus::Dead;
            });
            if dead {
                region_visitor(region);
                reclaimed.add(region.size());
                self.space.free_region(region);
            }
        }
        reclaimed
    }

    /// Calls `f` for every humongous object.
    pub fn iterate_over_objects(&self, mut f: impl FnMut(ObjectRef)) {
        self.space
            .iterate_regions(|region| region.iterate_over_objects(&mut f));
    }
}

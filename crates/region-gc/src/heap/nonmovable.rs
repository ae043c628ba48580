//! Free-list allocation for objects that must never move.
//!
//! Nonmovable regions are carved by bumping like any other region, but freed
//! objects go to size-keyed free lists and are reused before the bump tail
//! grows. Objects are enumerated through the live bitmap, so the allocator
//! never has to walk dead or free memory.

use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

use super::pool::{RegionPool, RegionSpace};
use super::region::{Region, RegionFlags, RegionId, SpaceType};
use super::region_allocator::ObjectStatus;
use crate::gc::sync::{LockGuard, LockOrder};
use crate::object::{align_up, ObjectRef, HEADER_SIZE, OBJECT_ALIGNMENT};

/// Part of a region reserved for bookkeeping; requests above
/// `region_size - NONMOVABLE_RESERVE` go to the humongous allocator.
pub const NONMOVABLE_RESERVE: usize = 1024;

/// Objects and bytes handed back by a sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Reclaimed {
    /// Number of objects freed.
    pub objects: usize,
    /// Bytes freed.
    pub bytes: usize,
}

impl Reclaimed {
    pub(crate) fn add(&mut self, bytes: usize) {
        self.objects += 1;
        self.bytes += bytes;
    }
}

#[derive(Default)]
struct FreeLists {
    /// Block size to block addresses.
    blocks: BTreeMap<usize, Vec<usize>>,
    current: Option<RegionId>,
}

impl FreeLists {
    fn take(&mut self, size: usize) -> Option<usize> {
        // Remainders smaller than a header cannot be kept on a list.
        let block = self
            .blocks
            .range(size..)
            .map(|(block, _)| *block)
            .find(|block| *block == size || *block - size >= HEADER_SIZE)?;
        let addrs = self.blocks.get_mut(&block)?;
        let addr = addrs.pop()?;
        if addrs.is_empty() {
            self.blocks.remove(&block);
        }
        if block > size {
            self.put(addr + size, block - size);
        }
        Some(addr)
    }

    fn put(&mut self, addr: usize, size: usize) {
        self.blocks.entry(size).or_default().push(addr);
    }

    fn drop_range(&mut self, begin: usize, end: usize) {
        self.blocks.retain(|_, addrs| {
            addrs.retain(|addr| !(begin..end).contains(addr));
            !addrs.is_empty()
        });
    }

    fn free_bytes(&self) -> usize {
        self.blocks
            .iter()
            .map(|(size, addrs)| size * addrs.len())
            .sum()
    }
}

/// Allocator for the nonmovable space.
pub struct RegionNonmovableAllocator {
    space: RegionSpace,
    lists: Mutex<FreeLists>,
}

impl RegionNonmovableAllocator {
    /// Creates an allocator over `pool`.
    #[must_use]
    pub fn new(pool: Arc<RegionPool>) -> Self {
        Self {
            space: RegionSpace::new(SpaceType::NonMovable, pool),
            lists: Mutex::new(FreeLists::default()),
        }
    }

    /// The space backing this allocator.
    #[must_use]
    pub const fn space(&self) -> &RegionSpace {
        &self.space
    }

    /// Largest object this allocator accepts.
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.space.pool().region_size() - NONMOVABLE_RESERVE
    }

    /// Allocates `size` bytes, reusing freed blocks first.
    ///
    /// The caller formats the memory and then records the object with
    /// [`Region::set_live_bit`].
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let size = align_up(size, OBJECT_ALIGNMENT);
        if size > self.max_size() {
            return None;
        }
        let pool = self.space.pool();
        let _order = LockGuard::new(LockOrder::Allocator);
        let mut lists = self.lists.lock();
        if let Some(addr) = lists.take(size) {
            return NonNull::new(addr as *mut u8);
        }
        if let Some(mem) = lists
            .current
            .and_then(|id| pool.region(id).alloc::<false>(size))
        {
            return Some(mem);
        }
        let region = self
            .space
            .new_region(RegionFlags::IS_NONMOVABLE, pool.region_size())?;
        lists.current = Some(region.id());
        region.alloc::<false>(size)
    }

    /// Frees a single object.
    pub fn free(&self, obj: ObjectRef) {
        let region = self.space.pool().object_region(obj);
        debug_assert!(region.is_nonmovable());
        let size = obj.size();
        region.clear_live_bit(obj);
        region.set_live_bytes(region.live_bytes().saturating_sub(size));
        let _order = LockGuard::new(LockOrder::Allocator);
        self.lists.lock().put(obj.addr(), size);
    }

    /// Frees every live object that `death_checker` declares dead.
    pub fn collect(&self, mut death_checker: impl FnMut(ObjectRef) -> ObjectStatus) -> Reclaimed {
        let mut reclaimed = Reclaimed::default();
        let mut dead = Vec::new();
        self.space.iterate_regions(|region| {
            region.iterate_over_live_objects(|obj| {
                if death_checker(obj) == ObjectStatus::Dead {
                    dead.push(obj);
                }
            });
        });
        for obj in dead {
            reclaimed.add(obj.size());
            self.free(obj);
        }
        reclaimed
    }

    /// Releases regions without live objects; `visitor` sees each one
    /// before it goes back to the pool.
    pub fn visit_and_remove_free_regions(&self, mut visitor: impl FnMut(&Region)) {
        let pool = self.space.pool();
        for id in self.space.region_ids() {
            let region = pool.region(id);
            if !region.live_bitmap().is_empty() {
                continue;
            }
            visitor(region);
            {
                let _order = LockGuard::new(LockOrder::Allocator);
                let mut lists = self.lists.lock();
                lists.drop_range(region.begin(), region.end());
                if lists.current == Some(id) {
                    lists.current = None;
                }
            }
            self.space.free_region(region);
        }
    }

    /// Returns every region to the pool and forgets the free lists.
    pub fn free_all_regions(&self) {
        {
            let _order = LockGuard::new(LockOrder::Allocator);
            *self.lists.lock() = FreeLists::default();
        }
        self.space.free_all_regions();
    }

    /// Bytes currently sitting on free lists.
    #[must_use]
    pub fn free_list_bytes(&self) -> usize {
        self.lists.lock().free_bytes()
    }

    /// Calls `f` for every live object.
    pub fn iterate_over_objects(&self, mut f: impl FnMut(ObjectRef)) {
        self.space
            .iterate_regions(|region| region.iterate_over_live_objects(&mut f));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcSettings;
    use crate::object::object_size;

    const RS: usize = 64 * 1024;

    fn allocator() -> RegionNonmovableAllocator {
        let settings = GcSettings {
            region_size: RS,
            heap_size: 16 * RS,
            init_heap_size: 8 * RS,
            young_size: 4 * RS,
            ..GcSettings::default()
        };
        RegionNonmovableAllocator::new(Arc::new(RegionPool::new(&settings).unwrap()))
    }

    fn new_object(alloc: &RegionNonmovableAllocator, payload: usize) -> ObjectRef {
        let size = object_size(0, payload);
        let mem = alloc.alloc(size).unwrap();
        let obj = unsafe { ObjectRef::init(mem, size, 0) };
        let region = alloc.space().pool().object_region(obj);
        region.set_live_bit(obj);
        region.add_live_bytes(size);
        obj
    }

    #[test]
    fn test_freed_block_is_reused() {
        let alloc = allocator();
        let a = new_object(&alloc, 48);
        let _b = new_object(&alloc, 48);
        alloc.free(a);
        assert_eq!(alloc.free_list_bytes(), a.size());
        let c = new_object(&alloc, 48);
        assert_eq!(c, a);
        assert_eq!(alloc.free_list_bytes(), 0);
    }

    #[test]
    fn test_large_block_is_split() {
        let alloc = allocator();
        let a = new_object(&alloc, 240);
        let _guard = new_object(&alloc, 8);
        alloc.free(a);
        let small = new_object(&alloc, 48);
        assert_eq!(small.addr(), a.addr());
        assert_eq!(alloc.free_list_bytes(), a.size() - small.size());
    }

    #[test]
    fn test_oversized_requests_are_refused() {
        let alloc = allocator();
        assert!(alloc.alloc(RS - NONMOVABLE_RESERVE + 8).is_none());
        assert!(alloc.alloc(RS - NONMOVABLE_RESERVE).is_some());
    }

    #[test]
    fn test_collect_and_release_regions() {
        let alloc = allocator();
        let objs: Vec<_> = (0..10).map(|_| new_object(&alloc, 32)).collect();
        let keep = objs[3];
        let reclaimed = alloc.collect(|o| {
            if o == keep {
                ObjectStatus::Alive
            } else {
                ObjectStatus::Dead
            }
        });
        assert_eq!(reclaimed.objects, 9);
        assert_eq!(reclaimed.bytes, 9 * keep.size());

        let mut visited = 0;
        alloc.visit_and_remove_free_regions(|_| visited += 1);
        assert_eq!(visited, 0);

        alloc.collect(|_| ObjectStatus::Dead);
        alloc.visit_and_remove_free_regions(|_| visited += 1);
        assert_eq!(visited, 1);
        assert_eq!(alloc.space().region_count(), 0);
        assert_eq!(alloc.free_list_bytes(), 0);
    }

    #[test]
    fn test_objects_never_move_between_allocations() {
        let alloc = allocator();
        let objs: Vec<_> = (0..100).map(|_| new_object(&alloc, 64)).collect();
        let mut seen = Vec::new();
        alloc.iterate_over_objects(|o| seen.push(o));
        assert_eq!(seen, objs);
    }
}

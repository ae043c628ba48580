//! Integration tests for the allocation paths.
//!
//! Several mutator threads allocate from all three spaces at once; objects
//! must never overlap and the per-space counters must add up.

use std::collections::HashSet;

use region_gc::heap::{region_size_for, G1ObjectAllocator};
use region_gc::object::object_size;
use region_gc::{
    AllocationClass, AllocationKind, GcHeap, GcSettings, HeapMemStats, ObjectRef, SpaceType,
};

const RS: usize = 64 * 1024;

fn settings() -> GcSettings {
    GcSettings {
        region_size: RS,
        heap_size: 64 * RS,
        init_heap_size: 64 * RS,
        young_size: 32 * RS,
        tlab_size: 4096,
        enable_gc_thread: false,
        concurrent_update_remset: false,
        ..GcSettings::default()
    }
}

fn assert_disjoint(mut objects: Vec<(usize, usize)>) {
    objects.sort_unstable();
    for pair in objects.windows(2) {
        let (addr, size) = pair[0];
        assert!(addr + size <= pair[1].0, "{addr:#x}+{size} overlaps {:#x}", pair[1].0);
    }
}

#[test]
fn test_threads_allocate_disjoint_objects() {
    let heap = GcHeap::new(settings()).unwrap();
    let objects: Vec<(usize, usize)> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..4u64)
            .map(|t| {
                let heap = &heap;
                s.spawn(move || {
                    let mutator = heap.mutator();
                    let _running = mutator.enter();
                    let mut mine = Vec::new();
                    for i in 0..500u64 {
                        let kind = if i % 10 == 0 {
                            AllocationKind::NonMovable
                        } else {
                            AllocationKind::Movable
                        };
                        let obj = mutator.allocate(0, 8 + (i as usize % 5) * 8, kind).unwrap();
                        // SAFETY: every payload holds at least eight bytes.
                        unsafe { obj.payload().cast::<u64>().write_unaligned(t << 32 | i) };
                        mine.push(obj.addr());
                    }
                    // No collection ran, so every object is still in place.
                    for (i, addr) in mine.iter().enumerate() {
                        // SAFETY: the object at `addr` was allocated above and never moved.
                        let obj = unsafe { ObjectRef::from_addr(*addr) }.unwrap();
                        let tag = unsafe { obj.payload().cast::<u64>().read_unaligned() };
                        assert_eq!(tag, t << 32 | i as u64);
                    }
                    mine.into_iter()
                        .map(|addr| {
                            // SAFETY: as above.
                            let obj = unsafe { ObjectRef::from_addr(addr) }.unwrap();
                            (addr, obj.size())
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect()
    });

    assert_eq!(heap.history().total_recorded(), 0);
    assert_eq!(objects.len(), 2000);
    let stats = heap.mem_stats();
    assert_eq!(stats.allocated_objects(SpaceType::Object), 1800);
    assert_eq!(stats.allocated_objects(SpaceType::NonMovable), 200);
    assert_eq!(
        stats.allocated_bytes(SpaceType::Object) + stats.allocated_bytes(SpaceType::NonMovable),
        objects.iter().map(|(_, size)| size).sum::<usize>()
    );
    assert_disjoint(objects);
}

#[test]
fn test_threads_get_private_tlabs() {
    let allocator = G1ObjectAllocator::new(&settings(), HeapMemStats::new().into()).unwrap();
    let tlabs: Vec<(usize, usize)> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let allocator = &allocator;
                s.spawn(move || {
                    (0..20)
                        .map(|_| {
                            let tlab = allocator.create_new_tlab(0).unwrap();
                            while allocator.allocate_in_tlab(&tlab, 1, 16).is_some() {}
                            assert!(tlab.remaining() < object_size(1, 16));
                            (tlab.start(), tlab.size())
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect()
    });

    assert_eq!(tlabs.len(), 80);
    assert!(tlabs.iter().all(|&(_, size)| size == 4096));
    assert_disjoint(tlabs);
    for id in allocator.young_regions() {
        assert!(allocator.pool().region(id).is_young());
    }
}

#[test]
fn test_humongous_objects_are_exclusive() {
    let allocator = G1ObjectAllocator::new(&settings(), HeapMemStats::new().into()).unwrap();
    let sizes = [RS, RS + 1, 3 * RS, 100];
    let mut regions = HashSet::new();
    for size in sizes {
        let (obj, class) = allocator.allocate(0, size, AllocationKind::NonMovable).unwrap();
        let region = allocator.region_of(obj);
        if size < RS / 2 {
            assert_eq!(class, AllocationClass::NonMovable);
            continue;
        }
        assert_eq!(class, AllocationClass::Humongous);
        assert!(region.is_humongous());
        assert_eq!(region.begin(), obj.addr());
        assert_eq!(region.size(), region_size_for(obj.size(), RS));
        assert!(regions.insert(region.id()));
    }
    assert_eq!(allocator.mem_stats().allocated_objects(SpaceType::Humongous), 3);
    assert_eq!(
        allocator.mem_stats().allocated_bytes(SpaceType::Humongous),
        8 * RS
    );
}

//! Loom tests for the lock-free parts of the heap.
//!
//! These tests exercise the compare-and-swap protocols of the shared bump
//! pointer and the card table under every interleaving loom explores.

use std::sync::Arc;

use region_gc::heap::{CardState, CardTable, RegionFlags, RegionPool, SpaceType, CARD_SIZE};
use region_gc::GcSettings;

const RS: usize = 64 * 1024;

fn pool() -> Arc<RegionPool> {
    let settings = GcSettings {
        region_size: RS,
        heap_size: 4 * RS,
        init_heap_size: 4 * RS,
        young_size: RS,
        enable_gc_thread: false,
        concurrent_update_remset: false,
        ..GcSettings::default()
    };
    Arc::new(RegionPool::new(&settings).unwrap())
}

/// Two threads bumping the same region never get overlapping ranges.
#[test]
#[ignore = "loom test - run with cargo test loom_bump --release"]
fn test_loom_bump_ranges_are_disjoint() {
    loom::model(|| {
        let pool = pool();
        let id = pool
            .new_region(SpaceType::Object, RegionFlags::IS_OLD, RS)
            .unwrap()
            .id();

        let threads: Vec<_> = (0..2)
            .map(|_| {
                let pool = Arc::clone(&pool);
                loom::thread::spawn(move || {
                    pool.region(id)
                        .alloc::<true>(64)
                        .map(|p| p.as_ptr() as usize)
                })
            })
            .collect();
        let mut addrs: Vec<usize> = threads
            .into_iter()
            .map(|t| t.join().unwrap().unwrap())
            .collect();
        addrs.sort_unstable();

        let region = pool.region(id);
        assert_eq!(addrs, vec![region.begin(), region.begin() + 64]);
        assert_eq!(region.top(), region.begin() + 128);
    });
}

/// The last bytes of a region go to exactly one of two racing threads.
#[test]
#[ignore = "loom test - run with cargo test loom_bump --release"]
fn test_loom_bump_tail_has_one_winner() {
    loom::model(|| {
        let pool = pool();
        let region = pool
            .new_region(SpaceType::Object, RegionFlags::IS_OLD, RS)
            .unwrap();
        region.alloc::<true>(RS - 64).unwrap();
        let id = region.id();

        let threads: Vec<_> = (0..2)
            .map(|_| {
                let pool = Arc::clone(&pool);
                loom::thread::spawn(move || pool.region(id).alloc::<true>(64).is_some())
            })
            .collect();
        let winners = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(pool.region(id).top(), pool.region(id).end());
    });
}

/// A clear card is handed to exactly one of the threads marking it.
#[test]
#[ignore = "loom test - run with cargo test loom_card --release"]
fn test_loom_card_mark_has_one_winner() {
    loom::model(|| {
        let table = Arc::new(CardTable::new(0x10_0000, 4 * CARD_SIZE));
        let card = table.card_of(0x10_0000 + CARD_SIZE);

        let threads: Vec<_> = (0..2)
            .map(|_| {
                let table = Arc::clone(&table);
                loom::thread::spawn(move || table.mark(card))
            })
            .collect();
        let winners = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(table.state(card), CardState::Marked);
    });
}

/// Clearing a card before scanning it lets a concurrent store mark it again.
#[test]
#[ignore = "loom test - run with cargo test loom_card --release"]
fn test_loom_card_cleared_during_store() {
    loom::model(|| {
        let table = Arc::new(CardTable::new(0x10_0000, 4 * CARD_SIZE));
        let card = table.card_of(0x10_0000);
        assert!(table.mark(card));

        let refiner = loom::thread::spawn({
            let table = Arc::clone(&table);
            move || table.clear_card(card)
        });
        let mutator = loom::thread::spawn({
            let table = Arc::clone(&table);
            move || table.mark(card)
        });

        let cleared = refiner.join().unwrap();
        let marked = mutator.join().unwrap();
        assert!(cleared);
        // A store seen after the clear queues the card again.
        assert_eq!(table.state(card) == CardState::Marked, marked);
    });
}

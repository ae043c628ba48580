//! Remembered sets.
//!
//! A region's remembered set records the cards of *other* regions that may
//! hold references into it, grouped by source region so a freed source can be
//! dropped in one step.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;

use super::card_table::CardIndex;
use super::region::RegionId;

/// Incoming cross-region references of one region.
#[derive(Default)]
pub struct RemSet {
    refs: Mutex<BTreeMap<RegionId, BTreeSet<CardIndex>>>,
}

impl RemSet {
    /// Creates an empty remembered set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `card` of region `from` may reference this region.
    pub fn add_ref(&self, from: RegionId, card: CardIndex) {
        self.refs.lock().entry(from).or_default().insert(card);
    }

    /// Calls `f(from, card)` for every recorded card.
    ///
    /// Iterates over a snapshot, so `f` may add to this or other sets.
    pub fn proceed_marked_cards(&self, mut f: impl FnMut(RegionId, CardIndex)) {
        let snapshot: Vec<(RegionId, CardIndex)> = self
            .refs
            .lock()
            .iter()
            .flat_map(|(from, cards)| cards.iter().map(move |card| (*from, *card)))
            .collect();
        for (from, card) in snapshot {
            f(from, card);
        }
    }

    /// Forgets every card that belongs to `from`.
    pub fn invalidate_region(&self, from: RegionId) {
        self.refs.lock().remove(&from);
    }

    /// Whether any card of `from` is recorded.
    #[must_use]
    pub fn contains_region(&self, from: RegionId) -> bool {
        self.refs.lock().contains_key(&from)
    }

    /// Number of recorded cards.
    #[must_use]
    pub fn card_count(&self) -> usize {
        self.refs.lock().values().map(BTreeSet::len).sum()
    }

    /// Whether nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.refs.lock().is_empty()
    }

    /// Drops all entries.
    pub fn clear(&self) {
        self.refs.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_invalidate() {
        let set = RemSet::new();
        let a = RegionId::new(1);
        let b = RegionId::new(2);
        set.add_ref(a, CardIndex::new(10));
        set.add_ref(a, CardIndex::new(10));
        set.add_ref(a, CardIndex::new(11));
        set.add_ref(b, CardIndex::new(40));
        assert_eq!(set.card_count(), 3);

        set.invalidate_region(a);
        assert!(!set.contains_region(a));
        assert!(set.contains_region(b));

        let mut seen = Vec::new();
        set.proceed_marked_cards(|from, card| seen.push((from, card)));
        assert_eq!(seen, vec![(b, CardIndex::new(40))]);

        set.clear();
        assert!(set.is_empty());
    }
}

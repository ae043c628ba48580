//! The collection set of one cycle.
//!
//! A single vector partitioned into three contiguous runs:
//!
//! ```text
//! [0, tenured_begin)                young
//! [tenured_begin, humongous_begin)  tenured, movable
//! [humongous_begin, len)            humongous
//! ```
//!
//! [`CollectionSet::add_region`] keeps the runs contiguous and each run in
//! insertion order.

use std::ops::Range;

use crate::heap::region::{Region, RegionId};

/// Regions chosen for one collection.
#[derive(Debug, Default, Clone)]
pub struct CollectionSet {
    regions: Vec<RegionId>,
    tenured_begin: usize,
    humongous_begin: usize,
}

impl CollectionSet {
    /// Creates a set holding the young regions of `young`.
    #[must_use]
    pub fn new(young: &[&Region]) -> Self {
        debug_assert!(young.iter().all(|r| r.is_young()));
        let regions: Vec<RegionId> = young.iter().map(|r| r.id()).collect();
        let len = regions.len();
        Self {
            regions,
            tenured_begin: len,
            humongous_begin: len,
        }
    }

    /// Adds a tenured or humongous region.
    ///
    /// A movable tenured region is rotated in front of the humongous run so
    /// it stays contiguous with the other tenured regions.
    pub fn add_region(&mut self, region: &Region) {
        debug_assert!(region.is_old(), "only tenured regions are added: {region:?}");
        self.regions.push(region.id());
        if !region.is_humongous() {
            self.regions[self.humongous_begin..].rotate_right(1);
            self.humongous_begin += 1;
        }
        debug_assert!(self.tenured_begin <= self.humongous_begin);
        debug_assert!(self.humongous_begin <= self.regions.len());
    }

    /// Every region, young first.
    #[must_use]
    pub fn all(&self) -> &[RegionId] {
        &self.regions
    }

    /// Young regions.
    #[must_use]
    pub fn young(&self) -> &[RegionId] {
        &self.regions[self.young_range()]
    }

    /// Movable tenured regions.
    #[must_use]
    pub fn tenured(&self) -> &[RegionId] {
        &self.regions[self.tenured_begin..self.humongous_begin]
    }

    /// Humongous regions.
    #[must_use]
    pub fn humongous(&self) -> &[RegionId] {
        &self.regions[self.humongous_begin..]
    }

    /// Young and tenured regions; everything that may be evacuated.
    #[must_use]
    pub fn movable(&self) -> &[RegionId] {
        &self.regions[..self.humongous_begin]
    }

    const fn young_range(&self) -> Range<usize> {
        0..self.tenured_begin
    }

    /// Index of the first tenured region.
    #[must_use]
    pub const fn tenured_begin(&self) -> usize {
        self.tenured_begin
    }

    /// Index of the first humongous region.
    #[must_use]
    pub const fn humongous_begin(&self) -> usize {
        self.humongous_begin
    }

    /// Number of regions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Whether `id` is part of the set.
    #[must_use]
    pub fn contains(&self, id: RegionId) -> bool {
        self.regions.contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::region::{RegionFlags, SpaceType};

    const SIZE: usize = 4096;

    fn region(index: u32, flags: RegionFlags) -> Region {
        let begin = 0x1000_0000 + index as usize * SIZE;
        let region = Region::new(RegionId::new(index), begin, SIZE);
        region.init(begin + SIZE, flags, SpaceType::Object);
        region
    }

    #[test]
    fn test_young_then_one_tenured() {
        let young = region(0, RegionFlags::IS_EDEN);
        let tenured = region(1, RegionFlags::IS_OLD);
        let mut cs = CollectionSet::new(&[&young]);
        cs.add_region(&tenured);

        assert_eq!(cs.len(), 2);
        assert_eq!(cs.young(), &[young.id()]);
        assert_eq!(cs.tenured(), &[tenured.id()]);
        assert!(cs.humongous().is_empty());
        assert_eq!(cs.movable().len(), 2);
    }

    #[test]
    fn test_mixed_insertion_keeps_runs() {
        let young = region(0, RegionFlags::IS_EDEN);
        let t1 = region(1, RegionFlags::IS_OLD);
        let h1 = region(2, RegionFlags::IS_OLD | RegionFlags::IS_LARGE_OBJECT);
        let h2 = region(3, RegionFlags::IS_OLD | RegionFlags::IS_LARGE_OBJECT);
        let t2 = region(4, RegionFlags::IS_OLD);

        let mut cs = CollectionSet::new(&[&young]);
        cs.add_region(&t1);
        cs.add_region(&h1);
        cs.add_region(&h2);
        cs.add_region(&t2);

        assert_eq!(cs.len(), 5);
        assert_eq!(cs.young().len(), 1);
        assert_eq!(cs.tenured(), &[t1.id(), t2.id()]);
        assert_eq!(cs.humongous(), &[h1.id(), h2.id()]);
        assert_eq!(
            cs.all(),
            &[young.id(), t1.id(), t2.id(), h1.id(), h2.id()]
        );
        assert_eq!(cs.movable(), &[young.id(), t1.id(), t2.id()]);
        assert!(cs.tenured_begin() <= cs.humongous_begin());
    }

    #[test]
    fn test_humongous_only() {
        let h = region(0, RegionFlags::IS_OLD | RegionFlags::IS_LARGE_OBJECT);
        let mut cs = CollectionSet::new(&[]);
        cs.add_region(&h);
        assert!(cs.young().is_empty());
        assert!(cs.tenured().is_empty());
        assert!(cs.movable().is_empty());
        assert_eq!(cs.humongous(), &[h.id()]);
    }
}

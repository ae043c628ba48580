//! Per-region object bitmaps.
//!
//! Each region owns two [`MarkBitmap`]s with one bit per
//! [`OBJECT_ALIGNMENT`](crate::object::OBJECT_ALIGNMENT) granule. One is the
//! live bitmap (objects known to be alive after the last completed marking)
//! and the other the mark bitmap (filled by the marking in progress).

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// An atomic bitmap used for marking and liveness.
///
/// # Example
///
/// ```
/// use region_gc::gc::mark::MarkBitmap;
///
/// let bitmap = MarkBitmap::new(512);
/// assert_eq!(bitmap.capacity(), 512);
/// assert!(!bitmap.is_marked(0));
///
/// assert!(bitmap.atomic_test_and_set(0));
/// assert!(!bitmap.atomic_test_and_set(0));
/// assert!(bitmap.is_marked(0));
/// ```
#[derive(Debug)]
pub struct MarkBitmap {
    /// Bitmap storage, one bit per granule.
    bitmap: Box<[AtomicU64]>,
    /// Number of granules covered.
    capacity: usize,
    /// Number of set bits (atomic for parallel access).
    marked_count: AtomicUsize,
}

impl MarkBitmap {
    /// Create a new bitmap with the given capacity in bits.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not a multiple of 64.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity % 64 == 0,
            "MarkBitmap capacity must be aligned to 64"
        );
        let bitmap = (0..capacity / 64).map(|_| AtomicU64::new(0)).collect();
        Self {
            bitmap,
            capacity,
            marked_count: AtomicUsize::new(0),
        }
    }

    /// Number of bits.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of set bits.
    #[must_use]
    pub fn marked_count(&self) -> usize {
        self.marked_count.load(Ordering::Relaxed)
    }

    /// Whether no bit is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.marked_count() == 0
    }

    /// Sets bit `index` and reports whether this call was the one that set it.
    ///
    /// Two threads racing on the same bit agree on exactly one winner.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn atomic_test_and_set(&self, index: usize) -> bool {
        let mask = 1u64 << (index % 64);
        let prev = self.bitmap[index / 64].fetch_or(mask, Ordering::AcqRel);
        let newly_set = prev & mask == 0;
        if newly_set {
            self.marked_count.fetch_add(1, Ordering::Relaxed);
        }
        newly_set
    }

    /// Sets bit `index`.
    pub fn mark(&self, index: usize) {
        self.atomic_test_and_set(index);
    }

    /// Clears bit `index`.
    pub fn clear_bit(&self, index: usize) {
        let mask = 1u64 << (index % 64);
        let prev = self.bitmap[index / 64].fetch_and(!mask, Ordering::AcqRel);
        if prev & mask != 0 {
            self.marked_count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Whether bit `index` is set.
    #[must_use]
    pub fn is_marked(&self, index: usize) -> bool {
        (self.bitmap[index / 64].load(Ordering::Acquire) >> (index % 64)) & 1 != 0
    }

    /// Clear all bits for reuse.
    pub fn clear(&self) {
        for word in &*self.bitmap {
            word.store(0, Ordering::Relaxed);
        }
        self.marked_count.store(0, Ordering::Relaxed);
    }

    /// Replaces the contents of `self` with those of `other`.
    pub fn copy_from(&self, other: &Self) {
        debug_assert_eq!(self.capacity, other.capacity);
        for (dst, src) in self.bitmap.iter().zip(other.bitmap.iter()) {
            dst.store(src.load(Ordering::Acquire), Ordering::Relaxed);
        }
        self.marked_count
            .store(other.marked_count(), Ordering::Relaxed);
    }

    /// Calls `f` with every set bit index in ascending order.
    pub fn iterate(&self, f: impl FnMut(usize)) {
        self.iterate_range(0, self.capacity, f);
    }

    /// Calls `f` with every set bit index in `[start, end)` in ascending order.
    pub fn iterate_range(&self, start: usize, end: usize, mut f: impl FnMut(usize)) {
        let end = end.min(self.capacity);
        if start >= end {
            return;
        }
        let first_word = start / 64;
        let last_word = (end - 1) / 64;
        for word_index in first_word..=last_word {
            let mut word = self.bitmap[word_index].load(Ordering::Acquire);
            if word_index == first_word {
                word &= u64::MAX << (start % 64);
            }
            if word_index == last_word && end % 64 != 0 {
                word &= u64::MAX >> (64 - end % 64);
            }
            while word != 0 {
                let bit = word.trailing_zeros() as usize;
                f(word_index * 64 + bit);
                word &= word - 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MarkBitmap;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_mark_bitmap_concurrent_mark() {
        let bitmap = Arc::new(MarkBitmap::new(512));
        let mut handles = Vec::new();

        for _ in 0..4 {
            let bitmap = Arc::clone(&bitmap);
            handles.push(thread::spawn(move || {
                (0..512).filter(|&j| bitmap.atomic_test_and_set(j)).count()
            }));
        }

        let winners: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(winners, 512);
        assert_eq!(bitmap.marked_count(), 512);
    }

    #[test]
    fn test_mark_bitmap_clear_bit() {
        let bitmap = MarkBitmap::new(128);
        bitmap.mark(3);
        bitmap.mark(70);
        bitmap.clear_bit(3);
        bitmap.clear_bit(3);
        assert!(!bitmap.is_marked(3));
        assert!(bitmap.is_marked(70));
        assert_eq!(bitmap.marked_count(), 1);
    }

    #[test]
    fn test_mark_bitmap_iterate_range() {
        let bitmap = MarkBitmap::new(256);
        for i in [0, 5, 63, 64, 100, 191, 255] {
            bitmap.mark(i);
        }

        let mut all = Vec::new();
        bitmap.iterate(|i| all.push(i));
        assert_eq!(all, vec![0, 5, 63, 64, 100, 191, 255]);

        let mut some = Vec::new();
        bitmap.iterate_range(5, 101, |i| some.push(i));
        assert_eq!(some, vec![5, 63, 64, 100]);

        let mut none = Vec::new();
        bitmap.iterate_range(101, 101, |i| none.push(i));
        assert!(none.is_empty());
    }

    #[test]
    fn test_mark_bitmap_copy_from() {
        let a = MarkBitmap::new(128);
        let b = MarkBitmap::new(128);
        a.mark(1);
        a.mark(127);
        b.mark(50);

        b.copy_from(&a);
        assert!(b.is_marked(1));
        assert!(b.is_marked(127));
        assert!(!b.is_marked(50));
        assert_eq!(b.marked_count(), 2);

        a.clear();
        assert!(a.is_empty());
        assert!(b.is_marked(1));
    }
}

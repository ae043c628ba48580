//! Heap regions.
//!
//! A [`Region`] is the unit of allocation and collection: a contiguous range
//! `[begin, end)` with a bump pointer, two object bitmaps and a remembered set.
//! Region metadata lives in the pool's slot table for the whole lifetime of the
//! pool; creating and destroying a region only reinitializes that metadata.

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::rem_set::RemSet;
use super::tlab::Tlab;
use crate::gc::mark::MarkBitmap;
use crate::object::{align_up, ObjectRef, OBJECT_ALIGNMENT};

// ============================================================================
// Flags
// ============================================================================

/// Region classification bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RegionFlags(u32);

impl RegionFlags {
    /// No flag set.
    pub const NONE: Self = Self(0);
    /// Young region receiving new objects.
    pub const IS_EDEN: Self = Self(1 << 0);
    /// Young region holding survivors.
    pub const IS_SURVIVOR: Self = Self(1 << 1);
    /// Tenured region.
    pub const IS_OLD: Self = Self(1 << 2);
    /// Region holding a single humongous object.
    pub const IS_LARGE_OBJECT: Self = Self(1 << 3);
    /// Region served by the free-list allocator; objects never move.
    pub const IS_NONMOVABLE: Self = Self(1 << 4);
    /// Region carved into thread-local allocation buffers.
    pub const IS_TLAB: Self = Self(1 << 5);
    /// Region is part of the current collection set.
    pub const IS_COLLECTION_SET: Self = Self(1 << 6);
    /// Slot is not in use.
    pub const IS_FREE: Self = Self(1 << 7);
    /// Former young region promoted in place.
    pub const IS_PROMOTED: Self = Self(1 << 8);

    const NAMES: [(Self, &'static str); 9] = [
        (Self::IS_EDEN, "EDEN"),
        (Self::IS_SURVIVOR, "SURVIVOR"),
        (Self::IS_OLD, "OLD"),
        (Self::IS_LARGE_OBJECT, "LARGE_OBJECT"),
        (Self::IS_NONMOVABLE, "NONMOVABLE"),
        (Self::IS_TLAB, "TLAB"),
        (Self::IS_COLLECTION_SET, "COLLECTION_SET"),
        (Self::IS_FREE, "FREE"),
        (Self::IS_PROMOTED, "PROMOTED"),
    ];

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any bit of `other` is set in `self`.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Bitwise union.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether no bit is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for RegionFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl std::ops::BitOrAssign for RegionFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.union(rhs);
    }
}

impl fmt::Debug for RegionFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_set();
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                list.entry(&format_args!("{name}"));
            }
        }
        list.finish()
    }
}

// ============================================================================
// Identity and ownership
// ============================================================================

/// Pool-relative index of a region slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(u32);

impl RegionId {
    /// Creates an id from a slot index.
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Slot index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) const fn raw(self) -> u32 {
        self.0
    }
}

/// The space that owns a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SpaceType {
    /// Not owned.
    Free = 0,
    /// Movable objects (eden and tenured bump regions).
    Object = 1,
    /// Free-list regions for objects that never move.
    NonMovable = 2,
    /// Regions holding one humongous object each.
    Humongous = 3,
}

impl SpaceType {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Object,
            2 => Self::NonMovable,
            3 => Self::Humongous,
            _ => Self::Free,
        }
    }
}

// ============================================================================
// Region
// ============================================================================

/// A fixed-size heap chunk.
pub struct Region {
    id: RegionId,
    begin: usize,
    end: AtomicUsize,
    top: AtomicUsize,
    flags: AtomicU32,
    space: AtomicU8,
    live_bytes: AtomicUsize,
    /// Double-buffered bitmaps; `live_index` selects the live one.
    bitmaps: [MarkBitmap; 2],
    live_index: AtomicUsize,
    rem_set: RemSet,
    tlabs: Mutex<Vec<Arc<Tlab>>>,
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("id", &self.id)
            .field("begin", &format_args!("{:#x}", self.begin))
            .field("end", &format_args!("{:#x}", self.end()))
            .field("top", &format_args!("{:#x}", self.top()))
            .field("flags", &self.flags())
            .field("live_bytes", &self.live_bytes())
            .finish()
    }
}

impl Region {
    /// Creates the metadata of a free slot covering `[begin, begin + size)`.
    pub(crate) fn new(id: RegionId, begin: usize, size: usize) -> Self {
        let granules = size / OBJECT_ALIGNMENT;
        Self {
            id,
            begin,
            end: AtomicUsize::new(begin + size),
            top: AtomicUsize::new(begin),
            flags: AtomicU32::new(RegionFlags::IS_FREE.bits()),
            space: AtomicU8::new(SpaceType::Free as u8),
            live_bytes: AtomicUsize::new(0),
            bitmaps: [MarkBitmap::new(granules), MarkBitmap::new(granules)],
            live_index: AtomicUsize::new(0),
            rem_set: RemSet::new(),
            tlabs: Mutex::new(Vec::new()),
        }
    }

    /// Prepares a free slot for use by `space`.
    pub(crate) fn init(&self, end: usize, flags: RegionFlags, space: SpaceType) {
        self.end.store(end, Ordering::Relaxed);
        self.top.store(self.begin, Ordering::Relaxed);
        self.live_bytes.store(0, Ordering::Relaxed);
        self.live_index.store(0, Ordering::Relaxed);
        for bitmap in &self.bitmaps {
            bitmap.clear();
        }
        self.rem_set.clear();
        self.tlabs.lock().clear();
        self.space.store(space as u8, Ordering::Relaxed);
        self.flags.store(flags.bits(), Ordering::Release);
    }

    /// Returns the slot to the free state.
    pub(crate) fn destroy(&self, region_size: usize) {
        self.flags
            .store(RegionFlags::IS_FREE.bits(), Ordering::Release);
        self.space.store(SpaceType::Free as u8, Ordering::Relaxed);
        self.top.store(self.begin, Ordering::Relaxed);
        self.end.store(self.begin + region_size, Ordering::Relaxed);
        self.live_bytes.store(0, Ordering::Relaxed);
        self.rem_set.clear();
        self.tlabs.lock().clear();
    }

    // ------------------------------------------------------------------------
    // Geometry
    // ------------------------------------------------------------------------

    /// Pool slot index.
    #[must_use]
    pub const fn id(&self) -> RegionId {
        self.id
    }

    /// First byte.
    #[must_use]
    pub const fn begin(&self) -> usize {
        self.begin
    }

    /// One past the last byte.
    #[must_use]
    pub fn end(&self) -> usize {
        self.end.load(Ordering::Relaxed)
    }

    /// Bump pointer.
    #[must_use]
    pub fn top(&self) -> usize {
        self.top.load(Ordering::Acquire)
    }

    /// Size in bytes; a multiple of the region size.
    #[must_use]
    pub fn size(&self) -> usize {
        self.end() - self.begin
    }

    /// Whether `addr` lies in `[begin, end)`.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.begin && addr < self.end()
    }

    /// Owning space.
    #[must_use]
    pub fn space(&self) -> SpaceType {
        SpaceType::from_u8(self.space.load(Ordering::Relaxed))
    }

    // ------------------------------------------------------------------------
    // Flags
    // ------------------------------------------------------------------------

    /// Current flags.
    #[must_use]
    pub fn flags(&self) -> RegionFlags {
        RegionFlags(self.flags.load(Ordering::Acquire))
    }

    /// Whether all bits of `flag` are set.
    #[must_use]
    pub fn has_flag(&self, flag: RegionFlags) -> bool {
        self.flags().contains(flag)
    }

    /// Sets `flag`.
    pub fn add_flag(&self, flag: RegionFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    /// Clears `flag`.
    pub fn rm_flag(&self, flag: RegionFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    /// Eden or survivor.
    #[must_use]
    pub fn is_young(&self) -> bool {
        self.flags()
            .intersects(RegionFlags::IS_EDEN | RegionFlags::IS_SURVIVOR)
    }

    /// Eden.
    #[must_use]
    pub fn is_eden(&self) -> bool {
        self.has_flag(RegionFlags::IS_EDEN)
    }

    /// Tenured.
    #[must_use]
    pub fn is_old(&self) -> bool {
        self.has_flag(RegionFlags::IS_OLD)
    }

    /// Humongous.
    #[must_use]
    pub fn is_humongous(&self) -> bool {
        self.has_flag(RegionFlags::IS_LARGE_OBJECT)
    }

    /// Nonmovable free-list region.
    #[must_use]
    pub fn is_nonmovable(&self) -> bool {
        self.has_flag(RegionFlags::IS_NONMOVABLE)
    }

    /// Member of the current collection set.
    #[must_use]
    pub fn is_in_collection_set(&self) -> bool {
        self.has_flag(RegionFlags::IS_COLLECTION_SET)
    }

    /// Carved into TLABs.
    #[must_use]
    pub fn is_tlab(&self) -> bool {
        self.has_flag(RegionFlags::IS_TLAB)
    }

    /// Not in use.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.has_flag(RegionFlags::IS_FREE)
    }

    // ------------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------------

    /// Reserves `size` bytes by bumping `top`.
    ///
    /// The atomic variant may be called by many threads at once; every
    /// successful call gets a disjoint range. The non-atomic variant is for a
    /// single owner. Returns `None` when the region cannot fit the request.
    pub fn alloc<const ATOMIC: bool>(&self, size: usize) -> Option<NonNull<u8>> {
        debug_assert!(!self.is_tlab(), "bump allocation in a TLAB region");
        let size = align_up(size, OBJECT_ALIGNMENT);
        let end = self.end();
        if ATOMIC {
            let mut top = self.top.load(Ordering::Relaxed);
            loop {
                let new_top = top.checked_add(size)?;
                if new_top > end {
                    return None;
                }
                match self.top.compare_exchange_weak(
                    top,
                    new_top,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return NonNull::new(top as *mut u8),
                    Err(actual) => top = actual,
                }
            }
        } else {
            let top = self.top.load(Ordering::Relaxed);
            let new_top = top.checked_add(size)?;
            if new_top > end {
                return None;
            }
            self.top.store(new_top, Ordering::Release);
            NonNull::new(top as *mut u8)
        }
    }

    /// Carves a TLAB of exactly `size` bytes after the previous one.
    pub(crate) fn create_tlab(&self, size: usize) -> Option<Arc<Tlab>> {
        debug_assert!(self.is_tlab());
        debug_assert_eq!(self.top(), self.begin);
        let mut tlabs = self.tlabs.lock();
        let cursor = tlabs.last().map_or(self.begin, |t| t.end());
        if self.end() - cursor < size {
            return None;
        }
        let tlab = Arc::new(Tlab::new(cursor, size));
        tlabs.push(Arc::clone(&tlab));
        Some(tlab)
    }

    /// Bytes not yet handed out to TLABs.
    #[must_use]
    pub fn remaining_tlab_size(&self) -> usize {
        let tlabs = self.tlabs.lock();
        self.end() - tlabs.last().map_or(self.begin, |t| t.end())
    }

    /// Number of TLABs carved from this region.
    #[must_use]
    pub fn tlab_count(&self) -> usize {
        self.tlabs.lock().len()
    }

    /// Bytes occupied by objects, dead or alive.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        if self.is_tlab() {
            self.tlabs.lock().iter().map(|t| t.occupied_size()).sum()
        } else {
            self.top() - self.begin
        }
    }

    // ------------------------------------------------------------------------
    // Liveness
    // ------------------------------------------------------------------------

    /// Bytes known to be alive.
    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Acquire)
    }

    /// Adds to the live byte counter.
    pub fn add_live_bytes(&self, bytes: usize) {
        self.live_bytes.fetch_add(bytes, Ordering::AcqRel);
        debug_assert!(self.live_bytes() <= self.size());
    }

    /// Subtracts from the live byte counter.
    pub fn sub_live_bytes(&self, bytes: usize) {
        let prev = self.live_bytes.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes);
    }

    /// Overwrites the live byte counter.
    pub fn set_live_bytes(&self, bytes: usize) {
        self.live_bytes.store(bytes, Ordering::Release);
    }

    /// `allocated - live`.
    #[must_use]
    pub fn garbage_bytes(&self) -> usize {
        self.allocated_bytes().saturating_sub(self.live_bytes())
    }

    /// The bitmap describing objects alive after the last completed marking.
    #[must_use]
    pub fn live_bitmap(&self) -> &MarkBitmap {
        &self.bitmaps[self.live_index.load(Ordering::Acquire)]
    }

    /// The bitmap filled by the marking in progress.
    #[must_use]
    pub fn mark_bitmap(&self) -> &MarkBitmap {
        &self.bitmaps[1 - self.live_index.load(Ordering::Acquire)]
    }

    /// Makes the mark bitmap the live one and vice versa.
    pub fn swap_mark_bitmap(&self) {
        self.live_index.fetch_xor(1, Ordering::AcqRel);
    }

    /// Copies the mark bitmap into the live bitmap.
    pub fn clone_mark_bitmap_to_live_bitmap(&self) {
        self.live_bitmap().copy_from(self.mark_bitmap());
    }

    #[inline]
    fn bit_index(&self, addr: usize) -> usize {
        debug_assert!(self.contains(addr));
        (addr - self.begin) / OBJECT_ALIGNMENT
    }

    #[inline]
    fn object_at(&self, index: usize) -> ObjectRef {
        // SAFETY: bitmap bits are only set for object starts.
        unsafe { ObjectRef::from_addr(self.begin + index * OBJECT_ALIGNMENT) }
            .unwrap_or_else(|| unreachable!("region begins at address zero"))
    }

    /// Marks `obj`; returns `true` if this call marked it first.
    pub fn mark_if_not_marked(&self, obj: ObjectRef) -> bool {
        self.mark_bitmap()
            .atomic_test_and_set(self.bit_index(obj.addr()))
    }

    /// Whether `obj` is marked by the current marking.
    #[must_use]
    pub fn is_marked(&self, obj: ObjectRef) -> bool {
        self.mark_bitmap().is_marked(self.bit_index(obj.addr()))
    }

    /// Records `obj` as alive.
    pub fn set_live_bit(&self, obj: ObjectRef) {
        self.live_bitmap().mark(self.bit_index(obj.addr()));
    }

    /// Removes `obj` from the live bitmap.
    pub fn clear_live_bit(&self, obj: ObjectRef) {
        self.live_bitmap().clear_bit(self.bit_index(obj.addr()));
    }

    /// Whether `obj` is in the live bitmap.
    #[must_use]
    pub fn is_live(&self, obj: ObjectRef) -> bool {
        self.live_bitmap().is_marked(self.bit_index(obj.addr()))
    }

    /// Sum of the sizes of marked objects.
    #[must_use]
    pub fn calc_mark_bytes(&self) -> usize {
        let mut bytes = 0;
        self.iterate_over_marked_objects(|obj| bytes += obj.size());
        bytes
    }

    // ------------------------------------------------------------------------
    // Iteration
    // ------------------------------------------------------------------------

    /// Calls `f` for every object in the region.
    ///
    /// Bump regions are walked from `begin` to `top`, TLAB regions per TLAB,
    /// nonmovable regions through the live bitmap. A zero size word ends a walk:
    /// it belongs to memory reserved by an allocation that has not written its
    /// header yet.
    pub fn iterate_over_objects(&self, mut f: impl FnMut(ObjectRef)) {
        if self.is_nonmovable() {
            self.iterate_bitmap(self.live_bitmap(), f);
        } else if self.is_tlab() {
            let tlabs = self.tlabs.lock().clone();
            for tlab in tlabs {
                walk_objects(tlab.start(), tlab.top(), &mut f);
            }
        } else {
            walk_objects(self.begin, self.top(), &mut f);
        }
    }

    /// Calls `f` for every object set in the mark bitmap.
    pub fn iterate_over_marked_objects(&self, f: impl FnMut(ObjectRef)) {
        self.iterate_bitmap(self.mark_bitmap(), f);
    }

    /// Calls `f` for every object set in the live bitmap.
    pub fn iterate_over_live_objects(&self, f: impl FnMut(ObjectRef)) {
        self.iterate_bitmap(self.live_bitmap(), f);
    }

    /// Calls `f` for every live object starting in `[start, end)`.
    pub fn iterate_over_live_objects_in_range(
        &self,
        start: usize,
        end: usize,
        mut f: impl FnMut(ObjectRef),
    ) {
        let start = start.max(self.begin);
        let end = end.min(self.end());
        if start >= end {
            return;
        }
        let first = (start - self.begin) / OBJECT_ALIGNMENT;
        let last = (end - self.begin).div_ceil(OBJECT_ALIGNMENT);
        self.live_bitmap()
            .iterate_range(first, last, |index| f(self.object_at(index)));
    }

    fn iterate_bitmap(&self, bitmap: &MarkBitmap, mut f: impl FnMut(ObjectRef)) {
        bitmap.iterate(|index| f(self.object_at(index)));
    }

    /// Incoming references from other regions.
    #[must_use]
    pub const fn rem_set(&self) -> &RemSet {
        &self.rem_set
    }
}

fn walk_objects(start: usize, end: usize, f: &mut impl FnMut(ObjectRef)) {
    let mut addr = start;
    while addr < end {
        // SAFETY: everything below `top` is a sequence of formatted objects,
        // except memory whose header is still being written (size zero).
        let Some(obj) = (unsafe { ObjectRef::from_addr(addr) }) else {
            break;
        };
        let size = obj.size();
        if size == 0 {
            break;
        }
        f(obj);
        addr += size;
    }
}

/// Size of the region(s) needed for an object of `object_size` bytes.
#[must_use]
pub const fn region_size_for(object_size: usize, region_size: usize) -> usize {
    align_up(object_size, region_size)
}

//! Object layout understood by the collector.
//!
//! Every heap object starts with an [`ObjectHeader`]:
//!
//! ```text
//! +----------------+-----------+---------------+------------------+-----------+
//! | forward (word) | size: u32 | ref_count: u32 | ref slots (words) | payload   |
//! +----------------+-----------+---------------+------------------+-----------+
//! ```
//!
//! The collector only needs the total size (to walk regions), the reference
//! slots (to trace and to rewrite after moving) and a forwarding word. Mark
//! state lives in region bitmaps, never in the header.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Alignment of every object start and every object size.
pub const OBJECT_ALIGNMENT: usize = 8;

/// Size of [`ObjectHeader`] in bytes.
pub const HEADER_SIZE: usize = std::mem::size_of::<ObjectHeader>();

/// Size of one reference slot.
pub const REF_SLOT_SIZE: usize = std::mem::size_of::<usize>();

/// Rounds `value` up to a power-of-two `align`.
#[inline]
#[must_use]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Total aligned size of an object with `ref_count` reference slots and
/// `payload` raw bytes.
#[inline]
#[must_use]
pub const fn object_size(ref_count: usize, payload: usize) -> usize {
    align_up(HEADER_SIZE + ref_count * REF_SLOT_SIZE + payload, OBJECT_ALIGNMENT)
}

/// Largest object the header can describe.
pub const MAX_OBJECT_SIZE: usize = (u32::MAX as usize) & !(OBJECT_ALIGNMENT - 1);

/// [`object_size`] for untrusted requests: `None` if the object would not
/// fit in [`MAX_OBJECT_SIZE`].
#[must_use]
pub fn checked_object_size(ref_count: usize, payload: usize) -> Option<usize> {
    let unaligned = ref_count
        .checked_mul(REF_SLOT_SIZE)?
        .checked_add(HEADER_SIZE)?
        .checked_add(payload)?;
    let size = unaligned.checked_add(OBJECT_ALIGNMENT - 1)? & !(OBJECT_ALIGNMENT - 1);
    (size <= MAX_OBJECT_SIZE).then_some(size)
}

/// Header stored at the start of every object.
#[repr(C)]
pub struct ObjectHeader {
    /// New address once the object has been evacuated, `0` otherwise.
    forward: AtomicUsize,
    size: u32,
    ref_count: u32,
}

/// A pointer to an object header inside the managed heap.
///
/// `ObjectRef` is a plain address: it does not keep the object alive and is
/// invalidated by any collection that moves the object. Values that must
/// survive a collection are kept in handles or other roots.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ObjectRef(NonNull<ObjectHeader>);

// SAFETY: an `ObjectRef` is an address; all access to the pointee goes
// through atomics or happens while mutators are stopped.
unsafe impl Send for ObjectRef {}
// SAFETY: see above.
unsafe impl Sync for ObjectRef {}

impl std::fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectRef({:#x})", self.addr())
    }
}

impl ObjectRef {
    /// Formats freshly allocated memory as an object and returns a reference to it.
    ///
    /// The whole object is zeroed, so every reference slot starts out null.
    ///
    /// # Safety
    ///
    /// `mem` must point to at least `size` writable bytes reserved for this
    /// object, aligned to [`OBJECT_ALIGNMENT`].
    #[allow(clippy::cast_possible_truncation)]
    pub unsafe fn init(mem: NonNull<u8>, size: usize, ref_count: usize) -> Self {
        debug_assert!(size >= HEADER_SIZE + ref_count * REF_SLOT_SIZE);
        debug_assert_eq!(size % OBJECT_ALIGNMENT, 0);
        debug_assert!(u32::try_from(size).is_ok());
        // SAFETY: the caller reserved `size` bytes at `mem`.
        unsafe {
            ptr::write_bytes(mem.as_ptr(), 0, size);
            let header = mem.as_ptr().cast::<ObjectHeader>();
            ptr::write(
                header,
                ObjectHeader {
                    forward: AtomicUsize::new(0),
                    size: size as u32,
                    ref_count: ref_count as u32,
                },
            );
        }
        Self(mem.cast())
    }

    /// Reinterprets a heap address as an object reference.
    ///
    /// # Safety
    ///
    /// `addr` must be zero or the start of a formatted object.
    #[inline]
    #[must_use]
    pub unsafe fn from_addr(addr: usize) -> Option<Self> {
        NonNull::new(addr as *mut ObjectHeader).map(Self)
    }

    /// Address of the object header.
    #[inline]
    #[must_use]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Raw pointer to the first byte of the object.
    #[inline]
    #[must_use]
    pub const fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr().cast()
    }

    #[inline]
    fn header(&self) -> &ObjectHeader {
        // SAFETY: an `ObjectRef` always points at a formatted header.
        unsafe { self.0.as_ref() }
    }

    /// Total size of the object in bytes, header included.
    #[inline]
    #[must_use]
    pub fn size(self) -> usize {
        self.header().size as usize
    }

    /// Number of reference slots.
    #[inline]
    #[must_use]
    pub fn ref_count(self) -> usize {
        self.header().ref_count as usize
    }

    /// One past the last byte of the object.
    #[inline]
    #[must_use]
    pub fn end(self) -> usize {
        self.addr() + self.size()
    }

    #[inline]
    fn slot(&self, index: usize) -> &AtomicUsize {
        assert!(index < self.ref_count(), "reference slot out of bounds");
        // SAFETY: the slot lies inside the object; slots are word aligned.
        unsafe {
            &*self
                .as_ptr()
                .add(HEADER_SIZE + index * REF_SLOT_SIZE)
                .cast::<AtomicUsize>()
        }
    }

    /// Reads reference slot `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= self.ref_count()`.
    #[inline]
    #[must_use]
    pub fn load_ref(self, index: usize) -> Option<Self> {
        let raw = self.slot(index).load(Ordering::Acquire);
        // SAFETY: slots only ever hold zero or object addresses.
        unsafe { Self::from_addr(raw) }
    }

    /// Writes reference slot `index` without any barrier.
    ///
    /// Mutators go through [`crate::Mutator::write_ref`]; this is for the
    /// collector and for initializing stores the barrier does not need to see.
    ///
    /// # Panics
    ///
    /// Panics if `index >= self.ref_count()`.
    #[inline]
    pub fn store_ref_raw(self, index: usize, value: Option<Self>) {
        self.slot(index)
            .store(value.map_or(0, Self::addr), Ordering::Release);
    }

    /// Calls `f(index, target)` for every non-null reference slot.
    pub fn for_each_ref(self, mut f: impl FnMut(usize, Self)) {
        for index in 0..self.ref_count() {
            if let Some(target) = self.load_ref(index) {
                f(index, target);
            }
        }
    }

    /// Whether the object has been evacuated.
    #[inline]
    #[must_use]
    pub fn is_forwarded(self) -> bool {
        self.header().forward.load(Ordering::Acquire) != 0
    }

    /// The evacuated copy, if any.
    #[inline]
    #[must_use]
    pub fn forwarded(self) -> Option<Self> {
        let raw = self.header().forward.load(Ordering::Acquire);
        // SAFETY: the forward word only ever holds zero or an object address.
        unsafe { Self::from_addr(raw) }
    }

    /// Follows the forwarding word if present.
    #[inline]
    #[must_use]
    pub fn resolve(self) -> Self {
        self.forwarded().unwrap_or(self)
    }

    /// Installs the forwarding address of an evacuated object.
    #[inline]
    pub fn set_forwarded(self, to: Self) {
        self.header().forward.store(to.addr(), Ordering::Release);
    }

    /// Clears the forwarding word, used on freshly copied objects.
    #[inline]
    pub(crate) fn clear_forwarded(self) {
        self.header().forward.store(0, Ordering::Relaxed);
    }

    /// Pointer to the raw payload that follows the reference slots.
    #[inline]
    #[must_use]
    pub fn payload(self) -> *mut u8 {
        // SAFETY: the payload starts inside the object.
        unsafe {
            self.as_ptr()
                .add(HEADER_SIZE + self.ref_count() * REF_SLOT_SIZE)
        }
    }

    /// Number of payload bytes, including alignment padding.
    #[inline]
    #[must_use]
    pub fn payload_len(self) -> usize {
        self.size() - HEADER_SIZE - self.ref_count() * REF_SLOT_SIZE
    }
}

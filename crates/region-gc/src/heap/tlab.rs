//! Thread-local allocation buffers.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::object::{align_up, OBJECT_ALIGNMENT};

/// A sub-range of an eden region reserved for one mutator.
///
/// Only the owning mutator bumps `top`; the collector reads it while the
/// mutator is stopped, so relaxed ordering plus the safepoint handshake is
/// enough.
#[derive(Debug)]
pub struct Tlab {
    start: usize,
    end: usize,
    top: AtomicUsize,
}

impl Tlab {
    pub(crate) const fn new(start: usize, size: usize) -> Self {
        Self {
            start,
            end: start + size,
            top: AtomicUsize::new(start),
        }
    }

    /// Bump-allocates `size` bytes, or returns `None` when the buffer is full.
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let size = align_up(size, OBJECT_ALIGNMENT);
        let top = self.top.load(Ordering::Relaxed);
        let new_top = top.checked_add(size)?;
        if new_top > self.end {
            return None;
        }
        self.top.store(new_top, Ordering::Relaxed);
        NonNull::new(top as *mut u8)
    }

    /// First byte of the buffer.
    #[must_use]
    pub const fn start(&self) -> usize {
        self.start
    }

    /// One past the last byte of the buffer.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.end
    }

    /// Current bump pointer.
    #[must_use]
    pub fn top(&self) -> usize {
        self.top.load(Ordering::Relaxed)
    }

    /// Capacity in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.end - self.start
    }

    /// Bytes handed out so far.
    #[must_use]
    pub fn occupied_size(&self) -> usize {
        self.top() - self.start
    }

    /// Bytes still available.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.end - self.top()
    }
}

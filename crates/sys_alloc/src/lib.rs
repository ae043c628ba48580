//! Address-space reservation for region heaps.
//!
//! A [`Reservation`] is one anonymous read-write mapping covering the whole
//! heap. Pages are backed lazily by the OS; [`Reservation::release`] hands the
//! pages of a sub-range back without unmapping it, so a freed region can be
//! reused later at the same address.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// A reserved, readable and writable address range, unmapped on drop.
pub struct Reservation {
    inner: os::Mapping,
}

impl Reservation {
    /// Reserves `len` bytes of zeroed memory.
    ///
    /// On unix no swap space is set aside for the range.
    ///
    /// # Errors
    ///
    /// Fails for a zero `len` or when the OS refuses the mapping.
    pub fn new(len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "reservation length must be greater than 0",
            ));
        }
        Ok(Self {
            inner: os::Mapping::reserve(len)?,
        })
    }

    /// First byte of the range; aligned to [`page_size`].
    #[must_use]
    pub fn base(&self) -> *mut u8 {
        self.inner.base()
    }

    /// Length of the range in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Always `false`; empty reservations cannot be created.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Hands the physical pages backing `[offset, offset + len)` back to the OS.
    ///
    /// The range stays mapped. On unix the next touch sees zero-filled pages;
    /// on Windows the contents become undefined.
    ///
    /// # Errors
    ///
    /// Fails if the range is not page aligned, exceeds the reservation, or
    /// the OS rejects the request.
    pub fn release(&self, offset: usize, len: usize) -> io::Result<()> {
        let page = page_size();
        if offset % page != 0 || len % page != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "release range must be page aligned",
            ));
        }
        if offset.checked_add(len).is_none_or(|end| end > self.len()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "release range exceeds the reservation",
            ));
        }
        if len == 0 {
            return Ok(());
        }
        // SAFETY: the range was checked to lie inside the mapping.
        unsafe { self.inner.release(offset, len) }
    }
}

// SAFETY: the reservation only hands out its base address; access to the
// memory is synchronized by its users.
unsafe impl Send for Reservation {}
// SAFETY: as above.
unsafe impl Sync for Reservation {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn test_page_size_is_power_of_two() {
        let page = page_size();
        assert!(page > 0);
        assert!(page.is_power_of_two());
    }

    #[test]
    fn test_reservation_is_zeroed_and_writable() {
        let len = page_size() * 2;
        let reservation = Reservation::new(len).unwrap();
        let base = reservation.base();
        assert_eq!(base as usize % page_size(), 0);
        assert_eq!(reservation.len(), len);
        unsafe {
            assert_eq!(ptr::read_volatile(base.add(len - 1)), 0);
            ptr::write_volatile(base, 42);
            assert_eq!(ptr::read_volatile(base), 42);
        }
    }

    #[test]
    fn test_zero_length_is_rejected() {
        assert!(Reservation::new(0).is_err());
    }

    #[test]
    fn test_release_keeps_range_usable() {
        let page = page_size();
        let reservation = Reservation::new(page * 4).unwrap();
        let base = reservation.base();
        unsafe { ptr::write_volatile(base.add(page), 7) };
        reservation.release(page, page * 2).unwrap();
        unsafe {
            ptr::write_volatile(base.add(page), 9);
            assert_eq!(ptr::read_volatile(base.add(page)), 9);
        }
    }

    #[test]
    fn test_release_rejects_bad_ranges() {
        let page = page_size();
        let reservation = Reservation::new(page * 2).unwrap();
        assert!(reservation.release(1, page).is_err());
        assert!(reservation.release(page, page * 2).is_err());
        assert!(reservation.release(usize::MAX - page + 1, page).is_err());
        assert!(reservation.release(0, 0).is_ok());
    }
}

use std::io;
use std::ptr;
use std::sync::OnceLock;

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
))]
const NO_SWAP_RESERVE: libc::c_int = libc::MAP_NORESERVE;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
)))]
const NO_SWAP_RESERVE: libc::c_int = 0;

/// The system page size, queried once.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        usize::try_from(size).unwrap_or(4096)
    })
}

pub struct Mapping {
    base: *mut libc::c_void,
    len: usize,
}

impl Mapping {
    pub fn reserve(len: usize) -> io::Result<Self> {
        let flags = libc::MAP_PRIVATE | libc::MAP_ANON | NO_SWAP_RESERVE;
        // SAFETY: a fresh anonymous mapping at an address of the kernel's choice.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { base, len })
    }

    pub fn base(&self) -> *mut u8 {
        self.base.cast()
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    /// # Safety
    ///
    /// `[offset, offset + len)` must lie inside the mapping and be page aligned.
    pub unsafe fn release(&self, offset: usize, len: usize) -> io::Result<()> {
        // SAFETY: the caller keeps the range inside the mapping.
        let addr = unsafe { self.base.cast::<u8>().add(offset) }.cast::<libc::c_void>();
        // SAFETY: as above; MADV_DONTNEED only drops the backing pages.
        if unsafe { libc::madvise(addr, len, libc::MADV_DONTNEED) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: the mapping was created by `reserve` and is unmapped once.
        unsafe {
            libc::munmap(self.base, self.len);
        }
    }
}

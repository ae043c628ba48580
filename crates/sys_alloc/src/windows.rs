use std::io;
use std::mem;
use std::ptr;
use std::sync::OnceLock;

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, MEM_RESET, PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

/// The system page size, queried once.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: GetSystemInfo fills the zeroed struct.
        let info = unsafe {
            let mut info: SYSTEM_INFO = mem::zeroed();
            GetSystemInfo(&mut info);
            info
        };
        match info.dwPageSize {
            0 => 4096,
            size => size as usize,
        }
    })
}

pub struct Mapping {
    base: *mut std::ffi::c_void,
    len: usize,
}

impl Mapping {
    pub fn reserve(len: usize) -> io::Result<Self> {
        // Committed memory is still backed lazily, on first touch.
        // SAFETY: a fresh allocation at an address of the system's choice.
        let base =
            unsafe { VirtualAlloc(ptr::null(), len, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE) };
        if base.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { base, len })
    }

    pub const fn base(&self) -> *mut u8 {
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
        let addr = unsafe { self.base.cast::<u8>().add(offset) }.cast::<std::ffi::c_void>();
        // SAFETY: MEM_RESET only discards the contents of committed pages.
        if unsafe { VirtualAlloc(addr, len, MEM_RESET, PAGE_READWRITE) }.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: MEM_RELEASE frees the whole allocation and requires a zero size.
        unsafe {
            VirtualFree(self.base, 0, MEM_RELEASE);
        }
    }
}

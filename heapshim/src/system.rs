//! Anonymous memory mapping with chunk alignment.
//!
//! Chunks must start on a `CHUNK_SIZE` boundary so that any interior pointer
//! can be masked down to its chunk header. mmap only guarantees page
//! alignment, so we over-map and trim the slack off both ends.

#[cfg(unix)]
#[allow(unused)]
mod unix {
    use core::ffi::c_void;

    pub const PROT_READ: i32 = 0x1;
    pub const PROT_WRITE: i32 = 0x2;

    pub const MAP_PRIVATE: i32 = 0x02;

    #[cfg(target_os = "linux")]
    pub const MAP_ANON: i32 = 0x20;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const MAP_ANON: i32 = 0x1000;

    pub const MAP_FAILED: isize = -1;

    unsafe extern "C" {
        pub fn mmap(
            addr: *mut c_void,
            length: usize,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: isize,
        ) -> *mut c_void;

        pub fn munmap(addr: *mut c_void, length: usize) -> i32;
    }

    #[inline]
    pub unsafe fn anonymous_mmap(len: usize) -> *mut u8 {
        let p = unsafe {
            mmap(
                core::ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANON,
                -1,
                0,
            )
        };
        if (p as isize) == MAP_FAILED {
            core::ptr::null_mut()
        } else {
            p as *mut u8
        }
    }

    #[inline]
    pub unsafe fn anonymous_munmap(ptr: *mut u8, len: usize) {
        let _ = unsafe { munmap(ptr.cast(), len) };
    }
}

use std::ptr::NonNull;

/// Map `size` bytes aligned to `size` (a power of two). Returns `None` on
/// OS-level mapping failure; the caller decides whether that is fatal.
pub fn map_aligned(size: usize) -> Option<NonNull<u8>> {
    assert!(size.is_power_of_two());
    // SAFETY: plain anonymous mapping, size checked above
    let raw = unsafe { unix::anonymous_mmap(size * 2) };
    if raw.is_null() {
        return None;
    }
    let addr = raw as usize;
    let aligned = (addr + size - 1) & !(size - 1);
    let lead = aligned - addr;
    let trail = size - lead;
    // SAFETY: trimming slack inside the region we just mapped
    unsafe {
        if lead > 0 {
            unix::anonymous_munmap(raw, lead);
        }
        if trail > 0 {
            unix::anonymous_munmap((aligned + size) as *mut u8, trail);
        }
    }
    NonNull::new(aligned as *mut u8)
}

/// Return an aligned mapping obtained from [`map_aligned`].
///
/// # Safety
/// `ptr` must come from `map_aligned(size)` with the same `size` and must not
/// be used afterwards.
pub unsafe fn unmap_aligned(ptr: NonNull<u8>, size: usize) {
    // SAFETY: by contract the region is a live mapping of `size` bytes
    unsafe { unix::anonymous_munmap(ptr.as_ptr(), size) };
}

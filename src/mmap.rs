use memmap2::{MmapMut, MmapOptions};

use crate::error::HeapError;
use crate::globals::{align_down, align_up, PAGE_SIZE};

/// Anonymous, zero-filled memory reservation. Pages are committed lazily by
/// the OS on first touch and can be handed back with [`Mmap::dontneed`].
pub struct Mmap {
    map: MmapMut,
    start: *mut u8,
    size: usize,
}

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

impl Mmap {
    pub fn new(size: usize) -> Result<Self, HeapError> {
        let size = align_up(size.max(PAGE_SIZE), PAGE_SIZE);
        let mut map = MmapOptions::new()
            .len(size)
            .map_anon()
            .map_err(|source| HeapError::ReservationFailed { size, source })?;
        let start = map.as_mut_ptr();
        Ok(Self { map, start, size })
    }

    pub fn start(&self) -> *mut u8 {
        self.start
    }
    pub fn end(&self) -> *mut u8 {
        unsafe { self.start.add(self.size) }
    }
    pub const fn size(&self) -> usize {
        self.size
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start as usize && addr < self.start as usize + self.size
    }

    /// Discards the contents of the whole pages inside `[page, page + size)`
    /// while keeping the mapping. Returns the number of bytes released.
    pub fn dontneed(&self, page: *mut u8, size: usize) -> usize {
        let begin = align_up(page as usize, PAGE_SIZE);
        let end = align_down(page as usize + size, PAGE_SIZE);
        if begin >= end {
            return 0;
        }
        debug_assert!(self.contains(begin) && end <= self.end() as usize);
        release_pages(begin as *mut u8, end - begin);
        end - begin
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map[..]
    }
}

#[cfg(unix)]
fn release_pages(page: *mut u8, size: usize) {
    unsafe {
        libc::madvise(page as *mut _, size as _, libc::MADV_DONTNEED);
    }
}

#[cfg(not(unix))]
fn release_pages(page: *mut u8, size: usize) {
    unsafe {
        core::ptr::write_bytes(page, 0, size);
    }
}

/// Asks the process-wide native allocator to return its free memory to the
/// OS. Returns whether anything was released.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
pub fn trim_native_heap() -> bool {
    unsafe { libc::malloc_trim(0) != 0 }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
pub fn trim_native_heap() -> bool {
    false
}

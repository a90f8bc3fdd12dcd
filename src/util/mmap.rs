use std::ptr::null_mut;

use crate::{
    error::{Error, Result},
    util::Region,
};

/// Anonymous memory mapping owned by the collector or one of its spaces. Unmapped on drop.
pub struct MemMap {
    start: *mut u8,
    size: usize,
    name: &'static str,
}

unsafe impl Send for MemMap {}
unsafe impl Sync for MemMap {}

impl MemMap {
    pub const fn invalid(name: &'static str) -> Self {
        Self {
            start: null_mut(),
            size: 0,
            name,
        }
    }

    /// Maps `size` bytes of private, zero-filled, read-write memory.
    pub fn map_anonymous(name: &'static str, size: usize) -> Result<Self> {
        Self::map(
            name,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        )
    }

    /// Maps `size` bytes of shared anonymous memory. Shared mappings are needed when pages are
    /// installed with minor faults.
    pub fn map_shared_anonymous(name: &'static str, size: usize) -> Result<Self> {
        Self::map(
            name,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_ANONYMOUS,
        )
    }

    fn map(name: &'static str, size: usize, prot: libc::c_int, flags: libc::c_int) -> Result<Self> {
        let map = unsafe { libc::mmap(null_mut(), size as _, prot, flags, -1, 0) };
        if map == libc::MAP_FAILED {
            return Err(Error::Map {
                name,
                size,
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(Self {
            start: map as *mut u8,
            size,
            name,
        })
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        !self.start.is_null()
    }
    #[inline]
    pub fn begin(&self) -> usize {
        self.start as usize
    }
    #[inline]
    pub fn end(&self) -> usize {
        self.start as usize + self.size
    }
    #[inline]
    pub const fn size(&self) -> usize {
        self.size
    }
    pub fn name(&self) -> &'static str {
        self.name
    }
    #[inline]
    pub fn region(&self) -> Region {
        Region::new(self.begin(), self.end())
    }
    #[inline]
    pub fn has_address(&self, addr: usize) -> bool {
        self.region().contains(addr)
    }

    /// Drops the backing pages of the whole mapping. Private anonymous memory reads back as zero.
    pub fn madvise_dont_need_and_zero(&self) -> Result<()> {
        if !self.is_valid() {
            return Ok(());
        }
        madvise(self.begin(), self.size, libc::MADV_DONTNEED)
    }

    pub fn protect(&self, prot: libc::c_int) -> Result<()> {
        if !self.is_valid() {
            return Ok(());
        }
        let ret = unsafe { libc::mprotect(self.start.cast(), self.size, prot) };
        if ret != 0 {
            return Err(Error::syscall("mprotect", self.begin(), self.size));
        }
        Ok(())
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.start
    }

    pub fn reset(&mut self) {
        if self.is_valid() {
            unsafe {
                libc::munmap(self.start.cast(), self.size);
            }
        }
        self.start = null_mut();
        self.size = 0;
    }
}

impl Drop for MemMap {
    fn drop(&mut self) {
        self.reset();
    }
}

pub fn madvise(begin: usize, len: usize, advice: libc::c_int) -> Result<()> {
    let ret = unsafe { libc::madvise(begin as *mut _, len, advice) };
    if ret != 0 {
        return Err(Error::syscall("madvise", begin, len));
    }
    Ok(())
}

/// Reads one byte of `addr` so that a missing page gets faulted in.
#[inline(never)]
pub fn force_read(addr: usize) {
    unsafe {
        std::ptr::read_volatile(addr as *const u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_map_is_zeroed_and_released() {
        let map = MemMap::map_anonymous("test map", 4 * 4096).unwrap();
        assert!(map.is_valid());
        unsafe {
            map.as_mut_ptr().add(100).write(7);
            assert_eq!(map.as_mut_ptr().add(100).read(), 7);
        }
        map.madvise_dont_need_and_zero().unwrap();
        unsafe {
            assert_eq!(map.as_mut_ptr().add(100).read(), 0);
        }
        assert!(map.has_address(map.begin() + 4095));
        assert!(!map.has_address(map.end()));
    }
}

//! Arenas backing [`LinearAlloc`](super::LinearAlloc) allocations.
//!
//! The pool is a single mapping so that it can be registered with the kernel as one range. Every
//! handed out arena is tracked until it is freed; while a compaction cycle runs, freed arenas only
//! get flagged and their memory stays untouched until the cycle is over.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};

use crate::{
    error::{Error, Result},
    globals::{page_size, LINEAR_ALLOC_ALIGNMENT},
    util::{align_down, align_up, mmap::madvise, mmap::MemMap, Region},
};

/// Arenas are at least this many pages.
pub const ARENA_PAGES: usize = 16;

pub struct TrackedArena {
    begin: usize,
    size: usize,
    /// For every page, the allocation (header address) that starts on or straddles its first
    /// byte. `0` for pages not reached yet.
    first_objs: Box<[AtomicUsize]>,
    single_object: bool,
    waiting_for_deletion: AtomicBool,
    bytes_allocated: AtomicUsize,
}

impl TrackedArena {
    fn new(begin: usize, size: usize, single_object: bool) -> Self {
        Self {
            begin,
            size,
            first_objs: (0..size / page_size()).map(|_| AtomicUsize::new(0)).collect(),
            single_object,
            waiting_for_deletion: AtomicBool::new(false),
            bytes_allocated: AtomicUsize::new(if single_object { size } else { 0 }),
        }
    }

    #[inline]
    pub fn begin(&self) -> usize {
        self.begin
    }
    #[inline]
    pub fn end(&self) -> usize {
        self.begin + self.size
    }
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
    #[inline]
    pub fn is_single_object(&self) -> bool {
        self.single_object
    }
    #[inline]
    pub fn is_waiting_for_deletion(&self) -> bool {
        self.waiting_for_deletion.load(Ordering::Acquire)
    }
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated.load(Ordering::Acquire)
    }
    pub(crate) fn set_bytes_allocated(&self, bytes: usize) {
        self.bytes_allocated.store(bytes, Ordering::Release);
    }

    /// End of the used part, rounded to the allocation alignment.
    pub fn last_used_byte(&self) -> usize {
        align_up(self.begin + self.bytes_allocated(), LINEAR_ALLOC_ALIGNMENT)
    }

    /// First allocation covering `page`, `None` for single-object arenas and unused pages.
    pub fn first_object(&self, page: usize) -> Option<usize> {
        if self.single_object {
            return None;
        }
        match self.first_objs[(page - self.begin) / page_size()].load(Ordering::Acquire) {
            0 => None,
            obj => Some(obj),
        }
    }

    /// Records an allocation of `size` bytes (header included) at `obj`.
    pub(crate) fn set_first_object(&self, obj: usize, size: usize) {
        let page = page_size();
        let end = obj + size;
        let mut idx = (obj - self.begin) / page;
        // Keep an earlier allocation that already starts this page.
        let _ = self.first_objs[idx].compare_exchange(0, obj, Ordering::AcqRel, Ordering::Relaxed);
        let mut next = align_down(obj, page) + page;
        idx += 1;
        while next < end {
            self.first_objs[idx].store(obj, Ordering::Release);
            next += page;
            idx += 1;
        }
    }
}

struct PoolInner {
    /// Unused ranges sorted by address.
    free: Vec<Region>,
    allocated: BTreeMap<usize, Arc<TrackedArena>>,
    defer_deletion: bool,
    unused: Vec<Arc<TrackedArena>>,
}

pub struct ArenaPool {
    map: MemMap,
    shared: bool,
    inner: RwLock<PoolInner>,
}

impl ArenaPool {
    /// Shared memory is required when the pool's pages get installed through minor faults.
    pub fn create(capacity: usize, shared: bool) -> Result<Self> {
        let capacity = align_up(capacity, page_size());
        let map = if shared {
            MemMap::map_shared_anonymous("linear-alloc arena pool", capacity)?
        } else {
            MemMap::map_anonymous("linear-alloc arena pool", capacity)?
        };
        Ok(Self {
            inner: RwLock::new(PoolInner {
                free: vec![map.region()],
                allocated: BTreeMap::new(),
                defer_deletion: false,
                unused: Vec::new(),
            }),
            map,
            shared,
        })
    }

    #[inline]
    pub fn region(&self) -> Region {
        self.map.region()
    }

    #[inline]
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    #[inline]
    pub fn has_address(&self, addr: usize) -> bool {
        self.map.has_address(addr)
    }

    pub fn alloc_arena(&self, min_size: usize, single_object: bool) -> Result<Arc<TrackedArena>> {
        let size = align_up(min_size, page_size()).max(if single_object {
            page_size()
        } else {
            ARENA_PAGES * page_size()
        });
        let mut inner = self.inner.write();
        let slot = inner
            .free
            .iter()
            .position(|range| range.len() >= size)
            .ok_or(Error::OutOfMemory {
                space: self.map.name(),
                size,
            })?;
        let range = inner.free[slot];
        if range.len() == size {
            inner.free.remove(slot);
        } else {
            inner.free[slot] = Region::new(range.begin + size, range.end);
        }
        let arena = Arc::new(TrackedArena::new(range.begin, size, single_object));
        inner.allocated.insert(arena.begin(), arena.clone());
        log::trace!(
            "arena [{:#x}, {:#x}) allocated{}",
            arena.begin(),
            arena.end(),
            if single_object { " for a root table" } else { "" }
        );
        Ok(arena)
    }

    /// Returns arenas to the pool. During compaction they are only flagged; their memory is
    /// released by [`ArenaPool::delete_unused_arenas`].
    pub fn free_arenas(&self, arenas: impl IntoIterator<Item = Arc<TrackedArena>>) -> Result<()> {
        let mut inner = self.inner.write();
        for arena in arenas {
            if inner.defer_deletion {
                arena.waiting_for_deletion.store(true, Ordering::Release);
                inner.unused.push(arena);
            } else {
                self.release(&mut inner, &arena)?;
            }
        }
        Ok(())
    }

    fn release(&self, inner: &mut PoolInner, arena: &TrackedArena) -> Result<()> {
        let advice = if self.shared {
            libc::MADV_REMOVE
        } else {
            libc::MADV_DONTNEED
        };
        madvise(arena.begin(), arena.size(), advice)?;
        inner.allocated.remove(&arena.begin());
        let range = Region::new(arena.begin(), arena.end());
        let at = inner.free.partition_point(|free| free.begin < range.begin);
        inner.free.insert(at, range);
        // Coalesce with the neighbours.
        if at + 1 < inner.free.len() && inner.free[at].end == inner.free[at + 1].begin {
            inner.free[at].end = inner.free[at + 1].end;
            inner.free.remove(at + 1);
        }
        if at > 0 && inner.free[at - 1].end == inner.free[at].begin {
            inner.free[at - 1].end = inner.free[at].end;
            inner.free.remove(at);
        }
        Ok(())
    }

    pub fn defer_arena_freeing(&self) {
        self.inner.write().defer_deletion = true;
    }

    /// Releases every arena freed while deletion was deferred and stops deferring.
    pub fn delete_unused_arenas(&self) -> Result<()> {
        let mut inner = self.inner.write();
        inner.defer_deletion = false;
        let unused = std::mem::take(&mut inner.unused);
        if !unused.is_empty() {
            log::debug!("releasing {} arenas freed during compaction", unused.len());
        }
        for arena in unused {
            self.release(&mut inner, &arena)?;
        }
        Ok(())
    }

    /// Every live arena with the end of its used part, ordered by address.
    pub fn snapshot(&self) -> BTreeMap<usize, (Arc<TrackedArena>, usize)> {
        self.inner
            .read()
            .allocated
            .iter()
            .map(|(begin, arena)| (*begin, (arena.clone(), arena.last_used_byte())))
            .collect()
    }

    pub fn arenas(&self) -> Vec<Arc<TrackedArena>> {
        self.inner.read().allocated.values().cloned().collect()
    }

    /// Held while an arena's pages are updated so that it cannot be freed meanwhile.
    pub fn read_lock(&self) -> RwLockReadGuard<'_, impl Sized> {
        self.inner.read()
    }

    pub fn unused_arena_count(&self) -> usize {
        self.inner.read().unused.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deferred_arenas_keep_their_memory() {
        let page = page_size();
        let pool = ArenaPool::create(64 * page, false).unwrap();
        let a = pool.alloc_arena(page, false).unwrap();
        let b = pool.alloc_arena(page, false).unwrap();
        assert_eq!(b.begin(), a.end());
        unsafe { (a.begin() as *mut u64).write(0xdead) };

        pool.defer_arena_freeing();
        pool.free_arenas(vec![a.clone()]).unwrap();
        assert!(a.is_waiting_for_deletion());
        assert_eq!(unsafe { (a.begin() as *const u64).read() }, 0xdead);
        // The range is not handed out again while deletion is deferred.
        let c = pool.alloc_arena(page, false).unwrap();
        assert_eq!(c.begin(), b.end());
        assert_eq!(pool.unused_arena_count(), 1);

        pool.delete_unused_arenas().unwrap();
        assert_eq!(pool.unused_arena_count(), 0);
        assert_eq!(unsafe { (a.begin() as *const u64).read() }, 0);
        let d = pool.alloc_arena(page, false).unwrap();
        assert_eq!(d.begin(), a.begin());
    }

    #[test]
    fn first_objects_cover_straddling_allocations() {
        let page = page_size();
        let pool = ArenaPool::create(64 * page, false).unwrap();
        let arena = pool.alloc_arena(4 * page, false).unwrap();
        let begin = arena.begin();
        arena.set_first_object(begin, 64);
        arena.set_first_object(begin + 64, 2 * page);
        assert_eq!(arena.first_object(begin), Some(begin));
        assert_eq!(arena.first_object(begin + page), Some(begin + 64));
        assert_eq!(arena.first_object(begin + 2 * page), Some(begin + 64));
        assert_eq!(arena.first_object(begin + 3 * page), None);
    }
}

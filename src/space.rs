//! Spaces the collector manages: the bump-pointer moving space that gets compacted and the
//! non-moving space whose references are updated in place.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::{
    accounting::mark_bitmap::MarkBitmap,
    error::{Error, Result},
    globals::OBJECT_ALIGNMENT,
    object::{self, read_word},
    util::{align_up, mmap::MemMap, Region},
};

/// Thread local allocation buffer carved out of the moving space.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct Tlab {
    pub begin: usize,
    pub cursor: usize,
    pub end: usize,
}

impl Tlab {
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.begin != 0
    }

    #[inline]
    pub fn alloc(&mut self, size: usize) -> Option<usize> {
        let size = align_up(size, OBJECT_ALIGNMENT);
        if !self.is_valid() || self.end - self.cursor < size {
            return None;
        }
        let result = self.cursor;
        self.cursor += size;
        Some(result)
    }

    /// Moves the buffer down by `diff` bytes. Used once black allocations have been slid.
    pub fn slide(&mut self, diff: usize) {
        if self.is_valid() {
            self.begin -= diff;
            self.cursor -= diff;
            self.end -= diff;
        }
    }

    pub fn remaining(&self) -> usize {
        self.end - self.cursor
    }
}

struct BlockSizes {
    main_block_size: usize,
    /// Sizes of blocks (TLABs and allocations made while TLABs exist) following the main block.
    blocks: VecDeque<usize>,
}

/// Moving space. Objects are allocated linearly, either directly into the main block or into
/// blocks handed out as TLABs. Blocks are never interleaved, so the space can be walked block by
/// block; a zero header word ends the used part of a block.
pub struct BumpPointerSpace {
    mem_map: MemMap,
    end: AtomicUsize,
    block_sizes: Mutex<BlockSizes>,
    mark_bitmap: MarkBitmap,
    objects_allocated: AtomicUsize,
}

impl BumpPointerSpace {
    pub fn create(name: &'static str, capacity: usize) -> Result<Self> {
        let mem_map = MemMap::map_anonymous(name, capacity)?;
        let mark_bitmap = MarkBitmap::create("moving space mark bitmap", mem_map.begin(), capacity)?;
        Ok(Self {
            end: AtomicUsize::new(mem_map.begin()),
            mem_map,
            block_sizes: Mutex::new(BlockSizes {
                main_block_size: 0,
                blocks: VecDeque::new(),
            }),
            mark_bitmap,
            objects_allocated: AtomicUsize::new(0),
        })
    }

    #[inline]
    pub fn begin(&self) -> usize {
        self.mem_map.begin()
    }
    #[inline]
    pub fn end(&self) -> usize {
        self.end.load(Ordering::Acquire)
    }
    #[inline]
    pub fn limit(&self) -> usize {
        self.mem_map.end()
    }
    #[inline]
    pub fn capacity(&self) -> usize {
        self.mem_map.size()
    }
    /// Bytes handed out so far, including TLAB tails that were never used.
    #[inline]
    pub fn size(&self) -> usize {
        self.end() - self.begin()
    }
    #[inline]
    pub fn has_address(&self, addr: usize) -> bool {
        addr >= self.begin() && addr < self.limit()
    }
    #[inline]
    pub fn region(&self) -> Region {
        self.mem_map.region()
    }
    #[inline]
    pub fn mark_bitmap(&self) -> &MarkBitmap {
        &self.mark_bitmap
    }
    pub fn objects_allocated(&self) -> usize {
        self.objects_allocated.load(Ordering::Relaxed)
    }

    fn bump(&self, size: usize) -> Option<usize> {
        let old = self.end.load(Ordering::Relaxed);
        if self.limit() - old < size {
            return None;
        }
        self.end.store(old + size, Ordering::Release);
        Some(old)
    }

    /// Allocates `size` bytes outside of any TLAB.
    pub fn alloc(&self, size: usize) -> Result<usize> {
        let size = align_up(size, OBJECT_ALIGNMENT);
        let mut blocks = self.block_sizes.lock();
        let result = self.bump(size).ok_or(Error::OutOfMemory {
            space: self.mem_map.name(),
            size,
        })?;
        if !blocks.blocks.is_empty() {
            blocks.blocks.push_back(size);
        }
        self.objects_allocated.fetch_add(1, Ordering::Relaxed);
        Ok(result)
    }

    pub fn alloc_tlab(&self, size: usize) -> Result<Tlab> {
        let size = align_up(size, OBJECT_ALIGNMENT);
        let mut blocks = self.block_sizes.lock();
        if blocks.blocks.is_empty() {
            blocks.main_block_size = self.size();
        }
        let begin = self.bump(size).ok_or(Error::OutOfMemory {
            space: self.mem_map.name(),
            size,
        })?;
        blocks.blocks.push_back(size);
        Ok(Tlab {
            begin,
            cursor: begin,
            end: begin + size,
        })
    }

    pub fn record_tlab_allocation(&self) {
        self.objects_allocated.fetch_add(1, Ordering::Relaxed);
    }

    /// Pads the end of the space to `alignment` and returns the new end. The padding is added to
    /// the last block so that block walks stay consistent.
    pub fn align_end(&self, alignment: usize) -> usize {
        let mut blocks = self.block_sizes.lock();
        let end = self.end.load(Ordering::Relaxed);
        let aligned = align_up(end, alignment);
        let diff = aligned - end;
        if diff > 0 {
            self.end.store(aligned, Ordering::Release);
            if let Some(last) = blocks.blocks.back_mut() {
                *last += diff;
            }
        }
        aligned
    }

    /// Returns the main block size together with the sizes of all following blocks, or `None`
    /// for the latter if nothing was allocated outside the main block.
    pub fn get_block_sizes(&self) -> (usize, Option<Vec<usize>>) {
        let blocks = self.block_sizes.lock();
        if blocks.blocks.is_empty() {
            (self.size(), None)
        } else {
            (
                blocks.main_block_size,
                Some(blocks.blocks.iter().copied().collect()),
            )
        }
    }

    /// Merges the first `consumed` blocks into a main block of `main_block_size` bytes and
    /// recomputes the end of the space.
    pub fn set_block_sizes(&self, main_block_size: usize, consumed: usize) {
        let mut blocks = self.block_sizes.lock();
        blocks.main_block_size = main_block_size;
        let consumed = consumed.min(blocks.blocks.len());
        blocks.blocks.drain(..consumed);
        let size = main_block_size + blocks.blocks.iter().sum::<usize>();
        debug_assert_eq!(size % OBJECT_ALIGNMENT, 0);
        self.end.store(self.begin() + size, Ordering::Release);
    }

    /// Visits every object in the space in address order.
    pub fn walk(&self, mut visitor: impl FnMut(usize)) {
        let (main, blocks) = self.get_block_sizes();
        let mut block_begin = self.begin();
        let mut walk_block = |begin: usize, size: usize| {
            let end = begin + size;
            let mut obj = begin;
            while obj < end && unsafe { read_word(obj + 8) } != 0 {
                visitor(obj);
                obj += align_up(
                    unsafe { object::size_of_object(obj, object::in_place) },
                    OBJECT_ALIGNMENT,
                );
            }
        };
        walk_block(block_begin, main);
        block_begin += main;
        for size in blocks.into_iter().flatten() {
            walk_block(block_begin, size);
            block_begin += size;
        }
    }
}

/// Space for objects that never move. Its pages are updated in place during the compaction
/// pause.
pub struct NonMovingSpace {
    mem_map: MemMap,
    end: Mutex<usize>,
    mark_bitmap: MarkBitmap,
    /// Objects allocated while a cycle is between its marking and compaction pauses.
    allocation_stack: Mutex<Vec<usize>>,
    track_allocations: std::sync::atomic::AtomicBool,
}

impl NonMovingSpace {
    pub fn create(name: &'static str, capacity: usize) -> Result<Self> {
        let mem_map = MemMap::map_anonymous(name, capacity)?;
        let mark_bitmap =
            MarkBitmap::create("non-moving space mark bitmap", mem_map.begin(), capacity)?;
        Ok(Self {
            end: Mutex::new(mem_map.begin()),
            mem_map,
            mark_bitmap,
            allocation_stack: Mutex::new(Vec::new()),
            track_allocations: std::sync::atomic::AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn begin(&self) -> usize {
        self.mem_map.begin()
    }
    pub fn end(&self) -> usize {
        *self.end.lock()
    }
    #[inline]
    pub fn limit(&self) -> usize {
        self.mem_map.end()
    }
    #[inline]
    pub fn has_address(&self, addr: usize) -> bool {
        self.mem_map.has_address(addr)
    }
    #[inline]
    pub fn mark_bitmap(&self) -> &MarkBitmap {
        &self.mark_bitmap
    }

    pub fn alloc(&self, size: usize) -> Result<usize> {
        let size = align_up(size, OBJECT_ALIGNMENT);
        let mut end = self.end.lock();
        if self.limit() - *end < size {
            return Err(Error::OutOfMemory {
                space: self.mem_map.name(),
                size,
            });
        }
        let result = *end;
        *end += size;
        if self.track_allocations.load(Ordering::Relaxed) {
            self.allocation_stack.lock().push(result);
        }
        Ok(result)
    }

    pub fn set_track_allocations(&self, track: bool) {
        self.track_allocations.store(track, Ordering::Relaxed);
    }

    pub fn take_allocation_stack(&self) -> Vec<usize> {
        std::mem::take(&mut *self.allocation_stack.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{init_header, ObjectKind};

    #[test]
    fn tlabs_become_blocks() {
        let space = BumpPointerSpace::create("bump test", 64 * 1024).unwrap();
        let a = space.alloc(32).unwrap();
        unsafe { init_header(a, 0, ObjectKind::PrimArray, 16) };
        let mut tlab = space.alloc_tlab(4096).unwrap();
        let b = tlab.alloc(24).unwrap();
        unsafe { init_header(b, 0, ObjectKind::RefArray, 1) };
        let c = space.alloc(16).unwrap();
        unsafe { init_header(c, 0, ObjectKind::PrimArray, 0) };

        let (main, blocks) = space.get_block_sizes();
        assert_eq!(main, 32);
        assert_eq!(blocks, Some(vec![4096, 16]));

        let mut seen = vec![];
        space.walk(|o| seen.push(o));
        assert_eq!(seen, vec![a, b, c]);

        let end = space.align_end(4096);
        assert_eq!(end % 4096, 0);
        assert_eq!(space.get_block_sizes().1.unwrap().iter().sum::<usize>() + 32, end - space.begin());

        space.set_block_sizes(4096, 2);
        assert_eq!(space.get_block_sizes(), (4096, None));
        assert_eq!(space.end(), space.begin() + 4096);
    }

    #[test]
    fn tlab_slide() {
        let mut tlab = Tlab {
            begin: 0x9000,
            cursor: 0x9100,
            end: 0xa000,
        };
        tlab.slide(0x2000);
        assert_eq!(tlab.begin, 0x7000);
        assert_eq!(tlab.alloc(0x10), Some(0x7100));
        assert_eq!(Tlab::default().alloc(8), None);
    }
}

//! Old-to-new address computation for the moving space and the per-page tables compaction is
//! driven by.
use std::sync::Arc;

use crate::{
    accounting::{live_words::LiveWordsBitmap, mark_bitmap::MarkBitmap},
    globals::{page_size, BITS_PER_VECTOR_WORD, OBJECT_ALIGNMENT},
    object::{self, read_word, write_word},
    space::NonMovingSpace,
    util::{align_down, align_up, Region},
};

/// For every to-space page, the object that starts on or straddles its first byte.
///
/// Entries `[0, first_objs_count)` describe pages produced by sliding live words, the following
/// `black_page_count` entries describe pages produced from black allocations. Both parts are
/// monotonic: the first object of page `n + 1` is the one of page `n` or a later one.
pub struct FirstObjectTable {
    pub objs: Vec<usize>,
    /// Live-words bit index of the first word a compacted page starts with.
    pub pre_compact_offset: Vec<u32>,
    /// Bytes of the first contiguous run of black objects on a black page.
    pub black_first_chunk: Vec<u32>,
    pub first_objs_count: usize,
    pub black_page_count: usize,
}

impl FirstObjectTable {
    pub fn new(pages: usize) -> Self {
        Self {
            objs: vec![0; pages],
            pre_compact_offset: vec![0; pages],
            black_first_chunk: vec![0; pages],
            first_objs_count: 0,
            black_page_count: 0,
        }
    }

    /// Number of to-space pages the cycle produces.
    #[inline]
    pub fn len(&self) -> usize {
        self.first_objs_count + self.black_page_count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Walks the (not yet prefix-summed) chunk-info vector and records, for every page worth of
    /// live bytes, the object whose live words start that page.
    pub fn init_moving(
        &mut self,
        chunk_info: &[u32],
        vec_len: usize,
        live_words: &LiveWordsBitmap,
        mark_bitmap: &MarkBitmap,
    ) {
        let page = page_size();
        let heap_begin = mark_bitmap.heap_begin();
        let mut to_space_page_idx = 0;
        self.first_objs_count = 0;

        let mut chunk_idx = 0;
        loop {
            if chunk_idx >= vec_len {
                return;
            }
            if chunk_info[chunk_idx] != 0 {
                break;
            }
            chunk_idx += 1;
        }
        let offset = chunk_idx * BITS_PER_VECTOR_WORD
            + live_words.find_nth_live_word_offset(chunk_idx, 0);
        self.pre_compact_offset[to_space_page_idx] = offset as u32;
        self.objs[to_space_page_idx] = heap_begin + offset * OBJECT_ALIGNMENT;
        to_space_page_idx += 1;

        let mut page_live_bytes = 0usize;
        loop {
            while page_live_bytes <= page {
                if chunk_idx >= vec_len {
                    self.first_objs_count = to_space_page_idx;
                    return;
                }
                page_live_bytes += chunk_info[chunk_idx] as usize;
                chunk_idx += 1;
            }
            chunk_idx -= 1;
            page_live_bytes -= page;
            let chunk_live = chunk_info[chunk_idx] as usize;
            debug_assert!(page_live_bytes <= chunk_live);
            let nth = (chunk_live - page_live_bytes) / OBJECT_ALIGNMENT;
            let offset =
                chunk_idx * BITS_PER_VECTOR_WORD + live_words.find_nth_live_word_offset(chunk_idx, nth);
            let addr = heap_begin + offset * OBJECT_ALIGNMENT;
            let obj = mark_bitmap
                .find_preceding_object(addr, heap_begin)
                .unwrap_or_else(|| crate::gc_fatal!("no object covers live word {:#x}", addr));
            self.pre_compact_offset[to_space_page_idx] = offset as u32;
            self.objs[to_space_page_idx] = obj;
            to_space_page_idx += 1;
            chunk_idx += 1;
        }
    }

    /// Computes first objects and first-chunk sizes of the pages holding objects allocated after
    /// the marking pause. `blocks` are the block sizes following the main block of size
    /// `main_block_size`. `on_object` is called for every black object in address order.
    ///
    /// Objects of pages on which a new block starts in the middle get their mark bit set, those
    /// pages are finished through the mark bitmap. Returns the number of blocks that end at or
    /// before `black_allocations_begin`.
    pub fn init_black(
        &mut self,
        space_begin: usize,
        space_size: usize,
        main_block_size: usize,
        blocks: &[usize],
        black_allocations_begin: usize,
        mark_bitmap: &MarkBitmap,
        mut on_object: impl FnMut(usize, usize),
    ) -> usize {
        let page = page_size();
        let mut black_allocs = black_allocations_begin;
        let mut consumed_blocks = 0;
        let mut black_page_idx = self.first_objs_count;
        let mut block_end = space_begin + main_block_size;
        let mut remaining_chunk_size = 0usize;
        let mut first_chunk_size = 0usize;
        let mut first_obj = 0usize;
        for &block_size in blocks {
            block_end += block_size;
            if black_allocs >= block_end {
                consumed_blocks += 1;
                continue;
            }
            let mut obj = black_allocs;
            let mut set_mark_bit = remaining_chunk_size > 0;
            while black_allocs < block_end && unsafe { read_word(obj + 8) } != 0 {
                let size = unsafe { object::size_of_object(obj, object::in_place) };
                let obj_size = align_up(size, OBJECT_ALIGNMENT);
                on_object(obj, obj_size);
                if first_obj == 0 {
                    first_obj = obj;
                }
                if set_mark_bit {
                    mark_bitmap.set(obj);
                }
                if remaining_chunk_size + obj_size >= page {
                    set_mark_bit = false;
                    first_chunk_size += page - remaining_chunk_size;
                    remaining_chunk_size += obj_size;
                    // A hole before this block already stored the page's values.
                    if self.black_first_chunk[black_page_idx] == 0 {
                        self.black_first_chunk[black_page_idx] = first_chunk_size as u32;
                        self.objs[black_page_idx] = first_obj;
                    }
                    black_page_idx += 1;
                    remaining_chunk_size -= page;
                    while remaining_chunk_size >= page {
                        self.black_first_chunk[black_page_idx] = page as u32;
                        self.objs[black_page_idx] = obj;
                        black_page_idx += 1;
                        remaining_chunk_size -= page;
                    }
                    first_obj = if remaining_chunk_size > 0 { obj } else { 0 };
                    first_chunk_size = remaining_chunk_size;
                } else {
                    first_chunk_size += obj_size;
                    remaining_chunk_size += obj_size;
                }
                black_allocs += obj_size;
                obj = black_allocs;
            }
            debug_assert!(remaining_chunk_size < page);
            // Unallocated tail of the block.
            if black_allocs < block_end {
                if first_chunk_size > 0 && self.black_first_chunk[black_page_idx] == 0 {
                    self.black_first_chunk[black_page_idx] = first_chunk_size as u32;
                    self.objs[black_page_idx] = first_obj;
                }
                first_chunk_size = 0;
                first_obj = 0;
                let page_remaining = page - remaining_chunk_size;
                let mut block_remaining = block_end - black_allocs;
                if page_remaining <= block_remaining {
                    block_remaining -= page_remaining;
                    black_page_idx += 1 + block_remaining / page;
                    remaining_chunk_size = block_remaining % page;
                } else {
                    remaining_chunk_size += block_remaining;
                }
                black_allocs = block_end;
            }
        }
        if black_page_idx < space_size / page {
            if self.black_first_chunk[black_page_idx] > 0 {
                black_page_idx += 1;
            } else if first_chunk_size > 0 {
                self.black_first_chunk[black_page_idx] = first_chunk_size as u32;
                self.objs[black_page_idx] = first_obj;
                black_page_idx += 1;
            }
        }
        self.black_page_count = black_page_idx - self.first_objs_count;
        consumed_blocks
    }

    pub fn clear(&mut self) {
        for slot in self.objs.iter_mut() {
            *slot = 0;
        }
        for slot in self.pre_compact_offset.iter_mut() {
            *slot = 0;
        }
        for slot in self.black_first_chunk.iter_mut() {
            *slot = 0;
        }
        self.first_objs_count = 0;
        self.black_page_count = 0;
    }
}

/// First object to visit on every page of the non-moving space, `0` for pages without live
/// objects.
pub struct NonMovingFirstObjects {
    pub objs: Vec<usize>,
    pub count: usize,
}

impl NonMovingFirstObjects {
    pub fn new(pages: usize) -> Self {
        Self {
            objs: vec![0; pages],
            count: 0,
        }
    }

    pub fn init(&mut self, space: &NonMovingSpace) {
        let page = page_size();
        let bitmap = space.mark_bitmap();
        let space_begin = space.begin();
        let end = space.end();
        for slot in self.objs.iter_mut() {
            *slot = 0;
        }
        self.count = 0;
        let mut prev_obj = match bitmap.find_first_marked(space_begin, end) {
            Some(obj) => obj,
            None => return,
        };
        let mut page_idx = (prev_obj - space_begin) / page;
        self.objs[page_idx] = prev_obj;
        page_idx += 1;
        let object_end =
            |obj: usize| obj + align_up(unsafe { object::size_of_object(obj, object::in_place) }, OBJECT_ALIGNMENT);
        let mut prev_obj_end = object_end(prev_obj);
        let mut begin = align_down(prev_obj + page, page);
        while begin < end {
            if prev_obj != 0 && prev_obj_end > begin {
                self.objs[page_idx] = prev_obj;
            } else {
                prev_obj_end = 0;
                // Only the preceding page can hold an object reaching into this one.
                prev_obj = bitmap
                    .find_preceding_object(begin, begin - page)
                    .unwrap_or(0);
                if prev_obj != 0 {
                    prev_obj_end = object_end(prev_obj);
                }
                if prev_obj_end > begin {
                    self.objs[page_idx] = prev_obj;
                } else if let Some(obj) = bitmap.find_first_marked(begin, begin + page) {
                    self.objs[page_idx] = obj;
                }
            }
            begin += page;
            page_idx += 1;
        }
        self.count = page_idx;
    }

    /// Records an object allocated between the marking and compaction pauses.
    pub fn add_black_object(&mut self, space_begin: usize, obj: usize) {
        let page = page_size();
        let mut idx = (obj - space_begin) / page;
        let page_begin = align_down(obj, page);
        let first_obj = self.objs[idx];
        if first_obj == 0 || (obj < first_obj && first_obj > page_begin) {
            self.objs[idx] = obj;
        }
        idx += 1;
        let mut next_page_begin = page_begin + page;
        if idx < self.objs.len() && (self.objs[idx] == 0 || self.objs[idx] > next_page_begin) {
            let obj_end =
                obj + align_up(unsafe { object::size_of_object(obj, object::in_place) }, OBJECT_ALIGNMENT);
            while next_page_begin < obj_end {
                self.objs[idx] = obj;
                idx += 1;
                next_page_begin += page;
            }
        }
        self.count = self.count.max(idx);
    }
}

/// Everything needed to translate a pre-compaction moving-space address into its post-compaction
/// address. Immutable for the whole compaction phase, so every thread producing pages shares it.
pub struct AddressTranslator {
    pub moving: Region,
    pub from_space_begin: usize,
    pub black_allocations_begin: usize,
    pub post_compact_end: usize,
    pub black_objs_slide_diff: usize,
    chunk_info: Box<[u32]>,
    live_words: Arc<LiveWordsBitmap>,
}

impl AddressTranslator {
    pub fn new(
        moving: Region,
        from_space_begin: usize,
        black_allocations_begin: usize,
        post_compact_end: usize,
        chunk_info: Box<[u32]>,
        live_words: Arc<LiveWordsBitmap>,
    ) -> Self {
        crate::gc_check!(
            black_allocations_begin >= post_compact_end,
            "compaction would grow the moving space: {:#x} < {:#x}",
            black_allocations_begin,
            post_compact_end
        );
        Self {
            moving,
            from_space_begin,
            black_allocations_begin,
            post_compact_end,
            black_objs_slide_diff: black_allocations_begin - post_compact_end,
            chunk_info,
            live_words,
        }
    }

    #[inline]
    pub fn live_words(&self) -> &LiveWordsBitmap {
        &self.live_words
    }

    #[inline]
    pub fn from_space_slide_diff(&self) -> usize {
        self.from_space_begin.wrapping_sub(self.moving.begin)
    }

    /// Address of the pre-compaction copy of moving-space address `addr`.
    #[inline]
    pub fn from_space_addr(&self, addr: usize) -> usize {
        addr - self.moving.begin + self.from_space_begin
    }

    /// Where the layout of `class` is read from while compacting.
    #[inline]
    pub fn class_source(&self, class: usize) -> usize {
        if self.moving.contains(class) {
            self.from_space_addr(class)
        } else {
            class
        }
    }

    #[inline]
    pub fn post_compact_black_obj_addr(&self, old: usize) -> usize {
        old - self.black_objs_slide_diff
    }

    #[inline]
    pub fn post_compact_old_obj_addr(&self, old: usize) -> usize {
        let bit = self.live_words.bit_index_from_addr(old);
        self.moving.begin
            + self.chunk_info[bit / BITS_PER_VECTOR_WORD] as usize
            + self.live_words.count_live_words_upto(bit) * OBJECT_ALIGNMENT
    }

    #[inline]
    pub fn post_compact_addr(&self, old: usize) -> usize {
        if old >= self.black_allocations_begin {
            self.post_compact_black_obj_addr(old)
        } else {
            debug_assert!(self.live_words.test_addr(old), "{:#x} is not live", old);
            self.post_compact_old_obj_addr(old)
        }
    }

    /// New address of `obj` if it lives in the moving space and survives, `None` if it is dead.
    pub fn is_marked(&self, obj: usize) -> Option<usize> {
        if obj >= self.black_allocations_begin {
            Some(self.post_compact_black_obj_addr(obj))
        } else if self.live_words.test_addr(obj) {
            Some(self.post_compact_old_obj_addr(obj))
        } else {
            None
        }
    }

    /// Rewrites the reference stored at `slot` if it points into the moving space.
    #[inline]
    pub unsafe fn update_ref(&self, slot: usize) {
        let old = read_word(slot);
        if old != 0 && self.moving.contains(old) {
            let new = self.post_compact_addr(old);
            if new != old {
                write_word(slot, new);
            }
        }
    }

    /// Same as [`AddressTranslator::update_ref`] for a root that tolerates dead referents.
    #[inline]
    pub unsafe fn update_root(&self, slot: usize) {
        let old = read_word(slot);
        if old != 0 && self.moving.contains(old) {
            let new = if old >= self.black_allocations_begin {
                self.post_compact_black_obj_addr(old)
            } else if self.live_words.test_addr(old) {
                self.post_compact_old_obj_addr(old)
            } else {
                old
            };
            if new != old {
                write_word(slot, new);
            }
        }
    }

    /// Visits the references of the object laid out at `layout` that fall in `[begin, end)` and
    /// rewrites the corresponding slots of the object at `dest`. Returns the object size.
    #[inline]
    pub unsafe fn update_object_refs(&self, layout: usize, dest: usize, begin: usize, end: usize) -> usize {
        object::visit_reference_offsets(
            layout,
            |class| self.class_source(class),
            begin,
            end,
            |offset| self.update_ref(dest + offset),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        accounting::chunk_info::ChunkInfoVec,
        object::{init_header, ObjectKind},
        util::mmap::MemMap,
    };

    #[test]
    fn first_objects_follow_live_bytes() {
        let page = page_size();
        let capacity = 8 * page;
        let map = MemMap::map_anonymous("first objects", capacity).unwrap();
        let begin = map.begin();
        let live = LiveWordsBitmap::create(begin, capacity).unwrap();
        let marks = MarkBitmap::create("first objects marks", begin, capacity).unwrap();
        let mut chunks = ChunkInfoVec::new(capacity);
        // A small object, a dead gap, then an object of one and a half pages.
        let small = begin + 64;
        let big = begin + page + 256;
        let big_size = page + page / 2;
        unsafe {
            init_header(small, 0, ObjectKind::PrimArray, 16);
            init_header(big, 0, ObjectKind::PrimArray, (big_size - 16) as u32);
        }
        for &(obj, size) in &[(small, 32usize), (big, big_size)] {
            marks.set(obj);
            let bit = live.set_live_words(obj, size);
            chunks.record_live_object(bit, size);
        }
        let vec_len = (begin + 4 * page - begin) / crate::globals::OFFSET_CHUNK_SIZE;
        let mut table = FirstObjectTable::new(capacity / page);
        table.init_moving(chunks.as_slice(), vec_len, &live, &marks);
        assert_eq!(table.first_objs_count, 2);
        assert_eq!(table.objs[0], small);
        // The second page starts inside the big object.
        assert_eq!(table.objs[1], big);
        let second_start = live.addr_from_bit_index(table.pre_compact_offset[1] as usize);
        assert_eq!(second_start - big, page - 32);

        let (_, total) = chunks.exclusive_prefix_sum(vec_len);
        assert_eq!(total, 32 + big_size);
        assert_eq!(total, live.popcount(begin, begin + capacity) * OBJECT_ALIGNMENT);
    }

    #[test]
    fn black_pages_track_blocks() {
        let page = page_size();
        let capacity = 8 * page;
        let map = MemMap::map_anonymous("black pages", capacity).unwrap();
        let begin = map.begin();
        let marks = MarkBitmap::create("black marks", begin, capacity).unwrap();
        // Black allocations start at page 1: one block of a page and a half holding objects of
        // a quarter page, then a block starting in the middle of page 2.
        let quarter = page / 4;
        let black_begin = begin + page;
        let mut objs = vec![];
        let mut addr = black_begin;
        for _ in 0..5 {
            unsafe { init_header(addr, 0, ObjectKind::PrimArray, (quarter - 16) as u32) };
            objs.push(addr);
            addr += quarter;
        }
        let second_block = black_begin + page + page / 2;
        unsafe { init_header(second_block, 0, ObjectKind::PrimArray, 16) };
        let mut table = FirstObjectTable::new(capacity / page);
        table.first_objs_count = 1;
        let mut seen = vec![];
        let consumed = table.init_black(
            begin,
            3 * page,
            page,
            &[page + page / 2, page / 2],
            black_begin,
            &marks,
            |obj, _| seen.push(obj),
        );
        assert_eq!(consumed, 0);
        assert_eq!(seen.len(), 6);
        assert_eq!(table.black_page_count, 2);
        assert_eq!(table.objs[1], objs[0]);
        assert_eq!(table.black_first_chunk[1] as usize, page);
        assert_eq!(table.objs[2], objs[4]);
        assert_eq!(table.black_first_chunk[2] as usize, quarter);
        // The object behind the hole is only reachable through its mark bit.
        assert!(marks.test(second_block));
        assert!(!marks.test(objs[4]));
    }

    #[test]
    fn translation_of_old_and_black_objects() {
        let page = page_size();
        let capacity = 4 * page;
        let map = MemMap::map_anonymous("translate", capacity).unwrap();
        let begin = map.begin();
        let live = Arc::new(LiveWordsBitmap::create(begin, capacity).unwrap());
        let mut chunks = ChunkInfoVec::new(capacity);
        for &(obj, size) in &[(begin + 128, 32usize), (begin + 1024, 64)] {
            let bit = live.set_live_words(obj, size);
            chunks.record_live_object(bit, size);
        }
        let vec_len = 2 * page / crate::globals::OFFSET_CHUNK_SIZE;
        let (len, total) = chunks.exclusive_prefix_sum(vec_len);
        let chunk_info: Box<[u32]> = chunks.as_slice()[..len].to_vec().into_boxed_slice();
        let translator = AddressTranslator::new(
            Region::new(begin, begin + capacity),
            begin + capacity,
            begin + 2 * page,
            align_up(begin + total, page),
            chunk_info,
            live,
        );
        assert_eq!(translator.is_marked(begin + 128), Some(begin));
        assert_eq!(translator.is_marked(begin + 1024), Some(begin + 32));
        assert_eq!(translator.is_marked(begin + 512), None);
        assert_eq!(translator.is_marked(begin + 2 * page + 48), Some(begin + page + 48));
        assert_eq!(translator.class_source(begin + 8), begin + capacity + 8);
    }
}

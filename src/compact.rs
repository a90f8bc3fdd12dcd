//! Producing to-space pages: sliding live words of a page together, copying black allocations
//! down, and installing the results.
use std::sync::atomic::Ordering;

use crate::{
    cycle::{CompactionCycle, CompactionMode},
    globals::{page_size, OBJECT_ALIGNMENT},
    kernel::{continue_pages, copy_pages},
    object::{self, read_word},
    page_status::{PageState, PageStatusWord},
    reclaim::Reclaimer,
    space::NonMovingSpace,
    translate::{AddressTranslator, NonMovingFirstObjects},
    util::{align_up, backoff::PageBackoff},
};

#[inline]
unsafe fn copy_bytes(dst: usize, src: usize, len: usize) {
    std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len);
}

#[inline]
unsafe fn zero_bytes(dst: usize, len: usize) {
    std::ptr::write_bytes(dst as *mut u8, 0, len);
}

impl CompactionCycle {
    /// Assembles into `addr` the to-space page whose first live word is bit `offset` of the live
    /// words bitmap and whose first object is `obj`, then updates every reference on it.
    ///
    /// Only reads from-space and writes `addr`, so it can be repeated.
    pub unsafe fn compact_page(&self, obj: usize, offset: u32, addr: usize, needs_memset_zero: bool) {
        let t = &self.translator;
        let page = page_size();
        let start = addr;
        let from_begin = t.from_space_begin;
        let live_words = t.live_words();
        let mut addr = addr;
        let mut stride_count = 0usize;
        let mut last_stride = addr;
        let mut last_stride_begin = 0usize;
        live_words.visit_live_strides(
            offset as usize,
            t.black_allocations_begin,
            page,
            |stride_begin, words| {
                let bytes = words * OBJECT_ALIGNMENT;
                copy_bytes(addr, from_begin + stride_begin * OBJECT_ALIGNMENT, bytes);
                last_stride = addr;
                last_stride_begin = stride_begin;
                addr += bytes;
                stride_count += 1;
            },
        );
        debug_assert!(last_stride < start + page);
        debug_assert!(stride_count > 0);

        // The first object may begin on an earlier page; only its part on this page is updated.
        let from_obj = t.from_space_addr(obj);
        let offset_within_obj = offset as usize * OBJECT_ALIGNMENT - (obj - t.moving.begin);
        let mut obj_size = 0;
        if offset_within_obj > 0 {
            let to_ref = start.wrapping_sub(offset_within_obj);
            let size = if stride_count > 1 {
                t.update_object_refs(from_obj, to_ref, offset_within_obj, usize::MAX)
            } else {
                t.update_object_refs(from_obj, to_ref, offset_within_obj, offset_within_obj + page)
            };
            obj_size = align_up(size, OBJECT_ALIGNMENT) - offset_within_obj;
            if stride_count == 1 {
                last_stride_begin += obj_size / OBJECT_ALIGNMENT;
            }
        }

        // Objects that lie completely on the page.
        let end_addr = addr;
        let mut bytes_done = obj_size;
        debug_assert_eq!(bytes_done % OBJECT_ALIGNMENT, 0);
        while bytes_done < last_stride - start {
            let ref_addr = start + bytes_done;
            let size = t.update_object_refs(ref_addr, ref_addr, 0, usize::MAX);
            bytes_done += align_up(size, OBJECT_ALIGNMENT);
        }

        // Objects in the last stride may continue past the page, their layout is read from
        // from-space since the tail was not copied.
        let mut from_addr = from_begin + last_stride_begin * OBJECT_ALIGNMENT;
        while bytes_done < end_addr - start {
            let dest = start + bytes_done;
            let size = t.update_object_refs(from_addr, dest, 0, end_addr - dest);
            let size = align_up(size, OBJECT_ALIGNMENT);
            from_addr += size;
            bytes_done += size;
        }
        if needs_memset_zero && bytes_done < page {
            zero_bytes(start + bytes_done, page - bytes_done);
        }
    }

    /// Assembles into `dest` the to-space page of black allocations that started at
    /// `pre_compact_page`. The first `first_chunk_size` bytes are contiguous objects starting at
    /// `first_obj`; anything after that is found through the mark bitmap.
    pub unsafe fn slide_black_page(
        &self,
        first_obj: usize,
        next_page_first_obj: usize,
        first_chunk_size: u32,
        pre_compact_page: usize,
        dest: usize,
        needs_memset_zero: bool,
    ) {
        let t = &self.translator;
        let page = page_size();
        let first_chunk_size = first_chunk_size as usize;
        let mut dest = dest;
        let mut bytes_copied = 0usize;
        let mut src = t.from_space_addr(first_obj);
        let mut pre_compact_addr = first_obj;
        let pre_compact_page_end = pre_compact_page + page;
        let dest_page_end = dest + page;

        if first_obj > pre_compact_page {
            // A hole precedes the first object.
            bytes_copied = first_obj - pre_compact_page;
            debug_assert!(bytes_copied < page);
            if needs_memset_zero {
                zero_bytes(dest, bytes_copied);
            }
            dest += bytes_copied;
        } else {
            let offset = pre_compact_page - first_obj;
            pre_compact_addr = pre_compact_page;
            src += offset;
        }
        copy_bytes(dest, src, first_chunk_size);
        let mut bytes_to_visit = first_chunk_size;
        let offset = pre_compact_addr - first_obj;
        if bytes_copied == 0 && offset > 0 {
            let to_obj = dest.wrapping_sub(offset);
            let from_obj = src - offset;
            let size = if next_page_first_obj == 0
                || (first_obj != next_page_first_obj && next_page_first_obj <= pre_compact_page_end)
            {
                t.update_object_refs(from_obj, to_obj, offset, usize::MAX)
            } else {
                let size = t.update_object_refs(from_obj, to_obj, offset, offset + page);
                if first_obj == next_page_first_obj {
                    // The object covers the whole page.
                    return;
                }
                size
            };
            let obj_size = align_up(size, OBJECT_ALIGNMENT) - offset;
            dest += obj_size;
            bytes_to_visit -= obj_size;
        }
        bytes_copied += first_chunk_size;

        // The last object of the chunk may reach into the next page.
        let mut check_last_obj = false;
        if next_page_first_obj != 0
            && next_page_first_obj < pre_compact_page_end
            && bytes_copied == page
        {
            let diff = pre_compact_page_end - next_page_first_obj;
            debug_assert!(bytes_to_visit >= diff);
            bytes_to_visit -= diff;
            check_last_obj = true;
        }
        while bytes_to_visit > 0 {
            let size = align_up(t.update_object_refs(dest, dest, 0, usize::MAX), OBJECT_ALIGNMENT);
            debug_assert!(size > 0);
            dest += size;
            bytes_to_visit -= size.min(bytes_to_visit);
        }
        if check_last_obj {
            let from_obj = t.from_space_addr(next_page_first_obj);
            t.update_object_refs(from_obj, dest, 0, dest_page_end - dest);
            return;
        }

        // Objects of later blocks on this page.
        if bytes_copied < page {
            src += first_chunk_size;
            pre_compact_addr += first_chunk_size;
            let bitmap = self.moving_space.mark_bitmap();
            let mut found_obj = match bitmap.find_first_marked(pre_compact_addr, pre_compact_page_end) {
                Some(obj) => obj,
                None => {
                    if needs_memset_zero {
                        zero_bytes(dest, page - bytes_copied);
                    }
                    return;
                }
            };
            copy_bytes(dest, src, page - bytes_copied);
            let dest_of = |obj: usize| dest + (obj - pre_compact_addr);
            bitmap.visit_marked_range(found_obj + object::HEADER_SIZE, pre_compact_page_end, |obj| {
                let ref_addr = dest_of(found_obj);
                t.update_object_refs(ref_addr, ref_addr, 0, usize::MAX);
                found_obj = obj;
            });
            debug_assert!(found_obj < pre_compact_page_end);
            let from_obj = t.from_space_addr(found_obj);
            t.update_object_refs(from_obj, dest_of(found_obj), 0, pre_compact_page_end - found_obj);
        }
    }

    /// Produces to-space page `idx` into `dest`, whichever kind of page it is.
    pub unsafe fn produce_page(&self, idx: usize, dest: usize, needs_memset_zero: bool) {
        let first_obj = self.first_objs[idx];
        if idx < self.first_objs_count {
            self.compact_page(first_obj, self.pre_compact_offset[idx], dest, needs_memset_zero);
        } else {
            let pre_compact_page = self.translator.black_allocations_begin
                + (idx - self.first_objs_count) * page_size();
            let next_page_first_obj = if idx + 1 < self.page_count() {
                self.first_objs[idx + 1]
            } else {
                0
            };
            self.slide_black_page(
                first_obj,
                next_page_first_obj,
                self.black_first_chunk[idx],
                pre_compact_page,
                dest,
                needs_memset_zero,
            );
        }
    }

    /// Runs `produce` for to-space page `idx` on the collector thread, claiming the page first
    /// unless nothing is registered. `page` is where `produce` writes. Returns false if a mutator
    /// got the page first.
    fn do_page_compaction_with_state_change(
        &self,
        idx: usize,
        to_space_page: usize,
        page: usize,
        map_immediately: bool,
        produce: impl FnOnce(),
    ) -> bool {
        if self.mode == CompactionMode::Fallback {
            produce();
            return true;
        }
        let claimed = if map_immediately {
            PageState::ProcessingAndMapping
        } else {
            PageState::Processing
        };
        if self
            .status
            .transition(idx, PageState::Unprocessed, claimed, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        produce();
        self.counters.gc_pages.fetch_add(1, Ordering::Relaxed);
        let size = page_size();
        match self.mode {
            CompactionMode::Copy if map_immediately => {
                copy_pages(&*self.kernel, to_space_page, page, size, false);
                self.status
                    .store_state(idx, PageState::ProcessedAndMapped, Ordering::Release);
            }
            CompactionMode::Copy => {
                let from_space_page = (page - self.translator.from_space_begin) / size;
                self.status.store(
                    idx,
                    PageStatusWord::staged(PageState::Processed, from_space_page),
                    Ordering::Release,
                );
            }
            CompactionMode::MinorFault if map_immediately => {
                continue_pages(&*self.kernel, to_space_page, size, false);
                self.status
                    .store_state(idx, PageState::ProcessedAndMapped, Ordering::Release);
            }
            CompactionMode::MinorFault => {
                if self
                    .status
                    .transition(idx, PageState::Processing, PageState::Processed, Ordering::Release)
                    .is_err()
                {
                    // A mutator asked for the page meanwhile and waits for us to map it.
                    continue_pages(&*self.kernel, to_space_page, size, false);
                    self.status
                        .store_state(idx, PageState::ProcessedAndMapped, Ordering::Release);
                }
            }
            CompactionMode::Fallback => {}
        }
        true
    }

    /// Installs the processed pages starting at `arr_idx` (and not past `arr_len`) with as few
    /// calls as possible. Returns the number of bytes this call mapped.
    pub fn map_moving_space_pages(&self, arr_idx: usize, arr_len: usize) -> usize {
        let page = page_size();
        if arr_idx >= arr_len {
            return 0;
        }
        let first = self.status.load(arr_idx, Ordering::Acquire);
        if first.state() != PageState::Processed {
            return 0;
        }
        let from_space_page = first.from_space_page() as usize;
        let mut length = 0;
        let mut idx = arr_idx;
        while idx < arr_len {
            let word = self.status.load(idx, Ordering::Acquire);
            if word.state() != PageState::Processed {
                break;
            }
            // Staged copies have to be contiguous in from-space to go in one call.
            if self.mode == CompactionMode::Copy
                && word.from_space_page() as usize != from_space_page + (idx - arr_idx)
            {
                break;
            }
            if self
                .status
                .compare_exchange(
                    idx,
                    word,
                    PageStatusWord::of(PageState::ProcessedAndMapping),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_err()
            {
                break;
            }
            length += page;
            idx += 1;
        }
        if length == 0 {
            return 0;
        }
        let to_space_start = self.moving_begin() + arr_idx * page;
        match self.mode {
            CompactionMode::Copy => {
                copy_pages(
                    &*self.kernel,
                    to_space_start,
                    self.from_space_page_addr(from_space_page),
                    length,
                    false,
                );
            }
            CompactionMode::MinorFault => continue_pages(&*self.kernel, to_space_start, length, false),
            CompactionMode::Fallback => crate::gc_fatal!("mapping pages without registration"),
        }
        for i in arr_idx..idx {
            self.status
                .store_state(i, PageState::ProcessedAndMapped, Ordering::Release);
        }
        length
    }

    /// Produces every page of the moving space on the collector thread, from the highest down,
    /// releasing from-space behind itself. `buffer` is the collector's copy-mode buffer.
    pub fn compact_moving_space(&self, reclaimer: &mut Reclaimer, buffer: usize) {
        let page = page_size();
        let len = self.page_count();
        let copy_mode = self.mode == CompactionMode::Copy;
        let mut idx = len;
        let mut to_space_end = self.moving_begin() + len * page;
        let mut shadow_space_end = self.shadow_begin + len * page;
        let mut pre_compact_page =
            self.translator.black_allocations_begin + self.black_page_count * page;
        reclaimer.start(pre_compact_page, idx);

        let pages_per_release = (reclaimer.min_release_size() / page).max(1);
        let mut next_page_first_obj = 0;
        while idx > self.first_objs_count {
            idx -= 1;
            pre_compact_page -= page;
            to_space_end -= page;
            let dest = match self.mode {
                CompactionMode::MinorFault => {
                    shadow_space_end -= page;
                    shadow_space_end
                }
                CompactionMode::Fallback => to_space_end,
                CompactionMode::Copy => buffer,
            };
            let first_obj = self.first_objs[idx];
            if first_obj != 0 {
                let first_chunk_size = self.black_first_chunk[idx];
                self.do_page_compaction_with_state_change(idx, to_space_end, dest, true, || unsafe {
                    self.slide_black_page(
                        first_obj,
                        next_page_first_obj,
                        first_chunk_size,
                        pre_compact_page,
                        dest,
                        copy_mode,
                    )
                });
                if idx % pages_per_release == 0 {
                    self.free_from_space_pages(reclaimer, idx, 0);
                }
            }
            next_page_first_obj = first_obj;
        }

        let reserve_page = buffer;
        let mut end_idx_for_mapping = idx;
        while idx > 0 {
            idx -= 1;
            to_space_end -= page;
            let dest = match self.mode {
                CompactionMode::MinorFault => {
                    shadow_space_end -= page;
                    shadow_space_end
                }
                CompactionMode::Fallback => to_space_end,
                CompactionMode::Copy => reclaimer
                    .take_staging_page(self.translator.from_space_slide_diff())
                    .unwrap_or(reserve_page),
            };
            let map_immediately = copy_mode && dest == reserve_page;
            let first_obj = self.first_objs[idx];
            let offset = self.pre_compact_offset[idx];
            let success = self.do_page_compaction_with_state_change(
                idx,
                to_space_end,
                dest,
                map_immediately,
                || unsafe { self.compact_page(first_obj, offset, dest, copy_mode) },
            );
            if self.maps_pages() && (!success || map_immediately) && end_idx_for_mapping - idx > 1 {
                // The chain of staged pages above this one is broken.
                self.map_moving_space_pages(idx + 1, end_idx_for_mapping);
            }
            if self.free_from_space_pages(reclaimer, idx, end_idx_for_mapping) {
                end_idx_for_mapping = idx;
            }
        }
        if self.maps_pages() {
            if end_idx_for_mapping > 0 {
                self.map_moving_space_pages(idx, end_idx_for_mapping);
            }
            self.map_remaining_pages(len);
        }
    }

    /// Maps processed pages whose staging could not be batched with their neighbours.
    fn map_remaining_pages(&self, len: usize) {
        let mut idx = 0;
        while idx < len {
            let mapped = self.map_moving_space_pages(idx, len) / page_size();
            idx += mapped.max(1);
        }
    }

    /// Waits until every page in `[begin_idx, end_idx)` is installed.
    pub(crate) fn wait_for_mapped(&self, begin_idx: usize, end_idx: usize) {
        for idx in begin_idx..end_idx {
            let mut backoff = PageBackoff::new();
            while self.status.state(idx, Ordering::Acquire) != PageState::ProcessedAndMapped {
                backoff.wait();
            }
        }
    }
}

/// Updates the references of the part of non-moving page `page` owned by objects starting at
/// `first` or later.
unsafe fn update_non_moving_page(
    t: &AddressTranslator,
    space: &NonMovingSpace,
    first: usize,
    page: usize,
) {
    let page_end = page + page_size();
    let mut curr = first;
    space
        .mark_bitmap()
        .visit_marked_range(first + object::HEADER_SIZE, page_end, |next| {
            let begin = if curr < page { page - curr } else { 0 };
            t.update_object_refs(curr, curr, begin, usize::MAX);
            curr = next;
        });
    let begin = if curr < page { page - curr } else { 0 };
    t.update_object_refs(curr, curr, begin, page_end - curr);
}

/// Updates every reference from the non-moving space into the moving space, page by page from
/// the top.
pub fn update_non_moving_space(
    t: &AddressTranslator,
    space: &NonMovingSpace,
    first_objs: &NonMovingFirstObjects,
) {
    let page = page_size();
    let begin = space.begin();
    for idx in (0..first_objs.count).rev() {
        let first = first_objs.objs[idx];
        if first != 0 {
            unsafe {
                update_non_moving_page(t, space, first, begin + idx * page);
            }
        }
    }
}

/// Size of the object at `obj` whose class may sit in the moving space's from-space.
#[inline]
pub(crate) unsafe fn from_space_object_size(t: &AddressTranslator, obj: usize) -> usize {
    debug_assert!(read_word(obj + 8) != 0);
    align_up(
        object::size_of_object(obj, |class| t.class_source(class)),
        OBJECT_ALIGNMENT,
    )
}

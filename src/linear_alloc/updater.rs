//! Updating the roots held in linear-alloc arenas during the compaction phase.
//!
//! Arena pages are moved to a shadow mapping in the compaction pause. Each page is updated in the
//! shadow and installed back, either by the collector walking all arenas or by whoever faults on
//! it first.
use std::sync::atomic::Ordering;

use super::visit_arena_roots;
use crate::{
    cycle::{CompactionCycle, CompactionMode, LinearAllocSpaceData},
    error::OrFatal,
    globals::page_size,
    kernel::{continue_pages, copy_pages, zero_pages, AdviseKind},
    object::read_word,
    page_status::PageState,
    translate::AddressTranslator,
    util::{backoff::PageBackoff, mmap::force_read},
};

/// Updates the roots of one arena page in its shadow copy.
pub struct LinearAllocPageUpdater<'a> {
    translator: &'a AddressTranslator,
    last_page_touched: bool,
}

impl<'a> LinearAllocPageUpdater<'a> {
    pub fn new(translator: &'a AddressTranslator) -> Self {
        Self {
            translator,
            last_page_touched: false,
        }
    }

    /// Page `page_begin` of a multi-object arena whose first allocation starts at `first_obj`,
    /// both given as shadow addresses.
    pub unsafe fn multi_object_arena(&mut self, page_begin: usize, first_obj: usize) {
        let page_end = page_begin + page_size();
        let t = self.translator;
        self.last_page_touched =
            visit_arena_roots(first_obj, page_begin, page_end, |slot| t.update_root(slot));
    }

    /// A page of a single-object arena, every word of which is a root.
    pub unsafe fn single_object_arena(&mut self, page_begin: usize, len: usize) {
        let mut slot = page_begin;
        while slot < page_begin + len {
            if read_word(slot) != 0 {
                self.translator.update_root(slot);
                self.last_page_touched = true;
            }
            slot += 8;
        }
    }

    pub fn was_last_page_touched(&self) -> bool {
        self.last_page_touched
    }
}

impl CompactionCycle {
    /// Updates arena page `page` in its shadow. `first_obj` is `None` for single-object arenas.
    unsafe fn update_linear_alloc_page(
        &self,
        space: &LinearAllocSpaceData,
        page: usize,
        first_obj: Option<usize>,
    ) -> bool {
        let diff = space.shadow_diff();
        let mut updater = LinearAllocPageUpdater::new(&self.translator);
        match first_obj {
            Some(obj) => {
                updater.multi_object_arena(page.wrapping_add(diff), obj.wrapping_add(diff))
            }
            None => updater.single_object_arena(page.wrapping_add(diff), page_size()),
        }
        self.counters.linear_alloc_pages.fetch_add(1, Ordering::Relaxed);
        updater.was_last_page_touched()
    }

    /// Installs the processed pages of `[start_page, start_page + len)`, claiming as many
    /// contiguous ones per call as possible. With `single_ioctl` only the first run starting at
    /// `start_page` is attempted. With `free_pages` the shadow of the range is released
    /// afterwards. Returns false if `single_ioctl` found nothing to map.
    pub fn map_updated_linear_alloc_pages(
        &self,
        space: &LinearAllocSpaceData,
        start_page: usize,
        len: usize,
        free_pages: bool,
        single_ioctl: bool,
    ) -> bool {
        let page = page_size();
        let diff = space.shadow_diff();
        let first_idx = (start_page - space.begin) / page;
        let end_idx = first_idx + len / page;
        let mut idx = first_idx;
        let mut check_state_for_release = false;
        while idx < end_idx {
            let mut claimed = 0;
            while idx + claimed < end_idx
                && space
                    .status
                    .transition(
                        idx + claimed,
                        PageState::Processed,
                        PageState::ProcessedAndMapping,
                        Ordering::AcqRel,
                    )
                    .is_ok()
            {
                claimed += 1;
            }
            if claimed == 0 {
                if single_ioctl {
                    return false;
                }
                // Skip what others are working on.
                while idx < end_idx {
                    let state = space.status.state(idx, Ordering::Relaxed);
                    if state == PageState::Processed {
                        break;
                    }
                    check_state_for_release |=
                        state > PageState::Unprocessed && state < PageState::ProcessedAndMapped;
                    idx += 1;
                }
                continue;
            }
            let addr = space.begin + idx * page;
            match self.mode {
                CompactionMode::MinorFault => {
                    continue_pages(&*self.kernel, addr, claimed * page, false)
                }
                _ => {
                    copy_pages(&*self.kernel, addr, addr.wrapping_add(diff), claimed * page, false);
                }
            }
            for i in idx..idx + claimed {
                space
                    .status
                    .store_state(i, PageState::ProcessedAndMapped, Ordering::Release);
            }
            idx += claimed;
            if single_ioctl {
                break;
            }
        }
        if free_pages && self.mode == CompactionMode::Copy {
            if check_state_for_release {
                for i in first_idx..end_idx {
                    let mut backoff = PageBackoff::new();
                    loop {
                        let state = space.status.state(i, Ordering::Acquire);
                        if !(state > PageState::Unprocessed && state < PageState::ProcessedAndMapped) {
                            break;
                        }
                        backoff.wait();
                    }
                }
            }
            self.kernel
                .advise(start_page.wrapping_add(diff), len, AdviseKind::DontNeed)
                .or_fatal("releasing linear-alloc shadow pages");
        }
        true
    }

    /// Makes linear-alloc page `fault_page` readable on behalf of a faulting thread.
    pub fn concurrently_process_linear_alloc_page(&self, fault_page: usize, is_minor_fault: bool) {
        let page = page_size();
        let space = match self.linear_alloc_space(fault_page) {
            Some(space) => space,
            None => {
                log::warn!("fault at {:#x} outside every registered range", fault_page);
                zero_pages(&*self.kernel, fault_page, page, true, true);
                return;
            }
        };
        let arena = self
            .linear_alloc_arenas
            .range(..=fault_page)
            .next_back()
            .map(|(_, entry)| entry)
            .filter(|(arena, _)| fault_page < arena.end());
        let (arena, last_byte) = match arena {
            Some((arena, last_byte))
                if !arena.is_waiting_for_deletion() && fault_page < *last_byte =>
            {
                (arena, *last_byte)
            }
            _ => {
                // Not part of any arena in use at the pause, so it holds no roots to update.
                zero_pages(&*self.kernel, fault_page, page, true, false);
                return;
            }
        };
        debug_assert!(fault_page < last_byte);
        let diff = space.shadow_diff();
        let idx = (fault_page - space.begin) / page;
        let mut backoff = PageBackoff::new();
        let mut state = space.status.state(
            idx,
            if self.use_sigbus {
                Ordering::Acquire
            } else {
                Ordering::Relaxed
            },
        );
        loop {
            match state {
                PageState::Unprocessed => {
                    if space
                        .status
                        .transition(idx, PageState::Unprocessed, PageState::Processing, Ordering::Acquire)
                        .is_err()
                    {
                        state = space.status.state(idx, Ordering::Acquire);
                        continue;
                    }
                    let touched = unsafe {
                        self.update_linear_alloc_page(space, fault_page, arena.first_object(fault_page))
                    };
                    if !touched {
                        if self.mode == CompactionMode::Copy {
                            // Nothing on the shadow side worth copying.
                            zero_pages(&*self.kernel, fault_page, page, false, false);
                            space
                                .status
                                .store_state(idx, PageState::ProcessedAndMapped, Ordering::Release);
                            return;
                        }
                        if !is_minor_fault {
                            force_read(fault_page.wrapping_add(diff));
                        }
                    }
                    space
                        .status
                        .store_state(idx, PageState::Processed, Ordering::Release);
                    state = PageState::Processed;
                }
                PageState::Processed => {
                    if self.map_updated_linear_alloc_pages(space, fault_page, space.end - fault_page, false, true) {
                        return;
                    }
                    // Somebody else claimed it.
                    if !self.use_sigbus {
                        return;
                    }
                    backoff.wait();
                    state = space.status.state(idx, Ordering::Acquire);
                }
                PageState::ProcessedAndMapped => return,
                PageState::MutatorProcessing => {
                    crate::gc_fatal!("linear-alloc page {:#x} claimed by a mutator", fault_page)
                }
                _ => {
                    if !self.use_sigbus {
                        return;
                    }
                    backoff.wait();
                    state = space.status.state(idx, Ordering::Acquire);
                }
            }
        }
    }

    /// Updates every arena page nobody faulted on yet and installs the results, arena by arena.
    pub fn process_linear_alloc(&self) {
        let page = page_size();
        let mut range: Option<(usize, usize, usize)> = None;
        let flush = |cycle: &Self, (space_idx, begin, end): (usize, usize, usize)| {
            cycle.map_updated_linear_alloc_pages(
                &cycle.linear_alloc_spaces[space_idx],
                begin,
                end - begin,
                true,
                false,
            );
        };
        for (arena, last_byte) in self.linear_alloc_arenas.values() {
            let space_idx = match self
                .linear_alloc_spaces
                .iter()
                .position(|space| space.contains(arena.begin()))
            {
                Some(space_idx) => space_idx,
                None => crate::gc_fatal!("no linear-alloc space holds arena {:#x}", arena.begin()),
            };
            let space = &self.linear_alloc_spaces[space_idx];
            // Coalesce adjacent arenas of the same space into one mapping range.
            range = match range {
                Some((current, begin, end)) if current == space_idx && end == arena.begin() => {
                    Some((current, begin, arena.end()))
                }
                Some(done) => {
                    flush(self, done);
                    Some((space_idx, arena.begin(), arena.end()))
                }
                None => Some((space_idx, arena.begin(), arena.end())),
            };
            // Arenas freed since the pause keep their memory, but their pages need no update.
            let _pool = space.pool.read_lock();
            if arena.is_waiting_for_deletion() {
                continue;
            }
            let mut page_begin = arena.begin();
            while page_begin < arena.end() && page_begin < *last_byte {
                let idx = (page_begin - space.begin) / page;
                if space
                    .status
                    .transition(idx, PageState::Unprocessed, PageState::Processing, Ordering::Acquire)
                    .is_ok()
                {
                    let touched = unsafe {
                        self.update_linear_alloc_page(space, page_begin, arena.first_object(page_begin))
                    };
                    if touched || self.mode == CompactionMode::MinorFault {
                        if !touched {
                            force_read(page_begin.wrapping_add(space.shadow_diff()));
                        }
                        space
                            .status
                            .store_state(idx, PageState::Processed, Ordering::Release);
                    } else {
                        zero_pages(&*self.kernel, page_begin, page, false, false);
                        space
                            .status
                            .store_state(idx, PageState::ProcessedAndMapped, Ordering::Release);
                    }
                }
                page_begin += page;
            }
        }
        if let Some(done) = range {
            flush(self, done);
        }
    }
}

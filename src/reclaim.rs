//! Releasing from-space while the collector compacts from the top of the moving space down.
//!
//! Pages can only go once no page still to be produced needs anything from them. Objects are
//! read through their class, so a class object is kept as long as an instance below the
//! reclamation frontier still needs it.
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

use ahash::AHashMap;

use crate::{
    compact::from_space_object_size,
    cycle::{CompactionCycle, CompactionMode},
    error::OrFatal,
    globals::{page_size, FROM_SPACE_BUFFER_PAGES, OBJECT_ALIGNMENT},
    kernel::AdviseKind,
    page_status::PageState,
    util::{align_up, Region},
};

/// For every class in the moving space above some of its instances, the lowest such instance.
#[derive(Default)]
pub struct ClassAfterObjectMap {
    pending: AHashMap<usize, usize>,
    ordered: BTreeMap<usize, usize>,
}

impl ClassAfterObjectMap {
    /// Called for every live object while marking.
    pub fn record(&mut self, moving: Region, obj: usize, class: usize) {
        if class != 0 && moving.contains(class) && obj < class {
            self.pending
                .entry(class)
                .and_modify(|lowest| {
                    if obj < *lowest {
                        *lowest = obj;
                    }
                })
                .or_insert(obj);
        }
    }

    /// Orders the recorded classes by address for the reclamation walk.
    pub fn finalize(&mut self) {
        for (class, obj) in self.pending.drain() {
            let lowest = self.ordered.entry(class).or_insert(obj);
            if obj < *lowest {
                *lowest = obj;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn entries(&self) -> Vec<(usize, usize)> {
        self.ordered.iter().map(|(class, obj)| (*class, *obj)).collect()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.ordered.clear();
    }
}

/// Collector-thread reclamation state for one compaction phase.
pub struct Reclaimer {
    last_reclaimed_page: usize,
    last_reclaimable_page: usize,
    cur_reclaimable_page: usize,
    last_checked_reclaim_page_idx: usize,
    /// `(class, lowest instance)` ascending by class, consumed from the back.
    classes: Vec<(usize, usize)>,
    class_pos: usize,
    min_release_size: usize,
    released: Vec<Region>,
}

impl Reclaimer {
    pub fn new(class_after_obj: &ClassAfterObjectMap, min_release_size: usize) -> Self {
        let classes = class_after_obj.entries();
        Self {
            last_reclaimed_page: 0,
            last_reclaimable_page: 0,
            cur_reclaimable_page: 0,
            last_checked_reclaim_page_idx: 0,
            class_pos: classes.len(),
            classes,
            min_release_size: min_release_size.max((FROM_SPACE_BUFFER_PAGES + 1) * page_size()),
            released: Vec::new(),
        }
    }

    pub fn start(&mut self, pre_compact_end: usize, page_count: usize) {
        self.last_reclaimed_page = pre_compact_end;
        self.last_reclaimable_page = pre_compact_end;
        self.cur_reclaimable_page = pre_compact_end;
        self.last_checked_reclaim_page_idx = page_count;
    }

    #[inline]
    pub fn min_release_size(&self) -> usize {
        self.min_release_size
    }

    /// Takes the next already compacted but unreleased from-space page for staging a copy-mode
    /// page. `from_space_slide_diff` converts moving-space addresses into from-space addresses.
    pub fn take_staging_page(&mut self, from_space_slide_diff: usize) -> Option<usize> {
        if self.cur_reclaimable_page > self.last_reclaimable_page {
            self.cur_reclaimable_page -= page_size();
            Some(self.cur_reclaimable_page.wrapping_add(from_space_slide_diff))
        } else {
            None
        }
    }

    /// Lowest moving-space address whose from-space copy may still be needed.
    pub fn frontier(&self) -> usize {
        self.last_reclaimable_page
    }

    /// From-space ranges released so far, in moving-space addresses.
    pub fn released(&self) -> &[Region] {
        &self.released
    }
}

impl CompactionCycle {
    /// Releases the from-space pages that no page from `cur_page_idx` down needs. Pages at or
    /// after `end_idx_for_mapping` that are staged in copy mode get mapped first.
    ///
    /// Returns true if the caller's mapping range was taken care of.
    pub fn free_from_space_pages(
        &self,
        r: &mut Reclaimer,
        cur_page_idx: usize,
        end_idx_for_mapping: usize,
    ) -> bool {
        let page = page_size();
        let t = &self.translator;
        // A page still being produced by a mutator keeps its from-space.
        let mut idx = r.last_checked_reclaim_page_idx;
        while idx > cur_page_idx {
            if self.status.state(idx - 1, Ordering::Acquire) == PageState::MutatorProcessing {
                break;
            }
            idx -= 1;
        }
        if idx == r.last_checked_reclaim_page_idx {
            return false;
        }

        let first_obj = self.first_objs[idx];
        let idx_addr;
        let mut reclaim_begin;
        if idx >= self.first_objs_count {
            idx_addr = t.black_allocations_begin + (idx - self.first_objs_count) * page;
            reclaim_begin = idx_addr;
            if first_obj != 0 && first_obj < reclaim_begin {
                for i in idx + 1..self.page_count() {
                    let obj = self.first_objs[i];
                    if obj != first_obj {
                        reclaim_begin = if obj != 0 {
                            align_up(obj, page)
                        } else {
                            t.black_allocations_begin + (i - self.first_objs_count) * page
                        };
                        break;
                    }
                }
            }
        } else {
            idx_addr = t.moving.begin + self.pre_compact_offset[idx] as usize * OBJECT_ALIGNMENT;
            reclaim_begin = idx_addr;
            if first_obj < reclaim_begin {
                // The first object started on an earlier page; skip past it.
                let mut obj = first_obj;
                for i in idx + 1..self.first_objs_count {
                    obj = self.first_objs[i];
                    if obj != first_obj {
                        reclaim_begin = obj;
                        break;
                    }
                }
                if obj == first_obj {
                    reclaim_begin = t.black_allocations_begin;
                }
            }
            reclaim_begin = align_up(reclaim_begin, page);
        }

        while r.class_pos > 0 {
            let (class, obj) = r.classes[r.class_pos - 1];
            let class_end = class + unsafe { from_space_object_size(t, t.from_space_addr(class)) };
            if class_end >= reclaim_begin {
                if obj < idx_addr {
                    // Instances below the frontier still read this class.
                    reclaim_begin = align_up(class_end, page);
                    break;
                }
                r.class_pos -= 1;
                continue;
            }
            break;
        }

        let mut ret = self.mode == CompactionMode::Fallback;
        let size = r.last_reclaimed_page as isize - reclaim_begin as isize;
        if size > r.min_release_size as isize {
            if self.maps_pages() && cur_page_idx < end_idx_for_mapping {
                // Staged pages live in the range about to go.
                let mapped = self.map_moving_space_pages(cur_page_idx, end_idx_for_mapping);
                self.wait_for_mapped(cur_page_idx + mapped / page, end_idx_for_mapping);
                ret = true;
            }
            let size = size as usize - FROM_SPACE_BUFFER_PAGES * page;
            let addr = r.last_reclaimed_page - size;
            let kind = if self.mode == CompactionMode::MinorFault {
                AdviseKind::Remove
            } else {
                AdviseKind::DontNeed
            };
            self.kernel
                .advise(t.from_space_addr(addr), size, kind)
                .or_fatal("releasing from-space");
            log::trace!(
                "released from-space of [{:#x}, {:#x})",
                addr,
                addr + size
            );
            self.counters.released_bytes.fetch_add(size, Ordering::Relaxed);
            r.released.push(Region::new(addr, addr + size));
            r.last_reclaimed_page = addr;
            r.cur_reclaimable_page = addr;
        }
        crate::gc_check!(
            reclaim_begin <= r.last_reclaimable_page,
            "reclamation frontier moved up: {:#x} > {:#x}",
            reclaim_begin,
            r.last_reclaimable_page
        );
        r.last_reclaimable_page = reclaim_begin;
        r.last_checked_reclaim_page_idx = idx;
        ret
    }
}

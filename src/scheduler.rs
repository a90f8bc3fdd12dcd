//! Resolving faults on registered ranges while the collector thread compacts: the fault worker
//! loop, the SIGBUS handler and the page processing both of them share.
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::{
    cycle::{CompactionCycle, CompactionMode, InProgressScope, SIGBUS_COMPACTION_DONE},
    error::{OrFatal, Result},
    globals::page_size,
    kernel::{continue_pages, copy_pages, zero_pages, SigbusHandler},
    page_status::{PageState, PageStatusWord},
    util::{align_down, backoff::PageBackoff},
};

impl CompactionCycle {
    /// Makes moving-space page `fault_page` readable on behalf of a faulting thread. `buffer` is
    /// the worker's own compaction buffer; mutators in SIGBUS mode claim one lazily.
    pub fn concurrently_process_moving_page(&self, fault_page: usize, buffer: Option<usize>) {
        let page = page_size();
        let len = self.page_count();
        let unused_space_begin = self.moving_begin() + len * page;
        if self.mode == CompactionMode::Copy && fault_page >= unused_space_begin {
            // Racing threads may install the same zero page.
            zero_pages(&*self.kernel, fault_page, page, true, true);
            self.counters.zero_pages.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let idx = (fault_page - self.moving_begin()) / page;
        let first_obj = self.first_objs[idx];
        if first_obj == 0 {
            self.install_hole_pages(idx, len);
            return;
        }

        let mut backoff = PageBackoff::new();
        let mut word = self.status.load(
            idx,
            if self.use_sigbus {
                Ordering::Acquire
            } else {
                Ordering::Relaxed
            },
        );
        loop {
            let state = word.state();
            match state {
                PageState::ProcessedAndMapped => return,
                PageState::Processing
                    if self.mode == CompactionMode::MinorFault
                        && self
                            .status
                            .transition(
                                idx,
                                PageState::Processing,
                                PageState::ProcessingAndMapping,
                                Ordering::AcqRel,
                            )
                            .is_ok() =>
                {
                    // The collector maps the page once it is done with it.
                    if !self.use_sigbus {
                        return;
                    }
                    backoff.wait();
                    word = self.status.load(idx, Ordering::Acquire);
                }
                _ if state.is_in_progress() => {
                    if !self.use_sigbus {
                        return;
                    }
                    // Somebody is actively working on the page; wait for it to be mapped.
                    backoff.wait();
                    word = self.status.load(idx, Ordering::Acquire);
                }
                PageState::Unprocessed => {
                    // Raised before claiming so that the collector cannot unregister the space
                    // between the claim and the install.
                    let _in_progress = InProgressScope::new(&self.compaction_in_progress);
                    match self.status.compare_exchange(
                        idx,
                        word,
                        PageStatusWord::of(PageState::MutatorProcessing),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(()) => {
                            let dest = match self.mode {
                                CompactionMode::MinorFault => self.shadow_begin + idx * page,
                                _ => buffer.unwrap_or_else(|| self.thread_buffer()),
                            };
                            unsafe {
                                self.produce_page(idx, dest, self.mode == CompactionMode::Copy);
                            }
                            self.status
                                .store_state(idx, PageState::ProcessedAndMapping, Ordering::Release);
                            if self.mode == CompactionMode::MinorFault {
                                continue_pages(&*self.kernel, fault_page, page, false);
                            } else {
                                copy_pages(&*self.kernel, fault_page, dest, page, false);
                            }
                            self.counters.mutator_pages.fetch_add(1, Ordering::Relaxed);
                            self.status
                                .store_state(idx, PageState::ProcessedAndMapped, Ordering::Release);
                            return;
                        }
                        Err(current) => word = current,
                    }
                }
                PageState::Processed => {
                    let _in_progress = InProgressScope::new(&self.compaction_in_progress);
                    if self.map_moving_space_pages(idx, len) >= page {
                        return;
                    }
                    word = self.status.load(idx, Ordering::Acquire);
                }
                _ => crate::gc_fatal!("unexpected state {:?} of moving page {}", state, idx),
            }
        }
    }

    /// Maps the run of empty black-allocation pages starting at `idx` in one call. The run ends
    /// at the first page that holds objects or that another thread already claimed.
    fn install_hole_pages(&self, idx: usize, len: usize) {
        let page = page_size();
        let mut end_idx = idx;
        while end_idx < len
            && self.first_objs[end_idx] == 0
            && self
                .status
                .transition(
                    end_idx,
                    PageState::Unprocessed,
                    PageState::ProcessedAndMapping,
                    Ordering::AcqRel,
                )
                .is_ok()
        {
            end_idx += 1;
        }
        if end_idx == idx {
            return;
        }
        let start = self.moving_begin() + idx * page;
        let length = (end_idx - idx) * page;
        if self.mode == CompactionMode::MinorFault {
            for i in idx..end_idx {
                let shadow_page = self.shadow_begin + i * page;
                unsafe { std::ptr::write_volatile(shadow_page as *mut u8, 0) };
            }
            continue_pages(&*self.kernel, start, length, true);
        } else {
            zero_pages(&*self.kernel, start, length, false, true);
        }
        self.counters.zero_pages.fetch_add(end_idx - idx, Ordering::Relaxed);
        for i in idx..end_idx {
            self.status
                .store_state(i, PageState::ProcessedAndMapped, Ordering::Release);
        }
    }

    /// Body of a fault worker. Returns after the collector touched the termination page.
    pub fn concurrent_compaction(&self, buffer: usize, termination_page: usize) {
        loop {
            let event = self.kernel.read_fault().or_fatal("reading a userfaultfd event");
            let fault_page = align_down(event.addr, page_size());
            if fault_page == termination_page {
                // Only one worker wakes up per touch, so a plain decrement is enough.
                let remaining = self.thread_counter.fetch_sub(1, Ordering::AcqRel);
                if !self.kernel.capabilities().fault_retry || remaining == 1 {
                    zero_pages(&*self.kernel, fault_page, page_size(), false, false);
                } else {
                    self.kernel
                        .wake(fault_page, page_size())
                        .or_fatal("waking the termination page");
                }
                log::trace!("fault worker done, {} left", remaining - 1);
                return;
            }
            if self.has_moving_address(fault_page) {
                self.concurrently_process_moving_page(fault_page, Some(buffer));
            } else {
                self.concurrently_process_linear_alloc_page(fault_page, event.minor);
            }
        }
    }

    /// Called on a mutator that faulted on a registered range in SIGBUS mode.
    pub fn sigbus_handler(&self, addr: usize) -> bool {
        let mut prev = self.sigbus_in_progress.load(Ordering::Relaxed);
        let mut done = true;
        while prev & SIGBUS_COMPACTION_DONE == 0 {
            match self.sigbus_in_progress.compare_exchange(
                prev,
                prev + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    done = false;
                    break;
                }
                Err(current) => prev = current,
            }
        }
        let fault_page = align_down(addr, page_size());
        if done {
            // Raised before compaction finished but delivered after.
            return self.has_moving_address(fault_page)
                || self.linear_alloc_space(fault_page).is_some();
        }
        let handled = if self.has_moving_address(fault_page) {
            self.concurrently_process_moving_page(fault_page, None);
            true
        } else if self.linear_alloc_space(fault_page).is_some() {
            self.concurrently_process_linear_alloc_page(fault_page, false);
            true
        } else {
            false
        };
        self.sigbus_in_progress.fetch_sub(1, Ordering::Release);
        handled
    }
}

/// Threads resolving userfaultfd events for one compaction phase.
pub struct FaultWorkers {
    handles: Vec<JoinHandle<()>>,
}

impl FaultWorkers {
    /// Starts `count` workers. Worker `i` uses compaction buffer `i + 1`.
    pub fn start(cycle: &Arc<CompactionCycle>, count: usize, termination_page: usize) -> Result<Self> {
        cycle.thread_counter.store(count, Ordering::Release);
        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            let cycle = cycle.clone();
            let buffer = cycle.buffers.page(i + 1);
            let handle = std::thread::Builder::new()
                .name(format!("cmc-fault-worker-{}", i))
                .spawn(move || cycle.concurrent_compaction(buffer, termination_page))
                .map_err(|source| crate::error::Error::Syscall {
                    op: "spawning a fault worker",
                    begin: 0,
                    end: 0,
                    source,
                })?;
            handles.push(handle);
        }
        Ok(Self { handles })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                crate::gc_fatal!("fault worker panicked");
            }
        }
    }
}

/// Handler to install on the kernel for the duration of a SIGBUS-mode compaction phase.
pub fn sigbus_handler_for(cycle: &Arc<CompactionCycle>) -> SigbusHandler {
    let cycle = cycle.clone();
    Arc::new(move |addr| cycle.sigbus_handler(addr))
}

/// Tells SIGBUS handlers that compaction is over and waits for the running ones to finish.
pub fn finish_sigbus_compaction(cycle: &CompactionCycle) {
    let count = cycle
        .sigbus_in_progress
        .fetch_or(SIGBUS_COMPACTION_DONE, Ordering::AcqRel);
    let mut remaining = count & !SIGBUS_COMPACTION_DONE;
    let mut backoff = PageBackoff::new();
    while remaining > 0 {
        backoff.wait();
        remaining = cycle.sigbus_in_progress.load(Ordering::Acquire) & !SIGBUS_COMPACTION_DONE;
    }
}

//! The concurrent mark-compact collector.
//!
//! A cycle runs through these phases, driven by [`Heap::collect`](crate::heap::Heap::collect):
//!
//! 1. [`MarkCompact::initialize_phase`] picks the compaction mode for the cycle.
//! 2. [`MarkCompact::marking_pause`] marks everything reachable with mutators stopped. Objects
//!    allocated afterwards are black: live for this cycle without being marked.
//! 3. [`MarkCompact::prepare_for_compaction`] computes post-compaction offsets while mutators run.
//! 4. [`MarkCompact::compaction_pause`] accounts for black allocations, updates roots and the
//!    non-moving space, moves the moving space out of the way and registers it for faults.
//! 5. [`MarkCompact::compaction_phase`] produces the moving-space pages from the top down while
//!    mutators fault in the pages they need first.
//! 6. [`MarkCompact::finish_phase`] resets everything for the next cycle.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ahash::AHashSet;
use atomic::Atomic;
use crossbeam_utils::CachePadded;

use crate::{
    accounting::{chunk_info::ChunkInfoVec, live_words::LiveWordsBitmap},
    compact::update_non_moving_space,
    cycle::{CompactionBuffers, CompactionCycle, CompactionMode, CycleCounters, LinearAllocSpaceData},
    error::{OrFatal, Result},
    globals::{page_size, MAX_UFFD_WORKERS, MUTATOR_COMPACTION_BUFFER_COUNT, OFFSET_CHUNK_SIZE},
    kernel::{AdviseKind, Kernel, RegisterMode},
    linear_alloc::{arena_pool::ArenaPool, visit_pool_roots},
    marking::{MarkingResult, MarkingVisitor, SynchronousMarking},
    object::{self, read_word},
    page_status::PageStatusArray,
    reclaim::{ClassAfterObjectMap, Reclaimer},
    scheduler::{finish_sigbus_compaction, sigbus_handler_for, FaultWorkers},
    space::{BumpPointerSpace, NonMovingSpace},
    statistics::CompactionStatistics,
    translate::{AddressTranslator, FirstObjectTable, NonMovingFirstObjects},
    util::{align_up, backoff::PageBackoff, mmap::force_read, mmap::madvise, mmap::MemMap, Region},
    Config, FaultStrategy, UffdPolicy,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GcPhase {
    Idle,
    /// Between the marking pause and the compaction pause.
    Marking,
    /// From the compaction pause until the cycle finished.
    Compacting,
}

/// What the collector needs from the runtime while mutators are stopped.
pub trait MutatorRoots {
    /// Calls `visitor` with the address of every root slot.
    fn visit_roots(&self, visitor: &mut dyn FnMut(usize));
    /// Takes the TLABs away from all mutators.
    fn revoke_tlabs(&self);
    /// Moves all TLABs down by `diff` bytes.
    fn slide_tlabs(&self, diff: usize);
}

pub struct MarkCompact {
    config: Config,
    kernel: Arc<dyn Kernel>,
    moving_space: Arc<BumpPointerSpace>,
    non_moving_space: Arc<NonMovingSpace>,
    arena_pool: Arc<ArenaPool>,
    from_space: MemMap,
    /// Shared memory the moving space is aliased to in minor-fault mode.
    shadow: MemMap,
    live_words: Arc<LiveWordsBitmap>,
    chunk_info: ChunkInfoVec,
    first_objs: FirstObjectTable,
    non_moving_first_objs: NonMovingFirstObjects,
    class_after_obj: ClassAfterObjectMap,
    buffers: Option<Arc<CompactionBuffers>>,
    /// Registered page fault workers are told to stop on.
    termination_page: Option<usize>,
    minor_fault_initialized: bool,
    phase: Atomic<GcPhase>,
    mode: CompactionMode,
    use_sigbus: bool,
    worker_count: usize,
    black_allocations_begin: usize,
    post_compact_end: usize,
    vector_length: usize,
    cycle: Option<Arc<CompactionCycle>>,
    workers: Option<FaultWorkers>,
    released: Vec<Region>,
    cycle_start: Option<Instant>,
    cycles: usize,
    stats: CompactionStatistics,
}

impl MarkCompact {
    pub fn new(
        config: &Config,
        kernel: Arc<dyn Kernel>,
        moving_space: Arc<BumpPointerSpace>,
        non_moving_space: Arc<NonMovingSpace>,
        arena_pool: Arc<ArenaPool>,
    ) -> Result<Self> {
        let page = page_size();
        let capacity = moving_space.capacity();
        let caps = kernel.capabilities();
        let from_space = MemMap::map_anonymous("moving space from-space", capacity)?;
        let shadow = if caps.uffd && caps.minor_fault && config.uffd == UffdPolicy::Auto {
            MemMap::map_shared_anonymous("moving space shadow", capacity)?
        } else {
            MemMap::invalid("moving space shadow")
        };
        let live_words = Arc::new(LiveWordsBitmap::create(moving_space.begin(), capacity)?);
        let non_moving_pages = (non_moving_space.limit() - non_moving_space.begin()) / page;
        logln_if!(
            config.verbose,
            "mark-compact on {} kernel: {:?}, minor faults {}",
            kernel.name(),
            caps,
            if shadow.is_valid() { "enabled" } else { "disabled" }
        );
        Ok(Self {
            config: config.clone(),
            kernel,
            from_space,
            shadow,
            live_words,
            chunk_info: ChunkInfoVec::new(capacity),
            first_objs: FirstObjectTable::new(capacity / page),
            non_moving_first_objs: NonMovingFirstObjects::new(non_moving_pages),
            class_after_obj: ClassAfterObjectMap::default(),
            buffers: None,
            termination_page: None,
            minor_fault_initialized: false,
            phase: Atomic::new(GcPhase::Idle),
            mode: CompactionMode::Fallback,
            use_sigbus: false,
            worker_count: 0,
            black_allocations_begin: moving_space.begin(),
            post_compact_end: moving_space.begin(),
            vector_length: 0,
            cycle: None,
            workers: None,
            released: Vec::new(),
            cycle_start: None,
            cycles: 0,
            stats: CompactionStatistics::default(),
            moving_space,
            non_moving_space,
            arena_pool,
        })
    }

    #[inline]
    pub fn phase(&self) -> GcPhase {
        self.phase.load(Ordering::Acquire)
    }

    #[inline]
    pub fn mode(&self) -> CompactionMode {
        self.mode
    }

    #[inline]
    pub fn use_sigbus(&self) -> bool {
        self.use_sigbus
    }

    pub fn minor_fault_initialized(&self) -> bool {
        self.minor_fault_initialized
    }

    pub fn cycles(&self) -> usize {
        self.cycles
    }

    /// The compaction phase in progress, if any.
    pub fn cycle(&self) -> Option<&Arc<CompactionCycle>> {
        self.cycle.as_ref()
    }

    /// From-space ranges released while compacting in the last cycle, in moving-space addresses.
    pub fn released_from_space(&self) -> &[Region] {
        &self.released
    }

    pub fn class_after_object(&self) -> &ClassAfterObjectMap {
        &self.class_after_obj
    }

    /// Picks the mode of the next cycle and sets up what it needs.
    pub fn initialize_phase(&mut self) -> Result<()> {
        self.cycles += 1;
        self.cycle_start = Some(Instant::now());
        self.stats = CompactionStatistics {
            cycle: self.cycles,
            ..Default::default()
        };
        self.released.clear();
        let caps = self.kernel.capabilities();
        self.mode = if self.config.uffd == UffdPolicy::Disabled || !caps.uffd {
            CompactionMode::Fallback
        } else if self.minor_fault_initialized {
            CompactionMode::MinorFault
        } else {
            CompactionMode::Copy
        };
        self.use_sigbus = self.mode.is_concurrent()
            && caps.sigbus
            && match self.config.fault_strategy {
                FaultStrategy::Auto | FaultStrategy::Sigbus => true,
                FaultStrategy::Workers(_) => false,
            };
        if self.mode.is_concurrent() && !caps.sigbus && self.config.fault_strategy == FaultStrategy::Sigbus {
            log::warn!("SIGBUS fault delivery unavailable, using fault workers");
        }
        self.worker_count = if self.mode.is_concurrent() && !self.use_sigbus {
            match self.config.fault_strategy {
                FaultStrategy::Workers(count) => count.max(1),
                _ => MAX_UFFD_WORKERS,
            }
        } else {
            0
        };

        let pages = 1 + if self.use_sigbus {
            MUTATOR_COMPACTION_BUFFER_COUNT
        } else {
            self.worker_count
        };
        if self.buffers.as_ref().map_or(true, |buffers| buffers.pages() < pages) {
            if let Some(page) = self.termination_page.take() {
                self.kernel.unregister(page, page_size())?;
            }
            self.buffers = Some(Arc::new(CompactionBuffers::new(pages)?));
        }
        if self.mode.is_concurrent() && !self.use_sigbus && self.termination_page.is_none() {
            if let Some(buffers) = &self.buffers {
                let page = buffers.page(0);
                // Mapped before registering so that the collector can use it as its buffer.
                force_read(page);
                self.kernel.register(page, page_size(), RegisterMode::Missing)?;
                self.termination_page = Some(page);
            }
        }
        log::debug!(
            "cycle {}: {:?} mode, {}",
            self.cycles,
            self.mode,
            if self.use_sigbus {
                "SIGBUS".to_string()
            } else {
                format!("{} fault workers", self.worker_count)
            }
        );
        Ok(())
    }

    fn mark_from(&mut self, roots: impl FnOnce(&mut MarkingVisitor<'_>)) -> MarkingResult {
        SynchronousMarking::new(
            &self.moving_space,
            &self.non_moving_space,
            &self.live_words,
            &mut self.chunk_info,
            &mut self.class_after_obj,
        )
        .run(roots)
    }

    /// Marks `obj` and everything reachable from it. Only valid while mutators are stopped
    /// before the compaction pause.
    pub fn mark_object(&mut self, obj: usize) -> MarkingResult {
        self.mark_from(|visitor| visitor.visit(obj))
    }

    pub fn marking_pause(&mut self, roots: &dyn MutatorRoots) {
        let start = Instant::now();
        self.phase.store(GcPhase::Marking, Ordering::Release);
        roots.revoke_tlabs();
        self.arena_pool.defer_arena_freeing();
        let pool = self.arena_pool.clone();
        let result = self.mark_from(|visitor| {
            roots.visit_roots(&mut |slot| visitor.visit_root_slot(slot));
            visit_pool_roots(&pool, |slot| visitor.visit_root_slot(slot));
        });
        self.stats.objects_marked = result.objects_marked;
        self.stats.bytes_marked = result.bytes_visited;
        self.stats.moving_space_before = self.moving_space.size();
        self.black_allocations_begin = self.moving_space.align_end(page_size());
        self.non_moving_space.set_track_allocations(true);
        self.stats.marking_pause = start.elapsed();
        log::debug!(
            "marked {} objects ({} bytes), black allocations from {:#x}",
            result.objects_marked,
            result.bytes_visited,
            self.black_allocations_begin
        );
    }

    /// Computes where everything marked goes. Runs with mutators allocating black.
    pub fn prepare_for_compaction(&mut self) {
        let page = page_size();
        let moving_begin = self.moving_space.begin();
        self.vector_length = (self.black_allocations_begin - moving_begin) / OFFSET_CHUNK_SIZE;
        self.first_objs.clear();
        self.first_objs.init_moving(
            self.chunk_info.as_slice(),
            self.vector_length,
            &self.live_words,
            self.moving_space.mark_bitmap(),
        );
        let (_, live_bytes) = self.chunk_info.exclusive_prefix_sum(self.vector_length);
        self.post_compact_end = align_up(moving_begin + live_bytes, page);
        crate::gc_check!(
            self.first_objs.first_objs_count == (self.post_compact_end - moving_begin) / page,
            "{} first objects for {} live bytes",
            self.first_objs.first_objs_count,
            live_bytes
        );
        self.non_moving_first_objs.init(&self.non_moving_space);
    }

    pub fn compaction_pause(&mut self, roots: &dyn MutatorRoots) {
        let start = Instant::now();
        let page = page_size();
        let moving_region = self.moving_space.region();
        let moving_begin = moving_region.begin;
        let capacity = self.moving_space.capacity();
        let black_begin = self.black_allocations_begin;

        self.stats.black_allocated = self.moving_space.end() - black_begin;
        let (main_block_size, blocks) = self.moving_space.get_block_sizes();
        let consumed = match blocks {
            Some(blocks) => {
                let class_after_obj = &mut self.class_after_obj;
                self.first_objs.init_black(
                    moving_begin,
                    self.moving_space.size(),
                    main_block_size,
                    &blocks,
                    black_begin,
                    self.moving_space.mark_bitmap(),
                    |obj, _| class_after_obj.record(moving_region, obj, unsafe { object::class_of(obj) }),
                )
            }
            None => {
                self.first_objs.black_page_count = 0;
                0
            }
        };
        self.moving_space
            .set_block_sizes(self.post_compact_end - moving_begin, consumed);
        roots.slide_tlabs(black_begin - self.post_compact_end);

        let non_moving_begin = self.non_moving_space.begin();
        for obj in self.non_moving_space.take_allocation_stack() {
            self.non_moving_space.mark_bitmap().set(obj);
            self.non_moving_first_objs.add_black_object(non_moving_begin, obj);
        }
        self.non_moving_space.set_track_allocations(false);
        self.class_after_obj.finalize();
        self.stats.deferred_classes = self.class_after_obj.len();

        let translator = AddressTranslator::new(
            moving_region,
            self.from_space.begin(),
            black_begin,
            self.post_compact_end,
            self.chunk_info.as_slice().into(),
            self.live_words.clone(),
        );

        let mode = self.mode;
        let page_count = self.first_objs.len();
        let used = page_count * page;
        let from = self.from_space.begin();
        match mode {
            CompactionMode::Fallback => self
                .kernel
                .move_pages(moving_begin, from, capacity, None)
                .or_fatal("moving the moving space"),
            CompactionMode::Copy => {
                let alias = if self.shadow.is_valid() {
                    Some(self.shadow.begin())
                } else {
                    None
                };
                self.kernel
                    .move_pages(moving_begin, from, capacity, alias)
                    .or_fatal("moving the moving space");
                self.kernel
                    .register(moving_begin, capacity, RegisterMode::Missing)
                    .or_fatal("registering the moving space");
            }
            CompactionMode::MinorFault => {
                self.kernel
                    .remap_shared(self.shadow.begin(), capacity)
                    .or_fatal("recreating the moving space shadow");
                self.kernel
                    .move_pages(moving_begin, from, capacity, Some(self.shadow.begin()))
                    .or_fatal("moving the moving space");
                if used > 0 {
                    self.kernel
                        .register(moving_begin, used, RegisterMode::Minor)
                        .or_fatal("registering the moving space");
                }
            }
        }

        let mut linear_alloc_spaces = Vec::new();
        let mut linear_alloc_arenas = BTreeMap::new();
        if mode.is_concurrent() {
            linear_alloc_arenas = self.arena_pool.snapshot();
            linear_alloc_spaces.push(self.prepare_linear_alloc_space(mode));
        }

        update_non_moving_space(&translator, &self.non_moving_space, &self.non_moving_first_objs);

        let buffers = match &self.buffers {
            Some(buffers) => buffers.clone(),
            None => crate::gc_fatal!("compaction pause without compaction buffers"),
        };
        let cycle = Arc::new(CompactionCycle {
            epoch: CompactionCycle::next_epoch(),
            kernel: self.kernel.clone(),
            mode,
            use_sigbus: self.use_sigbus,
            translator,
            moving_space: self.moving_space.clone(),
            first_objs: self.first_objs.objs[..page_count].into(),
            pre_compact_offset: self.first_objs.pre_compact_offset[..page_count].into(),
            black_first_chunk: self.first_objs.black_first_chunk[..page_count].into(),
            first_objs_count: self.first_objs.first_objs_count,
            black_page_count: self.first_objs.black_page_count,
            status: PageStatusArray::new(page_count),
            shadow_begin: self.shadow.begin(),
            buffers,
            buffer_counter: AtomicUsize::new(1),
            compaction_in_progress: CachePadded::new(AtomicUsize::new(0)),
            sigbus_in_progress: CachePadded::new(AtomicU32::new(0)),
            thread_counter: AtomicUsize::new(0),
            linear_alloc_spaces,
            linear_alloc_arenas,
            counters: CycleCounters::default(),
        });
        self.cycle = Some(cycle.clone());
        self.phase.store(GcPhase::Compacting, Ordering::Release);

        roots.visit_roots(&mut |slot| self.update_root(slot));
        if !mode.is_concurrent() {
            // Nothing was moved, the arenas are updated in place.
            visit_pool_roots(&self.arena_pool, |slot| self.update_root(slot));
        }

        match mode {
            CompactionMode::Fallback => {
                let mut reclaimer =
                    Reclaimer::new(&self.class_after_obj, self.config.min_from_space_release_size);
                cycle.compact_moving_space(&mut reclaimer, cycle.buffers.page(0));
                self.released = reclaimer.released().to_vec();
            }
            _ if self.use_sigbus => self
                .kernel
                .install_sigbus_handler(Some(sigbus_handler_for(&cycle))),
            _ => {
                let termination_page = cycle.buffers.page(0);
                self.workers = Some(
                    FaultWorkers::start(&cycle, self.worker_count, termination_page)
                        .or_fatal("starting fault workers"),
                );
            }
        }
        self.stats.compaction_pause = start.elapsed();
        log::debug!(
            "compaction pause: {} pages ({} black), post-compact end {:#x}",
            page_count,
            self.first_objs.black_page_count,
            self.post_compact_end
        );
    }

    /// Moves the arena pool to a fresh shadow and registers it, so that every arena page gets its
    /// roots updated before anyone reads it.
    fn prepare_linear_alloc_space(&self, mode: CompactionMode) -> LinearAllocSpaceData {
        let page = page_size();
        let region = self.arena_pool.region();
        let minor = mode == CompactionMode::MinorFault;
        crate::gc_check!(
            !minor || self.arena_pool.is_shared(),
            "minor faults on a private arena pool"
        );
        let shadow = if minor {
            MemMap::map_shared_anonymous("linear-alloc shadow", region.len())
        } else {
            MemMap::map_anonymous("linear-alloc shadow", region.len())
        }
        .or_fatal("mapping the linear-alloc shadow");
        let alias = if minor { Some(shadow.begin()) } else { None };
        self.kernel
            .move_pages(region.begin, shadow.begin(), region.len(), alias)
            .or_fatal("moving the arena pool");
        self.kernel
            .register(
                region.begin,
                region.len(),
                if minor {
                    RegisterMode::Minor
                } else {
                    RegisterMode::Missing
                },
            )
            .or_fatal("registering the arena pool");
        LinearAllocSpaceData {
            pool: self.arena_pool.clone(),
            begin: region.begin,
            end: region.end,
            shadow,
            status: PageStatusArray::new(region.len() / page),
        }
    }

    /// Produces every page nobody faulted on yet, then tears down fault handling.
    pub fn compaction_phase(&mut self) {
        let cycle = match &self.cycle {
            Some(cycle) if cycle.mode.is_concurrent() => cycle.clone(),
            _ => return,
        };
        let page = page_size();
        let moving_begin = self.moving_space.begin();
        let capacity = self.moving_space.capacity();
        let used = cycle.page_count() * page;
        if cycle.mode == CompactionMode::Copy && capacity > used {
            self.kernel
                .unregister(moving_begin + used, capacity - used)
                .or_fatal("unregistering the unused moving space");
        }

        let mut reclaimer =
            Reclaimer::new(&self.class_after_obj, self.config.min_from_space_release_size);
        cycle.compact_moving_space(&mut reclaimer, cycle.buffers.page(0));
        self.released = reclaimer.released().to_vec();
        cycle.wait_for_mapped(0, cycle.page_count());
        let mut backoff = PageBackoff::new();
        while cycle.compaction_in_progress.load(Ordering::Acquire) > 0 {
            backoff.wait();
        }
        if used > 0 {
            self.kernel
                .unregister(moving_begin, used)
                .or_fatal("unregistering the moving space");
        }
        self.kernel
            .advise(
                self.from_space.begin(),
                capacity,
                if cycle.mode == CompactionMode::MinorFault {
                    AdviseKind::Remove
                } else {
                    AdviseKind::DontNeed
                },
            )
            .or_fatal("releasing from-space");

        cycle.process_linear_alloc();
        if cycle.use_sigbus {
            finish_sigbus_compaction(&cycle);
        } else {
            self.terminate_workers(&cycle);
        }
        for space in &cycle.linear_alloc_spaces {
            self.kernel
                .unregister(space.begin, space.end - space.begin)
                .or_fatal("unregistering the arena pool");
        }
        if cycle.use_sigbus {
            self.kernel.install_sigbus_handler(None);
        }
    }

    fn terminate_workers(&mut self, cycle: &CompactionCycle) {
        let page = page_size();
        let termination_page = cycle.buffers.page(0);
        while cycle.thread_counter.load(Ordering::Acquire) > 0 {
            self.kernel
                .advise(termination_page, page, AdviseKind::DontNeed)
                .or_fatal("releasing the termination page");
            self.kernel.touch(termination_page);
            force_read(termination_page);
        }
        if let Some(workers) = self.workers.take() {
            log::trace!("joining {} fault workers", workers.len());
            workers.join();
        }
    }

    pub fn finish_phase(&mut self) -> CompactionStatistics {
        let page = page_size();
        if let Some(cycle) = self.cycle.take() {
            let counters = &cycle.counters;
            self.stats.mode = cycle.mode;
            self.stats.use_sigbus = cycle.use_sigbus;
            self.stats.fault_workers = self.worker_count;
            self.stats.pages_compacted = cycle.page_count();
            self.stats.pages_compacted_by_gc = counters.gc_pages.load(Ordering::Relaxed);
            self.stats.pages_compacted_by_mutators = counters.mutator_pages.load(Ordering::Relaxed);
            self.stats.zero_pages = counters.zero_pages.load(Ordering::Relaxed);
            self.stats.linear_alloc_pages = counters.linear_alloc_pages.load(Ordering::Relaxed);
            self.stats.from_space_released = counters.released_bytes.load(Ordering::Relaxed);
            if !cycle.mode.is_concurrent() {
                self.kernel
                    .advise(self.from_space.begin(), self.moving_space.capacity(), AdviseKind::DontNeed)
                    .or_fatal("releasing from-space");
            }
        }
        if let Some(buffers) = &self.buffers {
            if buffers.pages() > 1 {
                if let Err(err) = madvise(buffers.page(1), (buffers.pages() - 1) * page, libc::MADV_DONTNEED) {
                    log::warn!("could not release compaction buffers: {}", err);
                }
            }
        }
        self.live_words.clear();
        self.moving_space.mark_bitmap().clear_all();
        self.non_moving_space.mark_bitmap().clear_all();
        self.chunk_info.clear();
        self.first_objs.clear();
        self.class_after_obj.clear();
        self.arena_pool
            .delete_unused_arenas()
            .or_fatal("deleting arenas freed during compaction");
        self.minor_fault_initialized = self.mode.is_concurrent()
            && self.kernel.capabilities().minor_fault
            && self.shadow.is_valid();

        self.stats.moving_space_after = self.moving_space.size();
        if let Some(start) = self.cycle_start.take() {
            self.stats.total = start.elapsed();
        }
        self.phase.store(GcPhase::Idle, Ordering::Release);
        logln_if!(self.config.verbose, "{}", self.stats);
        self.stats.clone()
    }

    /// Whether `obj` survives the current cycle. While compacting the answer is the object's
    /// post-compaction address.
    ///
    /// Non-moving objects allocated after the marking pause are only known once the compaction
    /// pause accounted for them.
    pub fn is_marked(&self, obj: usize) -> Option<usize> {
        match self.phase() {
            GcPhase::Idle => Some(obj),
            GcPhase::Compacting if self.moving_space.has_address(obj) => match &self.cycle {
                Some(cycle) => cycle.translator.is_marked(obj),
                None => Some(obj),
            },
            GcPhase::Marking if self.moving_space.has_address(obj) => {
                if obj >= self.black_allocations_begin || self.moving_space.mark_bitmap().test(obj) {
                    Some(obj)
                } else {
                    None
                }
            }
            _ if self.non_moving_space.has_address(obj) => {
                if self.non_moving_space.mark_bitmap().test(obj) {
                    Some(obj)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Rewrites the root at `slot` to the post-compaction address of its referent.
    pub fn update_root(&self, slot: usize) {
        if let Some(cycle) = &self.cycle {
            unsafe { cycle.translator.update_root(slot) }
        }
    }

    /// Rewrites the reference at `slot`, whose referent must be live.
    pub fn update_reference(&self, slot: usize) {
        if let Some(cycle) = &self.cycle {
            unsafe { cycle.translator.update_ref(slot) }
        }
    }

    /// Checks that every root and every reference in the moving space points at an object.
    /// Mutators must be stopped.
    pub fn verify_heap(&self, roots: &dyn MutatorRoots) {
        let moving = &self.moving_space;
        let non_moving = &self.non_moving_space;
        let mut objects = AHashSet::new();
        moving.walk(|obj| {
            objects.insert(obj);
        });
        let check = |what: &str, holder: usize, value: usize| {
            if value == 0 {
                return;
            }
            if moving.has_address(value) {
                crate::gc_check!(
                    objects.contains(&value),
                    "{} {:#x} refers to {:#x}, which is not an object",
                    what,
                    holder,
                    value
                );
            } else {
                crate::gc_check!(
                    non_moving.has_address(value) && value < non_moving.end(),
                    "{} {:#x} refers to {:#x} outside the heap",
                    what,
                    holder,
                    value
                );
            }
        };
        roots.visit_roots(&mut |slot| check("root", slot, unsafe { read_word(slot) }));
        for &obj in objects.iter() {
            unsafe {
                object::visit_reference_offsets(obj, object::in_place, 0, usize::MAX, |offset| {
                    check("object", obj, read_word(obj + offset))
                });
            }
        }
        log::debug!("verified {} moving-space objects", objects.len());
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::{heap::Heap, kernel::emulated::EmulatedKernel, kernel::Capabilities};

    #[test]
    fn prefix_sum_total_matches_live_words() {
        let _ = env_logger::builder().is_test(true).try_init();
        let kernel: Arc<dyn Kernel> = Arc::new(EmulatedKernel::new(Capabilities::none()));
        let config = Config {
            moving_space_capacity: 4 * 1024 * 1024,
            non_moving_space_capacity: 1024 * 1024,
            linear_alloc_capacity: 1024 * 1024,
            ..Default::default()
        };
        let heap = Heap::with_kernel(config, kernel).unwrap();
        let mutator = heap.attach_mutator();
        let mut rng = StdRng::seed_from_u64(42);
        {
            let scope = mutator.enter();
            let keep = scope.alloc_ref_array(256).unwrap();
            scope.new_root(keep);
            for i in 0..1024 {
                let len = match i % 5 {
                    0 => 3 * page_size(),
                    1 => OFFSET_CHUNK_SIZE - 16,
                    _ => rng.gen_range(0..300),
                };
                let array = scope.alloc_prim_array(len).unwrap();
                if rng.gen_bool(0.25) {
                    scope.set_field(keep, rng.gen_range(0..256), array);
                }
            }
        }

        let mut gc = heap.collector();
        gc.initialize_phase().unwrap();
        {
            let _pause = heap.stop_mutators();
            gc.marking_pause(&*heap);
        }
        let marked = gc.stats.bytes_marked;
        gc.prepare_for_compaction();
        let begin = heap.moving_space().begin();
        let live_words = gc.live_words.popcount(begin, gc.black_allocations_begin);
        assert_eq!(gc.chunk_info.get(gc.vector_length) as usize, live_words * 8);
        assert_eq!(live_words * 8, marked);
        assert_eq!(gc.post_compact_end, align_up(begin + marked, page_size()));
        {
            let _pause = heap.stop_mutators();
            gc.compaction_pause(&*heap);
        }
        gc.compaction_phase();
        let stats = gc.finish_phase();
        assert_eq!(stats.moving_space_after, align_up(marked, page_size()));
    }
}

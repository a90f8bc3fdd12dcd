//! State of one compaction phase, shared by the collector thread, fault workers and mutators
//! resolving their own faults.
use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use memmap2::{MmapMut, MmapOptions};

use crate::{
    error::{Error, Result},
    globals::{page_size, MUTATOR_COMPACTION_BUFFER_COUNT},
    kernel::Kernel,
    linear_alloc::arena_pool::{ArenaPool, TrackedArena},
    page_status::PageStatusArray,
    space::BumpPointerSpace,
    translate::AddressTranslator,
    util::mmap::MemMap,
};

/// How finished pages reach their final address.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CompactionMode {
    /// Pages are assembled in a buffer and copied in by the kernel.
    Copy,
    /// Pages are assembled in a shared shadow mapping and mapped in place.
    MinorFault,
    /// Everything happens inside the compaction pause, nothing is registered.
    Fallback,
}

impl CompactionMode {
    #[inline]
    pub fn is_concurrent(self) -> bool {
        self != CompactionMode::Fallback
    }
}

/// Set in the SIGBUS in-progress counter once compaction is over.
pub(crate) const SIGBUS_COMPACTION_DONE: u32 = 1 << 31;

static CYCLE_EPOCH: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Compaction buffer claimed by this thread, tagged with the cycle it belongs to.
    static THREAD_BUFFER: Cell<(u64, usize)> = Cell::new((0, 0));
}

/// Page-sized scratch buffers. Page 0 belongs to the collector thread (and doubles as the
/// termination page fault workers stop on), the others go to workers and mutators.
pub struct CompactionBuffers {
    map: MmapMut,
}

impl CompactionBuffers {
    pub fn new(pages: usize) -> Result<Self> {
        let size = pages * page_size();
        let map = MmapOptions::new()
            .len(size)
            .map_anon()
            .map_err(|source| Error::Map {
                name: "compaction buffers",
                size,
                source,
            })?;
        Ok(Self { map })
    }

    #[inline]
    pub fn page(&self, idx: usize) -> usize {
        debug_assert!(idx < self.pages());
        self.map.as_ptr() as usize + idx * page_size()
    }

    #[inline]
    pub fn pages(&self) -> usize {
        self.map.len() / page_size()
    }
}

/// A registered linear-alloc range together with the shadow its pages are updated in.
pub struct LinearAllocSpaceData {
    pub pool: Arc<ArenaPool>,
    pub begin: usize,
    pub end: usize,
    pub shadow: MemMap,
    pub status: PageStatusArray,
}

impl LinearAllocSpaceData {
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.begin && addr < self.end
    }

    #[inline]
    pub fn shadow_diff(&self) -> usize {
        self.shadow.begin().wrapping_sub(self.begin)
    }
}

#[derive(Default)]
pub struct CycleCounters {
    pub gc_pages: AtomicUsize,
    pub mutator_pages: AtomicUsize,
    pub zero_pages: AtomicUsize,
    pub linear_alloc_pages: AtomicUsize,
    pub released_bytes: AtomicUsize,
}

pub struct CompactionCycle {
    pub epoch: u64,
    pub kernel: Arc<dyn Kernel>,
    pub mode: CompactionMode,
    pub use_sigbus: bool,
    pub translator: AddressTranslator,
    pub moving_space: Arc<BumpPointerSpace>,
    pub first_objs: Box<[usize]>,
    pub pre_compact_offset: Box<[u32]>,
    pub black_first_chunk: Box<[u32]>,
    pub first_objs_count: usize,
    pub black_page_count: usize,
    pub status: PageStatusArray,
    /// Start of the shared shadow of the moving space in minor-fault mode.
    pub shadow_begin: usize,
    pub buffers: Arc<CompactionBuffers>,
    pub buffer_counter: AtomicUsize,
    pub compaction_in_progress: CachePadded<AtomicUsize>,
    pub sigbus_in_progress: CachePadded<AtomicU32>,
    pub thread_counter: AtomicUsize,
    pub linear_alloc_spaces: Vec<LinearAllocSpaceData>,
    /// Arenas that existed at the compaction pause with the end of their used part.
    pub linear_alloc_arenas: BTreeMap<usize, (Arc<TrackedArena>, usize)>,
    pub counters: CycleCounters,
}

impl CompactionCycle {
    pub fn next_epoch() -> u64 {
        CYCLE_EPOCH.fetch_add(1, Ordering::Relaxed)
    }

    /// Pages produced by the cycle.
    #[inline]
    pub fn page_count(&self) -> usize {
        self.first_objs_count + self.black_page_count
    }

    #[inline]
    pub fn moving_begin(&self) -> usize {
        self.translator.moving.begin
    }

    #[inline]
    pub fn has_moving_address(&self, addr: usize) -> bool {
        self.translator.moving.contains(addr)
    }

    #[inline]
    pub fn maps_pages(&self) -> bool {
        self.mode.is_concurrent()
    }

    pub fn linear_alloc_space(&self, addr: usize) -> Option<&LinearAllocSpaceData> {
        self.linear_alloc_spaces.iter().find(|data| data.contains(addr))
    }

    /// The compaction buffer of the calling thread, claimed on first use in this cycle.
    pub fn thread_buffer(&self) -> usize {
        THREAD_BUFFER.with(|slot| {
            let (epoch, buffer) = slot.get();
            if epoch == self.epoch {
                return buffer;
            }
            let idx = self.buffer_counter.fetch_add(1, Ordering::Relaxed);
            crate::gc_check!(
                idx <= MUTATOR_COMPACTION_BUFFER_COUNT && idx < self.buffers.pages(),
                "out of compaction buffers ({} claimed)",
                idx
            );
            let buffer = self.buffers.page(idx);
            slot.set((self.epoch, buffer));
            buffer
        })
    }

    /// Address of the staged copy of to-space page `idx` in copy mode.
    #[inline]
    pub fn from_space_page_addr(&self, from_space_page: usize) -> usize {
        self.translator.from_space_begin + from_space_page * page_size()
    }
}

/// Keeps [`CompactionCycle::compaction_in_progress`] raised while a page is produced outside the
/// collector thread, so that the range is not unregistered underneath.
pub(crate) struct InProgressScope<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InProgressScope<'a> {
    pub(crate) fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self { counter }
    }
}

impl Drop for InProgressScope<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

//! The heap façade: spaces, root handles, mutators and the entry point for collections.
//!
//! Mutators access the heap through a [`MutatorScope`], which holds the mutator lock shared.
//! Pauses take it exclusively. Inside a scope every access to the moving space or to
//! linear-alloc memory is announced to the kernel backend first, since those pages may still be
//! missing while the collector compacts.
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{
    collector::{MarkCompact, MutatorRoots},
    error::Result,
    globals::{page_size, OBJECT_ALIGNMENT},
    kernel::{default_kernel, Kernel},
    linear_alloc::{arena_pool::ArenaPool, LinearAlloc, RootArray, RootTable},
    object::{self, ObjectKind, CLASS_INFO_OFFSET, CLASS_OBJECT_SIZE, HEADER_SIZE},
    space::{BumpPointerSpace, NonMovingSpace, Tlab},
    statistics::CompactionStatistics,
    util::{align_down, align_up},
    Config, FaultStrategy, UffdPolicy,
};

/// Handle to a root slot owned by the heap.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Root(usize);

#[derive(Default)]
struct RootSet {
    slots: Vec<usize>,
    free: Vec<usize>,
}

pub struct Heap {
    config: Config,
    kernel: Arc<dyn Kernel>,
    moving_space: Arc<BumpPointerSpace>,
    non_moving_space: Arc<NonMovingSpace>,
    arena_pool: Arc<ArenaPool>,
    mutator_lock: RwLock<()>,
    collector: Mutex<MarkCompact>,
    roots: Mutex<RootSet>,
    tlabs: Mutex<Vec<Weak<Mutex<Tlab>>>>,
}

impl Heap {
    /// Creates a heap on the default kernel backend.
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let sigbus = !matches!(config.fault_strategy, FaultStrategy::Workers(_));
        Self::with_kernel(config, default_kernel(sigbus))
    }

    pub fn with_kernel(config: Config, kernel: Arc<dyn Kernel>) -> Result<Arc<Self>> {
        let page = page_size();
        let caps = kernel.capabilities();
        let moving_space = Arc::new(BumpPointerSpace::create(
            "moving space",
            align_up(config.moving_space_capacity, page),
        )?);
        let non_moving_space = Arc::new(NonMovingSpace::create(
            "non-moving space",
            align_up(config.non_moving_space_capacity, page),
        )?);
        let arena_pool = Arc::new(ArenaPool::create(
            config.linear_alloc_capacity,
            caps.uffd && caps.minor_fault && config.uffd == UffdPolicy::Auto,
        )?);
        let collector = MarkCompact::new(
            &config,
            kernel.clone(),
            moving_space.clone(),
            non_moving_space.clone(),
            arena_pool.clone(),
        )?;
        Ok(Arc::new(Self {
            config,
            kernel,
            moving_space,
            non_moving_space,
            arena_pool,
            mutator_lock: RwLock::new(()),
            collector: Mutex::new(collector),
            roots: Mutex::new(RootSet::default()),
            tlabs: Mutex::new(Vec::new()),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn kernel(&self) -> &Arc<dyn Kernel> {
        &self.kernel
    }

    pub fn moving_space(&self) -> &BumpPointerSpace {
        &self.moving_space
    }

    pub fn non_moving_space(&self) -> &NonMovingSpace {
        &self.non_moving_space
    }

    pub fn arena_pool(&self) -> &Arc<ArenaPool> {
        &self.arena_pool
    }

    pub fn attach_mutator(self: &Arc<Self>) -> Mutator {
        let tlab = Arc::new(Mutex::new(Tlab::default()));
        let mut tlabs = self.tlabs.lock();
        tlabs.retain(|tlab| tlab.strong_count() > 0);
        tlabs.push(Arc::downgrade(&tlab));
        Mutator {
            heap: self.clone(),
            tlab,
        }
    }

    pub fn new_linear_alloc(&self) -> LinearAlloc {
        LinearAlloc::new(self.arena_pool.clone(), self.kernel.clone())
    }

    /// Exclusive access to the collector, for driving a cycle phase by phase.
    pub fn collector(&self) -> MutexGuard<'_, MarkCompact> {
        self.collector.lock()
    }

    /// Waits until no mutator is inside a scope and keeps new ones out.
    pub fn stop_mutators(&self) -> RwLockWriteGuard<'_, ()> {
        self.mutator_lock.write()
    }

    /// Runs a full collection cycle. Must not be called from inside a [`MutatorScope`].
    pub fn collect(&self) -> Result<CompactionStatistics> {
        let mut gc = self.collector.lock();
        gc.initialize_phase()?;
        {
            let _pause = self.stop_mutators();
            gc.marking_pause(self);
        }
        gc.prepare_for_compaction();
        {
            let _pause = self.stop_mutators();
            gc.compaction_pause(self);
        }
        gc.compaction_phase();
        let stats = gc.finish_phase();
        if self.config.verify {
            let _pause = self.stop_mutators();
            gc.verify_heap(self);
        }
        Ok(stats)
    }

    fn for_each_tlab(&self, mut f: impl FnMut(&mut Tlab)) {
        let mut tlabs = self.tlabs.lock();
        tlabs.retain(|tlab| tlab.strong_count() > 0);
        for tlab in tlabs.iter().filter_map(Weak::upgrade) {
            f(&mut tlab.lock());
        }
    }
}

impl MutatorRoots for Heap {
    fn visit_roots(&self, visitor: &mut dyn FnMut(usize)) {
        let mut roots = self.roots.lock();
        for slot in roots.slots.iter_mut() {
            if *slot != 0 {
                visitor(slot as *mut usize as usize);
            }
        }
    }

    fn revoke_tlabs(&self) {
        self.for_each_tlab(|tlab| *tlab = Tlab::default());
    }

    fn slide_tlabs(&self, diff: usize) {
        self.for_each_tlab(|tlab| tlab.slide(diff));
    }
}

/// A thread's attachment to the heap. Owns the thread's TLAB.
pub struct Mutator {
    heap: Arc<Heap>,
    tlab: Arc<Mutex<Tlab>>,
}

impl Mutator {
    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// Enters the heap. Object addresses are only stable while the scope lives.
    pub fn enter(&self) -> MutatorScope<'_> {
        MutatorScope {
            heap: &self.heap,
            tlab: &self.tlab,
            _access: self.heap.mutator_lock.read(),
        }
    }
}

pub struct MutatorScope<'a> {
    heap: &'a Heap,
    tlab: &'a Mutex<Tlab>,
    _access: RwLockReadGuard<'a, ()>,
}

impl<'a> MutatorScope<'a> {
    pub fn heap(&self) -> &Heap {
        self.heap
    }

    fn touch(&self, addr: usize) {
        self.heap.kernel.touch(addr);
    }

    fn touch_range(&self, addr: usize, len: usize) {
        let page = page_size();
        let mut p = align_down(addr, page);
        while p < addr + len {
            self.heap.kernel.touch(p);
            p += page;
        }
    }

    fn alloc_moving(&self, size: usize) -> Result<usize> {
        let size = align_up(size, OBJECT_ALIGNMENT);
        let obj = {
            let mut tlab = self.tlab.lock();
            match tlab.alloc(size) {
                Some(obj) => obj,
                None => {
                    *tlab = self
                        .heap
                        .moving_space
                        .alloc_tlab(self.heap.config.tlab_size.max(size))?;
                    match tlab.alloc(size) {
                        Some(obj) => obj,
                        None => crate::gc_fatal!("fresh TLAB cannot hold {} bytes", size),
                    }
                }
            }
        };
        self.heap.moving_space.record_tlab_allocation();
        self.touch_range(obj, size);
        unsafe { std::ptr::write_bytes(obj as *mut u8, 0, size) };
        Ok(obj)
    }

    fn alloc_non_moving(&self, size: usize) -> Result<usize> {
        let size = align_up(size, OBJECT_ALIGNMENT);
        let obj = self.heap.non_moving_space.alloc(size)?;
        unsafe { std::ptr::write_bytes(obj as *mut u8, 0, size) };
        Ok(obj)
    }

    fn alloc_in(&self, non_moving: bool, size: usize) -> Result<usize> {
        if non_moving {
            self.alloc_non_moving(size)
        } else {
            self.alloc_moving(size)
        }
    }

    /// Allocates a class whose instances are `instance_size` bytes including the header. Bit `i`
    /// of `ref_bitmap` makes instance field `i` a reference.
    pub fn alloc_class(&self, super_class: usize, instance_size: usize, ref_bitmap: u32) -> Result<usize> {
        self.new_class(false, super_class, instance_size, ref_bitmap)
    }

    pub fn alloc_non_moving_class(
        &self,
        super_class: usize,
        instance_size: usize,
        ref_bitmap: u32,
    ) -> Result<usize> {
        self.new_class(true, super_class, instance_size, ref_bitmap)
    }

    fn new_class(
        &self,
        non_moving: bool,
        super_class: usize,
        instance_size: usize,
        ref_bitmap: u32,
    ) -> Result<usize> {
        let obj = self.alloc_in(non_moving, CLASS_OBJECT_SIZE)?;
        let instance_size = align_up(instance_size.max(HEADER_SIZE), OBJECT_ALIGNMENT);
        unsafe { object::init_class(obj, 0, super_class, instance_size, ref_bitmap) };
        Ok(obj)
    }

    fn instance_size(&self, class: usize) -> usize {
        self.touch(class + CLASS_INFO_OFFSET);
        unsafe { object::class_info(class).instance_size() as usize }
    }

    pub fn alloc_instance(&self, class: usize) -> Result<usize> {
        let obj = self.alloc_moving(self.instance_size(class))?;
        unsafe { object::init_header(obj, class, ObjectKind::Instance, 0) };
        Ok(obj)
    }

    pub fn alloc_non_moving_instance(&self, class: usize) -> Result<usize> {
        let obj = self.alloc_non_moving(self.instance_size(class))?;
        unsafe { object::init_header(obj, class, ObjectKind::Instance, 0) };
        Ok(obj)
    }

    pub fn alloc_ref_array(&self, len: usize) -> Result<usize> {
        self.new_array(false, ObjectKind::RefArray, len)
    }

    pub fn alloc_non_moving_ref_array(&self, len: usize) -> Result<usize> {
        self.new_array(true, ObjectKind::RefArray, len)
    }

    /// Allocates an array of `len` bytes.
    pub fn alloc_prim_array(&self, len: usize) -> Result<usize> {
        self.new_array(false, ObjectKind::PrimArray, len)
    }

    fn new_array(&self, non_moving: bool, kind: ObjectKind, len: usize) -> Result<usize> {
        let size = match kind {
            ObjectKind::RefArray => object::ref_array_size(len),
            _ => object::prim_array_size(len),
        };
        let obj = self.alloc_in(non_moving, size)?;
        unsafe { object::init_header(obj, 0, kind, len as u32) };
        Ok(obj)
    }

    #[inline]
    pub fn class_of(&self, obj: usize) -> usize {
        self.touch(obj);
        unsafe { object::class_of(obj) }
    }

    pub fn kind_of(&self, obj: usize) -> ObjectKind {
        self.touch(obj + 8);
        unsafe { object::kind_of(obj) }
    }

    /// Length of an array.
    pub fn length(&self, obj: usize) -> usize {
        self.touch(obj + 8);
        unsafe { object::object_bits(obj).length() as usize }
    }

    /// Word `field` after the header of `obj`, an instance field or an array element.
    #[inline]
    pub fn get_field(&self, obj: usize, field: usize) -> usize {
        let addr = obj + HEADER_SIZE + field * 8;
        self.touch(addr);
        unsafe { object::read_word(addr) }
    }

    #[inline]
    pub fn set_field(&self, obj: usize, field: usize, value: usize) {
        let addr = obj + HEADER_SIZE + field * 8;
        self.touch(addr);
        unsafe { object::write_word(addr, value) }
    }

    pub fn read_byte(&self, array: usize, index: usize) -> u8 {
        let addr = array + HEADER_SIZE + index;
        self.touch(addr);
        unsafe { (addr as *const u8).read() }
    }

    pub fn write_byte(&self, array: usize, index: usize, value: u8) {
        let addr = array + HEADER_SIZE + index;
        self.touch(addr);
        unsafe { (addr as *mut u8).write(value) }
    }

    pub fn new_root(&self, obj: usize) -> Root {
        let mut roots = self.heap.roots.lock();
        match roots.free.pop() {
            Some(idx) => {
                roots.slots[idx] = obj;
                Root(idx)
            }
            None => {
                roots.slots.push(obj);
                Root(roots.slots.len() - 1)
            }
        }
    }

    pub fn root(&self, root: Root) -> usize {
        self.heap.roots.lock().slots[root.0]
    }

    pub fn set_root(&self, root: Root, obj: usize) {
        self.heap.roots.lock().slots[root.0] = obj;
    }

    pub fn release_root(&self, root: Root) {
        let mut roots = self.heap.roots.lock();
        roots.slots[root.0] = 0;
        roots.free.push(root.0);
    }

    pub fn alloc_root_array(&self, alloc: &LinearAlloc, len: usize) -> Result<RootArray> {
        alloc.alloc_root_array(len)
    }

    pub fn alloc_root_table(&self, alloc: &LinearAlloc, capacity: usize) -> Result<RootTable> {
        alloc.alloc_root_table(capacity)
    }

    /// Reads a root slot living in linear-alloc memory.
    pub fn read_slot(&self, slot: usize) -> usize {
        self.touch(slot);
        unsafe { object::read_word(slot) }
    }

    pub fn write_slot(&self, slot: usize, obj: usize) {
        self.touch(slot);
        unsafe { object::write_word(slot, obj) }
    }

    pub fn delete_linear_alloc(&self, alloc: &LinearAlloc) -> Result<()> {
        alloc.delete()
    }
}

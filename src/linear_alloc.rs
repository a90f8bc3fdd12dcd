//! Off-heap allocations that may hold references into the heap.
//!
//! Every allocation is preceded by a [`TrackingHeader`] so that the collector can walk an arena
//! page by page and find the roots it has to update. Root tables that fill a whole arena use
//! single-object arenas instead, where every word is a root.
pub mod arena_pool;
pub mod updater;

use std::sync::Arc;

use modular_bitfield::prelude::*;
use parking_lot::Mutex;

use self::arena_pool::{ArenaPool, TrackedArena};
use crate::{
    error::Result,
    globals::{page_size, LINEAR_ALLOC_ALIGNMENT},
    kernel::Kernel,
    object::{read_word, write_word},
    util::{align_down, align_up},
};

#[derive(BitfieldSpecifier, Clone, Copy, PartialEq, Eq, Debug)]
#[bits = 2]
pub enum LinearAllocKind {
    NoGcRoots = 0,
    /// Payload is an array of references.
    GcRootArray = 1,
}

/// Word in front of every linear allocation. A zero size ends the used part of an arena.
#[bitfield]
#[repr(u64)]
#[derive(Clone, Copy, Debug)]
pub struct TrackingHeader {
    /// Allocation size including this header.
    pub size: B32,
    pub kind: LinearAllocKind,
    #[skip]
    __: B30,
}

pub const TRACKING_HEADER_SIZE: usize = 8;

impl TrackingHeader {
    #[inline]
    pub unsafe fn read(addr: usize) -> Self {
        TrackingHeader::from(read_word(addr) as u64)
    }
}

/// Calls `visitor` with the address of every root slot of the allocations in the used part of a
/// multi-object arena that lies in `[begin, end)`, starting the walk at `first_obj`.
///
/// Returns whether the walk ended inside the range, meaning the range had allocations on it.
pub unsafe fn visit_arena_roots(
    first_obj: usize,
    begin: usize,
    end: usize,
    mut visitor: impl FnMut(usize),
) -> bool {
    let mut byte = first_obj;
    while byte < end {
        let header = TrackingHeader::read(byte);
        let size = header.size() as usize;
        if size == 0 {
            return byte >= begin;
        }
        if header.kind_or_err() == Ok(LinearAllocKind::GcRootArray) {
            let mut slot = (byte + TRACKING_HEADER_SIZE).max(begin);
            let slots_end = (byte + size).min(end);
            while slot < slots_end {
                visitor(slot);
                slot += 8;
            }
        }
        byte += align_up(size, LINEAR_ALLOC_ALIGNMENT);
    }
    true
}

/// A fixed-size array of references living outside the heap.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RootArray {
    addr: usize,
    len: usize,
}

impl RootArray {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    #[inline]
    pub fn slot(&self, index: usize) -> usize {
        assert!(index < self.len, "root array index {} out of bounds", index);
        self.addr + index * 8
    }
}

/// Root table occupying a single-object arena of its own.
#[derive(Clone)]
pub struct RootTable {
    arena: Arc<TrackedArena>,
}

impl RootTable {
    pub fn capacity(&self) -> usize {
        self.arena.size() / 8
    }
    #[inline]
    pub fn slot(&self, index: usize) -> usize {
        assert!(index < self.capacity(), "root table index {} out of bounds", index);
        self.arena.begin() + index * 8
    }
}

struct Cursor {
    /// Every arena this allocator owns, root tables included.
    arenas: Vec<Arc<TrackedArena>>,
    /// Arena `ptr` bumps through.
    current: Option<Arc<TrackedArena>>,
    ptr: usize,
    end: usize,
}

/// Bump allocator over arenas of an [`ArenaPool`].
pub struct LinearAlloc {
    pool: Arc<ArenaPool>,
    kernel: Arc<dyn Kernel>,
    cursor: Mutex<Cursor>,
}

impl LinearAlloc {
    pub fn new(pool: Arc<ArenaPool>, kernel: Arc<dyn Kernel>) -> Self {
        Self {
            pool,
            kernel,
            cursor: Mutex::new(Cursor {
                arenas: Vec::new(),
                current: None,
                ptr: 0,
                end: 0,
            }),
        }
    }

    /// Returns the payload address of a fresh zeroed allocation of `size` bytes.
    pub fn alloc(&self, size: usize, kind: LinearAllocKind) -> Result<usize> {
        let total = align_up(size + TRACKING_HEADER_SIZE, LINEAR_ALLOC_ALIGNMENT);
        let mut cursor = self.cursor.lock();
        if cursor.end - cursor.ptr < total {
            let arena = self.pool.alloc_arena(total, false)?;
            cursor.ptr = arena.begin();
            cursor.end = arena.end();
            cursor.arenas.push(arena.clone());
            cursor.current = Some(arena);
        }
        let header = cursor.ptr;
        cursor.ptr += total;
        let arena = match &cursor.current {
            Some(arena) => arena.clone(),
            None => crate::gc_fatal!("linear allocation without an arena"),
        };
        let page = page_size();
        let mut addr = align_down(header, page);
        while addr < header + total {
            self.kernel.touch(addr);
            addr += page;
        }
        arena.set_first_object(header, total);
        unsafe {
            std::ptr::write_bytes((header + TRACKING_HEADER_SIZE) as *mut u8, 0, total - TRACKING_HEADER_SIZE);
            write_word(
                header,
                u64::from(TrackingHeader::new().with_size(total as u32).with_kind(kind)) as usize,
            );
        }
        arena.set_bytes_allocated(cursor.ptr - arena.begin());
        Ok(header + TRACKING_HEADER_SIZE)
    }

    pub fn alloc_root_array(&self, len: usize) -> Result<RootArray> {
        let addr = self.alloc(len * 8, LinearAllocKind::GcRootArray)?;
        Ok(RootArray { addr, len })
    }

    pub fn alloc_root_table(&self, capacity: usize) -> Result<RootTable> {
        let arena = self.pool.alloc_arena(capacity * 8, true)?;
        self.cursor.lock().arenas.push(arena.clone());
        Ok(RootTable { arena })
    }

    /// Hands every arena back to the pool.
    pub fn delete(&self) -> Result<()> {
        let mut cursor = self.cursor.lock();
        cursor.current = None;
        cursor.ptr = 0;
        cursor.end = 0;
        let arenas = std::mem::take(&mut cursor.arenas);
        self.pool.free_arenas(arenas)
    }

    pub fn arena_count(&self) -> usize {
        self.cursor.lock().arenas.len()
    }
}

/// Visits every root slot held by the live arenas of `pool`.
pub fn visit_pool_roots(pool: &ArenaPool, mut visitor: impl FnMut(usize)) {
    for arena in pool.arenas() {
        if arena.is_waiting_for_deletion() {
            continue;
        }
        if arena.is_single_object() {
            let mut slot = arena.begin();
            while slot < arena.end() {
                if unsafe { read_word(slot) } != 0 {
                    visitor(slot);
                }
                slot += 8;
            }
        } else if arena.bytes_allocated() > 0 {
            unsafe {
                visit_arena_roots(arena.begin(), arena.begin(), arena.end(), &mut visitor);
            }
        }
    }
}

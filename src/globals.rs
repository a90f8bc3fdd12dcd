use once_cell::sync::Lazy;

/// Alignment of every object in the moving space. One live-words bit covers this many bytes.
pub const OBJECT_ALIGNMENT: usize = 8;
pub const BITS_PER_VECTOR_WORD: usize = usize::BITS as usize;
/// Bytes of moving space described by one chunk-info entry (and one live-words bitmap word).
pub const OFFSET_CHUNK_SIZE: usize = BITS_PER_VECTOR_WORD * OBJECT_ALIGNMENT;

pub const MAX_UFFD_WORKERS: usize = 2;
/// Buffers handed out to mutators compacting pages from inside their SIGBUS handler.
pub const MUTATOR_COMPACTION_BUFFER_COUNT: usize = 2048;
pub const MIN_FROM_SPACE_MADVISE_SIZE: usize = 8 * 1024 * 1024;
/// From-space pages kept back on every release for staging copy-mode pages.
pub const FROM_SPACE_BUFFER_PAGES: usize = 4;

pub const LINEAR_ALLOC_ALIGNMENT: usize = 8;

static PAGE_SIZE: Lazy<usize> = Lazy::new(|| {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
});

#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

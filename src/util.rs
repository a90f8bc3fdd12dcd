pub mod backoff;
pub mod mmap;

#[inline(always)]
pub const fn align_down(addr: usize, align: usize) -> usize {
    addr & !align.wrapping_sub(1)
}
#[inline(always)]
pub const fn align_up(addr: usize, align: usize) -> usize {
    // See https://github.com/rust-lang/rust/blob/e620d0f337d0643c757bab791fc7d88d63217704/src/libcore/alloc.rs#L192
    addr.wrapping_add(align).wrapping_sub(1) & !align.wrapping_sub(1)
}
#[inline(always)]
pub const fn is_aligned(addr: usize, align: usize) -> bool {
    addr & align.wrapping_sub(1) == 0
}

/// Address range `[begin, end)`. Every heap pointer the collector hands around is checked
/// against one of these before it is turned into a page index.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Region {
    pub begin: usize,
    pub end: usize,
}

impl Region {
    pub const fn new(begin: usize, end: usize) -> Self {
        Self { begin, end }
    }
    #[inline]
    pub const fn len(&self) -> usize {
        self.end - self.begin
    }
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.end == self.begin
    }
    #[inline]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.begin && addr < self.end
    }
    /// Byte offset of `addr` from the start of the region, if `addr` lies within it.
    #[inline]
    pub fn offset_of(&self, addr: usize) -> Option<usize> {
        if self.contains(addr) {
            Some(addr - self.begin)
        } else {
            None
        }
    }
    #[inline]
    pub fn page_index(&self, addr: usize, page_size: usize) -> Option<usize> {
        self.offset_of(addr).map(|off| off / page_size)
    }
}

pub(crate) struct FormattedSize {
    pub size: usize,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = (self.size as f64) / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 1f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

pub(crate) fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(4097, 4096), 8192);
        assert_eq!(align_down(4097, 4096), 4096);
        assert!(is_aligned(4096, 4096));
        assert!(!is_aligned(4100, 4096));
    }

    #[test]
    fn region_bounds() {
        let r = Region::new(0x1000, 0x5000);
        assert_eq!(r.len(), 0x4000);
        assert_eq!(r.page_index(0x2fff, 0x1000), Some(1));
        assert_eq!(r.page_index(0x5000, 0x1000), None);
        assert_eq!(r.offset_of(0x0fff), None);
    }
}

use core::fmt;

use super::BitWords;
use crate::{error::Result, globals::OBJECT_ALIGNMENT, util::Region};

/// One bit per object start over a contiguous space.
pub struct MarkBitmap {
    bits: BitWords,
    heap_begin: usize,
    heap_limit: usize,
    name: &'static str,
}

impl MarkBitmap {
    pub fn create(name: &'static str, heap_begin: usize, heap_capacity: usize) -> Result<Self> {
        Ok(Self {
            bits: BitWords::new(name, heap_capacity / OBJECT_ALIGNMENT)?,
            heap_begin,
            heap_limit: heap_begin + heap_capacity,
            name,
        })
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }
    #[inline]
    pub fn heap_begin(&self) -> usize {
        self.heap_begin
    }
    #[inline]
    pub fn heap_limit(&self) -> usize {
        self.heap_limit
    }
    #[inline]
    pub fn has_address(&self, obj: usize) -> bool {
        obj >= self.heap_begin && obj < self.heap_limit
    }

    #[inline]
    fn bit_of(&self, obj: usize) -> usize {
        debug_assert!(self.has_address(obj), "{}: invalid object address {:#x}", self.name, obj);
        (obj - self.heap_begin) / OBJECT_ALIGNMENT
    }

    #[inline]
    fn addr_of(&self, bit: usize) -> usize {
        self.heap_begin + bit * OBJECT_ALIGNMENT
    }

    #[inline]
    pub fn test(&self, obj: usize) -> bool {
        self.bits.test(self.bit_of(obj))
    }

    /// Returns the previous value of the bit.
    #[inline(always)]
    pub fn set(&self, obj: usize) -> bool {
        self.bits.set(self.bit_of(obj))
    }

    /// Same as [`MarkBitmap::set`]; several markers may race on the same word.
    #[inline]
    pub fn atomic_test_and_set(&self, obj: usize) -> bool {
        self.bits.set(self.bit_of(obj))
    }

    #[inline(always)]
    pub fn clear(&self, obj: usize) -> bool {
        self.bits.clear(self.bit_of(obj))
    }

    pub fn clear_all(&self) {
        self.bits.clear_all();
    }

    /// Visit marked objects in `[visit_begin, visit_end)` in address order.
    ///
    /// NOTE: Bits may be changed while visiting. Each word is loaded once and then visited.
    pub fn visit_marked_range(
        &self,
        visit_begin: usize,
        visit_end: usize,
        mut visitor: impl FnMut(usize),
    ) {
        if visit_begin >= visit_end {
            return;
        }
        let mut bit = self.bit_of(visit_begin);
        let end_bit = (visit_end - self.heap_begin) / OBJECT_ALIGNMENT;
        while let Some(found) = self.bits.next_set(bit, end_bit) {
            visitor(self.addr_of(found));
            bit = found + 1;
        }
    }

    /// The first marked object in `[visit_begin, visit_end)`.
    pub fn find_first_marked(&self, visit_begin: usize, visit_end: usize) -> Option<usize> {
        if visit_begin >= visit_end {
            return None;
        }
        let end_bit = (visit_end - self.heap_begin) / OBJECT_ALIGNMENT;
        self.bits
            .next_set(self.bit_of(visit_begin), end_bit)
            .map(|bit| self.addr_of(bit))
    }

    /// The last marked object starting at or before `addr` but not before `lowest`.
    pub fn find_preceding_object(&self, addr: usize, lowest: usize) -> Option<usize> {
        let lowest = lowest.max(self.heap_begin);
        if addr < lowest {
            return None;
        }
        self.bits
            .prev_set(self.bit_of(addr), self.bit_of(lowest))
            .map(|bit| self.addr_of(bit))
    }

    pub fn region(&self) -> Region {
        Region::new(self.heap_begin, self.heap_limit)
    }
}

impl fmt::Debug for MarkBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[begin={:#x},end={:#x}]",
            self.name, self.heap_begin, self.heap_limit
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BEGIN: usize = 0x10_0000;

    #[test]
    fn visit_and_search() {
        let bitmap = MarkBitmap::create("mark test", BEGIN, 64 * 1024).unwrap();
        for off in [0usize, 16, 512, 4096, 4104, 60000].iter() {
            assert!(!bitmap.set(BEGIN + off));
        }
        assert!(bitmap.atomic_test_and_set(BEGIN + 16));
        let mut seen = vec![];
        bitmap.visit_marked_range(BEGIN + 8, BEGIN + 4104, |o| seen.push(o - BEGIN));
        assert_eq!(seen, vec![16, 512, 4096]);
        assert_eq!(bitmap.find_first_marked(BEGIN + 520, BEGIN + 8192), Some(BEGIN + 4096));
        assert_eq!(bitmap.find_preceding_object(BEGIN + 4095, BEGIN), Some(BEGIN + 512));
        assert_eq!(bitmap.find_preceding_object(BEGIN + 4095, BEGIN + 1024), None);
        assert_eq!(bitmap.find_preceding_object(BEGIN + 4104, BEGIN), Some(BEGIN + 4104));
        assert!(bitmap.clear(BEGIN + 4104));
        assert!(!bitmap.test(BEGIN + 4104));
    }
}

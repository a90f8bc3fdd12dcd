use super::BitWords;
use crate::{
    error::Result,
    globals::{BITS_PER_VECTOR_WORD, OBJECT_ALIGNMENT},
};

/// One bit per [`OBJECT_ALIGNMENT`] bytes of the moving space. A bit is set iff the word belongs
/// to a live object. Each bitmap word describes exactly one chunk of the chunk-info vector.
pub struct LiveWordsBitmap {
    bits: BitWords,
    begin: usize,
    end: usize,
}

impl LiveWordsBitmap {
    pub fn create(begin: usize, capacity: usize) -> Result<Self> {
        Ok(Self {
            bits: BitWords::new("live words bitmap", capacity / OBJECT_ALIGNMENT)?,
            begin,
            end: begin + capacity,
        })
    }

    #[inline]
    pub fn begin(&self) -> usize {
        self.begin
    }

    #[inline]
    pub fn bit_index_from_addr(&self, addr: usize) -> usize {
        debug_assert!(addr >= self.begin && addr <= self.end);
        (addr - self.begin) / OBJECT_ALIGNMENT
    }

    #[inline]
    pub fn addr_from_bit_index(&self, bit: usize) -> usize {
        self.begin + bit * OBJECT_ALIGNMENT
    }

    /// Marks `[obj, obj + size)` live and returns the bit index of `obj`.
    pub fn set_live_words(&self, obj: usize, size: usize) -> usize {
        let bit = self.bit_index_from_addr(obj);
        self.bits.set_range(bit, size / OBJECT_ALIGNMENT);
        bit
    }

    #[inline]
    pub fn test(&self, bit: usize) -> bool {
        self.bits.test(bit)
    }

    #[inline]
    pub fn test_addr(&self, addr: usize) -> bool {
        self.bits.test(self.bit_index_from_addr(addr))
    }

    #[inline]
    pub fn word(&self, chunk_idx: usize) -> usize {
        self.bits.word(chunk_idx)
    }

    /// Offset within chunk `chunk_idx` of its `n`th (0 based) live word.
    pub fn find_nth_live_word_offset(&self, chunk_idx: usize, n: usize) -> usize {
        let mut word = self.word(chunk_idx);
        for _ in 0..n {
            crate::gc_check!(
                word != 0,
                "chunk {} has fewer than {} live words",
                chunk_idx,
                n + 1
            );
            word &= word - 1;
        }
        crate::gc_check!(word != 0, "chunk {} has no live word #{}", chunk_idx, n);
        word.trailing_zeros() as usize
    }

    pub fn live_bytes_in_bitmap_word(&self, chunk_idx: usize) -> usize {
        self.word(chunk_idx).count_ones() as usize * OBJECT_ALIGNMENT
    }

    /// Live words in the chunk of `bit` that precede `bit`.
    #[inline]
    pub fn count_live_words_upto(&self, bit: usize) -> usize {
        let in_word = bit % BITS_PER_VECTOR_WORD;
        let word = self.word(bit / BITS_PER_VECTOR_WORD);
        (word & ((1usize << in_word) - 1)).count_ones() as usize
    }

    /// Calls `visitor(stride_begin_bit, stride_words)` for every maximal run of live words that
    /// starts at or after `begin_bit` and below `end`, until `bytes` worth of words have been
    /// reported. The last run is clipped so that the total never exceeds `bytes`.
    pub fn visit_live_strides(
        &self,
        begin_bit: usize,
        end: usize,
        bytes: usize,
        mut visitor: impl FnMut(usize, usize),
    ) {
        debug_assert!(self.test(begin_bit));
        let end_bit = self.bit_index_from_addr(end);
        let mut remaining = bytes / OBJECT_ALIGNMENT;
        let mut bit = begin_bit;
        while remaining > 0 {
            let start = match self.bits.next_set(bit, end_bit) {
                Some(start) => start,
                None => break,
            };
            let stop = self.bits.next_clear(start, end_bit);
            let words = (stop - start).min(remaining);
            visitor(start, words);
            remaining -= words;
            bit = stop;
        }
    }

    /// Number of live words in `[begin, end)` of the space.
    pub fn popcount(&self, begin: usize, end: usize) -> usize {
        self.bits
            .count(self.bit_index_from_addr(begin), self.bit_index_from_addr(end))
    }

    pub fn clear(&self) {
        self.bits.clear_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BEGIN: usize = 0x4000_0000;

    #[test]
    fn chunk_queries() {
        let live = LiveWordsBitmap::create(BEGIN, 16 * 512).unwrap();
        assert_eq!(live.set_live_words(BEGIN + 16, 48), 2);
        live.set_live_words(BEGIN + 480, 64);
        assert_eq!(live.live_bytes_in_bitmap_word(0), 48 + 32);
        assert_eq!(live.live_bytes_in_bitmap_word(1), 32);
        assert_eq!(live.find_nth_live_word_offset(0, 0), 2);
        assert_eq!(live.find_nth_live_word_offset(0, 6), 60);
        assert_eq!(live.count_live_words_upto(60), 6);
        assert_eq!(live.count_live_words_upto(61), 7);
        assert_eq!(live.count_live_words_upto(64 + 3), 3);
        assert_eq!(live.popcount(BEGIN, BEGIN + 16 * 512), 14);
    }

    #[test]
    fn strides_stop_after_requested_bytes() {
        let live = LiveWordsBitmap::create(BEGIN, 16 * 512).unwrap();
        live.set_live_words(BEGIN, 24);
        live.set_live_words(BEGIN + 40, 16);
        // A run crossing a chunk boundary is one stride.
        live.set_live_words(BEGIN + 496, 64);
        let mut strides = vec![];
        live.visit_live_strides(0, BEGIN + 16 * 512, 12 * 8, |b, n| strides.push((b, n)));
        assert_eq!(strides, vec![(0, 3), (5, 2), (62, 7)]);

        strides.clear();
        live.visit_live_strides(5, BEGIN + 512, 4096, |b, n| strides.push((b, n)));
        assert_eq!(strides, vec![(5, 2), (62, 2)]);
    }
}

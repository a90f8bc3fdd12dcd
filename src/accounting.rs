//! Side tables describing the moving and non-moving spaces: mark bitmaps, the live-words bitmap
//! and the chunk-info vector.
pub mod chunk_info;
pub mod live_words;
pub mod mark_bitmap;

use atomic::{Atomic, Ordering};
use memmap2::MmapMut;

use crate::{
    error::{Error, Result},
    globals::BITS_PER_VECTOR_WORD,
};

/// Bit vector stored in an anonymous mapping. Bits are set and cleared atomically, scans use
/// relaxed loads.
pub(crate) struct BitWords {
    mem_map: MmapMut,
    words: *const Atomic<usize>,
    word_count: usize,
}

unsafe impl Send for BitWords {}
unsafe impl Sync for BitWords {}

#[inline(always)]
const fn word_index(bit: usize) -> usize {
    bit / BITS_PER_VECTOR_WORD
}

#[inline(always)]
const fn bit_mask(bit: usize) -> usize {
    1 << (bit % BITS_PER_VECTOR_WORD)
}

impl BitWords {
    pub fn new(name: &'static str, bits: usize) -> Result<Self> {
        let word_count = ((bits + BITS_PER_VECTOR_WORD - 1) / BITS_PER_VECTOR_WORD).max(1);
        let size = word_count * std::mem::size_of::<usize>();
        let mem_map = MmapMut::map_anon(size).map_err(|source| Error::Map { name, size, source })?;
        let words = mem_map.as_ptr().cast::<Atomic<usize>>();
        Ok(Self {
            mem_map,
            words,
            word_count,
        })
    }

    #[inline]
    pub fn bit_count(&self) -> usize {
        self.word_count * BITS_PER_VECTOR_WORD
    }

    #[inline]
    pub fn atomic(&self, index: usize) -> &Atomic<usize> {
        debug_assert!(index < self.word_count, "bitmap word {} out of {}", index, self.word_count);
        unsafe { &*self.words.add(index) }
    }

    #[inline]
    pub fn word(&self, index: usize) -> usize {
        self.atomic(index).load(Ordering::Relaxed)
    }

    #[inline]
    pub fn test(&self, bit: usize) -> bool {
        self.word(word_index(bit)) & bit_mask(bit) != 0
    }

    /// Sets `bit` and returns its previous value.
    #[inline]
    pub fn set(&self, bit: usize) -> bool {
        let entry = self.atomic(word_index(bit));
        let mask = bit_mask(bit);
        if entry.load(Ordering::Relaxed) & mask != 0 {
            return true;
        }
        entry.fetch_or(mask, Ordering::Relaxed) & mask != 0
    }

    #[inline]
    pub fn clear(&self, bit: usize) -> bool {
        let mask = bit_mask(bit);
        self.atomic(word_index(bit)).fetch_and(!mask, Ordering::Relaxed) & mask != 0
    }

    /// Sets `count` consecutive bits starting at `bit`.
    pub fn set_range(&self, bit: usize, count: usize) {
        let mut bit = bit;
        let end = bit + count;
        while bit < end {
            let in_word = bit % BITS_PER_VECTOR_WORD;
            let n = (BITS_PER_VECTOR_WORD - in_word).min(end - bit);
            let mask = if n == BITS_PER_VECTOR_WORD {
                !0
            } else {
                ((1usize << n) - 1) << in_word
            };
            self.atomic(word_index(bit)).fetch_or(mask, Ordering::Relaxed);
            bit += n;
        }
    }

    /// First set bit in `[from, limit)`.
    pub fn next_set(&self, from: usize, limit: usize) -> Option<usize> {
        self.scan_forward(from, limit, false)
    }

    /// First clear bit in `[from, limit)`, or `limit` if every bit is set.
    pub fn next_clear(&self, from: usize, limit: usize) -> usize {
        self.scan_forward(from, limit, true).unwrap_or(limit)
    }

    fn scan_forward(&self, from: usize, limit: usize, invert: bool) -> Option<usize> {
        let limit = limit.min(self.bit_count());
        if from >= limit {
            return None;
        }
        let mut index = word_index(from);
        let last = word_index(limit - 1);
        let load = |i: usize| {
            let w = self.word(i);
            if invert {
                !w
            } else {
                w
            }
        };
        let mut w = load(index) & !(bit_mask(from) - 1);
        loop {
            if w != 0 {
                let bit = index * BITS_PER_VECTOR_WORD + w.trailing_zeros() as usize;
                return if bit < limit { Some(bit) } else { None };
            }
            index += 1;
            if index > last {
                return None;
            }
            w = load(index);
        }
    }

    /// Last set bit in `[lowest, from]`.
    pub fn prev_set(&self, from: usize, lowest: usize) -> Option<usize> {
        if from < lowest {
            return None;
        }
        let mut index = word_index(from);
        let in_word = from % BITS_PER_VECTOR_WORD;
        let keep = if in_word == BITS_PER_VECTOR_WORD - 1 {
            !0
        } else {
            (1usize << (in_word + 1)) - 1
        };
        let mut w = self.word(index) & keep;
        loop {
            if w != 0 {
                let bit = index * BITS_PER_VECTOR_WORD + (BITS_PER_VECTOR_WORD - 1)
                    - w.leading_zeros() as usize;
                return if bit >= lowest { Some(bit) } else { None };
            }
            if index == 0 || index * BITS_PER_VECTOR_WORD <= lowest {
                return None;
            }
            index -= 1;
            w = self.word(index);
        }
    }

    /// Number of set bits in `[from, to)`.
    pub fn count(&self, from: usize, to: usize) -> usize {
        let mut total = 0;
        let mut bit = from;
        while bit < to {
            let in_word = bit % BITS_PER_VECTOR_WORD;
            let n = (BITS_PER_VECTOR_WORD - in_word).min(to - bit);
            let w = self.word(word_index(bit)) >> in_word;
            let w = if n == BITS_PER_VECTOR_WORD {
                w
            } else {
                w & ((1usize << n) - 1)
            };
            total += w.count_ones() as usize;
            bit += n;
        }
        total
    }

    pub fn clear_all(&self) {
        let ptr = self.mem_map.as_ptr() as usize;
        if crate::util::mmap::madvise(ptr, self.mem_map.len(), libc::MADV_DONTNEED).is_err() {
            for i in 0..self.word_count {
                self.atomic(i).store(0, Ordering::Relaxed);
            }
        }
    }
}

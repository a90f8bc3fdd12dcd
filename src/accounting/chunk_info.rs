use crate::globals::{BITS_PER_VECTOR_WORD, OBJECT_ALIGNMENT, OFFSET_CHUNK_SIZE};

/// Live bytes per [`OFFSET_CHUNK_SIZE`] chunk of the moving space. After
/// [`ChunkInfoVec::exclusive_prefix_sum`] every entry holds the post-compaction offset of the
/// first live word of its chunk.
pub struct ChunkInfoVec {
    entries: Vec<u32>,
}

impl ChunkInfoVec {
    pub fn new(space_capacity: usize) -> Self {
        Self {
            entries: vec![0; space_capacity / OFFSET_CHUNK_SIZE],
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn get(&self, chunk_idx: usize) -> u32 {
        self.entries[chunk_idx]
    }

    #[inline]
    pub fn set(&mut self, chunk_idx: usize, value: u32) {
        self.entries[chunk_idx] = value;
    }

    #[inline]
    pub fn add(&mut self, chunk_idx: usize, bytes: usize) {
        self.entries[chunk_idx] += bytes as u32;
    }

    /// Accounts `size` live bytes starting at live-words bit `bit_index`.
    pub fn record_live_object(&mut self, bit_index: usize, size: usize) {
        let mut chunk_idx = bit_index / BITS_PER_VECTOR_WORD;
        let in_chunk = bit_index % BITS_PER_VECTOR_WORD;
        let first_chunk_portion = size.min((BITS_PER_VECTOR_WORD - in_chunk) * OBJECT_ALIGNMENT);
        self.add(chunk_idx, first_chunk_portion);
        chunk_idx += 1;
        let mut size = size - first_chunk_portion;
        while size > OFFSET_CHUNK_SIZE {
            debug_assert_eq!(self.entries[chunk_idx], 0);
            self.entries[chunk_idx] = OFFSET_CHUNK_SIZE as u32;
            chunk_idx += 1;
            size -= OFFSET_CHUNK_SIZE;
        }
        if size > 0 {
            self.add(chunk_idx, size);
        }
    }

    /// Turns the first `vec_len` live-byte counts into post-compaction offsets. When the vector
    /// has room, the entry one past `vec_len` is included too so that it holds the total; the
    /// returned pair is the number of converted entries and the total live bytes.
    pub fn exclusive_prefix_sum(&mut self, vec_len: usize) -> (usize, usize) {
        let mut vec_len = vec_len;
        let mut total: usize;
        if vec_len < self.entries.len() {
            vec_len += 1;
            total = 0;
        } else if vec_len == 0 {
            return (0, 0);
        } else {
            total = self.entries[vec_len - 1] as usize;
        }
        let mut sum = 0u32;
        for entry in self.entries[..vec_len].iter_mut() {
            let live = *entry;
            *entry = sum;
            sum += live;
        }
        total += self.entries[vec_len - 1] as usize;
        (vec_len, total)
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.entries
    }

    pub fn clear(&mut self) {
        for entry in self.entries.iter_mut() {
            *entry = 0;
        }
    }
}

/// Fixed-length set of confirmed chunk indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkBitmap {
    words: Vec<u64>,
    len: u32,
    count: u32,
}

impl ChunkBitmap {
    /// Creates an all-unset bitmap of `len` bits.
    pub fn new(len: u32) -> Self {
        Self {
            words: vec![0; (len as usize).div_ceil(64)],
            len,
            count: 0,
        }
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of set bits.
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_complete(&self) -> bool {
        self.count == self.len
    }

    pub fn is_set(&self, index: u32) -> bool {
        if index >= self.len {
            return false;
        }
        let (word, bit) = Self::position(index);
        self.words[word] & (1 << bit) != 0
    }

    /// Sets bit `index`. Returns `true` if it was previously unset.
    ///
    /// Out-of-range indices are ignored.
    pub fn set(&mut self, index: u32) -> bool {
        if index >= self.len {
            return false;
        }
        let (word, bit) = Self::position(index);
        let mask = 1u64 << bit;
        if self.words[word] & mask != 0 {
            return false;
        }
        self.words[word] |= mask;
        self.count += 1;
        true
    }

    /// Indices with an unset bit, ascending.
    pub fn missing(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len).filter(|&i| !self.is_set(i))
    }

    /// Indices with a set bit, ascending.
    pub fn present(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len).filter(|&i| self.is_set(i))
    }

    fn position(index: u32) -> (usize, u32) {
        ((index / 64) as usize, index % 64)
    }
}

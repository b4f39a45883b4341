use crate::TransferError;

/// How a file of `total_size` bytes is cut into `chunk_size` pieces.
///
/// Every chunk but the last is exactly `chunk_size`; the last one holds
/// the remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    total_size: u64,
    chunk_size: u64,
    total_chunks: u32,
}

impl ChunkLayout {
    pub fn new(total_size: u64, chunk_size: u64) -> Result<Self, TransferError> {
        if total_size == 0 {
            return Err(TransferError::InvalidLayout("total size must be > 0".into()));
        }
        if chunk_size == 0 {
            return Err(TransferError::InvalidLayout("chunk size must be > 0".into()));
        }
        let total_chunks = u32::try_from(total_size.div_ceil(chunk_size)).map_err(|_| {
            TransferError::InvalidLayout(format!(
                "{total_size} bytes at {chunk_size} bytes per chunk exceeds the chunk limit"
            ))
        })?;
        Ok(Self {
            total_size,
            chunk_size,
            total_chunks,
        })
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// Byte offset of chunk `index`.
    pub fn offset(&self, index: u32) -> u64 {
        index as u64 * self.chunk_size
    }

    /// Expected length of chunk `index`, or `None` when out of range.
    pub fn chunk_len(&self, index: u32) -> Option<u64> {
        if index >= self.total_chunks {
            return None;
        }
        let offset = self.offset(index);
        Some(self.chunk_size.min(self.total_size - offset))
    }

    /// Total bytes covered by the given chunk indices.
    pub fn bytes_for(&self, indices: impl IntoIterator<Item = u32>) -> u64 {
        indices
            .into_iter()
            .filter_map(|i| self.chunk_len(i))
            .sum()
    }
}

//! Chunk sizing and byte-range planning.

/// Smallest chunk the store accepts for a non-final part: 5 MiB.
pub const MIN_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Part-count ceiling we plan against. The store caps multipart uploads
/// at 10,000 parts; planning for 9,500 leaves headroom.
pub const TARGET_PART_COUNT: u64 = 9_500;

/// Byte-range plan for one payload file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    file_size: u64,
    chunk_size: u64,
    count: u32,
}

impl ChunkPlan {
    /// Plans chunks for a file of `file_size` bytes.
    ///
    /// Chunk size is the larger of `min_chunk_size` and
    /// `file_size / 9500`, keeping the part count under the store limit
    /// without producing needlessly tiny chunks for small files.
    /// `min_chunk_size` is [`MIN_CHUNK_SIZE`] in production; tests force
    /// it small.
    pub fn for_file(file_size: u64, min_chunk_size: u64) -> Self {
        let chunk_size = min_chunk_size.max(file_size.div_ceil(TARGET_PART_COUNT));
        // An empty file still needs one (empty) part to finalize.
        let count = file_size.div_ceil(chunk_size).max(1) as u32;
        Self {
            file_size,
            chunk_size,
            count,
        }
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Total number of chunks (at least 1).
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Byte range of chunk `index` as `(offset, len)`.
    ///
    /// The final chunk is truncated to the file length.
    pub fn range(&self, index: u32) -> (u64, u64) {
        let offset = index as u64 * self.chunk_size;
        let len = self.chunk_size.min(self.file_size.saturating_sub(offset));
        (offset, len)
    }

    pub fn is_last(&self, index: u32) -> bool {
        index + 1 == self.count
    }
}

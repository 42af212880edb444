//! Completed transfer chunks.

use bytes::Bytes;

/// One contiguous piece of the file, fetched by some source. Chunks arrive
/// at the consumer in completion order, not offset order; the consumer
/// reassembles by `offset`.
#[derive(Debug, Clone)]
pub struct ChunkInfo {
    /// Absolute offset of the chunk in the file.
    pub offset: u64,
    /// Chunk payload.
    pub data: Bytes,
}

impl ChunkInfo {
    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// `true` for an empty payload.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

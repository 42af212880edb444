//! Cache engine configuration.
//!
//! Values here may be deserialized from a user configuration file by the
//! embedding application; loading and merging is the embedder's concern.

use bytesize::ByteSize;
use serde::Deserialize;

/// Tunables for a [`crate::file::CacheFile`] and the process-wide
/// [`crate::manager::CacheManager`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Size of a cache block. The last block of a file may be shorter.
    ///
    /// A side-car written with a different block size wins over this value
    /// when an existing cache file is reopened.
    pub buffer_size: ByteSize,

    /// Process-wide budget of blocks allowed to be resident in RAM at once.
    /// Reads that cannot obtain a grant fall back to direct, uncached reads.
    pub ram_blocks: u32,

    /// Number of written-back blocks that accumulate before an asynchronous
    /// flush of the data file and side-car header is scheduled.
    pub flush_threshold_blocks: u32,

    /// When `true`, the flush threshold only fires once the file is fully
    /// fetched, so all periodic flushes are deferred to completion. This
    /// mirrors the historical behavior; set to `false` to flush during the
    /// fill as well.
    pub flush_only_when_complete: bool,

    /// How many times a failed block fetch is retried before the error is
    /// parked on the block. `0` disables retries.
    pub block_retry_limit: u32,

    /// Base backoff before the first block-fetch retry, in milliseconds.
    /// Doubles per attempt.
    pub block_retry_backoff_ms: u64,

    /// Whether the manager's prefetch pump drives registered files.
    pub prefetch: bool,

    /// Pump period between prefetch rounds, in milliseconds.
    pub prefetch_interval_ms: u64,

    /// A file is skipped by the prefetcher while this many of its blocks are
    /// already resident in RAM.
    pub prefetch_max_resident: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            buffer_size: ByteSize::mib(1),
            ram_blocks: 256,
            flush_threshold_blocks: 100,
            flush_only_when_complete: true,
            block_retry_limit: 0,
            block_retry_backoff_ms: 50,
            prefetch: false,
            prefetch_interval_ms: 10,
            prefetch_max_resident: 3,
        }
    }
}

impl CacheConfig {
    /// Block size in bytes.
    #[must_use]
    pub fn buffer_size_bytes(&self) -> u64 {
        self.buffer_size.as_u64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = CacheConfig::default();
        assert_eq!(cfg.buffer_size_bytes(), 1024 * 1024);
        assert!(cfg.flush_only_when_complete);
        assert_eq!(cfg.block_retry_limit, 0);
    }
}

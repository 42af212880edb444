//! Per-file IO statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Byte counters for one cache file, split by where the bytes came from.
///
/// `missed` counts direct reads that bypassed the cache because no RAM grant
/// was available.
#[derive(Debug, Default)]
pub struct IoStats {
    bytes_disk: AtomicU64,
    bytes_ram: AtomicU64,
    bytes_missed: AtomicU64,
}

/// Point-in-time copy of [`IoStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IoStatSnapshot {
    /// Bytes served from the local disk image.
    pub bytes_disk: u64,
    /// Bytes served from blocks resident (or in flight) in RAM.
    pub bytes_ram: u64,
    /// Bytes served by direct remote reads that bypassed the cache.
    pub bytes_missed: u64,
}

impl IoStats {
    pub(crate) fn add_disk(&self, n: u64) {
        self.bytes_disk.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_ram(&self, n: u64) {
        self.bytes_ram.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_missed(&self, n: u64) {
        self.bytes_missed.fetch_add(n, Ordering::Relaxed);
    }

    /// Snapshot the counters.
    #[must_use]
    pub fn snapshot(&self) -> IoStatSnapshot {
        IoStatSnapshot {
            bytes_disk: self.bytes_disk.load(Ordering::Relaxed),
            bytes_ram: self.bytes_ram.load(Ordering::Relaxed),
            bytes_missed: self.bytes_missed.load(Ordering::Relaxed),
        }
    }
}

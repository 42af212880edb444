//! The block entity.
//!
//! A block is one fixed-size aligned slice of the remote file (the last one
//! may be shorter) moving through a three-state machine: pending while the
//! remote read is in flight, then exactly one transition to ok or failed on
//! completion. All fields are mutated only under the owning file's download
//! lock.

use bytes::Bytes;

/// One cache block.
#[derive(Debug)]
pub struct Block {
    /// Absolute offset of the block in the file.
    pub offset: u64,
    /// Payload size; `buffer_size` except for the trailing block.
    pub size: usize,
    /// Verified remote bytes; empty until `downloaded`.
    pub buf: Bytes,
    /// Set once the remote read completed successfully.
    pub downloaded: bool,
    /// errno of a failed fetch; `0` means no error.
    pub errno: i32,
    /// Number of live references: concurrent readers plus at most one
    /// pending write-back, plus the keep-resident reference of a failed
    /// block.
    pub refcnt: u32,
    /// Whether the block was brought in by the prefetcher.
    pub prefetch: bool,
}

impl Block {
    pub(crate) fn new(offset: u64, size: usize, prefetch: bool) -> Self {
        Self {
            offset,
            size,
            buf: Bytes::new(),
            downloaded: false,
            errno: 0,
            refcnt: 0,
            prefetch,
        }
    }

    /// The remote read has completed, successfully or not.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.downloaded || self.errno != 0
    }

    /// The block holds verified remote bytes.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.downloaded && self.errno == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine() {
        let mut b = Block::new(0, 4096, false);
        assert!(!b.is_finished());
        assert!(!b.is_ok());

        b.downloaded = true;
        b.buf = Bytes::from_static(&[0u8; 4096]);
        assert!(b.is_finished());
        assert!(b.is_ok());

        let mut f = Block::new(4096, 4096, true);
        f.errno = libc::EIO;
        assert!(f.is_finished());
        assert!(!f.is_ok());
    }
}

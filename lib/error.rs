//! Error types for the cache engine.
//!
//! Every public operation has its own error enum, and each enum converts to
//! an errno-style `i32` so the POSIX shim in front of the cache can surface
//! failures without knowing their shape.

use thiserror::Error;

/// Error opening a cache file (data file or side-car).
#[derive(Debug, Error)]
pub enum OpenError {
    /// The local data file could not be created or opened.
    #[error("cannot open cache data file: {0}")]
    DataFile(#[source] std::io::Error),

    /// The side-car info file could not be created or opened.
    #[error("cannot open cache info file: {0}")]
    InfoFile(#[source] std::io::Error),

    /// The side-car exists but its header cannot be decoded.
    #[error("corrupt cache info header: {0}")]
    CorruptHeader(#[source] std::io::Error),
}

impl From<OpenError> for i32 {
    fn from(e: OpenError) -> Self {
        match e {
            OpenError::DataFile(ref io) | OpenError::InfoFile(ref io) => {
                io.raw_os_error().unwrap_or(libc::EIO)
            }
            OpenError::CorruptHeader(_) => libc::EIO,
        }
    }
}

/// Error returned from [`crate::file::CacheFile::read`].
#[derive(Debug, Error)]
pub enum ReadError {
    /// The remote fetch of a block covering the requested range failed.
    /// Carries the errno reported by the remote.
    #[error("block fetch failed (errno {errno})")]
    BlockFetch {
        /// errno reported by the remote transport.
        errno: i32,
    },

    /// Reading an already-persisted block from the local image failed.
    #[error("disk read failed: {0}")]
    Disk(#[from] std::io::Error),
}

impl From<ReadError> for i32 {
    fn from(e: ReadError) -> Self {
        match e {
            ReadError::BlockFetch { errno } => errno,
            ReadError::Disk(ref io) => io.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

/// Failure persisting a completed block to the local image. Never surfaced
/// to readers; the writer logs it and drops the block's write reference.
#[derive(Debug, Error)]
pub enum WriteBackError {
    /// The write still had not completed after the retry cap.
    #[error("disk write incomplete after {attempts} attempts")]
    RetriesExhausted {
        /// Number of write attempts made.
        attempts: u32,
    },

    /// A non-retriable I/O error from the storage adapter.
    #[error("disk write failed: {0}")]
    Disk(#[from] std::io::Error),
}

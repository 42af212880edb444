//! The remote side of the cache.
//!
//! The transport that actually talks to the remote replica lives outside
//! this crate; the engine only needs asynchronous positional reads and the
//! file's size. Completion routing is done by the task awaiting `read_at`,
//! which carries `(file, block index)` rather than a pointer into the block
//! map.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Failure reported by the remote transport, mapped onto an errno so it can
/// be parked on a block and later surfaced through a POSIX shim.
#[derive(Debug, Clone, Error)]
#[error("remote read failed (errno {errno}): {message}")]
pub struct RemoteError {
    /// errno equivalent of the transport failure.
    pub errno: i32,
    /// Human-readable description from the transport.
    pub message: String,
}

impl RemoteError {
    /// Build an error from an errno and description.
    #[must_use]
    pub fn new(errno: i32, message: impl Into<String>) -> Self {
        Self {
            errno,
            message: message.into(),
        }
    }
}

/// Asynchronous positional reads against one remote file.
#[async_trait]
pub trait RemoteRead: Send + Sync {
    /// Read `len` bytes at `offset`. Returns short only at EOF.
    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, RemoteError>;

    /// Total size of the remote file in bytes.
    fn size(&self) -> u64;

    /// Remote path, used for logging only.
    fn path(&self) -> &str;
}

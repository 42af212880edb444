//! Pluggable local storage behind the cache.
//!
//! The cache engine persists block data and the side-car index through this
//! seam rather than touching the filesystem directly, so embedders can route
//! cache files onto whatever store they manage. [`LocalFs`] is the stock
//! adapter over the host filesystem.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bitflags::bitflags;
use bytes::Bytes;

bitflags! {
    /// Open disposition for a storage handle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Open for reading.
        const READ = 1 << 0;
        /// Open for writing.
        const WRITE = 1 << 1;
        /// Create the file if it does not exist.
        const CREATE = 1 << 2;
    }
}

/// An open byte-addressable file on the backing store.
///
/// Positional reads and writes may run concurrently from multiple tasks.
/// `write_at` is allowed to write short or fail with `EINTR`; callers that
/// need the full buffer on disk retry.
#[async_trait]
pub trait StorageHandle: Send + Sync {
    /// Read up to `len` bytes at `offset`. A short result past EOF is not an
    /// error.
    async fn read_at(&self, offset: u64, len: usize) -> io::Result<Bytes>;

    /// Write `data` at `offset`, returning the number of bytes written.
    async fn write_at(&self, offset: u64, data: Bytes) -> io::Result<usize>;

    /// Flush file contents to stable storage.
    async fn fsync(&self) -> io::Result<()>;

    /// Current length of the file in bytes.
    async fn len(&self) -> io::Result<u64>;
}

/// Factory for storage handles.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Create the file at `path` with `mode`, creating missing parent
    /// directories when `mkpath` is set. Succeeds if the file already exists.
    async fn create(&self, path: &Path, mode: u32, mkpath: bool) -> io::Result<()>;

    /// Open the file at `path`.
    async fn open(
        &self,
        path: &Path,
        flags: OpenFlags,
        mode: u32,
    ) -> io::Result<Box<dyn StorageHandle>>;
}

/// Storage adapter over the host filesystem.
///
/// All paths are resolved under `root`, so a cache configured at
/// `/var/cache/...` cannot escape it.
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    /// Create an adapter rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            // Re-root absolute paths; the cache's namespace mirrors the
            // remote namespace and is not a host path.
            self.root.join(path.strip_prefix("/").unwrap_or(path))
        } else {
            self.root.join(path)
        }
    }
}

#[async_trait]
impl Storage for LocalFs {
    async fn create(&self, path: &Path, mode: u32, mkpath: bool) -> io::Result<()> {
        let full = self.resolve(path);
        if mkpath && let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mode = mode & 0o7777;
        tokio::task::spawn_blocking(move || {
            use std::os::unix::fs::OpenOptionsExt as _;
            std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .mode(mode)
                .open(&full)
                .map(drop)
        })
        .await
        .map_err(io::Error::other)?
    }

    async fn open(
        &self,
        path: &Path,
        flags: OpenFlags,
        mode: u32,
    ) -> io::Result<Box<dyn StorageHandle>> {
        let full = self.resolve(path);
        let mode = mode & 0o7777;
        let file = tokio::task::spawn_blocking(move || {
            use std::os::unix::fs::OpenOptionsExt as _;
            std::fs::OpenOptions::new()
                .read(flags.contains(OpenFlags::READ))
                .write(flags.contains(OpenFlags::WRITE))
                .create(flags.contains(OpenFlags::CREATE))
                .mode(mode)
                .open(&full)
        })
        .await
        .map_err(io::Error::other)??;

        Ok(Box::new(LocalHandle {
            file: Arc::new(file),
        }))
    }
}

struct LocalHandle {
    file: Arc<std::fs::File>,
}

#[async_trait]
impl StorageHandle for LocalHandle {
    async fn read_at(&self, offset: u64, len: usize) -> io::Result<Bytes> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || {
            use std::os::unix::fs::FileExt as _;
            let mut buf = vec![0u8; len];
            let mut read = 0;
            // read_at may return short; keep going until EOF or full.
            while read < len {
                match file.read_at(&mut buf[read..], offset + read as u64) {
                    Ok(0) => break,
                    Ok(n) => read += n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
            buf.truncate(read);
            Ok(Bytes::from(buf))
        })
        .await
        .map_err(io::Error::other)?
    }

    async fn write_at(&self, offset: u64, data: Bytes) -> io::Result<usize> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || {
            use std::os::unix::fs::FileExt as _;
            file.write_at(&data, offset)
        })
        .await
        .map_err(io::Error::other)?
    }

    async fn fsync(&self) -> io::Result<()> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || file.sync_all())
            .await
            .map_err(io::Error::other)?
    }

    async fn len(&self) -> io::Result<u64> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || file.metadata().map(|m| m.len()))
            .await
            .map_err(io::Error::other)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_fs_round_trips_positional_io() {
        let tmp = tempfile::tempdir().unwrap();
        let fs = LocalFs::new(tmp.path());

        fs.create(Path::new("a/b/data"), 0o600, true).await.unwrap();
        let h = fs
            .open(
                Path::new("a/b/data"),
                OpenFlags::READ | OpenFlags::WRITE,
                0o600,
            )
            .await
            .unwrap();

        assert_eq!(h.write_at(4, Bytes::from_static(b"abcd")).await.unwrap(), 4);
        let got = h.read_at(0, 8).await.unwrap();
        assert_eq!(&got[..], b"\0\0\0\0abcd");
        assert_eq!(h.len().await.unwrap(), 8);

        // Reads past EOF come back short, not as errors.
        let tail = h.read_at(6, 8).await.unwrap();
        assert_eq!(&tail[..], b"cd");
    }
}

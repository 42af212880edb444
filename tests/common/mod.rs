#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use filecache::config::CacheConfig;
use filecache::manager::CacheManager;
use filecache::remote::{RemoteError, RemoteRead};
use filecache::storage::{OpenFlags, Storage, StorageHandle};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Deterministic file contents for assertions.
pub fn pattern(size: usize) -> Bytes {
    let mut v = Vec::with_capacity(size);
    for i in 0..size {
        v.push(((i as u64 * 31 + 7) % 251) as u8);
    }
    Bytes::from(v)
}

/// In-memory remote file with configurable latency and failure injection.
pub struct MockRemote {
    path: String,
    data: Bytes,
    delay: Option<Duration>,
    /// Per-read delay scaled by block ordinal: read of block `i` sleeps
    /// `delay_step * (i + 1)`, staggering completions.
    delay_step: Option<(Duration, u64)>,
    /// Requests overlapping `[start, start + len)` fail with `errno`.
    fail_ranges: Vec<(u64, u64, i32)>,
    reads: Mutex<Vec<(u64, usize)>>,
}

impl MockRemote {
    pub fn new(data: Bytes) -> Self {
        Self {
            path: "root://mock/f".to_owned(),
            data,
            delay: None,
            delay_step: None,
            fail_ranges: Vec::new(),
            reads: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_delay_step(mut self, step: Duration, block_size: u64) -> Self {
        self.delay_step = Some((step, block_size));
        self
    }

    pub fn with_failure(mut self, start: u64, len: u64, errno: i32) -> Self {
        self.fail_ranges.push((start, len, errno));
        self
    }

    /// Number of remote read requests issued so far.
    pub fn read_count(&self) -> usize {
        lock(&self.reads).len()
    }

    pub fn reads(&self) -> Vec<(u64, usize)> {
        lock(&self.reads).clone()
    }
}

#[async_trait]
impl RemoteRead for MockRemote {
    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, RemoteError> {
        lock(&self.reads).push((offset, len));
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        if let Some((step, bs)) = self.delay_step {
            tokio::time::sleep(step * (offset / bs + 1) as u32).await;
        }
        let req_end = offset + len as u64;
        for &(start, flen, errno) in &self.fail_ranges {
            if offset < start + flen && req_end > start {
                return Err(RemoteError::new(errno, "injected failure"));
            }
        }
        let end = (req_end as usize).min(self.data.len());
        let start = (offset as usize).min(end);
        Ok(self.data.slice(start..end))
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn path(&self) -> &str {
        &self.path
    }
}

/// Storage wrapper that makes the first `n` writes short, exercising the
/// write-back retry loop.
pub struct ShortWriteStorage<S> {
    inner: S,
    shorts: Arc<AtomicU32>,
}

impl<S> ShortWriteStorage<S> {
    pub fn new(inner: S, short_writes: u32) -> Self {
        Self {
            inner,
            shorts: Arc::new(AtomicU32::new(short_writes)),
        }
    }
}

#[async_trait]
impl<S: Storage> Storage for ShortWriteStorage<S> {
    async fn create(&self, path: &Path, mode: u32, mkpath: bool) -> io::Result<()> {
        self.inner.create(path, mode, mkpath).await
    }

    async fn open(
        &self,
        path: &Path,
        flags: OpenFlags,
        mode: u32,
    ) -> io::Result<Box<dyn StorageHandle>> {
        let handle = self.inner.open(path, flags, mode).await?;
        Ok(Box::new(ShortWriteHandle {
            inner: handle,
            shorts: Arc::clone(&self.shorts),
        }))
    }
}

struct ShortWriteHandle {
    inner: Box<dyn StorageHandle>,
    shorts: Arc<AtomicU32>,
}

#[async_trait]
impl StorageHandle for ShortWriteHandle {
    async fn read_at(&self, offset: u64, len: usize) -> io::Result<Bytes> {
        self.inner.read_at(offset, len).await
    }

    async fn write_at(&self, offset: u64, data: Bytes) -> io::Result<usize> {
        let mut remaining = self.shorts.load(Ordering::Relaxed);
        while remaining > 0 {
            match self.shorts.compare_exchange_weak(
                remaining,
                remaining - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    let half = (data.len() / 2).max(1);
                    return self.inner.write_at(offset, data.slice(..half)).await;
                }
                Err(observed) => remaining = observed,
            }
        }
        self.inner.write_at(offset, data).await
    }

    async fn fsync(&self) -> io::Result<()> {
        self.inner.fsync().await
    }

    async fn len(&self) -> io::Result<u64> {
        self.inner.len().await
    }
}

/// A config sized for tests: small blocks, no prefetch.
pub fn test_config(buffer_size: u64, ram_blocks: u32) -> CacheConfig {
    CacheConfig {
        buffer_size: bytesize::ByteSize::b(buffer_size),
        ram_blocks,
        ..CacheConfig::default()
    }
}

pub fn new_manager(cfg: CacheConfig) -> Arc<CacheManager> {
    CacheManager::new(cfg)
}

/// Poll `cond` until it holds, or panic after two seconds.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for: {what}");
}

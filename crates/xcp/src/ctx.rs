//! The copy coordinator.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytesize::ByteSize;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Notify, watch};
use tracing::debug;

use crate::chunk::ChunkInfo;
use crate::sink::ChunkSink;
use crate::source::{self, ReplicaOpener, XcpSrc};

/// How long [`XcpCtx::all_done`] waits for progress before giving the
/// consumer back control.
const ALL_DONE_WAIT: Duration = Duration::from_secs(60);

/// Transfer tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct XcpConfig {
    /// Bytes claimed from the coordinator per block. Clamped on the first
    /// file-size observation to `max(min(block_size, size / parallel_src),
    /// chunk_size)`.
    pub block_size: ByteSize,
    /// Number of parallel replica workers.
    pub parallel_src: usize,
    /// Bytes per chunk read within a block.
    pub chunk_size: ByteSize,
    /// Chunk reads a single worker keeps in flight.
    pub parallel_chunks: usize,
}

impl Default for XcpConfig {
    fn default() -> Self {
        Self {
            block_size: ByteSize::mib(128),
            parallel_src: 4,
            chunk_size: ByteSize::mib(8),
            parallel_chunks: 4,
        }
    }
}

/// Why [`XcpCtx::initialize`] failed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InitError {
    /// No source workers could be created (`parallel_src` was zero).
    #[error("failed to create any source workers")]
    NoSources,
}

/// Outcome of one [`XcpCtx::get_chunk`] poll.
#[derive(Debug)]
pub enum ChunkStatus {
    /// Every byte of the file has been handed to the consumer.
    Done,
    /// All sources died before the transfer completed.
    NoMoreReplicas,
    /// One chunk, accounted and handed over.
    Continue(ChunkInfo),
    /// Nothing available right now; wait via [`XcpCtx::all_done`] and poll
    /// again.
    Retry,
}

pub(crate) struct CtxInner {
    urls: Mutex<VecDeque<String>>,
    block_size: AtomicU64,
    chunk_size: u64,
    parallel_src: usize,
    parallel_chunks: usize,

    cursor: Mutex<u64>,
    file_size: watch::Sender<Option<u64>>,

    data_received: AtomicU64,
    sink: ChunkSink,
    sources: Mutex<Vec<Arc<XcpSrc>>>,

    done: AtomicBool,
    done_notify: Notify,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CtxInner {
    pub(crate) fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub(crate) fn parallel_chunks(&self) -> usize {
        self.parallel_chunks
    }

    pub(crate) fn get_next_url(&self) -> Option<String> {
        lock(&self.urls).pop_front()
    }

    /// One-shot: the first positive observation wins and clamps the block
    /// size; workers blocked on [`wait_file_size`](Self::wait_file_size)
    /// are released.
    pub(crate) fn set_file_size(&self, size: u64) {
        self.file_size.send_if_modified(|cur| {
            if cur.is_some() {
                return false;
            }
            *cur = Some(size);

            let mut bs = self.block_size.load(Ordering::Relaxed);
            let per_src = size / self.parallel_src.max(1) as u64;
            if bs > per_src {
                bs = per_src;
            }
            if bs < self.chunk_size {
                bs = self.chunk_size;
            }
            self.block_size.store(bs, Ordering::Relaxed);
            debug!(size, block_size = bs, "file size observed");
            true
        });
    }

    pub(crate) async fn wait_file_size(&self) -> u64 {
        let mut rx = self.file_size.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if let Some(size) = current {
                return size;
            }
            if rx.changed().await.is_err() {
                return 0;
            }
        }
    }

    /// Claim the next block: `(offset, min(block_size, size - offset))`.
    /// Returns a zero length once the cursor reaches the file size.
    pub(crate) fn get_block(&self, file_size: u64) -> (u64, u64) {
        let mut cursor = lock(&self.cursor);
        if *cursor >= file_size {
            return (*cursor, 0);
        }
        let len = self.block_size.load(Ordering::Relaxed).min(file_size - *cursor);
        let off = *cursor;
        *cursor += len;
        (off, len)
    }

    /// The source with the lowest transfer rate that still holds stealable
    /// work, excluding `exclude`. Ties go to the earliest source.
    pub(crate) fn weakest_link(&self, exclude: usize) -> Option<Arc<XcpSrc>> {
        let sources = lock(&self.sources);
        let mut best: Option<Arc<XcpSrc>> = None;
        let mut best_rate = u64::MAX;
        for src in sources.iter() {
            if src.id == exclude || !src.has_data() {
                continue;
            }
            let rate = src.transfer_rate();
            if rate < best_rate {
                best_rate = rate;
                best = Some(Arc::clone(src));
            }
        }
        best
    }

    /// Transfer the tail half of the weakest source's queue to `thief`.
    pub(crate) fn steal_for(&self, thief: &XcpSrc) -> VecDeque<(u64, u64)> {
        match self.weakest_link(thief.id) {
            Some(victim) => victim.surrender_tail(),
            None => VecDeque::new(),
        }
    }

    pub(crate) fn put_chunk(&self, chunk: ChunkInfo) {
        self.sink.put(chunk);
    }

    pub(crate) fn notify_idle_src(&self) {
        self.done_notify.notify_waiters();
    }

    fn set_done(&self) {
        self.done.store(true, Ordering::Release);
        self.done_notify.notify_waiters();
    }
}

/// Coordinator for one multi-source copy.
pub struct XcpCtx {
    inner: Arc<CtxInner>,
}

impl XcpCtx {
    /// Create a coordinator over `urls`. `file_size` may be passed when
    /// already known; otherwise the first worker to open a replica
    /// publishes it.
    #[must_use]
    pub fn new(urls: Vec<String>, cfg: XcpConfig, file_size: Option<u64>) -> Self {
        let inner = Arc::new(CtxInner {
            urls: Mutex::new(urls.into()),
            block_size: AtomicU64::new(cfg.block_size.as_u64()),
            chunk_size: cfg.chunk_size.as_u64(),
            parallel_src: cfg.parallel_src,
            parallel_chunks: cfg.parallel_chunks.max(1),
            cursor: Mutex::new(0),
            file_size: watch::Sender::new(None),
            data_received: AtomicU64::new(0),
            sink: ChunkSink::default(),
            sources: Mutex::new(Vec::new()),
            done: AtomicBool::new(false),
            done_notify: Notify::new(),
        });
        if let Some(size) = file_size {
            inner.set_file_size(size);
        }
        Self { inner }
    }

    /// Spawn the source workers. Fails iff none could be created.
    pub fn initialize(&self, opener: Arc<dyn ReplicaOpener>) -> Result<(), InitError> {
        if self.inner.parallel_src == 0 {
            return Err(InitError::NoSources);
        }

        let mut sources = lock(&self.inner.sources);
        for id in 0..self.inner.parallel_src {
            let src = Arc::new(XcpSrc::new(id));
            sources.push(Arc::clone(&src));
            tokio::spawn(source::run(
                Arc::clone(&self.inner),
                src,
                Arc::clone(&opener),
            ));
        }
        Ok(())
    }

    /// Poll for the next chunk.
    ///
    /// The sink is drained before the liveness check: a worker may push its
    /// final chunk and exit before the consumer polls, and that chunk still
    /// belongs to the stream.
    pub fn get_chunk(&self) -> ChunkStatus {
        let inner = &self.inner;
        let file_size = *inner.file_size.borrow();

        if let Some(size) = file_size
            && inner.data_received.load(Ordering::Acquire) == size
        {
            inner.set_done();
            return ChunkStatus::Done;
        }

        if let Some(chunk) = inner.sink.get() {
            inner
                .data_received
                .fetch_add(chunk.len() as u64, Ordering::AcqRel);
            return ChunkStatus::Continue(chunk);
        }

        let any_running = lock(&inner.sources).iter().any(|s| s.is_running());
        if !any_running {
            inner.set_done();
            return ChunkStatus::NoMoreReplicas;
        }

        ChunkStatus::Retry
    }

    /// Wait (up to 60 s) for the done condition, returning its state. Woken
    /// early whenever a worker publishes chunks or goes idle. Returns
    /// immediately when no worker is running — there is nothing left to
    /// wait for, and the next [`get_chunk`](Self::get_chunk) settles the
    /// outcome.
    pub async fn all_done(&self) -> bool {
        let notified = self.inner.done_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let any_running = lock(&self.inner.sources).iter().any(|s| s.is_running());
        if !self.inner.done.load(Ordering::Acquire) && any_running {
            drop(tokio::time::timeout(ALL_DONE_WAIT, notified).await);
        }
        self.inner.done.load(Ordering::Acquire)
    }

    /// Wake consumers parked in [`all_done`](Self::all_done).
    pub fn notify_idle_src(&self) {
        self.inner.notify_idle_src();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with_sources(n: usize) -> (XcpCtx, Vec<Arc<XcpSrc>>) {
        let ctx = XcpCtx::new(Vec::new(), XcpConfig::default(), None);
        let sources: Vec<Arc<XcpSrc>> = (0..n).map(|id| Arc::new(XcpSrc::new(id))).collect();
        *lock(&ctx.inner.sources) = sources.clone();
        (ctx, sources)
    }

    #[test]
    fn weakest_link_never_returns_the_excluded_source() {
        let (ctx, sources) = ctx_with_sources(3);
        sources[0].seed_for_test(vec![(0, 8)], 1000);
        sources[1].seed_for_test(vec![(8, 8)], 10);
        sources[2].seed_for_test(vec![(16, 8)], 100);

        // Source 1 is slowest, unless it is the one asking.
        let victim = ctx.inner.weakest_link(0).map(|s| s.id);
        assert_eq!(victim, Some(1));
        let victim = ctx.inner.weakest_link(1).map(|s| s.id);
        assert_eq!(victim, Some(2));
    }

    #[test]
    fn weakest_link_requires_stealable_data() {
        let (ctx, sources) = ctx_with_sources(2);
        // Neither source holds data.
        assert!(ctx.inner.weakest_link(0).is_none());

        sources[1].seed_for_test(vec![(0, 8)], 0);
        assert_eq!(ctx.inner.weakest_link(0).map(|s| s.id), Some(1));
        // The only source with data is the excluded one.
        assert!(ctx.inner.weakest_link(1).is_none());
    }

    #[test]
    fn block_size_clamped_on_first_size_observation() {
        let cfg = XcpConfig {
            block_size: ByteSize::b(1000),
            parallel_src: 4,
            chunk_size: ByteSize::b(64),
            parallel_chunks: 2,
        };
        let ctx = XcpCtx::new(Vec::new(), cfg, Some(400));
        // min(1000, 400 / 4) = 100, above the chunk-size floor of 64.
        assert_eq!(ctx.inner.block_size.load(Ordering::Relaxed), 100);

        // Later observations are ignored.
        ctx.inner.set_file_size(4000);
        assert_eq!(ctx.inner.block_size.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn get_block_walks_the_file_and_then_runs_dry() {
        let cfg = XcpConfig {
            block_size: ByteSize::b(100),
            parallel_src: 1,
            chunk_size: ByteSize::b(10),
            parallel_chunks: 1,
        };
        let ctx = XcpCtx::new(Vec::new(), cfg, Some(250));

        assert_eq!(ctx.inner.get_block(250), (0, 100));
        assert_eq!(ctx.inner.get_block(250), (100, 100));
        assert_eq!(ctx.inner.get_block(250), (200, 50));
        assert_eq!(ctx.inner.get_block(250).1, 0);
    }

    #[test]
    fn initialize_with_zero_workers_fails() {
        let cfg = XcpConfig {
            parallel_src: 0,
            ..XcpConfig::default()
        };
        let ctx = XcpCtx::new(vec!["root://a/f".into()], cfg, None);
        // No runtime needed: the error is returned before any spawn.
        assert_eq!(
            ctx.initialize(Arc::new(NeverOpen)).unwrap_err(),
            InitError::NoSources
        );
    }

    struct NeverOpen;

    #[async_trait::async_trait]
    impl ReplicaOpener for NeverOpen {
        async fn open(
            &self,
            _url: &str,
        ) -> Result<Arc<dyn filecache::remote::RemoteRead>, filecache::remote::RemoteError> {
            Err(filecache::remote::RemoteError::new(libc::ENOENT, "nope"))
        }
    }
}

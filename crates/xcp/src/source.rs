//! Replica workers.
//!
//! Each worker owns one replica connection and a queue of chunk ranges it
//! has claimed from the coordinator. When the coordinator runs out of
//! blocks, idle workers steal the tail half of the slowest source's queue.
//! A worker whose replica fails irrecoverably stops but leaves its pending
//! ranges stealable, so the transfer survives as long as one replica lives.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use filecache::remote::{RemoteError, RemoteRead};

use crate::chunk::ChunkInfo;
use crate::ctx::CtxInner;

/// Width of the transfer-rate sliding window, in one-second buckets.
const RATE_WINDOW_SECS: usize = 10;

/// Opens replica connections by URL.
#[async_trait]
pub trait ReplicaOpener: Send + Sync {
    /// Open the replica at `url` for reading.
    async fn open(&self, url: &str) -> Result<Arc<dyn RemoteRead>, RemoteError>;
}

/// Sliding-window estimate of a source's throughput: bytes delivered over
/// the last [`RATE_WINDOW_SECS`] seconds.
#[derive(Debug)]
pub(crate) struct RateEstimator {
    started: Instant,
    window: Mutex<RateWindow>,
}

#[derive(Debug)]
struct RateWindow {
    buckets: [u64; RATE_WINDOW_SECS],
    head: usize,
    head_sec: u64,
}

impl RateEstimator {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            window: Mutex::new(RateWindow {
                buckets: [0; RATE_WINDOW_SECS],
                head: 0,
                head_sec: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RateWindow> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn advance(w: &mut RateWindow, now_sec: u64) {
        if now_sec.saturating_sub(w.head_sec) >= RATE_WINDOW_SECS as u64 {
            w.buckets = [0; RATE_WINDOW_SECS];
            w.head_sec = now_sec;
            return;
        }
        while w.head_sec < now_sec {
            w.head = (w.head + 1) % RATE_WINDOW_SECS;
            w.buckets[w.head] = 0;
            w.head_sec += 1;
        }
    }

    pub(crate) fn add(&self, bytes: u64) {
        let now_sec = self.started.elapsed().as_secs();
        let mut w = self.lock();
        Self::advance(&mut w, now_sec);
        let head = w.head;
        w.buckets[head] += bytes;
    }

    pub(crate) fn rate(&self) -> u64 {
        let now_sec = self.started.elapsed().as_secs();
        let mut w = self.lock();
        Self::advance(&mut w, now_sec);
        w.buckets.iter().sum()
    }
}

/// Shared state of one replica worker, visible to the coordinator for
/// weakest-link selection and to peers for stealing.
pub(crate) struct XcpSrc {
    pub(crate) id: usize,
    running: AtomicBool,
    pending: Mutex<VecDeque<(u64, u64)>>,
    rate: RateEstimator,
}

impl XcpSrc {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            running: AtomicBool::new(true),
            pending: Mutex::new(VecDeque::new()),
            rate: RateEstimator::new(),
        }
    }

    fn pending_lock(&self) -> MutexGuard<'_, VecDeque<(u64, u64)>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Whether this source holds unfetched ranges worth stealing.
    pub(crate) fn has_data(&self) -> bool {
        !self.pending_lock().is_empty()
    }

    pub(crate) fn transfer_rate(&self) -> u64 {
        self.rate.rate()
    }

    /// Atomically give up the tail half of the pending queue to a thief.
    pub(crate) fn surrender_tail(&self) -> VecDeque<(u64, u64)> {
        let mut q = self.pending_lock();
        let keep = q.len() / 2;
        q.split_off(keep)
    }

    fn push_back_all(&self, ranges: impl IntoIterator<Item = (u64, u64)>) {
        self.pending_lock().extend(ranges);
    }

    fn push_front_all(&self, ranges: Vec<(u64, u64)>) {
        let mut q = self.pending_lock();
        for r in ranges.into_iter().rev() {
            q.push_front(r);
        }
    }

    fn take_batch(&self, max: usize) -> Vec<(u64, u64)> {
        let mut q = self.pending_lock();
        let n = q.len().min(max);
        q.drain(..n).collect()
    }

    #[cfg(test)]
    pub(crate) fn seed_for_test(&self, ranges: Vec<(u64, u64)>, bytes_moved: u64) {
        self.push_back_all(ranges);
        if bytes_moved > 0 {
            self.rate.add(bytes_moved);
        }
    }
}

/// Split `[off, off + len)` into ranges of at most `chunk` bytes.
fn chunk_ranges(off: u64, len: u64, chunk: u64) -> VecDeque<(u64, u64)> {
    let mut out = VecDeque::new();
    let end = off + len;
    let mut cur = off;
    while cur < end {
        let l = chunk.min(end - cur);
        out.push_back((cur, l));
        cur += l;
    }
    out
}

/// Acquire a replica from the coordinator's URL pool, skipping URLs that
/// fail to open. Publishes the observed file size on success.
async fn acquire_replica(
    ctx: &CtxInner,
    src: &XcpSrc,
    opener: &dyn ReplicaOpener,
) -> Option<Arc<dyn RemoteRead>> {
    while let Some(url) = ctx.get_next_url() {
        match opener.open(&url).await {
            Ok(remote) => {
                debug!(src = src.id, url, "replica opened");
                ctx.set_file_size(remote.size());
                return Some(remote);
            }
            Err(e) => {
                warn!(src = src.id, url, errno = e.errno, "replica open failed, trying next");
            }
        }
    }
    None
}

/// Worker main loop. Runs until the coordinator is exhausted and nothing is
/// left to steal, or until the replica fails with no URL to fall back to.
pub(crate) async fn run(ctx: Arc<CtxInner>, src: Arc<XcpSrc>, opener: Arc<dyn ReplicaOpener>) {
    let Some(mut remote) = acquire_replica(&ctx, &src, &*opener).await else {
        debug!(src = src.id, "no replica available, source exiting");
        src.stop();
        ctx.notify_idle_src();
        return;
    };

    let file_size = ctx.wait_file_size().await;

    loop {
        if !src.has_data() {
            let (off, len) = ctx.get_block(file_size);
            if len > 0 {
                src.push_back_all(chunk_ranges(off, len, ctx.chunk_size()));
            } else {
                // The offset cursor is spent; live off the slowest peer.
                let stolen = ctx.steal_for(&src);
                if stolen.is_empty() {
                    break;
                }
                debug!(src = src.id, count = stolen.len(), "stole work from slowest source");
                src.push_back_all(stolen);
            }
        }

        let batch = src.take_batch(ctx.parallel_chunks());
        if batch.is_empty() {
            // A peer stole everything between the check and the take.
            continue;
        }

        let reads = batch.iter().map(|&(off, len)| {
            let remote = Arc::clone(&remote);
            async move { (off, len, remote.read_at(off, len as usize).await) }
        });
        let results = futures::future::join_all(reads).await;

        let mut failed = Vec::new();
        for (off, len, res) in results {
            match res {
                Ok(data) => {
                    trace!(src = src.id, off, len, "chunk fetched");
                    src.rate.add(len);
                    ctx.put_chunk(ChunkInfo { offset: off, data });
                }
                Err(e) => {
                    warn!(src = src.id, off, len, errno = e.errno, "chunk fetch failed");
                    failed.push((off, len));
                }
            }
        }
        ctx.notify_idle_src();

        if !failed.is_empty() {
            src.push_front_all(failed);
            match acquire_replica(&ctx, &src, &*opener).await {
                Some(r) => remote = r,
                None => {
                    warn!(src = src.id, "replica failed irrecoverably, pending work left stealable");
                    break;
                }
            }
        }
    }

    debug!(src = src.id, "source exiting");
    src.stop();
    ctx.notify_idle_src();
}

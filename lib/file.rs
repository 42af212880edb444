//! Per-file cache engine.
//!
//! A [`CacheFile`] fronts one remote file. Reads are classified per block:
//! blocks already resident (or in flight) in RAM are shared via refcounts,
//! blocks on disk are served from the local image, and absent blocks are
//! either fetched into the cache under a RAM grant or read directly from the
//! remote when the budget is spent. Completed blocks are written back to
//! disk by the manager's writer task and recorded in the `<path>.cinfo`
//! side-car.
//!
//! Locking: the block map, the `fetched` bits and all refcounts live under
//! one mutex paired with a notify that is broadcast on every block
//! completion; sync bookkeeping lives under a second mutex; the stopping
//! flag and the in-flight prefetch count are plain atomics. At most one of
//! these is held at a time — paths needing two release the first before
//! taking the second.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tracing::{debug, error, instrument, trace, warn};

use crate::FileId;
use crate::block::Block;
use crate::cinfo::{BitField, InfoHeader, IoStatRecord};
use crate::config::CacheConfig;
use crate::error::{OpenError, ReadError, WriteBackError};
use crate::manager::CacheManager;
use crate::remote::RemoteRead;
use crate::stats::{IoStatSnapshot, IoStats};
use crate::storage::{OpenFlags, Storage, StorageHandle};

/// Cap on write attempts (short writes and `EINTR`) per block.
const WRITE_MAX_ATTEMPTS: u32 = 10;

/// Cadence of the close-path drain re-check.
const DRAIN_RECHECK: Duration = Duration::from_millis(10);

/// Overlap of block `idx` with the request `[req_off, req_off + req_size)`.
///
/// Returns `(user_off, blk_off, len)`: the offset into the user buffer, the
/// offset into the block, and the number of overlapping bytes. `None` when
/// the ranges do not intersect.
fn overlap(idx: u32, blk_size: u64, req_off: u64, req_size: usize) -> Option<(usize, usize, usize)> {
    let beg = u64::from(idx) * blk_size;
    let end = beg + blk_size;
    let req_end = req_off + req_size as u64;

    if req_off < end && req_end > beg {
        let ovlp_beg = beg.max(req_off);
        let ovlp_end = end.min(req_end);
        Some((
            (ovlp_beg - req_off) as usize,
            (ovlp_beg - beg) as usize,
            (ovlp_end - ovlp_beg) as usize,
        ))
    } else {
        None
    }
}

/// Everything guarded by the download mutex.
struct DownloadState {
    blocks: FxHashMap<u32, Block>,
    fetched: BitField,
    prefetch_bits: Option<BitField>,
}

/// Everything guarded by the sync mutex.
struct SyncState {
    in_sync: bool,
    non_flushed_cnt: u32,
    writes_during_sync: Vec<u32>,
    write_called: BitField,
}

/// One scatter-gather segment for [`CacheFile::read_vectored`].
pub struct ReadVec<'a> {
    /// File offset of this segment.
    pub offset: u64,
    /// Destination buffer; its length is the segment size.
    pub buf: &'a mut [u8],
}

pub(crate) struct FileInner {
    id: FileId,
    /// Self-handle for spawning fetch and flush tasks; always upgradable
    /// while a method runs.
    weak: Weak<FileInner>,
    path: PathBuf,
    manager: Arc<CacheManager>,
    remote: Arc<dyn RemoteRead>,
    data_file: Box<dyn StorageHandle>,
    info_file: Box<dyn StorageHandle>,

    buffer_size: u64,
    file_size: u64,
    n_blocks: u32,
    cfg: CacheConfig,

    state: Mutex<DownloadState>,
    download_notify: Notify,
    sync_state: Mutex<SyncState>,

    stopping: AtomicBool,
    prefetch_current: AtomicU32,
    prefetch_reads: AtomicU32,
    prefetch_hits: AtomicU32,

    stats: IoStats,
}

/// A cached view of one remote file.
pub struct CacheFile {
    inner: Arc<FileInner>,
}

impl CacheFile {
    /// Open (or re-open) the cache for `remote`, backed by `cache_path` on
    /// `storage`. Creates the data file and `<path>.cinfo` side-car as
    /// needed; an existing side-car's block size wins over the configured
    /// one. The file is registered with the prefetcher on success.
    pub async fn open(
        manager: Arc<CacheManager>,
        remote: Arc<dyn RemoteRead>,
        storage: &dyn Storage,
        cache_path: impl Into<PathBuf>,
    ) -> Result<Self, OpenError> {
        let path = cache_path.into();
        let cfg = manager.config().clone();

        storage
            .create(&path, 0o600, true)
            .await
            .map_err(OpenError::DataFile)?;
        let data_file = storage
            .open(&path, OpenFlags::READ | OpenFlags::WRITE, 0o600)
            .await
            .map_err(OpenError::DataFile)?;

        let info_path = info_path_for(&path);
        storage
            .create(&info_path, 0o600, true)
            .await
            .map_err(OpenError::InfoFile)?;
        let info_file = storage
            .open(&info_path, OpenFlags::READ | OpenFlags::WRITE, 0o600)
            .await
            .map_err(OpenError::InfoFile)?;

        let file_size = remote.size();
        let header = match InfoHeader::read(&*info_file)
            .await
            .map_err(OpenError::CorruptHeader)?
        {
            Some(header) => {
                debug!(path = %path.display(), "cache info read from disk");
                header
            }
            None => {
                let bs = cfg.buffer_size_bytes();
                let n_blocks = file_size.div_ceil(bs);
                debug!(
                    path = %path.display(),
                    file_size,
                    n_blocks,
                    "creating fresh cache info"
                );
                let header = InfoHeader::fresh(bs, n_blocks, cfg.prefetch);
                header
                    .write(&*info_file)
                    .await
                    .map_err(OpenError::InfoFile)?;
                header
            }
        };

        let buffer_size = header.buffer_size;
        let bit_count = header.fetched.len();
        let n_blocks = u32::try_from(bit_count).unwrap_or(u32::MAX);
        let prefetch_bits = header
            .prefetch
            .or_else(|| cfg.prefetch.then(|| BitField::new(bit_count)));

        let inner = Arc::new_cyclic(|weak| FileInner {
            id: manager.allocate_file_id(),
            weak: weak.clone(),
            path,
            manager: Arc::clone(&manager),
            remote,
            data_file,
            info_file,
            buffer_size,
            file_size,
            n_blocks,
            cfg,
            state: Mutex::new(DownloadState {
                blocks: FxHashMap::default(),
                fetched: header.fetched,
                prefetch_bits,
            }),
            download_notify: Notify::new(),
            sync_state: Mutex::new(SyncState {
                in_sync: false,
                non_flushed_cnt: 0,
                writes_during_sync: Vec::new(),
                write_called: header.write_called,
            }),
            stopping: AtomicBool::new(false),
            prefetch_current: AtomicU32::new(0),
            prefetch_reads: AtomicU32::new(0),
            prefetch_hits: AtomicU32::new(0),
            stats: IoStats::default(),
        });

        manager.register_prefetch_file(&inner);
        Ok(Self { inner })
    }

    /// Read `buf.len()` bytes at `offset` into `buf`, returning the number
    /// of bytes read. The result is short only at EOF.
    #[instrument(name = "CacheFile::read", skip(self, buf), fields(file = self.inner.id, len = buf.len()))]
    pub async fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, ReadError> {
        self.inner.read(offset, buf).await
    }

    /// Scatter-gather read: each segment is served by a scalar [`read`].
    ///
    /// [`read`]: Self::read
    pub async fn read_vectored(&self, iov: &mut [ReadVec<'_>]) -> Result<usize, ReadError> {
        let mut total = 0;
        for seg in iov {
            total += self.inner.read(seg.offset, seg.buf).await?;
        }
        Ok(total)
    }

    /// One prefetch round: fetch the lowest block that is neither on disk
    /// nor resident, if the RAM budget allows and fewer than the configured
    /// number of blocks are resident.
    pub async fn prefetch(&self) {
        self.inner.mark_prefetch();
        self.inner.prefetch().await;
    }

    /// Ratio of prefetched blocks later consumed by reads.
    #[must_use]
    pub fn prefetch_score(&self) -> f32 {
        self.inner.prefetch_score()
    }

    /// Begin shutting the file down: deregister from the prefetcher and
    /// stop accepting new write-backs. Returns `true` when the caller
    /// should delay the final [`close`] because the cache is not complete.
    ///
    /// [`close`]: Self::close
    pub fn initiate_close(&self) -> bool {
        self.inner.initiate_close()
    }

    /// Drain the file and persist its state: drop queued write-backs, wait
    /// for in-flight blocks, run a final flush when anything is unflushed,
    /// and append the IO-stat record. I/O errors on this path are logged,
    /// not surfaced. [`initiate_close`] must have been called.
    ///
    /// [`initiate_close`]: Self::initiate_close
    pub async fn close(self) {
        self.inner.close().await;
    }

    /// Byte counters for this file.
    #[must_use]
    pub fn stats(&self) -> IoStatSnapshot {
        self.inner.stats.snapshot()
    }

    /// Whether every block is persisted to the local image.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.inner.state().fetched.is_full()
    }

    /// Number of blocks currently persisted to the local image.
    #[must_use]
    pub fn fetched_blocks(&self) -> u64 {
        self.inner.state().fetched.count_set()
    }

    /// Block size of the cache image.
    #[must_use]
    pub fn buffer_size(&self) -> u64 {
        self.inner.buffer_size
    }
}

fn info_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".cinfo");
    PathBuf::from(os)
}

impl FileInner {
    pub(crate) fn id(&self) -> FileId {
        self.id
    }

    fn arc(&self) -> Arc<Self> {
        self.weak
            .upgrade()
            .unwrap_or_else(|| unreachable!("FileInner method running without a strong reference"))
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    fn state(&self) -> MutexGuard<'_, DownloadState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sync_state(&self) -> MutexGuard<'_, SyncState> {
        self.sync_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Offset and size of block `idx`; the trailing block is short.
    fn block_extent(&self, idx: u32) -> (u64, usize) {
        let off = u64::from(idx) * self.buffer_size;
        let len = self.buffer_size.min(self.file_size.saturating_sub(off)) as usize;
        (off, len)
    }

    /// Drop one reference; a finished block at refcount zero leaves the map
    /// and returns its RAM grant.
    fn dec_ref_locked(&self, st: &mut DownloadState, idx: u32) {
        let Some(b) = st.blocks.get_mut(&idx) else {
            debug_assert!(false, "dec_ref on absent block {idx}");
            return;
        };
        debug_assert!(b.refcnt > 0, "refcount underflow on block {idx}");
        b.refcnt -= 1;
        if b.refcnt == 0 && b.is_finished() {
            trace!(file = self.id, idx, "erasing finished block");
            st.blocks.remove(&idx);
            self.manager.ram().release();
            self.download_notify.notify_waiters();
        }
    }

    pub(crate) fn release_write_ref(&self, idx: u32) {
        let mut st = self.state();
        self.dec_ref_locked(&mut st, idx);
    }

    /// Issue the remote read for block `idx`, retrying per the configured
    /// policy, and route the single-shot completion back to the map.
    fn spawn_fetch(&self, idx: u32, off: u64, len: usize) {
        let file = self.arc();
        tokio::spawn(async move {
            let mut attempt = 1u32;
            loop {
                match file.remote.read_at(off, len).await {
                    Ok(bytes) => {
                        file.complete_block(idx, bytes);
                        return;
                    }
                    Err(e) if attempt <= file.cfg.block_retry_limit => {
                        let backoff = Duration::from_millis(
                            file.cfg.block_retry_backoff_ms << (attempt - 1).min(10),
                        );
                        warn!(
                            file = file.id,
                            idx,
                            attempt,
                            errno = e.errno,
                            backoff_ms = backoff.as_millis() as u64,
                            "block fetch failed, retrying"
                        );
                        attempt += 1;
                        tokio::time::sleep(backoff).await;
                    }
                    Err(e) => {
                        error!(file = file.id, idx, errno = e.errno, "block fetch failed");
                        file.fail_block(idx, e.errno);
                        return;
                    }
                }
            }
        });
    }

    /// Remote read for `idx` succeeded: publish the bytes and, unless the
    /// file is stopping, hand the block to the write-back queue under its
    /// own reference.
    fn complete_block(&self, idx: u32, bytes: Bytes) {
        let enqueue = {
            let mut st = self.state();
            let Some(b) = st.blocks.get_mut(&idx) else {
                return;
            };
            b.downloaded = true;
            b.buf = bytes;
            if self.is_stopping() {
                false
            } else {
                b.refcnt += 1;
                true
            }
        };
        self.download_notify.notify_waiters();
        if enqueue {
            self.manager.add_write_task(self.arc(), idx);
        }
    }

    /// Remote read for `idx` failed for good: park the errno on the block
    /// and keep it resident so repeat readers observe the failure.
    fn fail_block(&self, idx: u32, errno: i32) {
        {
            let mut st = self.state();
            let Some(b) = st.blocks.get_mut(&idx) else {
                return;
            };
            b.errno = errno;
            b.refcnt += 1;
        }
        self.download_notify.notify_waiters();
    }

    async fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, ReadError> {
        if offset >= self.file_size || buf.is_empty() {
            return Ok(0);
        }
        let size = (buf.len() as u64).min(self.file_size - offset) as usize;
        let bs = self.buffer_size;

        let idx_first = (offset / bs) as u32;
        let idx_last = ((offset + size as u64 - 1) / bs) as u32;

        let mut to_process: Vec<u32> = Vec::new();
        let mut on_disk: Vec<u32> = Vec::new();
        let mut direct: Vec<u32> = Vec::new();
        let mut to_fetch: Vec<(u32, u64, usize)> = Vec::new();

        // Classify every touched block under the download lock.
        {
            let mut st = self.state();
            for idx in idx_first..=idx_last {
                let Some((_, _, ov_len)) = overlap(idx, bs, offset, size) else {
                    continue;
                };
                let ov_len = ov_len as u64;

                if let Some(b) = st.blocks.get_mut(&idx) {
                    // In RAM or incoming (possibly failed; the error is
                    // surfaced when the block is reaped below).
                    b.refcnt += 1;
                    to_process.push(idx);
                    self.stats.add_ram(ov_len);
                } else if st.fetched.test(idx) {
                    on_disk.push(idx);
                    self.stats.add_disk(ov_len);
                } else if self.manager.ram().try_grant() {
                    let (b_off, b_len) = self.block_extent(idx);
                    let mut block = Block::new(b_off, b_len, false);
                    block.refcnt = 1;
                    st.blocks.insert(idx, block);
                    to_fetch.push((idx, b_off, b_len));
                    to_process.push(idx);
                    self.stats.add_ram(ov_len);
                } else {
                    direct.push(idx);
                    self.stats.add_missed(ov_len);
                }
            }
        }
        for (idx, b_off, b_len) in to_fetch {
            self.spawn_fetch(idx, b_off, b_len);
        }

        let mut bytes_read = 0usize;
        let mut failure: Option<ReadError> = None;

        // First, send out any direct requests.
        let mut direct_tasks = Vec::with_capacity(direct.len());
        for idx in direct {
            let Some((user_off, blk_off, len)) = overlap(idx, bs, offset, size) else {
                continue;
            };
            let remote = Arc::clone(&self.remote);
            let abs = u64::from(idx) * bs + blk_off as u64;
            direct_tasks.push((
                user_off,
                len,
                tokio::spawn(async move { remote.read_at(abs, len).await }),
            ));
        }

        // Second, read blocks from disk.
        for idx in on_disk {
            let Some((user_off, blk_off, len)) = overlap(idx, bs, offset, size) else {
                continue;
            };
            let abs = u64::from(idx) * bs + blk_off as u64;
            match self.data_file.read_at(abs, len).await {
                Ok(bytes) if bytes.len() == len => {
                    buf[user_off..user_off + len].copy_from_slice(&bytes);
                    bytes_read += len;
                    self.check_prefetch_stat_disk(idx);
                }
                Ok(_) => {
                    error!(file = self.id, idx, "short read from cache image");
                    failure = Some(ReadError::Disk(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "short read from cache image",
                    )));
                    break;
                }
                Err(e) => {
                    error!(file = self.id, idx, error = ?e, "failed to read from disk");
                    failure = Some(ReadError::Disk(e));
                    break;
                }
            }
        }

        // Third, wait for and copy out blocks that are resident or incoming.
        let mut processed: Vec<u32> = Vec::new();
        while !to_process.is_empty() && failure.is_none() {
            let notified = self.download_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // (idx, Ok((user_off, blk_off, len, payload, was_prefetch)) | Err(errno))
            type Finished = (u32, Result<(usize, usize, usize, Bytes, bool), i32>);
            let mut finished: Vec<Finished> = Vec::new();
            {
                let st = self.state();
                to_process.retain(|&idx| {
                    let Some(b) = st.blocks.get(&idx) else {
                        debug_assert!(false, "referenced block {idx} vanished");
                        return false;
                    };
                    if !b.is_finished() {
                        return true;
                    }
                    if b.is_ok() {
                        if let Some((user_off, blk_off, len)) = overlap(idx, bs, offset, size) {
                            finished
                                .push((idx, Ok((user_off, blk_off, len, b.buf.clone(), b.prefetch))));
                        }
                    } else {
                        finished.push((idx, Err(b.errno)));
                    }
                    false
                });
            }

            if finished.is_empty() {
                notified.await;
                continue;
            }

            for (idx, _) in &finished {
                processed.push(*idx);
            }
            for (_, res) in finished {
                if failure.is_some() {
                    // Stop copying but keep draining so every reference is
                    // released below.
                    continue;
                }
                match res {
                    Ok((user_off, blk_off, len, payload, was_prefetch)) => {
                        buf[user_off..user_off + len].copy_from_slice(&payload[blk_off..blk_off + len]);
                        bytes_read += len;
                        if was_prefetch {
                            self.record_prefetch_hit();
                        }
                    }
                    Err(errno) => {
                        error!(file = self.id, errno, "block finished with error");
                        failure = Some(ReadError::BlockFetch { errno });
                    }
                }
            }
        }

        // Fourth, make sure all direct requests have arrived.
        for (user_off, len, task) in direct_tasks {
            match task.await {
                Ok(Ok(bytes)) => {
                    if failure.is_none() {
                        let n = bytes.len().min(len);
                        buf[user_off..user_off + n].copy_from_slice(&bytes[..n]);
                        bytes_read += n;
                    }
                }
                Ok(Err(e)) => {
                    if failure.is_none() {
                        failure = Some(ReadError::BlockFetch { errno: e.errno });
                    }
                }
                Err(e) => {
                    error!(file = self.id, error = ?e, "direct read task failed");
                    if failure.is_none() {
                        failure = Some(ReadError::BlockFetch { errno: libc::EIO });
                    }
                }
            }
        }

        // Last, release every block we touched. `to_process` is non-empty
        // only when we bailed out with an error.
        {
            let mut st = self.state();
            for idx in processed.into_iter().chain(to_process) {
                self.dec_ref_locked(&mut st, idx);
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(bytes_read),
        }
    }

    async fn write_fully(&self, off: u64, data: Bytes) -> Result<(), WriteBackError> {
        let mut written = 0usize;
        let mut attempts = 0u32;
        while written < data.len() {
            attempts += 1;
            if attempts > WRITE_MAX_ATTEMPTS {
                return Err(WriteBackError::RetriesExhausted {
                    attempts: attempts - 1,
                });
            }
            match self
                .data_file
                .write_at(off + written as u64, data.slice(written..))
                .await
            {
                Ok(n) => {
                    written += n;
                    if written < data.len() {
                        warn!(
                            file = self.id,
                            attempt = attempts,
                            remaining = data.len() - written,
                            "short write, reattempting"
                        );
                    }
                }
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => {}
                Err(e) => return Err(WriteBackError::Disk(e)),
            }
        }
        Ok(())
    }

    /// Persist block `idx`, mark it fetched, drop the write reference and
    /// update the flush bookkeeping. Runs on the manager's writer task.
    pub(crate) async fn write_block_to_disk(&self, idx: u32) {
        let snapshot = {
            let st = self.state();
            st.blocks.get(&idx).map(|b| (b.offset, b.buf.clone(), b.prefetch))
        };
        let Some((off, data, was_prefetch)) = snapshot else {
            debug_assert!(false, "write-back for absent block {idx}");
            return;
        };

        if let Err(e) = self.write_fully(off, data).await {
            error!(file = self.id, idx, error = %e, "write-back failed, block not persisted");
            self.release_write_ref(idx);
            return;
        }
        trace!(file = self.id, idx, "block persisted");

        {
            let mut st = self.state();
            st.fetched.set(idx);
            if was_prefetch && let Some(p) = st.prefetch_bits.as_mut() {
                p.set(idx);
            }
            self.dec_ref_locked(&mut st, idx);
        }

        // The completeness check needs the download lock; take it before the
        // sync mutex, never together.
        let complete = self.state().fetched.is_full();
        let schedule = {
            let mut ss = self.sync_state();
            if ss.in_sync {
                ss.writes_during_sync.push(idx);
            } else {
                ss.write_called.set(idx);
                ss.non_flushed_cnt += 1;
            }

            if ss.non_flushed_cnt >= self.cfg.flush_threshold_blocks
                && (!self.cfg.flush_only_when_complete || complete)
                && ss.non_flushed_cnt > 0
            {
                ss.in_sync = true;
                ss.non_flushed_cnt = 0;
                true
            } else {
                false
            }
        };

        if schedule {
            let file = self.arc();
            tokio::spawn(async move {
                file.sync().await;
            });
        }
    }

    /// Flush the data file and side-car header. Indices written back while
    /// the flush runs are promoted into `write_called` afterwards.
    pub(crate) async fn sync(&self) {
        debug!(file = self.id, path = %self.path.display(), "sync");
        if let Err(e) = self.data_file.fsync().await {
            warn!(file = self.id, error = ?e, "data file fsync failed");
        }

        let header = self.assemble_header();
        if let Err(e) = header.write(&*self.info_file).await {
            warn!(file = self.id, error = ?e, "info header write failed");
        }

        let written_while_in_sync = {
            let mut ss = self.sync_state();
            let deferred = std::mem::take(&mut ss.writes_during_sync);
            for i in &deferred {
                ss.write_called.set(*i);
            }
            ss.non_flushed_cnt = deferred.len() as u32;
            ss.in_sync = false;
            deferred.len()
        };
        trace!(file = self.id, written_while_in_sync, "sync finished");

        if let Err(e) = self.info_file.fsync().await {
            warn!(file = self.id, error = ?e, "info file fsync failed");
        }
    }

    fn assemble_header(&self) -> InfoHeader {
        let (fetched, prefetch) = {
            let st = self.state();
            (st.fetched.clone(), st.prefetch_bits.clone())
        };
        let write_called = self.sync_state().write_called.clone();
        InfoHeader {
            buffer_size: self.buffer_size,
            fetched,
            write_called,
            prefetch,
        }
    }

    pub(crate) fn mark_prefetch(&self) {
        self.prefetch_current.fetch_add(1, Ordering::AcqRel);
    }

    fn unmark_prefetch(&self) {
        self.prefetch_current.fetch_sub(1, Ordering::AcqRel);
    }

    /// One prefetch round; see [`CacheFile::prefetch`].
    pub(crate) async fn prefetch(&self) {
        if self.is_stopping() {
            self.unmark_prefetch();
            return;
        }

        let mut deregister = false;
        let mut fetch: Option<(u32, u64, usize)> = None;
        {
            let mut st = self.state();
            if st.fetched.is_full() {
                deregister = true;
            } else if st.blocks.len() < self.cfg.prefetch_max_resident {
                let candidate =
                    (0..self.n_blocks).find(|&i| !st.fetched.test(i) && !st.blocks.contains_key(&i));
                match candidate {
                    Some(i) if self.manager.ram().try_grant() => {
                        let (off, len) = self.block_extent(i);
                        st.blocks.insert(i, Block::new(off, len, true));
                        fetch = Some((i, off, len));
                        self.prefetch_reads.fetch_add(1, Ordering::Relaxed);
                    }
                    Some(_) => {} // No RAM this round; try again later.
                    None => deregister = true,
                }
            }
        }

        if let Some((i, off, len)) = fetch {
            trace!(file = self.id, idx = i, "prefetching block");
            self.spawn_fetch(i, off, len);
        }
        if deregister {
            debug!(file = self.id, "file complete, leaving prefetch registry");
            self.manager.deregister_prefetch_file(self.id);
        }
        self.unmark_prefetch();
    }

    fn check_prefetch_stat_disk(&self, idx: u32) {
        if !self.cfg.prefetch {
            return;
        }
        let hit = {
            let st = self.state();
            st.prefetch_bits.as_ref().is_some_and(|p| p.test(idx))
        };
        if hit {
            self.prefetch_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_prefetch_hit(&self) {
        if self.cfg.prefetch {
            self.prefetch_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn prefetch_score(&self) -> f32 {
        let reads = self.prefetch_reads.load(Ordering::Relaxed);
        if reads == 0 {
            return 1.0;
        }
        self.prefetch_hits.load(Ordering::Relaxed) as f32 / reads as f32
    }

    fn initiate_close(&self) -> bool {
        debug!(file = self.id, "initiate close");
        self.manager.deregister_prefetch_file(self.id);
        self.stopping.store(true, Ordering::Release);
        !self.state().fetched.is_full()
    }

    async fn close(&self) {
        debug_assert!(self.is_stopping(), "initiate_close must precede close");

        self.manager.remove_write_entries_for(self).await;

        // Drain the map: sweep finished blocks that hold at most the
        // keep-resident reference, then wait for in-flight ones. The notify
        // fires whenever a refcount reaches zero; the timeout covers the
        // prefetch-count edge, which has no notify of its own.
        loop {
            let notified = self.download_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.prefetch_current.load(Ordering::Acquire) == 0 {
                let remaining = {
                    let mut st = self.state();
                    let mut released = 0u32;
                    st.blocks.retain(|_, b| {
                        if b.is_finished() && b.refcnt <= 1 {
                            released += 1;
                            false
                        } else {
                            true
                        }
                    });
                    for _ in 0..released {
                        self.manager.ram().release();
                    }
                    st.blocks.len()
                };
                if remaining == 0 {
                    break;
                }
                trace!(file = self.id, remaining, "close waiting on block map");
            }
            drop(tokio::time::timeout(DRAIN_RECHECK, notified).await);
        }

        let do_sync = {
            let mut ss = self.sync_state();
            if ss.non_flushed_cnt > 0 || !ss.writes_during_sync.is_empty() {
                ss.in_sync = true;
                true
            } else {
                false
            }
        };
        if do_sync {
            self.sync().await;
        }

        self.append_io_stats().await;
        debug!(
            file = self.id,
            score = self.prefetch_score(),
            "closed"
        );
        // Both storage handles close on drop with the last reference.
    }

    async fn append_io_stats(&self) {
        let record = IoStatRecord {
            detach_time_secs: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            stats: self.stats.snapshot(),
        };
        if let Err(e) = record.append(&*self.info_file).await {
            warn!(file = self.id, error = ?e, "failed to append IO stats");
        }
    }
}

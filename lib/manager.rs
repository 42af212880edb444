//! Process-wide cache services.
//!
//! One [`CacheManager`] is constructed per process and threaded through
//! every [`crate::file::CacheFile`]: it owns the RAM admission broker, the
//! global FIFO write-back queue with its writer task, and the prefetch
//! registry with the pump that drives registered files. There are no
//! implicit globals; embedders decide the manager's lifetime.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::FileId;
use crate::config::CacheConfig;
use crate::file::FileInner;
use crate::ram::RamBroker;

/// One queued write-back: persist block `idx` of `file`.
struct WriteTask {
    file: Arc<FileInner>,
    idx: u32,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Process-wide cache service state.
pub struct CacheManager {
    cfg: CacheConfig,
    ram: RamBroker,

    write_q: Mutex<VecDeque<WriteTask>>,
    write_notify: Notify,
    /// File currently being written back, so a closing file can wait out an
    /// in-flight write instead of racing it.
    writing: Mutex<Option<FileId>>,
    writing_done: Notify,

    prefetch_files: scc::HashMap<FileId, Weak<FileInner>>,

    next_file_id: AtomicU64,
    shutdown: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheManager {
    /// Create the manager and spawn its worker tasks on the current runtime.
    #[must_use]
    pub fn new(cfg: CacheConfig) -> Arc<Self> {
        let ram = RamBroker::new(cfg.ram_blocks);
        let prefetch_enabled = cfg.prefetch;
        let mgr = Arc::new(Self {
            cfg,
            ram,
            write_q: Mutex::new(VecDeque::new()),
            write_notify: Notify::new(),
            writing: Mutex::new(None),
            writing_done: Notify::new(),
            prefetch_files: scc::HashMap::default(),
            next_file_id: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = vec![tokio::spawn(Self::write_loop(Arc::clone(&mgr)))];
        if prefetch_enabled {
            tasks.push(tokio::spawn(Self::prefetch_loop(Arc::clone(&mgr))));
        }
        *lock(&mgr.tasks) = tasks;

        mgr
    }

    /// The configuration this manager and its files run with.
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.cfg
    }

    /// The process-wide RAM admission broker.
    #[must_use]
    pub fn ram(&self) -> &RamBroker {
        &self.ram
    }

    pub(crate) fn allocate_file_id(&self) -> FileId {
        self.next_file_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Enqueue a write-back for block `idx` of `file`. The caller has
    /// already taken the write reference on the block.
    pub(crate) fn add_write_task(&self, file: Arc<FileInner>, idx: u32) {
        trace!(file = file.id(), idx, "enqueue write-back");
        lock(&self.write_q).push_back(WriteTask { file, idx });
        self.write_notify.notify_one();
    }

    /// Drop every queued write-back for `file`, releasing each task's write
    /// reference, and wait until any write currently in flight for `file`
    /// has finished.
    pub(crate) async fn remove_write_entries_for(&self, file: &FileInner) {
        let removed: Vec<u32> = {
            let mut q = lock(&self.write_q);
            let mut kept = VecDeque::with_capacity(q.len());
            let mut removed = Vec::new();
            for task in q.drain(..) {
                if task.file.id() == file.id() {
                    removed.push(task.idx);
                } else {
                    kept.push_back(task);
                }
            }
            *q = kept;
            removed
        };
        for idx in &removed {
            file.release_write_ref(*idx);
        }
        if !removed.is_empty() {
            debug!(file = file.id(), count = removed.len(), "dropped queued write-backs");
        }

        loop {
            let notified = self.writing_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if *lock(&self.writing) != Some(file.id()) {
                break;
            }
            notified.await;
        }
    }

    /// Make `file` eligible for the prefetch pump.
    pub(crate) fn register_prefetch_file(&self, file: &Arc<FileInner>) {
        drop(
            self.prefetch_files
                .insert(file.id(), Arc::downgrade(file)),
        );
    }

    /// Remove `file` from the prefetch registry.
    pub(crate) fn deregister_prefetch_file(&self, id: FileId) {
        drop(self.prefetch_files.remove(&id));
    }

    /// Stop the worker tasks and wait for them to exit. Queued write-backs
    /// are drained first.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.write_notify.notify_waiters();
        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for task in tasks {
            drop(task.await);
        }
    }

    async fn write_loop(mgr: Arc<Self>) {
        loop {
            let notified = mgr.write_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // Mark the file as in-write under the queue lock, so a closing
            // file either sees its task still queued or sees it in flight.
            let task = {
                let mut q = lock(&mgr.write_q);
                let task = q.pop_front();
                if let Some(task) = &task {
                    *lock(&mgr.writing) = Some(task.file.id());
                }
                task
            };
            match task {
                Some(task) => {
                    task.file.write_block_to_disk(task.idx).await;
                    *lock(&mgr.writing) = None;
                    mgr.writing_done.notify_waiters();
                }
                None => {
                    if mgr.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    notified.await;
                }
            }
        }
    }

    /// Repeatedly pick the registered file with the best prefetch score and
    /// give it one prefetch round.
    async fn prefetch_loop(mgr: Arc<Self>) {
        let interval = Duration::from_millis(mgr.cfg.prefetch_interval_ms);
        while !mgr.shutdown.load(Ordering::Acquire) {
            tokio::time::sleep(interval).await;

            let mut best: Option<(f32, Arc<FileInner>)> = None;
            mgr.prefetch_files
                .scan_async(|_, weak| {
                    if let Some(file) = weak.upgrade()
                        && !file.is_stopping()
                    {
                        let score = file.prefetch_score();
                        if best.as_ref().is_none_or(|(s, _)| score > *s) {
                            best = Some((score, file));
                        }
                    }
                })
                .await;

            if let Some((_, file)) = best {
                file.mark_prefetch();
                file.prefetch().await;
            }
        }
    }
}

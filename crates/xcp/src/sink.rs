//! FIFO sink between the source workers and the consumer.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::chunk::ChunkInfo;

/// Thread-safe FIFO of completed chunks. Producers push from the worker
/// tasks; the single consumer pops through
/// [`XcpCtx::get_chunk`](crate::XcpCtx::get_chunk). Undelivered chunks are
/// dropped with the sink.
#[derive(Debug, Default)]
pub(crate) struct ChunkSink {
    q: Mutex<VecDeque<ChunkInfo>>,
}

impl ChunkSink {
    fn lock(&self) -> MutexGuard<'_, VecDeque<ChunkInfo>> {
        self.q.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn put(&self, chunk: ChunkInfo) {
        self.lock().push_back(chunk);
    }

    pub(crate) fn get(&self) -> Option<ChunkInfo> {
        self.lock().pop_front()
    }
}

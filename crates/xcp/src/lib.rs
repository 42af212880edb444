//! Multi-source accelerated copy ("extreme copy").
//!
//! An [`XcpCtx`] partitions one logical file into blocks, hands the blocks
//! to several replica workers running in parallel, steals work back from
//! slow replicas, and feeds completed chunks through a FIFO sink to a
//! single consumer that reassembles the ordered byte stream.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # async fn demo(opener: Arc<dyn xcp::ReplicaOpener>) {
//! let urls = vec!["root://a/f".into(), "root://b/f".into()];
//! let ctx = xcp::XcpCtx::new(urls, xcp::XcpConfig::default(), None);
//! ctx.initialize(opener).unwrap();
//! loop {
//!     match ctx.get_chunk() {
//!         xcp::ChunkStatus::Continue(_chunk) => { /* write the chunk out */ }
//!         xcp::ChunkStatus::Retry => {
//!             ctx.all_done().await;
//!         }
//!         xcp::ChunkStatus::Done => break,
//!         xcp::ChunkStatus::NoMoreReplicas => panic!("copy failed"),
//!     }
//! }
//! # }
//! ```

mod chunk;
mod ctx;
mod sink;
mod source;

pub use chunk::ChunkInfo;
pub use ctx::{ChunkStatus, InitError, XcpConfig, XcpCtx};
pub use source::ReplicaOpener;

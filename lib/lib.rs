//! Block-oriented read-through disk cache for remote files.
//!
//! A [`file::CacheFile`] satisfies random reads against a remote file by
//! demand-fetching fixed-size blocks, persisting completed blocks to a local
//! on-disk image with a `<path>.cinfo` side-car index, sharing in-flight
//! blocks across concurrent readers, prefetching speculatively under a
//! process-wide RAM budget, and flushing asynchronously.
//!
//! The remote transport, the POSIX shim in front, and on-disk cache eviction
//! all live behind the seams declared in [`remote`], [`storage`] and
//! [`manager`].

pub mod block;
pub mod cinfo;
pub mod config;
pub mod error;
pub mod file;
pub mod manager;
pub mod ram;
pub mod remote;
pub mod stats;
pub mod storage;

/// Process-unique identifier of an open cache file.
pub type FileId = u64;

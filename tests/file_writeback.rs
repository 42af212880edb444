#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::{MockRemote, ShortWriteStorage, new_manager, pattern, test_config, wait_until};
use filecache::cinfo::InfoHeader;
use filecache::config::CacheConfig;
use filecache::file::CacheFile;
use filecache::storage::{LocalFs, OpenFlags, Storage as _};

const BS: u64 = 64 * 1024;

async fn read_header(root: &Path, rel: &str) -> Option<InfoHeader> {
    let fs = LocalFs::new(root);
    let handle = fs
        .open(Path::new(rel), OpenFlags::READ, 0o600)
        .await
        .ok()?;
    InfoHeader::read(&*handle).await.ok()?
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn short_writes_are_retried_until_the_block_lands() {
    let tmp = tempfile::tempdir().unwrap();
    let storage = ShortWriteStorage::new(LocalFs::new(tmp.path()), 5);
    let manager = new_manager(test_config(BS, 256));

    let data = pattern((3 * BS) as usize);
    let remote = Arc::new(MockRemote::new(data.clone()));

    let file = CacheFile::open(Arc::clone(&manager), Arc::clone(&remote) as Arc<dyn filecache::remote::RemoteRead>, &storage, "d/f1")
        .await
        .unwrap();

    let mut buf = vec![0u8; data.len()];
    file.read(0, &mut buf).await.unwrap();
    wait_until("all blocks written", || file.is_complete()).await;

    // Serve the whole file from disk and verify the image is intact even
    // though the first writes were short.
    let mut from_disk = vec![0u8; data.len()];
    let n = file.read(0, &mut from_disk).await.unwrap();
    assert_eq!(n, data.len());
    assert_eq!(&from_disk[..], &data[..]);
    assert_eq!(file.stats().bytes_disk, 3 * BS);

    file.initiate_close();
    file.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn flushes_are_deferred_until_the_file_is_complete() {
    let tmp = tempfile::tempdir().unwrap();
    let storage = LocalFs::new(tmp.path());
    let manager = new_manager(CacheConfig {
        buffer_size: bytesize::ByteSize::b(BS),
        flush_threshold_blocks: 1,
        flush_only_when_complete: true,
        ..CacheConfig::default()
    });

    let data = pattern((4 * BS) as usize);
    let remote = Arc::new(MockRemote::new(data.clone()));

    let file = CacheFile::open(Arc::clone(&manager), Arc::clone(&remote) as Arc<dyn filecache::remote::RemoteRead>, &storage, "d/f2")
        .await
        .unwrap();

    // Fetch half the file; the threshold is 1 but completion gates the
    // flush, so the on-disk header must stay untouched.
    let mut buf = vec![0u8; (2 * BS) as usize];
    file.read(0, &mut buf).await.unwrap();
    wait_until("two blocks written", || file.fetched_blocks() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let header = read_header(tmp.path(), "d/f2.cinfo").await.unwrap();
    assert_eq!(header.write_called.count_set(), 0);

    // Finish the file; the final write-back schedules the flush.
    let mut rest = vec![0u8; (2 * BS) as usize];
    file.read(2 * BS, &mut rest).await.unwrap();
    wait_until("file complete", || file.is_complete()).await;

    let mut flushed = false;
    for _ in 0..200 {
        if let Some(h) = read_header(tmp.path(), "d/f2.cinfo").await
            && h.fetched.is_full()
        {
            flushed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(flushed, "async flush never updated the side-car header");

    file.initiate_close();
    file.close().await;

    // After close every write is recorded exactly once.
    let header = read_header(tmp.path(), "d/f2.cinfo").await.unwrap();
    assert!(header.fetched.is_full());
    assert!(header.write_called.is_full());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reopened_cache_serves_entirely_from_disk() {
    let tmp = tempfile::tempdir().unwrap();
    let data = pattern((5 * BS) as usize);

    {
        let storage = LocalFs::new(tmp.path());
        let manager = new_manager(test_config(BS, 256));
        let remote = Arc::new(MockRemote::new(data.clone()));
        let file = CacheFile::open(Arc::clone(&manager), remote, &storage, "d/f3")
            .await
            .unwrap();

        let mut buf = vec![0u8; data.len()];
        file.read(0, &mut buf).await.unwrap();
        wait_until("file complete", || file.is_complete()).await;
        file.initiate_close();
        file.close().await;
    }

    // A fresh process: new manager, new remote. Nothing is fetched again.
    let storage = LocalFs::new(tmp.path());
    let manager = new_manager(test_config(BS, 256));
    let remote = Arc::new(MockRemote::new(data.clone()));
    let file = CacheFile::open(Arc::clone(&manager), Arc::clone(&remote) as Arc<dyn filecache::remote::RemoteRead>, &storage, "d/f3")
        .await
        .unwrap();

    assert!(file.is_complete());
    let mut buf = vec![0u8; data.len()];
    let n = file.read(0, &mut buf).await.unwrap();
    assert_eq!(n, data.len());
    assert_eq!(&buf[..], &data[..]);
    assert_eq!(remote.read_count(), 0);
    assert_eq!(file.stats().bytes_disk, 5 * BS);

    file.initiate_close();
    file.close().await;
}

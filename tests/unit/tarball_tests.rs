#[path = "../common/mod.rs"]
mod common;

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use walvault::bundle::new_header;
use walvault::compress::{decrypt_and_decompress, CompressionMethod};
use walvault::logging::MetricsSink;
use walvault::storage::memory::MemoryFolder;
use walvault::storage::Folder;
use walvault::sync::CancelToken;
use walvault::tarball::{TarBallMaker, TarBallQueue};
use walvault::upload::Uploader;
use walvault::Error;

fn stream_queue(
    folder: &MemoryFolder,
    threshold: u64,
    cancel: CancelToken,
) -> (Arc<Uploader>, TarBallQueue) {
    let uploader = Uploader::new(
        Arc::new(folder.clone()),
        CompressionMethod::Lz4,
        None,
        MetricsSink::new_shared(),
    );
    let queue = TarBallQueue::new(
        TarBallMaker::Stream {
            uploader: Arc::clone(&uploader),
        },
        2,
        threshold,
        cancel,
    )
    .unwrap();
    (uploader, queue)
}

fn pack_file(queue: &TarBallQueue, name: &str, body: &[u8]) {
    let mut ball = queue.dequeue().unwrap();
    let mut header = new_header(tar::EntryType::Regular, body.len() as u64, 0o600, 0);
    ball.append_regular(&mut header, Path::new(name), &mut &body[..])
        .unwrap();
    queue.enqueue_back(ball).unwrap();
}

fn partition_entries(folder: &MemoryFolder, object: &str) -> Vec<(String, Vec<u8>)> {
    let raw = folder.get_object(object).unwrap();
    let plain = decrypt_and_decompress(raw, CompressionMethod::Lz4, None).unwrap();
    let mut archive = tar::Archive::new(plain);
    archive
        .entries()
        .unwrap()
        .map(|entry| {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            let mut body = Vec::new();
            entry.read_to_end(&mut body).unwrap();
            (name, body)
        })
        .collect()
}

#[test]
fn small_files_share_one_partition() {
    let folder = MemoryFolder::new();
    let (_uploader, queue) = stream_queue(&folder, 1 << 20, CancelToken::new());

    pack_file(&queue, "base/1/16384", &[1u8; 4000]);
    pack_file(&queue, "base/1/16385", &[2u8; 4000]);
    queue.close_all().unwrap();

    let names = folder.object_names();
    assert_eq!(names, vec!["tar_partitions/part_001.tar.lz4"]);

    let entries = partition_entries(&folder, "tar_partitions/part_001.tar.lz4");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].0, "base/1/16384");
    assert_eq!(entries[0].1, vec![1u8; 4000]);
    assert_eq!(entries[1].1, vec![2u8; 4000]);
}

#[test]
fn crossing_the_threshold_cuts_the_partition() {
    let folder = MemoryFolder::new();
    // Threshold below one file: every enqueue-back cuts.
    let (_uploader, queue) = stream_queue(&folder, 16 * 1024, CancelToken::new());

    pack_file(&queue, "a", &[1u8; 40_000]);
    pack_file(&queue, "b", &[2u8; 40_000]);
    queue.close_all().unwrap();

    let names = folder.object_names();
    assert_eq!(
        names,
        vec![
            "tar_partitions/part_001.tar.lz4",
            "tar_partitions/part_002.tar.lz4",
        ]
    );
    // Cut size stays below threshold plus the one file that crossed it.
    for name in names {
        let entries = partition_entries(&folder, &name);
        assert_eq!(entries.len(), 1);
        let tar_bytes: usize = entries.iter().map(|(_, b)| b.len() + 512).sum();
        assert!(tar_bytes as u64 <= 16 * 1024 + 41_000);
    }
}

#[test]
fn unopened_partitions_leave_no_objects() {
    let folder = MemoryFolder::new();
    let (_uploader, queue) = stream_queue(&folder, 1 << 20, CancelToken::new());
    queue.close_all().unwrap();
    assert!(folder.object_names().is_empty());
}

#[test]
fn dequeue_respects_cancellation() {
    let folder = MemoryFolder::new();
    let cancel = CancelToken::new();
    let (_uploader, queue) = stream_queue(&folder, 1 << 20, cancel.clone());

    let held = queue.dequeue().unwrap();
    cancel.cancel();
    let err = queue.dequeue().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::Cancelled)
    ));
    drop(held);
}

#[test]
fn upload_failure_surfaces_at_close() {
    let folder = MemoryFolder::new();
    folder.fail_next_puts(10); // more than the retry budget
    let (uploader, queue) = stream_queue(&folder, 1 << 20, CancelToken::new());

    pack_file(&queue, "a", &[3u8; 2000]);
    assert!(queue.close_all().is_err());
    assert!(uploader.is_failed());
}

#[test]
fn file_tarball_writes_a_plain_tar() {
    let dir = tempfile::tempdir().unwrap();
    let maker = TarBallMaker::File {
        dir: dir.path().to_path_buf(),
    };
    let mut ball = maker.make(1).unwrap();
    let mut header = new_header(tar::EntryType::Regular, 5, 0o600, 0);
    ball.append_regular(&mut header, Path::new("hello"), &mut &b"world"[..])
        .unwrap();
    assert!(ball.size() > 0);
    assert!(ball.seal().unwrap().is_none());

    let file = std::fs::File::open(dir.path().join("part_001.tar")).unwrap();
    let mut archive = tar::Archive::new(file);
    let mut entries = archive.entries().unwrap();
    let mut entry = entries.next().unwrap().unwrap();
    let mut body = String::new();
    entry.read_to_string(&mut body).unwrap();
    assert_eq!(body, "world");
}

#[test]
fn nop_tarball_only_accounts_size() {
    let maker = TarBallMaker::Nop;
    let mut ball = maker.make(1).unwrap();
    let mut header = new_header(tar::EntryType::Regular, 1000, 0o600, 0);
    ball.append_regular(&mut header, Path::new("x"), &mut &[0u8; 1000][..])
        .unwrap();
    assert_eq!(ball.size(), 1512);
    assert!(ball.seal().unwrap().is_none());
}

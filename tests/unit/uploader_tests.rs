#[path = "../common/mod.rs"]
mod common;

use std::io::Cursor;
use std::sync::Arc;

use walvault::compress::CompressionMethod;
use walvault::logging::MetricsSink;
use walvault::storage::memory::MemoryFolder;
use walvault::storage::Folder;
use walvault::upload::Uploader;

fn uploader(folder: &MemoryFolder) -> Arc<Uploader> {
    Uploader::new(
        Arc::new(folder.clone()),
        CompressionMethod::Lz4,
        None,
        MetricsSink::new_shared(),
    )
}

#[test]
fn transient_failures_are_retried() {
    let folder = MemoryFolder::new();
    let up = uploader(&folder);

    // Two failures, success on the third attempt.
    folder.fail_next_puts(2);
    up.upload("object", &mut Cursor::new(b"payload".to_vec()))
        .unwrap();

    assert_eq!(folder.put_attempts(), 3);
    assert!(!up.is_failed());
    up.finish().unwrap();
    assert_eq!(folder.object_names(), vec!["object"]);
}

#[test]
fn exhausted_retries_latch_the_failure() {
    let folder = MemoryFolder::new();
    let up = uploader(&folder);

    folder.fail_next_puts(3);
    let err = up.upload("object", &mut Cursor::new(b"payload".to_vec()));
    assert!(err.is_err());
    assert_eq!(folder.put_attempts(), 3);
    assert!(up.is_failed());

    // The latch is write-once: later successes do not clear it.
    up.upload("other", &mut Cursor::new(b"payload".to_vec()))
        .unwrap();
    assert!(up.is_failed());
    assert!(up.finish().is_err());
}

#[test]
fn retarget_shares_the_latch() {
    let folder = MemoryFolder::new();
    let up = uploader(&folder);
    let sub = up.retarget(up.folder().sub_folder("wal_005"));

    folder.fail_next_puts(3);
    assert!(sub.upload("seg", &mut Cursor::new(vec![0u8; 10])).is_err());
    assert!(up.is_failed());
}

#[test]
fn size_tracking_can_be_detached() {
    let folder = MemoryFolder::new();
    let metrics = MetricsSink::new_shared();
    let up = Uploader::new(
        Arc::new(folder.clone()),
        CompressionMethod::Lz4,
        None,
        Arc::clone(&metrics),
    );

    up.upload("a", &mut Cursor::new(vec![1u8; 10])).unwrap();
    assert_eq!(metrics.snapshot().uploaded_objects, 1);

    up.disable_size_tracking();
    up.upload("b", &mut Cursor::new(vec![1u8; 10])).unwrap();
    assert_eq!(metrics.snapshot().uploaded_objects, 1);
}

#[test]
fn finish_waits_for_in_flight_guards() {
    let folder = MemoryFolder::new();
    let up = uploader(&folder);

    let guard = up.in_flight_guard();
    let up_for_thread = Arc::clone(&up);
    let worker = std::thread::spawn(move || {
        let _guard = guard;
        std::thread::sleep(std::time::Duration::from_millis(50));
        up_for_thread
            .upload("late", &mut Cursor::new(vec![7u8; 3]))
            .unwrap();
    });

    up.finish().unwrap();
    assert_eq!(folder.object_names(), vec!["late"]);
    worker.join().unwrap();
}

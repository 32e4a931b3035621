#[path = "../common/mod.rs"]
mod common;

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use common::{page_with_lsn, test_config, write_relation, zero_page, FakeQueryRunner};
use tempfile::tempdir;
use walvault::backup::fetch::handle_backup_fetch;
use walvault::backup::push::{handle_backup_push, BackupPushSettings};
use walvault::backup::{fetch_sentinel, LATEST};
use walvault::compress::{decrypt_and_decompress, CompressionMethod};
use walvault::increment::read_increment_header;
use walvault::pg::{Lsn, PAGE_SIZE};
use walvault::storage::memory::MemoryFolder;
use walvault::storage::{Folder, BASE_BACKUPS_PATH, TAR_PARTITIONS_PATH};
use walvault::Error;

struct Cluster {
    _store: tempfile::TempDir,
    data: tempfile::TempDir,
    root: Arc<dyn Folder>,
    config: walvault::config::Config,
}

fn cluster(extra: &[(&str, &str)]) -> Cluster {
    let store = tempdir().unwrap();
    let data = tempdir().unwrap();
    std::fs::create_dir_all(data.path().join("pg_wal")).unwrap();
    let config = test_config(store.path(), extra);
    let root = config.storage_root().unwrap();
    Cluster {
        _store: store,
        data,
        root,
        config,
    }
}

fn push(
    cluster: &Cluster,
    runner: &mut FakeQueryRunner,
    settings: BackupPushSettings,
) -> walvault::Result<String> {
    handle_backup_push(
        &cluster.config,
        Arc::clone(&cluster.root),
        runner,
        cluster.data.path(),
        settings,
    )
}

fn partition_names(root: &Arc<dyn Folder>, backup: &str) -> Vec<String> {
    let folder = root
        .sub_folder(BASE_BACKUPS_PATH)
        .sub_folder(backup)
        .sub_folder(TAR_PARTITIONS_PATH);
    let (mut objects, _) = folder.list().unwrap();
    objects.sort_by(|a, b| a.name.cmp(&b.name));
    objects.into_iter().map(|o| o.name).collect()
}

fn partition_entries(
    root: &Arc<dyn Folder>,
    backup: &str,
    object: &str,
) -> Vec<(String, Vec<u8>)> {
    let folder = root
        .sub_folder(BASE_BACKUPS_PATH)
        .sub_folder(backup)
        .sub_folder(TAR_PARTITIONS_PATH);
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

fn assert_same_file(restored: &Path, original: &Path) {
    assert_eq!(
        std::fs::read(restored).unwrap(),
        std::fs::read(original).unwrap(),
        "{} differs",
        restored.display()
    );
}

#[test]
fn full_backup_restores_byte_identical() {
    // Two relations, concurrency 2, lz4, no encryption: one partition, one
    // sentinel, full restore equality.
    let cluster = cluster(&[("WALG_UPLOAD_CONCURRENCY", "2")]);
    let rel = write_relation(
        cluster.data.path(),
        "base/1/16384",
        &[
            page_with_lsn(0, 0x1111, 1),
            page_with_lsn(0, 0x2222, 2),
            page_with_lsn(0, 0x3333, 3),
        ],
    );
    let control = cluster.data.path().join("global/pg_control");
    std::fs::create_dir_all(control.parent().unwrap()).unwrap();
    std::fs::write(&control, vec![0xC7u8; PAGE_SIZE]).unwrap();

    let mut runner = FakeQueryRunner::new(Lsn::new(0, 0x0200_0028), Lsn::new(0, 0x0200_0130));
    let name = push(&cluster, &mut runner, BackupPushSettings::default()).unwrap();
    assert_eq!(name, "base_000000010000000000000002");
    assert_eq!(runner.start_calls, 1);
    assert_eq!(runner.stop_calls, 1);

    assert_eq!(partition_names(&cluster.root, &name), vec!["part_001.tar.lz4"]);

    let sentinel = fetch_sentinel(&cluster.root.sub_folder(BASE_BACKUPS_PATH), &name).unwrap();
    assert_eq!(sentinel.start_lsn, Lsn::new(0, 0x0200_0028));
    assert_eq!(sentinel.finish_lsn, Lsn::new(0, 0x0200_0130));
    assert!(sentinel.increment_from.is_none());
    assert!(sentinel.files.contains_key("base/1/16384"));
    assert!(sentinel.files.contains_key("global/pg_control"));
    assert!(!sentinel.files["base/1/16384"].is_incremented);

    let restore = tempdir().unwrap();
    handle_backup_fetch(
        &cluster.config,
        Arc::clone(&cluster.root),
        restore.path(),
        LATEST,
    )
    .unwrap();
    assert_same_file(&restore.path().join("base/1/16384"), &rel);
    assert_same_file(&restore.path().join("global/pg_control"), &control);
    assert!(restore.path().join("backup_label").is_file());
    assert!(restore.path().join("pg_wal").is_dir());
}

#[test]
fn incremental_captures_only_the_changed_page() {
    let cluster = cluster(&[("WALG_DELTA_MAX_STEPS", "4")]);
    let pages = vec![
        page_with_lsn(0, 0x1111, 1),
        page_with_lsn(0, 0x1222, 2),
        page_with_lsn(0, 0x1333, 3),
    ];
    let rel = write_relation(cluster.data.path(), "base/1/16384", &pages);

    let mut runner = FakeQueryRunner::new(Lsn::new(0, 0x0200_0028), Lsn::new(0, 0x0200_0130));
    let full_name = push(&cluster, &mut runner, BackupPushSettings::default()).unwrap();
    assert!(!fetch_sentinel(&cluster.root.sub_folder(BASE_BACKUPS_PATH), &full_name)
        .unwrap()
        .is_incremental());

    // Rewrite page 1 after the base backup's start LSN; pages 0 and 2
    // untouched.
    let mut live_pages = pages.clone();
    live_pages[1] = page_with_lsn(0, 0x0300_0999, 9);
    write_relation(cluster.data.path(), "base/1/16384", &live_pages);

    let mut runner2 = FakeQueryRunner::new(Lsn::new(0, 0x0300_0028), Lsn::new(0, 0x0300_0130));
    let delta_name = push(&cluster, &mut runner2, BackupPushSettings::default()).unwrap();
    assert_eq!(
        delta_name,
        "base_000000010000000000000003_D_000000010000000000000002"
    );

    let base_folder = cluster.root.sub_folder(BASE_BACKUPS_PATH);
    let sentinel = fetch_sentinel(&base_folder, &delta_name).unwrap();
    assert_eq!(sentinel.increment_from.as_deref(), Some(full_name.as_str()));
    assert_eq!(sentinel.increment_from_lsn, Some(Lsn::new(0, 0x0200_0130)));
    assert_eq!(
        sentinel.increment_full_name.as_deref(),
        Some(full_name.as_str())
    );
    assert!(sentinel.files["base/1/16384"].is_incremented);

    // The stored increment maps exactly one page: block 1.
    let parts = partition_names(&cluster.root, &delta_name);
    assert_eq!(parts.len(), 1);
    let entries = partition_entries(&cluster.root, &delta_name, &parts[0]);
    let (_, increment) = entries
        .iter()
        .find(|(name, _)| name == "base/1/16384")
        .expect("increment entry present");
    let mut cursor = std::io::Cursor::new(increment.clone());
    let header = read_increment_header(&mut cursor).unwrap();
    assert_eq!(header.diff_map, vec![1]);
    assert_eq!(header.file_size, 3 * PAGE_SIZE as u64);
    let mut body = Vec::new();
    cursor.read_to_end(&mut body).unwrap();
    assert_eq!(body, live_pages[1]);

    // Decode plus patch against the base copy restores the live bytes.
    let restore = tempdir().unwrap();
    handle_backup_fetch(
        &cluster.config,
        Arc::clone(&cluster.root),
        restore.path(),
        LATEST,
    )
    .unwrap();
    assert_same_file(&restore.path().join("base/1/16384"), &rel);
}

#[test]
fn unchanged_relations_are_skipped_in_increments() {
    let cluster = cluster(&[("WALG_DELTA_MAX_STEPS", "4")]);
    write_relation(
        cluster.data.path(),
        "base/1/16384",
        &[page_with_lsn(0, 0x1111, 1), page_with_lsn(0, 0x1222, 2)],
    );

    let mut runner = FakeQueryRunner::new(Lsn::new(0, 0x0200_0028), Lsn::new(0, 0x0200_0130));
    push(&cluster, &mut runner, BackupPushSettings::default()).unwrap();

    let mut runner2 = FakeQueryRunner::new(Lsn::new(0, 0x0300_0028), Lsn::new(0, 0x0300_0130));
    let delta_name = push(&cluster, &mut runner2, BackupPushSettings::default()).unwrap();

    let sentinel =
        fetch_sentinel(&cluster.root.sub_folder(BASE_BACKUPS_PATH), &delta_name).unwrap();
    let description = &sentinel.files["base/1/16384"];
    assert!(description.is_skipped);
    assert!(!description.is_incremented);

    // A skipped file still restores from the base layer.
    let restore = tempdir().unwrap();
    handle_backup_fetch(
        &cluster.config,
        Arc::clone(&cluster.root),
        restore.path(),
        LATEST,
    )
    .unwrap();
    assert_eq!(
        std::fs::read(restore.path().join("base/1/16384")).unwrap().len(),
        2 * PAGE_SIZE
    );
}

#[test]
fn holes_survive_the_round_trip() {
    // 32768-byte relation whose page 2 is all zeros.
    let cluster = cluster(&[]);
    let rel = write_relation(
        cluster.data.path(),
        "base/1/16384",
        &[
            page_with_lsn(0, 0x1111, 1),
            page_with_lsn(0, 0x2222, 2),
            zero_page(),
            page_with_lsn(0, 0x4444, 4),
        ],
    );

    let mut runner = FakeQueryRunner::new(Lsn::new(0, 0x0200_0028), Lsn::new(0, 0x0200_0130));
    push(&cluster, &mut runner, BackupPushSettings::default()).unwrap();

    let restore = tempdir().unwrap();
    handle_backup_fetch(
        &cluster.config,
        Arc::clone(&cluster.root),
        restore.path(),
        LATEST,
    )
    .unwrap();
    let restored = std::fs::read(restore.path().join("base/1/16384")).unwrap();
    assert_eq!(restored.len(), 4 * PAGE_SIZE);
    assert_eq!(
        &restored[2 * PAGE_SIZE..3 * PAGE_SIZE],
        zero_page().as_slice()
    );
    assert_same_file(&restore.path().join("base/1/16384"), &rel);
}

#[test]
fn exhausted_uploads_abort_without_a_sentinel() {
    let data = tempdir().unwrap();
    std::fs::create_dir_all(data.path().join("pg_wal")).unwrap();
    write_relation(data.path(), "base/1/16384", &[page_with_lsn(0, 0x1111, 1)]);

    let store = tempdir().unwrap();
    let config = test_config(store.path(), &[]);
    let folder = MemoryFolder::new();
    folder.fail_next_puts(1000);
    let root: Arc<dyn Folder> = Arc::new(folder.clone());

    let mut runner = FakeQueryRunner::new(Lsn::new(0, 0x0200_0028), Lsn::new(0, 0x0200_0130));
    let err = handle_backup_push(
        &config,
        Arc::clone(&root),
        &mut runner,
        data.path(),
        BackupPushSettings::default(),
    )
    .unwrap_err();
    let _ = err;

    // Backup mode was closed, but nothing committed.
    assert!(runner.stop_calls >= 1);
    assert!(!folder
        .object_names()
        .iter()
        .any(|name| name.ends_with("_backup_stop_sentinel.json")));
}

#[test]
fn standby_backups_require_nonexclusive_support() {
    let cluster = cluster(&[]);
    write_relation(cluster.data.path(), "base/1/16384", &[page_with_lsn(0, 1, 1)]);

    let mut runner = FakeQueryRunner::new(Lsn::new(0, 0x0200_0028), Lsn::new(0, 0x0200_0130));
    runner.version = 90500;
    runner.in_recovery = true;
    let err = push(&cluster, &mut runner, BackupPushSettings::default()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::Precondition(_))
    ));
    assert_eq!(runner.stop_calls, 1);
}

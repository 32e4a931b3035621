#[path = "../common/mod.rs"]
mod common;

use std::fs::OpenOptions;
use std::io::{Cursor, Read};

use common::{page_with_lsn, write_relation, zero_page};
use tempfile::tempdir;
use walvault::increment::{
    create_file_from_increment, plan_increment, read_increment_header, restore_missing_pages,
    write_increment, write_pages_from_increment, IncrementReader,
};
use walvault::pg::page::VerifyPolicy;
use walvault::pg::{Lsn, PAGE_SIZE};
use walvault::Error;

fn open_rw(path: &std::path::Path) -> std::fs::File {
    OpenOptions::new().read(true).write(true).open(path).unwrap()
}

fn plan_for(path: &std::path::Path, base_lsn: Lsn) -> walvault::increment::IncrementPlan {
    let file = std::fs::File::open(path).unwrap();
    plan_increment(
        file,
        "base/1/16384",
        base_lsn,
        0,
        None,
        VerifyPolicy::default(),
    )
    .unwrap()
}

#[test]
fn encode_decode_is_identity_on_the_page_stream() {
    let dir = tempdir().unwrap();
    let pages = vec![
        page_with_lsn(0, 0x1000, 1), // older, skipped
        page_with_lsn(0, 0x5000, 2), // newer
        zero_page(),                 // hole
        page_with_lsn(0, 0x6000, 3), // newer
    ];
    let rel = write_relation(dir.path(), "base/1/16384", &pages);

    let base_lsn = Lsn::new(0, 0x2000);
    let plan = plan_for(&rel, base_lsn);
    assert_eq!(plan.diff_blocks, vec![1, 3]);
    assert_eq!(plan.file_size, 4 * PAGE_SIZE as u64);

    let mut encoded = Vec::new();
    write_increment(&mut encoded, &open_rw(&rel), &plan).unwrap();
    assert_eq!(encoded.len() as u64, plan.encoded_size());

    let mut cursor = Cursor::new(encoded.clone());
    let header = read_increment_header(&mut cursor).unwrap();
    assert_eq!(header.base_lsn, base_lsn);
    assert_eq!(header.file_size, plan.file_size);
    assert_eq!(header.diff_map, vec![1, 3]);

    let mut body = Vec::new();
    cursor.read_to_end(&mut body).unwrap();
    assert_eq!(body.len(), 2 * PAGE_SIZE);
    assert_eq!(&body[..PAGE_SIZE], pages[1].as_slice());
    assert_eq!(&body[PAGE_SIZE..], pages[3].as_slice());

    // The streaming reader frames identically.
    let mut streamed = Vec::new();
    IncrementReader::new(open_rw(&rel), &plan)
        .read_to_end(&mut streamed)
        .unwrap();
    assert_eq!(streamed, encoded);
}

#[test]
fn empty_increment_means_skippable_file() {
    let dir = tempdir().unwrap();
    let rel = write_relation(
        dir.path(),
        "base/1/16384",
        &[page_with_lsn(0, 0x1000, 1), zero_page()],
    );
    let plan = plan_for(&rel, Lsn::new(0, 0x2000));
    assert!(plan.is_empty());
}

#[test]
fn create_file_zero_fills_unmapped_pages() {
    let dir = tempdir().unwrap();
    let pages = vec![
        page_with_lsn(0, 0x5000, 1),
        page_with_lsn(0, 0x1000, 2),
        zero_page(),
        page_with_lsn(0, 0x5000, 4),
    ];
    let rel = write_relation(dir.path(), "base/1/16384", &pages);
    let plan = plan_for(&rel, Lsn::new(0, 0x2000));

    let mut encoded = Vec::new();
    write_increment(&mut encoded, &open_rw(&rel), &plan).unwrap();

    let target_path = dir.path().join("restored");
    let target = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(&target_path)
        .unwrap();
    let size = create_file_from_increment(&mut Cursor::new(encoded), &target).unwrap();
    assert_eq!(size, 4 * PAGE_SIZE as u64);

    let restored = std::fs::read(&target_path).unwrap();
    assert_eq!(&restored[..PAGE_SIZE], pages[0].as_slice());
    assert_eq!(&restored[PAGE_SIZE..2 * PAGE_SIZE], zero_page().as_slice());
    assert_eq!(&restored[2 * PAGE_SIZE..3 * PAGE_SIZE], zero_page().as_slice());
    assert_eq!(&restored[3 * PAGE_SIZE..], pages[3].as_slice());
}

#[test]
fn patch_mode_writes_only_mapped_pages() {
    let dir = tempdir().unwrap();
    let base_pages = vec![
        page_with_lsn(0, 0x1000, 1),
        page_with_lsn(0, 0x1000, 2),
        page_with_lsn(0, 0x1000, 3),
    ];
    let base_copy = write_relation(dir.path(), "restored/16384", &base_pages);

    // Page 1 was rewritten after the base backup.
    let mut live_pages = base_pages.clone();
    live_pages[1] = page_with_lsn(0, 0x5000, 9);
    let live = write_relation(dir.path(), "base/1/16384", &live_pages);

    let plan = plan_for(&live, Lsn::new(0, 0x2000));
    assert_eq!(plan.diff_blocks, vec![1]);
    let mut encoded = Vec::new();
    write_increment(&mut encoded, &open_rw(&live), &plan).unwrap();

    let target = open_rw(&base_copy);
    let declared =
        write_pages_from_increment(&mut Cursor::new(encoded), &target, true).unwrap();
    assert_eq!(declared, 3 * PAGE_SIZE as u64);

    let patched = std::fs::read(&base_copy).unwrap();
    let mut expected = Vec::new();
    for page in &live_pages {
        expected.extend_from_slice(page);
    }
    assert_eq!(patched, expected);
}

#[test]
fn patch_mode_discards_blocks_past_a_shrunk_target() {
    let dir = tempdir().unwrap();
    let live = write_relation(
        dir.path(),
        "base/1/16384",
        &[page_with_lsn(0, 0x5000, 1), page_with_lsn(0, 0x5000, 2)],
    );
    let plan = plan_for(&live, Lsn::new(0, 0x2000));
    assert_eq!(plan.diff_blocks, vec![0, 1]);
    let mut encoded = Vec::new();
    write_increment(&mut encoded, &open_rw(&live), &plan).unwrap();

    // Target shrank to one page since the increment was taken.
    let target_path = write_relation(dir.path(), "restored/16384", &[zero_page()]);
    let target = open_rw(&target_path);
    write_pages_from_increment(&mut Cursor::new(encoded), &target, true).unwrap();

    let restored = std::fs::read(&target_path).unwrap();
    assert_eq!(restored.len(), PAGE_SIZE);
    assert_eq!(restored, page_with_lsn(0, 0x5000, 1));
}

#[test]
fn restore_missing_pages_fills_only_zero_headers() {
    let dir = tempdir().unwrap();
    let base_pages = vec![
        page_with_lsn(0, 0x1000, 1),
        page_with_lsn(0, 0x1000, 2),
        page_with_lsn(0, 0x1000, 3),
    ];
    // The target lost page 1.
    let target_path = write_relation(
        dir.path(),
        "restored/16384",
        &[
            page_with_lsn(0, 0x4000, 7),
            zero_page(),
            page_with_lsn(0, 0x4000, 8),
        ],
    );

    let mut base_stream = Vec::new();
    for page in &base_pages {
        base_stream.extend_from_slice(page);
    }
    let target = open_rw(&target_path);
    restore_missing_pages(&mut Cursor::new(base_stream), &target).unwrap();

    let restored = std::fs::read(&target_path).unwrap();
    assert_eq!(&restored[..PAGE_SIZE], page_with_lsn(0, 0x4000, 7).as_slice());
    assert_eq!(
        &restored[PAGE_SIZE..2 * PAGE_SIZE],
        base_pages[1].as_slice()
    );
    assert_eq!(
        &restored[2 * PAGE_SIZE..],
        page_with_lsn(0, 0x4000, 8).as_slice()
    );
}

#[test]
fn restore_missing_then_patch_reproduces_the_live_file() {
    let dir = tempdir().unwrap();
    let base_pages = vec![page_with_lsn(0, 0x1000, 1), page_with_lsn(0, 0x1000, 2)];
    let mut live_pages = base_pages.clone();
    live_pages[0] = page_with_lsn(0, 0x7000, 5);
    let live = write_relation(dir.path(), "base/1/16384", &live_pages);

    let plan = plan_for(&live, Lsn::new(0, 0x2000));
    let mut increment = Vec::new();
    write_increment(&mut increment, &open_rw(&live), &plan).unwrap();

    // Target with a missing page, as a torn restore would leave it.
    let target_path = write_relation(
        dir.path(),
        "restored/16384",
        &[zero_page(), base_pages[1].clone()],
    );
    let target = open_rw(&target_path);
    let mut base_stream = Vec::new();
    for page in &base_pages {
        base_stream.extend_from_slice(page);
    }
    restore_missing_pages(&mut Cursor::new(base_stream), &target).unwrap();
    write_pages_from_increment(&mut Cursor::new(increment), &target, true).unwrap();

    let mut expected = Vec::new();
    for page in &live_pages {
        expected.extend_from_slice(page);
    }
    assert_eq!(std::fs::read(&target_path).unwrap(), expected);
}

#[test]
fn decoder_rejects_structural_damage() {
    let dir = tempdir().unwrap();
    let rel = write_relation(dir.path(), "base/1/16384", &[page_with_lsn(0, 0x5000, 1)]);
    let plan = plan_for(&rel, Lsn(0));
    let mut encoded = Vec::new();
    write_increment(&mut encoded, &open_rw(&rel), &plan).unwrap();

    // Magic.
    let mut bad = encoded.clone();
    bad[0] = b'X';
    let err = read_increment_header(&mut Cursor::new(bad)).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::CorruptIncrement(_))
    ));

    // Version.
    let mut bad = encoded.clone();
    bad[2] = 99;
    assert!(read_increment_header(&mut Cursor::new(bad)).is_err());

    // File size alignment.
    let mut bad = encoded.clone();
    bad[12] = 1;
    assert!(read_increment_header(&mut Cursor::new(bad)).is_err());

    // Block number outside the file.
    let mut bad = encoded;
    bad[24..28].copy_from_slice(&7u32.to_le_bytes());
    assert!(read_increment_header(&mut Cursor::new(bad)).is_err());
}

#[test]
fn decoder_rejects_non_ascending_map() {
    // Hand-build a header with a descending map.
    let mut raw = Vec::new();
    raw.extend_from_slice(b"wi");
    raw.push(1);
    raw.push(0x55);
    raw.extend_from_slice(&0u64.to_be_bytes());
    raw.extend_from_slice(&(4 * PAGE_SIZE as u64).to_le_bytes());
    raw.extend_from_slice(&2u32.to_le_bytes());
    raw.extend_from_slice(&3u32.to_le_bytes());
    raw.extend_from_slice(&1u32.to_le_bytes());
    let err = read_increment_header(&mut Cursor::new(raw)).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::CorruptIncrement(_))
    ));
}

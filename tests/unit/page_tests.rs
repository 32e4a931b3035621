#[path = "../common/mod.rs"]
mod common;

use std::collections::BTreeSet;
use std::io::Cursor;

use common::{page_with_lsn, zero_page};
use walvault::pg::page::{
    page_checksum, page_lsn, set_page_checksum, PageClass, PageClassifier, VerifyPolicy,
};
use walvault::pg::{Lsn, PAGE_SIZE};
use walvault::Error;

fn classify_all(
    data: Vec<u8>,
    base_lsn: Lsn,
    allowed: Option<BTreeSet<u32>>,
    verify: VerifyPolicy,
) -> (Vec<(u32, PageClass)>, Vec<u32>) {
    let mut classifier =
        PageClassifier::new(Cursor::new(data), "base/1/16384", base_lsn, 0, allowed, verify);
    let mut classes = Vec::new();
    for page in classifier.by_ref() {
        let page = page.unwrap();
        classes.push((page.block_no, page.class));
    }
    (classes, classifier.corrupt_blocks().to_vec())
}

#[test]
fn classifies_holes_included_and_skipped() {
    let mut data = Vec::new();
    data.extend_from_slice(&zero_page()); // hole
    data.extend_from_slice(&page_with_lsn(0, 0x3000, 1)); // newer than base
    data.extend_from_slice(&page_with_lsn(0, 0x1000, 2)); // older than base

    let (classes, _) = classify_all(
        data,
        Lsn::new(0, 0x2000),
        None,
        VerifyPolicy::default(),
    );
    assert_eq!(
        classes,
        vec![
            (0, PageClass::Hole),
            (1, PageClass::Included),
            (2, PageClass::Skipped),
        ]
    );
}

#[test]
fn included_pages_carry_their_bytes() {
    let page = page_with_lsn(0, 0x9000, 0x5A);
    let mut classifier = PageClassifier::new(
        Cursor::new(page.clone()),
        "base/1/16384",
        Lsn(0),
        0,
        None,
        VerifyPolicy::default(),
    );
    let classified = classifier.next().unwrap().unwrap();
    assert_eq!(classified.class, PageClass::Included);
    assert_eq!(classified.data.as_deref(), Some(page.as_slice()));
    assert!(classifier.next().is_none());
}

#[test]
fn boundary_lsn_is_skipped() {
    // pageLSN must strictly exceed the baseline to be included.
    let base = Lsn::new(0, 0x2000);
    let (classes, _) = classify_all(
        page_with_lsn(0, 0x2000, 3),
        base,
        None,
        VerifyPolicy::default(),
    );
    assert_eq!(classes, vec![(0, PageClass::Skipped)]);
}

#[test]
fn partial_trailing_block_truncates() {
    let mut data = page_with_lsn(0, 0x9000, 1);
    data.extend_from_slice(&[0xFF; 100]); // ragged tail

    let (classes, _) = classify_all(data, Lsn(0), None, VerifyPolicy::default());
    assert_eq!(classes.len(), 1);
}

#[test]
fn delta_map_narrowing_skips_unlisted_blocks() {
    let mut data = Vec::new();
    data.extend_from_slice(&page_with_lsn(0, 0x9000, 1));
    data.extend_from_slice(&page_with_lsn(0, 0x9000, 2));

    let allowed: BTreeSet<u32> = [1].into_iter().collect();
    let (classes, _) = classify_all(data, Lsn(0), Some(allowed), VerifyPolicy::default());
    assert_eq!(
        classes,
        vec![(0, PageClass::Skipped), (1, PageClass::Included)]
    );
}

#[test]
fn checksum_round_trips() {
    let mut page = page_with_lsn(0, 0x9000, 7);
    set_page_checksum(&mut page, 5);
    let stored = u16::from_le_bytes([page[8], page[9]]);
    assert_eq!(stored, page_checksum(&page, 5));
    // Same bytes at another position verify differently.
    assert_ne!(stored, page_checksum(&page, 6));
    assert_eq!(page_lsn(&page), Lsn::new(0, 0x9000));
}

#[test]
fn corrupt_page_aborts_by_default() {
    let mut page = page_with_lsn(0, 0x9000, 7);
    set_page_checksum(&mut page, 0);
    page[100] ^= 0xFF; // damage past the header

    let mut classifier = PageClassifier::new(
        Cursor::new(page),
        "base/1/16384",
        Lsn(0),
        0,
        None,
        VerifyPolicy {
            verify_checksums: true,
            store_all_corrupt: false,
        },
    );
    let err = classifier.next().unwrap().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::CorruptPage { block: 0, .. })
    ));
}

#[test]
fn store_all_corrupt_records_and_continues() {
    let mut good = page_with_lsn(0, 0x9000, 1);
    set_page_checksum(&mut good, 0);
    let mut bad = page_with_lsn(0, 0x9000, 2);
    set_page_checksum(&mut bad, 1);
    bad[100] ^= 0xFF;

    let mut data = Vec::new();
    data.extend_from_slice(&good);
    data.extend_from_slice(&bad);

    let (classes, corrupt) = classify_all(
        data,
        Lsn(0),
        None,
        VerifyPolicy {
            verify_checksums: true,
            store_all_corrupt: true,
        },
    );
    assert_eq!(
        classes,
        vec![(0, PageClass::Included), (1, PageClass::Corrupt)]
    );
    assert_eq!(corrupt, vec![1]);
}

#[test]
fn segment_offset_feeds_the_checksum() {
    // A page in segment file N verifies against its relation-wide block
    // number, not its block within the file.
    let offset = walvault::pg::BLOCKS_PER_RELATION_SEGMENT;
    let mut page = page_with_lsn(0, 0x9000, 9);
    set_page_checksum(&mut page, offset);

    let mut classifier = PageClassifier::new(
        Cursor::new(page),
        "base/1/16384.1",
        Lsn(0),
        offset,
        None,
        VerifyPolicy {
            verify_checksums: true,
            store_all_corrupt: false,
        },
    );
    assert_eq!(
        classifier.next().unwrap().unwrap().class,
        PageClass::Included
    );
}

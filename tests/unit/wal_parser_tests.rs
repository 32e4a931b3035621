#[path = "../common/mod.rs"]
mod common;

use common::{build_wal_segments, TestWalRecord};
use walvault::pg::{segment_start_lsn, wal_segment_name, Lsn, RelFileNode};
use walvault::sync::CancelToken;
use walvault::wal::rmgr::{RM_HEAP_ID, RM_XACT_ID};
use walvault::wal::tail::WalTailReader;
use walvault::wal::{DeltaMap, WalStreamParser};
use walvault::Error;

// Small segments keep the fixtures fast; the parser takes the size from
// the cluster.
const SEG: u64 = 65536;

fn rel(oid: u32) -> RelFileNode {
    RelFileNode {
        spc_node: 1663,
        db_node: 5,
        rel_node: oid,
    }
}

#[test]
fn parses_block_references() {
    let records = vec![
        TestWalRecord::heap(1663, 5, 16384, 5),
        TestWalRecord::heap(1663, 5, 16384, 3),
    ];
    let segments = build_wal_segments(SEG, 0, 1, &records);
    let mut parser = WalStreamParser::new(SEG);
    let parsed = parser.parse_segment(Lsn(0), &segments[0]).unwrap();

    assert_eq!(parsed.len(), 2);
    assert!(parsed.iter().all(|r| r.crc_ok));
    assert_eq!(parsed[0].blocks.len(), 1);
    assert_eq!(parsed[0].blocks[0].node, rel(16384));
    assert_eq!(parsed[0].blocks[0].block_no, 5);
    assert_eq!(parsed[1].blocks[0].block_no, 3);
    assert_eq!(parsed[0].header.rmid, RM_HEAP_ID);
    assert!(parsed[0].lsn < parsed[1].lsn);
}

#[test]
fn metadata_records_keep_no_blocks() {
    let mut record = TestWalRecord::heap(1663, 5, 16384, 1);
    record.rmid = RM_XACT_ID;
    let segments = build_wal_segments(SEG, 0, 1, &[record]);
    let parsed = WalStreamParser::new(SEG)
        .parse_segment(Lsn(0), &segments[0])
        .unwrap();
    assert_eq!(parsed.len(), 1);
    assert!(parsed[0].blocks.is_empty());
}

#[test]
fn record_crossing_pages_is_reassembled() {
    let mut big = TestWalRecord::heap(1663, 5, 16384, 42);
    big.main_data_len = 20_000; // spans three wal pages
    let records = vec![big, TestWalRecord::heap(1663, 5, 16385, 7)];
    let segments = build_wal_segments(SEG, 0, 1, &records);

    let parsed = WalStreamParser::new(SEG)
        .parse_segment(Lsn(0), &segments[0])
        .unwrap();
    assert_eq!(parsed.len(), 2);
    assert_eq!(parsed[0].blocks[0].block_no, 42);
    assert_eq!(parsed[1].blocks[0].node, rel(16385));
}

#[test]
fn record_crossing_segments_is_reassembled() {
    let mut big = TestWalRecord::heap(1663, 5, 16384, 11);
    big.main_data_len = SEG as u32; // cannot fit in the first segment
    let records = vec![big, TestWalRecord::heap(1663, 5, 16384, 12)];
    let segments = build_wal_segments(SEG, 0, 2, &records);
    assert_eq!(segments.len(), 2);

    let mut parser = WalStreamParser::new(SEG);
    let first = parser.parse_segment(Lsn(0), &segments[0]).unwrap();
    assert!(first.is_empty());
    assert!(parser.has_partial());

    let second = parser
        .parse_segment(segment_start_lsn(1, SEG), &segments[1])
        .unwrap();
    assert!(!parser.has_partial());
    assert_eq!(second.len(), 2);
    assert_eq!(second[0].blocks[0].block_no, 11);
    assert_eq!(second[1].blocks[0].block_no, 12);
}

#[test]
fn crc_mismatch_flags_the_record() {
    let mut bad = TestWalRecord::heap(1663, 5, 16384, 9);
    bad.corrupt_crc = true;
    let records = vec![bad, TestWalRecord::heap(1663, 5, 16384, 10)];
    let segments = build_wal_segments(SEG, 0, 1, &records);

    let parsed = WalStreamParser::new(SEG)
        .parse_segment(Lsn(0), &segments[0])
        .unwrap();
    assert_eq!(parsed.len(), 2);
    assert!(!parsed[0].crc_ok);
    assert!(parsed[0].blocks.is_empty());
    assert!(parsed[1].crc_ok);

    let mut map = DeltaMap::new();
    for record in &parsed {
        map.absorb_record(record);
    }
    assert!(map.is_incomplete());
}

#[test]
fn unknown_rmid_is_fatal() {
    let mut record = TestWalRecord::heap(1663, 5, 16384, 1);
    record.rmid = 42;
    let segments = build_wal_segments(SEG, 0, 1, &[record]);
    let err = WalStreamParser::new(SEG)
        .parse_segment(Lsn(0), &segments[0])
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::UnknownRm(42))
    ));
}

#[test]
fn bad_page_address_is_structural_damage() {
    let records = vec![TestWalRecord::heap(1663, 5, 16384, 1)];
    let segments = build_wal_segments(SEG, 0, 1, &records);
    // Feed the segment at the wrong position.
    let err = WalStreamParser::new(SEG)
        .parse_segment(segment_start_lsn(3, SEG), &segments[0])
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::CorruptWal(_))
    ));
}

#[test]
fn delta_map_union_is_order_independent() {
    // Two records touching (A,5) then (A,3); the map is {3,5} regardless
    // of processing order.
    let forward = vec![
        TestWalRecord::heap(1663, 5, 16384, 5),
        TestWalRecord::heap(1663, 5, 16384, 3),
    ];
    let segments = build_wal_segments(SEG, 0, 1, &forward);
    let parsed = WalStreamParser::new(SEG)
        .parse_segment(Lsn(0), &segments[0])
        .unwrap();

    let mut in_order = DeltaMap::new();
    for record in &parsed {
        in_order.absorb_record(record);
    }
    let mut reversed = DeltaMap::new();
    for record in parsed.iter().rev() {
        reversed.absorb_record(record);
    }
    assert_eq!(in_order, reversed);
    let blocks: Vec<u32> = in_order
        .blocks_for(&rel(16384))
        .unwrap()
        .iter()
        .copied()
        .collect();
    assert_eq!(blocks, vec![3, 5]);
}

#[test]
fn tail_reader_drains_to_the_stop_lsn() {
    let dir = tempfile::tempdir().unwrap();
    let records = vec![
        TestWalRecord::heap(1663, 5, 16384, 1),
        TestWalRecord::heap(1663, 5, 16384, 2),
    ];
    let segments = build_wal_segments(SEG, 0, 2, &records);
    for (segment_no, data) in segments.iter().enumerate() {
        std::fs::write(
            dir.path().join(wal_segment_name(1, segment_no as u64, SEG)),
            data,
        )
        .unwrap();
    }

    let handle = WalTailReader {
        wal_dir: dir.path().to_path_buf(),
        timeline: 1,
        wal_segment_size: SEG,
        cancel: CancelToken::new(),
    }
    .spawn(Lsn(0));

    let map = handle.finish(segment_start_lsn(1, SEG)).unwrap();
    assert!(!map.is_incomplete());
    let blocks: Vec<u32> = map
        .blocks_for(&rel(16384))
        .unwrap()
        .iter()
        .copied()
        .collect();
    assert_eq!(blocks, vec![1, 2]);
}

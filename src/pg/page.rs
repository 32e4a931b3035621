//! Page-level classification of relation files against a baseline LSN,
//! plus the PostgreSQL page checksum.

use std::collections::BTreeSet;
use std::io::Read;

use tracing::warn;

use super::{Lsn, PAGE_SIZE};
use crate::{Error, Result};

/// First 8 bytes of a page hold its LSN as a little-endian `(hi, lo)` pair.
const PAGE_LSN_BYTES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageClass {
    /// Never-written page: header bytes are all zero.
    Hole,
    /// Page newer than the baseline; its bytes belong in the increment.
    Included,
    /// Page unchanged since the baseline.
    Skipped,
    /// Checksum mismatch, kept under the store-all-corrupt policy.
    Corrupt,
}

#[derive(Debug)]
pub struct ClassifiedPage {
    pub block_no: u32,
    pub class: PageClass,
    /// Present for `Included` and `Corrupt` pages.
    pub data: Option<Vec<u8>>,
}

/// Checksum verification policy for one file.
#[derive(Debug, Clone, Copy, Default)]
pub struct VerifyPolicy {
    pub verify_checksums: bool,
    pub store_all_corrupt: bool,
}

/// LSN stored in a page header: two little-endian u32s, high half first.
pub fn page_lsn(page: &[u8]) -> Lsn {
    let hi = u32::from_le_bytes(page[0..4].try_into().expect("page header"));
    let lo = u32::from_le_bytes(page[4..8].try_into().expect("page header"));
    Lsn::new(hi, lo)
}

/// Streaming classifier: reads aligned 8 KiB blocks in order, no seeks.
///
/// `block_offset` is the block number of the file's first page within the
/// whole relation (non-zero for `.N` segment files); checksums mix in the
/// relation-wide block number.
pub struct PageClassifier<R: Read> {
    reader: R,
    path: String,
    base_lsn: Lsn,
    block_offset: u32,
    /// When present, blocks outside the set are skipped without inspecting
    /// their LSN (the WAL delta-map already proved them unchanged).
    allowed_blocks: Option<BTreeSet<u32>>,
    verify: VerifyPolicy,
    corrupt_blocks: Vec<u32>,
    next_block: u32,
    done: bool,
}

impl<R: Read> PageClassifier<R> {
    pub fn new(
        reader: R,
        path: impl Into<String>,
        base_lsn: Lsn,
        block_offset: u32,
        allowed_blocks: Option<BTreeSet<u32>>,
        verify: VerifyPolicy,
    ) -> Self {
        Self {
            reader,
            path: path.into(),
            base_lsn,
            block_offset,
            allowed_blocks,
            verify,
            corrupt_blocks: Vec::new(),
            next_block: 0,
            done: false,
        }
    }

    /// Blocks that failed verification under the store-all-corrupt policy.
    pub fn corrupt_blocks(&self) -> &[u32] {
        &self.corrupt_blocks
    }

    /// Fill one page; Ok(None) at a clean EOF boundary.
    fn read_block(&mut self) -> Result<Option<Vec<u8>>> {
        let mut page = vec![0u8; PAGE_SIZE];
        let mut filled = 0;
        while filled < PAGE_SIZE {
            let n = self.reader.read(&mut page[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        if filled < PAGE_SIZE {
            // Relation files are page-aligned; a ragged tail means the file
            // was truncated underneath us.
            warn!(
                path = %self.path,
                block = self.next_block,
                bytes = filled,
                "partial trailing block, treating file as truncated"
            );
            return Ok(None);
        }
        Ok(Some(page))
    }

    fn classify(&mut self, page: Vec<u8>) -> Result<ClassifiedPage> {
        let block_no = self.next_block;
        self.next_block += 1;

        if page[..PAGE_LSN_BYTES].iter().all(|b| *b == 0) {
            return Ok(ClassifiedPage {
                block_no,
                class: PageClass::Hole,
                data: None,
            });
        }

        if self.verify.verify_checksums {
            let stored = u16::from_le_bytes([page[8], page[9]]);
            let computed = page_checksum(&page, self.block_offset + block_no);
            if stored != computed {
                if !self.verify.store_all_corrupt {
                    return Err(Error::CorruptPage {
                        path: self.path.clone(),
                        block: block_no,
                    }
                    .into());
                }
                self.corrupt_blocks.push(block_no);
                return Ok(ClassifiedPage {
                    block_no,
                    class: PageClass::Corrupt,
                    data: Some(page),
                });
            }
        }

        if let Some(allowed) = &self.allowed_blocks {
            if !allowed.contains(&(self.block_offset + block_no)) {
                return Ok(ClassifiedPage {
                    block_no,
                    class: PageClass::Skipped,
                    data: None,
                });
            }
        }

        if page_lsn(&page) > self.base_lsn {
            Ok(ClassifiedPage {
                block_no,
                class: PageClass::Included,
                data: Some(page),
            })
        } else {
            Ok(ClassifiedPage {
                block_no,
                class: PageClass::Skipped,
                data: None,
            })
        }
    }
}

impl<R: Read> Iterator for PageClassifier<R> {
    type Item = Result<ClassifiedPage>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_block() {
            Ok(Some(page)) => match self.classify(page) {
                Ok(classified) => Some(Ok(classified)),
                Err(err) => {
                    self.done = true;
                    Some(Err(err))
                }
            },
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

const N_SUMS: usize = 32;
const FNV_PRIME: u32 = 16_777_619;

// FNV base offsets of the parallel checksum lanes.
const CHECKSUM_BASE_OFFSETS: [u32; N_SUMS] = [
    0x5B1F36E9, 0xB8525960, 0x02AB50AA, 0x1DE66D2A, 0x79FF467A, 0x9BB9F8A3, 0x217E7CD2, 0x83E13D2C,
    0xF8D4474F, 0xE39EB970, 0x42C6AE16, 0x993216FA, 0x7B093B5D, 0x98DAFF3C, 0xF718902A, 0x0B1C9CDB,
    0xE58F764B, 0x187636BC, 0x5D7B3BB1, 0xE73DE7DE, 0x92BEC979, 0xCCA6C0B2, 0x304A0979, 0x85AA43D4,
    0x783125BB, 0x6CA8EAA2, 0xE407EAC6, 0x4B5CF024, 0xC05AD499, 0x950D606E, 0xA189A418, 0xA93C5705,
];

#[inline]
fn checksum_comp(checksum: u32, value: u32) -> u32 {
    let tmp = checksum ^ value;
    tmp.wrapping_mul(FNV_PRIME) ^ (tmp >> 17)
}

/// 16-bit PostgreSQL page checksum. The stored checksum field (bytes 8..10)
/// is treated as zero; the relation-wide block number is mixed in to catch
/// transposed pages.
pub fn page_checksum(page: &[u8], block_no: u32) -> u16 {
    debug_assert_eq!(page.len(), PAGE_SIZE);
    let mut sums = CHECKSUM_BASE_OFFSETS;

    let rounds = PAGE_SIZE / (4 * N_SUMS);
    for round in 0..rounds {
        for (lane, sum) in sums.iter_mut().enumerate() {
            let offset = (round * N_SUMS + lane) * 4;
            let mut word = u32::from_le_bytes(
                page[offset..offset + 4].try_into().expect("aligned word"),
            );
            if offset == 8 {
                word &= 0xFFFF_0000;
            }
            *sum = checksum_comp(*sum, word);
        }
    }
    for _ in 0..2 {
        for sum in sums.iter_mut() {
            *sum = checksum_comp(*sum, 0);
        }
    }

    let mut result = 0u32;
    for sum in sums {
        result ^= sum;
    }
    result ^= block_no;
    (result % 65_535 + 1) as u16
}

/// Stamp a page with a valid checksum.
pub fn set_page_checksum(page: &mut [u8], block_no: u32) {
    let checksum = page_checksum(page, block_no);
    page[8..10].copy_from_slice(&checksum.to_le_bytes());
}

//! WAL segment parser.
//!
//! Turns raw 16 MiB (configurable) segments into a sequence of records,
//! keeping only the block references the delta map cares about. Records
//! routinely cross page and segment boundaries; the parser carries the
//! unfinished tail between `parse_segment` calls and resumes on the next
//! one.

use crate::pg::{Lsn, RelFileNode};
use crate::{Error, Result};

use super::rmgr;

/// WAL block size (`XLOG_BLCKSZ`).
pub const WAL_PAGE_SIZE: usize = 8192;
pub const XLP_FIRST_IS_CONTD: u16 = 0x0001;
pub const XLP_LONG_HEADER: u16 = 0x0002;
pub const SHORT_PAGE_HEADER_LEN: usize = 24;
pub const LONG_PAGE_HEADER_LEN: usize = 40;
pub const RECORD_HEADER_LEN: usize = 24;

/// Page magic for the record format this parser understands. Point releases
/// bump the low byte; anything in the 0xD0xx/0xD1xx family is accepted.
pub const WAL_PAGE_MAGIC: u16 = 0xD10D;

pub const XLR_MAX_BLOCK_ID: u8 = 32;
pub const XLR_BLOCK_ID_DATA_SHORT: u8 = 255;
pub const XLR_BLOCK_ID_DATA_LONG: u8 = 254;
pub const XLR_BLOCK_ID_ORIGIN: u8 = 253;
pub const XLR_BLOCK_ID_TOPLEVEL_XID: u8 = 252;

pub const BKPBLOCK_FORK_MASK: u8 = 0x0F;
pub const BKPBLOCK_HAS_IMAGE: u8 = 0x10;
pub const BKPBLOCK_HAS_DATA: u8 = 0x20;
pub const BKPBLOCK_SAME_REL: u8 = 0x80;

pub const BKPIMAGE_HAS_HOLE: u8 = 0x01;
pub const BKPIMAGE_IS_COMPRESSED: u8 = 0x02;

/// Main-fork number; other forks never reach the delta map.
pub const MAIN_FORK: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub total_len: u32,
    pub xid: u32,
    pub prev: Lsn,
    pub info: u8,
    pub rmid: u8,
    pub crc: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    pub node: RelFileNode,
    pub fork: u8,
    pub block_no: u32,
}

#[derive(Debug, Clone)]
pub struct WalRecord {
    pub lsn: Lsn,
    pub header: RecordHeader,
    /// Data blocks this record touches, per its resource manager.
    pub blocks: Vec<BlockRef>,
    /// False when the stored CRC does not match; such records keep no
    /// blocks and callers must treat the surrounding range as unknown.
    pub crc_ok: bool,
}

/// CRC-32C over the record body followed by the header prefix, the order
/// the server computes it in.
pub fn record_crc(record: &[u8]) -> u32 {
    let crc = crc32c::crc32c(&record[RECORD_HEADER_LEN..]);
    crc32c::crc32c_append(crc, &record[..20])
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::CorruptWal("truncated field".into()).into());
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().expect("sized")))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("sized")))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("sized")))
    }

    /// Records are 8-byte aligned within the segment address space.
    fn align8(&mut self) {
        self.pos = ((self.pos + 7) & !7).min(self.data.len());
    }
}

struct PartialRecord {
    lsn: Lsn,
    total_len: usize,
    buf: Vec<u8>,
}

/// Stateful parser over a stream of consecutive segments.
pub struct WalStreamParser {
    wal_segment_size: u64,
    partial: Option<PartialRecord>,
}

impl WalStreamParser {
    pub fn new(wal_segment_size: u64) -> Self {
        Self {
            wal_segment_size,
            partial: None,
        }
    }

    /// True when a record tail is waiting for the next segment.
    pub fn has_partial(&self) -> bool {
        self.partial.is_some()
    }

    /// Parse one whole segment starting at `segment_start`. Records whose
    /// CRC fails are yielded flagged, not dropped; structural damage and
    /// unknown resource managers are errors.
    pub fn parse_segment(&mut self, segment_start: Lsn, data: &[u8]) -> Result<Vec<WalRecord>> {
        if data.len() != self.wal_segment_size as usize {
            return Err(Error::CorruptWal(format!(
                "segment is {} bytes, expected {}",
                data.len(),
                self.wal_segment_size
            ))
            .into());
        }
        if segment_start.0 % self.wal_segment_size != 0 {
            return Err(
                Error::CorruptWal(format!("{segment_start} is not a segment boundary")).into(),
            );
        }

        let mut records = Vec::new();
        let page_count = data.len() / WAL_PAGE_SIZE;
        'pages: for page_no in 0..page_count {
            let page = &data[page_no * WAL_PAGE_SIZE..][..WAL_PAGE_SIZE];
            let page_addr = segment_start.0 + (page_no * WAL_PAGE_SIZE) as u64;
            let mut cur = Cursor::new(page);

            let magic = cur.u16()?;
            if magic == 0 && self.partial.is_none() {
                // Preallocated tail of the segment.
                break 'pages;
            }
            if !(0xD000..=0xD1FF).contains(&magic) {
                return Err(Error::CorruptWal(format!("bad page magic {magic:#06X}")).into());
            }
            let info = cur.u16()?;
            let _timeline = cur.u32()?;
            let page_header_addr = cur.u64()?;
            let rem_len = cur.u32()?;
            cur.skip(4)?;
            if info & XLP_LONG_HEADER != 0 {
                // System id, segment size and block size follow on the
                // first page of a segment.
                cur.skip(16)?;
            }
            if page_header_addr != page_addr {
                return Err(Error::CorruptWal(format!(
                    "page claims address {page_header_addr:#X}, expected {page_addr:#X}"
                ))
                .into());
            }

            if let Some(partial) = &mut self.partial {
                if info & XLP_FIRST_IS_CONTD == 0 {
                    return Err(Error::CorruptWal(
                        "record continuation missing at page start".into(),
                    )
                    .into());
                }
                let need = partial.total_len - partial.buf.len();
                let take = need.min(cur.remaining());
                partial.buf.extend_from_slice(cur.take(take)?);
                if partial.buf.len() < partial.total_len {
                    continue 'pages;
                }
                let done = self.partial.take().expect("checked above");
                records.push(decode_record(done.lsn, &done.buf)?);
            } else if info & XLP_FIRST_IS_CONTD != 0 {
                // Joined mid-record (first segment we look at); skip the tail.
                let skip = (rem_len as usize).min(cur.remaining());
                cur.skip(skip)?;
            }

            loop {
                cur.align8();
                if cur.remaining() < RECORD_HEADER_LEN {
                    // Too little room for a header; the writer padded to the
                    // page end.
                    continue 'pages;
                }
                let start = cur.pos;
                let total_len = u32::from_le_bytes(
                    page[start..start + 4].try_into().expect("sized"),
                ) as usize;
                if total_len == 0 {
                    // End of written WAL.
                    break 'pages;
                }
                if total_len < RECORD_HEADER_LEN {
                    return Err(
                        Error::CorruptWal(format!("record length {total_len} too small")).into(),
                    );
                }
                let lsn = Lsn(page_addr + start as u64);
                if total_len <= cur.remaining() {
                    let buf = cur.take(total_len)?;
                    records.push(decode_record(lsn, buf)?);
                } else {
                    let tail = cur.take(cur.remaining())?;
                    self.partial = Some(PartialRecord {
                        lsn,
                        total_len,
                        buf: tail.to_vec(),
                    });
                    continue 'pages;
                }
            }
        }
        Ok(records)
    }
}

fn decode_record(lsn: Lsn, buf: &[u8]) -> Result<WalRecord> {
    let mut cur = Cursor::new(buf);
    let total_len = cur.u32()?;
    let xid = cur.u32()?;
    let prev = Lsn(cur.u64()?);
    let info = cur.u8()?;
    let rmid = cur.u8()?;
    cur.skip(2)?;
    let crc = cur.u32()?;
    debug_assert_eq!(total_len as usize, buf.len());

    let descriptor = rmgr::lookup(rmid)?;
    let header = RecordHeader {
        total_len,
        xid,
        prev,
        info,
        rmid,
        crc,
    };

    if record_crc(buf) != crc {
        return Ok(WalRecord {
            lsn,
            header,
            blocks: Vec::new(),
            crc_ok: false,
        });
    }

    let refs = decode_block_references(&buf[RECORD_HEADER_LEN..])?;
    Ok(WalRecord {
        lsn,
        header,
        blocks: (descriptor.decode_blocks)(&refs),
        crc_ok: true,
    })
}

/// Walk the block-reference headers at the front of a record body. Pure
/// over the byte cursor; the data the headers describe is skipped, not
/// read.
pub fn decode_block_references(data: &[u8]) -> Result<Vec<BlockRef>> {
    let mut cur = Cursor::new(data);
    let mut refs = Vec::new();
    let mut datatotal: u64 = 0;
    let mut prev_node: Option<RelFileNode> = None;

    while (cur.remaining() as u64) > datatotal {
        let id = cur.u8()?;
        match id {
            XLR_BLOCK_ID_DATA_SHORT => {
                datatotal += cur.u8()? as u64;
            }
            XLR_BLOCK_ID_DATA_LONG => {
                datatotal += cur.u32()? as u64;
            }
            XLR_BLOCK_ID_ORIGIN => {
                cur.skip(2)?;
            }
            XLR_BLOCK_ID_TOPLEVEL_XID => {
                cur.skip(4)?;
            }
            id if id <= XLR_MAX_BLOCK_ID => {
                let fork_flags = cur.u8()?;
                let data_len = cur.u16()?;
                if fork_flags & BKPBLOCK_HAS_DATA != 0 {
                    datatotal += data_len as u64;
                } else if data_len != 0 {
                    return Err(
                        Error::CorruptWal("block data length without HAS_DATA".into()).into(),
                    );
                }
                if fork_flags & BKPBLOCK_HAS_IMAGE != 0 {
                    let image_len = cur.u16()?;
                    let _hole_offset = cur.u16()?;
                    let image_info = cur.u8()?;
                    if image_info & BKPIMAGE_HAS_HOLE != 0
                        && image_info & BKPIMAGE_IS_COMPRESSED != 0
                    {
                        cur.skip(2)?;
                    }
                    datatotal += image_len as u64;
                }
                let node = if fork_flags & BKPBLOCK_SAME_REL == 0 {
                    let node = RelFileNode {
                        spc_node: cur.u32()?,
                        db_node: cur.u32()?,
                        rel_node: cur.u32()?,
                    };
                    prev_node = Some(node);
                    node
                } else {
                    prev_node.ok_or_else(|| {
                        Error::CorruptWal("SAME_REL without a prior relation".into())
                    })?
                };
                let block_no = cur.u32()?;
                refs.push(BlockRef {
                    node,
                    fork: fork_flags & BKPBLOCK_FORK_MASK,
                    block_no,
                });
            }
            other => {
                return Err(Error::CorruptWal(format!("invalid block id {other}")).into());
            }
        }
    }
    Ok(refs)
}

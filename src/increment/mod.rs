//! The page-increment file format.
//!
//! An increment carries only the pages of a relation file whose LSN exceeds
//! the baseline, framed as:
//!
//! `magic "wi" | version | reserved | base LSN (u64 BE) | file size (u64 LE)
//!  | diff block count (u32 LE) | diff map (u32 LE, ascending) | page bodies`
//!
//! Numeric fields other than the LSN are little-endian; the diff map and the
//! bodies share one ascending block order.

use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::fs::FileExt;

use tracing::debug;

use crate::pg::page::{PageClass, PageClassifier, VerifyPolicy};
use crate::pg::{Lsn, PAGE_SIZE};
use crate::{Error, Result};

pub const INCREMENT_MAGIC: [u8; 2] = *b"wi";
pub const INCREMENT_VERSION: u8 = 1;
const RESERVED: u8 = 0x55;
/// Fixed bytes before the diff map.
pub const INCREMENT_HEADER_LEN: u64 = 4 + 8 + 8 + 4;

/// Decoded increment header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementHeader {
    pub base_lsn: Lsn,
    pub file_size: u64,
    pub diff_map: Vec<u32>,
}

/// Result of classifying a relation file ahead of increment encoding.
#[derive(Debug, Clone)]
pub struct IncrementPlan {
    pub base_lsn: Lsn,
    /// Page-aligned byte size observed during the scan.
    pub file_size: u64,
    pub diff_blocks: Vec<u32>,
    pub corrupt_blocks: Vec<u32>,
}

impl IncrementPlan {
    pub fn is_empty(&self) -> bool {
        self.diff_blocks.is_empty() && self.corrupt_blocks.is_empty()
    }

    /// Exact encoded size, needed for the tar entry header.
    pub fn encoded_size(&self) -> u64 {
        let blocks = (self.diff_blocks.len() + self.corrupt_blocks.len()) as u64;
        INCREMENT_HEADER_LEN + blocks * 4 + blocks * PAGE_SIZE as u64
    }

    /// All blocks going into the increment, ascending.
    fn included_blocks(&self) -> Vec<u32> {
        let mut blocks: Vec<u32> = self
            .diff_blocks
            .iter()
            .chain(self.corrupt_blocks.iter())
            .copied()
            .collect();
        blocks.sort_unstable();
        blocks
    }
}

/// First pass: stream the file once through the page classifier and record
/// which blocks belong in the increment.
pub fn plan_increment<R: Read>(
    reader: R,
    path_label: &str,
    base_lsn: Lsn,
    block_offset: u32,
    allowed_blocks: Option<std::collections::BTreeSet<u32>>,
    verify: VerifyPolicy,
) -> Result<IncrementPlan> {
    let mut classifier = PageClassifier::new(
        reader,
        path_label,
        base_lsn,
        block_offset,
        allowed_blocks,
        verify,
    );
    let mut diff_blocks = Vec::new();
    let mut blocks_seen: u64 = 0;
    for page in classifier.by_ref() {
        let page = page?;
        blocks_seen += 1;
        match page.class {
            PageClass::Included => diff_blocks.push(page.block_no),
            PageClass::Hole | PageClass::Skipped | PageClass::Corrupt => {}
        }
    }
    Ok(IncrementPlan {
        base_lsn,
        file_size: blocks_seen * PAGE_SIZE as u64,
        diff_blocks,
        corrupt_blocks: classifier.corrupt_blocks().to_vec(),
    })
}

fn encode_header(plan: &IncrementPlan, blocks: &[u32]) -> Vec<u8> {
    let mut header = Vec::with_capacity(INCREMENT_HEADER_LEN as usize + blocks.len() * 4);
    header.extend_from_slice(&INCREMENT_MAGIC);
    header.push(INCREMENT_VERSION);
    header.push(RESERVED);
    header.extend_from_slice(&plan.base_lsn.0.to_be_bytes());
    header.extend_from_slice(&plan.file_size.to_le_bytes());
    header.extend_from_slice(&(blocks.len() as u32).to_le_bytes());
    for block in blocks {
        header.extend_from_slice(&block.to_le_bytes());
    }
    header
}

/// Second pass: frame the increment, reading each included page at its
/// offset.
pub fn write_increment<W: Write>(out: &mut W, file: &File, plan: &IncrementPlan) -> Result<()> {
    let blocks = plan.included_blocks();
    out.write_all(&encode_header(plan, &blocks))?;
    let mut page = vec![0u8; PAGE_SIZE];
    for block in &blocks {
        file.read_exact_at(&mut page, *block as u64 * PAGE_SIZE as u64)?;
        out.write_all(&page)?;
    }
    Ok(())
}

/// Streaming second pass over an open file, shaped as a reader so a tar
/// entry of known size can consume it without buffering the increment.
pub struct IncrementReader {
    file: File,
    prefix: Vec<u8>,
    prefix_pos: usize,
    blocks: std::vec::IntoIter<u32>,
    page: Vec<u8>,
    page_pos: usize,
}

impl IncrementReader {
    pub fn new(file: File, plan: &IncrementPlan) -> Self {
        let blocks = plan.included_blocks();
        Self {
            file,
            prefix: encode_header(plan, &blocks),
            prefix_pos: 0,
            blocks: blocks.into_iter(),
            page: Vec::new(),
            page_pos: 0,
        }
    }
}

impl Read for IncrementReader {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        if self.prefix_pos < self.prefix.len() {
            let n = (self.prefix.len() - self.prefix_pos).min(out.len());
            out[..n].copy_from_slice(&self.prefix[self.prefix_pos..self.prefix_pos + n]);
            self.prefix_pos += n;
            return Ok(n);
        }
        if self.page_pos >= self.page.len() {
            match self.blocks.next() {
                None => return Ok(0),
                Some(block) => {
                    self.page.resize(PAGE_SIZE, 0);
                    self.file
                        .read_exact_at(&mut self.page, block as u64 * PAGE_SIZE as u64)?;
                    self.page_pos = 0;
                }
            }
        }
        let n = (self.page.len() - self.page_pos).min(out.len());
        out[..n].copy_from_slice(&self.page[self.page_pos..self.page_pos + n]);
        self.page_pos += n;
        Ok(n)
    }
}

/// Parse and validate the increment header. The diff map must ascend
/// strictly and every block must fall inside the declared file size.
pub fn read_increment_header<R: Read>(increment: &mut R) -> Result<IncrementHeader> {
    let mut fixed = [0u8; INCREMENT_HEADER_LEN as usize];
    increment.read_exact(&mut fixed)?;
    if fixed[0..2] != INCREMENT_MAGIC {
        return Err(Error::CorruptIncrement("bad magic".into()).into());
    }
    if fixed[2] != INCREMENT_VERSION {
        return Err(Error::CorruptIncrement(format!("unsupported version {}", fixed[2])).into());
    }
    let base_lsn = Lsn(u64::from_be_bytes(fixed[4..12].try_into().expect("header")));
    let file_size = u64::from_le_bytes(fixed[12..20].try_into().expect("header"));
    let diff_block_count = u32::from_le_bytes(fixed[20..24].try_into().expect("header"));

    if file_size % PAGE_SIZE as u64 != 0 {
        return Err(
            Error::CorruptIncrement(format!("file size {file_size} not page aligned")).into(),
        );
    }
    let page_count = file_size / PAGE_SIZE as u64;
    if diff_block_count as u64 > page_count {
        return Err(Error::CorruptIncrement(format!(
            "diff block count {diff_block_count} exceeds {page_count} pages"
        ))
        .into());
    }

    let mut map_bytes = vec![0u8; diff_block_count as usize * 4];
    increment.read_exact(&mut map_bytes)?;
    let mut diff_map = Vec::with_capacity(diff_block_count as usize);
    let mut previous: Option<u32> = None;
    for chunk in map_bytes.chunks_exact(4) {
        let block = u32::from_le_bytes(chunk.try_into().expect("chunked"));
        if let Some(previous) = previous {
            if block <= previous {
                return Err(Error::CorruptIncrement("diff map not ascending".into()).into());
            }
        }
        if block as u64 >= page_count {
            return Err(Error::CorruptIncrement(format!(
                "block {block} outside {page_count}-page file"
            ))
            .into());
        }
        previous = Some(block);
        diff_map.push(block);
    }

    Ok(IncrementHeader {
        base_lsn,
        file_size,
        diff_map,
    })
}

/// Materialize a file from an increment alone: included pages at their
/// offsets, zero pages everywhere else.
pub fn create_file_from_increment<R: Read>(increment: &mut R, target: &File) -> Result<u64> {
    let header = read_increment_header(increment)?;
    target.set_len(header.file_size)?;

    let mut next_included = header.diff_map.iter().copied().peekable();
    let zero_page = vec![0u8; PAGE_SIZE];
    let mut page = vec![0u8; PAGE_SIZE];
    let page_count = header.file_size / PAGE_SIZE as u64;
    for block in 0..page_count {
        let offset = block * PAGE_SIZE as u64;
        if next_included.peek() == Some(&(block as u32)) {
            next_included.next();
            increment.read_exact(&mut page)?;
            target.write_all_at(&page, offset)?;
        } else {
            target.write_all_at(&zero_page, offset)?;
        }
    }
    if !reader_is_empty(increment) {
        debug!("extra increment bytes past the last mapped page, ignoring");
    }
    Ok(header.file_size)
}

/// Patch mode: write increment pages into an existing file. Blocks beyond
/// the target's current page count are consumed and dropped (a newer backup
/// may have shrunk the file). Returns the increment's declared file size so
/// callers can reconcile a larger pre-existing target.
pub fn write_pages_from_increment<R: Read>(
    increment: &mut R,
    target: &File,
    overwrite: bool,
) -> Result<u64> {
    let header = read_increment_header(increment)?;
    let target_page_count = target.metadata()?.len() / PAGE_SIZE as u64;

    let mut page = vec![0u8; PAGE_SIZE];
    for block in header.diff_map {
        increment.read_exact(&mut page)?;
        if block as u64 >= target_page_count {
            continue;
        }
        write_page(target, block as u64, &page, overwrite)?;
    }
    if !reader_is_empty(increment) {
        return Err(Error::CorruptIncrement("trailing bytes after mapped pages".into()).into());
    }
    Ok(header.file_size)
}

/// Fill never-written pages of `target` from its base-backup version. The
/// base stream supplies pages in file order; pages the target already has
/// are consumed and discarded.
pub fn restore_missing_pages<R: Read>(base: &mut R, target: &File) -> Result<()> {
    let target_page_count = target.metadata()?.len() / PAGE_SIZE as u64;
    let mut page = vec![0u8; PAGE_SIZE];
    for block in 0..target_page_count {
        if !read_full_or_eof(base, &mut page)? {
            break;
        }
        write_page(target, block, &page, false)?;
    }
    if !reader_is_empty(base) {
        debug!("base copy longer than target, possibly truncated since backup");
    }
    Ok(())
}

fn write_page(target: &File, block: u64, page: &[u8], overwrite: bool) -> Result<()> {
    if !overwrite && !page_is_missing(target, block)? {
        return Ok(());
    }
    target.write_all_at(page, block * PAGE_SIZE as u64)?;
    Ok(())
}

/// A page is missing when its stored LSN bytes are all zero.
fn page_is_missing(target: &File, block: u64) -> Result<bool> {
    let mut header = [0u8; 8];
    target.read_exact_at(&mut header, block * PAGE_SIZE as u64)?;
    Ok(header.iter().all(|b| *b == 0))
}

fn read_full_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(Error::CorruptIncrement("short page in stream".into()).into());
        }
        filled += n;
    }
    Ok(true)
}

fn reader_is_empty<R: Read>(reader: &mut R) -> bool {
    let mut probe = [0u8; 1];
    matches!(reader.read(&mut probe), Ok(0))
}

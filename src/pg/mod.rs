//! PostgreSQL on-disk primitives: LSNs, relation file identity and WAL
//! segment naming.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Error, Result};

pub mod control;
pub mod page;

/// Relation block size (`BLCKSZ`, 8 KiB).
pub const PAGE_SIZE: usize = 8192;
/// Relation segment size in blocks (`RELSEG_SIZE`): 1 GiB per segment file.
pub const BLOCKS_PER_RELATION_SEGMENT: u32 = 131_072;
/// Default WAL segment size, overridable per cluster.
pub const DEFAULT_WAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

pub const DEFAULT_TABLESPACE_OID: Oid = 1663;
pub const GLOBAL_TABLESPACE_OID: Oid = 1664;

pub type Oid = u32;
pub type TimelineId = u32;

/// 64-bit WAL position. Compared as an unsigned integer, rendered as the
/// usual `XX/YY` hex pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const fn new(hi: u32, lo: u32) -> Self {
        Self(((hi as u64) << 32) | lo as u64)
    }

    pub fn segment_no(self, wal_segment_size: u64) -> u64 {
        self.0 / wal_segment_size
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidSetting {
            name: "lsn",
            value: s.to_string(),
        };
        let (hi, lo) = s.split_once('/').ok_or_else(invalid)?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| invalid())?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| invalid())?;
        Ok(Lsn::new(hi, lo))
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Identity of a relation's on-disk file: tablespace, database and relation
/// oids. Segment number is carried separately where it matters.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct RelFileNode {
    pub spc_node: Oid,
    pub db_node: Oid,
    pub rel_node: Oid,
}

impl fmt::Display for RelFileNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.spc_node, self.db_node, self.rel_node)
    }
}

/// A paged relation file found while walking the data directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationFileInfo {
    pub node: RelFileNode,
    pub segment_no: u32,
}

impl RelationFileInfo {
    /// Block-number offset of this segment file within the whole relation.
    pub fn block_offset(&self) -> u32 {
        self.segment_no * BLOCKS_PER_RELATION_SEGMENT
    }
}

// PostgreSQL OID is u32: up to 10 decimal digits.
const MAX_OID_DIGITS: usize = 10;
const MAX_SEGMENT_DIGITS: usize = 5;

fn parse_oid(raw: &str) -> Option<Oid> {
    if raw.is_empty() || raw.len() > MAX_OID_DIGITS {
        return None;
    }
    raw.parse().ok()
}

/// Classify a path relative to the data directory as a main-fork relation
/// file. Fork files (`_fsm`, `_vm`, `_init`) and anything that does not look
/// like `base/<db>/<rel>[.<seg>]`, `global/<rel>[.<seg>]` or
/// `pg_tblspc/<spc>/<version>/<db>/<rel>[.<seg>]` is not paged.
pub fn parse_relation_path(relative: &Path) -> Option<RelationFileInfo> {
    let parts: Vec<&str> = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;

    let (spc_node, db_node, file_name) = match parts.as_slice() {
        ["global", file] => (GLOBAL_TABLESPACE_OID, 0, *file),
        ["base", db, file] => (DEFAULT_TABLESPACE_OID, parse_oid(db)?, *file),
        ["pg_tblspc", spc, _version, db, file] => (parse_oid(spc)?, parse_oid(db)?, *file),
        _ => return None,
    };

    let (rel_raw, segment_no) = match file_name.split_once('.') {
        None => (file_name, 0),
        Some((rel, seg)) => {
            if seg.is_empty() || seg.len() > MAX_SEGMENT_DIGITS {
                return None;
            }
            (rel, seg.parse().ok()?)
        }
    };

    let rel_node = parse_oid(rel_raw)?;
    Some(RelationFileInfo {
        node: RelFileNode {
            spc_node,
            db_node,
            rel_node,
        },
        segment_no,
    })
}

/// Segments per `xlogid` for the given segment size.
fn segments_per_xlog_id(wal_segment_size: u64) -> u64 {
    0x1_0000_0000 / wal_segment_size
}

/// Canonical 24-hex-digit WAL segment file name.
pub fn wal_segment_name(timeline: TimelineId, segment_no: u64, wal_segment_size: u64) -> String {
    let per_id = segments_per_xlog_id(wal_segment_size);
    format!(
        "{:08X}{:08X}{:08X}",
        timeline,
        segment_no / per_id,
        segment_no % per_id
    )
}

/// WAL segment file name containing `lsn`.
pub fn wal_segment_name_for_lsn(timeline: TimelineId, lsn: Lsn, wal_segment_size: u64) -> String {
    wal_segment_name(timeline, lsn.segment_no(wal_segment_size), wal_segment_size)
}

/// Parse a 24-hex-digit WAL segment file name back into its timeline and
/// segment number.
pub fn parse_wal_segment_name(name: &str, wal_segment_size: u64) -> Result<(TimelineId, u64)> {
    let invalid = || Error::InvalidSetting {
        name: "wal segment name",
        value: name.to_string(),
    };
    if name.len() != 24 || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid().into());
    }
    let timeline = u32::from_str_radix(&name[0..8], 16).map_err(|_| invalid())?;
    let hi = u64::from_str_radix(&name[8..16], 16).map_err(|_| invalid())?;
    let lo = u64::from_str_radix(&name[16..24], 16).map_err(|_| invalid())?;
    Ok((timeline, hi * segments_per_xlog_id(wal_segment_size) + lo))
}

/// LSN at which the given segment starts.
pub fn segment_start_lsn(segment_no: u64, wal_segment_size: u64) -> Lsn {
    Lsn(segment_no * wal_segment_size)
}

//! The backup sentinel: the JSON object whose presence in storage commits a
//! backup.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pg::Lsn;
use crate::storage::SENTINEL_SUFFIX;
use crate::wal::delta_map::DeltaMapDto;

/// Per-file entry of the sentinel's `Files` map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileDescription {
    #[serde(rename = "MTime")]
    pub mtime: DateTime<Utc>,
    #[serde(rename = "Size")]
    pub size: u64,
    #[serde(rename = "IsIncremented", default)]
    pub is_incremented: bool,
    #[serde(rename = "IsSkipped", default)]
    pub is_skipped: bool,
    #[serde(rename = "CorruptBlocks", default, skip_serializing_if = "Vec::is_empty")]
    pub corrupt_blocks: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSentinel {
    #[serde(rename = "BackupName")]
    pub backup_name: String,
    #[serde(rename = "StartLSN")]
    pub start_lsn: Lsn,
    #[serde(rename = "FinishLSN")]
    pub finish_lsn: Lsn,
    #[serde(
        rename = "SystemIdentifier",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub system_identifier: Option<u64>,
    #[serde(rename = "PgVersion")]
    pub pg_version: i32,
    #[serde(rename = "FinishTime")]
    pub finish_time: DateTime<Utc>,
    #[serde(rename = "Hostname", default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(rename = "DataDir")]
    pub data_dir: String,
    #[serde(
        rename = "IncrementFrom",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub increment_from: Option<String>,
    #[serde(
        rename = "IncrementFromLSN",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub increment_from_lsn: Option<Lsn>,
    #[serde(
        rename = "IncrementFullName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub increment_full_name: Option<String>,
    #[serde(rename = "IsPermanent", default)]
    pub is_permanent: bool,
    #[serde(rename = "Files")]
    pub files: BTreeMap<String, FileDescription>,
    #[serde(
        rename = "TablespaceSpec",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub tablespace_spec: Option<BTreeMap<String, String>>,
    /// Blocks the WAL window of this backup touched; narrows the page scans
    /// of the next incremental.
    #[serde(rename = "DeltaMap", default, skip_serializing_if = "Option::is_none")]
    pub delta_map: Option<DeltaMapDto>,
}

impl BackupSentinel {
    pub fn is_incremental(&self) -> bool {
        self.increment_from.is_some()
    }

    /// Object name of this backup's sentinel within the base-backup folder.
    pub fn object_name(backup_name: &str) -> String {
        format!("{backup_name}{SENTINEL_SUFFIX}")
    }
}

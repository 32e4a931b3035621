//! Backup domain: naming, sentinel storage, chain resolution, push and
//! fetch.

use std::io::Read;
use std::sync::Arc;
use std::time::SystemTime;

use crate::storage::{Folder, SENTINEL_SUFFIX};
use crate::{Error, Result};

pub mod chain;
pub mod fetch;
pub mod push;
pub mod retention;
pub mod sentinel;

pub use chain::resolve_chain;
pub use sentinel::{BackupSentinel, FileDescription};

pub const BACKUP_NAME_PREFIX: &str = "base_";
const DELTA_NAME_SEPARATOR: &str = "_D_";
/// Selector resolving to the most recent committed backup.
pub const LATEST: &str = "LATEST";

/// Backups are content-addressed by the WAL segment their copy started in:
/// `base_<walfile>` for fulls, `base_<walfile>_D_<basewalfile>` for
/// increments.
pub fn backup_name(start_wal_file: &str, increment_base_wal: Option<&str>) -> String {
    match increment_base_wal {
        None => format!("{BACKUP_NAME_PREFIX}{start_wal_file}"),
        Some(base) => format!("{BACKUP_NAME_PREFIX}{start_wal_file}{DELTA_NAME_SEPARATOR}{base}"),
    }
}

/// The WAL segment a backup name starts in.
pub fn wal_file_of_backup_name(name: &str) -> Option<&str> {
    let stripped = name.strip_prefix(BACKUP_NAME_PREFIX)?;
    Some(match stripped.split_once(DELTA_NAME_SEPARATOR) {
        Some((wal, _base)) => wal,
        None => stripped,
    })
}

/// A committed backup as seen in a sentinel listing.
#[derive(Debug, Clone)]
pub struct BackupTime {
    pub name: String,
    pub modified: SystemTime,
    pub wal_file: String,
}

/// Committed backups under the base-backup folder, oldest first.
pub fn list_backups(base_folder: &Arc<dyn Folder>) -> Result<Vec<BackupTime>> {
    let (objects, _) = base_folder.list()?;
    let mut backups: Vec<BackupTime> = objects
        .into_iter()
        .filter_map(|object| {
            let name = object.name.strip_suffix(SENTINEL_SUFFIX)?.to_string();
            let wal_file = wal_file_of_backup_name(&name)?.to_string();
            Some(BackupTime {
                name,
                modified: object.last_modified,
                wal_file,
            })
        })
        .collect();
    backups.sort_by_key(|b| b.modified);
    Ok(backups)
}

/// Resolve `LATEST` (newest sentinel by modification time) or verify a
/// named backup exists.
pub fn resolve_backup_name(base_folder: &Arc<dyn Folder>, selector: &str) -> Result<String> {
    if selector == LATEST {
        return list_backups(base_folder)?
            .pop()
            .map(|b| b.name)
            .ok_or_else(|| Error::MissingBackup("no backups found".into()).into());
    }
    if !base_folder.exists(&BackupSentinel::object_name(selector))? {
        return Err(Error::MissingBackup(selector.to_string()).into());
    }
    Ok(selector.to_string())
}

/// Load and parse a backup's sentinel.
pub fn fetch_sentinel(base_folder: &Arc<dyn Folder>, backup_name: &str) -> Result<BackupSentinel> {
    let object = BackupSentinel::object_name(backup_name);
    if !base_folder.exists(&object)? {
        return Err(Error::MissingBackup(backup_name.to_string()).into());
    }
    let mut reader = base_folder.get_object(&object)?;
    let mut raw = Vec::new();
    reader.read_to_end(&mut raw)?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Upload a sentinel; its existence is the backup's commit barrier.
pub fn upload_sentinel(
    base_folder: &Arc<dyn Folder>,
    sentinel: &BackupSentinel,
) -> Result<()> {
    let raw = serde_json::to_vec_pretty(sentinel)?;
    base_folder.put_object(
        &BackupSentinel::object_name(&sentinel.backup_name),
        &mut raw.as_slice(),
    )
}

//! Object-store boundary.
//!
//! The backup engine talks to storage exclusively through [`Folder`]; the
//! concrete adapters (filesystem here, anything else elsewhere) own
//! endpoints and credentials.

use std::io::Read;
use std::sync::Arc;
use std::time::SystemTime;

use crate::Result;

pub mod fs;
pub mod memory;

/// Key prefix for base backups under the storage root.
pub const BASE_BACKUPS_PATH: &str = "basebackups_005";
/// Key prefix for archived WAL segments under the storage root.
pub const WAL_PATH: &str = "wal_005";
/// Subfolder of one backup holding its tar partitions.
pub const TAR_PARTITIONS_PATH: &str = "tar_partitions";
/// The object whose existence commits a backup.
pub const SENTINEL_SUFFIX: &str = "_backup_stop_sentinel.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Name relative to the listed folder.
    pub name: String,
    pub last_modified: SystemTime,
    pub size: u64,
}

pub trait Folder: Send + Sync {
    /// Human-readable location of this folder, for logging.
    fn describe(&self) -> String;

    fn put_object(&self, name: &str, content: &mut dyn Read) -> Result<()>;

    fn get_object(&self, name: &str) -> Result<Box<dyn Read + Send>>;

    fn exists(&self, name: &str) -> Result<bool>;

    /// Immediate objects and subfolder names, non-recursive.
    fn list(&self) -> Result<(Vec<ObjectInfo>, Vec<String>)>;

    /// All objects below this folder; names keep their `/` separators.
    fn list_recursively(&self) -> Result<Vec<ObjectInfo>>;

    /// Delete the named objects. Missing objects are not an error.
    fn delete_objects(&self, names: &[String]) -> Result<()>;

    fn sub_folder(&self, name: &str) -> Arc<dyn Folder>;
}

impl std::fmt::Debug for dyn Folder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Folder").field(&self.describe()).finish()
    }
}

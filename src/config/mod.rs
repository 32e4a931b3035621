//! Environment-resolved configuration, threaded through constructors.
//!
//! All settings are read once into a [`Config`] value; components never
//! consult the process environment themselves.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::compress::CompressionMethod;
use crate::storage::{fs::FsFolder, Folder};
use crate::{Error, Result};

pub const FILE_PREFIX_SETTING: &str = "WALG_FILE_PREFIX";
pub const COMPRESSION_METHOD_SETTING: &str = "WALG_COMPRESSION_METHOD";
pub const UPLOAD_CONCURRENCY_SETTING: &str = "WALG_UPLOAD_CONCURRENCY";
pub const DOWNLOAD_CONCURRENCY_SETTING: &str = "WALG_DOWNLOAD_CONCURRENCY";
pub const DELTA_MAX_STEPS_SETTING: &str = "WALG_DELTA_MAX_STEPS";
pub const DELTA_ORIGIN_SETTING: &str = "WALG_DELTA_ORIGIN";
pub const PREVENT_WAL_OVERWRITE_SETTING: &str = "WALG_PREVENT_WAL_OVERWRITE";
pub const TAR_SIZE_THRESHOLD_SETTING: &str = "WALG_TAR_SIZE_THRESHOLD";
pub const PGP_KEY_SETTING: &str = "PGP_KEY";
pub const PGP_KEY_PATH_SETTING: &str = "PGP_KEY_PATH";
pub const PGP_KEY_PASSPHRASE_SETTING: &str = "PGP_KEY_PASSPHRASE";
pub const PG_WAL_SIZE_SETTING: &str = "PG_WAL_SIZE";
pub const UPLOAD_WAL_METADATA_SETTING: &str = "WALG_UPLOAD_WAL_METADATA";
pub const TOTAL_BG_UPLOADED_LIMIT_SETTING: &str = "TOTAL_BG_UPLOADED_LIMIT";

pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 4;
pub const DEFAULT_DOWNLOAD_CONCURRENCY: usize = 4;
/// Upper bound on a tar partition's accumulated uncompressed size.
pub const DEFAULT_TAR_SIZE_THRESHOLD: u64 = 1 << 30;
pub const DEFAULT_TOTAL_BG_UPLOADED_LIMIT: u32 = 32;

/// Which backup an incremental is chained onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeltaOrigin {
    #[default]
    Latest,
    LatestFull,
}

/// Per-WAL metadata upload policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WalMetadataLevel {
    #[default]
    NoMetadata,
    Individual,
    Bulk,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub file_prefix: Option<PathBuf>,
    pub compression: CompressionMethod,
    pub upload_concurrency: usize,
    pub download_concurrency: usize,
    pub delta_max_steps: u32,
    pub delta_origin: DeltaOrigin,
    pub prevent_wal_overwrite: bool,
    pub tar_size_threshold: u64,
    pub pgp_key: Option<String>,
    pub pgp_key_path: Option<PathBuf>,
    pub pgp_key_passphrase: Option<String>,
    /// WAL segment size override, bytes. Normally discovered from the server.
    pub wal_segment_size: Option<u64>,
    pub wal_metadata_level: WalMetadataLevel,
    pub total_bg_uploaded_limit: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_map(&vars)
    }

    /// Resolve a configuration from an explicit key/value map. The `copy`
    /// command uses this to load source and destination JSON config files.
    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| vars.get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let compression = match get(COMPRESSION_METHOD_SETTING) {
            Some(raw) => CompressionMethod::from_name(&raw).ok_or(Error::InvalidSetting {
                name: COMPRESSION_METHOD_SETTING,
                value: raw,
            })?,
            None => CompressionMethod::Lz4,
        };

        let delta_origin = match get(DELTA_ORIGIN_SETTING).as_deref() {
            None | Some("LATEST") => DeltaOrigin::Latest,
            Some("LATEST_FULL") => DeltaOrigin::LatestFull,
            Some(other) => {
                return Err(Error::InvalidSetting {
                    name: DELTA_ORIGIN_SETTING,
                    value: other.to_string(),
                }
                .into())
            }
        };

        let wal_metadata_level = match get(UPLOAD_WAL_METADATA_SETTING).as_deref() {
            None | Some("NOMETADATA") => WalMetadataLevel::NoMetadata,
            Some("INDIVIDUAL") => WalMetadataLevel::Individual,
            Some("BULK") => WalMetadataLevel::Bulk,
            Some(other) => {
                return Err(Error::InvalidSetting {
                    name: UPLOAD_WAL_METADATA_SETTING,
                    value: other.to_string(),
                }
                .into())
            }
        };

        Ok(Self {
            file_prefix: get(FILE_PREFIX_SETTING).map(PathBuf::from),
            compression,
            upload_concurrency: parse_or(
                get(UPLOAD_CONCURRENCY_SETTING),
                UPLOAD_CONCURRENCY_SETTING,
                DEFAULT_UPLOAD_CONCURRENCY,
            )?,
            download_concurrency: parse_or(
                get(DOWNLOAD_CONCURRENCY_SETTING),
                DOWNLOAD_CONCURRENCY_SETTING,
                DEFAULT_DOWNLOAD_CONCURRENCY,
            )?,
            delta_max_steps: parse_or(get(DELTA_MAX_STEPS_SETTING), DELTA_MAX_STEPS_SETTING, 0)?,
            delta_origin,
            prevent_wal_overwrite: parse_bool(
                get(PREVENT_WAL_OVERWRITE_SETTING),
                PREVENT_WAL_OVERWRITE_SETTING,
            )?,
            tar_size_threshold: parse_or(
                get(TAR_SIZE_THRESHOLD_SETTING),
                TAR_SIZE_THRESHOLD_SETTING,
                DEFAULT_TAR_SIZE_THRESHOLD,
            )?,
            pgp_key: get(PGP_KEY_SETTING),
            pgp_key_path: get(PGP_KEY_PATH_SETTING).map(PathBuf::from),
            pgp_key_passphrase: get(PGP_KEY_PASSPHRASE_SETTING),
            wal_segment_size: get(PG_WAL_SIZE_SETTING)
                .map(|raw| {
                    raw.parse::<u64>()
                        .map(|mib| mib * 1024 * 1024)
                        .map_err(|_| Error::InvalidSetting {
                            name: PG_WAL_SIZE_SETTING,
                            value: raw,
                        })
                })
                .transpose()?,
            wal_metadata_level,
            total_bg_uploaded_limit: parse_or(
                get(TOTAL_BG_UPLOADED_LIMIT_SETTING),
                TOTAL_BG_UPLOADED_LIMIT_SETTING,
                DEFAULT_TOTAL_BG_UPLOADED_LIMIT,
            )?,
        })
    }

    /// Load a config from a JSON file holding a flat string/string map.
    pub fn load_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read(path)?;
        let vars: HashMap<String, String> = serde_json::from_slice(&contents)?;
        Self::from_map(&vars)
    }

    /// The configured object-store root. Storage credentials and endpoints
    /// are opaque to the backup engine; everything behind [`Folder`] is an
    /// adapter concern.
    pub fn storage_root(&self) -> Result<Arc<dyn Folder>> {
        let prefix = self
            .file_prefix
            .as_ref()
            .ok_or(Error::MissingSetting(FILE_PREFIX_SETTING))?;
        Ok(Arc::new(FsFolder::new(prefix)?))
    }
}

fn parse_or<T: std::str::FromStr>(
    raw: Option<String>,
    name: &'static str,
    default: T,
) -> Result<T> {
    match raw {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| Error::InvalidSetting { name, value: raw }.into()),
    }
}

fn parse_bool(raw: Option<String>, name: &'static str) -> Result<bool> {
    match raw.as_deref() {
        None => Ok(false),
        Some("true") | Some("TRUE") | Some("1") | Some("on") => Ok(true),
        Some("false") | Some("FALSE") | Some("0") | Some("off") => Ok(false),
        Some(other) => Err(Error::InvalidSetting {
            name,
            value: other.to_string(),
        }
        .into()),
    }
}

//! WAL archiving: `wal-push` / `wal-fetch`, the background `.ready`
//! uploader, per-WAL metadata, and delta-map scans over archived segments.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::compress::{decrypt_and_decompress, CompressionMethod};
use crate::config::{Config, WalMetadataLevel};
use crate::crypto::Crypter;
use crate::logging::MetricsSink;
use crate::pg::{parse_wal_segment_name, wal_segment_name, Lsn, TimelineId};
use crate::storage::{Folder, WAL_PATH};
use crate::upload::Uploader;
use crate::wal::{DeltaMap, WalStreamParser};
use crate::{Error, Result};

/// Segments per consolidated metadata group.
pub const WAL_METADATA_GROUP: u64 = 16;

/// True when `segment_no` is the last segment of its metadata group; the
/// explicit boundary predicate that triggers the bulk flush.
pub fn closes_segment_group(segment_no: u64) -> bool {
    segment_no % WAL_METADATA_GROUP == WAL_METADATA_GROUP - 1
}

/// Spool directory for walvault's own archive bookkeeping, next to the
/// cluster's data.
fn spool_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(".walvault")
}

/// Tracks which segments the background uploader already shipped, so the
/// foreground `archive_command` call can skip them. A leaf owning only its
/// directory path.
pub struct ArchiveStatusManager {
    status_dir: PathBuf,
}

impl ArchiveStatusManager {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            status_dir: spool_dir(data_dir).join("archive_status"),
        }
    }

    fn marker(&self, wal_name: &str) -> PathBuf {
        self.status_dir.join(wal_name)
    }

    pub fn is_wal_already_uploaded(&self, wal_name: &str) -> bool {
        self.marker(wal_name).exists()
    }

    pub fn mark_uploaded(&self, wal_name: &str) -> Result<()> {
        fs::create_dir_all(&self.status_dir)?;
        fs::write(self.marker(wal_name), b"")?;
        Ok(())
    }

    pub fn unmark_wal_file(&self, wal_name: &str) -> Result<()> {
        match fs::remove_file(self.marker(wal_name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// While the foreground segment uploads, ship further `.ready` segments in
/// the background. Holds the shared [`Uploader`] by reference-counted
/// handle; the status manager is its own leaf.
pub struct BgUploader {
    uploader: Arc<Uploader>,
    status: Arc<ArchiveStatusManager>,
    wal_dir: PathBuf,
    exclude: String,
    limit: u32,
    workers: usize,
    prevent_overwrite: bool,
}

impl BgUploader {
    pub fn new(
        uploader: Arc<Uploader>,
        data_dir: &Path,
        wal_dir: PathBuf,
        exclude: String,
        limit: u32,
        workers: usize,
        prevent_overwrite: bool,
    ) -> Self {
        Self {
            uploader,
            status: Arc::new(ArchiveStatusManager::new(data_dir)),
            wal_dir,
            exclude,
            limit,
            workers: workers.max(1),
            prevent_overwrite,
        }
    }

    /// Scan `archive_status/*.ready` and ship up to `limit` further
    /// segments on background workers. Segments are marked as uploaded
    /// only after their upload lands; a failed segment stays `.ready` for
    /// the next `archive_command` call.
    pub fn start(&self) -> Result<()> {
        let ready_dir = self.wal_dir.join("archive_status");
        let entries = match fs::read_dir(&ready_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };
        let mut candidates: Vec<String> = entries
            .filter_map(|entry| {
                let name = entry.ok()?.file_name().to_string_lossy().into_owned();
                let wal_name = name.strip_suffix(".ready")?.to_string();
                (wal_name != self.exclude && !self.status.is_wal_already_uploaded(&wal_name))
                    .then_some(wal_name)
            })
            .collect();
        candidates.sort();
        candidates.truncate(self.limit as usize);
        if candidates.is_empty() {
            return Ok(());
        }
        debug!(segments = candidates.len(), "background wal uploads scheduled");

        let work = Arc::new(parking_lot::Mutex::new(candidates));
        for _ in 0..self.workers {
            let work = Arc::clone(&work);
            let uploader = Arc::clone(&self.uploader);
            let status = Arc::clone(&self.status);
            let wal_dir = self.wal_dir.clone();
            let prevent_overwrite = self.prevent_overwrite;
            let guard = self.uploader.in_flight_guard();
            std::thread::Builder::new()
                .name("bg-wal-upload".into())
                .spawn(move || {
                    let _guard = guard;
                    loop {
                        let Some(wal_name) = work.lock().pop() else { break };
                        let result = prepare_wal_upload(
                            &uploader,
                            &wal_dir.join(&wal_name),
                            &wal_name,
                            prevent_overwrite,
                        )
                        .and_then(|prepared| match prepared {
                            Some((object, body)) => uploader.upload(&object, &mut body.as_slice()),
                            None => Ok(()),
                        })
                        .and_then(|()| status.mark_uploaded(&wal_name));
                        if let Err(err) = result {
                            warn!(segment = %wal_name, "background upload failed: {err:#}");
                        }
                    }
                })
                .expect("spawning a background wal upload cannot fail");
        }
        Ok(())
    }

    /// Wait for the background workers and report the shared pass/fail.
    pub fn stop(&self) -> Result<()> {
        self.uploader.finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalMetadataDescription {
    pub created_time: DateTime<Utc>,
    pub date_fmt: String,
}

const METADATA_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S.%fZ";

/// Archive one closed WAL segment.
pub fn handle_wal_push(config: &Config, root: Arc<dyn Folder>, wal_path: &Path) -> Result<()> {
    let wal_name = wal_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::Cli(format!("not a wal path: {}", wal_path.display())))?;
    let wal_dir = wal_path
        .parent()
        .ok_or_else(|| Error::Cli(format!("not a wal path: {}", wal_path.display())))?
        .to_path_buf();
    let data_dir = wal_dir
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    let status = ArchiveStatusManager::new(&data_dir);
    if status.is_wal_already_uploaded(&wal_name) {
        // A background pass already shipped it; clear the marker and ack.
        status.unmark_wal_file(&wal_name)?;
        debug!(segment = %wal_name, "already archived by background uploader");
        return Ok(());
    }

    let crypter = Crypter::from_config(config)?.map(Arc::new);
    let uploader = Uploader::new(
        root.sub_folder(WAL_PATH),
        config.compression,
        crypter,
        MetricsSink::new_shared(),
    );

    let bg = BgUploader::new(
        Arc::clone(&uploader),
        &data_dir,
        wal_dir,
        wal_name.clone(),
        config.total_bg_uploaded_limit.saturating_sub(1),
        config.upload_concurrency.saturating_sub(1),
        config.prevent_wal_overwrite,
    );
    bg.start()?;

    match prepare_wal_upload(&uploader, wal_path, &wal_name, config.prevent_wal_overwrite)? {
        Some((object, body)) => {
            uploader.upload(&object, &mut body.as_slice())?;
            info!(segment = %wal_name, object = %object, "wal archived");
        }
        None => info!(segment = %wal_name, "already archived with equal content, skipping"),
    }

    if config.wal_metadata_level != WalMetadataLevel::NoMetadata {
        upload_wal_metadata(config, &uploader, &data_dir, wal_path, &wal_name)?;
    }

    bg.stop()
}

/// Compress and optionally encrypt one segment into an upload body,
/// honoring the overwrite guard. `Ok(None)` means an equal copy is already
/// archived.
fn prepare_wal_upload(
    uploader: &Arc<Uploader>,
    wal_path: &Path,
    wal_name: &str,
    prevent_overwrite: bool,
) -> Result<Option<(String, Vec<u8>)>> {
    let local = fs::read(wal_path)?;
    if prevent_overwrite {
        if let Some(archived) = read_archived_segment(uploader, wal_name)? {
            if archived == local {
                return Ok(None);
            }
            return Err(Error::WalOverwrite(wal_name.to_string()).into());
        }
    }

    let object = format!("{wal_name}.{}", uploader.compression().extension());
    let mut compressed = crate::compress::compress_and_encrypt(
        Box::new(std::io::Cursor::new(local)),
        uploader.compression(),
        uploader.crypter(),
        uploader.metrics(),
    );
    let mut body = Vec::new();
    compressed.read_to_end(&mut body)?;
    Ok(Some((object, body)))
}

/// Download and decode an already-archived copy of a segment, trying every
/// known compressor extension.
fn read_archived_segment(
    uploader: &Arc<Uploader>,
    wal_name: &str,
) -> Result<Option<Vec<u8>>> {
    for method in CompressionMethod::all() {
        let object = format!("{wal_name}.{}", method.extension());
        if !uploader.folder().exists(&object)? {
            continue;
        }
        let raw = uploader.folder().get_object(&object)?;
        let crypter = uploader.crypter();
        let mut plain = decrypt_and_decompress(raw, method, crypter.as_deref())?;
        let mut body = Vec::new();
        plain.read_to_end(&mut body)?;
        return Ok(Some(body));
    }
    Ok(None)
}

/// Individual mode ships `<segment>.json` at once; bulk mode spools entries
/// locally and flushes one consolidated object when the segment closes its
/// group.
fn upload_wal_metadata(
    config: &Config,
    uploader: &Arc<Uploader>,
    data_dir: &Path,
    wal_path: &Path,
    wal_name: &str,
) -> Result<()> {
    // Backup-label history files carry no metadata.
    if wal_name.contains("backup") || wal_name.contains("history") {
        return Ok(());
    }
    let created = fs::metadata(wal_path)?.modified()?;
    let mut entry = BTreeMap::new();
    entry.insert(
        wal_name.to_string(),
        WalMetadataDescription {
            created_time: created.into(),
            date_fmt: METADATA_DATE_FORMAT.to_string(),
        },
    );
    let body = serde_json::to_vec(&entry)?;

    match config.wal_metadata_level {
        WalMetadataLevel::NoMetadata => Ok(()),
        WalMetadataLevel::Individual => {
            uploader.upload(&format!("{wal_name}.json"), &mut body.as_slice())
        }
        WalMetadataLevel::Bulk => {
            let metadata_dir = spool_dir(data_dir).join("wal_metadata");
            fs::create_dir_all(&metadata_dir)?;
            fs::write(metadata_dir.join(format!("{wal_name}.json")), &body)?;

            let segment_size = config
                .wal_segment_size
                .unwrap_or(crate::pg::DEFAULT_WAL_SEGMENT_SIZE);
            let (_, segment_no) = parse_wal_segment_name(wal_name, segment_size)?;
            if !closes_segment_group(segment_no) {
                return Ok(());
            }

            // Flush the whole group as one object named by the shared
            // 23-character prefix.
            let group_prefix = &wal_name[..23];
            let mut merged: BTreeMap<String, WalMetadataDescription> = BTreeMap::new();
            let mut spooled = Vec::new();
            for entry in fs::read_dir(&metadata_dir)? {
                let entry = entry?;
                let file_name = entry.file_name().to_string_lossy().into_owned();
                if !file_name.starts_with(group_prefix) {
                    continue;
                }
                let parsed: BTreeMap<String, WalMetadataDescription> =
                    serde_json::from_slice(&fs::read(entry.path())?)?;
                merged.extend(parsed);
                spooled.push(entry.path());
            }
            let merged_body = serde_json::to_vec(&merged)?;
            uploader.upload(&format!("{group_prefix}.json"), &mut merged_body.as_slice())?;
            for path in spooled {
                if let Err(err) = fs::remove_file(&path) {
                    warn!("could not remove spooled metadata {}: {err}", path.display());
                }
            }
            Ok(())
        }
    }
}

/// Fetch one segment from the archive into `destination`.
pub fn handle_wal_fetch(
    config: &Config,
    root: Arc<dyn Folder>,
    wal_name: &str,
    destination: &Path,
) -> Result<()> {
    let wal_folder = root.sub_folder(WAL_PATH);
    let crypter = Crypter::from_config(config)?;

    for method in CompressionMethod::all() {
        let object = format!("{wal_name}.{}", method.extension());
        if !wal_folder.exists(&object)? {
            continue;
        }
        let raw = wal_folder.get_object(&object)?;
        let mut plain = decrypt_and_decompress(raw, method, crypter.as_ref())?;

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        // Write next to the target and rename so a crashed fetch never
        // leaves a torn segment.
        let partial = destination.with_extension("walvault.partial");
        let mut file = File::create(&partial)?;
        std::io::copy(&mut plain, &mut file)?;
        file.sync_all()?;
        fs::rename(&partial, destination)?;
        info!(segment = %wal_name, "wal fetched");
        return Ok(());
    }
    Err(Error::MissingWalSegment(wal_name.to_string()).into())
}

/// Fold every segment of `[from, to)` into a delta map, preferring the
/// archive and falling back to the live WAL directory for segments not yet
/// shipped. A segment found nowhere leaves the map marked incomplete.
pub fn scan_delta_map(
    root: &Arc<dyn Folder>,
    crypter: Option<Arc<Crypter>>,
    local_wal_dir: &Path,
    timeline: TimelineId,
    wal_segment_size: u64,
    from: Lsn,
    to: Lsn,
) -> Result<DeltaMap> {
    let mut map = DeltaMap::new();
    if from >= to {
        return Ok(map);
    }
    let wal_folder = root.sub_folder(WAL_PATH);
    let mut parser = WalStreamParser::new(wal_segment_size);

    let first = from.segment_no(wal_segment_size);
    let last = if to.0 % wal_segment_size == 0 {
        to.segment_no(wal_segment_size).saturating_sub(1)
    } else {
        to.segment_no(wal_segment_size)
    };
    for segment_no in first..=last {
        let name = wal_segment_name(timeline, segment_no, wal_segment_size);
        let data = match load_segment(&wal_folder, crypter.as_deref(), local_wal_dir, &name)? {
            Some(data) if data.len() == wal_segment_size as usize => data,
            _ => {
                debug!(segment = %name, "segment unavailable for delta scan");
                map.mark_incomplete();
                return Ok(map);
            }
        };
        let segment_start = crate::pg::segment_start_lsn(segment_no, wal_segment_size);
        match parser.parse_segment(segment_start, &data) {
            Ok(records) => {
                for record in records {
                    if record.lsn >= from && record.lsn < to {
                        map.absorb_record(&record);
                    }
                }
            }
            Err(err) => {
                if matches!(err.downcast_ref::<Error>(), Some(Error::UnknownRm(_))) {
                    return Err(err);
                }
                warn!(segment = %name, "delta scan parse failed: {err:#}");
                map.mark_incomplete();
                return Ok(map);
            }
        }
    }
    Ok(map)
}

fn load_segment(
    wal_folder: &Arc<dyn Folder>,
    crypter: Option<&Crypter>,
    local_wal_dir: &Path,
    name: &str,
) -> Result<Option<Vec<u8>>> {
    for method in CompressionMethod::all() {
        let object = format!("{name}.{}", method.extension());
        if !wal_folder.exists(&object)? {
            continue;
        }
        let raw = wal_folder.get_object(&object)?;
        let mut plain = decrypt_and_decompress(raw, method, crypter)?;
        let mut data = Vec::new();
        plain.read_to_end(&mut data)?;
        return Ok(Some(data));
    }
    match fs::read(local_wal_dir.join(name)) {
        Ok(data) => Ok(Some(data)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

//! Restore: download a backup chain and rebuild the data directory by
//! inverse application of full tars plus layered increments.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::compress::{decrypt_and_decompress, CompressionMethod};
use crate::config::Config;
use crate::crypto::Crypter;
use crate::increment::{create_file_from_increment, write_pages_from_increment};
use crate::storage::{Folder, BASE_BACKUPS_PATH, TAR_PARTITIONS_PATH};
use crate::sync::{CancelToken, ErrorGroup};
use crate::{backup, Error, Result};

use super::sentinel::BackupSentinel;

/// Restore `selector` (a backup name or `LATEST`) into `destination`.
pub fn handle_backup_fetch(
    config: &Config,
    root: Arc<dyn Folder>,
    destination: &Path,
    selector: &str,
) -> Result<()> {
    let base_folder = root.sub_folder(BASE_BACKUPS_PATH);
    let crypter = Crypter::from_config(config)?.map(Arc::new);

    let name = backup::resolve_backup_name(&base_folder, selector)?;
    // Lineage must hold before a single partition is touched.
    let chain = backup::resolve_chain(&base_folder, &name)?;
    info!(backup = %name, layers = chain.len(), "restoring backup chain");

    fs::create_dir_all(destination)?;
    for sentinel in &chain {
        restore_layer(
            &base_folder,
            crypter.clone(),
            sentinel,
            destination,
            config.download_concurrency,
        )?;
    }
    info!(backup = %name, destination = %destination.display(), "restore complete");
    Ok(())
}

/// Apply one backup layer: stream every partition through
/// decrypt → decompress → tar, placing entries at their original paths.
fn restore_layer(
    base_folder: &Arc<dyn Folder>,
    crypter: Option<Arc<Crypter>>,
    sentinel: &BackupSentinel,
    destination: &Path,
    download_concurrency: usize,
) -> Result<()> {
    let parts_folder = base_folder
        .sub_folder(&sentinel.backup_name)
        .sub_folder(TAR_PARTITIONS_PATH);
    let (mut objects, _) = parts_folder.list()?;
    objects.sort_by(|a, b| a.name.cmp(&b.name));
    debug!(
        backup = %sentinel.backup_name,
        partitions = objects.len(),
        "applying layer"
    );

    let cancel = CancelToken::new();
    let group = Arc::new(ErrorGroup::new(cancel.clone()));
    let (tx, rx) = channel::<String>();
    let rx = Arc::new(Mutex::new(rx));

    let mut workers = Vec::new();
    for worker_no in 0..download_concurrency.max(1) {
        let rx = Arc::clone(&rx);
        let group = Arc::clone(&group);
        let cancel = cancel.clone();
        let parts_folder = Arc::clone(&parts_folder);
        let crypter = crypter.clone();
        let sentinel = sentinel.clone();
        let destination = destination.to_path_buf();
        workers.push(
            thread::Builder::new()
                .name(format!("fetch-worker-{worker_no}"))
                .spawn(move || loop {
                    let object = {
                        let guard = rx.lock();
                        guard.recv()
                    };
                    let Ok(object) = object else { break };
                    if cancel.is_cancelled() {
                        break;
                    }
                    if let Err(err) = apply_partition(
                        &parts_folder,
                        crypter.as_deref(),
                        &sentinel,
                        &destination,
                        &object,
                    ) {
                        group.record(err);
                        break;
                    }
                })
                .expect("spawning a fetch worker cannot fail"),
        );
    }

    for object in objects {
        tx.send(object.name)
            .map_err(|_| anyhow::anyhow!("fetch workers exited early"))?;
    }
    drop(tx);
    for worker in workers {
        let _ = worker.join();
    }
    Arc::try_unwrap(group)
        .map_err(|_| anyhow::anyhow!("fetch worker still running"))?
        .into_result()
}

fn apply_partition(
    parts_folder: &Arc<dyn Folder>,
    crypter: Option<&Crypter>,
    sentinel: &BackupSentinel,
    destination: &Path,
    object: &str,
) -> Result<()> {
    let extension = object
        .rsplit('.')
        .next()
        .and_then(CompressionMethod::from_extension)
        .ok_or_else(|| {
            Error::CorruptArchive(format!("unrecognized partition extension: {object}"))
        })?;
    let raw = parts_folder.get_object(object)?;
    let plain = decrypt_and_decompress(raw, extension, crypter)?;
    let mut archive = tar::Archive::new(plain);

    let corrupt = |err: io::Error| Error::CorruptArchive(format!("{object}: {err}"));
    for entry in archive.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;
        let rel: PathBuf = entry.path().map_err(corrupt)?.into_owned();
        let target = destination.join(&rel);
        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                fs::create_dir_all(&target)?;
            }
            tar::EntryType::Symlink => {
                let link = entry
                    .link_name()
                    .map_err(corrupt)?
                    .ok_or_else(|| Error::CorruptArchive(format!("symlink without target in {object}")))?;
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                if target.symlink_metadata().is_err() {
                    symlink(link.as_ref(), &target)?;
                }
            }
            tar::EntryType::Regular | tar::EntryType::GNUSparse => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let rel_name = rel.to_string_lossy();
                let incremented = sentinel
                    .files
                    .get(rel_name.as_ref())
                    .map(|f| f.is_incremented)
                    .unwrap_or(false);
                if incremented {
                    apply_increment_entry(&mut entry, &target).map_err(|err| {
                        anyhow::Error::new(Error::CorruptArchive(format!(
                            "{object}: increment for {rel_name}: {err:#}"
                        )))
                    })?;
                } else {
                    let mut file = File::create(&target)?;
                    io::copy(&mut entry, &mut file).map_err(corrupt)?;
                }
            }
            other => {
                debug!(entry = %rel.display(), ?other, "ignoring tar entry type");
            }
        }
    }
    debug!(partition = object, "partition applied");
    Ok(())
}

/// Increments materialize absent targets outright and patch existing ones;
/// a target larger than the increment's declared size is cut back (the
/// relation shrank between the backups).
fn apply_increment_entry<R: Read>(entry: &mut R, target: &Path) -> Result<()> {
    match OpenOptions::new().read(true).write(true).open(target) {
        Ok(file) => {
            let declared = write_pages_from_increment(entry, &file, true)?;
            if file.metadata()?.len() > declared {
                file.set_len(declared)?;
            }
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(target)?;
            create_file_from_increment(entry, &file)?;
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

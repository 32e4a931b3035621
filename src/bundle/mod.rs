//! Data-directory walker: decides skip / tar-whole / increment per file and
//! drives the worker pool that packs entries into tar partitions.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::backup::sentinel::FileDescription;
use crate::increment::{plan_increment, IncrementReader};
use crate::pg::page::VerifyPolicy;
use crate::pg::{parse_relation_path, Lsn, PAGE_SIZE};
use crate::sync::{CancelToken, ErrorGroup};
use crate::tarball::TarBallQueue;
use crate::wal::DeltaMap;
use crate::Result;

/// Directories whose contents never belong in a base backup. The directory
/// entries themselves are preserved so a restored cluster can start.
const EXCLUDED_DIRECTORIES: &[&str] = &[
    "pg_wal",
    "pg_xlog",
    "pg_replslot",
    "pg_dynshmem",
    "pg_notify",
    "pg_serial",
    "pg_snapshots",
    "pg_stat_tmp",
    "pg_subtrans",
];

const EXCLUDED_FILES: &[&str] = &["postmaster.pid", "postmaster.opts"];

const TEMP_PREFIX: &str = "pgsql_tmp";
/// The archiver's own spool directory inside the data directory.
const SPOOL_DIR_NAME: &str = ".walvault";

/// Sentinel file map filled concurrently by the workers.
#[derive(Debug, Default)]
pub struct BundleFiles {
    files: DashMap<String, FileDescription>,
}

impl BundleFiles {
    pub fn add(&self, path: String, description: FileDescription) {
        self.files.insert(path, description);
    }

    pub fn into_map(self) -> BTreeMap<String, FileDescription> {
        self.files.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

enum WorkItem {
    Directory {
        rel: PathBuf,
        mode: u32,
        mtime: i64,
    },
    Symlink {
        rel: PathBuf,
        target: PathBuf,
        mtime: i64,
    },
    Regular {
        abs: PathBuf,
        rel: PathBuf,
        size: u64,
        mode: u32,
        mtime: i64,
    },
}

/// One backup's traversal of the data directory.
pub struct Bundle {
    pub data_dir: PathBuf,
    /// Baseline for an incremental backup; `None` means full.
    pub increment_from_lsn: Option<Lsn>,
    /// Complete delta map covering `[increment_from_lsn, backup start)`,
    /// when available, to narrow page scans.
    pub delta_map: Option<Arc<DeltaMap>>,
    pub verify: VerifyPolicy,
    pub concurrency: usize,
}

impl Bundle {
    /// Walk the data directory and pack everything through the queue.
    /// Returns the sentinel file map.
    pub fn run(
        &self,
        queue: &Arc<TarBallQueue>,
        cancel: &CancelToken,
    ) -> Result<BTreeMap<String, FileDescription>> {
        let files = Arc::new(BundleFiles::default());
        let group = Arc::new(ErrorGroup::new(cancel.clone()));
        let (tx, rx) = channel::<WorkItem>();
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::new();
        for worker_no in 0..self.concurrency.max(1) {
            let rx = Arc::clone(&rx);
            let queue = Arc::clone(queue);
            let files = Arc::clone(&files);
            let group = Arc::clone(&group);
            let cancel = cancel.clone();
            let packer = Packer {
                increment_from_lsn: self.increment_from_lsn,
                delta_map: self.delta_map.clone(),
                verify: self.verify,
            };
            workers.push(
                thread::Builder::new()
                    .name(format!("bundle-worker-{worker_no}"))
                    .spawn(move || {
                        loop {
                            let item = {
                                let guard = rx.lock();
                                guard.recv()
                            };
                            let Ok(item) = item else { break };
                            if cancel.is_cancelled() {
                                break;
                            }
                            if let Err(err) = packer.pack(&queue, &files, item) {
                                group.record(err);
                                break;
                            }
                        }
                    })
                    .expect("spawning a bundle worker cannot fail"),
            );
        }

        let walk_result = self.walk(&tx, cancel);
        drop(tx);
        for worker in workers {
            let _ = worker.join();
        }

        // A worker failure is the root cause even when it also broke the
        // walker's channel.
        if group.is_failed() || cancel.is_cancelled() {
            return Err(Arc::try_unwrap(group)
                .map_err(|_| anyhow::anyhow!("bundle worker still running"))?
                .into_result()
                .expect_err("group checked failed"));
        }
        walk_result?;
        info!(files = files.len(), "data directory walked");
        Ok(Arc::try_unwrap(files)
            .map_err(|_| anyhow::anyhow!("bundle worker still holds the file map"))?
            .into_map())
    }

    /// Single-producer traversal; checks cancellation between files.
    fn walk(&self, tx: &Sender<WorkItem>, cancel: &CancelToken) -> Result<()> {
        let mut it = walkdir::WalkDir::new(&self.data_dir)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();
        while let Some(entry) = it.next() {
            cancel.check()?;
            let entry = entry.map_err(io::Error::from)?;
            let rel = entry
                .path()
                .strip_prefix(&self.data_dir)
                .expect("walked path is under the data dir")
                .to_path_buf();
            if rel.as_os_str().is_empty() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let file_type = entry.file_type();

            if file_type.is_dir() {
                if name == SPOOL_DIR_NAME {
                    it.skip_current_dir();
                    continue;
                }
                let meta = entry.metadata().map_err(io::Error::from)?;
                send(
                    tx,
                    WorkItem::Directory {
                        rel,
                        mode: meta.permissions().mode(),
                        mtime: system_time_secs(meta.modified()?),
                    },
                )?;
                if EXCLUDED_DIRECTORIES.contains(&name.as_str())
                    || name.starts_with(TEMP_PREFIX)
                {
                    debug!(path = %entry.path().display(), "directory contents excluded");
                    it.skip_current_dir();
                }
                continue;
            }
            if file_type.is_symlink() {
                let target = std::fs::read_link(entry.path())?;
                let meta = entry.path().symlink_metadata()?;
                send(
                    tx,
                    WorkItem::Symlink {
                        rel,
                        target,
                        mtime: system_time_secs(meta.modified()?),
                    },
                )?;
                continue;
            }
            if EXCLUDED_FILES.contains(&name.as_str())
                || name.starts_with(TEMP_PREFIX)
                || file_type.is_socket()
                || file_type.is_fifo()
            {
                continue;
            }
            let meta = entry.metadata().map_err(io::Error::from)?;
            send(
                tx,
                WorkItem::Regular {
                    abs: entry.path().to_path_buf(),
                    rel,
                    size: meta.len(),
                    mode: meta.permissions().mode(),
                    mtime: system_time_secs(meta.modified()?),
                },
            )?;
        }
        Ok(())
    }
}

fn send(tx: &Sender<WorkItem>, item: WorkItem) -> Result<()> {
    tx.send(item)
        .map_err(|_| anyhow::anyhow!("bundle workers exited early"))
}

fn system_time_secs(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs() as i64,
        Err(_) => 0,
    }
}

fn mtime_utc(mtime: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(mtime, 0).unwrap_or_default()
}

/// Per-worker packing logic.
struct Packer {
    increment_from_lsn: Option<Lsn>,
    delta_map: Option<Arc<DeltaMap>>,
    verify: VerifyPolicy,
}

impl Packer {
    fn pack(
        &self,
        queue: &Arc<TarBallQueue>,
        files: &BundleFiles,
        item: WorkItem,
    ) -> Result<()> {
        match item {
            WorkItem::Directory { rel, mode, mtime } => {
                let mut ball = queue.dequeue()?;
                let mut header = new_header(tar::EntryType::Directory, 0, mode, mtime);
                let result = ball.append_special(&mut header, &rel);
                queue.enqueue_back(ball)?;
                result
            }
            WorkItem::Symlink { rel, target, mtime } => {
                let mut ball = queue.dequeue()?;
                let mut header = new_header(tar::EntryType::Symlink, 0, 0o777, mtime);
                let result = ball.append_symlink(&mut header, &rel, &target);
                queue.enqueue_back(ball)?;
                result
            }
            WorkItem::Regular {
                abs,
                rel,
                size,
                mode,
                mtime,
            } => self.pack_regular(queue, files, &abs, &rel, size, mode, mtime),
        }
    }

    fn pack_regular(
        &self,
        queue: &Arc<TarBallQueue>,
        files: &BundleFiles,
        abs: &Path,
        rel: &Path,
        size: u64,
        mode: u32,
        mtime: i64,
    ) -> Result<()> {
        let rel_name = rel.to_string_lossy().into_owned();
        let relation = parse_relation_path(rel);

        let incrementable = self.increment_from_lsn.is_some()
            && relation.is_some()
            && size > PAGE_SIZE as u64;
        if !incrementable {
            return self.pack_whole(queue, files, abs, rel, size, mode, mtime);
        }

        let base_lsn = self.increment_from_lsn.expect("checked above");
        let info = relation.expect("checked above");
        let allowed = self.delta_map.as_ref().and_then(|map| {
            if map.is_incomplete() {
                return None;
            }
            Some(
                map.blocks_for(&info.node)
                    .cloned()
                    .unwrap_or_default(),
            )
        });

        let file = File::open(abs)?;
        let plan = plan_increment(
            BufReader::new(file),
            &rel_name,
            base_lsn,
            info.block_offset(),
            allowed,
            self.verify,
        )?;

        if !plan.corrupt_blocks.is_empty() {
            warn!(
                path = %rel_name,
                blocks = plan.corrupt_blocks.len(),
                "corrupt pages recorded"
            );
        }
        if plan.is_empty() {
            files.add(
                rel_name,
                FileDescription {
                    mtime: mtime_utc(mtime),
                    size,
                    is_incremented: false,
                    is_skipped: true,
                    corrupt_blocks: Vec::new(),
                },
            );
            return Ok(());
        }

        let reader_file = File::open(abs)?;
        let mut reader = IncrementReader::new(reader_file, &plan);
        let mut ball = queue.dequeue()?;
        let mut header = new_header(tar::EntryType::Regular, plan.encoded_size(), mode, mtime);
        let result = ball.append_regular(&mut header, rel, &mut reader);
        queue.enqueue_back(ball)?;
        result?;

        files.add(
            rel_name,
            FileDescription {
                mtime: mtime_utc(mtime),
                size,
                is_incremented: true,
                is_skipped: false,
                corrupt_blocks: plan.corrupt_blocks.clone(),
            },
        );
        Ok(())
    }

    fn pack_whole(
        &self,
        queue: &Arc<TarBallQueue>,
        files: &BundleFiles,
        abs: &Path,
        rel: &Path,
        size: u64,
        mode: u32,
        mtime: i64,
    ) -> Result<()> {
        let file = File::open(abs)?;
        // The header size is fixed before reading; pad or clamp so a file
        // mutated underneath us cannot tear the tar stream.
        let mut reader = file.take(size).chain(io::repeat(0)).take(size);
        let mut ball = queue.dequeue()?;
        let mut header = new_header(tar::EntryType::Regular, size, mode, mtime);
        let result = ball.append_regular(&mut header, rel, &mut reader);
        queue.enqueue_back(ball)?;
        result?;

        files.add(
            rel.to_string_lossy().into_owned(),
            FileDescription {
                mtime: mtime_utc(mtime),
                size,
                is_incremented: false,
                is_skipped: false,
                corrupt_blocks: Vec::new(),
            },
        );
        Ok(())
    }
}

pub fn new_header(entry_type: tar::EntryType, size: u64, mode: u32, mtime: i64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_size(size);
    header.set_mode(mode);
    header.set_mtime(mtime.max(0) as u64);
    header
}

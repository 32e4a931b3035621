//! The backup coordinator: drives one `backup-push` from
//! `pg_start_backup` through the sentinel upload.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::bundle::{new_header, Bundle};
use crate::config::Config;
use crate::crypto::Crypter;
use crate::logging::{log_transfer_metrics, MetricsSink};
use crate::pg::control::QueryRunner;
use crate::pg::page::VerifyPolicy;
use crate::pg::{wal_segment_name_for_lsn, Lsn, TimelineId, DEFAULT_WAL_SEGMENT_SIZE};
use crate::storage::{Folder, BASE_BACKUPS_PATH};
use crate::sync::CancelToken;
use crate::tarball::{TarBallMaker, TarBallQueue};
use crate::upload::Uploader;
use crate::wal::tail::WalTailReader;
use crate::wal::DeltaMap;
use crate::wal_archive;
use crate::{backup, Error, Result};

use super::sentinel::BackupSentinel;

#[derive(Debug, Clone, Copy, Default)]
pub struct BackupPushSettings {
    pub permanent: bool,
    pub full: bool,
    pub verify: VerifyPolicy,
}

struct DeltaBase {
    name: String,
    sentinel: BackupSentinel,
}

/// Run one backup. Returns the committed backup name.
pub fn handle_backup_push(
    config: &Config,
    root: Arc<dyn Folder>,
    runner: &mut dyn QueryRunner,
    data_dir: &Path,
    settings: BackupPushSettings,
) -> Result<String> {
    let base_folder = root.sub_folder(BASE_BACKUPS_PATH);
    let crypter = Crypter::from_config(config)?.map(Arc::new);
    let metrics = MetricsSink::new_shared();
    let cancel = CancelToken::new();

    let version = runner.version()?;
    let system_identifier = runner.system_identifier()?;
    let timeline = match runner.timeline() {
        Ok(timeline) => timeline,
        Err(err) => {
            warn!("could not read timeline, assuming 1: {err}");
            1
        }
    };
    let wal_segment_size = config
        .wal_segment_size
        .or_else(|| runner.wal_segment_bytes().ok())
        .unwrap_or(DEFAULT_WAL_SEGMENT_SIZE);

    let delta_base = if settings.full {
        None
    } else {
        choose_delta_base(config, &base_folder)?
    };

    let label = format!("walvault_{}", Utc::now().format("%Y%m%dT%H%M%S%.6fZ"));
    let start = runner.start_backup(&label)?;
    if start.in_recovery && version < 90600 {
        let _ = runner.stop_backup();
        return Err(Error::Precondition(format!(
            "version {version} requires exclusive backups on a standby"
        ))
        .into());
    }
    info!(lsn = %start.lsn, in_recovery = start.in_recovery, "backup started");

    let result = run_backup(
        config,
        &root,
        runner,
        data_dir,
        &settings,
        RunContext {
            base_folder: &base_folder,
            crypter: crypter.clone(),
            metrics: Arc::clone(&metrics),
            cancel: cancel.clone(),
            version,
            system_identifier,
            timeline,
            wal_segment_size,
            delta_base,
            start_lsn: start.lsn,
            start_wal_file: start.wal_file_name.clone(),
        },
    );

    match result {
        Ok(name) => {
            log_transfer_metrics(metrics.snapshot());
            Ok(name)
        }
        Err(err) => {
            // Abort: cancel the workers, close the backup mode, leave the
            // partial objects for retention to sweep. No sentinel.
            cancel.cancel();
            if let Err(stop_err) = runner.stop_backup() {
                warn!("pg_stop_backup during abort failed: {stop_err:#}");
            }
            Err(err)
        }
    }
}

struct RunContext<'a> {
    base_folder: &'a Arc<dyn Folder>,
    crypter: Option<Arc<Crypter>>,
    metrics: Arc<MetricsSink>,
    cancel: CancelToken,
    version: i32,
    system_identifier: Option<u64>,
    timeline: TimelineId,
    wal_segment_size: u64,
    delta_base: Option<DeltaBase>,
    start_lsn: Lsn,
    start_wal_file: Option<String>,
}

fn run_backup(
    config: &Config,
    root: &Arc<dyn Folder>,
    runner: &mut dyn QueryRunner,
    data_dir: &Path,
    settings: &BackupPushSettings,
    ctx: RunContext<'_>,
) -> Result<String> {
    let start_wal_file = ctx.start_wal_file.clone().unwrap_or_else(|| {
        wal_segment_name_for_lsn(ctx.timeline, ctx.start_lsn, ctx.wal_segment_size)
    });
    let base_wal_file = ctx
        .delta_base
        .as_ref()
        .and_then(|base| backup::wal_file_of_backup_name(&base.name).map(str::to_string));
    let backup_name = backup::backup_name(&start_wal_file, base_wal_file.as_deref());
    info!(backup = %backup_name, "assembling backup");

    let backup_folder = ctx.base_folder.sub_folder(&backup_name);
    let uploader = Uploader::new(
        backup_folder,
        config.compression,
        ctx.crypter.clone(),
        Arc::clone(&ctx.metrics),
    );

    // The WAL window of the copy phase feeds the delta map for the next
    // incremental.
    let tail = WalTailReader {
        wal_dir: data_dir.join(wal_directory_name(ctx.version)),
        timeline: ctx.timeline,
        wal_segment_size: ctx.wal_segment_size,
        cancel: ctx.cancel.clone(),
    }
    .spawn(ctx.start_lsn);

    let (increment_from_lsn, narrowing_map, increment_names) = match &ctx.delta_base {
        None => (None, None, None),
        Some(base) => {
            let narrowing = narrowing_delta_map(root, &ctx, data_dir, &base.sentinel);
            let full_name = base
                .sentinel
                .increment_full_name
                .clone()
                .unwrap_or_else(|| base.name.clone());
            (
                // Pages are classified against the base's start LSN; its
                // finish LSN is what the lineage in the sentinel records.
                Some(base.sentinel.start_lsn),
                narrowing.map(Arc::new),
                Some((base.name.clone(), base.sentinel.finish_lsn, full_name)),
            )
        }
    };

    let queue = Arc::new(TarBallQueue::new(
        TarBallMaker::Stream {
            uploader: Arc::clone(&uploader),
        },
        config.upload_concurrency,
        config.tar_size_threshold,
        ctx.cancel.clone(),
    )?);

    let bundle = Bundle {
        data_dir: data_dir.to_path_buf(),
        increment_from_lsn,
        delta_map: narrowing_map,
        verify: settings.verify,
        concurrency: config.upload_concurrency,
    };

    let walk_result = bundle.run(&queue, &ctx.cancel);
    let files = match walk_result {
        Ok(files) => files,
        Err(err) => {
            ctx.cancel.cancel();
            tail.abort();
            let queue = Arc::try_unwrap(queue)
                .map_err(|_| anyhow::anyhow!("partition queue still shared after walk"))?;
            let _ = queue.close_all();
            return Err(err);
        }
    };

    // Walker done: leave backup mode, then flush the label files into the
    // final partition and cut everything.
    let stop = match runner.stop_backup() {
        Ok(stop) => stop,
        Err(err) => {
            ctx.cancel.cancel();
            tail.abort();
            let queue = Arc::try_unwrap(queue)
                .map_err(|_| anyhow::anyhow!("partition queue still shared after walk"))?;
            let _ = queue.close_all();
            return Err(err);
        }
    };
    info!(lsn = %stop.lsn, "backup stopped");

    let label_result = append_label_files(&queue, &stop.label_file, &stop.tablespace_map);
    let queue = Arc::try_unwrap(queue)
        .map_err(|_| anyhow::anyhow!("partition queue still shared after walk"))?;
    let close_result = queue.close_all();
    label_result?;
    close_result?;

    let delta_map = match tail.finish(stop.lsn) {
        Ok(map) => map,
        Err(err) => {
            warn!("wal tail reader failed, delta map unavailable: {err:#}");
            let mut map = DeltaMap::new();
            map.mark_incomplete();
            map
        }
    };

    // Commit barrier: every data object must be durable before the
    // sentinel appears.
    uploader.finish()?;

    let (increment_from, increment_from_lsn_field, increment_full_name) = match increment_names {
        None => (None, None, None),
        Some((name, finish, full)) => (Some(name), Some(finish), Some(full)),
    };
    let sentinel = BackupSentinel {
        backup_name: backup_name.clone(),
        start_lsn: ctx.start_lsn,
        finish_lsn: stop.lsn,
        system_identifier: ctx.system_identifier,
        pg_version: ctx.version,
        finish_time: Utc::now(),
        hostname: std::env::var("HOSTNAME").ok(),
        data_dir: data_dir.display().to_string(),
        increment_from,
        increment_from_lsn: increment_from_lsn_field,
        increment_full_name,
        is_permanent: settings.permanent,
        files,
        tablespace_spec: None,
        delta_map: Some(delta_map.to_dto()),
    };
    backup::upload_sentinel(ctx.base_folder, &sentinel)?;
    info!(backup = %backup_name, finish = %stop.lsn, "backup committed");
    Ok(backup_name)
}

/// `backup_label` and `tablespace_map` from `pg_stop_backup` go into the
/// final partition; a restored cluster recovers from them.
fn append_label_files(
    queue: &TarBallQueue,
    label_file: &Option<String>,
    tablespace_map: &Option<String>,
) -> Result<()> {
    let entries: Vec<(&str, &String)> = [
        ("backup_label", label_file.as_ref()),
        ("tablespace_map", tablespace_map.as_ref()),
    ]
    .into_iter()
    .filter_map(|(name, content)| content.map(|content| (name, content)))
    .collect();
    if entries.is_empty() {
        return Ok(());
    }

    let mut ball = queue.dequeue()?;
    let mtime = Utc::now().timestamp();
    let mut result = Ok(());
    for (name, content) in entries {
        let mut header = new_header(
            tar::EntryType::Regular,
            content.len() as u64,
            0o600,
            mtime,
        );
        result = ball.append_regular(&mut header, Path::new(name), &mut content.as_bytes());
        if result.is_err() {
            break;
        }
    }
    queue.enqueue_back(ball)?;
    result
}

fn wal_directory_name(version: i32) -> &'static str {
    if version >= 100000 {
        "pg_wal"
    } else {
        "pg_xlog"
    }
}

/// Pick the base for an incremental backup per `WALG_DELTA_ORIGIN`, or
/// `None` when a full backup is due.
fn choose_delta_base(config: &Config, base_folder: &Arc<dyn Folder>) -> Result<Option<DeltaBase>> {
    if config.delta_max_steps == 0 {
        return Ok(None);
    }
    let backups = backup::list_backups(base_folder)?;
    let Some(latest) = backups.last() else {
        info!("no backups found, making a full backup");
        return Ok(None);
    };

    let mut name = latest.name.clone();
    let mut sentinel = backup::fetch_sentinel(base_folder, &name)?;
    if config.delta_origin == crate::config::DeltaOrigin::LatestFull {
        if let Some(full_name) = sentinel.increment_full_name.clone() {
            sentinel = backup::fetch_sentinel(base_folder, &full_name)?;
            name = full_name;
        }
    }

    let chain = backup::resolve_chain(base_folder, &name)?;
    if chain.len() as u32 > config.delta_max_steps {
        info!(
            steps = chain.len(),
            max = config.delta_max_steps,
            "delta chain too long, making a full backup"
        );
        return Ok(None);
    }
    info!(base = %name, "making an incremental backup");
    Ok(Some(DeltaBase { name, sentinel }))
}

/// Assemble the complete narrowing map for `[base start, backup start)`:
/// the base backup's own window from its sentinel, extended with WAL parsed
/// from the archive (or the live WAL directory for the newest segments).
/// Any gap disables narrowing.
fn narrowing_delta_map(
    root: &Arc<dyn Folder>,
    ctx: &RunContext<'_>,
    data_dir: &Path,
    base: &BackupSentinel,
) -> Option<DeltaMap> {
    let mut map = DeltaMap::new();
    let mut scan_from = base.start_lsn;
    if let Some(dto) = base.delta_map.clone() {
        let base_map = DeltaMap::from_dto(dto);
        if !base_map.is_incomplete() {
            scan_from = base.finish_lsn;
            map.merge(base_map);
        }
    }

    let scanned = wal_archive::scan_delta_map(
        root,
        ctx.crypter.clone(),
        &data_dir.join(wal_directory_name(ctx.version)),
        ctx.timeline,
        ctx.wal_segment_size,
        scan_from,
        ctx.start_lsn,
    );
    match scanned {
        Ok(scanned) if !scanned.is_incomplete() => {
            map.merge(scanned);
            info!(
                relations = map.relation_count(),
                blocks = map.block_count(),
                "delta map assembled, narrowing page scans"
            );
            Some(map)
        }
        Ok(_) => {
            info!("delta map incomplete, falling back to full page scans");
            None
        }
        Err(err) => {
            warn!("could not assemble delta map, full page scans: {err:#}");
            None
        }
    }
}

//! Retention sweeps: `delete retain N`, `delete before <name|time>`,
//! `delete everything`.
//!
//! Permanent backups and increment ancestors of surviving backups are never
//! deleted. Partial objects from aborted backups live under names no
//! sentinel references and fall to the same sweep once their prefix ages
//! out of retention.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::storage::{Folder, BASE_BACKUPS_PATH, WAL_PATH};
use crate::{backup, Error, Result};

use super::sentinel::BackupSentinel;
use super::BackupTime;

#[derive(Debug, Clone)]
pub enum DeleteTarget {
    /// Keep the newest `count` backups.
    Retain { count: usize },
    /// Delete backups strictly older than a named backup or an RFC3339
    /// instant.
    Before { selector: String },
    Everything,
}

pub fn handle_delete(
    root: Arc<dyn Folder>,
    target: DeleteTarget,
    confirmed: bool,
) -> Result<()> {
    let base_folder = root.sub_folder(BASE_BACKUPS_PATH);
    let backups = backup::list_backups(&base_folder)?;

    let keep_from = match &target {
        DeleteTarget::Retain { count } => backups.len().saturating_sub(*count),
        DeleteTarget::Everything => backups.len(),
        DeleteTarget::Before { selector } => match DateTime::parse_from_rfc3339(selector) {
            Ok(instant) => {
                let instant: DateTime<Utc> = instant.into();
                backups
                    .iter()
                    .position(|b| DateTime::<Utc>::from(b.modified) >= instant)
                    .unwrap_or(backups.len())
            }
            Err(_) => backups
                .iter()
                .position(|b| b.name == *selector)
                .ok_or_else(|| Error::MissingBackup(selector.clone()))?,
        },
    };
    let (candidates, kept) = backups.split_at(keep_from);

    let mut protected: HashSet<String> = HashSet::new();
    for keep in kept {
        for ancestor in backup::resolve_chain(&base_folder, &keep.name)? {
            protected.insert(ancestor.backup_name);
        }
    }
    for candidate in candidates {
        let sentinel = backup::fetch_sentinel(&base_folder, &candidate.name)?;
        if sentinel.is_permanent && !protected.contains(&candidate.name) {
            warn!(backup = %candidate.name, "skipping permanent backup");
            for ancestor in backup::resolve_chain(&base_folder, &candidate.name)? {
                protected.insert(ancestor.backup_name);
            }
        }
    }

    let doomed: Vec<&BackupTime> = candidates
        .iter()
        .filter(|b| !protected.contains(&b.name))
        .collect();
    let survivors: Vec<&BackupTime> = backups
        .iter()
        .filter(|b| !doomed.iter().any(|d| d.name == b.name))
        .collect();
    let wal_horizon = survivors.iter().map(|b| b.wal_file.clone()).min();

    if doomed.is_empty() {
        info!("nothing to delete");
        return Ok(());
    }
    for backup_time in &doomed {
        info!(backup = %backup_time.name, "will delete");
    }
    if !confirmed {
        info!("dry run, pass --confirm to delete");
        return Ok(());
    }

    for backup_time in &doomed {
        delete_backup(&base_folder, &backup_time.name)?;
    }
    delete_wal_before(&root, wal_horizon.as_deref())?;
    info!(deleted = doomed.len(), "retention sweep finished");
    Ok(())
}

fn delete_backup(base_folder: &Arc<dyn Folder>, name: &str) -> Result<()> {
    let backup_folder = base_folder.sub_folder(name);
    let objects: Vec<String> = backup_folder
        .list_recursively()?
        .into_iter()
        .map(|o| o.name)
        .collect();
    backup_folder.delete_objects(&objects)?;
    base_folder.delete_objects(&[BackupSentinel::object_name(name)])?;
    info!(backup = %name, objects = objects.len() + 1, "deleted");
    Ok(())
}

/// Drop archived segments (and their metadata) older than the oldest
/// surviving backup's start segment. No survivors means the whole archive
/// goes.
fn delete_wal_before(root: &Arc<dyn Folder>, horizon: Option<&str>) -> Result<()> {
    let wal_folder = root.sub_folder(WAL_PATH);
    let (objects, _) = wal_folder.list()?;
    let doomed: Vec<String> = objects
        .into_iter()
        .map(|o| o.name)
        .filter(|name| {
            let segment = name.split('.').next().unwrap_or(name);
            match horizon {
                Some(horizon) => segment.len() == horizon.len() && segment < horizon,
                None => true,
            }
        })
        .collect();
    if !doomed.is_empty() {
        info!(segments = doomed.len(), "deleting archived wal");
        wal_folder.delete_objects(&doomed)?;
    }
    Ok(())
}

//! Increment-chain resolution and lineage validation.

use std::collections::HashSet;
use std::sync::Arc;

use crate::storage::Folder;
use crate::{Error, Result};

use super::{fetch_sentinel, BackupSentinel};

/// Resolve the increment chain of `target_name` back to its full root and
/// return it root-first. Lineage is validated before any data I/O: every
/// ancestor must resolve, and each hop must satisfy
/// `ancestor.FinishLSN <= descendant.StartLSN`.
pub fn resolve_chain(
    base_folder: &Arc<dyn Folder>,
    target_name: &str,
) -> Result<Vec<BackupSentinel>> {
    let mut chain: Vec<BackupSentinel> = Vec::new();
    let mut seen = HashSet::new();
    let mut current = target_name.to_string();

    loop {
        if !seen.insert(current.clone()) {
            return Err(Error::Lineage(format!("cycle through {current}")).into());
        }
        let sentinel = fetch_sentinel(base_folder, &current).map_err(|err| {
            match err.downcast_ref::<Error>() {
                Some(Error::MissingBackup(_)) if !chain.is_empty() => anyhow::Error::new(
                    Error::Lineage(format!("ancestor {current} is not resolvable")),
                ),
                _ => err,
            }
        })?;

        if let Some(child) = chain.last() {
            if sentinel.finish_lsn > child.start_lsn {
                return Err(Error::Lineage(format!(
                    "{} finishes at {} after {} starts at {}",
                    sentinel.backup_name, sentinel.finish_lsn, child.backup_name, child.start_lsn
                ))
                .into());
            }
            if let Some(declared) = child.increment_from_lsn {
                if declared != sentinel.finish_lsn {
                    return Err(Error::Lineage(format!(
                        "{} declares base LSN {declared} but {} finished at {}",
                        child.backup_name, sentinel.backup_name, sentinel.finish_lsn
                    ))
                    .into());
                }
            }
        }

        let parent = sentinel.increment_from.clone();
        chain.push(sentinel);
        match parent {
            Some(parent) => current = parent,
            None => break,
        }
    }

    chain.reverse();
    Ok(chain)
}

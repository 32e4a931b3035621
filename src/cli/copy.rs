//! Implementation of `walvault copy`: move archived objects between two
//! configured storages.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tracing::info;

use crate::backup::sentinel::BackupSentinel;
use crate::config::Config;
use crate::storage::{Folder, BASE_BACKUPS_PATH};
use crate::Result;

#[derive(Debug, Clone, Args)]
pub struct CopyArgs {
    /// JSON config file describing the source storage.
    #[arg(long = "from")]
    pub from: PathBuf,

    /// JSON config file describing the destination storage.
    #[arg(long = "to")]
    pub to: PathBuf,

    /// Copy only this backup (with its sentinel) instead of everything.
    #[arg(long = "backup-name")]
    pub backup_name: Option<String>,
}

pub fn execute(args: CopyArgs) -> Result<()> {
    let from = Config::load_file(&args.from)?.storage_root()?;
    let to = Config::load_file(&args.to)?.storage_root()?;

    match args.backup_name {
        None => copy_all(&from, &to),
        Some(name) => copy_backup(&from, &to, &name),
    }
}

fn copy_all(from: &Arc<dyn Folder>, to: &Arc<dyn Folder>) -> Result<()> {
    let objects = from.list_recursively()?;
    info!(objects = objects.len(), "copying storage");
    for object in objects {
        let mut reader = from.get_object(&object.name)?;
        to.put_object(&object.name, &mut *reader)?;
    }
    Ok(())
}

fn copy_backup(from: &Arc<dyn Folder>, to: &Arc<dyn Folder>, name: &str) -> Result<()> {
    // Verify the backup is committed before copying bytes.
    let from_base = from.sub_folder(BASE_BACKUPS_PATH);
    crate::backup::fetch_sentinel(&from_base, name)?;

    let from_backup = from_base.sub_folder(name);
    let to_backup = to.sub_folder(BASE_BACKUPS_PATH).sub_folder(name);
    let objects = from_backup.list_recursively()?;
    info!(backup = %name, objects = objects.len() + 1, "copying backup");
    for object in objects {
        let mut reader = from_backup.get_object(&object.name)?;
        to_backup.put_object(&object.name, &mut *reader)?;
    }

    let sentinel = BackupSentinel::object_name(name);
    let mut reader = from_base.get_object(&sentinel)?;
    to.sub_folder(BASE_BACKUPS_PATH)
        .put_object(&sentinel, &mut *reader)?;
    Ok(())
}

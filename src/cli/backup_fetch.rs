//! Implementation of `walvault backup-fetch`.

use std::path::PathBuf;

use clap::Args;

use crate::backup::fetch::handle_backup_fetch;
use crate::config::Config;
use crate::Result;

#[derive(Debug, Clone, Args)]
pub struct BackupFetchArgs {
    /// Destination data directory.
    pub db_directory: PathBuf,

    /// Backup name, or LATEST for the most recent committed backup.
    pub backup_name: String,
}

pub fn execute(args: BackupFetchArgs) -> Result<()> {
    let config = Config::from_env()?;
    let root = config.storage_root()?;
    handle_backup_fetch(&config, root, &args.db_directory, &args.backup_name)
}

//! Implementation of `walvault wal-push`.

use std::path::PathBuf;

use clap::Args;

use crate::config::Config;
use crate::wal_archive::handle_wal_push;
use crate::Result;

#[derive(Debug, Clone, Args)]
pub struct WalPushArgs {
    /// Path of the closed WAL segment, as handed over by archive_command.
    pub wal_path: PathBuf,
}

pub fn execute(args: WalPushArgs) -> Result<()> {
    let config = Config::from_env()?;
    let root = config.storage_root()?;
    handle_wal_push(&config, root, &args.wal_path)
}

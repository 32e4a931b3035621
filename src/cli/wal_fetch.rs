//! Implementation of `walvault wal-fetch`.

use std::path::PathBuf;

use clap::Args;

use crate::config::Config;
use crate::wal_archive::handle_wal_fetch;
use crate::Result;

#[derive(Debug, Clone, Args)]
pub struct WalFetchArgs {
    /// Name of the WAL segment to fetch.
    pub wal_name: String,

    /// Destination path, as handed over by restore_command.
    pub destination: PathBuf,
}

pub fn execute(args: WalFetchArgs) -> Result<()> {
    let config = Config::from_env()?;
    let root = config.storage_root()?;
    handle_wal_fetch(&config, root, &args.wal_name, &args.destination)
}

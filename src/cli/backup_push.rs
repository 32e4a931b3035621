//! Implementation of `walvault backup-push`.

use std::path::PathBuf;

use clap::Args;

use crate::backup::push::{handle_backup_push, BackupPushSettings};
use crate::config::Config;
use crate::pg::control::PgQueryRunner;
use crate::pg::page::VerifyPolicy;
use crate::Result;

#[derive(Debug, Clone, Args)]
pub struct BackupPushArgs {
    /// Cluster data directory to back up.
    pub db_directory: PathBuf,

    /// Mark the backup permanent: retention will never delete it.
    #[arg(short = 'p', long = "permanent")]
    pub permanent: bool,

    /// Force a full backup even when an incremental base is available.
    #[arg(short = 'f', long = "full")]
    pub full: bool,

    /// Verify page checksums while reading relation files.
    #[arg(short = 'v', long = "verify")]
    pub verify: bool,

    /// Record all corrupt blocks instead of aborting on the first one.
    #[arg(short = 's', long = "store-all-corrupt")]
    pub store_all_corrupt: bool,
}

pub fn execute(args: BackupPushArgs) -> Result<()> {
    let config = Config::from_env()?;
    let root = config.storage_root()?;
    let mut runner = PgQueryRunner::connect()?;
    let settings = BackupPushSettings {
        permanent: args.permanent,
        full: args.full,
        verify: VerifyPolicy {
            verify_checksums: args.verify || args.store_all_corrupt,
            store_all_corrupt: args.store_all_corrupt,
        },
    };
    let name = handle_backup_push(&config, root, &mut runner, &args.db_directory, settings)?;
    println!("{name}");
    Ok(())
}

//! Implementation of `walvault backup-list`.

use chrono::{DateTime, Utc};
use clap::Args;

use crate::backup::list_backups;
use crate::config::Config;
use crate::Result;

#[derive(Debug, Clone, Args)]
pub struct BackupListArgs {
    /// Print sentinel details as JSON lines instead of the table.
    #[arg(long = "json")]
    pub json: bool,
}

pub fn execute(args: BackupListArgs) -> Result<()> {
    let config = Config::from_env()?;
    let root = config.storage_root()?;
    let base_folder = root.sub_folder(crate::storage::BASE_BACKUPS_PATH);
    let backups = list_backups(&base_folder)?;

    if args.json {
        for backup in &backups {
            let sentinel = crate::backup::fetch_sentinel(&base_folder, &backup.name)?;
            println!("{}", serde_json::to_string(&sentinel)?);
        }
        return Ok(());
    }

    println!(
        "{:<54} {:<24} wal_segment_backup_start",
        "name", "last_modified"
    );
    for backup in &backups {
        let modified: DateTime<Utc> = backup.modified.into();
        println!(
            "{:<54} {:<24} {}",
            backup.name,
            modified.format("%Y-%m-%dT%H:%M:%SZ"),
            backup.wal_file
        );
    }
    Ok(())
}

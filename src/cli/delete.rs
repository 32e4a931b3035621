//! Implementation of `walvault delete`.

use clap::{Args, Subcommand};

use crate::backup::retention::{handle_delete, DeleteTarget};
use crate::config::Config;
use crate::{Error, Result};

#[derive(Debug, Clone, Args)]
pub struct DeleteArgs {
    #[command(subcommand)]
    pub rule: DeleteRule,

    /// Actually delete; without this flag the sweep is a dry run.
    #[arg(long = "confirm", global = true)]
    pub confirm: bool,
}

#[derive(Debug, Clone, Subcommand)]
pub enum DeleteRule {
    /// Keep the newest COUNT backups, delete the rest.
    Retain { count: usize },
    /// Delete backups older than a backup name or an RFC3339 instant.
    Before { target: String },
    /// Delete every backup and all archived WAL.
    Everything,
}

pub fn execute(args: DeleteArgs) -> Result<()> {
    let config = Config::from_env()?;
    let root = config.storage_root()?;
    let target = match args.rule {
        DeleteRule::Retain { count } => {
            if count == 0 {
                return Err(Error::Cli("retain count must be positive".into()).into());
            }
            DeleteTarget::Retain { count }
        }
        DeleteRule::Before { target } => DeleteTarget::Before { selector: target },
        DeleteRule::Everything => DeleteTarget::Everything,
    };
    handle_delete(root, target, args.confirm)
}

//! CLI surface; subcommands live here.

use clap::{CommandFactory, Parser, Subcommand};

use crate::Result;

pub mod backup_fetch;
pub mod backup_list;
pub mod backup_push;
pub mod copy;
pub mod delete;
pub mod wal_fetch;
pub mod wal_push;

#[derive(Debug, Clone)]
pub enum Command {
    BackupPush(backup_push::BackupPushArgs),
    BackupFetch(backup_fetch::BackupFetchArgs),
    WalPush(wal_push::WalPushArgs),
    WalFetch(wal_fetch::WalFetchArgs),
    BackupList(backup_list::BackupListArgs),
    Delete(delete::DeleteArgs),
    Copy(copy::CopyArgs),
    None,
}

#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub command: Option<Command>,
}

pub fn dispatch(args: CliArgs) -> Result<()> {
    match args.command {
        Some(Command::BackupPush(a)) => backup_push::execute(a),
        Some(Command::BackupFetch(a)) => backup_fetch::execute(a),
        Some(Command::WalPush(a)) => wal_push::execute(a),
        Some(Command::WalFetch(a)) => wal_fetch::execute(a),
        Some(Command::BackupList(a)) => backup_list::execute(a),
        Some(Command::Delete(a)) => delete::execute(a),
        Some(Command::Copy(a)) => copy::execute(a),
        Some(Command::None) | None => Ok(()),
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "walvault",
    version,
    about = "Physical backups and WAL archiving for PostgreSQL clusters"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Subcommands>,
}

#[derive(Subcommand, Debug)]
enum Subcommands {
    /// Make a base backup and upload it to storage.
    BackupPush(backup_push::BackupPushArgs),
    /// Download and restore a backup into a data directory.
    BackupFetch(backup_fetch::BackupFetchArgs),
    /// Archive one WAL segment (the archive_command side).
    WalPush(wal_push::WalPushArgs),
    /// Fetch one WAL segment from the archive (the restore_command side).
    WalFetch(wal_fetch::WalFetchArgs),
    /// List committed backups.
    BackupList(backup_list::BackupListArgs),
    /// Sweep old backups and their WAL under a retention rule.
    Delete(delete::DeleteArgs),
    /// Copy archived objects between two configured storages.
    Copy(copy::CopyArgs),
}

/// Parse CLI arguments into internal representation.
pub fn parse_args<I, S>(args: I) -> Result<CliArgs>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let argv: Vec<String> = args.into_iter().map(Into::into).collect();
    let cli = Cli::parse_from(argv);
    let command = cli.command.map(|command| match command {
        Subcommands::BackupPush(args) => Command::BackupPush(args),
        Subcommands::BackupFetch(args) => Command::BackupFetch(args),
        Subcommands::WalPush(args) => Command::WalPush(args),
        Subcommands::WalFetch(args) => Command::WalFetch(args),
        Subcommands::BackupList(args) => Command::BackupList(args),
        Subcommands::Delete(args) => Command::Delete(args),
        Subcommands::Copy(args) => Command::Copy(args),
    });
    Ok(CliArgs { command })
}

/// Build the underlying clap `Command` (useful for help/usage contract
/// tests).
pub fn clap_command() -> clap::Command {
    Cli::command()
}

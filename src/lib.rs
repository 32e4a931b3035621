use thiserror::Error;

pub mod backup;
pub mod bundle;
pub mod cli;
pub mod compress;
pub mod config;
pub mod crypto;
pub mod increment;
pub mod logging;
pub mod pg;
pub mod storage;
pub mod sync;
pub mod tarball;
pub mod upload;
pub mod wal;
pub mod wal_archive;

pub type Result<T> = anyhow::Result<T>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("missing required setting: {0}")]
    MissingSetting(&'static str),
    #[error("invalid value for {name}: {value}")]
    InvalidSetting { name: &'static str, value: String },
    #[error("backup precondition failed: {0}")]
    Precondition(String),
    #[error("unsupported postgres version: {0}")]
    UnsupportedVersion(i32),
    #[error("unknown resource manager id {0}")]
    UnknownRm(u8),
    #[error("corrupt page at block {block} of {path}")]
    CorruptPage { path: String, block: u32 },
    #[error("corrupt increment file: {0}")]
    CorruptIncrement(String),
    #[error("corrupt wal segment: {0}")]
    CorruptWal(String),
    #[error("corrupt archive: {0}")]
    CorruptArchive(String),
    #[error("backup lineage broken: {0}")]
    Lineage(String),
    #[error("backup not found: {0}")]
    MissingBackup(String),
    #[error("wal segment not found in archive: {0}")]
    MissingWalSegment(String),
    #[error("wal file '{0}' already archived, contents differ, unable to overwrite")]
    WalOverwrite(String),
    #[error("upload of '{path}' failed after {attempts} attempts")]
    UploadFailed { path: String, attempts: u32 },
    #[error("encryption error: {0}")]
    Crypto(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("serialization error")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("cli error: {0}")]
    Cli(String),
}

/// Entry point for the library, called by the CLI thin wrapper.
pub fn run<I, S>(args: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    // Initialize logging before doing anything else.
    logging::init_logging()?;

    let cli_args = cli::parse_args(args.into_iter().map(Into::into))?;
    cli::dispatch(cli_args)
}

//! Database control surface for the backup lifecycle.
//!
//! The SQL text is version-gated and kept in pure builder functions so the
//! coordinator logic can be exercised against a scripted [`QueryRunner`]
//! without a server.

use std::path::PathBuf;

use postgres::{Client, NoTls};
use tracing::{info, warn};

use super::{Lsn, TimelineId};
use crate::{Error, Result};

/// Result of `pg_start_backup`.
#[derive(Debug, Clone)]
pub struct BackupStartInfo {
    /// WAL segment file name at start; absent on a standby.
    pub wal_file_name: Option<String>,
    pub lsn: Lsn,
    pub in_recovery: bool,
}

/// Result of `pg_stop_backup`.
#[derive(Debug, Clone)]
pub struct BackupStopInfo {
    pub label_file: Option<String>,
    pub tablespace_map: Option<String>,
    pub lsn: Lsn,
}

/// Control connection used by the backup coordinator. The live
/// implementation issues SQL over a database session; tests script one.
pub trait QueryRunner: Send {
    fn version(&mut self) -> Result<i32>;
    fn system_identifier(&mut self) -> Result<Option<u64>>;
    fn timeline(&mut self) -> Result<TimelineId>;
    fn data_dir(&mut self) -> Result<PathBuf>;
    fn wal_segment_bytes(&mut self) -> Result<u64>;
    fn start_backup(&mut self, backup_name: &str) -> Result<BackupStartInfo>;
    fn stop_backup(&mut self) -> Result<BackupStopInfo>;
}

/// Start-backup query for a server version (`server_version_num` form).
pub fn build_start_backup_query(version: i32) -> Result<&'static str> {
    match version {
        v if v >= 100000 => Ok(
            "SELECT case when pg_is_in_recovery() \
             then '' else (pg_walfile_name_offset(lsn)).file_name end, \
             lsn::text, pg_is_in_recovery() FROM pg_start_backup($1, true, false) lsn",
        ),
        v if v >= 90600 => Ok(
            "SELECT case when pg_is_in_recovery() \
             then '' else (pg_xlogfile_name_offset(lsn)).file_name end, \
             lsn::text, pg_is_in_recovery() FROM pg_start_backup($1, true, false) lsn",
        ),
        v if v >= 90000 => Ok(
            "SELECT case when pg_is_in_recovery() \
             then '' else (pg_xlogfile_name_offset(lsn)).file_name end, \
             lsn::text, pg_is_in_recovery() FROM pg_start_backup($1, true) lsn",
        ),
        v => Err(Error::UnsupportedVersion(v).into()),
    }
}

/// Stop-backup query for a server version. Versions before 9.6 have no
/// non-exclusive mode and return neither label nor tablespace map.
pub fn build_stop_backup_query(version: i32) -> Result<&'static str> {
    match version {
        v if v >= 90600 => Ok("SELECT labelfile, spcmapfile, lsn::text FROM pg_stop_backup(false)"),
        v if v >= 90000 => Ok("SELECT '', '', lsn::text FROM pg_stop_backup() lsn"),
        v => Err(Error::UnsupportedVersion(v).into()),
    }
}

/// Control connection over a live server session.
pub struct PgQueryRunner {
    client: Client,
    version: i32,
}

impl PgQueryRunner {
    /// Connect using the usual libpq environment (PGHOST, PGPORT, PGUSER,
    /// PGPASSWORD, PGDATABASE).
    pub fn connect() -> Result<Self> {
        let mut config = postgres::Config::new();
        let user = std::env::var("PGUSER")
            .or_else(|_| std::env::var("USER"))
            .unwrap_or_else(|_| "postgres".to_string());
        config.host(&std::env::var("PGHOST").unwrap_or_else(|_| "localhost".to_string()));
        config.port(
            std::env::var("PGPORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5432),
        );
        config.dbname(&std::env::var("PGDATABASE").unwrap_or_else(|_| user.clone()));
        config.user(&user);
        if let Ok(password) = std::env::var("PGPASSWORD") {
            config.password(&password);
        }
        let mut client = config.connect(NoTls).map_err(io_from_pg)?;

        let row = client
            .query_one("select (current_setting('server_version_num'))::int", &[])
            .map_err(io_from_pg)?;
        let version: i32 = row.get(0);
        Ok(Self { client, version })
    }

    fn get_setting(&mut self, name: &str) -> Result<String> {
        let row = self
            .client
            .query_one("select setting from pg_settings where name = $1", &[&name])
            .map_err(io_from_pg)?;
        Ok(row.get(0))
    }
}

fn io_from_pg(err: postgres::Error) -> anyhow::Error {
    anyhow::Error::new(err).context("database control call failed")
}

impl QueryRunner for PgQueryRunner {
    fn version(&mut self) -> Result<i32> {
        Ok(self.version)
    }

    fn system_identifier(&mut self) -> Result<Option<u64>> {
        match self
            .client
            .query_one("select system_identifier from pg_control_system()", &[])
        {
            Ok(row) => {
                let id: i64 = row.get(0);
                Ok(Some(id as u64))
            }
            Err(err) => {
                warn!("could not read system identifier: {err}");
                Ok(None)
            }
        }
    }

    fn timeline(&mut self) -> Result<TimelineId> {
        let row = self
            .client
            .query_one("select timeline_id from pg_control_checkpoint()", &[])
            .map_err(io_from_pg)?;
        let timeline: i32 = row.get(0);
        Ok(timeline as TimelineId)
    }

    fn data_dir(&mut self) -> Result<PathBuf> {
        Ok(PathBuf::from(self.get_setting("data_directory")?))
    }

    fn wal_segment_bytes(&mut self) -> Result<u64> {
        let mut bytes: u64 = self
            .get_setting("wal_segment_size")?
            .parse()
            .map_err(|_| Error::Precondition("unreadable wal_segment_size".into()))?;
        if self.version < 110000 {
            // Reported in 8 KiB blocks before PostgreSQL 11.
            bytes *= 8192;
        }
        Ok(bytes)
    }

    fn start_backup(&mut self, backup_name: &str) -> Result<BackupStartInfo> {
        info!("calling pg_start_backup()");
        let query = build_start_backup_query(self.version)?;
        let row = self
            .client
            .query_one(query, &[&backup_name])
            .map_err(io_from_pg)?;
        let file_name: String = row.get(0);
        let lsn_text: String = row.get(1);
        let in_recovery: bool = row.get(2);
        Ok(BackupStartInfo {
            wal_file_name: (!file_name.is_empty()).then_some(file_name),
            lsn: lsn_text.parse()?,
            in_recovery,
        })
    }

    fn stop_backup(&mut self) -> Result<BackupStopInfo> {
        info!("calling pg_stop_backup()");
        let query = build_stop_backup_query(self.version)?;
        let mut tx = self.client.transaction().map_err(io_from_pg)?;
        tx.batch_execute("SET statement_timeout=0;").map_err(io_from_pg)?;
        let row = tx.query_one(query, &[]).map_err(io_from_pg)?;
        let label: String = row.get(0);
        let spcmap: String = row.get(1);
        let lsn_text: String = row.get(2);
        tx.commit().map_err(io_from_pg)?;
        Ok(BackupStopInfo {
            label_file: (!label.is_empty()).then_some(label),
            tablespace_map: (!spcmap.trim().is_empty()).then_some(spcmap),
            lsn: lsn_text.parse()?,
        })
    }
}

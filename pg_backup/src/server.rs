//! The control-protocol client: the narrow set of SQL calls the engine
//! issues against the primary (and, for a standby backup, a second
//! connection to the standby). Every value that crosses the wire as a
//! `pg_lsn` or `oid` is fetched as text and parsed locally, so this module
//! never depends on the driver's own type mapping for those types.

use std::thread;
use std::time::Duration;

use postgres::{Client, Config, NoTls};

use crate::error::{BackupError, Result};
use postgres_ffi::pg_constants::MIN_SUPPORTED_SERVER_VERSION;
use utils::lsn::Lsn;
use utils::signals::Interrupt;

/// Exponential backoff schedule (seconds) for polling standby replay
/// progress before giving up on a single iteration and checking for
/// interrupt again.
const STANDBY_POLL_BACKOFF_SECS: [u64; 7] = [1, 2, 4, 8, 16, 32, 60];

pub struct BeginBackupResult {
    pub timeline: u32,
    pub start_lsn: Lsn,
}

pub struct StopBackupResult {
    pub stop_lsn: Lsn,
    pub backup_label: String,
    pub tablespace_map: String,
}

/// A live connection plus the means to cancel whatever query is in flight
/// on it, per the interrupt-cancels-in-flight-SQL requirement.
pub struct ServerConnection {
    client: Client,
    cancel_token: postgres::CancelToken,
}

impl ServerConnection {
    pub fn connect(config: &Config) -> Result<ServerConnection> {
        let client = config
            .connect(NoTls)
            .map_err(|e| BackupError::PgConnect(e.into()))?;
        let cancel_token = client.cancel_token();
        Ok(ServerConnection {
            client,
            cancel_token,
        })
    }

    /// Cancels whatever query is currently executing on this connection.
    /// Used by the interrupt handler; a cancel with nothing in flight is a
    /// harmless no-op on the server side.
    pub fn cancel_current_query(&self) {
        let _ = self.cancel_token.cancel_query(NoTls);
    }

    /// A cloneable handle good for issuing a cancel from another thread,
    /// since the connection itself is blocked inside whatever query is
    /// executing and can't poll anything concurrently.
    pub fn cancel_token(&self) -> postgres::CancelToken {
        self.cancel_token.clone()
    }

    pub fn check_version_and_block_size(&mut self, expected_block_size: u32) -> Result<()> {
        let row = self
            .client
            .query_one("SHOW server_version_num", &[])
            .map_err(|e| BackupError::pg_command(e.to_string()))?;
        let version_str: String = row.get(0);
        let version: u32 = version_str
            .parse()
            .map_err(|_| BackupError::pg_command("unparsable server_version_num"))?;
        if version < MIN_SUPPORTED_SERVER_VERSION {
            return Err(BackupError::PgIncompatible(format!(
                "server version {version} is older than the minimum supported {MIN_SUPPORTED_SERVER_VERSION}"
            )));
        }

        let row = self
            .client
            .query_one("SHOW block_size", &[])
            .map_err(|e| BackupError::pg_command(e.to_string()))?;
        let block_size: u32 = row
            .get::<_, String>(0)
            .parse()
            .map_err(|_| BackupError::pg_command("unparsable block_size"))?;
        if block_size != expected_block_size {
            return Err(BackupError::PgIncompatible(format!(
                "server block size {block_size} does not match expected {expected_block_size}"
            )));
        }
        Ok(())
    }

    /// The server's current timeline, readable outside of a backup session
    /// (used to resolve an incremental base before `begin_backup` is
    /// issued).
    pub fn current_timeline(&mut self) -> Result<u32> {
        let row = self
            .client
            .query_one("SELECT timeline_id FROM pg_control_checkpoint()", &[])
            .map_err(|e| BackupError::pg_command(e.to_string()))?;
        let timeline: i32 = row.get(0);
        Ok(timeline as u32)
    }

    pub fn begin_backup(&mut self, label: &str, fast: bool) -> Result<BeginBackupResult> {
        let row = self
            .client
            .query_one("SELECT lsn::text FROM pg_backup_start($1, $2)", &[&label, &fast])
            .map_err(|e| BackupError::pg_command(e.to_string()))?;
        let start_lsn: Lsn = parse_lsn_column(&row, 0)?;
        let timeline = self.current_timeline()?;

        Ok(BeginBackupResult {
            timeline,
            start_lsn,
        })
    }

    pub fn stop_backup(&mut self) -> Result<StopBackupResult> {
        let row = self
            .client
            .query_one(
                "SELECT lsn::text, labelfile, spcmapfile FROM pg_backup_stop(wait_for_archive => true)",
                &[],
            )
            .map_err(|e| BackupError::pg_command(e.to_string()))?;
        let stop_lsn: Lsn = parse_lsn_column(&row, 0)?;
        let backup_label: String = row.get(1);
        let tablespace_map: Option<String> = row.get(2);

        Ok(StopBackupResult {
            stop_lsn,
            backup_label,
            tablespace_map: tablespace_map.unwrap_or_default(),
        })
    }

    pub fn wal_filename(&mut self, lsn: Lsn) -> Result<String> {
        let row = self
            .client
            .query_one(
                "SELECT file_name FROM pg_walfile_name_offset($1::pg_lsn)",
                &[&lsn.to_string()],
            )
            .map_err(|e| BackupError::pg_command(e.to_string()))?;
        Ok(row.get(0))
    }

    pub fn switch_wal(&mut self) -> Result<(u32, Lsn)> {
        let row = self
            .client
            .query_one("SELECT pg_switch_wal()::text", &[])
            .map_err(|e| BackupError::pg_command(e.to_string()))?;
        let lsn = parse_lsn_column(&row, 0)?;

        let row = self
            .client
            .query_one("SELECT timeline_id FROM pg_control_checkpoint()", &[])
            .map_err(|e| BackupError::pg_command(e.to_string()))?;
        let timeline: i32 = row.get(0);
        Ok((timeline as u32, lsn))
    }

    /// Transaction id visible at the point this is called, truncated to the
    /// 32-bit `xid` used in recovery diagnostics.
    pub fn recovery_xid(&mut self) -> Result<u32> {
        let row = self
            .client
            .query_one("SELECT txid_current()", &[])
            .map_err(|e| BackupError::pg_command(e.to_string()))?;
        let txid: i64 = row.get(0);
        Ok(txid as u32)
    }

    pub fn checkpoint(&mut self) -> Result<()> {
        self.client
            .batch_execute("CHECKPOINT")
            .map_err(|e| BackupError::pg_command(e.to_string()))
    }

    pub fn replayed_lsn(&mut self) -> Result<Lsn> {
        let row = self
            .client
            .query_one("SELECT pg_last_wal_replay_lsn()::text", &[])
            .map_err(|e| BackupError::pg_command(e.to_string()))?;
        parse_lsn_column(&row, 0)
    }

    pub fn tablespaces(&mut self) -> Result<Vec<(String, u32)>> {
        let rows = self
            .client
            .query(
                "SELECT spcname, oid::text FROM pg_tablespace WHERE spcname NOT IN ('pg_default', 'pg_global')",
                &[],
            )
            .map_err(|e| BackupError::pg_command(e.to_string()))?;
        rows.into_iter()
            .map(|row| {
                let name: String = row.get(0);
                let oid: String = row.get(1);
                let oid: u32 = oid
                    .parse()
                    .map_err(|_| BackupError::pg_command("unparsable tablespace oid"))?;
                Ok((name, oid))
            })
            .collect()
    }
}

fn parse_lsn_column(row: &postgres::Row, idx: usize) -> Result<Lsn> {
    let text: String = row.get(idx);
    text.parse()
        .map_err(|_| BackupError::pg_command(format!("unparsable LSN {text:?}")))
}

/// Polls the standby's replay position with exponential backoff (1, 2, 4,
/// 8, 16, 32, then 60 seconds between attempts) until it reaches
/// `start_lsn`, or an interrupt is observed.
pub fn wait_for_standby_replay(standby: &mut ServerConnection, start_lsn: Lsn, interrupt: &Interrupt) -> Result<()> {
    let mut attempt = 0usize;
    loop {
        if interrupt.fired() {
            return Err(BackupError::Interrupted);
        }
        let replayed = standby.replayed_lsn()?;
        if replayed >= start_lsn {
            return Ok(());
        }
        let delay = STANDBY_POLL_BACKOFF_SECS[attempt.min(STANDBY_POLL_BACKOFF_SECS.len() - 1)];
        thread::sleep(Duration::from_secs(delay));
        attempt += 1;
    }
}

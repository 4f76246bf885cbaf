//! The `Backup` record: one catalog entry's durable metadata, and its
//! `backup.ini` key=value serialization.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{BackupError, Result};
use utils::lsn::Lsn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupMode {
    Full,
    Incremental,
    Archive,
}

impl fmt::Display for BackupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackupMode::Full => "FULL",
            BackupMode::Incremental => "INCREMENTAL",
            BackupMode::Archive => "ARCHIVE",
        };
        write!(f, "{s}")
    }
}

impl FromStr for BackupMode {
    type Err = BackupError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "FULL" => Ok(BackupMode::Full),
            "INCREMENTAL" => Ok(BackupMode::Incremental),
            "ARCHIVE" => Ok(BackupMode::Archive),
            other => Err(BackupError::pg_command(format!("unknown backup_mode {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStatus {
    Running,
    Done,
    Error,
    Deleted,
    Corrupt,
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackupStatus::Running => "RUNNING",
            BackupStatus::Done => "DONE",
            BackupStatus::Error => "ERROR",
            BackupStatus::Deleted => "DELETED",
            BackupStatus::Corrupt => "CORRUPT",
        };
        write!(f, "{s}")
    }
}

impl FromStr for BackupStatus {
    type Err = BackupError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "RUNNING" => Ok(BackupStatus::Running),
            "DONE" => Ok(BackupStatus::Done),
            "ERROR" => Ok(BackupStatus::Error),
            "DELETED" => Ok(BackupStatus::Deleted),
            "CORRUPT" => Ok(BackupStatus::Corrupt),
            other => Err(BackupError::pg_command(format!("unknown status {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ByteCounters {
    pub data_bytes: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_arclog_bytes: u64,
    pub read_srvlog_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct Backup {
    /// Unique identifier, the start-time formatted as `YYYYMMDD'T'HHMMSS`.
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: BackupStatus,
    pub backup_mode: BackupMode,
    pub with_serverlog: bool,
    pub compress_data: bool,
    pub from_standby: bool,
    pub timeline: u32,
    pub start_lsn: Lsn,
    pub stop_lsn: Lsn,
    pub block_size: u32,
    pub wal_block_size: u32,
    pub recovery_xid: Option<u32>,
    pub recovery_time: Option<DateTime<Utc>>,
    pub counters: ByteCounters,
}

impl Backup {
    /// A `backup` is usable as an incremental/archive base only when it
    /// completed cleanly, carries block data, and shares the current timeline.
    pub fn eligible_as_base(&self, current_timeline: u32) -> bool {
        self.status == BackupStatus::Done
            && matches!(self.backup_mode, BackupMode::Full | BackupMode::Incremental)
            && self.timeline == current_timeline
    }

    pub fn new_running(id: String, start_time: DateTime<Utc>, backup_mode: BackupMode) -> Backup {
        Backup {
            id,
            start_time,
            end_time: None,
            status: BackupStatus::Running,
            backup_mode,
            with_serverlog: false,
            compress_data: false,
            from_standby: false,
            timeline: 0,
            start_lsn: Lsn::INVALID,
            stop_lsn: Lsn::INVALID,
            block_size: 0,
            wal_block_size: 0,
            recovery_xid: None,
            recovery_time: None,
            counters: ByteCounters::default(),
        }
    }

    pub fn serialize_ini(&self) -> String {
        let mut kv: Vec<(&str, String)> = vec![
            ("start_time", self.start_time.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("status", self.status.to_string()),
            ("backup_mode", self.backup_mode.to_string()),
            ("with_serverlog", self.with_serverlog.to_string()),
            ("compress_data", self.compress_data.to_string()),
            ("from_standby", self.from_standby.to_string()),
            ("timeline", self.timeline.to_string()),
            ("start_lsn", self.start_lsn.to_string()),
            ("stop_lsn", self.stop_lsn.to_string()),
            ("block_size", self.block_size.to_string()),
            ("wal_block_size", self.wal_block_size.to_string()),
            ("data_bytes", self.counters.data_bytes.to_string()),
            ("read_bytes", self.counters.read_bytes.to_string()),
            ("write_bytes", self.counters.write_bytes.to_string()),
            ("read_arclog_bytes", self.counters.read_arclog_bytes.to_string()),
            ("read_srvlog_bytes", self.counters.read_srvlog_bytes.to_string()),
        ];
        if let Some(end_time) = self.end_time {
            kv.push(("end_time", end_time.to_rfc3339_opts(SecondsFormat::Secs, true)));
        }
        if let Some(xid) = self.recovery_xid {
            kv.push(("recovery_xid", xid.to_string()));
        }
        if let Some(rt) = self.recovery_time {
            kv.push(("recovery_time", rt.to_rfc3339_opts(SecondsFormat::Secs, true)));
        }

        let mut out = String::new();
        for (k, v) in kv {
            out.push_str(&format!("{k} = {v}\n"));
        }
        out
    }

    pub fn parse_ini(id: &str, text: &str) -> Result<Backup> {
        let mut map = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (k, v) = line
                .split_once('=')
                .ok_or_else(|| BackupError::pg_command(format!("malformed backup.ini line: {line:?}")))?;
            map.insert(k.trim().to_string(), v.trim().to_string());
        }

        let field = |name: &str| -> Result<&String> {
            map.get(name)
                .ok_or_else(|| BackupError::pg_command(format!("backup.ini missing {name}")))
        };
        let parse_bool = |name: &str| -> Result<bool> {
            field(name)?
                .parse::<bool>()
                .map_err(|_| BackupError::pg_command(format!("backup.ini field {name} is not a bool")))
        };
        let parse_u32 = |name: &str| -> Result<u32> {
            field(name)?
                .parse::<u32>()
                .map_err(|_| BackupError::pg_command(format!("backup.ini field {name} is not a u32")))
        };
        let parse_u64 = |name: &str| -> Result<u64> {
            field(name)?
                .parse::<u64>()
                .map_err(|_| BackupError::pg_command(format!("backup.ini field {name} is not a u64")))
        };
        let parse_time = |name: &str| -> Result<DateTime<Utc>> {
            DateTime::parse_from_rfc3339(field(name)?)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|_| BackupError::pg_command(format!("backup.ini field {name} is not RFC3339")))
        };
        let parse_lsn = |name: &str| -> Result<Lsn> {
            field(name)?
                .parse::<Lsn>()
                .map_err(|_| BackupError::pg_command(format!("backup.ini field {name} is not an LSN")))
        };

        Ok(Backup {
            id: id.to_string(),
            start_time: parse_time("start_time")?,
            end_time: map.get("end_time").map(|_| parse_time("end_time")).transpose()?,
            status: field("status")?.parse()?,
            backup_mode: field("backup_mode")?.parse()?,
            with_serverlog: parse_bool("with_serverlog")?,
            compress_data: parse_bool("compress_data")?,
            from_standby: parse_bool("from_standby")?,
            timeline: parse_u32("timeline")?,
            start_lsn: parse_lsn("start_lsn")?,
            stop_lsn: parse_lsn("stop_lsn")?,
            block_size: parse_u32("block_size")?,
            wal_block_size: parse_u32("wal_block_size")?,
            recovery_xid: map.get("recovery_xid").map(|_| parse_u32("recovery_xid")).transpose()?,
            recovery_time: map.get("recovery_time").map(|_| parse_time("recovery_time")).transpose()?,
            counters: ByteCounters {
                data_bytes: parse_u64("data_bytes")?,
                read_bytes: parse_u64("read_bytes")?,
                write_bytes: parse_u64("write_bytes")?,
                read_arclog_bytes: parse_u64("read_arclog_bytes")?,
                read_srvlog_bytes: parse_u64("read_srvlog_bytes")?,
            },
        })
    }

    /// Formats `start_time` as the catalog's directory-name identifier.
    pub fn id_for_time(t: DateTime<Utc>) -> String {
        t.format("%Y%m%dT%H%M%S").to_string()
    }
}

/// Relative path of a backup's root within the catalog's `backup/` directory.
pub fn backup_dir_name(id: &str) -> Utf8PathBuf {
    Utf8PathBuf::from(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Backup {
        let start = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut b = Backup::new_running(Backup::id_for_time(start), start, BackupMode::Full);
        b.status = BackupStatus::Done;
        b.timeline = 1;
        b.start_lsn = Lsn(100);
        b.stop_lsn = Lsn(200);
        b.block_size = 8192;
        b.wal_block_size = 8192;
        b.end_time = Some(start + chrono::Duration::seconds(5));
        b.recovery_xid = Some(42);
        b
    }

    #[test]
    fn round_trips_through_ini() {
        let b = sample();
        let text = b.serialize_ini();
        let parsed = Backup::parse_ini(&b.id, &text).unwrap();
        assert_eq!(parsed.status, BackupStatus::Done);
        assert_eq!(parsed.start_lsn, Lsn(100));
        assert_eq!(parsed.stop_lsn, Lsn(200));
        assert_eq!(parsed.recovery_xid, Some(42));
    }

    #[test]
    fn eligible_as_base_requires_done_matching_timeline_and_mode() {
        let mut b = sample();
        assert!(b.eligible_as_base(1));
        assert!(!b.eligible_as_base(2));
        b.status = BackupStatus::Error;
        assert!(!b.eligible_as_base(1));
        b.status = BackupStatus::Done;
        b.backup_mode = BackupMode::Archive;
        assert!(!b.eligible_as_base(1));
    }

    #[test]
    fn id_format_matches_catalog_directory_convention() {
        let t = DateTime::parse_from_rfc3339("2026-03-05T09:08:07Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(Backup::id_for_time(t), "20260305T090807");
    }
}

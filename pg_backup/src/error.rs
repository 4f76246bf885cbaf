//! Error kinds the engine raises, and the exit code each maps to. This is
//! the one place that understands the mapping from [`BackupError`] to a
//! process exit code; every leaf component returns a `BackupError` and lets
//! it propagate up to the orchestrator rather than calling `process::exit`
//! itself.

use std::fmt;

pub type Result<T> = std::result::Result<T, BackupError>;

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("system error: {0}")]
    System(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Args(String),

    #[error("interrupted")]
    Interrupted,

    #[error("unexpected result from server: {0}")]
    PgCommand(String),

    #[error("could not connect to server: {0}")]
    PgConnect(#[source] anyhow::Error),

    #[error("server incompatible: {0}")]
    PgIncompatible(String),

    #[error("archive wait timed out for WAL segment {segment}")]
    ArchiveFailed { segment: String },

    #[error("another backup is already running")]
    AlreadyRunning,

    #[error("checksum mismatch for block {blkno} of {path} (LSN {lsn})")]
    CorruptPage {
        path: String,
        blkno: u32,
        lsn: String,
    },
}

impl BackupError {
    pub fn args(msg: impl Into<String>) -> BackupError {
        BackupError::Args(msg.into())
    }

    pub fn pg_command(msg: impl Into<String>) -> BackupError {
        BackupError::PgCommand(msg.into())
    }

    pub fn exit_code(&self) -> ExitCode {
        match self {
            BackupError::Args(_) => ExitCode::ArgsError,
            BackupError::Interrupted => ExitCode::Interrupted,
            BackupError::AlreadyRunning => ExitCode::AlreadyRunning,
            BackupError::PgIncompatible(_) => ExitCode::ServerIncompatible,
            BackupError::System(_)
            | BackupError::PgCommand(_)
            | BackupError::PgConnect(_)
            | BackupError::ArchiveFailed { .. }
            | BackupError::CorruptPage { .. } => ExitCode::OrdinaryError,
        }
    }

    /// Short, severity-tagged line(s) suitable for stderr: `ERROR: ...`
    /// optionally followed by `DETAIL:`/`HINT:` lines.
    pub fn user_message(&self) -> String {
        match self {
            BackupError::ArchiveFailed { segment } => format!(
                "ERROR: timed out waiting for archiving of WAL segment \"{segment}\"\nHINT: check that archive_command is configured and succeeding"
            ),
            BackupError::AlreadyRunning => {
                "ERROR: another pg_backup process is running against this catalog".to_string()
            }
            other => format!("ERROR: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success,
    OrdinaryError,
    Interrupted,
    ArgsError,
    AlreadyRunning,
    ServerIncompatible,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::OrdinaryError => 1,
            ExitCode::Interrupted => 2,
            ExitCode::ArgsError => 3,
            ExitCode::AlreadyRunning => 4,
            ExitCode::ServerIncompatible => 5,
        }
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_for_named_kinds() {
        let already_running = BackupError::AlreadyRunning.exit_code();
        let incompatible = BackupError::PgIncompatible("too old".into()).exit_code();
        let interrupted = BackupError::Interrupted.exit_code();
        let args = BackupError::args("missing pgdata").exit_code();
        assert_ne!(already_running, incompatible);
        assert_ne!(already_running.as_i32(), interrupted.as_i32());
        assert_ne!(args.as_i32(), ExitCode::Success.as_i32());
    }
}

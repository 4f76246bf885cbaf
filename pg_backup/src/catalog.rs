//! The on-disk catalog: discovery, locking, incremental-base selection,
//! per-backup directory creation, and retention.

use std::fs::{self, File};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use fs2::FileExt;

use crate::backup::{Backup, BackupStatus};
use crate::error::{BackupError, Result};
use postgres_ffi::pg_constants::ARCHIVE_STATUS_SUBDIR;
use utils::crashsafe;

const LOCK_FILE: &str = "backup.lock";
const BACKUP_SUBDIR: &str = "backup";
const TIMELINE_HISTORY_SUBDIR: &str = "timeline_history";

pub struct Catalog {
    pub root: Utf8PathBuf,
}

/// Held for the lifetime of a run; dropping it releases the lock.
pub struct CatalogLock {
    _file: File,
}

pub enum LockOutcome {
    Acquired(CatalogLock),
    Held,
}

impl Catalog {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Catalog {
        Catalog { root: root.into() }
    }

    pub fn backups_dir(&self) -> Utf8PathBuf {
        self.root.join(BACKUP_SUBDIR)
    }

    pub fn timeline_history_dir(&self) -> Utf8PathBuf {
        self.root.join(TIMELINE_HISTORY_SUBDIR)
    }

    /// Tries to acquire the catalog's exclusive lock without blocking.
    pub fn lock(&self) -> Result<LockOutcome> {
        crashsafe::ensure_dir(self.root.as_std_path())?;
        let path = self.root.join(LOCK_FILE);
        let file = File::options().create(true).write(true).open(path.as_std_path())?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(LockOutcome::Acquired(CatalogLock { _file: file })),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(LockOutcome::Held),
            Err(e) => Err(BackupError::System(e)),
        }
    }

    /// Enumerates every backup subdirectory and parses its metadata.
    pub fn list_backups(&self) -> Result<Vec<Backup>> {
        let dir = self.backups_dir();
        if !dir.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut backups = Vec::new();
        for entry in fs::read_dir(dir.as_std_path())? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            let ini_path = dir.join(&id).join("backup.ini");
            let text = fs::read_to_string(ini_path.as_std_path())?;
            backups.push(Backup::parse_ini(&id, &text)?);
        }
        backups.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        Ok(backups)
    }

    /// Most recent `DONE` full-or-incremental backup on `current_timeline`,
    /// if any.
    pub fn select_incremental_base(&self, current_timeline: u32) -> Result<Option<Backup>> {
        let backups = self.list_backups()?;
        Ok(backups
            .into_iter()
            .filter(|b| b.eligible_as_base(current_timeline))
            .max_by_key(|b| b.start_time))
    }

    /// Builds the per-backup directory tree and writes the initial metadata.
    pub fn create_backup_dir(&self, backup: &Backup) -> Result<Utf8PathBuf> {
        let dir = self.backups_dir().join(&backup.id);
        crashsafe::ensure_dir(dir.join("database").as_std_path())?;
        crashsafe::ensure_dir(dir.join("arclog").as_std_path())?;
        if backup.with_serverlog {
            crashsafe::ensure_dir(dir.join("srvlog").as_std_path())?;
        }
        crashsafe::ensure_dir(self.timeline_history_dir().as_std_path())?;
        self.write_metadata(backup)?;
        Ok(dir)
    }

    /// Flushes `backup`'s current record to its metadata file, crash-safely.
    pub fn write_metadata(&self, backup: &Backup) -> Result<()> {
        let dir = self.backups_dir().join(&backup.id);
        let path = dir.join("backup.ini");
        crashsafe::overwrite(path.as_std_path(), backup.serialize_ini().as_bytes())?;
        Ok(())
    }

    /// Deletes `DONE` backups oldest-first, keeping at least enough that
    /// every retained backup's base chain remains intact, subject to
    /// `keep_generations` (count) and `keep_days` (age). A backup still
    /// depended on by a retained backup is never deleted even past both
    /// thresholds.
    pub fn sweep_retention(&self, keep_generations: usize, keep_days: i64, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut backups = self.list_backups()?;
        backups.sort_by(|a, b| b.start_time.cmp(&a.start_time)); // newest first

        let mut keep = vec![false; backups.len()];
        for (i, b) in backups.iter().enumerate() {
            if b.status != BackupStatus::Done {
                keep[i] = true; // never touch non-DONE backups here
                continue;
            }
            let within_count = i < keep_generations;
            let within_age = now.signed_duration_since(b.start_time).num_days() < keep_days;
            keep[i] = within_count || within_age;
        }

        // An INCREMENTAL backup kept cascades the requirement onto its base,
        // which cascades onto its own base in turn, and so on. Walking
        // newest-to-oldest (index 0 is newest) means each index's `keep`
        // flag is finalized before its own turn to propagate runs, so a
        // multi-level chain (F <- I1 <- I2 <- I3) converges in one pass.
        for i in 0..backups.len() {
            if keep[i] && backups[i].backup_mode == crate::backup::BackupMode::Incremental {
                // the nearest older eligible base is younger in index (the
                // vec is newest-first, so older entries sit at higher indices)
                if let Some(dep) = backups[i + 1..]
                    .iter()
                    .position(|b| b.eligible_as_base(backups[i].timeline))
                {
                    keep[i + 1 + dep] = true;
                }
            }
        }

        let mut deleted = Vec::new();
        for (i, b) in backups.iter().enumerate() {
            if !keep[i] {
                self.mark_deleted(b)?;
                deleted.push(b.id.clone());
            }
        }
        Ok(deleted)
    }

    fn mark_deleted(&self, backup: &Backup) -> Result<()> {
        let dir = self.backups_dir().join(&backup.id);
        let mut updated = backup.clone();
        updated.status = BackupStatus::Deleted;
        self.write_metadata(&updated)?;
        fs::remove_dir_all(dir.join("database").as_std_path()).or_else(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Ok(())
            } else {
                Err(e)
            }
        })?;
        Ok(())
    }

    /// Deletes archived-WAL files older than `keep_days` and beyond the
    /// newest `keep_files`. `<tli>.history` files are always retained;
    /// only complete (24-hex-digit) segment names are candidates.
    pub fn sweep_archive_retention(
        &self,
        files: &mut [(Utf8PathBuf, DateTime<Utc>)],
        keep_files: usize,
        keep_days: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Utf8PathBuf>> {
        files.sort_by(|a, b| b.1.cmp(&a.1)); // newest first
        let mut deleted = Vec::new();
        for (i, (path, mtime)) in files.iter().enumerate() {
            let name = path.file_name().unwrap_or("");
            if postgres_ffi::xlog_utils::is_history_filename(name) {
                continue;
            }
            if !postgres_ffi::xlog_utils::is_wal_segment_filename(name) {
                continue;
            }
            let too_old = now.signed_duration_since(*mtime).num_days() >= keep_days;
            let beyond_keep = i >= keep_files;
            if too_old && beyond_keep {
                fs::remove_file(path.as_std_path())?;
                deleted.push(path.clone());
            }
        }
        Ok(deleted)
    }

    /// Waits briefly for the lock if held, used by tests; production code
    /// uses [`Catalog::lock`] directly and surfaces `AlreadyRunning`
    /// immediately per the "never blocks indefinitely" requirement.
    pub fn lock_or_already_running(&self) -> Result<CatalogLock> {
        match self.lock()? {
            LockOutcome::Acquired(l) => Ok(l),
            LockOutcome::Held => Err(BackupError::AlreadyRunning),
        }
    }
}

/// Name of the archive-status marker for a fully-archived WAL segment.
pub fn archive_status_dir(pgdata: &Utf8Path) -> Utf8PathBuf {
    pgdata.join(ARCHIVE_STATUS_SUBDIR)
}

/// Convenience used by tests wanting a short, deterministic poll interval.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

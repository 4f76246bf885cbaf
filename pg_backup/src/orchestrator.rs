//! The top-level state machine for a single `backup` invocation:
//!
//! `INIT -> LOCKED -> STARTED -> COPYING_DATA -> STOPPED -> WAITING_ARCHIVE
//! -> COPYING_ARCHIVE -> COPYING_SRVLOG -> RETENTION -> DONE`
//!
//! Every failure path, wherever it originates, is handled the same way in
//! [`run_locked`]: unwind any armed snapshot cleanup, let the server
//! connection drop (which aborts a non-exclusive backup), persist
//! `status = ERROR`, and release the lock.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::Utc;
use postgres::Config;
use tracing::{error, info, warn};

use crate::archive_wait::wait_for_archive;
use crate::backup::{Backup, BackupMode, BackupStatus};
use crate::catalog::{Catalog, LockOutcome};
use crate::copier::{self, CopyOptions};
use crate::error::{BackupError, Result};
use crate::filelist::{self, SourceEntry};
use crate::manifest::{FileType, Manifest, ManifestEntry};
use crate::progress::{NullProgress, ProgressSink};
use crate::server::ServerConnection;
use crate::snapshot::{SnapshotDriver, SnapshotMount};
use postgres_ffi::pg_constants::{
    BLCKSZ, DEFAULT_WAL_SEGMENT_SIZE, SERVER_LOG_SUBDIR, WAL_SUBDIR,
};
use postgres_ffi::xlog_utils::xlog_file_name;
use utils::lsn::Lsn;
use utils::signals::Interrupt;

/// Watches for an interrupt while a blocking SQL call may be in flight on
/// the connection that owns `cancel_token`, and issues a cancel the moment
/// it fires. Needed because the flag `Interrupt` carries is only polled at
/// the top of loops; a thread stuck inside a single long `query_one` isn't
/// polling anything until that call returns.
struct CancelWatcher {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CancelWatcher {
    fn spawn(cancel_token: postgres::CancelToken, interrupt: Interrupt) -> CancelWatcher {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();
        let handle = std::thread::spawn(move || {
            while !stop_clone.load(Ordering::Relaxed) {
                if interrupt.fired() {
                    let _ = cancel_token.cancel_query(postgres::NoTls);
                    return;
                }
                std::thread::sleep(Duration::from_millis(200));
            }
        });
        CancelWatcher {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for CancelWatcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub struct RunConfig {
    pub catalog_root: Utf8PathBuf,
    pub pgdata: Utf8PathBuf,
    pub requested_mode: BackupMode,
    pub with_serverlog: bool,
    pub compress_data: bool,
    pub checksums_enabled: bool,
    pub full_backup_on_error: bool,
    pub fast_checkpoint: bool,
    pub backup_label: String,
    pub primary_config: Config,
    pub standby_config: Option<Config>,
    /// The standby's own PGDATA, used only to also poll its archive-status
    /// directory when the backup is taken from a standby (see the open
    /// question on which archive directory is authoritative in that case).
    pub standby_pgdata: Option<Utf8PathBuf>,
    pub keep_generations: usize,
    pub keep_days: i64,
}

/// Runs one backup to completion, returning the final (committed) record.
/// On any failure the catalog lock is released and `ERROR` status is
/// persisted before the error is returned.
pub fn run(config: &RunConfig, interrupt: &Interrupt, progress: &mut dyn ProgressSink) -> Result<Backup> {
    let catalog = Catalog::new(config.catalog_root.clone());

    let lock = match catalog.lock()? {
        LockOutcome::Acquired(lock) => lock,
        LockOutcome::Held => return Err(BackupError::AlreadyRunning),
    };

    let result = run_locked(config, &catalog, interrupt, progress);
    drop(lock);
    result
}

fn run_locked(
    config: &RunConfig,
    catalog: &Catalog,
    interrupt: &Interrupt,
    progress: &mut dyn ProgressSink,
) -> Result<Backup> {
    let mut primary = ServerConnection::connect(&config.primary_config)?;
    primary.check_version_and_block_size(BLCKSZ as u32)?;

    let watcher = CancelWatcher::spawn(primary.cancel_token(), interrupt.clone());

    let (mode, base) = resolve_mode_and_base(config, catalog, &mut primary)?;

    let start_time = Utc::now();
    let mut backup = Backup::new_running(Backup::id_for_time(start_time), start_time, mode);
    backup.with_serverlog = config.with_serverlog;
    backup.compress_data = config.compress_data;
    backup.from_standby = config.standby_config.is_some();
    backup.block_size = BLCKSZ as u32;
    backup.wal_block_size = BLCKSZ as u32;

    catalog.create_backup_dir(&backup)?;

    // `in_backup` from here on: a failure must unwind through `fail`.
    match run_backup_body(config, catalog, &mut backup, &mut primary, interrupt, progress, base) {
        Ok(()) => {
            backup.status = BackupStatus::Done;
            backup.end_time = Some(Utc::now());
            catalog.write_metadata(&backup)?;
            let deleted = catalog.sweep_retention(config.keep_generations, config.keep_days, Utc::now())?;
            if !deleted.is_empty() {
                info!(count = deleted.len(), "retention sweep removed old backups");
            }
            Ok(backup)
        }
        Err(e) => {
            backup.status = BackupStatus::Error;
            backup.end_time = Some(Utc::now());
            if let Err(write_err) = catalog.write_metadata(&backup) {
                warn!(error = %write_err, "failed to persist ERROR status after backup failure");
            }
            error!(error = %e, "backup failed");
            Err(e)
        }
    }
}

/// Resolves the effective backup mode and, for a non-`FULL` mode, its base.
/// Applies the fallback rule: with no eligible base, either downgrade to
/// `FULL` (`full_backup_on_error`) or fail outright.
fn resolve_mode_and_base(
    config: &RunConfig,
    catalog: &Catalog,
    primary: &mut ServerConnection,
) -> Result<(BackupMode, Option<Backup>)> {
    if config.requested_mode == BackupMode::Full {
        return Ok((BackupMode::Full, None));
    }

    let timeline = primary.current_timeline()?;
    match catalog.select_incremental_base(timeline)? {
        Some(base) => Ok((config.requested_mode, Some(base))),
        None if config.full_backup_on_error => {
            warn!("no validated full backup; turn to take a full backup instead");
            Ok((BackupMode::Full, None))
        }
        None => Err(BackupError::args("no validated full backup to use as an incremental base")),
    }
}

#[allow(clippy::too_many_arguments)]
fn run_backup_body(
    config: &RunConfig,
    catalog: &Catalog,
    backup: &mut Backup,
    primary: &mut ServerConnection,
    interrupt: &Interrupt,
    progress: &mut dyn ProgressSink,
    base: Option<Backup>,
) -> Result<()> {
    if backup.backup_mode == BackupMode::Archive {
        return run_archive_only_body(config, catalog, backup, primary, interrupt, base);
    }

    let backup_dir = catalog.backups_dir().join(&backup.id);
    let database_dir = backup_dir.join("database");

    let snapshot_script = config.catalog_root.join("snapshot_script");
    let use_snapshot = snapshot_script.as_std_path().is_file() && config.standby_config.is_none();

    // STARTED
    let begin = primary.begin_backup(&config.backup_label, config.fast_checkpoint)?;
    backup.timeline = begin.timeline;
    backup.start_lsn = begin.start_lsn;

    let mut snapshot_driver = use_snapshot.then(|| SnapshotDriver::new(&snapshot_script));
    let standby_conn = match &config.standby_config {
        Some(cfg) => {
            let mut standby = ServerConnection::connect(cfg)?;
            crate::server::wait_for_standby_replay(&mut standby, backup.start_lsn, interrupt)?;
            standby.checkpoint()?;
            Some(standby)
        }
        None => None,
    };

    let tablespaces = primary.tablespaces()?;
    let (copy_root, mounts): (Utf8PathBuf, Vec<SnapshotMount>) = if let Some(driver) = snapshot_driver.as_mut() {
        match driver.prepare(&tablespaces) {
            Ok(mounts) => {
                let pgdata_mount = mounts
                    .iter()
                    .find(|m| m.name == crate::snapshot::PG_DATA)
                    .map(|m| m.mount_path.clone())
                    .unwrap_or_else(|| config.pgdata.clone());
                (pgdata_mount, mounts)
            }
            Err(e) => return Err(e),
        }
    } else {
        (config.pgdata.clone(), Vec::new())
    };
    let tablespace_roots = tablespace_copy_roots(&config.pgdata, &tablespaces, &mounts)?;

    // COPYING_DATA
    let copy_result = copy_data_phase(
        config,
        &copy_root,
        &tablespace_roots,
        &database_dir,
        base.as_ref(),
        backup,
        progress,
        interrupt,
    );

    if let Some(driver) = snapshot_driver.as_mut() {
        if copy_result.is_ok() {
            driver.finish()?;
        } else {
            driver.abort();
        }
    }
    copy_result?;
    drop(standby_conn); // the standby connection's only job was the pre-copy handshake

    // STOPPED
    let stop = primary.stop_backup()?;
    backup.stop_lsn = stop.stop_lsn;
    backup.recovery_xid = Some(primary.recovery_xid()?);
    backup.recovery_time = Some(Utc::now());

    if !stop.backup_label.is_empty() {
        fs::write(database_dir.join("backup_label").as_std_path(), &stop.backup_label)?;
    }
    if !stop.tablespace_map.is_empty() {
        fs::write(database_dir.join("tablespace_map").as_std_path(), &stop.tablespace_map)?;
    }

    // WAITING_ARCHIVE
    let segment = primary.wal_filename(backup.stop_lsn)?;
    let mut roots = vec![&config.pgdata];
    if let Some(p) = config.standby_pgdata.as_ref() {
        roots.push(p);
    }
    wait_for_archive(&roots, &segment, interrupt)?;

    // COPYING_ARCHIVE / COPYING_SRVLOG
    copy_archive_phase(config, &backup_dir, base.as_ref(), backup.timeline, backup.start_lsn, backup.stop_lsn, backup)?;
    if backup.with_serverlog {
        copy_srvlog_phase(config, &backup_dir, base.as_ref(), backup)?;
    } else {
        write_manifest(&backup_dir.join("srvlog"), "file_srvlog.txt", &[])?;
    }

    Ok(())
}

/// `ARCHIVE` mode: no backup session, no data phase. Forces a WAL switch and
/// captures everything archived since the last `FULL`/`INCREMENTAL` backup's
/// `stop_lsn` up to the new switch point.
fn run_archive_only_body(
    config: &RunConfig,
    catalog: &Catalog,
    backup: &mut Backup,
    primary: &mut ServerConnection,
    interrupt: &Interrupt,
    base: Option<Backup>,
) -> Result<()> {
    let backup_dir = catalog.backups_dir().join(&backup.id);

    backup.start_lsn = base.as_ref().map(|b| b.stop_lsn).unwrap_or(Lsn::INVALID);
    let (timeline, switch_lsn) = primary.switch_wal()?;
    backup.timeline = timeline;
    backup.stop_lsn = switch_lsn;
    backup.recovery_xid = Some(primary.recovery_xid()?);
    backup.recovery_time = Some(Utc::now());

    let segment = primary.wal_filename(backup.stop_lsn)?;
    let mut roots = vec![&config.pgdata];
    if let Some(p) = config.standby_pgdata.as_ref() {
        roots.push(p);
    }
    wait_for_archive(&roots, &segment, interrupt)?;

    write_manifest(&backup_dir.join("database"), "file_database.txt", &[])?;
    copy_archive_phase(config, &backup_dir, base.as_ref(), backup.timeline, backup.start_lsn, backup.stop_lsn, backup)?;
    if backup.with_serverlog {
        copy_srvlog_phase(config, &backup_dir, base.as_ref(), backup)?;
    } else {
        write_manifest(&backup_dir.join("srvlog"), "file_srvlog.txt", &[])?;
    }
    Ok(())
}

/// Pairs each known tablespace with the root the copier should read it from
/// (a snapshot mount if one covers it, otherwise the live `pg_tblspc/<oid>`
/// symlink target) and the prefix its files land at under `database/`.
/// Tablespaces the snapshot didn't produce fall back to the live symlink,
/// per the reconciliation rule the snapshot driver itself enforces.
fn tablespace_copy_roots(
    pgdata: &Utf8PathBuf,
    tablespaces: &[(String, u32)],
    mounts: &[SnapshotMount],
) -> Result<Vec<(Utf8PathBuf, Utf8PathBuf)>> {
    let mut roots = Vec::new();
    for (name, oid) in tablespaces {
        let prefix = Utf8PathBuf::from("pg_tblspc").join(oid.to_string());
        let root = match mounts.iter().find(|m| &m.name == name) {
            Some(m) => m.mount_path.clone(),
            None => {
                let link = pgdata.join("pg_tblspc").join(oid.to_string());
                match fs::read_link(link.as_std_path()) {
                    Ok(target) => Utf8PathBuf::try_from(target)
                        .map_err(|e| BackupError::args(format!("non-UTF-8 tablespace path: {e}")))?,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(BackupError::System(e)),
                }
            }
        };
        roots.push((root, prefix));
    }
    Ok(roots)
}

#[allow(clippy::too_many_arguments)]
fn copy_data_phase(
    config: &RunConfig,
    copy_root: &Utf8PathBuf,
    tablespace_roots: &[(Utf8PathBuf, Utf8PathBuf)],
    database_dir: &Utf8PathBuf,
    base: Option<&Backup>,
    backup: &mut Backup,
    progress: &mut dyn ProgressSink,
    interrupt: &Interrupt,
) -> Result<()> {
    let mut entries = filelist::walk(copy_root)?;
    for (root, prefix) in tablespace_roots {
        for mut entry in filelist::walk(root)? {
            entry.path = prefix.join(&entry.path);
            entry.is_datafile = entry.file_type == FileType::Regular && filelist::is_datafile_path(&entry.path);
            entries.push(entry);
        }
    }
    copier::check_clock_skew(&entries, Utc::now())?;

    let prev_manifest = load_previous_manifest(config, base)?;

    let opts = CopyOptions {
        base_lsn: base.map(|b| b.start_lsn),
        checksums_enabled: config.checksums_enabled,
        compress: config.compress_data,
    };

    let mut manifest = Manifest::new();
    for entry in &entries {
        if interrupt.fired() {
            return Err(BackupError::Interrupted);
        }
        let prev_entry = prev_manifest.as_ref().and_then(|m| m.get(&entry.path));
        let me = copier::copy_entry(entry, database_dir, prev_entry, &opts, progress)?;
        backup.counters.read_bytes += entry.size;
        if !me.is_skipped() {
            backup.counters.write_bytes += me.write_size.max(0) as u64;
        }
        backup.counters.data_bytes += entry.size;
        manifest.push(me);
    }

    let manifest = manifest.finish()?;
    fs::write(
        database_dir.join("file_database.txt").as_std_path(),
        manifest.serialize(),
    )?;
    write_mkdirs_script(database_dir, &entries)?;
    Ok(())
}

fn load_previous_manifest(config: &RunConfig, base: Option<&Backup>) -> Result<Option<Manifest>> {
    load_previous_manifest_at(config, base, "database", "file_database.txt")
}

fn load_previous_manifest_at(
    config: &RunConfig,
    base: Option<&Backup>,
    subdir: &str,
    filename: &str,
) -> Result<Option<Manifest>> {
    let Some(base) = base else { return Ok(None) };
    let path = config
        .catalog_root
        .join("backup")
        .join(&base.id)
        .join(subdir)
        .join(filename);
    if !path.as_std_path().exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(path.as_std_path())?;
    Ok(Some(Manifest::parse(&text)?))
}

/// Enumerates the WAL segments covering `[start_lsn, stop_lsn]` under
/// `<pgdata>/pg_wal` and copies them into `arclog/`, the same way
/// `copy_data_phase` handles `database/`. `start_lsn` is the backup's own
/// (for `FULL`/`INCREMENTAL`) or the previous data backup's `stop_lsn` (for
/// `ARCHIVE`); either way it's the low end of what's new since last time.
#[allow(clippy::too_many_arguments)]
fn copy_archive_phase(
    config: &RunConfig,
    backup_dir: &Utf8PathBuf,
    base: Option<&Backup>,
    timeline: u32,
    start_lsn: Lsn,
    stop_lsn: Lsn,
    backup: &mut Backup,
) -> Result<()> {
    let arclog_dir = backup_dir.join("arclog");
    let wal_dir = config.pgdata.join(WAL_SUBDIR);
    let seg_sz = DEFAULT_WAL_SEGMENT_SIZE;

    let first_seg = if start_lsn.is_valid() {
        start_lsn.segment_number(seg_sz)
    } else {
        stop_lsn.segment_number(seg_sz)
    };
    let last_seg = stop_lsn.segment_number(seg_sz);

    let prev_manifest = load_previous_manifest_at(config, base, "arclog", "file_arclog.txt")?;
    let opts = CopyOptions {
        base_lsn: None,
        checksums_enabled: false,
        compress: config.compress_data,
    };

    let mut manifest = Manifest::new();
    let mut sink = NullProgress;
    for seg_no in first_seg..=last_seg {
        let name = xlog_file_name(timeline, Lsn(seg_no * seg_sz), seg_sz);
        let abs_path = wal_dir.join(&name);
        let entry = filelist::entry_for_path(&wal_dir, &abs_path)?;
        let prev_entry = prev_manifest.as_ref().and_then(|m| m.get(&entry.path));
        let me = copier::copy_entry(&entry, &arclog_dir, prev_entry, &opts, &mut sink)?;
        if !me.is_skipped() {
            backup.counters.read_arclog_bytes += entry.size;
        }
        manifest.push(me);
    }

    let manifest = manifest.finish()?;
    fs::write(arclog_dir.join("file_arclog.txt").as_std_path(), manifest.serialize())?;
    Ok(())
}

/// Walks the server log directory, if the cluster has one, and copies any
/// new or changed files into `srvlog/` the same way `copy_data_phase`
/// handles `database/`.
fn copy_srvlog_phase(
    config: &RunConfig,
    backup_dir: &Utf8PathBuf,
    base: Option<&Backup>,
    backup: &mut Backup,
) -> Result<()> {
    let srvlog_dir = backup_dir.join("srvlog");
    let log_root = config.pgdata.join(SERVER_LOG_SUBDIR);
    if !log_root.as_std_path().is_dir() {
        return write_manifest(&srvlog_dir, "file_srvlog.txt", &[]);
    }

    let entries = filelist::walk(&log_root)?;
    let prev_manifest = load_previous_manifest_at(config, base, "srvlog", "file_srvlog.txt")?;
    let opts = CopyOptions {
        base_lsn: None,
        checksums_enabled: false,
        compress: config.compress_data,
    };

    let mut manifest = Manifest::new();
    let mut sink = NullProgress;
    for entry in &entries {
        let prev_entry = prev_manifest.as_ref().and_then(|m| m.get(&entry.path));
        let me = copier::copy_entry(entry, &srvlog_dir, prev_entry, &opts, &mut sink)?;
        if !me.is_skipped() {
            backup.counters.read_srvlog_bytes += entry.size;
        }
        manifest.push(me);
    }

    let manifest = manifest.finish()?;
    fs::write(srvlog_dir.join("file_srvlog.txt").as_std_path(), manifest.serialize())?;
    Ok(())
}

/// Writes `mkdirs.sh`, a shell script that recreates every directory the
/// copy produced, so a restore can lay out empty directories without
/// needing entries for them in the file streams themselves.
fn write_mkdirs_script(database_dir: &Utf8PathBuf, entries: &[SourceEntry]) -> Result<()> {
    let mut script = String::from("#!/bin/sh\nset -e\n");
    for entry in entries {
        if entry.file_type == FileType::Directory {
            script.push_str(&format!("mkdir -p \"$1/{}\"\n", entry.path));
        }
    }
    let path = database_dir.join("mkdirs.sh");
    fs::write(path.as_std_path(), script)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path.as_std_path(), fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

fn write_manifest(root: &camino::Utf8Path, filename: &str, entries: &[ManifestEntry]) -> Result<()> {
    fs::create_dir_all(root.as_std_path())?;
    let mut manifest = Manifest::new();
    for e in entries {
        manifest.push(e.clone());
    }
    let manifest = manifest.finish()?;
    fs::write(root.join(filename).as_std_path(), manifest.serialize())?;
    Ok(())
}

/// A no-progress convenience entry point for callers that don't need
/// observability hooks.
pub fn run_silent(config: &RunConfig, interrupt: &Interrupt) -> Result<Backup> {
    let mut sink = NullProgress;
    run(config, interrupt, &mut sink)
}

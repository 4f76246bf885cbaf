//! Blocks until the WAL segment covering a backup's `stop_lsn` has been
//! durably archived, so the backup is self-contained for point-in-time
//! recovery without depending on a concurrent archiver catching up later.

use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8Path;
use tracing::{debug, info};

use crate::catalog::archive_status_dir;
use crate::error::{BackupError, Result};
use utils::signals::Interrupt;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const TIMEOUT: Duration = Duration::from_secs(10);

/// Polls `<pgdata>/pg_wal/archive_status/<segment>.done` (and, when a
/// standby archive root is given, its equivalent there too, since either
/// side may be the one running the archiver) until the marker appears or
/// `TIMEOUT` elapses.
pub fn wait_for_archive(pgdata_roots: &[&Utf8Path], segment: &str, interrupt: &Interrupt) -> Result<()> {
    wait_for_archive_with(pgdata_roots, segment, interrupt, TIMEOUT, POLL_INTERVAL)
}

fn wait_for_archive_with(
    pgdata_roots: &[&Utf8Path],
    segment: &str,
    interrupt: &Interrupt,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if interrupt.fired() {
            return Err(BackupError::Interrupted);
        }
        for root in pgdata_roots {
            let marker = archive_status_dir(root).join(format!("{segment}.done"));
            if marker.as_std_path().exists() {
                info!(segment, "WAL segment archived");
                return Ok(());
            }
        }
        if Instant::now() >= deadline {
            return Err(BackupError::ArchiveFailed {
                segment: segment.to_string(),
            });
        }
        debug!(segment, "still waiting for archive marker");
        thread::sleep(poll_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use std::fs;

    fn pgdata_with_marker(segment: &str) -> camino_tempfile::Utf8TempDir {
        let dir = camino_tempfile::tempdir().unwrap();
        let status_dir = archive_status_dir(dir.path());
        fs::create_dir_all(status_dir.as_std_path()).unwrap();
        fs::write(status_dir.join(format!("{segment}.done")).as_std_path(), b"").unwrap();
        dir
    }

    #[test]
    fn succeeds_immediately_when_marker_already_present() {
        let dir = pgdata_with_marker("000000010000000000000001");
        let interrupt = Interrupt::never();
        let root: &Utf8Path = dir.path();
        wait_for_archive(&[root], "000000010000000000000001", &interrupt).unwrap();
    }

    #[test]
    fn times_out_when_marker_never_appears() {
        let dir = camino_tempfile::tempdir().unwrap();
        fs::create_dir_all(archive_status_dir(dir.path()).as_std_path()).unwrap();
        let interrupt = Interrupt::never();
        let root: &Utf8Path = dir.path();
        let err = wait_for_archive_with(
            &[root],
            "000000010000000000000001",
            &interrupt,
            Duration::from_millis(30),
            Duration::from_millis(5),
        )
        .unwrap_err();
        assert!(matches!(err, BackupError::ArchiveFailed { .. }));
    }

    #[test]
    fn interrupt_short_circuits_the_wait() {
        let dir = camino_tempfile::tempdir().unwrap();
        fs::create_dir_all(archive_status_dir(dir.path()).as_std_path()).unwrap();
        let interrupt = Interrupt::never();
        interrupt.simulate();
        let root: &Utf8Path = dir.path();
        let err = wait_for_archive(&[root], "000000010000000000000001", &interrupt).unwrap_err();
        assert!(matches!(err, BackupError::Interrupted));
    }

    #[test]
    fn checks_second_root_for_standby_archive_status() {
        let primary = camino_tempfile::tempdir().unwrap();
        fs::create_dir_all(archive_status_dir(primary.path()).as_std_path()).unwrap();
        let standby = pgdata_with_marker("000000010000000000000002");
        let interrupt = Interrupt::never();
        let roots: Vec<&Utf8Path> = vec![primary.path(), standby.path()];
        wait_for_archive(&roots, "000000010000000000000002", &interrupt).unwrap();
        let _ = Utf8PathBuf::new();
    }
}

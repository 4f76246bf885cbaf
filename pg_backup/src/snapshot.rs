//! Drives an external storage-snapshot script through a fixed
//! freeze/split/unfreeze/mount/umount/resync lifecycle, registering a
//! compensating action before each step and running the whole stack in
//! reverse on any failure.

use std::collections::HashMap;
use std::process::{Command, Stdio};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::warn;

use crate::error::{BackupError, Result};

pub const PG_DATA: &str = "PG-DATA";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Freeze,
    Split,
    Unfreeze,
    Mount,
    Umount,
    Resync,
}

impl Stage {
    fn script_verb(self) -> &'static str {
        match self {
            Stage::Freeze => "freeze",
            Stage::Split => "split",
            Stage::Unfreeze => "unfreeze",
            Stage::Mount => "mount",
            Stage::Umount => "umount",
            Stage::Resync => "resync",
        }
    }
}

/// A LIFO stack of compensating actions. Each is popped and invoked (with
/// an extra `cleanup` argument to the script) in reverse order when the
/// driver unwinds; a cleanup-time failure is logged, not propagated, so one
/// bad compensation doesn't stop the rest from running.
#[derive(Default)]
struct CleanupStack {
    pending: Vec<Stage>,
}

impl CleanupStack {
    fn push(&mut self, stage: Stage) {
        self.pending.push(stage);
    }

    fn pop(&mut self, stage: Stage) {
        if self.pending.last() == Some(&stage) {
            self.pending.pop();
        }
    }

    fn unwind(&mut self, script: &Utf8Path) {
        while let Some(stage) = self.pending.pop() {
            if let Err(e) = run_script(script, &[stage.script_verb(), "cleanup"]) {
                warn!(stage = stage.script_verb(), error = %e, "snapshot cleanup action failed");
            }
        }
    }
}

pub struct SnapshotDriver<'a> {
    script: &'a Utf8Path,
    cleanup: CleanupStack,
}

/// One tablespace the snapshot produced, mapped to the mount path the
/// copier should read it from instead of its live location.
pub struct SnapshotMount {
    pub name: String,
    pub mount_path: Utf8PathBuf,
}

impl<'a> SnapshotDriver<'a> {
    pub fn new(script: &'a Utf8Path) -> SnapshotDriver<'a> {
        SnapshotDriver {
            script,
            cleanup: CleanupStack::default(),
        }
    }

    /// Runs freeze → split → unfreeze → mount, returning the mount mapping.
    /// On any failure the cleanup stack accumulated so far is unwound
    /// before the error is returned.
    pub fn prepare(&mut self, known_tablespaces: &[(String, u32)]) -> Result<Vec<SnapshotMount>> {
        match self.prepare_inner(known_tablespaces) {
            Ok(mounts) => Ok(mounts),
            Err(e) => {
                self.cleanup.unwind(self.script);
                Err(e)
            }
        }
    }

    fn prepare_inner(&mut self, known_tablespaces: &[(String, u32)]) -> Result<Vec<SnapshotMount>> {
        self.cleanup.push(Stage::Unfreeze);
        run_script(self.script, &["freeze"])?;

        self.cleanup.push(Stage::Resync);
        let split_names = run_script_lines(self.script, &["split"])?;
        reconcile_tablespaces(&split_names, known_tablespaces)?;

        run_script(self.script, &["unfreeze"])?;
        self.cleanup.pop(Stage::Unfreeze);

        self.cleanup.push(Stage::Umount);
        let mount_lines = run_script_lines(self.script, &["mount"])?;
        let mounts = mount_lines
            .iter()
            .map(|line| parse_name_value(line).map(|(name, path)| SnapshotMount {
                name,
                mount_path: Utf8PathBuf::from(path),
            }))
            .collect::<Result<Vec<_>>>()?;

        Ok(mounts)
    }

    /// Runs umount → resync and clears the cleanup stack. Called once the
    /// copier is done reading from the mounted snapshot.
    pub fn finish(&mut self) -> Result<()> {
        let result = (|| {
            run_script(self.script, &["umount"])?;
            self.cleanup.pop(Stage::Umount);
            run_script(self.script, &["resync"])?;
            self.cleanup.pop(Stage::Resync);
            Ok(())
        })();
        if result.is_err() {
            self.cleanup.unwind(self.script);
        }
        result
    }

    /// Unwinds whatever is still pending (used on a failure path after
    /// `prepare` succeeded but the copy itself failed).
    pub fn abort(&mut self) {
        self.cleanup.unwind(self.script);
    }
}

/// Tablespaces the script didn't produce are left for a normal live copy;
/// tablespaces the script produced but the server doesn't know about are
/// fatal, per the snapshot/catalog reconciliation rule.
fn reconcile_tablespaces(split_names: &[String], known_tablespaces: &[(String, u32)]) -> Result<()> {
    let known: HashMap<&str, u32> = known_tablespaces.iter().map(|(n, o)| (n.as_str(), *o)).collect();
    for name in split_names {
        if name == PG_DATA {
            continue;
        }
        if !known.contains_key(name.as_str()) {
            return Err(BackupError::pg_command(format!(
                "snapshot script produced unknown tablespace {name:?}"
            )));
        }
    }
    Ok(())
}

fn parse_name_value(line: &str) -> Result<(String, String)> {
    line.split_once('=')
        .map(|(n, v)| (n.to_string(), v.to_string()))
        .ok_or_else(|| BackupError::pg_command(format!("malformed snapshot script output line: {line:?}")))
}

/// Invokes `script` with `args`, requiring its last stdout line to be
/// exactly `SUCCESS`; returns the lines before it.
fn run_script_lines(script: &Utf8Path, args: &[&str]) -> Result<Vec<String>> {
    let output = Command::new(script.as_std_path())
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(BackupError::System)?;

    if !output.status.success() {
        return Err(BackupError::pg_command(format!(
            "snapshot script {:?} {:?} exited with {}",
            script, args, output.status
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut lines: Vec<String> = stdout.lines().map(str::to_string).collect();
    match lines.pop() {
        Some(last) if last == "SUCCESS" => Ok(lines),
        Some(other) => Err(BackupError::pg_command(format!(
            "snapshot script {:?} {:?} did not end with SUCCESS (got {other:?})",
            script, args
        ))),
        None => Err(BackupError::pg_command(format!(
            "snapshot script {:?} {:?} produced no output",
            script, args
        ))),
    }
}

fn run_script(script: &Utf8Path, args: &[&str]) -> Result<()> {
    run_script_lines(script, args).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn write_fake_script(dir: &Utf8Path, body: &str) -> Utf8PathBuf {
        let path = dir.join("snapshot_script");
        fs::write(path.as_std_path(), format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perm = fs::metadata(path.as_std_path()).unwrap().permissions();
        perm.set_mode(0o755);
        fs::set_permissions(path.as_std_path(), perm).unwrap();
        path
    }

    #[test]
    fn successful_lifecycle_leaves_cleanup_stack_empty() {
        let dir = camino_tempfile::tempdir().unwrap();
        let script = write_fake_script(
            dir.path(),
            r#"
case "$1" in
  freeze) echo SUCCESS ;;
  split) echo "PG-DATA"; echo SUCCESS ;;
  unfreeze) echo SUCCESS ;;
  mount) echo "PG-DATA=/snap/pgdata"; echo SUCCESS ;;
  umount) echo SUCCESS ;;
  resync) echo SUCCESS ;;
esac
"#,
        );
        let mut driver = SnapshotDriver::new(&script);
        let mounts = driver.prepare(&[]).unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].name, "PG-DATA");
        assert_eq!(mounts[0].mount_path, Utf8PathBuf::from("/snap/pgdata"));
        driver.finish().unwrap();
        assert!(driver.cleanup.pending.is_empty());
    }

    #[test]
    fn failure_mid_lifecycle_unwinds_cleanup_in_reverse() {
        let dir = camino_tempfile::tempdir().unwrap();
        let script = write_fake_script(
            dir.path(),
            r#"
if [ "$2" = "cleanup" ]; then echo SUCCESS; exit 0; fi
case "$1" in
  freeze) echo SUCCESS ;;
  split) echo "PG-DATA"; echo SUCCESS ;;
  unfreeze) echo FAILED ;;
  *) echo SUCCESS ;;
esac
"#,
        );
        let mut driver = SnapshotDriver::new(&script);
        let err = driver.prepare(&[]).unwrap_err();
        assert!(matches!(err, BackupError::PgCommand(_)));
        assert!(driver.cleanup.pending.is_empty());
    }

    #[test]
    fn unknown_tablespace_from_script_is_fatal() {
        let dir = camino_tempfile::tempdir().unwrap();
        let script = write_fake_script(
            dir.path(),
            r#"
case "$1" in
  freeze) echo SUCCESS ;;
  split) echo "PG-DATA"; echo "mystery_ts"; echo SUCCESS ;;
  *) echo SUCCESS ;;
esac
"#,
        );
        let mut driver = SnapshotDriver::new(&script);
        let err = driver.prepare(&[]).unwrap_err();
        assert!(matches!(err, BackupError::PgCommand(_)));
    }
}

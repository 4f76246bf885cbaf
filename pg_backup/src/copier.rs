//! Copies one enumerated source entry into the backup's `database/` (or
//! `arclog/`/`srvlog/`) tree, producing the manifest entry that describes
//! what happened. Data files are dispatched to the page codec; everything
//! else streams through a plain byte-for-byte copy.

use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::thread;
use std::time::Duration;

use camino::Utf8Path;
use chrono::{DateTime, Utc};

use crate::error::{BackupError, Result};
use crate::filelist::SourceEntry;
use crate::io_util::copy_with_crc;
use crate::manifest::{FileType, ManifestEntry, WRITE_SIZE_SKIPPED};
use crate::page_codec::{copy_datafile, PageCodecOptions};
use crate::progress::ProgressSink;
use utils::lsn::Lsn;

/// Directory permissions used for every directory created in a backup.
const BACKUP_DIR_MODE: u32 = 0o700;

pub struct CopyOptions {
    pub base_lsn: Option<Lsn>,
    pub checksums_enabled: bool,
    pub compress: bool,
}

/// Fails the backup if any source entry's mtime is in the future relative to
/// `now`: an mtime-skip-based incremental could otherwise silently miss a
/// later write that lands in the same rewound second.
pub fn check_clock_skew(entries: &[SourceEntry], now: DateTime<Utc>) -> Result<()> {
    if let Some(bad) = entries.iter().find(|e| e.mtime > now) {
        return Err(BackupError::args(format!(
            "source file {} has mtime {} in the future (current time {}); server clock may have been rewound",
            bad.path, bad.mtime, now
        )));
    }
    Ok(())
}

/// If `mtime` falls in the current wall-clock second, blocks until that
/// second has fully elapsed, so a write landing in the remainder of this
/// second is never missed by the next incremental's mtime comparison.
fn wait_past_mtime(mtime: DateTime<Utc>) {
    loop {
        let now = Utc::now();
        if now.timestamp() > mtime.timestamp() {
            return;
        }
        let remaining = 1_000_000_000i64.saturating_sub(now.timestamp_subsec_nanos() as i64);
        thread::sleep(Duration::from_nanos(remaining.max(1_000_000) as u64));
    }
}

/// Copies `entry` under `dest_root`, consulting `prev_entry` (the same
/// logical path in the previous backup's manifest, if any) for the mtime
/// skip rule. Returns the manifest entry describing the result.
pub fn copy_entry(
    entry: &SourceEntry,
    dest_root: &Utf8Path,
    prev_entry: Option<&ManifestEntry>,
    opts: &CopyOptions,
    progress: &mut dyn ProgressSink,
) -> Result<ManifestEntry> {
    let dest_path = dest_root.join(&entry.path);

    match entry.file_type {
        FileType::Directory => {
            fs::create_dir_all(&dest_path)?;
            fs::set_permissions(&dest_path, fs::Permissions::from_mode(BACKUP_DIR_MODE))?;
            Ok(ManifestEntry {
                path: entry.path.clone(),
                file_type: FileType::Directory,
                mode: BACKUP_DIR_MODE,
                mtime: entry.mtime,
                size: 0,
                write_size: 0,
                crc32: 0,
                is_datafile: false,
                link_target: None,
            })
        }
        FileType::Symlink => {
            let target = entry
                .link_target
                .clone()
                .expect("symlink entries always carry a link target");
            Ok(ManifestEntry {
                path: entry.path.clone(),
                file_type: FileType::Symlink,
                mode: entry.mode,
                mtime: entry.mtime,
                size: entry.size,
                write_size: 0,
                crc32: crc32c::crc32c(target.as_str().as_bytes()),
                is_datafile: false,
                link_target: Some(target),
            })
        }
        FileType::Regular => {
            progress.on_file_started(&entry.path);

            if !entry.is_datafile {
                if let Some(prev) = prev_entry {
                    if prev.mtime == entry.mtime {
                        progress.on_file_finished(&entry.path, WRITE_SIZE_SKIPPED);
                        return Ok(ManifestEntry {
                            path: entry.path.clone(),
                            file_type: FileType::Regular,
                            mode: entry.mode,
                            mtime: entry.mtime,
                            size: entry.size,
                            write_size: WRITE_SIZE_SKIPPED,
                            crc32: prev.crc32,
                            is_datafile: false,
                            link_target: None,
                        });
                    }
                }
            }

            wait_past_mtime(entry.mtime);

            if let Some(parent) = dest_path.parent() {
                fs::create_dir_all(parent)?;
            }

            let entry_out = if entry.is_datafile {
                let mut out = File::create(&dest_path)?;
                let codec_opts = PageCodecOptions {
                    base_lsn: opts.base_lsn,
                    prev_entry_missing: prev_entry.is_none(),
                    checksums_enabled: opts.checksums_enabled,
                    compress: opts.compress,
                };
                let outcome = copy_datafile(&entry.abs_path, &mut out, &codec_opts)?;
                out.sync_all()?;
                progress.on_bytes(outcome.read_bytes);
                ManifestEntry {
                    path: entry.path.clone(),
                    file_type: FileType::Regular,
                    mode: entry.mode,
                    mtime: entry.mtime,
                    size: entry.size,
                    write_size: outcome.write_size,
                    crc32: outcome.crc32,
                    is_datafile: true,
                    link_target: None,
                }
            } else {
                let mut src = File::open(&entry.abs_path)?;
                let mut out = File::create(&dest_path)?;
                let (n, crc) = if opts.compress {
                    let mut enc = flate2::write::GzEncoder::new(&mut out, flate2::Compression::default());
                    let result = copy_with_crc(&mut src, &mut enc)?;
                    enc.finish()?;
                    result
                } else {
                    copy_with_crc(&mut src, &mut out)?
                };
                out.sync_all()?;
                progress.on_bytes(n);
                ManifestEntry {
                    path: entry.path.clone(),
                    file_type: FileType::Regular,
                    mode: entry.mode,
                    mtime: entry.mtime,
                    size: entry.size,
                    write_size: fs::metadata(&dest_path)?.len() as i64,
                    crc32: crc,
                    is_datafile: false,
                    link_target: None,
                }
            };

            fs::set_permissions(&dest_path, fs::Permissions::from_mode(entry.mode))?;
            progress.on_file_finished(&entry.path, entry_out.write_size);
            Ok(entry_out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::test_support::RecordingProgress;
    use crate::progress::NullProgress;

    fn entry(path: &str, abs: &Utf8Path, mtime: DateTime<Utc>, is_datafile: bool) -> SourceEntry {
        SourceEntry {
            path: path.into(),
            abs_path: abs.to_path_buf(),
            file_type: FileType::Regular,
            mode: 0o600,
            mtime,
            size: 4,
            link_target: None,
            is_datafile,
        }
    }

    #[test]
    fn copies_plain_file_and_computes_crc() {
        let dir = camino_tempfile::tempdir().unwrap();
        let src = dir.path().join("PG_VERSION");
        fs::write(src.as_std_path(), b"16\n").unwrap();
        let dest = dir.path().join("out");
        fs::create_dir(dest.as_std_path()).unwrap();

        let e = entry("PG_VERSION", &src, Utc::now(), false);
        let opts = CopyOptions {
            base_lsn: None,
            checksums_enabled: true,
            compress: false,
        };
        let mut sink = NullProgress;
        let me = copy_entry(&e, &dest, None, &opts, &mut sink).unwrap();
        assert_eq!(me.write_size, 3);
        assert_eq!(me.crc32, crc32c::crc32c(b"16\n"));
    }

    #[test]
    fn skips_non_datafile_when_mtime_matches_previous_manifest() {
        let dir = camino_tempfile::tempdir().unwrap();
        let src = dir.path().join("PG_VERSION");
        fs::write(src.as_std_path(), b"16\n").unwrap();
        let dest = dir.path().join("out");
        fs::create_dir(dest.as_std_path()).unwrap();

        let mtime = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let e = entry("PG_VERSION", &src, mtime, false);
        let prev = ManifestEntry {
            path: "PG_VERSION".into(),
            file_type: FileType::Regular,
            mode: 0o600,
            mtime,
            size: 3,
            write_size: 3,
            crc32: 0x1234,
            is_datafile: false,
            link_target: None,
        };
        let opts = CopyOptions {
            base_lsn: None,
            checksums_enabled: true,
            compress: false,
        };
        let mut sink = NullProgress;
        let me = copy_entry(&e, &dest, Some(&prev), &opts, &mut sink).unwrap();
        assert!(me.is_skipped());
        assert_eq!(me.crc32, 0x1234);
    }

    #[test]
    fn clock_skew_guard_rejects_future_mtime() {
        let now = Utc::now();
        let future = now + chrono::Duration::days(1);
        let e = entry("PG_VERSION", Utf8Path::new("/x"), future, false);
        assert!(check_clock_skew(&[e], now).is_err());
    }

    #[test]
    fn progress_sink_sees_one_started_and_finished_pair_per_file_in_order() {
        let dir = camino_tempfile::tempdir().unwrap();
        let dest = dir.path().join("out");
        fs::create_dir(dest.as_std_path()).unwrap();

        let src_a = dir.path().join("a");
        let src_b = dir.path().join("b");
        fs::write(src_a.as_std_path(), b"aaaa").unwrap();
        fs::write(src_b.as_std_path(), b"bb").unwrap();

        let opts = CopyOptions {
            base_lsn: None,
            checksums_enabled: true,
            compress: false,
        };
        let mut sink = RecordingProgress::default();
        let ea = entry("a", &src_a, Utc::now(), false);
        let eb = entry("b", &src_b, Utc::now(), false);
        copy_entry(&ea, &dest, None, &opts, &mut sink).unwrap();
        copy_entry(&eb, &dest, None, &opts, &mut sink).unwrap();

        assert_eq!(sink.started, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(sink.finished.len(), 2);
        assert_eq!(sink.finished[0].0, "a");
        assert_eq!(sink.finished[0].1, 4);
        assert_eq!(sink.finished[1].0, "b");
        assert_eq!(sink.finished[1].1, 2);
        assert_eq!(sink.bytes, 6);
    }
}

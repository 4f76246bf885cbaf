//! File manifests: one line per path copied into a backup root
//! (`database/`, `arclog/` or `srvlog/`), plus the serialized `file_*.txt`
//! format that makes a manifest a durable, re-readable record of what a
//! backup contains.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{BackupError, Result};

/// `write_size` sentinel meaning "unchanged since the incremental base;
/// reuse the block data from the backup chain instead of this file".
pub const WRITE_SIZE_SKIPPED: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileType::Regular => "f",
            FileType::Directory => "d",
            FileType::Symlink => "l",
        };
        write!(f, "{s}")
    }
}

impl FromStr for FileType {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "f" => Ok(FileType::Regular),
            "d" => Ok(FileType::Directory),
            "l" => Ok(FileType::Symlink),
            other => Err(BackupError::pg_command(format!(
                "unknown manifest file type {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Path relative to the manifest's root (PGDATA, arclog, or srvlog).
    pub path: Utf8PathBuf,
    pub file_type: FileType,
    pub mode: u32,
    pub mtime: DateTime<Utc>,
    pub size: u64,
    /// Bytes actually written into the backup, or [`WRITE_SIZE_SKIPPED`].
    pub write_size: i64,
    pub crc32: u32,
    pub is_datafile: bool,
    pub link_target: Option<Utf8PathBuf>,
}

impl ManifestEntry {
    pub fn is_skipped(&self) -> bool {
        self.write_size == WRITE_SIZE_SKIPPED
    }

    fn to_line(&self) -> String {
        let mtime = self.mtime.to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut line = format!(
            "{}\t{}\t{:o}\t{}\t{}\t{}\t{:08x}",
            self.path, self.file_type, self.mode, mtime, self.size, self.write_size, self.crc32
        );
        if let Some(target) = &self.link_target {
            line.push('\t');
            line.push_str(target.as_str());
        }
        line
    }

    fn parse_line(line: &str) -> Result<ManifestEntry> {
        let mut fields = line.split('\t');
        let bad = || BackupError::pg_command(format!("malformed manifest line: {line:?}"));

        let path = Utf8PathBuf::from(fields.next().ok_or_else(bad)?);
        let file_type: FileType = fields.next().ok_or_else(bad)?.parse()?;
        let mode = u32::from_str_radix(fields.next().ok_or_else(bad)?, 8).map_err(|_| bad())?;
        let mtime = DateTime::parse_from_rfc3339(fields.next().ok_or_else(bad)?)
            .map_err(|_| bad())?
            .with_timezone(&Utc);
        let size: u64 = fields.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let write_size: i64 = fields.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let crc32 = u32::from_str_radix(fields.next().ok_or_else(bad)?, 16).map_err(|_| bad())?;
        let link_target = fields.next().map(Utf8PathBuf::from);

        if file_type == FileType::Symlink && link_target.is_none() {
            return Err(BackupError::pg_command(format!(
                "symlink entry missing link target: {line:?}"
            )));
        }

        Ok(ManifestEntry {
            path,
            file_type,
            mode,
            mtime,
            size,
            write_size,
            crc32,
            is_datafile: false,
            link_target,
        })
    }
}

/// A sorted, path-unique collection of [`ManifestEntry`], matching the
/// on-disk `file_*.txt` files.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new() -> Manifest {
        Manifest {
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, entry: ManifestEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.iter()
    }

    pub fn get(&self, path: &Utf8Path) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    /// Sorts by path and checks the uniqueness invariant.
    pub fn finish(mut self) -> Result<Manifest> {
        self.entries.sort_by(|a, b| a.path.cmp(&b.path));
        let mut seen = HashSet::new();
        for e in &self.entries {
            if !seen.insert(&e.path) {
                return Err(BackupError::pg_command(format!(
                    "duplicate manifest path: {}",
                    e.path
                )));
            }
        }
        Ok(self)
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&entry.to_line());
            out.push('\n');
        }
        out
    }

    pub fn parse(text: &str) -> Result<Manifest> {
        let mut entries = Vec::new();
        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            entries.push(ManifestEntry::parse_line(line)?);
        }
        // parsed manifests are assumed already sorted/deduped by `finish`
        // at write time, but re-check on read: a hand-edited or corrupt
        // file shouldn't silently pass as a valid chain base.
        for pair in entries.windows(2) {
            if pair[0].path.cmp(&pair[1].path) != Ordering::Less {
                return Err(BackupError::pg_command(
                    "manifest entries are not strictly ordered by path".to_string(),
                ));
            }
        }
        Ok(Manifest { entries })
    }

    pub fn total_write_bytes(&self) -> u64 {
        self.entries
            .iter()
            .filter(|e| !e.is_skipped())
            .map(|e| e.write_size.max(0) as u64)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(path: &str, write_size: i64) -> ManifestEntry {
        ManifestEntry {
            path: Utf8PathBuf::from(path),
            file_type: FileType::Regular,
            mode: 0o600,
            mtime: DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            size: 8192,
            write_size,
            crc32: 0xdead_beef,
            is_datafile: true,
            link_target: None,
        }
    }

    #[test]
    fn round_trips_through_serialize_and_parse() {
        let mut m = Manifest::new();
        m.push(sample_entry("base/1/16384", 8192));
        m.push(sample_entry("base/1/16385", WRITE_SIZE_SKIPPED));
        let m = m.finish().unwrap();

        let text = m.serialize();
        let parsed = Manifest::parse(&text).unwrap();

        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.get(Utf8Path::new("base/1/16384")).unwrap().size, 8192);
        assert!(parsed
            .get(Utf8Path::new("base/1/16385"))
            .unwrap()
            .is_skipped());
    }

    #[test]
    fn symlink_round_trips_its_target() {
        let mut entry = sample_entry("pg_tblspc/16400", 0);
        entry.file_type = FileType::Symlink;
        entry.link_target = Some(Utf8PathBuf::from("/mnt/ts1"));
        let mut m = Manifest::new();
        m.push(entry);
        let m = m.finish().unwrap();

        let parsed = Manifest::parse(&m.serialize()).unwrap();
        let e = parsed.get(Utf8Path::new("pg_tblspc/16400")).unwrap();
        assert_eq!(e.link_target.as_deref(), Some(Utf8Path::new("/mnt/ts1")));
    }

    #[test]
    fn rejects_duplicate_paths() {
        let mut m = Manifest::new();
        m.push(sample_entry("base/1/1", 1));
        m.push(sample_entry("base/1/1", 2));
        assert!(m.finish().is_err());
    }

    #[test]
    fn entries_serialize_sorted_by_path() {
        let mut m = Manifest::new();
        m.push(sample_entry("base/1/2", 1));
        m.push(sample_entry("base/1/1", 1));
        let m = m.finish().unwrap();
        let lines: Vec<_> = m.serialize().lines().map(String::from).collect();
        assert!(lines[0].starts_with("base/1/1\t"));
        assert!(lines[1].starts_with("base/1/2\t"));
    }
}

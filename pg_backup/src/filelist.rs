//! Enumerates a directory tree (PGDATA, or a snapshot mount standing in for
//! it) into [`SourceEntry`] records ready to be copied and turned into
//! manifest entries. A separate pass, not fused with the copy loop, so the
//! copier can consult the full list up front (clock-skew guard) before
//! touching any file.

use std::os::unix::fs::MetadataExt;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use crate::error::{BackupError, Result};
use crate::manifest::FileType;

#[derive(Debug, Clone)]
pub struct SourceEntry {
    /// Path relative to the root that was walked.
    pub path: Utf8PathBuf,
    /// Absolute path to read from (the root plus `path`).
    pub abs_path: Utf8PathBuf,
    pub file_type: FileType,
    pub mode: u32,
    pub mtime: DateTime<Utc>,
    pub size: u64,
    pub link_target: Option<Utf8PathBuf>,
    pub is_datafile: bool,
}

/// Walks `root`, yielding one entry per directory, regular file and symlink
/// found beneath it (the root itself is not included). Symlinks are never
/// followed; their target is recorded but not descended into.
pub fn walk(root: &Utf8Path) -> Result<Vec<SourceEntry>> {
    let mut entries = Vec::new();

    for dirent in WalkDir::new(root.as_std_path())
        .follow_links(false)
        .min_depth(1)
        .into_iter()
    {
        let dirent = dirent.map_err(|e| {
            BackupError::System(e.into_io_error().unwrap_or_else(|| {
                std::io::Error::other("directory walk failed")
            }))
        })?;
        let abs_path = Utf8PathBuf::try_from(dirent.path().to_path_buf())
            .map_err(|e| BackupError::args(format!("non-UTF-8 path: {e}")))?;
        entries.push(entry_for_path(root, &abs_path)?);
    }

    Ok(entries)
}

/// Builds a single [`SourceEntry`] for one file already known to exist at
/// `abs_path`, relative to `root`. Used by enumerations that don't need a
/// recursive walk: a fixed list of archived WAL segments, or a server-log
/// directory that's flat in practice.
pub fn entry_for_path(root: &Utf8Path, abs_path: &Utf8Path) -> Result<SourceEntry> {
    let rel = abs_path
        .strip_prefix(root)
        .map_err(|_| BackupError::args(format!("{abs_path} is not under {root}")))?
        .to_path_buf();

    let metadata = abs_path.as_std_path().symlink_metadata()?;
    let file_type = if metadata.is_dir() {
        FileType::Directory
    } else if metadata.file_type().is_symlink() {
        FileType::Symlink
    } else {
        FileType::Regular
    };

    let link_target = if file_type == FileType::Symlink {
        Some(
            Utf8PathBuf::try_from(std::fs::read_link(abs_path.as_std_path())?)
                .map_err(|e| BackupError::args(format!("non-UTF-8 symlink target: {e}")))?,
        )
    } else {
        None
    };

    let mtime: DateTime<Utc> = metadata.modified()?.into();
    let is_datafile = file_type == FileType::Regular && is_datafile_path(&rel);

    Ok(SourceEntry {
        path: rel,
        abs_path: abs_path.to_path_buf(),
        file_type,
        mode: metadata.mode() & 0o7777,
        mtime,
        size: metadata.len(),
        link_target,
        is_datafile,
    })
}

/// A relation segment: a regular file whose name begins with a digit, found
/// under `base/`, `global/`, or `pg_tblspc/`.
pub fn is_datafile_path(rel: &Utf8Path) -> bool {
    let starts_with_digit = rel
        .file_name()
        .and_then(|n| n.chars().next())
        .map(|c| c.is_ascii_digit())
        .unwrap_or(false);
    if !starts_with_digit {
        return false;
    }
    matches!(
        rel.components().next().map(|c| c.as_str()),
        Some("base") | Some("global") | Some("pg_tblspc")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn recognizes_datafiles_by_name_and_location() {
        assert!(is_datafile_path(Utf8Path::new("base/16384/16385")));
        assert!(is_datafile_path(Utf8Path::new("global/1262")));
        assert!(!is_datafile_path(Utf8Path::new("base/16384/PG_VERSION")));
        assert!(!is_datafile_path(Utf8Path::new("pg_wal/000000010000000000000001")));
    }

    #[test]
    fn walk_finds_files_dirs_and_symlinks() {
        let dir = camino_tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir(root.join("base")).unwrap();
        fs::write(root.join("base/1"), b"hi").unwrap();
        fs::write(root.join("PG_VERSION"), b"16\n").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("/mnt/ts1", root.join("link1")).unwrap();

        let entries = walk(root).unwrap();
        let by_path = |p: &str| entries.iter().find(|e| e.path == Utf8Path::new(p));

        assert_eq!(by_path("base").unwrap().file_type, FileType::Directory);
        assert!(by_path("base/1").unwrap().is_datafile);
        assert!(!by_path("PG_VERSION").unwrap().is_datafile);
        let link = by_path("link1").unwrap();
        assert_eq!(link.file_type, FileType::Symlink);
        assert_eq!(link.link_target.as_deref(), Some(Utf8Path::new("/mnt/ts1")));
    }

    #[test]
    fn entry_for_path_builds_the_same_entry_a_walk_would() {
        let dir = camino_tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir(root.join("pg_wal")).unwrap();
        fs::write(root.join("pg_wal/000000010000000000000001"), b"wal").unwrap();

        let walked = walk(&root.join("pg_wal")).unwrap();
        let direct = entry_for_path(
            &root.join("pg_wal"),
            &root.join("pg_wal/000000010000000000000001"),
        )
        .unwrap();

        let from_walk = walked
            .iter()
            .find(|e| e.path == Utf8Path::new("000000010000000000000001"))
            .unwrap();
        assert_eq!(direct.size, from_walk.size);
        assert!(!direct.is_datafile);
    }
}

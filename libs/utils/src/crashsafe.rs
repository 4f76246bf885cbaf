//! Durable file writes: write to a temporary file in the target directory,
//! fsync it, rename over the destination, then fsync the directory entry.
//! Used for anything the engine must be able to trust after a crash mid-write
//! (backup metadata, manifests).

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

/// Atomically replace `path`'s contents with `data`.
pub fn overwrite(path: &Path, data: &[u8]) -> io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory")
    })?;
    let tmp_path = path.with_extension(format!(
        "tmp.{}",
        std::process::id().wrapping_add(rand_suffix())
    ));

    let mut tmp_file = File::create(&tmp_path)?;
    tmp_file.write_all(data)?;
    tmp_file.sync_all()?;
    drop(tmp_file);

    fs::rename(&tmp_path, path)?;
    fsync_dir(parent)?;
    Ok(())
}

/// fsync a directory so a preceding rename/create within it is durable.
pub fn fsync_dir(dir: &Path) -> io::Result<()> {
    let dir_file = File::open(dir)?;
    dir_file.sync_all()
}

/// Create `dir` (and parents) if missing, then fsync the parent so the new
/// directory entry survives a crash.
pub fn ensure_dir(dir: &Path) -> io::Result<()> {
    match fs::create_dir_all(dir) {
        Ok(()) => {
            if let Some(parent) = dir.parent() {
                fsync_dir(parent)?;
            }
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

fn rand_suffix() -> u32 {
    use rand::Rng;
    rand::thread_rng().gen()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrite_replaces_contents_durably() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata").into_std_path_buf();

        overwrite(&path, b"first").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"first");

        overwrite(&path, b"second, longer than first").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second, longer than first");

        // no stray temp files left behind
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn ensure_dir_is_idempotent() {
        let dir = camino_tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c").into_std_path_buf();
        ensure_dir(&nested).unwrap();
        ensure_dir(&nested).unwrap();
        assert!(nested.is_dir());
    }
}

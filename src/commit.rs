// src/commit.rs

//! Atomic replacement of on-disk repository artifacts
//!
//! Committed files are only ever replaced by rename. New content is written
//! to a temporary file in the destination directory, synced, and renamed over
//! the target, so observers see either the old or the new file in full.
//!
//! If source and destination live on different filesystems, the rename fails
//! with `EXDEV` and the move degrades to copy + fsync + remove. That fallback
//! has a narrow window where the destination is partially written.

use crate::error::{Error, Result};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Move a file, falling back to copy + fsync + delete across filesystems
pub fn move_file_atomic(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            debug!(
                "Cross-filesystem move detected ({} -> {}), using copy fallback",
                src.display(),
                dst.display()
            );

            fs::copy(src, dst)?;

            let file = File::open(dst)?;
            file.sync_all()?;
            drop(file);

            if let Some(parent) = dst.parent()
                && let Ok(dir) = File::open(parent)
            {
                // Not all filesystems support fsync on directories
                let _ = dir.sync_all();
            }

            fs::remove_file(src)?;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Replace `final_path` with the content of `tmp_path`
///
/// When `tmp_path` is in another directory, its content is first staged into
/// a temporary file beside `final_path` so the last step is a same-directory
/// rename. `tmp_path` no longer exists afterwards.
pub fn atomic_replace(tmp_path: &Path, final_path: &Path) -> Result<()> {
    let dest_dir = parent_dir(final_path);
    fs::create_dir_all(dest_dir)?;

    if parent_dir(tmp_path) == dest_dir {
        move_file_atomic(tmp_path, final_path).map_err(|e| {
            Error::IoError(format!(
                "Failed to commit {} -> {}: {}",
                tmp_path.display(),
                final_path.display(),
                e
            ))
        })?;
        return Ok(());
    }

    let mut staged = NamedTempFile::new_in(dest_dir)?;
    {
        let mut src = File::open(tmp_path).map_err(|e| {
            Error::IoError(format!("Failed to open {}: {}", tmp_path.display(), e))
        })?;
        io::copy(&mut src, staged.as_file_mut())?;
        staged.as_file().sync_all()?;
    }

    staged.persist(final_path).map_err(|e| {
        Error::IoError(format!(
            "Failed to commit {}: {}",
            final_path.display(),
            e.error
        ))
    })?;

    fs::remove_file(tmp_path)?;
    debug!("Committed {}", final_path.display());
    Ok(())
}

/// Atomically write `data` to `path`
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = parent_dir(path);
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| {
        Error::IoError(format!("Failed to write {}: {}", path.display(), e.error))
    })?;
    Ok(())
}

/// Remove files, ignoring ones that do not exist; returns what was removed
pub fn purge<I, P>(paths: I) -> Vec<PathBuf>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let mut removed = Vec::new();
    for path in paths {
        let path = path.as_ref();
        match fs::remove_file(path) {
            Ok(()) => {
                debug!("Purged {}", path.display());
                removed.push(path.to_path_buf());
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => debug!("Could not purge {}: {}", path.display(), e),
        }
    }
    removed
}

//! Filesystem helpers for files shared with other processes
//!
//! The port record and lock markers are read by other processes while the bridge server writes
//! them, so writes always go to a sibling temp file that is then renamed over the target.

use std::io;
use std::path::{Path, PathBuf};

/// Cross-platform rename that replaces the target if it exists.
///
/// On Unix, `fs::rename` atomically replaces the target.
/// On Windows, `fs::rename` fails if the target exists, so the target is deleted first.
pub fn atomic_rename(src: &Path, dst: &Path) -> io::Result<()> {
    #[cfg(windows)]
    {
        if dst.exists() {
            std::fs::remove_file(dst)?;
        }
    }
    std::fs::rename(src, dst)
}

/// Writes `contents` to `path` so readers see either the old or the new file, never a partial one
///
/// Parent directories are created as needed.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let temp_path = temp_sibling(path);
    if let Err(e) = std::fs::write(&temp_path, contents) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e);
    }

    if let Err(e) = atomic_rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e);
    }
    Ok(())
}

/// Removes a file, treating a missing file as success
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Temp file name next to `path`, unique per process so concurrent writers never share one
fn temp_sibling(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", file_name, std::process::id()))
}

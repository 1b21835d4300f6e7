//! Sibling temp files, single-generation backups and atomic writes.
//!
//! Temp files always live in the target's own directory so the final rename
//! never crosses a filesystem boundary.

use std::ffi::OsString;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// `<target>.bak`
pub fn backup_path(target: &Path) -> PathBuf {
    append_to_file_name(target, ".bak")
}

/// Copy `target` to `<target>.bak`, replacing any previous backup.
pub fn create_backup(target: &Path) -> io::Result<PathBuf> {
    let backup = backup_path(target);
    fs::copy(target, &backup)?;
    Ok(backup)
}

/// Write `content` to a fresh `<target>.tmp.<unique-id>.tmp` next to
/// `target`, fsync it, and leave it on disk. Returns the temp path.
pub fn write_sibling_temp(target: &Path, content: &[u8]) -> io::Result<PathBuf> {
    let parent = parent_dir(target)?;
    let prefix = append_to_file_name(
        Path::new(target.file_name().unwrap_or_default()),
        ".tmp.",
    );

    let mut temp = tempfile::Builder::new()
        .prefix(prefix.as_os_str())
        .suffix(".tmp")
        .tempfile_in(parent)?;

    temp.write_all(content)?;
    temp.as_file().sync_all()?;

    // Detach from the guard; the caller owns cleanup from here on.
    let (_file, path) = temp.keep().map_err(|e| e.error)?;
    Ok(path)
}

/// Atomic file write: tempfile + fsync + rename.
///
/// Either the full write lands or `path` is left as it was.
pub fn atomic_write(path: &Path, content: &[u8]) -> io::Result<()> {
    let parent = parent_dir(path)?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;

    Ok(())
}

fn parent_dir(path: &Path) -> io::Result<&Path> {
    match path.parent() {
        Some(parent) if parent.as_os_str().is_empty() => Ok(Path::new(".")),
        Some(parent) => Ok(parent),
        None => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "Path has no parent directory",
        )),
    }
}

fn append_to_file_name(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

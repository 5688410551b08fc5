//! Crash-safe file replacement helpers

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::Result;

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

/// Backup path used by [`replace_with_backup`]
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".bak");
    PathBuf::from(name)
}

/// Write `bytes` to a temp file next to `path`, fsync it, then rename it over `path`.
///
/// Readers see either the old contents or the new contents, never a torn file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = parent_dir(path);
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path)?;
    sync_dir(dir);
    Ok(())
}

/// Like [`write_atomic`], but the previous file is first moved to `<path>.bak` and
/// only deleted once the new file is in place.
pub fn replace_with_backup(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = parent_dir(path);
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;

    let backup = backup_path(path);
    if path.exists() {
        fs::rename(path, &backup)?;
    }
    temp.persist(path)?;
    sync_dir(dir);
    if backup.exists() {
        fs::remove_file(&backup)?;
    }
    Ok(())
}

/// Read `path`, falling back to its `.bak` when a crash interrupted
/// [`replace_with_backup`] between the two renames. `None` if neither exists.
pub fn read_with_backup(path: &Path) -> Result<Option<Vec<u8>>> {
    if path.exists() {
        return Ok(Some(fs::read(path)?));
    }
    let backup = backup_path(path);
    if backup.exists() {
        log::warn!(
            "'{}' missing, restoring from '{}'",
            path.display(),
            backup.display()
        );
        let bytes = fs::read(&backup)?;
        fs::rename(&backup, path)?;
        return Ok(Some(bytes));
    }
    Ok(None)
}

// Directory fsync makes the rename durable; not every platform allows it.
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

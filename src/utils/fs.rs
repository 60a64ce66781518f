//! Small filesystem helpers shared by the stores that own on-disk state.

use anyhow::{Context, Result};
use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tempfile::NamedTempFile;

/// Atomically replace `path` with `contents`, leaving it with `mode`.
///
/// The data is written to a sibling temporary file which is then renamed
/// over the destination, so readers never observe a partial file.
pub fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .context(format!("Failed to create directory {}", parent.display()))?;

    let mut tmp = NamedTempFile::new_in(parent)
        .context(format!("Failed to create temporary file in {}", parent.display()))?;
    tmp.write_all(contents)
        .context(format!("Failed to write {}", path.display()))?;
    tmp.as_file().sync_all()?;
    fs::set_permissions(tmp.path(), fs::Permissions::from_mode(mode))
        .context(format!("Failed to set permissions on {}", path.display()))?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .context(format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// Remove a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).context(format!("Failed to remove {}", path.display())),
    }
}

/// Permission bits of `path` (without file type bits).
pub fn file_mode(path: &Path) -> Result<u32> {
    let meta = fs::metadata(path).context(format!("Failed to stat {}", path.display()))?;
    Ok(meta.permissions().mode() & 0o7777)
}

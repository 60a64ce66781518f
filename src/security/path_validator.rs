//! Validation of archive-relative paths.
//!
//! Rule documents decide where collected content lands inside the staging
//! tree, so every archive path is checked before anything is written.

use anyhow::{bail, Result};
use std::path::{Component, Path, PathBuf};

use super::events::{log_security_event, SecurityEvent};

/// Normalize an archive path to a relative path that stays inside the tree.
///
/// Leading `/` and `.` components are dropped. The path is rejected when it
/// contains `..`, null bytes, or nothing but separators.
///
/// # Arguments
///
/// * `path` - Archive path as produced by rule expansion
///
/// # Returns
///
/// * `Ok(PathBuf)` - The relative path to join onto the staging root
/// * `Err` - If the path would escape the staging root
pub fn validate_archive_path(path: &Path) -> Result<PathBuf> {
    if path.to_string_lossy().contains('\0') {
        reject(path, "path contains null bytes")?;
    }

    let mut relative = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => reject(path, "path contains '..'")?,
            Component::Prefix(_) => reject(path, "path has a drive prefix")?,
        }
    }

    if relative.as_os_str().is_empty() {
        reject(path, "path is empty")?;
    }
    Ok(relative)
}

fn reject(path: &Path, reason: &str) -> Result<()> {
    log_security_event(SecurityEvent::PathValidationFailed {
        path: path.display().to_string(),
        reason: reason.to_string(),
    });
    bail!("Invalid archive path '{}': {}", path.display(), reason)
}

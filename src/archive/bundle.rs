//! Staging tree and bundle lifecycle.
//!
//! ```text
//! <staging tmp dir>/                      0700, removed on drop unless retained
//! ├── insights-<host>-<timestamp>/        archive_dir, becomes the tar root
//! │   ├── etc/hosts
//! │   ├── insights_commands/uname_-a
//! │   └── insights_data/machine-id
//! └── insights-<host>-<timestamp>.tar.gz  written by finalize()
//! ```

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use log::{debug, info, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use super::compressor::Compressor;
use crate::constants::COMMANDS_DIR;
use crate::error::AgentError;
use crate::models::{ArchiveEntry, Payload};
use crate::security::{validate_archive_path, Redactor};

/// Pick a free name by appending `_1`, `_2`, ... to the file stem.
fn handle_duplicate_filename(dest_path: &Path) -> PathBuf {
    if !dest_path.exists() {
        return dest_path.to_path_buf();
    }

    let file_stem = dest_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());

    let extension = dest_path
        .extension()
        .map(|s| format!(".{}", s.to_string_lossy()))
        .unwrap_or_default();

    let mut counter = 1;
    loop {
        let new_path = dest_path.with_file_name(format!("{}_{}{}", file_stem, counter, extension));
        if !new_path.exists() {
            return new_path;
        }
        counter += 1;
    }
}

#[derive(Debug)]
pub struct Archive {
    staging: Option<TempDir>,
    staging_path: PathBuf,
    archive_name: String,
    archive_dir: PathBuf,
    compressor: Compressor,
    bundle: Option<PathBuf>,
}

impl Archive {
    /// Stage under the system temporary directory.
    pub fn new(hostname: &str, compressor: Compressor) -> Result<Self> {
        Self::new_in(&std::env::temp_dir(), hostname, compressor)
    }

    /// Stage under `base`.
    pub fn new_in(base: &Path, hostname: &str, compressor: Compressor) -> Result<Self> {
        let staging = tempfile::Builder::new()
            .prefix("insights-archive-")
            .tempdir_in(base)
            .context(format!("Failed to create staging directory in {}", base.display()))?;
        let safe_name: String = hostname
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let archive_name = format!(
            "insights-{}-{}",
            safe_name,
            Local::now().format("%Y%m%d%H%M%S")
        );
        let archive_dir = staging.path().join(&archive_name);
        fs::create_dir_all(&archive_dir)
            .context(format!("Failed to create {}", archive_dir.display()))?;

        debug!("Staging archive in {}", archive_dir.display());
        Ok(Self {
            staging_path: staging.path().to_path_buf(),
            staging: Some(staging),
            archive_name,
            archive_dir,
            compressor,
            bundle: None,
        })
    }

    pub fn archive_name(&self) -> &str {
        &self.archive_name
    }

    /// Root of the staged tree.
    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    pub fn compressor(&self) -> Compressor {
        self.compressor
    }

    pub fn is_finalized(&self) -> bool {
        self.bundle.is_some()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.bundle.is_some() {
            return Err(AgentError::ArchiveReused.into());
        }
        Ok(())
    }

    /// Reserve a location for `relative`, creating parents and resolving collisions.
    fn destination(&self, relative: &Path) -> Result<PathBuf> {
        let relative = validate_archive_path(relative)?;
        let wanted = self.archive_dir.join(&relative);
        if let Some(parent) = wanted.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create {}", parent.display()))?;
        }
        let dest = handle_duplicate_filename(&wanted);
        if dest != wanted {
            warn!(
                "Archive path {} already used; storing as {}",
                relative.display(),
                dest.display()
            );
        }
        Ok(dest)
    }

    /// Place a collected entry into the staging tree.
    ///
    /// Returns the path it was written to.
    pub fn add(&mut self, entry: ArchiveEntry) -> Result<PathBuf> {
        self.ensure_open()?;
        let dest = self.destination(&entry.archive_path)?;

        match entry.payload {
            Payload::Text(text) => fs::write(&dest, text.as_bytes()),
            Payload::Bytes(bytes) => fs::write(&dest, bytes),
            Payload::Spooled(spool) => move_file(&spool, &dest),
        }
        .context(format!("Failed to write {}", dest.display()))?;

        Ok(dest)
    }

    /// Write a metadata file at an archive-relative path.
    pub fn add_metadata(&mut self, archive_path: &str, contents: &[u8]) -> Result<PathBuf> {
        self.add(ArchiveEntry {
            kind: crate::models::TaskKind::File,
            archive_path: PathBuf::from(archive_path),
            payload: Payload::Bytes(contents.to_vec()),
            exit_status: None,
        })
    }

    /// Copy an existing file (a sub-bundle) to the top of the staging tree.
    pub fn add_file(&mut self, source: &Path) -> Result<PathBuf> {
        self.ensure_open()?;
        let name = source
            .file_name()
            .ok_or_else(|| anyhow!("{} has no file name", source.display()))?;
        let dest = self.destination(Path::new(name))?;
        fs::copy(source, &dest).context(format!(
            "Failed to copy {} into archive",
            source.display()
        ))?;
        Ok(dest)
    }

    /// Drop the command output directory (used by the container wrapper).
    pub fn remove_commands_dir(&mut self) -> Result<()> {
        self.ensure_open()?;
        let dir = self.archive_dir.join(COMMANDS_DIR);
        if dir.exists() {
            fs::remove_dir_all(&dir).context(format!("Failed to remove {}", dir.display()))?;
        }
        Ok(())
    }

    /// Redact (optionally) and compress the staged tree into a bundle.
    ///
    /// Can be called once; the archive is immutable afterwards.
    pub fn finalize(&mut self, redactor: Option<&dyn Redactor>) -> Result<PathBuf> {
        self.ensure_open()?;

        if let Some(redactor) = redactor {
            redactor
                .redact(&self.archive_dir)
                .context("Failed to obfuscate archive")?;
        }

        let bundle = self.staging_path.join(format!(
            "{}{}",
            self.archive_name,
            self.compressor.extension()
        ));
        self.compressor
            .write_tarball(&self.archive_dir, &self.archive_name, &bundle)?;

        info!("Created archive {}", bundle.display());
        self.bundle = Some(bundle.clone());
        Ok(bundle)
    }

    pub fn bundle_path(&self) -> Option<&Path> {
        self.bundle.as_deref()
    }

    /// Keep the staging directory after this value is dropped.
    pub fn retain(&mut self) -> PathBuf {
        if let Some(staging) = self.staging.take() {
            let path = staging.into_path();
            debug!("Retaining staging directory {}", path.display());
        }
        self.staging_path.clone()
    }

    /// Remove the staging tree and bundle now.
    pub fn delete(mut self) -> Result<()> {
        match self.staging.take() {
            Some(staging) => staging
                .close()
                .context(format!("Failed to remove {}", self.staging_path.display())),
            None => Ok(()),
        }
    }
}

fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        // Spool dir may be on another filesystem
        Err(_) => fs::copy(from, to).map(|_| ()),
    }
}

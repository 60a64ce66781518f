//! Where a target's filesystem can be read from.
//!
//! A [`MountpointProvider`] is a scoped resource: opened before collection
//! of one target, closed (or dropped) right after, on every exit path.

use anyhow::{bail, Context, Result};
use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};

use crate::models::{Target, TargetKind};
use crate::utils::process::{probe_timeout, run_program};

pub trait MountpointProvider {
    /// Directory under which the target's root filesystem is visible.
    fn root(&self) -> &Path;

    /// Release the mount. Calling it more than once is harmless.
    fn close(&mut self) -> Result<()>;
}

/// The running host, visible at `/`.
#[derive(Debug, Default)]
pub struct HostRoot;

impl MountpointProvider for HostRoot {
    fn root(&self) -> &Path {
        Path::new("/")
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A filesystem someone else already mounted; never unmounted here.
#[derive(Debug)]
pub struct BindMount {
    path: PathBuf,
}

impl BindMount {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_dir() {
            bail!("Mount point {} is not a directory", path.display());
        }
        Ok(Self { path })
    }
}

impl MountpointProvider for BindMount {
    fn root(&self) -> &Path {
        &self.path
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Image or container mounted read-only through the `atomic` tool into a
/// private temporary directory.
#[derive(Debug)]
pub struct AtomicMount {
    mount_point: PathBuf,
    mounted: bool,
}

impl AtomicMount {
    pub fn open(target_id: &str) -> Result<Self> {
        let mount_point = tempfile::Builder::new()
            .prefix("insights-mount-")
            .tempdir()
            .context("Failed to create mount point")?
            .into_path();
        let dir = mount_point.to_string_lossy().into_owned();

        let out = run_program("atomic", &["mount", target_id, &dir], probe_timeout());
        match out {
            Ok(out) if out.success() => {
                debug!("Mounted {} at {}", target_id, dir);
                Ok(Self {
                    mount_point,
                    mounted: true,
                })
            }
            Ok(out) => {
                let _ = fs::remove_dir_all(&mount_point);
                bail!(
                    "atomic mount {} failed with status {}: {}",
                    target_id,
                    out.status,
                    out.stderr.trim()
                )
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&mount_point);
                Err(e.context(format!("Failed to mount {}", target_id)))
            }
        }
    }
}

impl MountpointProvider for AtomicMount {
    fn root(&self) -> &Path {
        &self.mount_point
    }

    fn close(&mut self) -> Result<()> {
        if !self.mounted {
            return Ok(());
        }
        self.mounted = false;
        let dir = self.mount_point.to_string_lossy().into_owned();
        let out = run_program("atomic", &["unmount", &dir], probe_timeout())?;
        if !out.success() {
            bail!("atomic unmount {} failed: {}", dir, out.stderr.trim());
        }
        fs::remove_dir_all(&self.mount_point)
            .context(format!("Failed to remove {}", self.mount_point.display()))?;
        Ok(())
    }
}

impl Drop for AtomicMount {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to release mount {}: {:#}", self.mount_point.display(), e);
        }
    }
}

/// Open the mount backend appropriate for `target`.
pub fn open_target(target: &Target) -> Result<Box<dyn MountpointProvider>> {
    match target.kind {
        TargetKind::Host => Ok(Box::new(HostRoot)),
        TargetKind::DockerImage | TargetKind::DockerContainer => {
            Ok(Box::new(AtomicMount::open(&target.name)?))
        }
    }
}

//! Stable identities for analysis targets.
//!
//! The host identity is a random UUID persisted in the state directory.
//! Images and containers derive theirs from it (UUIDv5 with the host id as
//! namespace), so the same image on the same host always maps to the same
//! id without storing anything per container.

use anyhow::{Context, Result};
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::constants::{DOCKER_GROUP_ID_FILE, MACHINE_ID_FILE, PRIVATE_FILE_MODE};
use crate::models::Target;
use crate::utils::fs::{remove_if_exists, write_atomic};
use crate::utils::process::{probe_timeout, run_program};

#[derive(Debug, Clone)]
pub struct IdentityStore {
    state_dir: PathBuf,
}

impl IdentityStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn machine_id_path(&self) -> PathBuf {
        self.state_dir.join(MACHINE_ID_FILE)
    }

    fn read_or_create(&self, path: &Path) -> Result<String> {
        match fs::read_to_string(path) {
            Ok(existing) if !existing.trim().is_empty() => Ok(existing.trim().to_string()),
            _ => {
                let id = Uuid::new_v4().to_string();
                write_atomic(path, id.as_bytes(), PRIVATE_FILE_MODE)?;
                info!("Generated new identity in {}", path.display());
                Ok(id)
            }
        }
    }

    /// The host's machine-id, generated on first use.
    pub fn machine_id(&self) -> Result<String> {
        self.read_or_create(&self.machine_id_path())
    }

    /// Replace the machine-id with a fresh one.
    pub fn regenerate_machine_id(&self) -> Result<String> {
        self.delete_machine_id()?;
        self.machine_id()
    }

    pub fn delete_machine_id(&self) -> Result<()> {
        remove_if_exists(&self.machine_id_path())?;
        Ok(())
    }

    /// Identity of the multi-target wrapping archive.
    pub fn docker_group_id(&self) -> Result<String> {
        self.read_or_create(&self.state_dir.join(DOCKER_GROUP_ID_FILE))
    }

    /// Identity for `target`: the machine-id for the host, derived otherwise.
    pub fn target_id(&self, target: &Target) -> Result<String> {
        let machine_id = self.machine_id()?;
        if target.is_host() {
            return Ok(machine_id);
        }
        derived_id(&machine_id, &target.name)
    }
}

/// UUIDv5 of `name` in the namespace of the host machine-id.
pub fn derived_id(machine_id: &str, name: &str) -> Result<String> {
    let namespace = Uuid::parse_str(machine_id)
        .context(format!("machine-id '{}' is not a valid UUID", machine_id))?;
    Ok(Uuid::new_v5(&namespace, name.as_bytes()).to_string())
}

/// Host name to report: `display_name` if set, otherwise the longer of the
/// short and fully-qualified names unless the latter is a localhost alias.
pub fn determine_hostname(display_name: Option<&str>) -> String {
    if let Some(name) = display_name.filter(|n| !n.trim().is_empty()) {
        return name.to_string();
    }

    let short = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();

    let fqdn = match run_program("hostname", &["-f"], probe_timeout()) {
        Ok(out) if out.success() => out.stdout.trim().to_string(),
        Ok(_) | Err(_) => String::new(),
    };
    debug!("Hostname candidates: '{}' / '{}'", short, fqdn);

    if fqdn.len() > short.len() && !fqdn.contains("localhost") {
        fqdn
    } else if short.is_empty() {
        "localhost".to_string()
    } else {
        short
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_machine_id_is_stable() {
        let dir = TempDir::new().unwrap();
        let store = IdentityStore::new(dir.path());

        let first = store.machine_id().unwrap();
        let second = store.machine_id().unwrap();
        assert_eq!(first, second);
        assert!(Uuid::parse_str(&first).is_ok());
        assert_eq!(
            crate::utils::fs::file_mode(&store.machine_id_path()).unwrap(),
            PRIVATE_FILE_MODE
        );
    }

    #[test]
    fn test_regenerate_changes_id() {
        let dir = TempDir::new().unwrap();
        let store = IdentityStore::new(dir.path());
        let first = store.machine_id().unwrap();
        let second = store.regenerate_machine_id().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_derived_ids_are_deterministic() {
        let dir = TempDir::new().unwrap();
        let store = IdentityStore::new(dir.path());

        let image = Target::image("sha256:abc");
        let a = store.target_id(&image).unwrap();
        let b = store.target_id(&image).unwrap();
        let other = store.target_id(&Target::container("abc")).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, other);
        assert_eq!(store.target_id(&Target::host("h")).unwrap(), store.machine_id().unwrap());
    }

    #[test]
    fn test_docker_group_id_separate() {
        let dir = TempDir::new().unwrap();
        let store = IdentityStore::new(dir.path());
        assert_ne!(store.docker_group_id().unwrap(), store.machine_id().unwrap());
        assert_eq!(store.docker_group_id().unwrap(), store.docker_group_id().unwrap());
    }

    #[test]
    fn test_invalid_machine_id_rejected() {
        assert!(derived_id("not-a-uuid", "image").is_err());
    }

    #[test]
    fn test_display_name_wins() {
        assert_eq!(determine_hostname(Some("prod-db")), "prod-db");
        assert!(!determine_hostname(None).is_empty());
    }
}

//! Test utilities for insights_agent
//!
//! Shared fixtures for the unit test modules: a fake target root, rule
//! documents and ready-made archive entries.

#![cfg(test)]

use anyhow::Result;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use tempfile::{NamedTempFile, TempDir};

use crate::config::RuleSet;
use crate::models::{ArchiveEntry, Payload, TaskKind};

/// Creates a temporary file with the given content
pub fn create_temp_file(content: &[u8]) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    file.write_all(content)?;
    file.flush()?;
    Ok(file)
}

/// A small root filesystem, as a mounted image would look.
pub fn create_target_root() -> Result<TempDir> {
    let root = TempDir::new()?;
    let base = root.path();

    fs::create_dir_all(base.join("etc/sysconfig/network-scripts"))?;
    fs::write(base.join("etc/redhat-release"), "Red Hat Enterprise Linux release 9.4\n")?;
    fs::write(base.join("etc/hosts"), "127.0.0.1 localhost\n10.0.0.5 db01\n")?;
    fs::write(base.join("etc/sysconfig/network-scripts/ifcfg-eth0"), "DEVICE=eth0\n")?;
    fs::write(base.join("etc/sysconfig/network-scripts/ifcfg-lo"), "DEVICE=lo\n")?;

    Ok(root)
}

/// Rule document covering the files of [`create_target_root`] for images.
pub const IMAGE_RULES_JSON: &str = r#"{
    "version": "1.0.0",
    "specs": {
        "redhat-release": {"docker_image": [
            {"file": "{CONTAINER_MOUNT_POINT}/etc/redhat-release", "pattern": []}]},
        "hosts": {"docker_image": [
            {"file": "{CONTAINER_MOUNT_POINT}/etc/hosts", "pattern": ["db01"]}]},
        "ifcfg": {"docker_image": [
            {"file": "{CONTAINER_MOUNT_POINT}/etc/sysconfig/network-scripts/ifcfg-.*", "pattern": []}]}
    }
}"#;

pub fn image_rules() -> RuleSet {
    rules_from(IMAGE_RULES_JSON)
}

pub fn rules_from(json: &str) -> RuleSet {
    RuleSet::from_json_str(json, "test").unwrap()
}

/// A collected text entry at `archive_path`.
pub fn text_entry(kind: TaskKind, archive_path: &str, text: &str) -> ArchiveEntry {
    ArchiveEntry {
        kind,
        archive_path: PathBuf::from(archive_path),
        payload: Payload::Text(text.to_string()),
        exit_status: None,
    }
}

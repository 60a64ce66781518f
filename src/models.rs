use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tempfile::TempPath;

/// Kind of system a collection run is aimed at.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Host,
    DockerImage,
    DockerContainer,
}

impl TargetKind {
    /// Key used for this kind in rule-set `specs` maps and in metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Host => "host",
            TargetKind::DockerImage => "docker_image",
            TargetKind::DockerContainer => "docker_container",
        }
    }

    /// Short form used in group metadata (`image`, `container`).
    pub fn short_name(&self) -> &'static str {
        match self {
            TargetKind::Host => "host",
            TargetKind::DockerImage => "image",
            TargetKind::DockerContainer => "container",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A concrete analysis target: the host itself, or one image/container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub kind: TargetKind,
    /// Image or container id; the hostname for the host target
    pub name: String,
}

impl Target {
    pub fn host(name: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::Host,
            name: name.into(),
        }
    }

    pub fn image(id: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::DockerImage,
            name: id.into(),
        }
    }

    pub fn container(id: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::DockerContainer,
            name: id.into(),
        }
    }

    pub fn is_host(&self) -> bool {
        self.kind == TargetKind::Host
    }
}

/// Placement of the system in a management hierarchy.
///
/// `-1` for both fields means the system is unmanaged.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchInfo {
    pub remote_branch: i64,
    pub remote_leaf: i64,
}

impl Default for BranchInfo {
    fn default() -> Self {
        Self {
            remote_branch: -1,
            remote_leaf: -1,
        }
    }
}

impl BranchInfo {
    /// Managed by a classic Satellite 5, which reports a branch but no leaf.
    pub fn is_satellite5_managed(&self) -> bool {
        self.remote_branch != -1 && self.remote_leaf == -1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    File,
    Command,
}

/// One concrete unit of collection produced by rule expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionTask {
    pub kind: TaskKind,
    /// Absolute file path, or the full command line
    pub source: String,
    /// Relative location inside the staging tree
    pub archive_path: PathBuf,
    /// Keep only lines containing at least one of these (empty keeps all)
    pub line_include_patterns: Vec<String>,
    /// Drop lines containing any of these
    pub line_exclude_patterns: Vec<String>,
}

impl CollectionTask {
    pub fn file(source: impl Into<String>, archive_path: impl Into<PathBuf>) -> Self {
        Self {
            kind: TaskKind::File,
            source: source.into(),
            archive_path: archive_path.into(),
            line_include_patterns: Vec::new(),
            line_exclude_patterns: Vec::new(),
        }
    }

    pub fn command(source: impl Into<String>, archive_path: impl Into<PathBuf>) -> Self {
        Self {
            kind: TaskKind::Command,
            source: source.into(),
            archive_path: archive_path.into(),
            line_include_patterns: Vec::new(),
            line_exclude_patterns: Vec::new(),
        }
    }
}

/// Collected content, either in memory or spooled to a temporary file.
#[derive(Debug)]
pub enum Payload {
    Text(String),
    Bytes(Vec<u8>),
    Spooled(TempPath),
}

/// Result of running one task, ready to be placed into an archive.
#[derive(Debug)]
pub struct ArchiveEntry {
    pub kind: TaskKind,
    pub archive_path: PathBuf,
    pub payload: Payload,
    /// Process exit status for commands; `None` for files read successfully
    pub exit_status: Option<i32>,
}

impl ArchiveEntry {
    /// True for file tasks whose source did not exist.
    pub fn is_missing_file(&self) -> bool {
        self.kind == TaskKind::File
            && self.exit_status == Some(crate::constants::NOT_FOUND_EXIT_STATUS)
    }
}

//! The versioned collection rule document.
//!
//! Two shapes are accepted:
//!
//! ```text
//! current:  { "version", "pre_commands": {alias: cmd},
//!             "specs": { name: { "host": [rule], "docker_image": [rule], .. } },
//!             "meta_specs": { name: { "archive_file_name" } } }
//!
//! legacy:   { "version", "pre_commands": {alias: cmd},
//!             "files": [rule], "commands": [rule] }
//! ```

use anyhow::{anyhow, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::convert::TryFrom;

use crate::constants::{
    META_ANALYSIS_TARGET, META_BRANCH_INFO, META_MACHINE_ID, META_UPLOADER_LOG,
};
use crate::error::AgentError;
use crate::models::TargetKind;

/// One rule: what to collect and how to filter it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawRule")]
pub enum RuleEntry {
    File {
        path: String,
        line_patterns: Vec<String>,
        archive_name: Option<String>,
    },
    Glob {
        glob_pattern: String,
        line_patterns: Vec<String>,
        archive_name: Option<String>,
    },
    Command {
        command_line: String,
        line_patterns: Vec<String>,
        pre_command_alias: Option<String>,
        archive_name: Option<String>,
    },
}

impl RuleEntry {
    pub fn line_patterns(&self) -> &[String] {
        match self {
            RuleEntry::File { line_patterns, .. }
            | RuleEntry::Glob { line_patterns, .. }
            | RuleEntry::Command { line_patterns, .. } => line_patterns,
        }
    }
}

#[derive(Deserialize)]
struct RawRule {
    file: Option<String>,
    glob: Option<String>,
    command: Option<String>,
    #[serde(default)]
    pattern: Vec<String>,
    pre_command: Option<String>,
    archive_file_name: Option<String>,
}

impl TryFrom<RawRule> for RuleEntry {
    type Error = String;

    fn try_from(raw: RawRule) -> std::result::Result<Self, Self::Error> {
        let line_patterns = raw.pattern;
        let archive_name = raw.archive_file_name;
        match (raw.file, raw.glob, raw.command) {
            (Some(path), None, None) => Ok(RuleEntry::File {
                path,
                line_patterns,
                archive_name,
            }),
            (None, Some(glob_pattern), None) => Ok(RuleEntry::Glob {
                glob_pattern,
                line_patterns,
                archive_name,
            }),
            (None, None, Some(command_line)) => Ok(RuleEntry::Command {
                command_line,
                line_patterns,
                pre_command_alias: raw.pre_command,
                archive_name,
            }),
            _ => Err("rule must have exactly one of 'file', 'glob' or 'command'".to_string()),
        }
    }
}

/// Metadata files every archive carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaSpec {
    AnalysisTarget,
    BranchInfo,
    MachineId,
    UploaderLog,
}

impl MetaSpec {
    fn key(&self) -> &'static str {
        match self {
            MetaSpec::AnalysisTarget => "analysis_target",
            MetaSpec::BranchInfo => "branch_info",
            MetaSpec::MachineId => "machine-id",
            MetaSpec::UploaderLog => "uploader_log",
        }
    }

    fn default_path(&self) -> &'static str {
        match self {
            MetaSpec::AnalysisTarget => META_ANALYSIS_TARGET,
            MetaSpec::BranchInfo => META_BRANCH_INFO,
            MetaSpec::MachineId => META_MACHINE_ID,
            MetaSpec::UploaderLog => META_UPLOADER_LOG,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacyRules {
    pub files: Vec<RuleEntry>,
    pub commands: Vec<RuleEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    pub version: String,
    pub pre_commands: BTreeMap<String, String>,
    /// spec name -> target kind key -> rules
    pub specs: BTreeMap<String, BTreeMap<String, Vec<RuleEntry>>>,
    pub legacy: Option<LegacyRules>,
    meta_overrides: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct MetaEntry {
    archive_file_name: String,
}

impl RuleSet {
    /// Parse a rule document, requiring a `version`.
    pub fn from_json_str(text: &str, source_name: &str) -> Result<Self> {
        let doc: Value = serde_json::from_str(text).map_err(|e| AgentError::InvalidRules {
            source_name: source_name.to_string(),
            reason: e.to_string(),
        })?;
        Self::from_value(doc, source_name)
    }

    pub fn from_value(doc: Value, source_name: &str) -> Result<Self> {
        let invalid = |reason: String| AgentError::InvalidRules {
            source_name: source_name.to_string(),
            reason,
        };

        let version = match doc.get("version") {
            Some(Value::String(v)) => v.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(AgentError::MissingVersion.into()),
        };

        let pre_commands = match doc.get("pre_commands") {
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| invalid(format!("pre_commands: {}", e)))?,
            None => BTreeMap::new(),
        };

        let meta_overrides = match doc.get("meta_specs") {
            Some(v) => {
                let entries: BTreeMap<String, MetaEntry> = serde_json::from_value(v.clone())
                    .map_err(|e| invalid(format!("meta_specs: {}", e)))?;
                entries
                    .into_iter()
                    .map(|(name, entry)| (name, entry.archive_file_name))
                    .collect()
            }
            None => BTreeMap::new(),
        };

        let specs = match doc.get("specs") {
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| invalid(format!("specs: {}", e)))?,
            None => BTreeMap::new(),
        };

        // Flat lists are kept even next to `specs` for original-style runs
        let has_flat = doc.get("files").is_some() || doc.get("commands").is_some();
        let legacy = if has_flat || doc.get("specs").is_none() {
            let list = |key: &str| -> Result<Vec<RuleEntry>> {
                match doc.get(key) {
                    Some(v) => serde_json::from_value(v.clone())
                        .map_err(|e| anyhow!(invalid(format!("{}: {}", key, e)))),
                    None => Ok(Vec::new()),
                }
            };
            Some(LegacyRules {
                files: list("files")?,
                commands: list("commands")?,
            })
        } else {
            None
        };

        Ok(Self {
            version,
            pre_commands,
            specs,
            legacy,
            meta_overrides,
        })
    }

    /// Flat rule lists to expand, if this run uses them.
    pub fn legacy_rules(&self, original_style: bool) -> Option<&LegacyRules> {
        match &self.legacy {
            Some(legacy) if original_style || self.specs.is_empty() => Some(legacy),
            _ => None,
        }
    }

    /// Rules applicable to `kind`, in spec-name order.
    pub fn entries_for(&self, kind: TargetKind) -> Vec<&RuleEntry> {
        self.specs
            .values()
            .filter_map(|by_kind| by_kind.get(kind.as_str()))
            .flatten()
            .collect()
    }

    /// Archive location of a metadata file, honoring `meta_specs` overrides.
    pub fn meta_path(&self, spec: MetaSpec) -> &str {
        self.meta_overrides
            .get(spec.key())
            .map(String::as_str)
            .unwrap_or_else(|| spec.default_path())
    }
}

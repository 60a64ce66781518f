//! Local opt-out policy read from an INI file.
//!
//! ```text
//! [remove]
//! files=/etc/cron.daily/rhsmd,/etc/sysconfig/rhn/up2date
//! commands=/bin/netstat -i,/sbin/lsmod
//! patterns=password,TOKEN
//! keywords=super$ecret,ultra$ecret
//! ```

use anyhow::{Context, Result};
use ini::Ini;
use log::{debug, warn};
use std::collections::BTreeSet;
use std::path::Path;

use crate::constants::PRIVATE_FILE_MODE;
use crate::error::AgentError;
use crate::security::{log_security_event, SecurityEvent};
use crate::utils::fs::file_mode;

const REMOVE_SECTION: &str = "remove";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemovalPolicy {
    pub excluded_files: BTreeSet<String>,
    pub excluded_commands: BTreeSet<String>,
    /// Fixed strings; lines containing any of them are dropped everywhere
    pub line_exclude_patterns: Vec<String>,
    /// Words replaced by the redactor when obfuscation is on
    pub redaction_keywords: Vec<String>,
}

fn split_values(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

impl RemovalPolicy {
    pub fn is_empty(&self) -> bool {
        self.excluded_files.is_empty()
            && self.excluded_commands.is_empty()
            && self.line_exclude_patterns.is_empty()
            && self.redaction_keywords.is_empty()
    }

    pub fn excludes_file(&self, path: &str) -> bool {
        self.excluded_files.contains(path)
    }

    pub fn excludes_command(&self, command_line: &str) -> bool {
        self.excluded_commands.contains(command_line)
    }

    /// Parse the INI text. A file without a `[remove]` section is an empty policy.
    pub fn parse(text: &str) -> Result<Self> {
        let ini = Ini::load_from_str(text).context("Failed to parse removal file")?;
        let section = match ini.section(Some(REMOVE_SECTION)) {
            Some(section) => section,
            None => return Ok(Self::default()),
        };

        Ok(Self {
            excluded_files: split_values(section.get("files")).into_iter().collect(),
            excluded_commands: split_values(section.get("commands")).into_iter().collect(),
            line_exclude_patterns: split_values(section.get("patterns")),
            redaction_keywords: split_values(section.get("keywords")),
        })
    }

    /// Best-effort load used by collection runs.
    ///
    /// Absence means no removals; a malformed file is logged and ignored.
    /// A file with loose permissions is still honored, since it can only
    /// narrow what is collected.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            debug!("No removal file at {}", path.display());
            return Self::default();
        }

        if let Ok(mode) = file_mode(path) {
            if mode != PRIVATE_FILE_MODE {
                log_security_event(SecurityEvent::PermissiveFile {
                    path: path.display().to_string(),
                    mode,
                });
            }
        }

        match std::fs::read_to_string(path)
            .context(format!("Failed to read {}", path.display()))
            .and_then(|text| Self::parse(&text))
        {
            Ok(policy) => {
                debug!(
                    "Removal policy: {} files, {} commands, {} patterns, {} keywords",
                    policy.excluded_files.len(),
                    policy.excluded_commands.len(),
                    policy.line_exclude_patterns.len(),
                    policy.redaction_keywords.len()
                );
                policy
            }
            Err(e) => {
                warn!("Ignoring malformed removal file {}: {:#}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Strict load for `--validate`: the file must exist, be mode 0600 and parse.
    pub fn validate(path: &Path) -> Result<Self> {
        let invalid = |reason: String| AgentError::InvalidRemovalFile {
            path: path.display().to_string(),
            reason,
        };

        if !path.exists() {
            return Err(invalid("file does not exist".to_string()).into());
        }
        let mode = file_mode(path)?;
        if mode != PRIVATE_FILE_MODE {
            return Err(invalid(format!("mode is {:o}, expected 600", mode)).into());
        }
        let text =
            std::fs::read_to_string(path).context(format!("Failed to read {}", path.display()))?;
        Self::parse(&text).map_err(|e| invalid(format!("{:#}", e)).into())
    }
}

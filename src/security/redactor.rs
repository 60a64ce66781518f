//! Obfuscation of a staged archive tree before compression.
//!
//! The [`KeywordRedactor`] rewrites every regular file in place, replacing
//! removal-policy keywords, the host name and IPv4 addresses with stable
//! placeholders (`keyword0`, `host0`, `10.230.230.1`). The same original
//! value always maps to the same placeholder across the whole tree.

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use log::{debug, info};
use regex::bytes::{Captures, Regex};
use std::collections::HashMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use walkdir::WalkDir;

use crate::constants::HOSTNAME_ARCHIVE_PATH;

lazy_static! {
    static ref IPV4_PATTERN: Regex =
        Regex::new(r"\b(?:(?:25[0-5]|2[0-4][0-9]|1[0-9]{2}|[1-9]?[0-9])\.){3}(?:25[0-5]|2[0-4][0-9]|1[0-9]{2}|[1-9]?[0-9])\b")
            .unwrap();
}

/// Placeholder network for obfuscated addresses
const OBFUSCATED_NET: [u8; 3] = [10, 230, 230];

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RedactionReport {
    pub files_scanned: usize,
    pub files_changed: usize,
    pub addresses_replaced: usize,
}

/// Capability that rewrites a staged tree in place.
pub trait Redactor {
    fn redact(&self, tree: &Path) -> Result<RedactionReport>;
}

#[derive(Debug, Clone, Default)]
pub struct KeywordRedactor {
    keywords: Vec<String>,
    redact_hostname: bool,
}

impl KeywordRedactor {
    pub fn new(keywords: Vec<String>, redact_hostname: bool) -> Self {
        let keywords = keywords.into_iter().filter(|k| !k.is_empty()).collect();
        Self {
            keywords,
            redact_hostname,
        }
    }

    /// Host name as collected into the tree, if present.
    fn collected_hostname(tree: &Path) -> Option<String> {
        let path = tree.join(HOSTNAME_ARCHIVE_PATH);
        let text = fs::read_to_string(path).ok()?;
        let name = text.lines().next()?.trim();
        if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        }
    }

    fn word_replacements(&self, tree: &Path) -> Result<Vec<(Regex, Vec<u8>)>> {
        let mut replacements = Vec::new();

        if self.redact_hostname {
            if let Some(fqdn) = Self::collected_hostname(tree) {
                let short = fqdn.split('.').next().unwrap_or(&fqdn).to_string();
                // Longest form first so the FQDN is not half-replaced
                replacements.push((
                    Regex::new(&regex::escape(&fqdn))?,
                    b"host0".to_vec(),
                ));
                if short != fqdn {
                    replacements.push((Regex::new(&regex::escape(&short))?, b"host0".to_vec()));
                }
            } else {
                debug!("No collected hostname found; hostname will not be obfuscated");
            }
        }

        for (i, keyword) in self.keywords.iter().enumerate() {
            replacements.push((
                Regex::new(&regex::escape(keyword))?,
                format!("keyword{}", i).into_bytes(),
            ));
        }
        Ok(replacements)
    }
}

/// Stable original -> placeholder address mapping shared across files.
#[derive(Debug, Default)]
struct AddressBook {
    mapping: HashMap<Vec<u8>, Vec<u8>>,
}

impl AddressBook {
    fn placeholder(&mut self, original: &[u8]) -> Vec<u8> {
        let index = self.mapping.len() as u32;
        self.mapping
            .entry(original.to_vec())
            .or_insert_with(|| {
                let addr = Ipv4Addr::new(
                    OBFUSCATED_NET[0],
                    OBFUSCATED_NET[1],
                    OBFUSCATED_NET[2].wrapping_add((index / 254) as u8),
                    (index % 254) as u8 + 1,
                );
                addr.to_string().into_bytes()
            })
            .clone()
    }
}

impl Redactor for KeywordRedactor {
    fn redact(&self, tree: &Path) -> Result<RedactionReport> {
        let words = self.word_replacements(tree)?;
        let mut book = AddressBook::default();
        let mut report = RedactionReport::default();

        for entry in WalkDir::new(tree).follow_links(false).sort_by_file_name() {
            let entry = entry.context(format!("Failed to walk {}", tree.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            report.files_scanned += 1;

            let path = entry.path();
            let original =
                fs::read(path).context(format!("Failed to read {}", path.display()))?;

            let mut content = original.clone();
            for (pattern, replacement) in &words {
                content = pattern.replace_all(&content, &replacement[..]).into_owned();
            }
            let mut replaced = 0;
            content = IPV4_PATTERN
                .replace_all(&content, |caps: &Captures| {
                    replaced += 1;
                    book.placeholder(&caps[0])
                })
                .into_owned();

            if content != original {
                fs::write(path, &content)
                    .context(format!("Failed to write {}", path.display()))?;
                report.files_changed += 1;
                report.addresses_replaced += replaced;
            }
        }

        info!(
            "Obfuscation rewrote {} of {} files",
            report.files_changed, report.files_scanned
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn stage(dir: &TempDir, rel: &str, content: &str) {
        let path = dir.path().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_keywords_and_addresses_replaced() {
        let dir = TempDir::new().unwrap();
        stage(&dir, "etc/hosts", "192.168.1.10 db.internal projectx\n");
        stage(&dir, "insights_commands/ip_addr", "inet 192.168.1.10/24\ninet 10.0.0.5/8\n");

        let redactor = KeywordRedactor::new(vec!["projectx".to_string()], false);
        let report = redactor.redact(dir.path()).unwrap();
        assert_eq!(report.files_scanned, 2);
        assert_eq!(report.files_changed, 2);

        let hosts = fs::read_to_string(dir.path().join("etc/hosts")).unwrap();
        let ip = fs::read_to_string(dir.path().join("insights_commands/ip_addr")).unwrap();
        assert_eq!(hosts, "10.230.230.1 db.internal keyword0\n");
        // Same address maps to the same placeholder in every file
        assert!(ip.contains("inet 10.230.230.1/24"));
        assert!(!ip.contains("10.0.0.5"));
    }

    #[test]
    fn test_hostname_obfuscation() {
        let dir = TempDir::new().unwrap();
        stage(&dir, HOSTNAME_ARCHIVE_PATH, "web01.example.com\n");
        stage(&dir, "etc/motd", "Welcome to web01 (web01.example.com)\n");

        KeywordRedactor::new(vec![], true).redact(dir.path()).unwrap();

        let motd = fs::read_to_string(dir.path().join("etc/motd")).unwrap();
        assert_eq!(motd, "Welcome to host0 (host0)\n");
    }

    #[test]
    fn test_untouched_files_not_rewritten() {
        let dir = TempDir::new().unwrap();
        stage(&dir, "etc/redhat-release", "Red Hat Enterprise Linux\n");
        let report = KeywordRedactor::new(vec![], true).redact(dir.path()).unwrap();
        assert_eq!(report.files_changed, 0);
    }
}

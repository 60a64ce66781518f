use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::signature::SignatureVerifier;
use crate::cloud::api::RuleFetcher;
use crate::config::{RemovalPolicy, RuleSet};
use crate::constants::{
    PRIVATE_FILE_MODE, RULES_CACHE_FILE, RULES_FALLBACK_FILE, SIGNATURE_SUFFIX,
};
use crate::error::AgentError;
use crate::models::BranchInfo;
use crate::security::{log_security_event, SecurityEvent};
use crate::utils::fs::write_atomic;

/// A rule document handed to the agent instead of fetched or cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuppliedRules {
    pub document: String,
    pub signature: String,
    /// Replaces the branch info the service would report
    pub branch_info: Option<BranchInfo>,
}

impl SuppliedRules {
    /// Parse `{"uploader.json": "...", "sig": "...", "branch_info": {...}}`.
    pub fn from_json(text: &str) -> Result<Self> {
        let doc: Value = serde_json::from_str(text).map_err(|e| AgentError::InvalidRules {
            source_name: "supplied document".to_string(),
            reason: e.to_string(),
        })?;
        let string_field = |key: &'static str| -> Result<String> {
            doc.get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| AgentError::IncompleteSuppliedRules(key).into())
        };
        let branch_info = match doc.get("branch_info") {
            Some(v) => Some(
                serde_json::from_value(v.clone()).context("Invalid branch_info in supplied document")?,
            ),
            None => None,
        };
        Ok(Self {
            document: string_field("uploader.json")?,
            signature: string_field("sig")?,
            branch_info,
        })
    }
}

/// Where the rule set comes from.
#[derive(Debug, Clone)]
pub enum LoadMode {
    UseCached,
    ForceRefresh,
    FromSuppliedDocument(SuppliedRules),
}

pub struct RuleSetResolver {
    rules_dir: PathBuf,
    rules_url: String,
    remove_file: PathBuf,
    verifier: Option<Box<dyn SignatureVerifier>>,
    fetcher: Option<Box<dyn RuleFetcher>>,
}

impl RuleSetResolver {
    /// `verifier: None` disables signature checks; `fetcher: None` means offline.
    pub fn new(
        rules_dir: impl Into<PathBuf>,
        rules_url: impl Into<String>,
        remove_file: impl Into<PathBuf>,
        verifier: Option<Box<dyn SignatureVerifier>>,
        fetcher: Option<Box<dyn RuleFetcher>>,
    ) -> Self {
        if verifier.is_none() {
            log_security_event(SecurityEvent::SignatureCheckDisabled);
        }
        Self {
            rules_dir: rules_dir.into(),
            rules_url: rules_url.into(),
            remove_file: remove_file.into(),
            verifier,
            fetcher,
        }
    }

    pub fn cache_path(&self) -> PathBuf {
        self.rules_dir.join(RULES_CACHE_FILE)
    }

    pub fn fallback_path(&self) -> PathBuf {
        self.rules_dir.join(RULES_FALLBACK_FILE)
    }

    /// Resolve the rule set and the local removal policy.
    pub fn load(&self, mode: &LoadMode) -> Result<(RuleSet, RemovalPolicy)> {
        let rules = match mode {
            LoadMode::UseCached => self.load_cached()?,
            LoadMode::ForceRefresh => self.refresh()?,
            LoadMode::FromSuppliedDocument(supplied) => self.load_supplied(supplied)?,
        };
        info!("Using collection rules version {}", rules.version);

        let policy = RemovalPolicy::load(&self.remove_file);
        if !policy.is_empty() {
            warn!("WARNING: Excluding data from files");
        }
        Ok((rules, policy))
    }

    fn check_signature(&self, document: &Path, signature: &Path) -> Result<()> {
        match &self.verifier {
            Some(verifier) if !verifier.verify(document, signature) => {
                log_security_event(SecurityEvent::SignatureRejected {
                    path: document.display().to_string(),
                });
                Err(AgentError::SignatureInvalid(document.display().to_string()).into())
            }
            _ => Ok(()),
        }
    }

    fn load_cached(&self) -> Result<RuleSet> {
        for path in [self.cache_path(), self.fallback_path()] {
            debug!("Trying to read collection rules from {}", path.display());
            if !path.is_file() {
                continue;
            }
            self.check_signature(&path, &signature_path(&path))?;

            let text = fs::read_to_string(&path)
                .context(format!("Failed to read {}", path.display()))?;
            if text.trim().is_empty() {
                warn!("WARNING: {} was an empty file", path.display());
                continue;
            }
            let rules = RuleSet::from_json_str(&text, &path.display().to_string())?;
            debug!("Success reading collection rules from {}", path.display());
            return Ok(rules);
        }
        error!("Unable to download collection rules or read them from disk");
        Err(AgentError::ConfigurationUnavailable.into())
    }

    fn refresh(&self) -> Result<RuleSet> {
        let fetcher = self.fetcher.as_ref().ok_or(AgentError::OfflineRefresh)?;

        debug!("Attempting to download collection rules from {}", self.rules_url);
        let reply = fetcher.fetch(&self.rules_url)?;
        if reply.status != 200 {
            error!("Could not download dynamic configuration: {} {}", reply.status, reply.body);
            return Err(AgentError::RuleFetchFailed(reply.status).into());
        }

        let signature = if self.verifier.is_some() {
            let sig_url = format!("{}{}", self.rules_url, SIGNATURE_SUFFIX);
            let sig = fetcher.fetch(&sig_url)?;
            if sig.status != 200 {
                error!("Download of GPG signature failed: {}", sig.status);
                return Err(AgentError::RuleFetchFailed(sig.status).into());
            }
            Some(sig.body)
        } else {
            None
        };

        if let Some(signature) = &signature {
            self.verify_text(&reply.body, signature)?;
        }
        let rules = RuleSet::from_json_str(&reply.body, &self.rules_url)?;

        let cache = self.cache_path();
        write_atomic(&cache, reply.body.as_bytes(), PRIVATE_FILE_MODE)?;
        if let Some(signature) = &signature {
            write_atomic(&signature_path(&cache), signature.as_bytes(), PRIVATE_FILE_MODE)?;
        }
        debug!("Successfully downloaded collection rules to {}", cache.display());
        Ok(rules)
    }

    fn load_supplied(&self, supplied: &SuppliedRules) -> Result<RuleSet> {
        if self.verifier.is_some() {
            self.verify_text(&supplied.document, &supplied.signature)?;
        }
        RuleSet::from_json_str(&supplied.document, "supplied document")
    }

    /// Verify in-memory text by spooling it and its signature to disk.
    fn verify_text(&self, document: &str, signature: &str) -> Result<()> {
        let mut doc_file = tempfile::NamedTempFile::new().context("Failed to spool rules")?;
        doc_file.write_all(document.as_bytes())?;
        doc_file.flush()?;
        let mut sig_file = tempfile::Builder::new()
            .suffix(SIGNATURE_SUFFIX)
            .tempfile()
            .context("Failed to spool signature")?;
        sig_file.write_all(signature.as_bytes())?;
        sig_file.flush()?;
        self.check_signature(doc_file.path(), sig_file.path())
    }
}

fn signature_path(document: &Path) -> PathBuf {
    let mut name = document.as_os_str().to_owned();
    name.push(SIGNATURE_SUFFIX);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::api::{HttpReply, MockRuleFetcher};
    use crate::rules::signature::MockSignatureVerifier;
    use tempfile::TempDir;

    const RULES: &str = r#"{"version": "1.2.3", "specs": {}}"#;

    fn resolver(
        dir: &Path,
        verifier: Option<MockSignatureVerifier>,
        fetcher: Option<MockRuleFetcher>,
    ) -> RuleSetResolver {
        RuleSetResolver::new(
            dir,
            "https://example.com/v1/static/uploader.json",
            dir.join("remove.conf"),
            verifier.map(|v| Box::new(v) as Box<dyn SignatureVerifier>),
            fetcher.map(|f| Box::new(f) as Box<dyn RuleFetcher>),
        )
    }

    #[test]
    fn test_cache_then_fallback() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(RULES_CACHE_FILE), "").unwrap();
        fs::write(dir.path().join(RULES_FALLBACK_FILE), RULES).unwrap();

        let (rules, policy) = resolver(dir.path(), None, None)
            .load(&LoadMode::UseCached)
            .unwrap();
        assert_eq!(rules.version, "1.2.3");
        assert!(policy.is_empty());
    }

    #[test]
    fn test_nothing_usable() {
        let dir = TempDir::new().unwrap();
        let err = resolver(dir.path(), None, None)
            .load(&LoadMode::UseCached)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AgentError>(),
            Some(AgentError::ConfigurationUnavailable)
        ));
    }

    #[test]
    fn test_bad_cached_signature_is_fatal() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(RULES_CACHE_FILE), RULES).unwrap();
        let mut verifier = MockSignatureVerifier::new();
        verifier.expect_verify().return_const(false);

        let err = resolver(dir.path(), Some(verifier), None)
            .load(&LoadMode::UseCached)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AgentError>(),
            Some(AgentError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn test_refresh_persists_document_and_signature() {
        let dir = TempDir::new().unwrap();
        let mut fetcher = MockRuleFetcher::new();
        fetcher
            .expect_fetch()
            .withf(|url| url.ends_with("uploader.json"))
            .returning(|_| Ok(HttpReply::new(200, RULES)));
        fetcher
            .expect_fetch()
            .withf(|url| url.ends_with(".asc"))
            .returning(|_| Ok(HttpReply::new(200, "-----BEGIN PGP SIGNATURE-----")));
        let mut verifier = MockSignatureVerifier::new();
        verifier.expect_verify().times(1).return_const(true);

        let resolver = resolver(dir.path(), Some(verifier), Some(fetcher));
        let (rules, _) = resolver.load(&LoadMode::ForceRefresh).unwrap();
        assert_eq!(rules.version, "1.2.3");

        let cache = resolver.cache_path();
        assert_eq!(fs::read_to_string(&cache).unwrap(), RULES);
        assert_eq!(
            crate::utils::fs::file_mode(&cache).unwrap(),
            PRIVATE_FILE_MODE
        );
        assert!(signature_path(&cache).exists());
    }

    #[test]
    fn test_refresh_failures() {
        let dir = TempDir::new().unwrap();
        let err = resolver(dir.path(), None, None)
            .load(&LoadMode::ForceRefresh)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AgentError>(),
            Some(AgentError::OfflineRefresh)
        ));

        let mut fetcher = MockRuleFetcher::new();
        fetcher
            .expect_fetch()
            .returning(|_| Ok(HttpReply::new(404, "not found")));
        let err = resolver(dir.path(), None, Some(fetcher))
            .load(&LoadMode::ForceRefresh)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AgentError>(),
            Some(AgentError::RuleFetchFailed(404))
        ));
        assert!(!dir.path().join(RULES_CACHE_FILE).exists());
    }

    #[test]
    fn test_refresh_without_version_is_not_cached() {
        let dir = TempDir::new().unwrap();
        let mut fetcher = MockRuleFetcher::new();
        fetcher
            .expect_fetch()
            .returning(|_| Ok(HttpReply::new(200, r#"{"specs": {}}"#)));
        let err = resolver(dir.path(), None, Some(fetcher))
            .load(&LoadMode::ForceRefresh)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AgentError>(),
            Some(AgentError::MissingVersion)
        ));
        assert!(!dir.path().join(RULES_CACHE_FILE).exists());
    }

    #[test]
    fn test_supplied_document() {
        let supplied = SuppliedRules::from_json(
            r#"{"uploader.json": "{\"version\": \"9\"}", "sig": "sig",
                "branch_info": {"remote_branch": 1, "remote_leaf": 2}}"#,
        )
        .unwrap();
        assert_eq!(
            supplied.branch_info,
            Some(BranchInfo {
                remote_branch: 1,
                remote_leaf: 2
            })
        );

        let dir = TempDir::new().unwrap();
        let mut verifier = MockSignatureVerifier::new();
        verifier.expect_verify().times(1).return_const(true);
        let (rules, _) = resolver(dir.path(), Some(verifier), None)
            .load(&LoadMode::FromSuppliedDocument(supplied))
            .unwrap();
        assert_eq!(rules.version, "9");
    }

    #[test]
    fn test_supplied_document_missing_sig() {
        let err = SuppliedRules::from_json(r#"{"uploader.json": "{}"}"#).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AgentError>(),
            Some(AgentError::IncompleteSuppliedRules("sig"))
        ));
    }
}

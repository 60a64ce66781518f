//! Typed failures that change how the agent exits.
//!
//! Most plumbing errors travel as `anyhow::Error` with context attached.
//! The variants below are the ones callers match on: they decide the exit
//! code and the guidance printed to the operator.

use thiserror::Error;

use crate::constants::{ERROR_NOT_REGISTERED, ERROR_REGISTER_HINT};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Unable to download collection rules or read them from disk")]
    ConfigurationUnavailable,

    #[error("Unable to validate GPG signature of {0}")]
    SignatureInvalid(String),

    #[error("Unable to fetch collection rules: HTTP {0}")]
    RuleFetchFailed(u16),

    #[error("Could not find version in json")]
    MissingVersion,

    #[error("Collection rules in {source_name} are not valid JSON: {reason}")]
    InvalidRules { source_name: String, reason: String },

    #[error("Supplied rule document is incomplete: missing '{0}'")]
    IncompleteSuppliedRules(&'static str),

    #[error("Cannot refresh collection rules while running offline")]
    OfflineRefresh,

    #[error("Registration conflict persisted after regenerating the machine-id")]
    RegistrationConflict,

    #[error("Registration failed with HTTP status {0}")]
    RegistrationFailed(u16),

    #[error("{}", ERROR_NOT_REGISTERED)]
    NotRegistered,

    #[error("This machine was unregistered at {0}")]
    Unregistered(String),

    #[error("Could not reach the analysis service: {0}")]
    ServiceUnreachable(String),

    #[error("Archive has already been finalized")]
    ArchiveReused,

    #[error("Invalid removal file {path}: {reason}")]
    InvalidRemovalFile { path: String, reason: String },

    #[error("Could not determine branch information: {0}")]
    BranchInfoUnavailable(String),
}

impl AgentError {
    /// Operator-facing hint printed after the error itself: what to check
    /// or which flag to use.
    pub fn guidance(&self) -> &'static str {
        match self {
            AgentError::ConfigurationUnavailable => {
                "Check that .cache.json or .fallback.json in the rules directory \
                 (default /etc/insights-client) is readable, or fetch fresh rules \
                 with --update-collection-rules."
            }
            AgentError::SignatureInvalid(_) => {
                "Check the GPG keyring (default /etc/insights-client/redhattools.pub.gpg), \
                 or use --no-gpg to skip signature verification at your own risk."
            }
            AgentError::RuleFetchFailed(_) => {
                "Check collection_rules_url, the proxy settings and the credentials \
                 in the configuration file, or run with the cached rules."
            }
            AgentError::MissingVersion | AgentError::InvalidRules { .. } => {
                "Remove the damaged rules file from the rules directory \
                 (default /etc/insights-client) and run --update-collection-rules."
            }
            AgentError::IncompleteSuppliedRules(_) => {
                "A rule document on stdin or in --from-file needs 'uploader.json' \
                 and 'sig' entries."
            }
            AgentError::OfflineRefresh => {
                "Drop --offline to download collection rules, or run without \
                 --update-collection-rules to use the cached ones."
            }
            AgentError::RegistrationConflict => {
                "Use --reregister to discard the stored identity and try again."
            }
            AgentError::RegistrationFailed(_) => {
                "Check username and password (or the certificate at \
                 /etc/pki/consumer/cert.pem for CERT authentication) in the \
                 configuration file."
            }
            AgentError::NotRegistered => ERROR_REGISTER_HINT,
            AgentError::Unregistered(_) => "Use --register to register this machine again.",
            AgentError::ServiceUnreachable(_) => {
                "Check network access to base_url and the proxy settings \
                 (proxy, HTTPS_PROXY, NO_PROXY), or use --offline or --no-upload."
            }
            AgentError::ArchiveReused => {
                "Each collection needs a fresh archive; rerun the collection."
            }
            AgentError::InvalidRemovalFile { .. } => {
                "The removal file must be owned by root with mode 0600."
            }
            AgentError::BranchInfoUnavailable(_) => {
                "Check access to branch_info_url and, on Satellite 5 clients, that \
                 /etc/sysconfig/rhn/systemid is readable; --no-upload runs use defaults."
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn every_variant() -> Vec<AgentError> {
        vec![
            AgentError::ConfigurationUnavailable,
            AgentError::SignatureInvalid("rules.json".to_string()),
            AgentError::RuleFetchFailed(404),
            AgentError::MissingVersion,
            AgentError::InvalidRules {
                source_name: "cache".to_string(),
                reason: "EOF".to_string(),
            },
            AgentError::IncompleteSuppliedRules("sig"),
            AgentError::OfflineRefresh,
            AgentError::RegistrationConflict,
            AgentError::RegistrationFailed(401),
            AgentError::NotRegistered,
            AgentError::Unregistered("2026-01-02T03:04:05".to_string()),
            AgentError::ServiceUnreachable("timed out".to_string()),
            AgentError::ArchiveReused,
            AgentError::InvalidRemovalFile {
                path: "/etc/insights-client/remove.conf".to_string(),
                reason: "mode 0644".to_string(),
            },
            AgentError::BranchInfoUnavailable("HTTP 500".to_string()),
        ]
    }

    #[test]
    fn test_not_registered_message() {
        let err = AgentError::NotRegistered;
        assert_eq!(err.to_string(), ERROR_NOT_REGISTERED);
        assert_eq!(err.guidance(), ERROR_REGISTER_HINT);
    }

    #[test]
    fn test_missing_version_message() {
        assert_eq!(
            AgentError::MissingVersion.to_string(),
            "Could not find version in json"
        );
        assert!(AgentError::MissingVersion
            .guidance()
            .contains("--update-collection-rules"));
    }

    #[test]
    fn test_every_failure_has_guidance() {
        for err in every_variant() {
            let hint = err.guidance();
            assert!(!hint.trim().is_empty(), "{:?}", err);
            assert!(!hint.contains("  "), "{:?}: {}", err, hint);
        }
    }

    #[test]
    fn test_rule_and_registration_hints_name_what_to_check() {
        assert!(AgentError::ConfigurationUnavailable.guidance().contains(".fallback.json"));
        assert!(AgentError::RegistrationFailed(401).guidance().contains("password"));
        assert!(AgentError::ServiceUnreachable(String::new()).guidance().contains("proxy"));
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = AgentError::RuleFetchFailed(500).into();
        let err = err.context("refreshing collection rules");
        assert!(matches!(
            err.downcast_ref::<AgentError>(),
            Some(AgentError::RuleFetchFailed(500))
        ));
    }
}

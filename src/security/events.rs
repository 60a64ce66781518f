//! Security-relevant events and their audit logging.

/// Events that are always logged, whatever the configured verbosity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityEvent {
    /// An archive path escaped the staging tree
    PathValidationFailed { path: String, reason: String },

    /// A denylisted command was requested by the rule set
    CommandDenied { command: String },

    /// A file that should be private is readable by others
    PermissiveFile { path: String, mode: u32 },

    /// A rule document failed signature verification
    SignatureRejected { path: String },

    /// Signature verification was switched off
    SignatureCheckDisabled,
}

/// Log a security event.
pub fn log_security_event(event: SecurityEvent) {
    use log::warn;

    match event {
        SecurityEvent::PathValidationFailed { path, reason } => {
            warn!(
                "Security: Path validation failed for '{}': {}",
                path, reason
            );
        }
        SecurityEvent::CommandDenied { command } => {
            warn!("Security: Refusing to run denylisted command '{}'", command);
        }
        SecurityEvent::PermissiveFile { path, mode } => {
            warn!(
                "Security: '{}' has mode {:o}; it should be readable by root only (600)",
                path, mode
            );
        }
        SecurityEvent::SignatureRejected { path } => {
            warn!("Security: GPG signature verification failed for '{}'", path);
        }
        SecurityEvent::SignatureCheckDisabled => {
            warn!("Security: GPG signature verification is disabled; collection rules are unverified");
        }
    }
}

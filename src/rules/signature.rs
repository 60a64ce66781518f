use log::{debug, error};
use std::path::{Path, PathBuf};

use crate::utils::process::{probe_timeout, run_program};

/// Detached-signature check over a document on disk.
#[cfg_attr(test, mockall::automock)]
pub trait SignatureVerifier {
    fn verify(&self, document: &Path, signature: &Path) -> bool;
}

/// Verifies with `gpg` against a dedicated keyring.
#[derive(Debug, Clone)]
pub struct GpgVerifier {
    program: String,
    keyring: PathBuf,
}

impl GpgVerifier {
    pub fn new(keyring: impl Into<PathBuf>) -> Self {
        Self {
            program: "gpg".to_string(),
            keyring: keyring.into(),
        }
    }

    /// Use a different executable (e.g. `gpg2`).
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }
}

impl SignatureVerifier for GpgVerifier {
    fn verify(&self, document: &Path, signature: &Path) -> bool {
        debug!("Verifying GPG signature of {}", document.display());
        let keyring = self.keyring.to_string_lossy();
        let signature = signature.to_string_lossy();
        let document_arg = document.to_string_lossy();
        let args = [
            "--no-default-keyring",
            "--keyring",
            keyring.as_ref(),
            "--verify",
            signature.as_ref(),
            document_arg.as_ref(),
        ];
        match run_program(&self.program, &args, probe_timeout()) {
            Ok(out) => {
                debug!("gpg status {}: {}", out.status, out.stderr.trim());
                out.success()
            }
            Err(e) => {
                error!("Could not run {}: {:#}", self.program, e);
                false
            }
        }
    }
}

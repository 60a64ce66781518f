//! Retrying upload of a finalized bundle.
//!
//! ```text
//! attempt n ──▶ 201 ─────────────▶ Success (write .lastupload)
//!           ├─▶ 412 ─────────────▶ FatalUnregistered (write .unregistered, no retry)
//!           └─▶ other / transport ─▶ n < max ? sleep, attempt n+1 : FatalOther
//! ```

use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::api::{HttpReply, UploadTransport};
use crate::constants::{
    DEFAULT_CONFIG_FILE, DEFAULT_UPLOAD_RETRIES, ERROR_ALL_UPLOADS_FAILED, UPLOAD_RETRY_DELAY_SECS,
};
use crate::registration::StateStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Success,
    /// Worth another attempt; carries the reason
    Retryable(String),
    /// The service says this machine was unregistered at the given time
    FatalUnregistered(String),
    /// Gave up; last HTTP status if one was received
    FatalOther(Option<u16>),
}

impl UploadOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UploadOutcome::Success)
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait Sleeper {
    fn sleep(&self, delay: Duration);
}

/// Blocks the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, delay: Duration) {
        std::thread::sleep(delay);
    }
}

/// How many attempts to make and how long to wait between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_UPLOAD_RETRIES,
            delay: Duration::from_secs(UPLOAD_RETRY_DELAY_SECS),
        }
    }
}

/// Classify one reply from the upload endpoint.
pub fn classify_reply(reply: &HttpReply) -> UploadOutcome {
    match reply.status {
        201 => UploadOutcome::Success,
        412 => {
            let since = reply
                .json()
                .and_then(|j| j.get("unregistered_at").and_then(|v| v.as_str().map(str::to_string)))
                .unwrap_or_else(|| "412, but no unreg_date or message".to_string());
            UploadOutcome::FatalUnregistered(since)
        }
        status => UploadOutcome::Retryable(format!("HTTP {}", status)),
    }
}

/// Log what the operator should check for a failed reply.
pub fn log_failure_guidance(reply: &HttpReply) {
    info!("HTTP Status Code: {}", reply.status);
    info!("HTTP Response Text: {}", reply.body);
    if let Some(message) = reply.message() {
        info!("HTTP Response Message: {}", message);
    }
    match reply.status {
        401 => {
            error!("Authorization Required.");
            error!("Please ensure correct credentials in {}", DEFAULT_CONFIG_FILE);
        }
        402 => match reply.message() {
            Some(message) => error!("{}", message),
            None => error!("Got 402 but no message"),
        },
        403 => error!("Please enable Insights on the Satellite server to continue."),
        412 => match reply.message() {
            Some(message) => error!("{}", message),
            None => error!("This machine has been unregistered."),
        },
        _ => {}
    }
}

pub struct UploadCoordinator {
    transport: Box<dyn UploadTransport>,
    sleeper: Box<dyn Sleeper>,
    policy: RetryPolicy,
    state: StateStore,
    log_file: PathBuf,
}

impl UploadCoordinator {
    pub fn new(
        transport: Box<dyn UploadTransport>,
        sleeper: Box<dyn Sleeper>,
        policy: RetryPolicy,
        state: StateStore,
        log_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            transport,
            sleeper,
            policy,
            state,
            log_file: log_file.into(),
        }
    }

    /// Upload `bundle` for `target_id`, retrying per the policy.
    pub fn upload(
        &self,
        bundle: &Path,
        mime_type: &str,
        collection_secs: u64,
        target_id: &str,
    ) -> UploadOutcome {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_status = None;

        for attempt in 1..=max_attempts {
            let outcome = match self
                .transport
                .upload(bundle, mime_type, collection_secs, target_id)
            {
                Ok(reply) => {
                    last_status = Some(reply.status);
                    let outcome = classify_reply(&reply);
                    if !outcome.is_success() {
                        log_failure_guidance(&reply);
                    }
                    outcome
                }
                Err(e) => {
                    last_status = None;
                    UploadOutcome::Retryable(format!("{:#}", e))
                }
            };

            match outcome {
                UploadOutcome::Success => {
                    if let Err(e) = self.state.mark_last_upload() {
                        warn!("Could not record last upload: {:#}", e);
                    }
                    info!("Upload completed successfully!");
                    return UploadOutcome::Success;
                }
                UploadOutcome::FatalUnregistered(since) => {
                    if let Err(e) = self.state.mark_unregistered(Some(&since)) {
                        warn!("Could not record unregistration: {:#}", e);
                    }
                    return UploadOutcome::FatalUnregistered(since);
                }
                UploadOutcome::Retryable(reason) => {
                    error!(
                        "Upload attempt {} of {} failed! Reason: {}",
                        attempt, max_attempts, reason
                    );
                    if attempt < max_attempts {
                        info!("Waiting {} seconds then retrying", self.policy.delay.as_secs());
                        self.sleeper.sleep(self.policy.delay);
                    }
                }
                UploadOutcome::FatalOther(status) => return UploadOutcome::FatalOther(status),
            }
        }

        error!("{}", ERROR_ALL_UPLOADS_FAILED);
        error!(
            "Please see {} for additional information",
            self.log_file.display()
        );
        debug!("Last upload status: {:?}", last_status);
        UploadOutcome::FatalOther(last_status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::api::MockUploadTransport;
    use anyhow::anyhow;
    use mockall::Sequence;
    use tempfile::TempDir;

    fn coordinator(
        transport: MockUploadTransport,
        sleeper: MockSleeper,
        attempts: usize,
        state_dir: &Path,
    ) -> UploadCoordinator {
        UploadCoordinator::new(
            Box::new(transport),
            Box::new(sleeper),
            RetryPolicy {
                max_attempts: attempts,
                delay: Duration::from_secs(300),
            },
            StateStore::new(state_dir),
            "/var/log/insights-client/insights-client.log",
        )
    }

    #[test]
    fn test_classify_reply() {
        assert_eq!(classify_reply(&HttpReply::new(201, "{}")), UploadOutcome::Success);
        assert_eq!(
            classify_reply(&HttpReply::new(412, r#"{"unregistered_at": "2017-01-01"}"#)),
            UploadOutcome::FatalUnregistered("2017-01-01".into())
        );
        assert!(matches!(
            classify_reply(&HttpReply::new(503, "")),
            UploadOutcome::Retryable(_)
        ));
    }

    #[test]
    fn test_success_after_retries() {
        let dir = TempDir::new().unwrap();
        let mut seq = Sequence::new();
        let mut transport = MockUploadTransport::new();
        for status in [500u16, 500, 201] {
            transport
                .expect_upload()
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_, _, _, _| Ok(HttpReply::new(status, "{}")));
        }
        let mut sleeper = MockSleeper::new();
        sleeper
            .expect_sleep()
            .withf(|d| *d == Duration::from_secs(300))
            .times(2)
            .return_const(());

        let outcome = coordinator(transport, sleeper, 3, dir.path()).upload(
            Path::new("/tmp/bundle.tar.gz"),
            "application/gzip",
            12,
            "machine",
        );
        assert_eq!(outcome, UploadOutcome::Success);
        assert!(StateStore::new(dir.path()).last_upload().is_some());
    }

    #[test]
    fn test_transport_errors_exhaust_retries() {
        let dir = TempDir::new().unwrap();
        let mut transport = MockUploadTransport::new();
        transport
            .expect_upload()
            .times(2)
            .returning(|_, _, _, _| Err(anyhow!("connection refused")));
        let mut sleeper = MockSleeper::new();
        sleeper.expect_sleep().times(1).return_const(());

        let outcome = coordinator(transport, sleeper, 2, dir.path()).upload(
            Path::new("/tmp/bundle.tar.gz"),
            "application/gzip",
            1,
            "machine",
        );
        assert_eq!(outcome, UploadOutcome::FatalOther(None));
    }

    #[test]
    fn test_unregistered_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let mut transport = MockUploadTransport::new();
        transport.expect_upload().times(1).returning(|_, _, _, _| {
            Ok(HttpReply::new(
                412,
                r#"{"message": "unregistered", "unregistered_at": "2017-02-03T04:05:06"}"#,
            ))
        });
        let mut sleeper = MockSleeper::new();
        sleeper.expect_sleep().times(0);

        let outcome = coordinator(transport, sleeper, 5, dir.path()).upload(
            Path::new("/tmp/bundle.tar.gz"),
            "application/gzip",
            1,
            "machine",
        );
        assert_eq!(
            outcome,
            UploadOutcome::FatalUnregistered("2017-02-03T04:05:06".into())
        );
        assert_eq!(
            StateStore::new(dir.path()).record(),
            crate::registration::RegistrationRecord::Unregistered("2017-02-03T04:05:06".into())
        );
    }
}

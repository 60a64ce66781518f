//! Integration tests for the upload retry loop.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tempfile::TempDir;

use insights_agent::cloud::{
    HttpReply, RetryPolicy, Sleeper, UploadCoordinator, UploadOutcome, UploadTransport,
};
use insights_agent::registration::{RegistrationRecord, StateStore};

/// Replies with a scripted status per attempt; `0` stands for a transport error.
struct ScriptedTransport {
    statuses: RefCell<VecDeque<u16>>,
    attempts: Rc<RefCell<usize>>,
}

impl UploadTransport for ScriptedTransport {
    fn upload(
        &self,
        _bundle: &Path,
        _mime_type: &str,
        _collection_secs: u64,
        _target_id: &str,
    ) -> Result<HttpReply> {
        *self.attempts.borrow_mut() += 1;
        match self.statuses.borrow_mut().pop_front() {
            Some(0) | None => Err(anyhow!("connection reset")),
            Some(412) => Ok(HttpReply::new(
                412,
                r#"{"unregistered_at": "2026-01-02T03:04:05", "message": "unregistered"}"#,
            )),
            Some(status) => Ok(HttpReply::new(status, "")),
        }
    }
}

struct CountingSleeper {
    sleeps: Rc<RefCell<Vec<Duration>>>,
}

impl Sleeper for CountingSleeper {
    fn sleep(&self, delay: Duration) {
        self.sleeps.borrow_mut().push(delay);
    }
}

struct Harness {
    coordinator: UploadCoordinator,
    attempts: Rc<RefCell<usize>>,
    sleeps: Rc<RefCell<Vec<Duration>>>,
    state: StateStore,
    _dir: TempDir,
}

fn harness(statuses: &[u16], max_attempts: usize) -> Harness {
    let dir = TempDir::new().unwrap();
    let state = StateStore::new(dir.path());
    let attempts = Rc::new(RefCell::new(0));
    let sleeps = Rc::new(RefCell::new(Vec::new()));

    let coordinator = UploadCoordinator::new(
        Box::new(ScriptedTransport {
            statuses: RefCell::new(statuses.iter().copied().collect()),
            attempts: Rc::clone(&attempts),
        }),
        Box::new(CountingSleeper {
            sleeps: Rc::clone(&sleeps),
        }),
        RetryPolicy {
            max_attempts,
            delay: Duration::from_secs(180),
        },
        state.clone(),
        dir.path().join("agent.log"),
    );

    Harness {
        coordinator,
        attempts,
        sleeps,
        state,
        _dir: dir,
    }
}

fn upload(h: &Harness) -> UploadOutcome {
    h.coordinator
        .upload(Path::new("/tmp/bundle.tar.gz"), "application/x-gzip", 12, "machine-id")
}

#[test]
fn test_success_on_third_attempt() {
    let h = harness(&[500, 500, 201], 3);

    assert_eq!(upload(&h), UploadOutcome::Success);
    assert_eq!(*h.attempts.borrow(), 3);
    assert_eq!(h.sleeps.borrow().len(), 2);
    assert!(h.sleeps.borrow().iter().all(|d| *d == Duration::from_secs(180)));
    assert!(h.state.last_upload().is_some());
}

#[test]
fn test_all_attempts_fail() {
    let h = harness(&[500, 500, 500], 3);

    assert_eq!(upload(&h), UploadOutcome::FatalOther(Some(500)));
    assert_eq!(*h.attempts.borrow(), 3);
    assert_eq!(h.sleeps.borrow().len(), 2);
    assert!(h.state.last_upload().is_none());
}

#[test]
fn test_unregistered_stops_immediately() {
    let h = harness(&[412, 201], 3);

    match upload(&h) {
        UploadOutcome::FatalUnregistered(since) => assert_eq!(since, "2026-01-02T03:04:05"),
        other => panic!("Expected FatalUnregistered, got {:?}", other),
    }
    assert_eq!(*h.attempts.borrow(), 1);
    assert!(h.sleeps.borrow().is_empty());
    assert!(matches!(h.state.record(), RegistrationRecord::Unregistered(_)));
}

#[test]
fn test_transport_error_is_retried() {
    let h = harness(&[0, 201], 2);

    assert_eq!(upload(&h), UploadOutcome::Success);
    assert_eq!(*h.attempts.borrow(), 2);
    assert_eq!(h.sleeps.borrow().len(), 1);
}

#[test]
fn test_single_attempt_never_sleeps() {
    let h = harness(&[503], 1);

    assert_eq!(upload(&h), UploadOutcome::FatalOther(Some(503)));
    assert!(h.sleeps.borrow().is_empty());
}

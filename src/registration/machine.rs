use anyhow::Result;
use log::{debug, error, info, warn};

use super::state::{RegistrationRecord, StateStore};
use crate::cloud::api::{HttpReply, NewSystem, RegistrationApi, RemoteStatus};
use crate::cloud::upload::log_failure_guidance;
use crate::error::AgentError;
use crate::targets::IdentityStore;

/// Local record and remote answer, as shown by `--status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub local: RegistrationRecord,
    pub remote: RemoteStatus,
}

impl StatusReport {
    pub fn is_registered(&self) -> bool {
        self.remote == RemoteStatus::Registered
    }

    pub fn messages(&self) -> Vec<String> {
        let remote = match &self.remote {
            RemoteStatus::Registered => "Insights API confirms registration.".to_string(),
            RemoteStatus::NeverRegistered => {
                "Insights API says this machine is NOT registered.".to_string()
            }
            RemoteStatus::Unregistered(since) => {
                format!("Insights API says this machine was unregistered at {}", since)
            }
            RemoteStatus::Unreachable => {
                "Insights API could not be reached to confirm registration status.".to_string()
            }
        };
        vec![self.local.to_string(), remote]
    }
}

/// Outcome of a register request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    AlreadyRegistered,
    Registered {
        machine_id: String,
        account_number: Option<String>,
    },
}

/// Keeps the local markers in line with what the service reports.
pub struct RegistrationStateMachine {
    api: Box<dyn RegistrationApi>,
    state: StateStore,
    identity: IdentityStore,
    hostname: String,
    display_name: Option<String>,
}

impl RegistrationStateMachine {
    pub fn new(
        api: Box<dyn RegistrationApi>,
        state: StateStore,
        identity: IdentityStore,
        hostname: impl Into<String>,
        display_name: Option<String>,
    ) -> Self {
        Self {
            api,
            state,
            identity,
            hostname: hostname.into(),
            display_name,
        }
    }

    /// Apply a remote answer to the local markers.
    pub fn reconcile(&self, remote: &RemoteStatus) -> Result<()> {
        match remote {
            RemoteStatus::Registered => {
                if !self.state.is_registered() {
                    self.state.mark_registered()?;
                }
                self.state.clear_unregistered()?;
            }
            RemoteStatus::Unregistered(since) => self.state.mark_unregistered(Some(since))?,
            RemoteStatus::NeverRegistered => self.state.clear()?,
            RemoteStatus::Unreachable => {
                debug!("Registration status unknown, keeping local markers");
            }
        }
        Ok(())
    }

    /// Ask the service and reconcile.
    pub fn check(&self) -> Result<StatusReport> {
        let local = self.state.record();
        let machine_id = self.identity.machine_id()?;
        let remote = self.api.system_status(&machine_id);
        self.reconcile(&remote)?;
        Ok(StatusReport { local, remote })
    }

    /// Fail unless the service confirms this machine is registered.
    pub fn ensure_registered(&self) -> Result<()> {
        let report = self.check()?;
        match report.remote {
            RemoteStatus::Registered => Ok(()),
            RemoteStatus::NeverRegistered => Err(AgentError::NotRegistered.into()),
            RemoteStatus::Unregistered(since) => Err(AgentError::Unregistered(since).into()),
            RemoteStatus::Unreachable => Err(AgentError::ServiceUnreachable(
                "registration status could not be confirmed".to_string(),
            )
            .into()),
        }
    }

    fn post_system(&self, machine_id: String) -> Result<HttpReply> {
        let branch = self.api.branch_info().map_err(|e| {
            error!("Could not determine branch information, exiting!");
            e
        })?;
        let system = NewSystem {
            machine_id,
            remote_branch: branch.remote_branch,
            remote_leaf: branch.remote_leaf,
            hostname: self.hostname.clone(),
            display_name: self.display_name.clone(),
        };
        let reply = self.api.create_system(&system)?;
        debug!("POST System status: {}", reply.status);
        Ok(reply)
    }

    /// Register this machine unless it already is.
    ///
    /// A 409 means the machine-id is taken: a fresh one is generated and the
    /// request retried exactly once.
    pub fn register(&self) -> Result<Registration> {
        if self.state.is_registered() {
            info!("This host has already been registered.");
            return Ok(Registration::AlreadyRegistered);
        }
        let machine_id = self.identity.machine_id()?;
        if self.api.system_status(&machine_id) == RemoteStatus::Registered {
            info!("This host has already been registered.");
            self.state.mark_registered()?;
            return Ok(Registration::AlreadyRegistered);
        }

        self.state.clear_unregistered()?;
        let mut reply = self.post_system(machine_id)?;
        if reply.status == 409 {
            warn!("Machine-id already in use, generating a new one");
            let fresh = self.identity.regenerate_machine_id()?;
            reply = self.post_system(fresh)?;
            if reply.status == 409 {
                return Err(AgentError::RegistrationConflict.into());
            }
        }
        if !(200..300).contains(&reply.status) {
            log_failure_guidance(&reply);
            return Err(AgentError::RegistrationFailed(reply.status).into());
        }

        self.state.mark_registered()?;
        let body = reply.json();
        let field = |name: &str| {
            body.as_ref()
                .and_then(|b| b.get(name))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        let machine_id = match field("machine_id") {
            Some(id) => id,
            None => self.identity.machine_id()?,
        };
        let account_number = field("account_number");
        match &account_number {
            Some(account) => info!(
                "You successfully registered {} to account {}.",
                machine_id, account
            ),
            None => info!("Successfully registered {}", self.hostname),
        }
        Ok(Registration::Registered {
            machine_id,
            account_number,
        })
    }

    /// Forget every local trace of registration, then register afresh.
    pub fn force_reregister(&self) -> Result<Registration> {
        self.state.clear()?;
        self.identity.delete_machine_id()?;
        self.register()
    }

    pub fn unregister(&self) -> Result<()> {
        let machine_id = self.identity.machine_id()?;
        let reply = self.api.delete_system(&machine_id).map_err(|e| {
            error!("Could not unregister this system");
            e
        })?;
        debug!("DELETE System status: {}", reply.status);
        self.state.mark_unregistered(None)?;
        info!("Successfully unregistered from the Red Hat Insights Service");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::api::MockRegistrationApi;
    use crate::models::BranchInfo;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        state: StateStore,
        identity: IdentityStore,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        Fixture {
            state: StateStore::new(dir.path()),
            identity: IdentityStore::new(dir.path()),
            _dir: dir,
        }
    }

    fn machine(api: MockRegistrationApi, f: &Fixture) -> RegistrationStateMachine {
        RegistrationStateMachine::new(
            Box::new(api),
            f.state.clone(),
            f.identity.clone(),
            "web01.example.com",
            None,
        )
    }

    #[test]
    fn test_reconcile_follows_remote() {
        let f = fixture();
        let sm = machine(MockRegistrationApi::new(), &f);

        sm.reconcile(&RemoteStatus::Registered).unwrap();
        assert!(f.state.is_registered());

        sm.reconcile(&RemoteStatus::Unreachable).unwrap();
        assert!(f.state.is_registered());

        sm.reconcile(&RemoteStatus::Unregistered("2017-01-01".into())).unwrap();
        assert_eq!(
            f.state.record(),
            RegistrationRecord::Unregistered("2017-01-01".into())
        );

        sm.reconcile(&RemoteStatus::NeverRegistered).unwrap();
        assert_eq!(f.state.record(), RegistrationRecord::Unknown);
    }

    #[test]
    fn test_ensure_registered_errors() {
        let f = fixture();
        let mut api = MockRegistrationApi::new();
        api.expect_system_status()
            .return_const(RemoteStatus::NeverRegistered);
        let err = machine(api, &f).ensure_registered().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AgentError>(),
            Some(AgentError::NotRegistered)
        ));
    }

    #[test]
    fn test_register_is_noop_when_remote_registered() {
        let f = fixture();
        let mut api = MockRegistrationApi::new();
        api.expect_system_status()
            .return_const(RemoteStatus::Registered);
        api.expect_create_system().times(0);

        let result = machine(api, &f).register().unwrap();
        assert_eq!(result, Registration::AlreadyRegistered);
        assert!(f.state.is_registered());
    }

    #[test]
    fn test_conflict_regenerates_identity_once() {
        let f = fixture();
        let original = f.identity.machine_id().unwrap();

        let mut api = MockRegistrationApi::new();
        api.expect_system_status()
            .return_const(RemoteStatus::NeverRegistered);
        api.expect_branch_info()
            .times(2)
            .returning(|| Ok(BranchInfo::default()));
        let first = original.clone();
        let mut calls = 0;
        api.expect_create_system().times(2).returning(move |system| {
            calls += 1;
            if calls == 1 {
                assert_eq!(system.machine_id, first);
                Ok(HttpReply::new(409, "{}"))
            } else {
                assert_ne!(system.machine_id, first);
                Ok(HttpReply::new(
                    201,
                    format!(
                        r#"{{"machine_id": "{}", "account_number": "540155"}}"#,
                        system.machine_id
                    ),
                ))
            }
        });

        let result = machine(api, &f).register().unwrap();
        match result {
            Registration::Registered {
                machine_id,
                account_number,
            } => {
                assert_ne!(machine_id, original);
                assert_eq!(machine_id, f.identity.machine_id().unwrap());
                assert_eq!(account_number.as_deref(), Some("540155"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(f.state.is_registered());
    }

    #[test]
    fn test_second_conflict_is_fatal() {
        let f = fixture();
        let mut api = MockRegistrationApi::new();
        api.expect_system_status()
            .return_const(RemoteStatus::NeverRegistered);
        api.expect_branch_info()
            .returning(|| Ok(BranchInfo::default()));
        api.expect_create_system()
            .times(2)
            .returning(|_| Ok(HttpReply::new(409, "{}")));

        let err = machine(api, &f).register().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AgentError>(),
            Some(AgentError::RegistrationConflict)
        ));
        assert!(!f.state.is_registered());
    }

    #[test]
    fn test_unregister_writes_marker() {
        let f = fixture();
        f.state.mark_registered().unwrap();
        let mut api = MockRegistrationApi::new();
        api.expect_delete_system()
            .times(1)
            .returning(|_| Ok(HttpReply::new(204, "")));

        machine(api, &f).unregister().unwrap();
        assert!(matches!(
            f.state.record(),
            RegistrationRecord::Unregistered(_)
        ));
    }

    #[test]
    fn test_force_reregister_replaces_identity() {
        let f = fixture();
        f.state.mark_registered().unwrap();
        let before = f.identity.machine_id().unwrap();

        let mut api = MockRegistrationApi::new();
        api.expect_system_status()
            .return_const(RemoteStatus::NeverRegistered);
        api.expect_branch_info()
            .returning(|| Ok(BranchInfo::default()));
        api.expect_create_system()
            .times(1)
            .returning(|_| Ok(HttpReply::new(201, "{}")));

        machine(api, &f).force_reregister().unwrap();
        assert_ne!(f.identity.machine_id().unwrap(), before);
        assert!(f.state.is_registered());
    }
}

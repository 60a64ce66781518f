//! Registration of this machine with the analysis service.
//!
//! Local markers mirror the last known remote state. They are reconciled
//! against the service before every run that is not offline, never trusted
//! on their own.

mod machine;
mod state;

pub use machine::{Registration, RegistrationStateMachine, StatusReport};
pub use state::{timestamp_now, RegistrationRecord, StateStore};

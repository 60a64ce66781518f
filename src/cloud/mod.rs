//! Talking to the analysis service.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────────┐
//! │ ProxyResolver│────▶│ HttpSession  │────▶│ InsightsService  │
//! └──────────────┘     └──────────────┘     └────────┬─────────┘
//!                                                    │ implements
//!                       ┌────────────────────────────┼──────────────────┐
//!                       │                            │                  │
//!               ┌───────▼────────┐         ┌─────────▼──────┐   ┌───────▼──────┐
//!               │ RegistrationApi│         │ UploadTransport│   │ RuleFetcher  │
//!               └────────────────┘         └─────────┬──────┘   └──────────────┘
//!                                                    │
//!                                          ┌─────────▼─────────┐
//!                                          │ UploadCoordinator │
//!                                          └───────────────────┘
//! ```
//!
//! The traits are the seams: registration, rule refresh and upload retry
//! logic only ever see them, never `reqwest` directly.

/// Service endpoints behind small traits
pub mod api;

/// HTTP session construction (TLS, proxy, authentication)
pub mod client;

/// Outbound proxy selection and `NO_PROXY` handling
pub mod proxy;

/// Upload retry loop and response classification
pub mod upload;

pub use api::{HttpReply, InsightsService, NewSystem, RegistrationApi, RemoteStatus, RuleFetcher, UploadTransport};
pub use client::{create_http_session, HttpSession};
pub use proxy::{resolve, resolve_from_env, ProxyDecision};
pub use upload::{RetryPolicy, Sleeper, ThreadSleeper, UploadCoordinator, UploadOutcome};

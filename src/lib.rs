//! # insights-agent
//!
//! A host-side agent that collects configuration data from a Linux system,
//! and optionally from its docker images and containers, packages it into a
//! compressed archive and uploads it to a remote analysis service.
//!
//! ## Overview
//!
//! A run follows the same pipeline for every target:
//!
//! 1. Resolve the versioned, signed collection rule set and the local
//!    removal policy.
//! 2. Expand the rules into concrete file and command tasks.
//! 3. Collect the tasks with bounded parallelism, filtering and masking
//!    every line.
//! 4. Stage the results in a private archive directory, add metadata and
//!    compress it into a single bundle.
//! 5. Upload the bundle with retries, keeping registration state in sync
//!    with what the service reports.
//!
//! ## Features
//!
//! - **Signed rules**: downloaded rule documents are GPG-verified before
//!   they are cached
//! - **Bounded collection**: commands run with a timeout and a denylist,
//!   output is spooled to disk line by line
//! - **Removal policy**: files, commands, line patterns and redaction
//!   keywords excluded by the operator
//! - **Container analysis**: images and containers are mounted and
//!   collected into a group archive with linked metadata
//! - **Proxy aware**: explicit proxies, `HTTPS_PROXY` and `NO_PROXY`
//!
//! ## Usage
//!
//! ```no_run
//! use insights_agent::collectors::collector::{Collector, TaskCollector};
//! use insights_agent::collectors::expander::TaskExpander;
//! use insights_agent::collectors::session::{collect_target, CollectionPlan};
//! use insights_agent::archive::Compressor;
//! use insights_agent::config::{RemovalPolicy, RuleSet};
//! use insights_agent::models::{BranchInfo, Target};
//! use insights_agent::targets::HostRoot;
//! use std::sync::Arc;
//!
//! # fn main() -> anyhow::Result<()> {
//! let text = std::fs::read_to_string("/etc/insights-client/.cache.json")?;
//! let rules = RuleSet::from_json_str(&text, "cache")?;
//! let policy = RemovalPolicy::default();
//! let branch_info = BranchInfo::default();
//! let plan = CollectionPlan {
//!     rules: &rules,
//!     policy: &policy,
//!     branch_info: &branch_info,
//!     compressor: Compressor::Gz,
//!     log_file: None,
//!     staging_base: None,
//! };
//!
//! let collector: Arc<dyn TaskCollector> = Arc::new(Collector::default());
//! let host = Target::host("web01");
//! let mut archive = collect_target(
//!     &plan,
//!     &TaskExpander::default(),
//!     collector,
//!     &host,
//!     "machine-id",
//!     "web01",
//!     Box::new(HostRoot),
//! )?;
//! let bundle = archive.finalize(None)?;
//! println!("Created {}", bundle.display());
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`rules`]: Obtaining and verifying the collection rule set
//! - [`collectors`]: Rule expansion and task collection
//! - [`archive`]: Staging, metadata and bundle creation
//! - [`cloud`]: HTTP session, proxy selection and uploads
//! - [`registration`]: Registration state kept in sync with the service
//! - [`targets`]: Hosts, docker images and containers, and their identities
//! - [`security`]: Masking, redaction and archive path validation
//! - [`config`]: Agent configuration, rule documents and removal policy
//!
//! ## Safety
//!
//! `unsafe` is limited to single libc calls (`geteuid`, `killpg`) in
//! [`privileges`] and [`collectors::collector`].

/// Staging directories, metadata and compressed bundles
pub mod archive;

/// Command-line interface definitions and argument parsing
pub mod cli;

/// HTTP session, proxy selection, service API and uploads
pub mod cloud;

/// Rule expansion and task collection
pub mod collectors;

/// Agent configuration, rule documents and removal policy
pub mod config;

/// Application-wide constants
pub mod constants;

/// Typed failures that decide exit codes and guidance
pub mod error;

/// Core data models shared across modules
pub mod models;

/// Root privilege checks
pub mod privileges;

/// Registration markers and the registration state machine
pub mod registration;

/// Collection rule resolution and signature verification
pub mod rules;

/// Masking, redaction and archive path validation
pub mod security;

/// Analysis targets: host, docker images and containers
pub mod targets;

/// Filesystem and process helpers
pub mod utils;

#[cfg(test)]
pub mod test_utils;

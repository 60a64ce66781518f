//! Shared helpers for on-disk state and external programs.
//!
//! ## Components
//!
//! - **fs**: atomic, permission-restricted writes for markers and caches
//! - **process**: blocking execution of probes and tooling (`gpg`, `docker`)
//!
//! ## Example
//!
//! ```no_run
//! use insights_agent::utils::fs::write_atomic;
//! use std::path::Path;
//!
//! # fn example() -> anyhow::Result<()> {
//! write_atomic(Path::new("/etc/insights-client/.lastupload"), b"", 0o600)?;
//! # Ok(())
//! # }
//! ```

/// Atomic file replacement and permission helpers
pub mod fs;

/// Execution of short-lived external programs
pub mod process;

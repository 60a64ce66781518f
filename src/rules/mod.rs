//! Obtaining the collection rule set.
//!
//! Rules come from the local cache (falling back to the bundled copy), a
//! fresh signed download, or a document supplied on stdin or in a file.
//! Whatever the source, a document without a `version` is rejected and a
//! bad signature is fatal.

mod resolver;
mod signature;

pub use resolver::{LoadMode, RuleSetResolver, SuppliedRules};
pub use signature::{GpgVerifier, SignatureVerifier};

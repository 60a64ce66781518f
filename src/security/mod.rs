//! Security utilities and validation functions.
//!
//! This module provides security-related functionality including:
//! - Archive path validation to keep collected content inside the staging tree
//! - Content normalization that masks credentials line by line
//! - Archive obfuscation (keywords, host name, addresses)
//! - Security event logging

pub mod events;
pub mod normalizer;
pub mod path_validator;
pub mod redactor;

pub use events::{log_security_event, SecurityEvent};
pub use normalizer::{scrub_credentials, ContentNormalizer};
pub use path_validator::validate_archive_path;
pub use redactor::{KeywordRedactor, RedactionReport, Redactor};

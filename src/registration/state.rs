//! Local registration markers.
//!
//! Each marker is a small file in the state directory holding an ISO-8601
//! timestamp. Writes are write-then-rename so an interrupted run never
//! leaves a half-written marker behind.

use anyhow::Result;
use chrono::Local;
use log::debug;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::constants::{
    LAST_UPLOAD_MARKER, PRIVATE_FILE_MODE, REGISTERED_MARKER, UNREGISTERED_MARKER,
};
use crate::utils::fs::{remove_if_exists, write_atomic};

/// Last known registration state, as recorded on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationRecord {
    Unknown,
    Registered(String),
    Unregistered(String),
}

impl fmt::Display for RegistrationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationRecord::Unknown => write!(f, "System is NOT registered."),
            RegistrationRecord::Registered(since) => {
                write!(f, "System is registered. Registered at {}", since)
            }
            RegistrationRecord::Unregistered(since) => {
                write!(f, "System is NOT registered. Unregistered at {}", since)
            }
        }
    }
}

pub fn timestamp_now() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn marker(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn read_marker(&self, name: &str) -> Option<String> {
        fs::read_to_string(self.marker(name))
            .ok()
            .map(|s| s.lines().next().unwrap_or("").trim().to_string())
    }

    pub fn is_registered(&self) -> bool {
        self.marker(REGISTERED_MARKER).is_file()
    }

    /// Current record; an unregistered marker takes precedence.
    pub fn record(&self) -> RegistrationRecord {
        if let Some(since) = self.read_marker(UNREGISTERED_MARKER) {
            return RegistrationRecord::Unregistered(since);
        }
        match self.read_marker(REGISTERED_MARKER) {
            Some(since) => RegistrationRecord::Registered(since),
            None => RegistrationRecord::Unknown,
        }
    }

    /// Record a registration now and clear any unregistered marker.
    pub fn mark_registered(&self) -> Result<()> {
        write_atomic(
            &self.marker(REGISTERED_MARKER),
            timestamp_now().as_bytes(),
            PRIVATE_FILE_MODE,
        )?;
        remove_if_exists(&self.marker(UNREGISTERED_MARKER))?;
        debug!("Wrote registration marker");
        Ok(())
    }

    /// Record an unregistration at `since` (now when absent).
    pub fn mark_unregistered(&self, since: Option<&str>) -> Result<()> {
        remove_if_exists(&self.marker(REGISTERED_MARKER))?;
        let since = since.map(str::to_string).unwrap_or_else(timestamp_now);
        write_atomic(
            &self.marker(UNREGISTERED_MARKER),
            since.as_bytes(),
            PRIVATE_FILE_MODE,
        )?;
        debug!("Wrote unregistration marker ({})", since);
        Ok(())
    }

    pub fn clear_unregistered(&self) -> Result<()> {
        remove_if_exists(&self.marker(UNREGISTERED_MARKER))?;
        Ok(())
    }

    /// Forget both registration markers.
    pub fn clear(&self) -> Result<()> {
        remove_if_exists(&self.marker(REGISTERED_MARKER))?;
        remove_if_exists(&self.marker(UNREGISTERED_MARKER))?;
        Ok(())
    }

    pub fn mark_last_upload(&self) -> Result<()> {
        write_atomic(
            &self.marker(LAST_UPLOAD_MARKER),
            timestamp_now().as_bytes(),
            PRIVATE_FILE_MODE,
        )
    }

    pub fn last_upload(&self) -> Option<String> {
        self.read_marker(LAST_UPLOAD_MARKER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_record_transitions() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        assert_eq!(store.record(), RegistrationRecord::Unknown);

        store.mark_registered().unwrap();
        assert!(matches!(store.record(), RegistrationRecord::Registered(_)));
        assert!(store.is_registered());

        store.mark_unregistered(Some("2016-10-01T00:00:00")).unwrap();
        assert_eq!(
            store.record(),
            RegistrationRecord::Unregistered("2016-10-01T00:00:00".to_string())
        );
        assert!(!store.is_registered());

        store.clear().unwrap();
        assert_eq!(store.record(), RegistrationRecord::Unknown);
    }

    #[test]
    fn test_markers_are_private() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        store.mark_last_upload().unwrap();
        assert!(store.last_upload().is_some());
        assert_eq!(
            crate::utils::fs::file_mode(&dir.path().join(LAST_UPLOAD_MARKER)).unwrap(),
            PRIVATE_FILE_MODE
        );
    }

    #[test]
    fn test_record_display() {
        let record = RegistrationRecord::Registered("2024-01-01T00:00:00".into());
        assert!(record.to_string().contains("Registered at 2024-01-01T00:00:00"));
    }
}

//! Archive staging, metadata and bundle creation.
//!
//! An [`Archive`] owns a private temporary directory. Collected entries are
//! written into it, metadata is added, and [`Archive::finalize`] produces a
//! single tarball. Finalization happens once; the staging directory is
//! removed on drop unless the caller retains it.

mod bundle;
mod compressor;
pub mod metadata;

pub use bundle::Archive;
pub use compressor::Compressor;

/// Whether staging and bundle should be kept after the run.
///
/// Anything that means "the operator wants the local copy" keeps it.
pub fn should_keep_archive(
    keep_archive: bool,
    offline: bool,
    no_upload: bool,
    no_tar_file: bool,
    obfuscate: bool,
) -> bool {
    keep_archive || offline || no_upload || no_tar_file || obfuscate
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keep_policy() {
        assert!(!should_keep_archive(false, false, false, false, false));
        assert!(should_keep_archive(true, false, false, false, false));
        assert!(should_keep_archive(false, true, false, false, false));
        assert!(should_keep_archive(false, false, false, false, true));
    }
}

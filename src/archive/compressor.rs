use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Compression applied to the bundle tarball.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Compressor {
    Gz,
    Bzip2,
    Xz,
    None,
}

impl fmt::Display for Compressor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Compressor::Gz => write!(f, "gz"),
            Compressor::Bzip2 => write!(f, "bzip2"),
            Compressor::Xz => write!(f, "xz"),
            Compressor::None => write!(f, "none"),
        }
    }
}

impl Compressor {
    /// Guess the compressor from a bundle's file name.
    pub fn from_bundle_name(name: &str) -> Option<Compressor> {
        [Compressor::Gz, Compressor::Bzip2, Compressor::Xz, Compressor::None]
            .into_iter()
            .find(|c| name.ends_with(c.extension()))
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Compressor::Gz => ".tar.gz",
            Compressor::Bzip2 => ".tar.bz2",
            Compressor::Xz => ".tar.xz",
            Compressor::None => ".tar",
        }
    }

    /// MIME type sent with the uploaded bundle.
    pub fn mime_type(&self) -> &'static str {
        match self {
            Compressor::Gz => "application/x-gzip",
            Compressor::Bzip2 => "application/x-bzip2",
            Compressor::Xz => "application/x-xz",
            Compressor::None => "application/x-tar",
        }
    }

    /// Write `source_dir` as a tarball rooted at `top_level` into `dest`.
    pub fn write_tarball(&self, source_dir: &Path, top_level: &str, dest: &Path) -> Result<()> {
        let file = File::create(dest)
            .context(format!("Failed to create bundle {}", dest.display()))?;

        match self {
            Compressor::Gz => {
                let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
                append_tree(encoder, source_dir, top_level)?.finish()?;
            }
            Compressor::Bzip2 => {
                let encoder = bzip2::write::BzEncoder::new(file, bzip2::Compression::default());
                append_tree(encoder, source_dir, top_level)?.finish()?;
            }
            Compressor::Xz => {
                let encoder = xz2::write::XzEncoder::new(file, 6);
                append_tree(encoder, source_dir, top_level)?.finish()?;
            }
            Compressor::None => {
                append_tree(file, source_dir, top_level)?.sync_all()?;
            }
        }
        Ok(())
    }
}

fn append_tree<W: Write>(writer: W, source_dir: &Path, top_level: &str) -> Result<W> {
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);
    builder
        .append_dir_all(top_level, source_dir)
        .context(format!("Failed to add {} to tarball", source_dir.display()))?;
    builder.into_inner().context("Failed to finish tarball")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    fn staged_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("etc")).unwrap();
        std::fs::write(dir.path().join("etc/hosts"), b"127.0.0.1 localhost\n").unwrap();
        dir
    }

    fn entry_names<R: Read>(reader: R) -> Vec<String> {
        let mut archive = tar::Archive::new(reader);
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_gz_tarball_layout() {
        let tree = staged_tree();
        let out = TempDir::new().unwrap();
        let dest = out.path().join("bundle.tar.gz");

        Compressor::Gz.write_tarball(tree.path(), "insights-host", &dest).unwrap();

        let names = entry_names(flate2::read::GzDecoder::new(File::open(&dest).unwrap()));
        assert!(names.contains(&"insights-host/etc/hosts".to_string()));
    }

    #[test]
    fn test_plain_tar_and_xz() {
        let tree = staged_tree();
        let out = TempDir::new().unwrap();

        let tar_path = out.path().join("bundle.tar");
        Compressor::None.write_tarball(tree.path(), "top", &tar_path).unwrap();
        assert!(entry_names(File::open(&tar_path).unwrap()).contains(&"top/etc/hosts".to_string()));

        let xz_path = out.path().join("bundle.tar.xz");
        Compressor::Xz.write_tarball(tree.path(), "top", &xz_path).unwrap();
        let names = entry_names(xz2::read::XzDecoder::new(File::open(&xz_path).unwrap()));
        assert!(names.contains(&"top/etc/hosts".to_string()));
    }

    #[test]
    fn test_extensions_and_display() {
        assert_eq!(Compressor::Bzip2.extension(), ".tar.bz2");
        assert_eq!(Compressor::None.to_string(), "none");
        assert_eq!(Compressor::Gz.mime_type(), "application/x-gzip");
    }

    #[test]
    fn test_from_bundle_name() {
        assert_eq!(Compressor::from_bundle_name("insights-h-1.tar.xz"), Some(Compressor::Xz));
        assert_eq!(Compressor::from_bundle_name("a.tar"), Some(Compressor::None));
        assert_eq!(Compressor::from_bundle_name("a.zip"), None);
    }
}

//! Integration tests for archive staging and bundling.

use std::fs::{self, File};
use std::path::PathBuf;

use tempfile::TempDir;

use insights_agent::archive::{should_keep_archive, Archive, Compressor};
use insights_agent::error::AgentError;
use insights_agent::models::{ArchiveEntry, Payload, TaskKind};
use insights_agent::security::KeywordRedactor;

fn entry(path: &str, body: &str) -> ArchiveEntry {
    ArchiveEntry {
        kind: TaskKind::File,
        archive_path: PathBuf::from(path),
        payload: Payload::Text(body.to_string()),
        exit_status: None,
    }
}

fn bundle_entries(bundle: &std::path::Path) -> Vec<(String, Vec<u8>)> {
    use std::io::Read;
    let decoder = flate2::read::GzDecoder::new(File::open(bundle).unwrap());
    let mut archive = tar::Archive::new(decoder);
    archive
        .entries()
        .unwrap()
        .map(|e| {
            let mut e = e.unwrap();
            let name = e.path().unwrap().to_string_lossy().into_owned();
            let mut body = Vec::new();
            e.read_to_end(&mut body).unwrap();
            (name, body)
        })
        .collect()
}

#[test]
fn test_finalize_twice_is_rejected() {
    let base = TempDir::new().unwrap();
    let mut archive = Archive::new_in(base.path(), "web01", Compressor::Gz).unwrap();
    archive.add(entry("/etc/hosts", "127.0.0.1 localhost\n")).unwrap();

    archive.finalize(None).unwrap();
    let err = archive.finalize(None).unwrap_err();
    assert!(matches!(err.downcast_ref::<AgentError>(), Some(AgentError::ArchiveReused)));

    let err = archive.add(entry("/etc/motd", "hi\n")).unwrap_err();
    assert!(matches!(err.downcast_ref::<AgentError>(), Some(AgentError::ArchiveReused)));
}

#[test]
fn test_bundle_is_rooted_at_archive_name() {
    let base = TempDir::new().unwrap();
    let mut archive = Archive::new_in(base.path(), "web01", Compressor::Gz).unwrap();
    archive.add(entry("/etc/hosts", "127.0.0.1 localhost\n")).unwrap();
    archive
        .add(entry("insights_commands/uname_-a", "Linux web01\n"))
        .unwrap();
    let name = archive.archive_name().to_string();
    assert!(name.starts_with("insights-web01-"));

    let bundle = archive.finalize(None).unwrap();
    assert!(bundle.to_string_lossy().ends_with(".tar.gz"));

    let entries = bundle_entries(&bundle);
    let hosts = entries
        .iter()
        .find(|(n, _)| n == &format!("{}/etc/hosts", name))
        .expect("hosts in bundle");
    assert_eq!(hosts.1, b"127.0.0.1 localhost\n");
    assert!(entries
        .iter()
        .any(|(n, _)| n == &format!("{}/insights_commands/uname_-a", name)));
}

#[test]
fn test_colliding_paths_get_suffixes() {
    let base = TempDir::new().unwrap();
    let mut archive = Archive::new_in(base.path(), "web01", Compressor::None).unwrap();

    let first = archive.add(entry("/etc/hosts", "one\n")).unwrap();
    let second = archive.add(entry("/etc/hosts", "two\n")).unwrap();

    assert_ne!(first, second);
    assert!(second.ends_with("etc/hosts_1"));
    assert_eq!(fs::read_to_string(first).unwrap(), "one\n");
    assert_eq!(fs::read_to_string(second).unwrap(), "two\n");
}

#[test]
fn test_escaping_paths_are_refused() {
    let base = TempDir::new().unwrap();
    let mut archive = Archive::new_in(base.path(), "web01", Compressor::None).unwrap();
    assert!(archive.add(entry("../../etc/passwd", "x")).is_err());
}

#[test]
fn test_obfuscation_before_compression() {
    let base = TempDir::new().unwrap();
    let mut archive = Archive::new_in(base.path(), "web01", Compressor::Gz).unwrap();
    archive
        .add(entry("/etc/hosts", "192.168.1.20 db01 project-falcon\n"))
        .unwrap();
    let name = archive.archive_name().to_string();

    let redactor = KeywordRedactor::new(vec!["project-falcon".to_string()], false);
    let bundle = archive.finalize(Some(&redactor)).unwrap();

    let entries = bundle_entries(&bundle);
    let (_, hosts) = entries
        .iter()
        .find(|(n, _)| n == &format!("{}/etc/hosts", name))
        .unwrap();
    let hosts = String::from_utf8_lossy(hosts);
    assert!(!hosts.contains("192.168.1.20"));
    assert!(!hosts.contains("project-falcon"));
    assert!(hosts.contains("keyword0"));
}

#[test]
fn test_delete_removes_staging() {
    let base = TempDir::new().unwrap();
    let mut archive = Archive::new_in(base.path(), "web01", Compressor::None).unwrap();
    let bundle = archive.finalize(None).unwrap();
    assert!(bundle.exists());

    archive.delete().unwrap();
    assert!(!bundle.exists());
    assert_eq!(fs::read_dir(base.path()).unwrap().count(), 0);
}

#[test]
fn test_keep_policy() {
    assert!(!should_keep_archive(false, false, false, false, false));
    assert!(should_keep_archive(true, false, false, false, false));
    assert!(should_keep_archive(false, true, false, false, false));
    assert!(should_keep_archive(false, false, false, false, true));
}

//! Metadata files every archive carries.

use anyhow::{Context, Result};
use log::debug;
use std::path::Path;

use super::bundle::Archive;
use crate::config::{MetaSpec, RuleSet};
use crate::models::{BranchInfo, Target};

/// Add target type, branch info and target id, in that order.
pub fn add_target_metadata(
    archive: &mut Archive,
    rules: &RuleSet,
    target: &Target,
    branch_info: &BranchInfo,
    target_id: &str,
) -> Result<()> {
    archive.add_metadata(
        rules.meta_path(MetaSpec::AnalysisTarget),
        target.kind.as_str().as_bytes(),
    )?;

    let branch_json =
        serde_json::to_vec(branch_info).context("Failed to serialize branch info")?;
    archive.add_metadata(rules.meta_path(MetaSpec::BranchInfo), &branch_json)?;

    archive.add_metadata(rules.meta_path(MetaSpec::MachineId), target_id.as_bytes())?;
    Ok(())
}

/// Embed the agent's own log, as it stands when collection finishes.
pub fn add_uploader_log(archive: &mut Archive, rules: &RuleSet, log_file: &Path) -> Result<()> {
    match std::fs::read(log_file) {
        Ok(contents) => {
            archive.add_metadata(rules.meta_path(MetaSpec::UploaderLog), &contents)?;
        }
        Err(e) => debug!("Not embedding log {}: {}", log_file.display(), e),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::Compressor;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_metadata_written_at_default_paths() {
        let base = TempDir::new().unwrap();
        let rules = RuleSet::from_json_str(r#"{"version": "1", "specs": {}}"#, "test").unwrap();
        let mut archive = Archive::new_in(base.path(), "h", Compressor::None).unwrap();

        add_target_metadata(
            &mut archive,
            &rules,
            &Target::host("h"),
            &BranchInfo::default(),
            "dc194312-8cdd-4e75-8cf1-2094bf666f45",
        )
        .unwrap();

        let root = archive.archive_dir();
        assert_eq!(
            fs::read_to_string(root.join("insights_data/analysis_target")).unwrap(),
            "host"
        );
        assert_eq!(
            fs::read_to_string(root.join("branch_info")).unwrap(),
            r#"{"remote_branch":-1,"remote_leaf":-1}"#
        );
        assert_eq!(
            fs::read_to_string(root.join("insights_data/machine-id")).unwrap(),
            "dc194312-8cdd-4e75-8cf1-2094bf666f45"
        );
    }

    #[test]
    fn test_uploader_log_embedded_when_present() {
        let base = TempDir::new().unwrap();
        let log = base.path().join("agent.log");
        fs::write(&log, "INFO started\n").unwrap();
        let rules = RuleSet::from_json_str(r#"{"version": "1"}"#, "test").unwrap();
        let mut archive = Archive::new_in(base.path(), "h", Compressor::None).unwrap();

        add_uploader_log(&mut archive, &rules, &log).unwrap();
        add_uploader_log(&mut archive, &rules, &base.path().join("missing.log")).unwrap();

        let embedded = archive
            .archive_dir()
            .join("insights_data/insights_logs/insights.log");
        assert_eq!(fs::read_to_string(embedded).unwrap(), "INFO started\n");
    }
}

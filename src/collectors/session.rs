use anyhow::Result;
use log::{debug, info, warn};
use std::path::Path;
use std::sync::Arc;

use super::collector::{collect_tasks, TaskCollector};
use super::expander::{TargetContext, TaskExpander};
use crate::archive::{metadata, Archive, Compressor};
use crate::config::{RemovalPolicy, RuleSet};
use crate::models::{BranchInfo, Target};
use crate::targets::MountpointProvider;

/// Everything shared by the per-target collections of one run.
pub struct CollectionPlan<'a> {
    pub rules: &'a RuleSet,
    pub policy: &'a RemovalPolicy,
    pub branch_info: &'a BranchInfo,
    pub compressor: Compressor,
    /// Embedded into the archive when set.
    pub log_file: Option<&'a Path>,
    /// Parent of the staging directory; the system temp dir when `None`.
    pub staging_base: Option<&'a Path>,
}

/// Expand, collect and stage one target into a fresh, not yet finalized
/// archive. The mount is closed before returning, whatever the outcome.
pub fn collect_target(
    plan: &CollectionPlan<'_>,
    expander: &TaskExpander,
    collector: Arc<dyn TaskCollector>,
    target: &Target,
    target_id: &str,
    archive_name: &str,
    mut mount: Box<dyn MountpointProvider>,
) -> Result<Archive> {
    let staged = stage_target(plan, expander, collector, target, target_id, archive_name, mount.root());
    if let Err(e) = mount.close() {
        warn!("Could not release mount for {}: {:#}", target.name, e);
    }
    staged
}

fn stage_target(
    plan: &CollectionPlan<'_>,
    expander: &TaskExpander,
    collector: Arc<dyn TaskCollector>,
    target: &Target,
    target_id: &str,
    archive_name: &str,
    mount_root: &Path,
) -> Result<Archive> {
    info!("Collecting {} {}", target.kind, target.name);
    let ctx = TargetContext::new(target, mount_root);
    let tasks = expander.expand(plan.rules, plan.policy, &ctx);
    let entries = collect_tasks(collector, tasks)?;

    let mut archive = match plan.staging_base {
        Some(base) => Archive::new_in(base, archive_name, plan.compressor)?,
        None => Archive::new(archive_name, plan.compressor)?,
    };

    let mut added = 0usize;
    for entry in entries {
        if entry.is_missing_file() {
            debug!("Skipping missing file {}", entry.archive_path.display());
            continue;
        }
        let archive_path = entry.archive_path.clone();
        match archive.add(entry) {
            Ok(_) => added += 1,
            Err(e) => warn!("Skipping {}: {:#}", archive_path.display(), e),
        }
    }
    info!("Staged {} entries for {}", added, target.name);

    metadata::add_target_metadata(&mut archive, plan.rules, target, plan.branch_info, target_id)?;
    if let Some(log_file) = plan.log_file {
        metadata::add_uploader_log(&mut archive, plan.rules, log_file)?;
    }
    Ok(archive)
}

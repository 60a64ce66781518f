//! Rule expansion: turns a rule set into concrete collection tasks.
//!
//! ```text
//!  RuleEntry ──► placeholders ──► removal check ──► wildcard / glob /
//!                                                   pre-command / family
//!                                                         │
//!                                         CollectionTask ◄┘ (one per match)
//! ```
//!
//! Expansion is deterministic for a given rule set, policy and system
//! state: directory listings and glob matches are sorted and rules are
//! visited in a fixed order. It does not deduplicate archive paths; the
//! archive resolves collisions.

use log::{debug, warn};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::mangle::mangle_command;
use super::special::{expand_family, LiveSystem, SystemProbe};
use crate::config::{RemovalPolicy, RuleEntry, RuleSet};
use crate::constants::{
    COMMANDS_DIR, DEFAULT_COMMAND_TIMEOUT_SECS, NOT_FOUND_EXIT_STATUS, PLACEHOLDER_CONTAINER_NAME,
    PLACEHOLDER_EXPANDED_FILE, PLACEHOLDER_IMAGE_NAME, PLACEHOLDER_MOUNT_POINT,
};
use crate::models::{CollectionTask, Target, TargetKind};
use crate::utils::process::run_shell;

/// Runs pre-commands that produce argument lists for command rules.
#[cfg_attr(test, mockall::automock)]
pub trait PreCommandRunner: Send + Sync {
    /// Output lines of `command_line`, or `None` when it cannot be run.
    fn run(&self, command_line: &str) -> Option<Vec<String>>;
}

/// Runs pre-commands through `/bin/sh`, as rule pipelines require.
#[derive(Debug, Clone)]
pub struct ShellPreCommandRunner {
    timeout: Duration,
}

impl ShellPreCommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for ShellPreCommandRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS))
    }
}

impl PreCommandRunner for ShellPreCommandRunner {
    fn run(&self, command_line: &str) -> Option<Vec<String>> {
        match run_shell(command_line, self.timeout) {
            Ok(out) if out.status == NOT_FOUND_EXIT_STATUS => {
                debug!("Pre-command not found: {}", command_line);
                None
            }
            Ok(out) if out.timed_out() => {
                warn!("Pre-command timed out, expanding to nothing: {}", command_line);
                Some(Vec::new())
            }
            Ok(out) => Some(
                out.stdout
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
            Err(e) => {
                debug!("Pre-command failed to start: {}: {:#}", command_line, e);
                None
            }
        }
    }
}

/// Where a target's filesystem is visible and what it is called.
#[derive(Debug, Clone, Copy)]
pub struct TargetContext<'a> {
    pub target: &'a Target,
    pub mount_root: &'a Path,
}

impl<'a> TargetContext<'a> {
    pub fn new(target: &'a Target, mount_root: &'a Path) -> Self {
        Self { target, mount_root }
    }

    fn substitute(&self, text: &str) -> String {
        let mount = self.mount_root.to_string_lossy();
        let mount = mount.trim_end_matches('/');
        let mut out = text.replace(PLACEHOLDER_MOUNT_POINT, mount);
        match self.target.kind {
            TargetKind::DockerImage => {
                out = out.replace(PLACEHOLDER_IMAGE_NAME, &self.target.name);
            }
            TargetKind::DockerContainer => {
                out = out.replace(PLACEHOLDER_CONTAINER_NAME, &self.target.name);
            }
            TargetKind::Host => {}
        }
        out
    }

    /// Path as seen from inside the target, for archive naming.
    fn inner_path(&self, path: &str) -> String {
        let root = self.mount_root.to_string_lossy();
        let root = root.trim_end_matches('/');
        if !root.is_empty() {
            if let Some(rest) = path.strip_prefix(root) {
                if rest.starts_with('/') {
                    return rest.to_string();
                }
            }
        }
        path.to_string()
    }
}

pub struct TaskExpander {
    pre_commands: Box<dyn PreCommandRunner>,
    probe: Box<dyn SystemProbe>,
    original_style: bool,
}

impl Default for TaskExpander {
    fn default() -> Self {
        Self::new(Box::new(ShellPreCommandRunner::default()), Box::new(LiveSystem::new()))
    }
}

impl TaskExpander {
    pub fn new(pre_commands: Box<dyn PreCommandRunner>, probe: Box<dyn SystemProbe>) -> Self {
        Self {
            pre_commands,
            probe,
            original_style: false,
        }
    }

    /// Live expander whose pre-commands are bounded by `command_timeout`.
    pub fn live(command_timeout: Duration) -> Self {
        Self::new(
            Box::new(ShellPreCommandRunner::new(command_timeout)),
            Box::new(LiveSystem::new()),
        )
    }

    /// Expand the flat `files`/`commands` lists even when `specs` exist.
    pub fn with_original_style(mut self, original_style: bool) -> Self {
        self.original_style = original_style;
        self
    }

    /// Expand every rule applicable to the context's target.
    pub fn expand(
        &self,
        rules: &RuleSet,
        policy: &RemovalPolicy,
        ctx: &TargetContext<'_>,
    ) -> Vec<CollectionTask> {
        let mut tasks = Vec::new();

        match rules.legacy_rules(self.original_style) {
            Some(legacy) => {
                for entry in legacy.files.iter().chain(legacy.commands.iter()) {
                    tasks.extend(self.expand_entry(entry, rules, policy, ctx, true));
                }
            }
            None => {
                for entry in rules.entries_for(ctx.target.kind) {
                    tasks.extend(self.expand_entry(entry, rules, policy, ctx, false));
                }
            }
        }

        if !policy.line_exclude_patterns.is_empty() {
            for task in &mut tasks {
                task.line_exclude_patterns
                    .extend(policy.line_exclude_patterns.iter().cloned());
            }
        }

        debug!(
            "Expanded rules into {} tasks for {} {}",
            tasks.len(),
            ctx.target.kind,
            ctx.target.name
        );
        tasks
    }

    fn expand_entry(
        &self,
        entry: &RuleEntry,
        rules: &RuleSet,
        policy: &RemovalPolicy,
        ctx: &TargetContext<'_>,
        legacy: bool,
    ) -> Vec<CollectionTask> {
        match entry {
            RuleEntry::File {
                path,
                line_patterns,
                archive_name,
            } => {
                let resolved = ctx.substitute(path);
                if excluded_match(policy, ctx, &resolved) || policy.excludes_file(path) {
                    return Vec::new();
                }
                let archive_name = if legacy { None } else { archive_name.as_deref() };
                if !resolved.contains('*') {
                    return vec![file_task(ctx, &resolved, archive_name, line_patterns)];
                }
                expand_wildcard(&resolved)
                    .into_iter()
                    .filter(|source| !excluded_match(policy, ctx, source))
                    .map(|source| file_task(ctx, &source, archive_name, line_patterns))
                    .collect()
            }
            RuleEntry::Glob {
                glob_pattern,
                line_patterns,
                archive_name,
            } => {
                let resolved = ctx.substitute(glob_pattern);
                expand_glob(&resolved)
                    .into_iter()
                    .filter(|source| !excluded_match(policy, ctx, source))
                    .map(|source| file_task(ctx, &source, archive_name.as_deref(), line_patterns))
                    .collect()
            }
            RuleEntry::Command {
                command_line,
                line_patterns,
                pre_command_alias,
                archive_name,
            } => {
                let resolved = ctx.substitute(command_line);
                if policy.excludes_command(command_line) || policy.excludes_command(&resolved) {
                    warn!("WARNING: Skipping command {}", resolved);
                    return Vec::new();
                }
                let archive_dir = if legacy {
                    PathBuf::from(COMMANDS_DIR)
                } else {
                    command_archive_dir(archive_name.as_deref())
                };

                let command_lines = match pre_command_alias {
                    Some(alias) => self.expand_pre_command(&resolved, alias, rules),
                    None if ctx.target.is_host() => expand_family(&resolved, self.probe.as_ref())
                        .unwrap_or_else(|| vec![resolved.clone()]),
                    None => vec![resolved.clone()],
                };

                command_lines
                    .into_iter()
                    .map(|line| {
                        let archive_path = archive_dir.join(mangle_command(&line));
                        let mut task = CollectionTask::command(line, archive_path);
                        task.line_include_patterns = line_patterns.clone();
                        task
                    })
                    .collect()
            }
        }
    }

    fn expand_pre_command(&self, command_line: &str, alias: &str, rules: &RuleSet) -> Vec<String> {
        let pre_command = match rules.pre_commands.get(alias) {
            Some(pre_command) => pre_command,
            None => {
                debug!("Unknown pre-command alias '{}' for {}", alias, command_line);
                return Vec::new();
            }
        };
        match self.pre_commands.run(pre_command) {
            Some(args) => args
                .into_iter()
                .map(|arg| format!("{} {}", command_line, arg))
                .collect(),
            None => Vec::new(),
        }
    }
}

/// Removal check against both the mounted and the in-target form of a path.
fn excluded_match(policy: &RemovalPolicy, ctx: &TargetContext<'_>, source: &str) -> bool {
    let excluded = policy.excludes_file(source) || policy.excludes_file(&ctx.inner_path(source));
    if excluded {
        warn!("WARNING: Skipping file {}", source);
    }
    excluded
}

fn file_task(
    ctx: &TargetContext<'_>,
    source: &str,
    archive_name: Option<&str>,
    line_patterns: &[String],
) -> CollectionTask {
    let inner = ctx.inner_path(source);
    let archive_path = match archive_name {
        Some(name) => ctx
            .substitute(name)
            .replace(PLACEHOLDER_EXPANDED_FILE, &inner),
        None => inner,
    };
    let mut task = CollectionTask::file(source, PathBuf::from(archive_path));
    task.line_include_patterns = line_patterns.to_vec();
    task
}

/// Directory that command output lands in: the parent of the rule's
/// archive name, or `insights_commands/`.
fn command_archive_dir(archive_name: Option<&str>) -> PathBuf {
    archive_name
        .and_then(|name| Path::new(name).parent())
        .filter(|parent| !parent.as_os_str().is_empty() && parent != &Path::new("/"))
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(COMMANDS_DIR))
}

/// Expand `dir/pattern` where the basename is a regular expression matched
/// against the start of each directory entry name.
fn expand_wildcard(path: &str) -> Vec<String> {
    let path = Path::new(path);
    let (dir, pattern) = match (path.parent(), path.file_name()) {
        (Some(dir), Some(name)) => (dir, name.to_string_lossy()),
        _ => return Vec::new(),
    };
    let regex = match Regex::new(&format!("^(?:{})", pattern)) {
        Ok(regex) => regex,
        Err(e) => {
            warn!("Invalid wildcard pattern '{}': {}", pattern, e);
            return Vec::new();
        }
    };
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Cannot list {}: {}", dir.display(), e);
            return Vec::new();
        }
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| regex.is_match(name))
        .collect();
    names.sort();
    names
        .into_iter()
        .map(|name| dir.join(name).to_string_lossy().into_owned())
        .collect()
}

fn expand_glob(pattern: &str) -> Vec<String> {
    match glob::glob(pattern) {
        Ok(paths) => {
            let mut matches: Vec<String> = paths
                .filter_map(|p| p.ok())
                .map(|p| p.to_string_lossy().into_owned())
                .collect();
            matches.sort();
            matches
        }
        Err(e) => {
            warn!("Invalid glob pattern '{}': {}", pattern, e);
            Vec::new()
        }
    }
}

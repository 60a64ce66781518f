//! Container discovery and the group metadata of a container-mode run.
//!
//! Everything here shells out to the `docker` CLI. Parsing is kept in pure
//! functions so it can be tested without a daemon.

use anyhow::{bail, Result};
use log::{debug, warn};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

use crate::models::{Target, TargetKind};
use crate::targets::identity::derived_id;
use crate::utils::process::{probe_timeout, run_program};

/// A link from one system in the group to another.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct SystemLink {
    pub system_id: String,
    #[serde(rename = "type")]
    pub link_type: String,
}

impl SystemLink {
    fn new(system_id: impl Into<String>, link_type: &str) -> Self {
        Self {
            system_id: system_id.into(),
            link_type: link_type.to_string(),
        }
    }
}

/// One finalized per-target archive, as described in `metadata.json`.
#[derive(Debug, Clone)]
pub struct TargetArchive {
    pub target: Target,
    pub system_id: String,
    pub display_name: String,
}

#[derive(Serialize, Debug)]
struct SystemEntry {
    links: Vec<SystemLink>,
    #[serde(skip_serializing_if = "Option::is_none")]
    docker_id: Option<String>,
    display_name: String,
    product: &'static str,
    system_id: String,
    #[serde(rename = "type")]
    system_type: &'static str,
}

#[derive(Serialize, Debug)]
struct GroupMetadata {
    display_name: String,
    product: &'static str,
    system_id: String,
    systems: Vec<SystemEntry>,
}

const PRODUCT: &str = "Docker";

fn docker_lines(args: &[&str]) -> Result<String> {
    let out = run_program("docker", args, probe_timeout())?;
    if !out.success() {
        bail!("docker {} failed: {}", args.join(" "), out.stderr.trim());
    }
    Ok(out.stdout)
}

/// Unique, non-empty lines in first-seen order.
fn unique_ids(output: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if !ids.iter().any(|i| i == line) {
            ids.push(line.to_string());
        }
    }
    ids
}

/// Every image, then every container, optionally narrowed to one id.
pub fn discover_targets(only: Option<&str>) -> Result<Vec<Target>> {
    let images = unique_ids(&docker_lines(&["images", "--quiet", "--no-trunc"])?);
    let containers = unique_ids(&docker_lines(&["ps", "--all", "--quiet", "--no-trunc"])?);
    let targets = select_targets(images, containers, only);
    debug!("Discovered {} container targets", targets.len());
    Ok(targets)
}

fn select_targets(images: Vec<String>, containers: Vec<String>, only: Option<&str>) -> Vec<Target> {
    let wanted = |id: &String| only.map_or(true, |o| o == id);
    images
        .into_iter()
        .filter(|id| wanted(id))
        .map(Target::image)
        .chain(containers.into_iter().filter(|id| wanted(id)).map(Target::container))
        .collect()
}

/// Human name for a docker target: first repo tag of an image, the
/// container name without its leading `/`, or the id itself.
pub fn display_name(target: &Target) -> String {
    let inspect = match run_program("docker", &["inspect", &target.name], probe_timeout()) {
        Ok(out) if out.success() => out.stdout,
        Ok(out) => {
            debug!("docker inspect {} failed: {}", target.name, out.stderr.trim());
            return target.name.clone();
        }
        Err(e) => {
            debug!("docker inspect {}: {:#}", target.name, e);
            return target.name.clone();
        }
    };
    display_name_from_inspect(target, &inspect)
}

fn display_name_from_inspect(target: &Target, inspect_json: &str) -> String {
    let parsed: Value = match serde_json::from_str(inspect_json) {
        Ok(v) => v,
        Err(e) => {
            warn!("Unparsable docker inspect output for {}: {}", target.name, e);
            return target.name.clone();
        }
    };
    let first = parsed.get(0).unwrap_or(&parsed);

    let name = match target.kind {
        TargetKind::DockerImage => first
            .get("RepoTags")
            .and_then(|t| t.get(0))
            .and_then(Value::as_str)
            .map(str::to_string),
        TargetKind::DockerContainer => first
            .get("Name")
            .and_then(Value::as_str)
            .map(|n| n.trim_start_matches('/').to_string()),
        TargetKind::Host => None,
    };
    name.filter(|n| !n.is_empty())
        .unwrap_or_else(|| target.name.clone())
}

/// Image/container relationships keyed by docker id.
pub fn image_links(machine_id: &str) -> Result<HashMap<String, Vec<SystemLink>>> {
    let ps = docker_lines(&["ps", "--no-trunc", "--all"])?;
    parse_image_links(&ps, machine_id)
}

fn parse_image_links(ps_output: &str, machine_id: &str) -> Result<HashMap<String, Vec<SystemLink>>> {
    let mut links: HashMap<String, Vec<SystemLink>> = HashMap::new();
    // First line is the table heading
    for line in ps_output.lines().skip(1) {
        let mut fields = line.split_whitespace();
        let (container, image) = match (fields.next(), fields.next()) {
            (Some(c), Some(i)) => (c, i),
            _ => continue,
        };
        links.insert(
            container.to_string(),
            vec![SystemLink::new(derived_id(machine_id, image)?, "image")],
        );
        links
            .entry(image.to_string())
            .or_default()
            .push(SystemLink::new(derived_id(machine_id, container)?, "container"));
    }
    Ok(links)
}

/// Build the `metadata.json` document of the wrapping archive.
///
/// `archives` must end with the host archive; its display name names the
/// whole group.
pub fn build_group_metadata(
    group_id: &str,
    archives: &[TargetArchive],
    links: &HashMap<String, Vec<SystemLink>>,
) -> Result<Value> {
    let host = match archives.last() {
        Some(a) if a.target.is_host() => a,
        _ => bail!("Group metadata needs the host archive last"),
    };

    let docker_links: Vec<SystemLink> = archives
        .iter()
        .filter(|a| !a.target.is_host())
        .map(|a| SystemLink::new(a.system_id.clone(), a.target.kind.short_name()))
        .collect();

    let systems = archives
        .iter()
        .map(|a| {
            if a.target.is_host() {
                return SystemEntry {
                    links: docker_links.clone(),
                    docker_id: None,
                    display_name: a.display_name.clone(),
                    product: PRODUCT,
                    system_id: a.system_id.clone(),
                    system_type: a.target.kind.short_name(),
                };
            }
            let mut own = vec![SystemLink::new(host.system_id.clone(), "host")];
            if let Some(extra) = links.get(&a.target.name) {
                own.extend(extra.iter().cloned());
            }
            SystemEntry {
                links: own,
                docker_id: Some(a.target.name.clone()),
                display_name: a.display_name.clone(),
                product: PRODUCT,
                system_id: a.system_id.clone(),
                system_type: a.target.kind.short_name(),
            }
        })
        .collect();

    let metadata = GroupMetadata {
        display_name: host.display_name.clone(),
        product: PRODUCT,
        system_id: group_id.to_string(),
        systems,
    };
    Ok(serde_json::to_value(metadata)?)
}

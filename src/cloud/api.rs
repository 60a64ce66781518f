//! Requests to the analysis service.
//!
//! Each concern the core depends on is a small trait so the registration,
//! rule and upload logic can be exercised without a network.

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use reqwest::blocking::multipart::{Form, Part};
use reqwest::header::ACCEPT;
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::client::HttpSession;
use crate::config::AgentConfig;
use crate::constants::{
    COLLECTION_TIME_HEADER, REGISTRATION_CHECK_TIMEOUT_SECS, RHN_SYSTEMID_FILE, UPLOAD_FIELD_NAME,
};
use crate::error::AgentError;
use crate::models::BranchInfo;

lazy_static! {
    static ref SYSTEMID_LEAF: Regex = Regex::new(
        r"(?s)<name>\s*system_id\s*</name>\s*<value>\s*<string>\s*ID-(\d+)\s*</string>"
    )
    .unwrap();
}

/// Status code and body of a completed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpReply {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn json(&self) -> Option<Value> {
        serde_json::from_str(&self.body).ok()
    }

    /// The service's human-readable `message` field, when present.
    pub fn message(&self) -> Option<String> {
        self.json()?
            .get("message")?
            .as_str()
            .map(str::to_string)
    }

    fn from_response(response: reqwest::blocking::Response) -> Result<Self> {
        let status = response.status().as_u16();
        let body = response.text().context("Failed to read response body")?;
        Ok(Self { status, body })
    }
}

/// What the service knows about this machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    /// No record of the machine
    NeverRegistered,
    Registered,
    /// Unregistered at the given time
    Unregistered(String),
    /// No usable answer
    Unreachable,
}

/// Interpret the body of `GET /v1/systems/{id}`.
pub fn parse_system_status(body: &str) -> RemoteStatus {
    let parsed: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) => return RemoteStatus::Unreachable,
    };
    match parsed.get("unregistered_at") {
        None => RemoteStatus::NeverRegistered,
        Some(Value::Null) => RemoteStatus::Registered,
        Some(Value::String(since)) => RemoteStatus::Unregistered(since.clone()),
        Some(other) => RemoteStatus::Unregistered(other.to_string()),
    }
}

/// Body of `POST /v1/systems`.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct NewSystem {
    pub machine_id: String,
    pub remote_branch: i64,
    pub remote_leaf: i64,
    pub hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
pub trait RegistrationApi {
    fn system_status(&self, machine_id: &str) -> RemoteStatus;
    fn create_system(&self, system: &NewSystem) -> Result<HttpReply>;
    fn delete_system(&self, machine_id: &str) -> Result<HttpReply>;
    fn branch_info(&self) -> Result<BranchInfo>;
}

#[cfg_attr(test, mockall::automock)]
pub trait RuleFetcher {
    /// GET `url` as plain text.
    fn fetch(&self, url: &str) -> Result<HttpReply>;
}

#[cfg_attr(test, mockall::automock)]
pub trait UploadTransport {
    /// POST `bundle` as a multipart upload for `target_id`.
    fn upload(
        &self,
        bundle: &Path,
        mime_type: &str,
        collection_secs: u64,
        target_id: &str,
    ) -> Result<HttpReply>;
}

/// Extract the Satellite 5 leaf id from an RHN `systemid` document.
pub fn parse_systemid_leaf(document: &str) -> Option<i64> {
    SYSTEMID_LEAF
        .captures(document)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Fill in the leaf of a Satellite 5 managed host from the local systemid file.
pub fn complete_branch_info(mut info: BranchInfo, systemid_file: &Path) -> Result<BranchInfo> {
    if !info.is_satellite5_managed() {
        return Ok(info);
    }
    debug!("Remote branch set but no leaf, assuming Satellite 5");
    let document = fs::read_to_string(systemid_file).map_err(|e| {
        AgentError::BranchInfoUnavailable(format!("{}: {}", systemid_file.display(), e))
    })?;
    info.remote_leaf = parse_systemid_leaf(&document).ok_or_else(|| {
        AgentError::BranchInfoUnavailable("Could not determine leaf_id".to_string())
    })?;
    debug!("Found leaf id: {}", info.remote_leaf);
    Ok(info)
}

/// The analysis service, reached over HTTP.
#[derive(Debug, Clone)]
pub struct InsightsService {
    session: HttpSession,
    api_url: String,
    upload_url: String,
    branch_info_url: String,
    systemid_file: PathBuf,
}

impl InsightsService {
    pub fn new(config: &AgentConfig, session: HttpSession) -> Self {
        Self {
            session,
            api_url: config.api_url(),
            upload_url: config.upload_url(),
            branch_info_url: config.branch_info_url(),
            systemid_file: PathBuf::from(RHN_SYSTEMID_FILE),
        }
    }

    fn system_url(&self, machine_id: &str) -> String {
        format!("{}/v1/systems/{}", self.api_url, machine_id)
    }
}

impl RegistrationApi for InsightsService {
    fn system_status(&self, machine_id: &str) -> RemoteStatus {
        debug!("Checking registration status...");
        let response = self
            .session
            .get(&self.system_url(machine_id))
            .timeout(Duration::from_secs(REGISTRATION_CHECK_TIMEOUT_SECS))
            .send()
            .and_then(|r| r.text());
        match response {
            Ok(body) => parse_system_status(&body),
            Err(e) => {
                debug!("Registration check failed: {}", e);
                RemoteStatus::Unreachable
            }
        }
    }

    fn create_system(&self, system: &NewSystem) -> Result<HttpReply> {
        let url = format!("{}/v1/systems", self.api_url);
        debug!("POST System: {}", url);
        let response = self
            .session
            .post(&url)
            .json(system)
            .send()
            .context("Could not register system")?;
        HttpReply::from_response(response)
    }

    fn delete_system(&self, machine_id: &str) -> Result<HttpReply> {
        debug!("Unregistering {}", machine_id);
        let response = self
            .session
            .delete(&self.system_url(machine_id))
            .send()
            .context("Could not unregister this system")?;
        HttpReply::from_response(response)
    }

    fn branch_info(&self) -> Result<BranchInfo> {
        debug!("Obtaining branch information from {}", self.branch_info_url);
        let reply = self
            .session
            .get(&self.branch_info_url)
            .send()
            .map_err(|e| AgentError::BranchInfoUnavailable(e.to_string()))?;
        let reply = HttpReply::from_response(reply)?;
        debug!("GET branch_info status: {}", reply.status);

        let info: BranchInfo = serde_json::from_str(&reply.body).map_err(|e| {
            AgentError::BranchInfoUnavailable(format!("HTTP {}: {}", reply.status, e))
        })?;
        complete_branch_info(info, &self.systemid_file)
    }
}

impl RuleFetcher for InsightsService {
    fn fetch(&self, url: &str) -> Result<HttpReply> {
        debug!("Fetching {}", url);
        let response = self
            .session
            .get(url)
            .header(ACCEPT, "text/plain")
            .send()
            .context(format!("Failed to fetch {}", url))?;
        HttpReply::from_response(response)
    }
}

impl UploadTransport for InsightsService {
    fn upload(
        &self,
        bundle: &Path,
        mime_type: &str,
        collection_secs: u64,
        target_id: &str,
    ) -> Result<HttpReply> {
        let url = format!("{}/{}", self.upload_url, target_id);
        let file_name = bundle
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let part = Part::file(bundle)
            .context(format!("Failed to open {}", bundle.display()))?
            .file_name(file_name)
            .mime_str(mime_type)?;
        let form = Form::new().part(UPLOAD_FIELD_NAME, part);

        debug!("Uploading {} to {}", bundle.display(), url);
        let response = self
            .session
            .post(&url)
            .header(COLLECTION_TIME_HEADER, collection_secs.to_string())
            .multipart(form)
            .send()
            .context(format!("Failed to upload to {}", url))?;
        let reply = HttpReply::from_response(response)?;
        debug!("Upload status: {} {}", reply.status, reply.body);
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_system_status_interpretation() {
        assert_eq!(parse_system_status(r#"{"machine_id": "x"}"#), RemoteStatus::NeverRegistered);
        assert_eq!(
            parse_system_status(r#"{"unregistered_at": null, "account_number": "1"}"#),
            RemoteStatus::Registered
        );
        assert_eq!(
            parse_system_status(r#"{"unregistered_at": "2016-01-01T00:00:00"}"#),
            RemoteStatus::Unregistered("2016-01-01T00:00:00".to_string())
        );
        assert_eq!(parse_system_status("<html>"), RemoteStatus::Unreachable);
    }

    #[test]
    fn test_reply_message() {
        let reply = HttpReply::new(412, r#"{"message": "gone", "unregistered_at": "x"}"#);
        assert_eq!(reply.message().as_deref(), Some("gone"));
        assert!(HttpReply::new(500, "oops").message().is_none());
    }

    #[test]
    fn test_new_system_body() {
        let body = NewSystem {
            machine_id: "m".into(),
            remote_branch: -1,
            remote_leaf: -1,
            hostname: "web01".into(),
            display_name: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("display_name").is_none());
        assert_eq!(json["hostname"], "web01");
    }

    const SYSTEMID: &str = r#"<?xml version="1.0"?>
<params><param><value><struct>
<member><name>os_release</name><value><string>7Server</string></value></member>
<member>
  <name>system_id</name>
  <value><string>ID-1000010000</string></value>
</member>
</struct></value></param></params>"#;

    #[test]
    fn test_satellite5_leaf() {
        assert_eq!(parse_systemid_leaf(SYSTEMID), Some(1000010000));
        assert_eq!(parse_systemid_leaf("<params/>"), None);
    }

    #[test]
    fn test_complete_branch_info() {
        let dir = TempDir::new().unwrap();
        let systemid = dir.path().join("systemid");

        let direct = BranchInfo::default();
        assert_eq!(complete_branch_info(direct, &systemid).unwrap(), direct);

        let sat5 = BranchInfo {
            remote_branch: 5,
            remote_leaf: -1,
        };
        assert!(complete_branch_info(sat5, &systemid).is_err());

        fs::write(&systemid, SYSTEMID).unwrap();
        let completed = complete_branch_info(sat5, &systemid).unwrap();
        assert_eq!(completed.remote_leaf, 1000010000);
    }
}

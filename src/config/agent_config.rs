use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::archive::Compressor;
use crate::constants::{
    DEFAULT_BASE_URL, DEFAULT_COMMAND_TIMEOUT_SECS, DEFAULT_GPG_KEYRING,
    DEFAULT_HTTP_TIMEOUT_SECS, DEFAULT_LOG_FILE, DEFAULT_REMOVE_FILE, DEFAULT_SED_FILE,
    DEFAULT_STATE_DIR, DEFAULT_UPLOAD_RETRIES, UPLOAD_RETRY_DELAY_SECS,
};

/// How requests to the analysis service authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuthMethod {
    Basic,
    Cert,
}

/// TLS verification: on/off, or a path to a CA bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CertVerify {
    Enabled(bool),
    CaFile(PathBuf),
}

/// Agent configuration, loaded from YAML and overridden by CLI flags.
///
/// Every field has a default so partial files load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Host and path of the service, without scheme
    pub base_url: String,
    pub api_url: Option<String>,
    pub upload_url: Option<String>,
    pub branch_info_url: Option<String>,
    pub collection_rules_url: Option<String>,
    /// Use plain HTTP instead of HTTPS
    pub insecure_connection: bool,
    /// Explicit proxy URL, possibly with embedded credentials
    pub proxy: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub authmethod: AuthMethod,
    pub cert_verify: CertVerify,
    /// Verify rule-set signatures
    pub gpg: bool,
    /// Refresh collection rules from the service on every run
    pub auto_update: bool,
    pub obfuscate: bool,
    pub obfuscate_hostname: bool,
    pub display_name: Option<String>,
    pub retries: usize,
    pub upload_delay_secs: u64,
    pub cmd_timeout_secs: u64,
    pub http_timeout_secs: u64,
    pub compressor: Compressor,
    pub log_file: PathBuf,
    pub state_dir: PathBuf,
    pub rules_dir: PathBuf,
    pub remove_file: PathBuf,
    pub sed_file: PathBuf,
    pub gpg_keyring: PathBuf,
    pub loglevel: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_url: None,
            upload_url: None,
            branch_info_url: None,
            collection_rules_url: None,
            insecure_connection: false,
            proxy: None,
            username: None,
            password: None,
            authmethod: AuthMethod::Basic,
            cert_verify: CertVerify::Enabled(true),
            gpg: true,
            auto_update: true,
            obfuscate: false,
            obfuscate_hostname: false,
            display_name: None,
            retries: DEFAULT_UPLOAD_RETRIES,
            upload_delay_secs: UPLOAD_RETRY_DELAY_SECS,
            cmd_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            compressor: Compressor::Gz,
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            rules_dir: PathBuf::from(DEFAULT_STATE_DIR),
            remove_file: PathBuf::from(DEFAULT_REMOVE_FILE),
            sed_file: PathBuf::from(DEFAULT_SED_FILE),
            gpg_keyring: PathBuf::from(DEFAULT_GPG_KEYRING),
            loglevel: "INFO".to_string(),
        }
    }
}

impl AgentConfig {
    /// Load a configuration from a YAML file
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path.display()))?;

        let config: AgentConfig =
            serde_yaml::from_str(&content).context("Failed to parse YAML config")?;

        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Save the configuration to a YAML file
    pub fn save_to_yaml_file(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context("Failed to serialize config to YAML")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create directory {}", parent.display()))?;
        }
        fs::write(path, yaml)
            .context(format!("Failed to write config to {}", path.display()))?;

        info!("Saved configuration to {}", path.display());
        Ok(())
    }

    /// Apply overrides from `INSIGHTS_BASE_URL`, `INSIGHTS_PROXY` and `INSIGHTS_RETRIES`.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from<F: Fn(&str) -> Option<String>>(&mut self, lookup: F) {
        if let Some(base) = lookup("INSIGHTS_BASE_URL") {
            debug!("Base URL overridden from environment");
            self.base_url = base;
        }
        if let Some(proxy) = lookup("INSIGHTS_PROXY") {
            debug!("Proxy overridden from environment");
            self.proxy = Some(proxy);
        }
        if let Some(retries) = lookup("INSIGHTS_RETRIES") {
            match retries.trim().parse() {
                Ok(n) => self.retries = n,
                Err(_) => warn!("Ignoring invalid INSIGHTS_RETRIES value: {}", retries),
            }
        }
    }

    fn scheme(&self) -> &'static str {
        if self.insecure_connection {
            "http://"
        } else {
            "https://"
        }
    }

    fn with_scheme(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.trim_end_matches('/').to_string()
        } else {
            format!("{}{}", self.scheme(), url.trim_end_matches('/'))
        }
    }

    /// Base service URL including the scheme.
    pub fn base_url(&self) -> String {
        self.with_scheme(&self.base_url)
    }

    pub fn api_url(&self) -> String {
        match &self.api_url {
            Some(url) => self.with_scheme(url),
            None => self.base_url(),
        }
    }

    pub fn upload_url(&self) -> String {
        match &self.upload_url {
            Some(url) => self.with_scheme(url),
            None => format!("{}/uploads", self.base_url()),
        }
    }

    pub fn branch_info_url(&self) -> String {
        match &self.branch_info_url {
            Some(url) => self.with_scheme(url),
            None => format!("{}/v1/branch_info", self.base_url()),
        }
    }

    pub fn collection_rules_url(&self) -> String {
        match &self.collection_rules_url {
            Some(url) => self.with_scheme(url),
            None => format!("{}/v1/static/uploader.json", self.base_url()),
        }
    }

    /// Host name of the service, used for NO_PROXY matching.
    pub fn service_host(&self) -> String {
        let url = self.base_url();
        let without_scheme = url.split("://").nth(1).unwrap_or(&url);
        let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
        authority.split(':').next().unwrap_or(authority).to_string()
    }

    /// A copy safe to log: credentials and proxy removed.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.password.is_some() {
            copy.password = Some("********".to_string());
        }
        if copy.proxy.is_some() {
            copy.proxy = Some("********".to_string());
        }
        copy
    }
}

/// Load configuration from a file or create a default one
///
/// # Arguments
///
/// * `config_path` - Optional path to a configuration file
///
/// # Returns
///
/// The loaded configuration with environment overrides applied. An explicit
/// path that does not exist yet is populated with the defaults.
pub fn load_or_create_config(config_path: Option<&Path>) -> Result<AgentConfig> {
    let mut config = match config_path {
        Some(path) if path.exists() => AgentConfig::from_yaml_file(path)?,
        Some(path) => {
            info!("Creating default config at {}", path.display());
            let default_config = AgentConfig::default();
            default_config.save_to_yaml_file(path)?;
            default_config
        }
        None => {
            let default_path = Path::new(crate::constants::DEFAULT_CONFIG_FILE);
            if default_path.exists() {
                AgentConfig::from_yaml_file(default_path)?
            } else {
                debug!("No config file found, using built-in defaults");
                AgentConfig::default()
            }
        }
    };
    config.apply_env_overrides();
    Ok(config)
}

use anyhow::{Context, Result};
use log::{debug, error, warn};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use std::fs;
use std::path::Path;
use std::time::Duration;

use super::proxy::ProxyDecision;
use crate::config::{AgentConfig, AuthMethod, CertVerify};
use crate::constants::{DEFAULT_CERT_FILE, DEFAULT_KEY_FILE, USER_AGENT};

/// An HTTP client plus the credentials applied to each request.
#[derive(Debug, Clone)]
pub struct HttpSession {
    client: Client,
    basic_auth: Option<(String, Option<String>)>,
}

impl HttpSession {
    pub fn get(&self, url: &str) -> RequestBuilder {
        self.authorize(self.client.get(url))
    }

    pub fn post(&self, url: &str) -> RequestBuilder {
        self.authorize(self.client.post(url))
    }

    pub fn delete(&self, url: &str) -> RequestBuilder {
        self.authorize(self.client.delete(url))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.basic_auth {
            Some((user, password)) => request.basic_auth(user, password.as_ref()),
            None => request,
        }
    }
}

fn load_identity(cert: &Path, key: &Path) -> Result<reqwest::Identity> {
    let mut pem = fs::read(cert).context(format!("Failed to read {}", cert.display()))?;
    pem.extend(fs::read(key).context(format!("Failed to read {}", key.display()))?);
    reqwest::Identity::from_pem(&pem).context("Failed to load client certificate")
}

/// Build the session used for every request to the analysis service.
pub fn create_http_session(
    config: &AgentConfig,
    proxy: &ProxyDecision,
    timeout: Duration,
) -> Result<HttpSession> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

    let mut builder = Client::builder()
        .user_agent(USER_AGENT)
        .default_headers(headers)
        .timeout(timeout);

    builder = match &proxy.proxy_url {
        Some(url) => {
            let mut https_proxy =
                reqwest::Proxy::https(url.as_str()).context("Invalid proxy URL")?;
            if let Some(auth) = &proxy.proxy_auth {
                let value = HeaderValue::from_str(auth).context("Invalid proxy credentials")?;
                https_proxy = https_proxy.custom_http_auth(value);
            }
            builder.proxy(https_proxy)
        }
        None => builder.no_proxy(),
    };

    match &config.cert_verify {
        CertVerify::Enabled(true) if !config.insecure_connection => {}
        CertVerify::Enabled(_) => {
            warn!("TLS certificate verification is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }
        CertVerify::CaFile(path) => {
            let pem = fs::read(path).context(format!("Failed to read CA file {}", path.display()))?;
            let ca = reqwest::Certificate::from_pem(&pem).context("Invalid CA certificate")?;
            debug!("Trusting CA bundle {}", path.display());
            builder = builder.add_root_certificate(ca);
        }
    }

    let basic_auth = match config.authmethod {
        AuthMethod::Basic => config
            .username
            .clone()
            .map(|user| (user, config.password.clone())),
        AuthMethod::Cert => {
            let cert = Path::new(DEFAULT_CERT_FILE);
            let key = Path::new(DEFAULT_KEY_FILE);
            if cert.exists() && key.exists() {
                builder = builder.identity(load_identity(cert, key)?);
            } else {
                error!("Certificates not found: {} / {}", cert.display(), key.display());
            }
            None
        }
    };

    let client = builder.build().context("Failed to create HTTP client")?;
    Ok(HttpSession { client, basic_auth })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_builds_with_proxy_auth() {
        let config = AgentConfig {
            username: Some("user".into()),
            password: Some("pass".into()),
            ..AgentConfig::default()
        };
        let proxy = ProxyDecision {
            proxy_url: Some("https://proxy.local:3128".into()),
            proxy_auth: Some("Basic dXNlcjpwYXNz".into()),
        };
        let session = create_http_session(&config, &proxy, Duration::from_secs(5)).unwrap();
        assert!(session.basic_auth.is_some());
    }

    #[test]
    fn test_missing_ca_file_is_error() {
        let config = AgentConfig {
            cert_verify: CertVerify::CaFile("/nonexistent/ca.pem".into()),
            ..AgentConfig::default()
        };
        let result = create_http_session(&config, &ProxyDecision::default(), Duration::from_secs(5));
        assert!(result.is_err());
    }
}

// ABOUTME: Configuration for remote-access invocations (dyno-exec.yml).
// ABOUTME: Handles YAML parsing, discovery, defaults, and environment overrides.

mod deserialize;
mod env_value;

pub use env_value::EnvValue;

use crate::error::{Error, Result};
use deserialize::{deserialize_dyno_name, deserialize_url};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;
use zeroize::Zeroizing;

use crate::types::DynoName;

pub const CONFIG_FILENAME: &str = "dyno-exec.yml";
pub const CONFIG_FILENAME_ALT: &str = "dyno-exec.yaml";
pub const CONFIG_FILENAME_DIR: &str = ".dyno-exec/config.yml";

/// Environment variable holding the platform API token.
pub const API_KEY_ENV: &str = "HEROKU_API_KEY";
/// Environment variable overriding the platform API base URL.
pub const API_URL_ENV: &str = "HEROKU_API_URL";

#[derive(Debug, Clone, Deserialize)]
pub struct ExecConfig {
    /// Base URL of the platform API.
    #[serde(default = "default_api_url", deserialize_with = "deserialize_url")]
    pub api_url: String,

    /// API token. Falls back to `HEROKU_API_KEY` when unset.
    #[serde(default)]
    pub api_token: Option<EnvValue>,

    /// Feature flag that gates remote access on an app.
    #[serde(default = "default_feature")]
    pub feature: String,

    /// Config var carrying the exec service URL.
    #[serde(default = "default_exec_url_var")]
    pub exec_url_var: String,

    #[serde(default = "default_dyno", deserialize_with = "deserialize_dyno_name")]
    pub default_dyno: DynoName,

    /// Local address the SOCKS and port-forward listeners bind to.
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// Gateway port used when the control plane does not name one.
    #[serde(default = "default_tunnel_port")]
    pub tunnel_port: u16,

    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    #[serde(default = "default_keepalive_interval", with = "humantime_serde")]
    pub keepalive_interval: Duration,

    #[serde(default = "default_keepalive_max")]
    pub keepalive_max: usize,

    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,

    /// Lifetime assumed for credentials whose issuance carries no expiry.
    #[serde(default = "default_credential_ttl", with = "humantime_serde")]
    pub credential_ttl: Duration,

    /// Refuse gateways whose host key fingerprint was not supplied.
    #[serde(default)]
    pub require_host_fingerprint: bool,
}

fn default_api_url() -> String {
    "https://api.heroku.com".to_string()
}

fn default_feature() -> String {
    "runtime-heroku-exec".to_string()
}

fn default_exec_url_var() -> String {
    "HEROKU_EXEC_URL".to_string()
}

fn default_dyno() -> DynoName {
    DynoName::default()
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_tunnel_port() -> u16 {
    80
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_keepalive_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_keepalive_max() -> usize {
    3
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(2)
}

fn default_credential_ttl() -> Duration {
    Duration::from_secs(600)
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_token: None,
            feature: default_feature(),
            exec_url_var: default_exec_url_var(),
            default_dyno: default_dyno(),
            bind_address: default_bind_address(),
            tunnel_port: default_tunnel_port(),
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
            keepalive_interval: default_keepalive_interval(),
            keepalive_max: default_keepalive_max(),
            shutdown_grace: default_shutdown_grace(),
            credential_ttl: default_credential_ttl(),
            require_host_fingerprint: false,
        }
    }
}

impl ExecConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).map_err(Error::from)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::ConfigNotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Look for a config file in `dir`, falling back to defaults.
    pub fn discover(dir: &Path) -> Result<Self> {
        let candidates = [
            dir.join(CONFIG_FILENAME),
            dir.join(CONFIG_FILENAME_ALT),
            dir.join(CONFIG_FILENAME_DIR),
        ];

        for path in &candidates {
            if path.exists() {
                tracing::debug!("loading configuration from {}", path.display());
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Apply `HEROKU_API_URL` over the configured API URL.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var(API_URL_ENV) {
            let url = url.trim_end_matches('/').to_string();
            if !url.is_empty() {
                self.api_url = url;
            }
        }
        self
    }

    /// Resolve the API token from config, then from `HEROKU_API_KEY`.
    pub fn api_token(&self) -> Result<Zeroizing<String>> {
        match &self.api_token {
            Some(value) => value.resolve(),
            None => std::env::var(API_KEY_ENV)
                .map(Zeroizing::new)
                .map_err(|_| Error::MissingEnvVar(API_KEY_ENV.to_string())),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.keepalive_max == 0 {
            return Err(Error::InvalidConfig(
                "keepalive_max must be at least 1".to_string(),
            ));
        }
        if self.keepalive_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "keepalive_interval must be non-zero".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() || self.request_timeout.is_zero() {
            return Err(Error::InvalidConfig("timeouts must be non-zero".to_string()));
        }
        if self.exec_url_var.is_empty() {
            return Err(Error::InvalidConfig(
                "exec_url_var cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

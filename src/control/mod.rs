// ABOUTME: Control-plane negotiation: feature config, credentials, tunnel endpoints.
// ABOUTME: The ControlPlane trait is the seam between the pipeline and the HTTP API.

mod credential;
mod endpoint;
mod http;
mod negotiator;

pub use credential::{CredentialIssuer, SessionCredential};
pub use endpoint::{HostKeyPolicy, TunnelEndpoint, TunnelEndpointResolver};
pub use http::HttpControlPlane;
pub use negotiator::{ConfigNegotiator, FeatureConfig};

use crate::error::Result;
use crate::types::{AppName, Target};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;

/// Whether a platform feature is switched on for an app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct FeatureState {
    pub enabled: bool,
}

/// Response to a client key registration.
///
/// Gateway fields are optional: when the exec service does not embed the
/// endpoint, it is looked up separately.
#[derive(Clone, Default, Deserialize)]
pub struct CredentialGrant {
    #[serde(default)]
    pub tunnel_host: Option<String>,
    #[serde(default)]
    pub tunnel_port: Option<u16>,
    #[serde(default)]
    pub client_user: Option<String>,
    #[serde(default)]
    pub routing_token: Option<String>,
    #[serde(default)]
    pub host_key_fingerprint: Option<String>,
    /// OpenSSH user certificate signed over the submitted key.
    #[serde(default)]
    pub client_certificate: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for CredentialGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialGrant")
            .field("tunnel_host", &self.tunnel_host)
            .field("tunnel_port", &self.tunnel_port)
            .field("host_key_fingerprint", &self.host_key_fingerprint)
            .field("has_certificate", &self.client_certificate.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Gateway address returned by a dedicated endpoint lookup.
#[derive(Clone, Deserialize)]
pub struct EndpointRecord {
    pub tunnel_host: String,
    #[serde(default)]
    pub tunnel_port: Option<u16>,
    #[serde(default)]
    pub client_user: Option<String>,
    #[serde(default)]
    pub routing_token: Option<String>,
    #[serde(default)]
    pub host_key_fingerprint: Option<String>,
}

impl std::fmt::Debug for EndpointRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointRecord")
            .field("tunnel_host", &self.tunnel_host)
            .field("tunnel_port", &self.tunnel_port)
            .field("host_key_fingerprint", &self.host_key_fingerprint)
            .finish()
    }
}

/// Requests the remote-access pipeline makes against the platform.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Feature flag state for an app. Unknown features read as disabled.
    async fn feature_state(&self, app: &AppName, feature: &str) -> Result<FeatureState>;

    /// All config vars of an app.
    async fn config_vars(&self, app: &AppName) -> Result<HashMap<String, String>>;

    /// Register a client public key for one session on `target`.
    async fn register_client_key(
        &self,
        exec_url: &str,
        target: &Target,
        public_key: &str,
    ) -> Result<CredentialGrant>;

    /// Look up the gateway serving `target`.
    async fn lookup_endpoint(&self, exec_url: &str, target: &Target) -> Result<EndpointRecord>;
}

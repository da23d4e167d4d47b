// ABOUTME: Resolves the gateway address and host key policy for one session.
// ABOUTME: Uses the issuance response when it names a gateway, else a separate lookup.

use super::ControlPlane;
use crate::control::{FeatureConfig, SessionCredential};
use crate::error::{Error, Result};
use std::sync::Arc;
use zeroize::Zeroizing;

/// How the gateway's host key is checked during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Accept only a key with this SHA-256 fingerprint (`SHA256:...`).
    Fingerprint(String),
    /// No fingerprint was supplied; accept with a warning.
    TrustUnverified,
}

impl HostKeyPolicy {
    /// Check a presented `SHA256:<base64>` fingerprint against the policy.
    pub fn accepts(&self, presented: &str) -> bool {
        match self {
            HostKeyPolicy::Fingerprint(expected) => {
                normalize_fingerprint(expected) == normalize_fingerprint(presented)
            }
            HostKeyPolicy::TrustUnverified => true,
        }
    }
}

fn normalize_fingerprint(fingerprint: &str) -> &str {
    let trimmed = fingerprint.trim();
    let trimmed = trimmed.strip_prefix("SHA256:").unwrap_or(trimmed);
    trimmed.trim_end_matches('=')
}

/// Concrete gateway address for one session.
#[derive(Clone)]
pub struct TunnelEndpoint {
    pub host: String,
    pub port: u16,
    routing_token: Zeroizing<String>,
    pub host_key: HostKeyPolicy,
}

impl std::fmt::Debug for TunnelEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("routing_token", &"<redacted>")
            .field("host_key", &self.host_key)
            .finish()
    }
}

impl TunnelEndpoint {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        routing_token: impl Into<String>,
        host_key: HostKeyPolicy,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            routing_token: Zeroizing::new(routing_token.into()),
            host_key,
        }
    }

    /// User name presented to the gateway; it routes the session to the dyno.
    pub fn routing_token(&self) -> &str {
        &self.routing_token
    }

    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

pub struct TunnelEndpointResolver {
    control: Arc<dyn ControlPlane>,
    default_port: u16,
    require_fingerprint: bool,
}

impl TunnelEndpointResolver {
    pub fn new(control: Arc<dyn ControlPlane>, default_port: u16, require_fingerprint: bool) -> Self {
        Self {
            control,
            default_port,
            require_fingerprint,
        }
    }

    pub async fn resolve(
        &self,
        config: &FeatureConfig,
        credential: &SessionCredential,
    ) -> Result<TunnelEndpoint> {
        let (host, port, lookup_token, fingerprint) = match credential.issued_endpoint() {
            Some(issued) => (
                issued.host.clone(),
                issued.port,
                None,
                issued.host_key_fingerprint.clone(),
            ),
            None => {
                let record = self
                    .control
                    .lookup_endpoint(config.exec_url(), credential.target())
                    .await
                    .map_err(|e| Error::EndpointUnavailable(e.to_string()))?;
                let token = record.routing_token.or(record.client_user);
                (
                    record.tunnel_host,
                    record.tunnel_port,
                    token,
                    record.host_key_fingerprint,
                )
            }
        };

        if host.trim().is_empty() {
            return Err(Error::EndpointUnavailable(
                "control plane returned an empty gateway host".to_string(),
            ));
        }

        let routing_token = match credential.routing_token() {
            Some(token) => token.to_string(),
            None => lookup_token.ok_or_else(|| {
                Error::EndpointUnavailable("no routing token for gateway session".to_string())
            })?,
        };

        let host_key = match fingerprint {
            Some(fp) if !fp.trim().is_empty() => HostKeyPolicy::Fingerprint(fp),
            _ if self.require_fingerprint => {
                return Err(Error::EndpointUnavailable(format!(
                    "gateway {host} has no host key fingerprint and one is required"
                )));
            }
            _ => HostKeyPolicy::TrustUnverified,
        };

        Ok(TunnelEndpoint::new(
            host,
            port.unwrap_or(self.default_port),
            routing_token,
            host_key,
        ))
    }
}

// ABOUTME: Per-session client credentials: a fresh key pair registered with the exec service.
// ABOUTME: The private half never leaves the process and is zeroized on drop.

use super::{ControlPlane, CredentialGrant};
use crate::control::FeatureConfig;
use crate::error::{Error, Result};
use crate::types::Target;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use russh::keys::ssh_key::{Algorithm, Certificate, PrivateKey};
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroizing;

/// Gateway details carried by the issuance response itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IssuedEndpoint {
    pub host: String,
    pub port: Option<u16>,
    pub host_key_fingerprint: Option<String>,
}

/// Short-lived credential scoped to exactly one session.
///
/// Not `Clone`. `Session::connect` takes it by value, so a credential can
/// be presented to at most one gateway handshake:
///
/// ```no_run
/// # use dyno_exec::control::{HostKeyPolicy, SessionCredential, TunnelEndpoint};
/// # use dyno_exec::ssh::{Session, SessionOptions};
/// # async fn connect_once(credential: SessionCredential) {
/// let endpoint = TunnelEndpoint::new("gw", 80, "route", HostKeyPolicy::TrustUnverified);
/// let _ = Session::connect(endpoint, credential, &SessionOptions::default()).await;
/// # }
/// ```
///
/// A second handshake with the same credential does not compile:
///
/// ```compile_fail,E0382
/// # use dyno_exec::control::{HostKeyPolicy, SessionCredential, TunnelEndpoint};
/// # use dyno_exec::ssh::{Session, SessionOptions};
/// # async fn connect_twice(credential: SessionCredential) {
/// let options = SessionOptions::default();
/// let first = TunnelEndpoint::new("gw", 80, "route", HostKeyPolicy::TrustUnverified);
/// let second = TunnelEndpoint::new("gw", 80, "route", HostKeyPolicy::TrustUnverified);
/// let _ = Session::connect(first, credential, &options).await;
/// let _ = Session::connect(second, credential, &options).await;
/// # }
/// ```
///
/// and neither does copying it first:
///
/// ```compile_fail,E0599
/// # use dyno_exec::control::SessionCredential;
/// # fn copy(credential: SessionCredential) {
/// let _spare = credential.clone();
/// # }
/// ```
pub struct SessionCredential {
    target: Target,
    key: Arc<PrivateKey>,
    certificate: Option<Certificate>,
    routing_token: Option<Zeroizing<String>>,
    expires_at: DateTime<Utc>,
    issued_endpoint: Option<IssuedEndpoint>,
}

impl std::fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCredential")
            .field("target", &self.target)
            .field("key", &"<redacted>")
            .field("has_certificate", &self.certificate.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl SessionCredential {
    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Fail fast on an expired credential instead of attempting a handshake.
    pub fn ensure_fresh(&self, now: DateTime<Utc>) -> Result<()> {
        if self.is_expired_at(now) {
            return Err(Error::CredentialExpired {
                expired_at: self.expires_at,
            });
        }
        Ok(())
    }

    /// OpenSSH encoding of the public half.
    pub fn public_key_openssh(&self) -> Result<String> {
        self.key
            .public_key()
            .to_openssh()
            .map_err(|e| Error::Protocol(format!("failed to encode client key: {e}")))
    }

    pub(crate) fn routing_token(&self) -> Option<&str> {
        self.routing_token.as_ref().map(|t| t.as_str())
    }

    pub(crate) fn issued_endpoint(&self) -> Option<&IssuedEndpoint> {
        self.issued_endpoint.as_ref()
    }

    /// Hand the key material to the transport, consuming the credential.
    pub(crate) fn into_auth(self) -> (Arc<PrivateKey>, Option<Certificate>) {
        (self.key, self.certificate)
    }

    /// Assemble a credential from a key and the exec service's grant.
    pub(crate) fn from_grant(
        target: Target,
        key: PrivateKey,
        grant: CredentialGrant,
        default_ttl: Duration,
    ) -> Result<Self> {
        let certificate = grant
            .client_certificate
            .as_deref()
            .map(Certificate::from_openssh)
            .transpose()
            .map_err(|e| Error::Network(format!("malformed client certificate: {e}")))?;

        let ttl = chrono::Duration::from_std(default_ttl)
            .map_err(|_| Error::InvalidConfig("credential_ttl is out of range".to_string()))?;
        let expires_at = grant.expires_at.unwrap_or_else(|| Utc::now() + ttl);

        let routing_token = grant
            .routing_token
            .or(grant.client_user)
            .map(Zeroizing::new);

        let issued_endpoint = grant.tunnel_host.map(|host| IssuedEndpoint {
            host,
            port: grant.tunnel_port,
            host_key_fingerprint: grant.host_key_fingerprint,
        });

        Ok(Self {
            target,
            key: Arc::new(key),
            certificate,
            routing_token,
            expires_at,
            issued_endpoint,
        })
    }
}

pub struct CredentialIssuer {
    control: Arc<dyn ControlPlane>,
    default_ttl: Duration,
}

impl CredentialIssuer {
    pub fn new(control: Arc<dyn ControlPlane>, default_ttl: Duration) -> Self {
        Self {
            control,
            default_ttl,
        }
    }

    /// Generate a key pair and register its public half for one session.
    pub async fn issue(&self, config: &FeatureConfig, target: &Target) -> Result<SessionCredential> {
        let key = generate_client_key()?;
        let public_key = key
            .public_key()
            .to_openssh()
            .map_err(|e| Error::Protocol(format!("failed to encode client key: {e}")))?;

        let grant = self
            .control
            .register_client_key(config.exec_url(), target, &public_key)
            .await?;
        tracing::debug!("credential issued for {}: {:?}", target, grant);

        SessionCredential::from_grant(target.clone(), key, grant, self.default_ttl)
    }
}

fn generate_client_key() -> Result<PrivateKey> {
    let mut key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .map_err(|e| Error::Protocol(format!("failed to generate client key: {e}")))?;
    let host = gethostname::gethostname().to_string_lossy().into_owned();
    key.set_comment(format!("dyno-exec@{host}"));
    Ok(key)
}

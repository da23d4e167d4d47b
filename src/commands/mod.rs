// ABOUTME: Caller-facing entry points for shell, SOCKS, port forward, copy and status.
// ABOUTME: RemoteAccess is the per-invocation context owning config and control-plane client.

mod exec;
mod tunnel;

pub use tunnel::Tunnel;

use crate::config::ExecConfig;
use crate::control::{
    ConfigNegotiator, ControlPlane, CredentialIssuer, HttpControlPlane, TunnelEndpointResolver,
};
use crate::error::Result;
use crate::ssh::{Session, SessionOptions};
use crate::status::{StatusChecker, StatusReport};
use crate::types::Target;
use std::sync::Arc;

/// Everything one invocation needs, built once and passed explicitly.
pub struct RemoteAccess {
    config: ExecConfig,
    control: Arc<dyn ControlPlane>,
}

impl RemoteAccess {
    /// Build with the HTTPS control-plane client.
    pub fn new(config: ExecConfig) -> Result<Self> {
        let control = Arc::new(HttpControlPlane::new(&config)?);
        Ok(Self::with_control_plane(config, control))
    }

    pub fn with_control_plane(config: ExecConfig, control: Arc<dyn ControlPlane>) -> Self {
        Self { config, control }
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    fn negotiator(&self) -> ConfigNegotiator {
        ConfigNegotiator::new(
            Arc::clone(&self.control),
            self.config.feature.clone(),
            self.config.exec_url_var.clone(),
        )
    }

    fn issuer(&self) -> CredentialIssuer {
        CredentialIssuer::new(Arc::clone(&self.control), self.config.credential_ttl)
    }

    fn resolver(&self) -> TunnelEndpointResolver {
        TunnelEndpointResolver::new(
            Arc::clone(&self.control),
            self.config.tunnel_port,
            self.config.require_host_fingerprint,
        )
    }

    /// Negotiate, issue a credential, resolve the gateway and connect.
    pub async fn establish(&self, target: &Target) -> Result<Session> {
        let feature_config = self.negotiator().fetch_config(target).await?;
        let credential = self.issuer().issue(&feature_config, target).await?;
        let endpoint = self.resolver().resolve(&feature_config, &credential).await?;
        tracing::info!("connecting to {} via {}", target, endpoint.address());

        Session::connect(endpoint, credential, &SessionOptions::from(&self.config)).await
    }

    /// Report whether remote access is enabled and the gateway reachable.
    pub async fn get_status(&self, target: &Target) -> StatusReport {
        StatusChecker::new(
            self.negotiator(),
            self.issuer(),
            self.resolver(),
            self.config.connect_timeout,
        )
        .check_status(target)
        .await
    }
}

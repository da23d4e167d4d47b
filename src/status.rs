// ABOUTME: Read-only health report for remote access to one dyno.
// ABOUTME: Never fails; every problem is folded into the report's detail.

use crate::control::{
    ConfigNegotiator, CredentialIssuer, FeatureConfig, TunnelEndpoint, TunnelEndpointResolver,
};
use crate::error::{Error, Result};
use crate::types::Target;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;

/// Outcome of a status check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    /// The remote-access feature is switched on for the app.
    pub enabled: bool,
    /// The dyno's gateway accepted a TCP connection.
    pub reachable: bool,
    pub detail: String,
}

impl StatusReport {
    fn unavailable(detail: impl Into<String>) -> Self {
        Self {
            enabled: false,
            reachable: false,
            detail: detail.into(),
        }
    }

    fn unreachable(detail: impl Into<String>) -> Self {
        Self {
            enabled: true,
            reachable: false,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let yes_no = |b: bool| if b { "yes" } else { "no" };
        writeln!(f, "enabled:   {}", yes_no(self.enabled))?;
        writeln!(f, "reachable: {}", yes_no(self.reachable))?;
        write!(f, "detail:    {}", self.detail)
    }
}

/// Walks the connection pipeline up to, but not including, the SSH handshake.
pub struct StatusChecker {
    negotiator: ConfigNegotiator,
    issuer: CredentialIssuer,
    resolver: TunnelEndpointResolver,
    dial_timeout: Duration,
}

impl StatusChecker {
    pub fn new(
        negotiator: ConfigNegotiator,
        issuer: CredentialIssuer,
        resolver: TunnelEndpointResolver,
        dial_timeout: Duration,
    ) -> Self {
        Self {
            negotiator,
            issuer,
            resolver,
            dial_timeout,
        }
    }

    pub async fn check_status(&self, target: &Target) -> StatusReport {
        let config = match self.negotiator.fetch_config(target).await {
            Ok(config) => config,
            Err(e @ Error::FeatureNotEnabled { .. }) => {
                return StatusReport::unavailable(e.to_string());
            }
            Err(e) => {
                tracing::debug!("status: feature lookup failed: {}", e);
                return StatusReport::unavailable(format!("could not determine feature state: {e}"));
            }
        };

        match self.locate_gateway(&config, target).await {
            Ok(endpoint) => match self.dial_gateway(&endpoint).await {
                Ok(()) => StatusReport {
                    enabled: true,
                    reachable: true,
                    detail: format!("gateway {} is accepting connections", endpoint.address()),
                },
                Err(detail) => StatusReport::unreachable(detail),
            },
            Err(e) => StatusReport::unreachable(e.to_string()),
        }
    }

    async fn locate_gateway(
        &self,
        config: &FeatureConfig,
        target: &Target,
    ) -> Result<TunnelEndpoint> {
        let credential = self.issuer.issue(config, target).await?;
        self.resolver.resolve(config, &credential).await
    }

    /// Plain TCP connect; the credential is never presented.
    async fn dial_gateway(&self, endpoint: &TunnelEndpoint) -> std::result::Result<(), String> {
        let address = endpoint.address();
        match tokio::time::timeout(
            self.dial_timeout,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(format!("gateway {address} is not reachable: {e}")),
            Err(_) => Err(format!(
                "gateway {address} did not answer within {:?}",
                self.dial_timeout
            )),
        }
    }
}

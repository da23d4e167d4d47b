// ABOUTME: Error taxonomy shared by every stage of a remote-access invocation.
// ABOUTME: Uses thiserror; only control-plane network failures are retryable.

use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The target app lacks the remote-access feature, or it is not yet
    /// provisioned on the running dynos.
    #[error("remote access is not enabled for {target}: {hint}")]
    FeatureNotEnabled { target: String, hint: String },

    #[error("credential issuance denied: {0}")]
    AuthDenied(String),

    #[error("control plane request failed: {0}")]
    Network(String),

    #[error("tunnel endpoint unavailable: {0}")]
    EndpointUnavailable(String),

    #[error("session credential expired at {expired_at}")]
    CredentialExpired { expired_at: DateTime<Utc> },

    #[error("handshake with gateway failed: {0}")]
    HandshakeFailed(String),

    #[error("connection refused by {0}")]
    ConnectionRefused(String),

    #[error("{stage} timed out after {after:?}")]
    Timeout { stage: &'static str, after: Duration },

    #[error("connection to gateway lost: {0}")]
    ConnectionLost(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("remote dial to {host}:{port} failed: {reason}")]
    DialFailed {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("remote command failed{}: {reason}", exit_code.map(|c| format!(" with exit code {c}")).unwrap_or_default())]
    RemoteExecFailed {
        exit_code: Option<u32>,
        reason: String,
    },

    #[error("failed to bind local listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("configuration file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Whether the caller may retry the whole invocation with backoff.
    ///
    /// Transport failures are not retryable on their own: credentials are
    /// single-use, so a retry must go back through issuance.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_))
    }

    /// Process exit status for this failure: the remote command's own code
    /// when it reported one that fits, otherwise 1.
    pub fn exit_status(&self) -> i32 {
        match self {
            Error::RemoteExecFailed {
                exit_code: Some(code @ 1..=255),
                ..
            } => *code as i32,
            _ => 1,
        }
    }

    pub(crate) fn timeout(stage: &'static str, after: Duration) -> Self {
        Error::Timeout { stage, after }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Network(format!("request timed out: {err}"))
        } else if err.is_decode() {
            Error::Network(format!("malformed response body: {err}"))
        } else {
            Error::Network(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

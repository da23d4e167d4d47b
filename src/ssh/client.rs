// ABOUTME: Secure transport session to the remote-access gateway using russh.
// ABOUTME: Handles host key policy, credential authentication, keep-alive and shutdown.

use super::state::{SessionState, StateCell};
use crate::config::ExecConfig;
use crate::control::{HostKeyPolicy, SessionCredential, TunnelEndpoint};
use crate::error::{Error, Result};
use chrono::Utc;
use russh::client::{self, Config, Handle};
use russh::keys::ssh_key::{self, Certificate, HashAlg, PrivateKey};
use russh::keys::PrivateKeyWithHashAlg;
use russh::Disconnect;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// How often the liveness monitor checks the transport.
const LIVENESS_POLL: Duration = Duration::from_millis(200);

/// Transport tuning for one session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Bounds TCP connect, key exchange and authentication together.
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    /// Unanswered keep-alives before the transport is declared dead.
    pub keepalive_max: usize,
    /// How long `close()` waits for channel tasks before disconnecting.
    pub shutdown_grace: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&ExecConfig::default())
    }
}

impl From<&ExecConfig> for SessionOptions {
    fn from(config: &ExecConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            keepalive_interval: config.keepalive_interval,
            keepalive_max: config.keepalive_max,
            shutdown_grace: config.shutdown_grace,
        }
    }
}

/// russh client handler enforcing the endpoint's host key policy.
pub(crate) struct GatewayHandler {
    address: String,
    policy: HostKeyPolicy,
}

impl client::Handler for GatewayHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let presented = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        match &self.policy {
            HostKeyPolicy::TrustUnverified => {
                tracing::warn!(
                    "accepting unverified host key {} for gateway {}",
                    presented,
                    self.address
                );
                Ok(true)
            }
            policy if policy.accepts(&presented) => Ok(true),
            _ => {
                tracing::warn!(
                    "gateway {} presented unexpected host key {}",
                    self.address,
                    presented
                );
                Ok(false)
            }
        }
    }
}

/// An established, authenticated session to the gateway.
///
/// Channels opened on the session run on its task tracker and observe its
/// cancellation token, so none of them outlive it.
pub struct Session {
    address: String,
    handle: Arc<Handle<GatewayHandler>>,
    state: Arc<StateCell>,
    shutdown: CancellationToken,
    lost: CancellationToken,
    tracker: TaskTracker,
    shutdown_grace: Duration,
    handshake_timeout: Duration,
}

/// What a channel needs to tell transport loss apart from a local close.
#[derive(Clone)]
pub(crate) struct LossWatch {
    cancel: CancellationToken,
    lost: CancellationToken,
    handle: Arc<Handle<GatewayHandler>>,
    reason: String,
}

impl LossWatch {
    /// Cancelled when the session closes or is lost.
    pub(crate) fn cancelled(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the channel ended because the transport died.
    ///
    /// `channel_gone` is set when the channel's receiver yielded `None`
    /// before any `Close`, which means the russh session dropped it. The
    /// liveness monitor may not have noticed yet.
    pub(crate) fn transport_lost(&self, channel_gone: bool) -> bool {
        if self.lost.is_cancelled() {
            return true;
        }
        if self.cancel.is_cancelled() {
            return false;
        }
        channel_gone || self.handle.is_closed()
    }

    pub(crate) fn error(&self) -> Error {
        Error::ConnectionLost(self.reason.clone())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("address", &self.address)
            .field("state", &self.state.get())
            .field("handle", &"<russh::Handle>")
            .finish()
    }
}

impl Session {
    /// Connect and authenticate, consuming the single-use credential.
    pub async fn connect(
        endpoint: TunnelEndpoint,
        credential: SessionCredential,
        options: &SessionOptions,
    ) -> Result<Self> {
        credential.ensure_fresh(Utc::now())?;

        let state = Arc::new(StateCell::new());
        let address = endpoint.address();

        let established = tokio::time::timeout(
            options.connect_timeout,
            Self::handshake(&endpoint, credential, options),
        )
        .await;

        let handle = match established {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                state.advance(SessionState::Closed);
                return Err(e);
            }
            Err(_) => {
                state.advance(SessionState::Closed);
                return Err(Error::timeout("gateway handshake", options.connect_timeout));
            }
        };

        state.advance(SessionState::Authenticated);
        state.advance(SessionState::Active);
        tracing::info!("session established with gateway {}", address);

        let session = Self {
            address,
            handle: Arc::new(handle),
            state,
            shutdown: CancellationToken::new(),
            lost: CancellationToken::new(),
            tracker: TaskTracker::new(),
            shutdown_grace: options.shutdown_grace,
            handshake_timeout: options.connect_timeout,
        };
        session.spawn_liveness_monitor();
        Ok(session)
    }

    async fn handshake(
        endpoint: &TunnelEndpoint,
        credential: SessionCredential,
        options: &SessionOptions,
    ) -> Result<Handle<GatewayHandler>> {
        let config = Config {
            inactivity_timeout: None,
            keepalive_interval: Some(options.keepalive_interval),
            keepalive_max: options.keepalive_max,
            ..Default::default()
        };

        let handler = GatewayHandler {
            address: endpoint.address(),
            policy: endpoint.host_key.clone(),
        };

        let mut handle = client::connect(
            Arc::new(config),
            (endpoint.host.as_str(), endpoint.port),
            handler,
        )
        .await
        .map_err(|e| map_connect_error(e, endpoint))?;

        let (key, certificate) = credential.into_auth();
        let authenticated =
            authenticate(&mut handle, endpoint.routing_token(), key, certificate).await?;
        if !authenticated {
            return Err(Error::HandshakeFailed(format!(
                "gateway {} rejected the session credential",
                endpoint.address()
            )));
        }

        Ok(handle)
    }

    /// Turn transport death into the `Closed` state and the `lost` signal.
    fn spawn_liveness_monitor(&self) {
        let handle = Arc::clone(&self.handle);
        let state = Arc::clone(&self.state);
        let shutdown = self.shutdown.clone();
        let lost = self.lost.clone();
        let address = self.address.clone();

        self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(LIVENESS_POLL) => {}
                }
                if handle.is_closed() {
                    if state.get() != SessionState::Closing {
                        tracing::warn!("connection to gateway {} lost", address);
                        state.advance(SessionState::Closed);
                        lost.cancel();
                        shutdown.cancel();
                    }
                    break;
                }
            }
        });
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub(crate) fn handle(&self) -> &Arc<Handle<GatewayHandler>> {
        &self.handle
    }

    pub(crate) fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Token cancelled when the session closes or is lost.
    pub(crate) fn channel_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    pub(crate) fn lost_token(&self) -> CancellationToken {
        self.lost.clone()
    }

    pub(crate) fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }

    /// Bound on local handshakes, such as SOCKS negotiation.
    pub(crate) fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    pub(crate) fn lost_reason(&self) -> String {
        format!("gateway {} stopped responding", self.address)
    }

    pub(crate) fn loss_watch(&self) -> LossWatch {
        LossWatch {
            cancel: self.channel_token(),
            lost: self.lost_token(),
            handle: Arc::clone(&self.handle),
            reason: self.lost_reason(),
        }
    }

    /// Close every channel and the transport. Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        if !self.state.advance(SessionState::Closing) {
            return Ok(());
        }

        self.shutdown.cancel();
        self.tracker.close();
        if tokio::time::timeout(self.shutdown_grace, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                "channels did not finish within {:?}; disconnecting",
                self.shutdown_grace
            );
        }

        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            tracing::debug!("disconnect from {} failed: {}", self.address, e);
        }
        self.state.advance(SessionState::Closed);
        tracing::info!("session with gateway {} closed", self.address);
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn authenticate(
    handle: &mut Handle<GatewayHandler>,
    user: &str,
    key: Arc<PrivateKey>,
    certificate: Option<Certificate>,
) -> Result<bool> {
    let result = match certificate {
        Some(cert) => handle.authenticate_openssh_cert(user, key, cert).await,
        None => {
            handle
                .authenticate_publickey(user, PrivateKeyWithHashAlg::new(key, None))
                .await
        }
    }
    .map_err(|e| Error::HandshakeFailed(format!("authentication failed: {e}")))?;

    Ok(result.success())
}

fn map_connect_error(err: russh::Error, endpoint: &TunnelEndpoint) -> Error {
    match err {
        russh::Error::IO(ref io) if io.kind() == std::io::ErrorKind::ConnectionRefused => {
            Error::ConnectionRefused(endpoint.address())
        }
        russh::Error::UnknownKey => Error::HandshakeFailed(format!(
            "host key of gateway {} did not match the expected fingerprint",
            endpoint.address()
        )),
        other if other.to_string().contains("Connection refused") => {
            Error::ConnectionRefused(endpoint.address())
        }
        other => Error::HandshakeFailed(other.to_string()),
    }
}

// ABOUTME: SOCKS proxy and port-forward entry points and the Tunnel they return.
// ABOUTME: A Tunnel owns its session; stopping it closes listener then transport.

use super::RemoteAccess;
use crate::error::{Error, Result};
use crate::ssh::{ForwardHandle, ForwardStats, Session};
use crate::types::Target;
use std::net::SocketAddr;

/// A running local listener and the session carrying its connections.
#[derive(Debug)]
pub struct Tunnel {
    session: Session,
    forward: ForwardHandle,
}

impl Tunnel {
    pub fn local_addr(&self) -> SocketAddr {
        self.forward.local_addr()
    }

    pub fn stats(&self) -> ForwardStats {
        self.forward.stats()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn forward(&self) -> &ForwardHandle {
        &self.forward
    }

    /// Resolve when the tunnel ends; `ConnectionLost` if the session died.
    pub async fn wait(&self) -> Result<()> {
        self.forward.wait().await
    }

    /// Stop the listener, then close the session.
    pub async fn stop(self) -> Result<()> {
        let Tunnel { session, forward } = self;
        forward.stop().await;
        session.close().await
    }

    /// Serve until Ctrl-C or until the session is lost, then shut down.
    pub async fn run_until_interrupted(self) -> Result<()> {
        let outcome = tokio::select! {
            result = self.forward.wait() => result,
            signal = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted; closing tunnel");
                signal.map_err(Error::from)
            }
        };
        self.stop().await?;
        outcome
    }
}

impl RemoteAccess {
    fn bind_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.config.bind_address, port)
    }

    /// Open a SOCKS proxy on `port` (0 picks one) tunnelling through `target`.
    pub async fn start_socks_proxy(&self, target: &Target, port: u16) -> Result<Tunnel> {
        let session = self.establish(target).await?;
        match session.open_proxy_listener(self.bind_addr(port)).await {
            Ok(forward) => Ok(Tunnel { session, forward }),
            Err(e) => {
                let _ = session.close().await;
                Err(e)
            }
        }
    }

    /// Forward local `port` to `remote_host:remote_port` as seen from `target`.
    pub async fn start_port_forward(
        &self,
        target: &Target,
        port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<Tunnel> {
        let session = self.establish(target).await?;
        match session
            .open_port_forward(self.bind_addr(port), remote_host, remote_port)
            .await
        {
            Ok(forward) => Ok(Tunnel { session, forward }),
            Err(e) => {
                let _ = session.close().await;
                Err(e)
            }
        }
    }

    pub async fn run_socks_proxy(&self, target: &Target, port: u16) -> Result<()> {
        self.start_socks_proxy(target, port)
            .await?
            .run_until_interrupted()
            .await
    }

    pub async fn run_port_forward(
        &self,
        target: &Target,
        port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<()> {
        self.start_port_forward(target, port, remote_host, remote_port)
            .await?
            .run_until_interrupted()
            .await
    }
}

// ABOUTME: Local TCP listeners that tunnel connections through the gateway session.
// ABOUTME: Serves the SOCKS proxy and fixed-destination port forwards over direct-tcpip channels.

use super::client::{GatewayHandler, Session};
use super::socks;
use super::splice::splice;
use crate::diagnostics::{Diagnostics, Warning};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use russh::client::Handle;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Snapshot of a listener's connection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardStats {
    pub accepted: u64,
    pub active: u64,
    pub dials: u64,
    pub failures: u64,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    active: AtomicU64,
    dials: AtomicU64,
    failures: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ForwardStats {
        ForwardStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            dials: self.dials.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Decrements the active count when a connection task ends.
struct ActiveGuard(Arc<Counters>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// What a listener does with each accepted connection.
#[derive(Debug, Clone)]
enum Mode {
    Socks,
    Fixed { host: String, port: u16 },
}

/// State shared between a listener's accept loop and its connection tasks.
struct Shared {
    handle: Arc<Handle<GatewayHandler>>,
    counters: Arc<Counters>,
    diagnostics: Arc<Mutex<Diagnostics>>,
    mode: Mode,
    /// Deadline for a local client to finish its SOCKS greeting.
    handshake_timeout: Duration,
}

/// Handle for a running local listener.
///
/// Dropping the handle cancels the listener and every connection it accepted.
pub struct ForwardHandle {
    local_addr: SocketAddr,
    counters: Arc<Counters>,
    diagnostics: Arc<Mutex<Diagnostics>>,
    token: CancellationToken,
    lost: CancellationToken,
    lost_message: String,
    connections: TaskTracker,
    accept_task: Option<JoinHandle<()>>,
    grace: Duration,
}

impl std::fmt::Debug for ForwardHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardHandle")
            .field("local_addr", &self.local_addr)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ForwardHandle {
    /// Address the listener is bound to (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> ForwardStats {
        self.counters.snapshot()
    }

    /// Per-connection failures recorded so far.
    pub fn warnings(&self) -> Vec<Warning> {
        self.diagnostics.lock().warnings().cloned().collect()
    }

    /// Resolve when the listener stops. Fails with `ConnectionLost` when the
    /// session died underneath it.
    pub async fn wait(&self) -> Result<()> {
        self.token.cancelled().await;
        if self.lost.is_cancelled() {
            return Err(Error::ConnectionLost(self.lost_message.clone()));
        }
        Ok(())
    }

    /// Stop accepting, cancel open connections and wait up to the grace period.
    pub async fn stop(mut self) {
        self.token.cancel();
        self.connections.close();

        let accept_task = self.accept_task.take();
        let connections = self.connections.clone();
        let drained = tokio::time::timeout(self.grace, async move {
            if let Some(task) = accept_task {
                let _ = task.await;
            }
            connections.wait().await;
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                "listener on {} did not drain within {:?}",
                self.local_addr,
                self.grace
            );
        }
    }
}

impl Drop for ForwardHandle {
    fn drop(&mut self) {
        self.token.cancel();
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

impl Session {
    /// Start a local SOCKS proxy whose connections are dialed by the gateway.
    pub async fn open_proxy_listener(&self, bind: SocketAddr) -> Result<ForwardHandle> {
        self.open_listener(bind, Mode::Socks).await
    }

    /// Forward every local connection on `bind` to `host:port` as seen from
    /// the remote dyno.
    pub async fn open_port_forward(
        &self,
        bind: SocketAddr,
        host: impl Into<String>,
        port: u16,
    ) -> Result<ForwardHandle> {
        self.open_listener(
            bind,
            Mode::Fixed {
                host: host.into(),
                port,
            },
        )
        .await
    }

    async fn open_listener(&self, bind: SocketAddr, mode: Mode) -> Result<ForwardHandle> {
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|source| Error::Bind { addr: bind, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| Error::Bind { addr: bind, source })?;

        tracing::info!("listening on {} ({:?})", local_addr, mode);

        let token = self.channel_token();
        let counters = Arc::new(Counters::default());
        let diagnostics = Arc::new(Mutex::new(Diagnostics::default()));
        let connections = TaskTracker::new();

        let shared = Arc::new(Shared {
            handle: Arc::clone(self.handle()),
            counters: Arc::clone(&counters),
            diagnostics: Arc::clone(&diagnostics),
            mode,
            handshake_timeout: self.handshake_timeout(),
        });

        let accept_task = tokio::spawn(self.tracker().track_future(accept_loop(
            listener,
            shared,
            token.clone(),
            self.tracker().clone(),
            connections.clone(),
        )));

        Ok(ForwardHandle {
            local_addr,
            counters,
            diagnostics,
            token,
            lost: self.lost_token(),
            lost_message: self.lost_reason(),
            connections,
            accept_task: Some(accept_task),
            grace: self.shutdown_grace(),
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    token: CancellationToken,
    session_tasks: TaskTracker,
    connections: TaskTracker,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                shared.counters.accepted.fetch_add(1, Ordering::Relaxed);
                shared.counters.active.fetch_add(1, Ordering::Relaxed);
                let guard = ActiveGuard(Arc::clone(&shared.counters));
                let conn = serve_connection(stream, peer, Arc::clone(&shared), token.child_token());
                tokio::spawn(session_tasks.track_future(connections.track_future(async move {
                    let _guard = guard;
                    conn.await;
                })));
            }
            Err(e) => {
                shared.counters.failures.fetch_add(1, Ordering::Relaxed);
                shared
                    .diagnostics
                    .lock()
                    .warn(Warning::accept_failed(format!("accept failed: {e}")));
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
        }
    }
    tracing::debug!("accept loop stopped");
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let _ = stream.set_nodelay(true);

    let (host, port, socks_version) = match &shared.mode {
        Mode::Fixed { host, port } => (host.clone(), *port, None),
        Mode::Socks => {
            let negotiated = tokio::select! {
                _ = cancel.cancelled() => return,
                negotiated = tokio::time::timeout(
                    shared.handshake_timeout,
                    socks::negotiate(&mut stream),
                ) => negotiated,
            };
            match negotiated {
                Ok(Ok(handshake)) => (
                    handshake.destination.host(),
                    handshake.destination.port(),
                    Some(handshake.version),
                ),
                Ok(Err(e)) => {
                    shared.counters.failures.fetch_add(1, Ordering::Relaxed);
                    let err = Error::from(e);
                    shared
                        .diagnostics
                        .lock()
                        .warn(Warning::connection_rejected(format!("{peer}: {err}")));
                    return;
                }
                Err(_) => {
                    shared.counters.failures.fetch_add(1, Ordering::Relaxed);
                    shared.diagnostics.lock().warn(Warning::connection_rejected(format!(
                        "{peer}: SOCKS handshake not completed within {:?}",
                        shared.handshake_timeout
                    )));
                    return;
                }
            }
        }
    };

    shared.counters.dials.fetch_add(1, Ordering::Relaxed);
    let opened = tokio::select! {
        _ = cancel.cancelled() => return,
        opened = shared.handle.channel_open_direct_tcpip(
            host.clone(),
            u32::from(port),
            peer.ip().to_string(),
            u32::from(peer.port()),
        ) => opened,
    };

    let channel = match opened {
        Ok(channel) => channel,
        Err(e) => {
            shared.counters.failures.fetch_add(1, Ordering::Relaxed);
            let err = Error::DialFailed {
                host,
                port,
                reason: e.to_string(),
            };
            shared
                .diagnostics
                .lock()
                .warn(Warning::dial_failed(format!("{peer}: {err}")));
            if let Some(version) = socks_version {
                let _ = socks::refuse(&mut stream, version).await;
            }
            return;
        }
    };

    if let Some(version) = socks_version {
        if let Err(e) = socks::grant(&mut stream, version).await {
            tracing::debug!("{}: failed to send SOCKS reply: {}", peer, e);
            return;
        }
    }

    tracing::debug!("{} -> {}:{} opened", peer, host, port);
    let outcome = splice(stream, channel.into_stream(), cancel).await;
    tracing::debug!(
        "{} -> {}:{} closed ({:?}, {} bytes out, {} bytes in)",
        peer,
        host,
        port,
        outcome.end,
        outcome.to_remote,
        outcome.to_local
    );
}

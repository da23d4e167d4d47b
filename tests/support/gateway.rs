// ABOUTME: In-process SSH gateway for integration tests, built on the russh server.
// ABOUTME: Authorizes registered keys once, serves shell/exec channels and dials direct-tcpip.

use parking_lot::Mutex;
use russh::keys::ssh_key::{Algorithm, HashAlg, PrivateKey, PublicKey};
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct GatewayState {
    authorized: Mutex<Vec<(PublicKey, String)>>,
    logins: Mutex<Vec<String>>,
    rejected_logins: AtomicUsize,
    dials: Mutex<Vec<(String, u32)>>,
    window_changes: Mutex<Vec<(u32, u32)>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    connections: AtomicUsize,
}

/// A running gateway on a loopback port.
pub struct Gateway {
    pub addr: SocketAddr,
    /// SHA-256 fingerprint of the gateway host key.
    pub fingerprint: String,
    state: Arc<GatewayState>,
    cancel: CancellationToken,
}

impl Gateway {
    pub async fn start() -> Self {
        let host_key = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)
            .expect("host key generation");
        let fingerprint = host_key
            .public_key()
            .fingerprint(HashAlg::Sha256)
            .to_string();

        let config = Arc::new(server::Config {
            keys: vec![host_key],
            inactivity_timeout: None,
            auth_rejection_time: Duration::from_millis(10),
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..Default::default()
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind gateway");
        let addr = listener.local_addr().expect("gateway addr");
        let state = Arc::new(GatewayState::default());
        let cancel = CancellationToken::new();

        let accept_state = Arc::clone(&state);
        let accept_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let socket = tokio::select! {
                    _ = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((socket, _)) => socket,
                        Err(_) => continue,
                    },
                };
                accept_state.connections.fetch_add(1, Ordering::SeqCst);

                let handler = GatewaySession {
                    state: Arc::clone(&accept_state),
                    shells: HashSet::new(),
                    lines: HashMap::new(),
                };
                let config = Arc::clone(&config);
                let conn_cancel = accept_cancel.clone();
                tokio::spawn(async move {
                    let running = match server::run_stream(config, socket, handler).await {
                        Ok(running) => running,
                        Err(e) => {
                            tracing::debug!("gateway handshake failed: {}", e);
                            return;
                        }
                    };
                    tokio::select! {
                        _ = conn_cancel.cancelled() => {}
                        result = running => {
                            if let Err(e) = result {
                                tracing::debug!("gateway session ended: {}", e);
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            fingerprint,
            state,
            cancel,
        }
    }

    /// Allow one login with `public_key` (OpenSSH text) as `user`.
    pub fn authorize(&self, public_key: &str, user: &str) {
        let key = PublicKey::from_openssh(public_key).expect("valid OpenSSH public key");
        self.state.authorized.lock().push((key, user.to_string()));
    }

    /// Users that logged in successfully, in order.
    pub fn logins(&self) -> Vec<String> {
        self.state.logins.lock().clone()
    }

    pub fn rejected_logins(&self) -> usize {
        self.state.rejected_logins.load(Ordering::SeqCst)
    }

    /// Destinations dialed through direct-tcpip channels.
    pub fn dials(&self) -> Vec<(String, u32)> {
        self.state.dials.lock().clone()
    }

    pub fn window_changes(&self) -> Vec<(u32, u32)> {
        self.state.window_changes.lock().clone()
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Make `path` readable through `cat`.
    pub fn put_file(&self, path: &str, contents: &[u8]) {
        self.state
            .files
            .lock()
            .insert(path.to_string(), contents.to_vec());
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct GatewaySession {
    state: Arc<GatewayState>,
    shells: HashSet<ChannelId>,
    lines: HashMap<ChannelId, Vec<u8>>,
}

impl GatewaySession {
    fn finish(session: &mut Session, channel: ChannelId, code: u32) -> Result<(), russh::Error> {
        session.exit_status_request(channel, code)?;
        session.eof(channel)?;
        session.close(channel)?;
        Ok(())
    }
}

impl server::Handler for GatewaySession {
    type Error = russh::Error;

    async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
        let mut authorized = self.state.authorized.lock();
        let position = authorized
            .iter()
            .position(|(key, expected)| key.key_data() == public_key.key_data() && expected == user);

        match position {
            Some(index) => {
                // Registered keys are single use.
                authorized.remove(index);
                self.state.logins.lock().push(user.to_string());
                Ok(Auth::Accept)
            }
            None => {
                self.state.rejected_logins.fetch_add(1, Ordering::SeqCst);
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        _channel: ChannelId,
        _term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.state.window_changes.lock().push((col_width, row_height));
        Ok(())
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        self.shells.insert(channel);
        session.channel_success(channel)?;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).to_string();

        if command == "reject" {
            session.channel_failure(channel)?;
            return Ok(());
        }
        session.channel_success(channel)?;

        if let Some(path) = command.strip_prefix("cat -- ") {
            let path = unquote(path);
            let contents = self.state.files.lock().get(&path).cloned();
            return match contents {
                Some(bytes) => {
                    for chunk in bytes.chunks(16 * 1024) {
                        session.data(channel, CryptoVec::from_slice(chunk))?;
                    }
                    Self::finish(session, channel, 0)
                }
                None => {
                    let message = format!("cat: {path}: No such file or directory\n");
                    session.extended_data(channel, 1, CryptoVec::from_slice(message.as_bytes()))?;
                    Self::finish(session, channel, 1)
                }
            };
        }

        if let Some(code) = command.strip_prefix("exit ") {
            let code = code.trim().parse().unwrap_or(1);
            return Self::finish(session, channel, code);
        }

        session.data(channel, CryptoVec::from_slice(format!("ran: {command}\r\n").as_bytes()))?;
        Self::finish(session, channel, 0)
    }

    async fn window_change_request(
        &mut self,
        _channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.state.window_changes.lock().push((col_width, row_height));
        Ok(())
    }

    async fn data(&mut self, channel: ChannelId, data: &[u8], session: &mut Session) -> Result<(), Self::Error> {
        if !self.shells.contains(&channel) {
            return Ok(());
        }

        // Echo like a terminal, and honor `exit N` lines.
        session.data(channel, CryptoVec::from_slice(data))?;
        let line = self.lines.entry(channel).or_default();
        line.extend_from_slice(data);
        while let Some(pos) = line.iter().position(|b| *b == b'\n') {
            let complete: Vec<u8> = line.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&complete);
            if let Some(code) = text.trim().strip_prefix("exit") {
                let code = code.trim().parse().unwrap_or(0);
                self.shells.remove(&channel);
                return Self::finish(session, channel, code);
            }
        }
        Ok(())
    }

    async fn channel_eof(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        if self.shells.remove(&channel) {
            Self::finish(session, channel, 0)?;
        }
        Ok(())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.state
            .dials
            .lock()
            .push((host_to_connect.to_string(), port_to_connect));

        let Ok(port) = u16::try_from(port_to_connect) else {
            return Ok(false);
        };
        let upstream = match TcpStream::connect((host_to_connect, port)).await {
            Ok(stream) => stream,
            Err(_) => return Ok(false),
        };

        tokio::spawn(async move {
            let mut upstream = upstream;
            let mut stream = channel.into_stream();
            let _ = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
        });
        Ok(true)
    }
}

/// Undo POSIX single quoting.
fn unquote(value: &str) -> String {
    let value = value.trim();
    let inner = value
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .unwrap_or(value);
    inner.replace(r"'\''", "'")
}

/// TCP relay in front of the gateway that can stop forwarding on demand,
/// leaving both sockets open so the client only notices through keep-alive.
pub struct Blackhole {
    pub addr: SocketAddr,
    freeze: CancellationToken,
    cancel: CancellationToken,
}

impl Blackhole {
    pub async fn start(upstream: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind relay");
        let addr = listener.local_addr().expect("relay addr");
        let freeze = CancellationToken::new();
        let cancel = CancellationToken::new();

        let relay_freeze = freeze.clone();
        let relay_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let (client, _) = tokio::select! {
                    _ = relay_cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(_) => continue,
                    },
                };
                let freeze = relay_freeze.clone();
                let cancel = relay_cancel.clone();
                tokio::spawn(async move {
                    let Ok(server) = TcpStream::connect(upstream).await else {
                        return;
                    };
                    let (mut client_read, mut client_write) = client.into_split();
                    let (mut server_read, mut server_write) = server.into_split();
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = freeze.cancelled() => {
                            // Hold the sockets open and silent.
                            cancel.cancelled().await;
                        }
                        _ = tokio::io::copy(&mut client_read, &mut server_write) => {}
                        _ = tokio::io::copy(&mut server_read, &mut client_write) => {}
                    }
                });
            }
        });

        Self {
            addr,
            freeze,
            cancel,
        }
    }

    /// Stop relaying bytes in both directions.
    pub fn freeze(&self) {
        self.freeze.cancel();
    }
}

impl Drop for Blackhole {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

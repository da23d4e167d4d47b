// ABOUTME: Interactive shell channel: PTY allocation, shell or single command, terminal bridge.
// ABOUTME: Raw mode is held by a guard so the local terminal is restored on every exit path.

use super::client::{LossWatch, Session};
use crate::error::{Error, Result};
use futures::{Stream, StreamExt};
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use std::io::{Cursor, IsTerminal, Read};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;

const DEFAULT_TERM: &str = "xterm-256color";

/// Chunks buffered between the stdin thread and the bridge.
const STDIN_QUEUE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl TerminalSize {
    /// Size of the controlling terminal, if there is one.
    pub fn current() -> Option<Self> {
        crossterm::terminal::size()
            .ok()
            .map(|(cols, rows)| Self { cols, rows })
    }
}

/// What to run on the remote side of a shell channel.
#[derive(Debug, Clone)]
pub struct ShellRequest {
    /// Run this command instead of a login shell.
    pub command: Option<String>,
    pub term: String,
    pub size: TerminalSize,
}

impl ShellRequest {
    pub fn login() -> Self {
        Self {
            command: None,
            term: std::env::var("TERM").unwrap_or_else(|_| DEFAULT_TERM.to_string()),
            size: TerminalSize::current().unwrap_or_default(),
        }
    }

    pub fn command(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            ..Self::login()
        }
    }
}

/// How the remote side of a shell ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellExit {
    pub exit_code: Option<u32>,
    pub signal: Option<String>,
}

impl ShellExit {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// An open shell channel, ready to be bridged to a terminal.
pub struct ShellChannel {
    channel: Channel<Msg>,
    pending: Vec<u8>,
    watch: LossWatch,
}

impl std::fmt::Debug for ShellChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellChannel")
            .field("channel", &self.channel.id())
            .finish()
    }
}

impl Session {
    /// Allocate a PTY and start a login shell or the requested command.
    pub async fn open_shell(&self, request: &ShellRequest) -> Result<ShellChannel> {
        let watch = self.loss_watch();

        let mut channel = self.handle().channel_open_session().await.map_err(|e| {
            Error::RemoteExecFailed {
                exit_code: None,
                reason: format!("failed to open session channel: {e}"),
            }
        })?;

        channel
            .request_pty(
                false,
                &request.term,
                u32::from(request.size.cols),
                u32::from(request.size.rows),
                0,
                0,
                &[],
            )
            .await
            .map_err(|e| Error::RemoteExecFailed {
                exit_code: None,
                reason: format!("PTY request failed: {e}"),
            })?;

        let started = match &request.command {
            Some(command) => {
                tracing::debug!("exec on {}: {}", self.address(), command);
                channel.exec(true, command.as_bytes()).await
            }
            None => channel.request_shell(true).await,
        };
        started.map_err(|e| Error::RemoteExecFailed {
            exit_code: None,
            reason: format!("shell request failed: {e}"),
        })?;

        // Output may race ahead of the reply; keep it for the bridge.
        let mut pending = Vec::new();
        loop {
            let msg = tokio::select! {
                _ = watch.cancelled().cancelled() => {
                    return Err(if watch.transport_lost(false) {
                        watch.error()
                    } else {
                        Error::RemoteExecFailed {
                            exit_code: None,
                            reason: "session closed before the shell started".to_string(),
                        }
                    });
                }
                msg = channel.wait() => msg,
            };
            match msg {
                Some(ChannelMsg::Success) => break,
                Some(ChannelMsg::Failure) => {
                    return Err(Error::RemoteExecFailed {
                        exit_code: None,
                        reason: "gateway rejected the shell request".to_string(),
                    });
                }
                Some(ChannelMsg::Data { ref data }) => pending.extend_from_slice(data),
                None if watch.transport_lost(true) => return Err(watch.error()),
                Some(ChannelMsg::Close) | None => {
                    return Err(Error::RemoteExecFailed {
                        exit_code: None,
                        reason: "channel closed before the shell started".to_string(),
                    });
                }
                Some(_) => {}
            }
        }

        Ok(ShellChannel {
            channel,
            pending,
            watch,
        })
    }
}

impl ShellChannel {
    /// Pump `input` to the remote side and remote output to `output`,
    /// forwarding each size from `resizes` as a window change.
    pub async fn bridge<I, O, S>(mut self, mut input: I, mut output: O, mut resizes: S) -> Result<ShellExit>
    where
        I: AsyncRead + Unpin,
        O: AsyncWrite + Unpin,
        S: Stream<Item = TerminalSize> + Unpin,
    {
        if !self.pending.is_empty() {
            output.write_all(&self.pending).await?;
            output.flush().await?;
        }

        let mut buf = vec![0u8; 8192];
        let mut input_open = true;
        let mut resizes_open = true;
        let mut channel_gone = false;
        let mut exit = ShellExit {
            exit_code: None,
            signal: None,
        };

        loop {
            tokio::select! {
                _ = self.watch.cancelled().cancelled() => {
                    if self.watch.transport_lost(false) {
                        return Err(self.watch.error());
                    }
                    let _ = self.channel.close().await;
                    break;
                }

                r = input.read(&mut buf), if input_open => match r {
                    Ok(0) => {
                        input_open = false;
                        let _ = self.channel.eof().await;
                    }
                    Ok(n) => {
                        self.channel.data(&buf[..n]).await.map_err(|e| {
                            Error::ConnectionLost(format!("failed to send input: {e}"))
                        })?;
                    }
                    Err(e) => return Err(Error::Io(e)),
                },

                size = resizes.next(), if resizes_open => match size {
                    Some(size) => {
                        if let Err(e) = self
                            .channel
                            .window_change(u32::from(size.cols), u32::from(size.rows), 0, 0)
                            .await
                        {
                            tracing::debug!("window change failed: {}", e);
                        }
                    }
                    None => resizes_open = false,
                },

                msg = self.channel.wait() => match msg {
                    Some(ChannelMsg::Data { ref data })
                    | Some(ChannelMsg::ExtendedData { ref data, .. }) => {
                        output.write_all(data).await?;
                        output.flush().await?;
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        exit.exit_code = Some(exit_status);
                    }
                    Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                        exit.signal = Some(format!("{signal_name:?}"));
                    }
                    Some(ChannelMsg::Close) => break,
                    None => {
                        channel_gone = true;
                        break;
                    }
                    Some(_) => {}
                },
            }
        }

        // A close without any exit report is only a normal end if the
        // transport is still up.
        if exit.exit_code.is_none()
            && exit.signal.is_none()
            && self.watch.transport_lost(channel_gone)
        {
            return Err(self.watch.error());
        }
        Ok(exit)
    }

    /// Bridge the local terminal: raw mode, stdin/stdout, SIGWINCH resizes.
    /// SIGTERM or SIGHUP end the bridge; the terminal is restored either way.
    pub async fn attach_terminal(self) -> Result<ShellExit> {
        let _raw = RawModeGuard::enable()?;

        let resizes = Box::pin(resize_events()?);
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut hangup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;

        tokio::select! {
            result = self.bridge(stdin_reader(), tokio::io::stdout(), resizes) => result,
            _ = terminate.recv() => Ok(ShellExit { exit_code: None, signal: Some("TERM".to_string()) }),
            _ = hangup.recv() => Ok(ShellExit { exit_code: None, signal: Some("HUP".to_string()) }),
        }
    }
}

/// Stdin read on its own OS thread.
///
/// `tokio::io::stdin` reads on the blocking pool, and a read parked there
/// keeps the runtime from shutting down until the next keystroke. A plain
/// thread is simply abandoned at process exit.
fn stdin_reader() -> impl AsyncRead + Unpin {
    let (tx, rx) = mpsc::channel::<std::io::Result<Cursor<Vec<u8>>>>(STDIN_QUEUE);
    let spawned = std::thread::Builder::new()
        .name("dyno-exec-stdin".to_string())
        .spawn(move || pump_stdin(std::io::stdin().lock(), tx));
    if let Err(e) = spawned {
        tracing::warn!("failed to start stdin reader: {}", e);
    }
    channel_reader(rx)
}

/// Copy a blocking reader into `tx` until EOF, an error or a dropped receiver.
fn pump_stdin<R: Read>(mut input: R, tx: mpsc::Sender<std::io::Result<Cursor<Vec<u8>>>>) {
    let mut buf = vec![0u8; 8192];
    loop {
        let chunk = match input.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => Ok(Cursor::new(buf[..n].to_vec())),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => Err(e),
        };
        let failed = chunk.is_err();
        if tx.blocking_send(chunk).is_err() || failed {
            return;
        }
    }
}

/// Turn a channel of chunks into an `AsyncRead` that ends when the sender does.
fn channel_reader(
    rx: mpsc::Receiver<std::io::Result<Cursor<Vec<u8>>>>,
) -> impl AsyncRead + Unpin {
    let chunks = futures::stream::unfold(rx, |mut rx| async move {
        let chunk = rx.recv().await?;
        Some((chunk, rx))
    });
    StreamReader::new(Box::pin(chunks))
}

/// Window size changes of the controlling terminal.
fn resize_events() -> Result<impl Stream<Item = TerminalSize>> {
    let winch = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change())?;
    Ok(futures::stream::unfold(winch, |mut winch| async move {
        winch.recv().await?;
        let size = TerminalSize::current()?;
        Some((size, winch))
    }))
}

/// Puts the terminal into raw mode for its lifetime.
struct RawModeGuard {
    enabled: bool,
}

impl RawModeGuard {
    fn enable() -> Result<Self> {
        if !std::io::stdin().is_terminal() {
            return Ok(Self { enabled: false });
        }
        crossterm::terminal::enable_raw_mode()?;
        Ok(Self { enabled: true })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.enabled {
            let _ = crossterm::terminal::disable_raw_mode();
        }
    }
}

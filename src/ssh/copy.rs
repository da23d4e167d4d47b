// ABOUTME: One-shot file download from the dyno over an exec channel.
// ABOUTME: Streams the remote file's bytes into a local writer.

use super::client::Session;
use crate::error::{Error, Result};
use russh::ChannelMsg;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Most stderr kept for the error message of a failed copy.
const MAX_STDERR: usize = 4096;

impl Session {
    /// Copy `remote_path` from the dyno into `writer`, returning bytes written.
    pub async fn download<W>(&self, remote_path: &str, writer: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let watch = self.loss_watch();

        let mut channel = self.handle().channel_open_session().await.map_err(|e| {
            Error::RemoteExecFailed {
                exit_code: None,
                reason: format!("failed to open session channel: {e}"),
            }
        })?;

        let command = format!("cat -- {}", shell_quote(remote_path));
        tracing::debug!("exec on {}: {}", self.address(), command);
        channel
            .exec(true, command.as_bytes())
            .await
            .map_err(|e| Error::RemoteExecFailed {
                exit_code: None,
                reason: format!("exec request failed: {e}"),
            })?;

        let mut written = 0u64;
        let mut stderr = Vec::new();
        let mut exit_code = None;
        let mut channel_gone = false;

        loop {
            let msg = tokio::select! {
                _ = watch.cancelled().cancelled() => {
                    if watch.transport_lost(false) {
                        return Err(watch.error());
                    }
                    return Err(Error::RemoteExecFailed {
                        exit_code: None,
                        reason: "session closed during copy".to_string(),
                    });
                }
                msg = channel.wait() => msg,
            };

            match msg {
                Some(ChannelMsg::Data { ref data }) => {
                    writer.write_all(data).await?;
                    written += data.len() as u64;
                }
                Some(ChannelMsg::ExtendedData { ref data, ext: 1 }) => {
                    let room = MAX_STDERR.saturating_sub(stderr.len());
                    stderr.extend_from_slice(&data[..data.len().min(room)]);
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => exit_code = Some(exit_status),
                Some(ChannelMsg::Failure) => {
                    return Err(Error::RemoteExecFailed {
                        exit_code: None,
                        reason: "gateway rejected the copy command".to_string(),
                    });
                }
                Some(ChannelMsg::Close) => break,
                None => {
                    channel_gone = true;
                    break;
                }
                Some(_) => {}
            }
        }
        if exit_code.is_none() && watch.transport_lost(channel_gone) {
            return Err(watch.error());
        }
        writer.flush().await?;

        match exit_code {
            Some(0) => {
                tracing::info!("copied {} bytes from {}", written, remote_path);
                Ok(written)
            }
            Some(code) => Err(Error::RemoteExecFailed {
                exit_code: Some(code),
                reason: String::from_utf8_lossy(&stderr).trim().to_string(),
            }),
            None => Err(Error::RemoteExecFailed {
                exit_code: None,
                reason: "channel closed without an exit status".to_string(),
            }),
        }
    }
}

/// Single-quote `value` for a POSIX shell.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

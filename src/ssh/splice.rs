// ABOUTME: Bidirectional byte pump between a local stream and a remote channel stream.
// ABOUTME: The first direction to finish ends the pair; each side is shut down exactly once.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const BUFFER_SIZE: usize = 32 * 1024;

/// Why a spliced pair ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpliceEnd {
    LocalClosed,
    RemoteClosed,
    LocalError,
    RemoteError,
    Cancelled,
}

/// Bytes moved in each direction before the pair ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpliceOutcome {
    pub end: SpliceEnd,
    pub to_remote: u64,
    pub to_local: u64,
}

/// Pump bytes between `local` and `remote` until either side finishes,
/// fails, or `cancel` fires. Both streams are consumed and dropped here.
pub async fn splice<L, R>(local: L, remote: R, cancel: CancellationToken) -> SpliceOutcome
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    let mut to_remote = 0u64;
    let mut to_local = 0u64;

    let end = tokio::select! {
        biased;
        _ = cancel.cancelled() => SpliceEnd::Cancelled,
        r = pump(&mut local_read, &mut remote_write, &mut to_remote) => match r {
            Ok(()) => SpliceEnd::LocalClosed,
            Err(Side::Read(_)) => SpliceEnd::LocalError,
            Err(Side::Write(_)) => SpliceEnd::RemoteError,
        },
        r = pump(&mut remote_read, &mut local_write, &mut to_local) => match r {
            Ok(()) => SpliceEnd::RemoteClosed,
            Err(Side::Read(_)) => SpliceEnd::RemoteError,
            Err(Side::Write(_)) => SpliceEnd::LocalError,
        },
    };

    // Shutdown errors mean the peer is already gone.
    let _ = remote_write.shutdown().await;
    let _ = local_write.shutdown().await;

    SpliceOutcome {
        end,
        to_remote,
        to_local,
    }
}

enum Side {
    Read(io::Error),
    Write(io::Error),
}

async fn pump<Rd, Wr>(reader: &mut Rd, writer: &mut Wr, counter: &mut u64) -> Result<(), Side>
where
    Rd: AsyncRead + Unpin,
    Wr: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await.map_err(Side::Read)?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await.map_err(Side::Write)?;
        writer.flush().await.map_err(Side::Write)?;
        *counter += n as u64;
    }
}

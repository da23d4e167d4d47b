// ABOUTME: Shell and copy entry points, each a single session on the target dyno.
// ABOUTME: The session is closed on every path before the remote result is reported.

use super::RemoteAccess;
use crate::error::{Error, Result};
use crate::ssh::{Session, ShellExit, ShellRequest};
use crate::types::Target;
use std::path::Path;
use tempfile::NamedTempFile;

impl RemoteAccess {
    /// Interactive shell on `target`, or a single command when one is given.
    pub async fn run_shell(&self, target: &Target, command: Option<String>) -> Result<()> {
        let request = match command {
            Some(command) => ShellRequest::command(command),
            None => ShellRequest::login(),
        };

        let session = self.establish(target).await?;
        let result = async {
            let channel = session.open_shell(&request).await?;
            channel.attach_terminal().await
        }
        .await;
        close(&session).await;

        check_exit(result?)
    }

    /// Copy `remote_path` from the dyno to `local_path`.
    ///
    /// Bytes land in a temporary file beside `local_path`, which replaces it
    /// only after the remote side reports success. A failed copy leaves any
    /// existing file untouched.
    pub async fn run_copy(&self, target: &Target, remote_path: &str, local_path: &Path) -> Result<u64> {
        let staging = staging_file(local_path)?;
        let session = self.establish(target).await?;
        let result = async {
            let mut file = tokio::fs::File::from_std(staging.as_file().try_clone()?);
            session.download(remote_path, &mut file).await
        }
        .await;
        close(&session).await;

        // Dropping `staging` on the error path deletes it.
        let copied = result?;
        staging
            .persist(local_path)
            .map_err(|e| Error::Io(e.error))?;
        Ok(copied)
    }
}

/// Hidden temporary file in the same directory as `local_path`, so the final
/// rename never crosses filesystems.
fn staging_file(local_path: &Path) -> Result<NamedTempFile> {
    let dir = local_path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    Ok(tempfile::Builder::new()
        .prefix(".dyno-exec-")
        .suffix(".part")
        .tempfile_in(dir)?)
}

async fn close(session: &Session) {
    if let Err(e) = session.close().await {
        tracing::warn!("failed to close session with {}: {}", session.address(), e);
    }
}

fn check_exit(exit: ShellExit) -> Result<()> {
    if exit.success() {
        return Ok(());
    }
    let reason = match (&exit.exit_code, &exit.signal) {
        (_, Some(signal)) => format!("terminated by signal {signal}"),
        (Some(code), None) => format!("remote process exited with status {code}"),
        (None, None) => "remote process ended without an exit status".to_string(),
    };
    Err(Error::RemoteExecFailed {
        exit_code: exit.exit_code,
        reason,
    })
}

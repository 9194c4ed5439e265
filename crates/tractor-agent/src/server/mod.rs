pub mod connection;
pub mod shutdown;

use std::path::Path;
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agent::WorkspaceSet;
use crate::errors::AgentError;

/// Bind the agent socket at `path`.
///
/// An existing socket file that accepts a connection belongs to a live agent
/// and is left alone. One that refuses is stale and is replaced.
pub async fn bind_socket(path: &Path) -> Result<UnixListener, AgentError> {
    if path.exists() {
        match UnixStream::connect(path).await {
            Ok(_) => return Err(AgentError::AlreadyRunning(path.to_path_buf())),
            Err(e) => {
                warn!(
                    event = "agent.server.stale_socket_removed",
                    socket = %path.display(),
                    error = %e,
                );
                std::fs::remove_file(path)?;
            }
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(path)?;
    info!(
        event = "agent.server.listening",
        pid = std::process::id(),
        socket = %path.display(),
    );
    Ok(listener)
}

/// Accept connections until `token` is cancelled. Each connection runs on its
/// own task, so a slow call never holds up the loop.
pub async fn accept_loop(
    listener: UnixListener,
    workspaces: Arc<WorkspaceSet>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            accept = listener.accept() => {
                match accept {
                    Ok((stream, _addr)) => {
                        tokio::spawn(connection::handle_connection(
                            stream,
                            workspaces.clone(),
                            token.clone(),
                        ));
                    }
                    Err(e) => {
                        error!(event = "agent.server.accept_failed", error = %e);
                    }
                }
            }
            _ = token.cancelled() => {
                info!(event = "agent.server.shutdown_started");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");

        let first = bind_socket(&path).await.unwrap();
        drop(first);
        assert!(path.exists());

        let _second = bind_socket(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_refuses_live_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");

        let _live = bind_socket(&path).await.unwrap();
        let err = bind_socket(&path).await.unwrap_err();
        assert!(matches!(err, AgentError::AlreadyRunning(_)));
    }

    #[tokio::test]
    async fn test_bind_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/run/agent.sock");
        let _listener = bind_socket(&path).await.unwrap();
        assert!(path.exists());
    }
}

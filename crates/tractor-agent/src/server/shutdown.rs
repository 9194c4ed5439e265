use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Cancel `token` on the first SIGINT or SIGTERM.
///
/// Fails only if a signal handler cannot be registered.
pub async fn wait_for_shutdown_signal(token: CancellationToken) -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            info!(event = "agent.server.signal_received", signal = "SIGINT");
        }
        _ = sigterm.recv() => {
            info!(event = "agent.server.signal_received", signal = "SIGTERM");
        }
        _ = token.cancelled() => return Ok(()),
    }

    token.cancel();
    Ok(())
}

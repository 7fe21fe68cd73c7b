//! Shutdown signalling.
//!
//! Nothing here installs global exit hooks: the binary waits for a signal
//! and then calls `Server::shutdown` / `Client::shutdown` itself.

/// Disconnect reason sent to clients when the server stops.
pub const REASON_SHUTTING_DOWN: &str = "shutting down";

/// Disconnect reason sent when the local user ends the session.
pub const REASON_BY_USER: &str = "by user";

/// Waits for SIGTERM or SIGINT.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

/// Waits for Ctrl-C.
#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received Ctrl-C");
    Ok(())
}

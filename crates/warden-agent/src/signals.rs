//! OS termination signals, surfaced as a channel the orchestrator selects on.
//!
//! Unix listens for SIGINT, SIGTERM and SIGQUIT (plus `ctrl_c`); other
//! platforms only for `ctrl_c`.

use tokio::sync::mpsc;

#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv()  => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// One `()` per received signal; repeated signals while a shutdown is
/// already running are delivered too and ignored by the receiver.
pub fn spawn_listener() -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        loop {
            if let Err(err) = wait_for_shutdown_signal().await {
                tracing::warn!(error = %err, "cannot install signal handlers; external stop disabled");
                return;
            }
            tracing::info!("termination signal received");
            if tx.send(()).await.is_err() {
                return;
            }
        }
    });
    rx
}

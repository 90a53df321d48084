//! Termination-signal future for process entry points.

use tracing::{error, info};

/// Resolves when the process receives SIGTERM or SIGINT (ctrl-c on non-unix targets).
///
/// Pass it to [`Worker::run_with_shutdown`](crate::runner::worker::Worker::run_with_shutdown).
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                (Err(e), _) | (_, Err(e)) => {
                    error!(error = %e, "Failed to install signal handlers, falling back to ctrl-c");
                    ctrl_c().await;
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    ctrl_c().await;
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received ctrl-c, initiating graceful shutdown"),
        Err(e) => {
            error!(error = %e, "Failed to listen for ctrl-c, shutdown must be requested explicitly");
            std::future::pending::<()>().await;
        }
    }
}

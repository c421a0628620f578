use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancel the returned token on SIGTERM or SIGINT.
///
/// The coordinator server, the fleet monitor and every worker connection
/// watch this token and drain when it fires. If the signal handlers cannot
/// be installed the token falls back to Ctrl-C.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let signals = signal(SignalKind::terminate())
            .and_then(|term| Ok((term, signal(SignalKind::interrupt())?)));

        match signals {
            Ok((mut sigterm, mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down coordinator"),
                    _ = sigint.recv() => tracing::info!("Received SIGINT, shutting down coordinator"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Signal handlers unavailable, waiting for Ctrl-C");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "Ctrl-C handler failed");
                    return;
                }
                tracing::info!("Received Ctrl-C, shutting down coordinator");
            }
        }

        trigger.cancel();
    });

    token
}

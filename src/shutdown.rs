use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

/// Install a handler that cancels the returned token on SIGTERM or SIGINT.
///
/// A cancelled token stops the worker between jobs; an in-flight container is
/// left running and its journal entry is kept.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, shutting down after the current step");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, shutting down after the current step");
            }
        }

        token_clone.cancel();
    });

    Ok(token)
}

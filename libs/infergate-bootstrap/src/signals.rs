use anyhow::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Which termination request ended the wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    CtrlC,
    Terminate,
}

/// Wait for termination signals (Ctrl+C, SIGTERM).
pub async fn wait_for_shutdown() -> Result<ShutdownSignal> {
    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .inspect_err(|e| tracing::error!(%e, "Failed to install SIGTERM handler"))?;

    #[cfg(unix)]
    let terminated = async move {
        terminate.recv().await;
    };

    #[cfg(not(unix))]
    let terminated = std::future::pending::<()>();

    let received = tokio::select! {
        result = signal::ctrl_c() => {
            result.inspect_err(|e| tracing::error!(%e, "Failed to listen for Ctrl+C"))?;
            ShutdownSignal::CtrlC
        }
        _ = terminated => ShutdownSignal::Terminate,
    };

    tracing::info!(signal = ?received, "Shutdown signal received, initiating graceful shutdown");
    Ok(received)
}

/// Cancel `token` once a termination signal arrives. Returns immediately; the
/// listener runs on the current runtime and also stops when the token is
/// cancelled by someone else.
pub fn cancel_on_shutdown(token: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            result = wait_for_shutdown() => {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "Signal listener failed; cancelling anyway");
                }
                token.cancel();
            }
            _ = token.cancelled() => {}
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn listener_exits_when_token_cancelled_elsewhere() {
        let token = CancellationToken::new();
        cancel_on_shutdown(token.clone());
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .expect("token should be observed as cancelled");
    }
}

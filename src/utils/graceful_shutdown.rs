use std::sync::{Mutex, PoisonError};

use eyre::{Result, WrapErr};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Why the switch is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT / Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// Triggered from code, e.g. a listener that failed to start
    Requested,
}

/// Turns OS signals into a single cancellation every listener observes.
///
/// Listeners take child tokens from [`GracefulShutdown::token`]; the first signal cancels them
/// all and later signals are ignored.
pub struct GracefulShutdown {
    token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Mutex::new(None),
        }
    }

    /// A token cancelled when shutdown begins.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The reason recorded by the first trigger, if any.
    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Begin shutdown. Returns `false` when shutdown was already under way.
    pub fn trigger_shutdown(&self, reason: ShutdownReason) -> bool {
        let mut current = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        if current.is_some() {
            tracing::warn!(?reason, "Shutdown already initiated, ignoring");
            return false;
        }
        *current = Some(reason);
        drop(current);

        tracing::info!(?reason, "Initiating graceful shutdown");
        self.token.cancel();
        true
    }

    /// Wait for SIGINT or SIGTERM and trigger shutdown.
    pub async fn run_signal_handler(&self) -> Result<()> {
        let terminate = terminate_signal()?;
        tracing::info!("Signal handler started. Listening for SIGTERM and SIGINT");

        tokio::select! {
            _ = self.token.cancelled() => return Ok(()),
            interrupted = signal::ctrl_c() => {
                interrupted.wrap_err("Failed to listen for Ctrl+C")?;
                self.trigger_shutdown(ShutdownReason::Interrupt);
            }
            _ = terminate => {
                self.trigger_shutdown(ShutdownReason::Terminate);
            }
        }
        Ok(())
    }

    /// Resolve once shutdown has begun.
    pub async fn wait_for_shutdown_signal(&self) -> ShutdownReason {
        self.token.cancelled().await;
        self.reason().unwrap_or(ShutdownReason::Requested)
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn terminate_signal() -> Result<impl Future<Output = ()>> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm =
        signal(SignalKind::terminate()).wrap_err("Failed to register SIGTERM handler")?;
    Ok(async move {
        sigterm.recv().await;
    })
}

#[cfg(not(unix))]
fn terminate_signal() -> Result<impl Future<Output = ()>> {
    Ok(std::future::pending::<()>())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_trigger_cancels_tokens() {
        let shutdown = GracefulShutdown::new();
        let token = shutdown.token();
        assert!(!shutdown.is_shutdown_initiated());

        assert!(shutdown.trigger_shutdown(ShutdownReason::Requested));
        assert!(token.is_cancelled());
        assert_eq!(
            shutdown.wait_for_shutdown_signal().await,
            ShutdownReason::Requested
        );
    }

    #[tokio::test]
    async fn test_first_reason_wins() {
        let shutdown = GracefulShutdown::new();
        assert!(shutdown.trigger_shutdown(ShutdownReason::Terminate));
        assert!(!shutdown.trigger_shutdown(ShutdownReason::Interrupt));
        assert_eq!(shutdown.reason(), Some(ShutdownReason::Terminate));
    }

    #[tokio::test]
    async fn test_signal_handler_returns_after_trigger() {
        let shutdown = std::sync::Arc::new(GracefulShutdown::new());
        let handler = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { shutdown.run_signal_handler().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.trigger_shutdown(ShutdownReason::Requested);
        let result = tokio::time::timeout(Duration::from_secs(1), handler).await;
        assert!(result.unwrap().unwrap().is_ok());
    }
}

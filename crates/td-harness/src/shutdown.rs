use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

// ---------------------------------------------------------------------------
// ShutdownSignal: cooperative shutdown coordination
// ---------------------------------------------------------------------------

/// Watch-based shutdown coordinator shared by the HTTP server and the
/// background scheduler.
///
/// Unlike a broadcast channel, a task that subscribes after `trigger()` still
/// observes the shutdown immediately.
///
/// ```ignore
/// let shutdown = ShutdownSignal::new();
/// let wait = shutdown.clone();
/// axum::serve(listener, app).with_graceful_shutdown(async move { wait.wait().await });
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Check if shutdown has been triggered (non-blocking).
    pub fn is_shutting_down(&self) -> bool {
        *self.rx.borrow()
    }

    /// Trigger shutdown. Later calls are no-ops.
    pub fn trigger(&self) {
        let first = self.tx.send_if_modified(|state| {
            if *state {
                false
            } else {
                *state = true;
                true
            }
        });
        if first {
            info!("shutdown signal triggered");
        }
    }

    /// Resolve once shutdown has been triggered.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // Err means every sender is gone, which only happens after drop of
        // the last clone; treat it as shutdown.
        let _ = rx.wait_for(|down| *down).await;
    }

    /// Trigger on ctrl-c, or SIGTERM on unix, from a background task.
    pub fn listen_for_os_signals(&self) {
        let signal = self.clone();
        tokio::spawn(async move {
            os_shutdown_signal().await;
            signal.trigger();
        });
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves on ctrl-c or, on unix, SIGTERM.
pub async fn os_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn new_signal_is_not_shutting_down() {
        assert!(!ShutdownSignal::new().is_shutting_down());
    }

    #[test]
    fn trigger_is_idempotent_and_shared() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();
        signal.trigger();
        signal.trigger();
        assert!(clone.is_shutting_down());
    }

    #[tokio::test]
    async fn waiters_wake_on_trigger() {
        let signal = ShutdownSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.trigger();
        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("waiter should finish")
            .unwrap();
    }

    #[tokio::test]
    async fn late_waiter_returns_immediately() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        tokio::time::timeout(Duration::from_millis(50), signal.wait())
            .await
            .expect("already triggered");
    }
}

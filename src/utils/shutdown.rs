//! Graceful shutdown handling.
//!
//! One coordinator per process, owned by whoever built the composer (no
//! ambient signal registry). SIGTERM/SIGINT fan out over a broadcast so the
//! frontends and the composer tear down together.

use tokio::signal;
use tracing::info;

pub struct ShutdownCoordinator {
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        Self { shutdown_tx }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Trigger shutdown manually.
    pub fn shutdown(&self) {
        info!("shutdown signal sent");
        let _ = self.shutdown_tx.send(());
    }

    /// Block until SIGTERM, SIGINT, or a manual trigger, then notify every
    /// subscriber.
    pub async fn wait_for_shutdown_signal(&self) {
        let mut manual = self.subscribe();
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("received Ctrl+C, starting graceful shutdown");
            }
            _ = terminate => {
                info!("received SIGTERM, starting graceful shutdown");
            }
            _ = manual.recv() => {
                return;
            }
        }

        self.shutdown();
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

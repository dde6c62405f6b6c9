//! Graceful shutdown controller for the proxy.
//!
//! Listens for SIGINT/SIGTERM and broadcasts a shutdown signal to all
//! supervised loops via a `tokio::sync::broadcast` channel.

use tokio::signal;
use tokio::sync::broadcast;

/// Coordinates graceful shutdown across every background loop.
///
/// Loops call [`subscribe`] to get a receiver, then `select!` on it
/// alongside their tick interval. When shutdown is triggered (either by OS
/// signal or programmatically), every receiver is notified.
///
/// [`subscribe`]: ShutdownController::subscribe
pub struct ShutdownController {
    tx: broadcast::Sender<()>,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    /// Get a receiver that will be notified on shutdown.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Trigger shutdown programmatically.
    pub fn shutdown(&self) {
        let _ = self.tx.send(());
    }

    /// Wait for SIGTERM or SIGINT, then trigger shutdown.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => { tracing::info!("received SIGINT, shutting down"); }
            _ = terminate => { tracing::info!("received SIGTERM, shutting down"); }
        }

        self.shutdown();
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// A loop shaped like the blacklist watcher or limiter poller:
    /// ticks until the shutdown signal wins the select.
    #[tokio::test]
    async fn supervised_loop_stops_on_shutdown() {
        let controller = ShutdownController::new();
        let mut rx = controller.subscribe();
        let ticks = Arc::new(AtomicUsize::new(0));
        let loop_ticks = Arc::clone(&ticks);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(5));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        loop_ticks.fetch_add(1, Ordering::SeqCst);
                    }
                    _ = rx.recv() => return,
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        controller.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop should exit promptly after shutdown")
            .unwrap();
        assert!(ticks.load(Ordering::SeqCst) > 0, "loop ticked before stopping");
    }

    /// The daemon wires three loops to one controller (blacklist
    /// watcher, limiter poller, aggregator flush); a single signal must
    /// reach all of them, and each gets to run its final drain step.
    #[tokio::test]
    async fn one_signal_drains_every_background_loop() {
        let controller = ShutdownController::new();
        let drained = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let mut rx = controller.subscribe();
            let drained = Arc::clone(&drained);
            handles.push(tokio::spawn(async move {
                rx.recv().await.expect("signal should arrive");
                // Final drain, as the flush loop and reject-log writer do.
                drained.fetch_add(1, Ordering::SeqCst);
            }));
        }

        controller.shutdown();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .expect("every loop should observe the signal")
                .unwrap();
        }
        assert_eq!(drained.load(Ordering::SeqCst), 3);
    }

    /// Receivers must be subscribed before the signal fires — the reason
    /// the daemon subscribes every loop up front, before it starts
    /// waiting on signals.
    #[tokio::test]
    async fn late_subscriber_misses_an_earlier_signal() {
        let controller = ShutdownController::new();
        let mut early = controller.subscribe();
        controller.shutdown();
        let mut late = controller.subscribe();

        assert!(early.recv().await.is_ok());
        let result = tokio::time::timeout(Duration::from_millis(50), late.recv()).await;
        assert!(result.is_err(), "late subscriber should see nothing");
    }
}

//! Coordinated shutdown of the scheduler, the NOTIFY ticker, the DB
//! writer and the gateway queue workers.
//!
//! Every long-lived task subscribes to one broadcast channel and
//! registers a [`WorkerGuard`] while it runs, so the coordinator can
//! wait for them to drain before the process exits.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

/// Shutdown coordinator for the daemon's background tasks
pub struct ShutdownCoordinator {
    /// Flag indicating shutdown has been initiated
    shutting_down: Arc<AtomicBool>,
    /// Broadcast channel for shutdown notifications
    shutdown_tx: broadcast::Sender<()>,
    /// Background tasks still running
    active_workers: Arc<AtomicUsize>,
    /// Maximum time to wait for workers to drain their queues
    drain_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(drain_timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            shutting_down: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            active_workers: Arc::new(AtomicUsize::new(0)),
            drain_timeout,
        }
    }

    /// Subscribe to shutdown notifications
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Registers a running worker; dropping the guard deregisters it.
    pub fn register_worker(&self) -> WorkerGuard {
        self.active_workers.fetch_add(1, Ordering::Relaxed);
        WorkerGuard {
            counter: self.active_workers.clone(),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.active_workers.load(Ordering::Relaxed)
    }

    /// Tells every subscriber to stop and waits for registered workers
    /// to finish, up to the drain timeout.
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Err(ShutdownError::AlreadyShuttingDown);
        }

        log::info!("Initiating shutdown");
        let _ = self.shutdown_tx.send(());

        log::info!("Waiting for {} workers to drain", self.worker_count());
        match timeout(self.drain_timeout, self.wait_for_workers()).await {
            Ok(_) => {
                log::info!("All workers stopped");
                Ok(())
            }
            Err(_) => {
                log::warn!(
                    "Drain timeout reached, {} workers still active",
                    self.worker_count()
                );
                Err(ShutdownError::Timeout)
            }
        }
    }

    async fn wait_for_workers(&self) {
        while self.worker_count() > 0 {
            log::debug!("Waiting for {} workers", self.worker_count());
            sleep(Duration::from_millis(100)).await;
        }
    }

    /// Spawns a task that starts the shutdown on SIGINT or SIGTERM. The
    /// task ends once the workers have drained.
    pub fn install_signal_handlers(self: Arc<Self>) -> JoinHandle<()> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let shutdown = self.clone();
            return tokio::spawn(async move {
                let (mut sigterm, mut sigint) =
                    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                        (Ok(term), Ok(int)) => (term, int),
                        (Err(e), _) | (_, Err(e)) => {
                            log::error!("Failed to register signal handlers: {}", e);
                            return;
                        }
                    };

                tokio::select! {
                    _ = sigterm.recv() => {
                        log::info!("Received SIGTERM, shutting down");
                    }
                    _ = sigint.recv() => {
                        log::info!("Received SIGINT, shutting down");
                    }
                }

                if let Err(e) = shutdown.shutdown().await {
                    log::error!("Shutdown error: {}", e);
                }
            });
        }

        #[cfg(not(unix))]
        {
            let shutdown = self.clone();
            return tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    log::error!("Failed to register Ctrl+C handler: {}", e);
                    return;
                }
                log::info!("Received Ctrl+C, shutting down");
                if let Err(e) = shutdown.shutdown().await {
                    log::error!("Shutdown error: {}", e);
                }
            });
        }
    }
}

/// Guard for tracking a running worker
pub struct WorkerGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Shutdown errors
#[derive(Debug)]
pub enum ShutdownError {
    AlreadyShuttingDown,
    Timeout,
}

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownError::AlreadyShuttingDown => write!(f, "Shutdown already in progress"),
            ShutdownError::Timeout => write!(f, "Shutdown timeout exceeded"),
        }
    }
}

impl std::error::Error for ShutdownError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_waits_for_workers() {
        let coordinator = Arc::new(ShutdownCoordinator::new(Duration::from_secs(2)));
        let mut rx = coordinator.subscribe();
        let guard = coordinator.register_worker();
        assert_eq!(coordinator.worker_count(), 1);

        let worker = tokio::spawn(async move {
            let _ = rx.recv().await;
            sleep(Duration::from_millis(50)).await;
            drop(guard);
        });

        assert!(coordinator.shutdown().await.is_ok());
        assert!(coordinator.is_shutting_down());
        assert_eq!(coordinator.worker_count(), 0);
        worker.await.unwrap();

        assert!(matches!(
            coordinator.shutdown().await,
            Err(ShutdownError::AlreadyShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_times_out_on_stuck_worker() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(100));
        let _guard = coordinator.register_worker();
        assert!(matches!(coordinator.shutdown().await, Err(ShutdownError::Timeout)));
    }
}

//! Single writer for zone status updates
//!
//! Stop reasons, delay reasons and metadata written while a transition
//! runs go through one queue drained by one task, one transaction per
//! update, in the order they were submitted. Submitters do not wait. An
//! update that hits SQLite lock contention stays at the head of the
//! queue and is tried again, either when the next update arrives or when
//! the two second watchdog fires.
//!
//! Any other database error is fatal for that update: it is logged with
//! a `FATAL:` prefix and dropped, and the writer moves on. Dropped
//! updates are counted and reported by `failures()`, which the control
//! plane shows in the engine status.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot};

use super::shutdown::ShutdownCoordinator;
use crate::errors::MusicResult;
use crate::store::Store;

const WATCHDOG: Duration = Duration::from_secs(2);

#[derive(Debug)]
enum DbOp {
    StopReason {
        zone: String,
        reason: String,
    },
    DelayReason {
        zone: String,
        reason: String,
        until: DateTime<Utc>,
    },
    Metadata {
        zone: String,
        key: String,
        value: String,
    },
    /// Answered once everything submitted before it is committed
    Flush(oneshot::Sender<()>),
}

impl DbOp {
    async fn apply(&self, store: &Store) -> MusicResult<()> {
        match self {
            DbOp::StopReason { zone, reason } => store.set_stop_reason(None, zone, reason).await,
            DbOp::DelayReason {
                zone,
                reason,
                until,
            } => store.set_delay_reason(None, zone, reason, *until).await,
            DbOp::Metadata { zone, key, value } => store.set_metadata(None, zone, key, value).await,
            DbOp::Flush(_) => Ok(()),
        }
    }
}

/// Handle for submitting updates to the writer task
#[derive(Clone)]
pub struct DbWriter {
    tx: mpsc::UnboundedSender<DbOp>,
    pending: Arc<AtomicUsize>,
    failed: Arc<AtomicUsize>,
}

impl DbWriter {
    /// Spawns the writer task. Must be called from within a tokio runtime.
    pub fn start(store: Store, shutdown: Option<&ShutdownCoordinator>) -> DbWriter {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));

        let task = WriterTask {
            store,
            queue: VecDeque::new(),
            pending: pending.clone(),
            failed: failed.clone(),
        };
        let signal = shutdown.map(|s| s.subscribe());
        let guard = shutdown.map(|s| s.register_worker());
        tokio::spawn(async move {
            task.run(rx, signal).await;
            drop(guard);
        });

        DbWriter { tx, pending, failed }
    }

    fn submit(&self, op: DbOp) {
        self.pending.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.tx.send(op) {
            self.pending.fetch_sub(1, Ordering::Relaxed);
            log::error!("DB writer is gone, dropping {:?}", e.0);
        }
    }

    pub fn stop_reason(&self, zone: &str, reason: &str) {
        self.submit(DbOp::StopReason {
            zone: zone.to_string(),
            reason: reason.to_string(),
        });
    }

    pub fn delay_reason(&self, zone: &str, reason: &str, until: DateTime<Utc>) {
        self.submit(DbOp::DelayReason {
            zone: zone.to_string(),
            reason: reason.to_string(),
            until,
        });
    }

    pub fn metadata(&self, zone: &str, key: &str, value: &str) {
        self.submit(DbOp::Metadata {
            zone: zone.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        });
    }

    /// Waits until every update submitted so far has been committed or
    /// discarded.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.pending.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(DbOp::Flush(tx)).is_err() {
            self.pending.fetch_sub(1, Ordering::Relaxed);
            return;
        }
        let _ = rx.await;
    }

    /// Updates not yet committed
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Updates dropped after a database error other than lock contention
    pub fn failures(&self) -> usize {
        self.failed.load(Ordering::Relaxed)
    }
}

enum Event {
    Received(Option<DbOp>),
    Watchdog,
    Shutdown,
}

struct WriterTask {
    store: Store,
    queue: VecDeque<DbOp>,
    pending: Arc<AtomicUsize>,
    failed: Arc<AtomicUsize>,
}

impl WriterTask {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<DbOp>, mut shutdown: Option<broadcast::Receiver<()>>) {
        let mut watchdog = tokio::time::interval(WATCHDOG);
        watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let event = match shutdown.as_mut() {
                Some(signal) => tokio::select! {
                    op = rx.recv() => Event::Received(op),
                    _ = watchdog.tick() => Event::Watchdog,
                    _ = signal.recv() => Event::Shutdown,
                },
                None => tokio::select! {
                    op = rx.recv() => Event::Received(op),
                    _ = watchdog.tick() => Event::Watchdog,
                },
            };

            match event {
                Event::Received(Some(op)) => {
                    self.queue.push_back(op);
                    self.drain().await;
                }
                Event::Received(None) => break,
                Event::Watchdog => {
                    if !self.queue.is_empty() {
                        log::debug!("DB writer watchdog: {} update(s) pending", self.queue.len());
                        self.drain().await;
                    }
                }
                Event::Shutdown => {
                    log::info!(
                        "DB writer closing, {} update(s) pending",
                        self.pending.load(Ordering::Relaxed)
                    );
                    rx.close();
                    shutdown = None;
                }
            }
        }

        // Sender side is gone; whatever is still queued gets written.
        while !self.queue.is_empty() {
            if !self.drain().await {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        log::debug!("DB writer stopped");
    }

    /// Applies queued updates in order. Returns false when it stopped at
    /// an update that met lock contention.
    async fn drain(&mut self) -> bool {
        while let Some(op) = self.queue.front() {
            match op.apply(&self.store).await {
                Ok(()) => {}
                Err(e) if e.is_locked() => {
                    log::debug!("DB writer: database locked, will retry ({})", e);
                    return false;
                }
                Err(e) => {
                    log::error!("FATAL: DB writer could not apply {:?}, dropping it: {}", op, e);
                    self.failed.fetch_add(1, Ordering::Relaxed);
                }
            }

            if let Some(DbOp::Flush(done)) = self.queue.pop_front() {
                let _ = done.send(());
            }
            self.pending.fetch_sub(1, Ordering::Relaxed);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::temp_store;
    use crate::store::{FsmMode, FsmStatus, ZoneType, PARENT_ADDR};

    #[tokio::test]
    async fn test_updates_apply_in_order() {
        let store = temp_store().await;
        store
            .add_zone(None, "example.com.", ZoneType::Normal, FsmMode::Auto)
            .await
            .unwrap();
        let writer = DbWriter::start(store.clone(), None);

        writer.stop_reason("example.com.", "first");
        writer.stop_reason("example.com.", "second");
        writer.metadata("example.com.", PARENT_ADDR, "192.0.2.53");
        writer.flush().await;

        assert_eq!(writer.pending(), 0);
        let zone = store.get_zone(None, "example.com.").await.unwrap();
        assert_eq!(zone.stop_reason, "second");
        assert_eq!(zone.fsmstatus, FsmStatus::Blocked);
        let meta = store
            .get_metadata(None, "example.com.", PARENT_ADDR)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta.value, "192.0.2.53");
    }

    #[tokio::test]
    async fn test_delay_replaces_stop() {
        let store = temp_store().await;
        store
            .add_zone(None, "example.com.", ZoneType::Normal, FsmMode::Auto)
            .await
            .unwrap();
        let writer = DbWriter::start(store.clone(), None);

        writer.stop_reason("example.com.", "parent DS missing");
        let until = Utc::now() + chrono::Duration::seconds(60);
        writer.delay_reason("example.com.", "waiting for DS propagation", until);
        writer.flush().await;

        let zone = store.get_zone(None, "example.com.").await.unwrap();
        assert_eq!(zone.fsmstatus, FsmStatus::Delayed);
        assert_eq!(zone.stop_reason, "");
        assert_eq!(zone.delay_reason, "waiting for DS propagation");
    }

    #[tokio::test]
    async fn test_failed_update_is_discarded() {
        let store = temp_store().await;
        let writer = DbWriter::start(store.clone(), None);

        // metadata on an unknown zone is a validation error, not contention
        writer.metadata("unknown.example.", PARENT_ADDR, "x");
        writer.flush().await;
        assert_eq!(writer.pending(), 0);
        assert_eq!(writer.failures(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains() {
        let store = temp_store().await;
        store
            .add_zone(None, "example.com.", ZoneType::Normal, FsmMode::Auto)
            .await
            .unwrap();
        let shutdown = ShutdownCoordinator::new(Duration::from_secs(5));
        let writer = DbWriter::start(store.clone(), Some(&shutdown));
        assert_eq!(shutdown.worker_count(), 1);

        writer.stop_reason("example.com.", "late update");
        drop(writer);
        shutdown.shutdown().await.unwrap();

        let zone = store.get_zone(None, "example.com.").await.unwrap();
        assert_eq!(zone.stop_reason, "late update");
    }
}

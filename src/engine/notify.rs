//! Parent NOTIFY queue
//!
//! Transitions that publish CDS or CSYNC ask for the parent to be told.
//! Each request waits its delay out on a one second ticker and is then
//! sent to the zone's parent.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use super::shutdown::ShutdownCoordinator;
use crate::dns::protocol::QueryType;
use crate::errors::{MusicError, MusicResult};
use crate::signer::parent::{parse_parent_addr, ParentAgent};
use crate::store::{Store, PARENT_ADDR};

/// Where the parent of `zone` can be reached: the zone's `parentaddr`
/// metadata, else the configured default. `None` when neither is set.
pub(crate) async fn resolve_parent(
    store: &Store,
    default_parent: Option<&str>,
    zone: &str,
) -> MusicResult<Option<SocketAddr>> {
    let configured = store.get_metadata(None, zone, PARENT_ADDR).await?;
    let text = match configured {
        Some(ref meta) if !meta.value.is_empty() => meta.value.as_str(),
        _ => match default_parent {
            Some(addr) => addr,
            None => return Ok(None),
        },
    };
    parse_parent_addr(text)
        .map(Some)
        .map_err(|e| MusicError::validation(format!("zone {}: {}", zone, e)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct NotifyItem {
    zone: String,
    rrtype: QueryType,
    delay: u32,
}

/// Handle for queueing parent NOTIFYs
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<NotifyItem>,
    queued: Arc<AtomicUsize>,
}

impl Notifier {
    /// Spawns the ticker task. Must be called from within a tokio runtime.
    pub fn start(
        store: Store,
        parent: Arc<dyn ParentAgent>,
        default_parent: Option<String>,
        shutdown: Option<&ShutdownCoordinator>,
    ) -> Notifier {
        let (tx, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));

        let task = NotifyTask {
            store,
            parent,
            default_parent,
            items: Vec::new(),
            queued: queued.clone(),
        };
        let signal = shutdown.map(|s| s.subscribe());
        let guard = shutdown.map(|s| s.register_worker());
        tokio::spawn(async move {
            task.run(rx, signal).await;
            drop(guard);
        });

        Notifier { tx, queued }
    }

    /// Queues a NOTIFY(`rrtype`) for `zone`, sent after `delay` seconds.
    pub fn enqueue(&self, zone: &str, rrtype: QueryType, delay: u32) {
        self.queued.fetch_add(1, Ordering::Relaxed);
        let item = NotifyItem {
            zone: zone.to_string(),
            rrtype,
            delay,
        };
        if self.tx.send(item).is_err() {
            self.queued.fetch_sub(1, Ordering::Relaxed);
            log::warn!("NOTIFY queue is closed, not notifying parent of {}", zone);
        }
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }
}

struct NotifyTask {
    store: Store,
    parent: Arc<dyn ParentAgent>,
    default_parent: Option<String>,
    items: Vec<NotifyItem>,
    queued: Arc<AtomicUsize>,
}

impl NotifyTask {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<NotifyItem>, mut shutdown: Option<broadcast::Receiver<()>>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));

        loop {
            let received = match shutdown.as_mut() {
                Some(signal) => tokio::select! {
                    item = rx.recv() => Some(item),
                    _ = ticker.tick() => None,
                    _ = signal.recv() => {
                        if !self.items.is_empty() {
                            log::info!("NOTIFY queue stopping, {} NOTIFY(s) not sent", self.items.len());
                        }
                        break;
                    }
                },
                None => tokio::select! {
                    item = rx.recv() => Some(item),
                    _ = ticker.tick() => None,
                },
            };

            match received {
                Some(Some(item)) => self.items.push(item),
                Some(None) => break,
                None => self.tick().await,
            }
        }
        log::debug!("NOTIFY queue stopped");
    }

    async fn tick(&mut self) {
        let mut due = Vec::new();
        let mut waiting = Vec::with_capacity(self.items.len());
        for mut item in self.items.drain(..) {
            if item.delay == 0 {
                due.push(item);
            } else {
                item.delay -= 1;
                waiting.push(item);
            }
        }
        self.items = waiting;

        for item in due {
            self.queued.fetch_sub(1, Ordering::Relaxed);
            self.send(&item).await;
        }
    }

    async fn send(&self, item: &NotifyItem) {
        let parent = match resolve_parent(&self.store, self.default_parent.as_deref(), &item.zone).await {
            Ok(Some(addr)) => addr,
            Ok(None) => {
                log::warn!("No parent address known for {}, NOTIFY({}) dropped", item.zone, item.rrtype);
                return;
            }
            Err(e) => {
                log::warn!("NOTIFY({}) for {} dropped: {}", item.rrtype, item.zone, e);
                return;
            }
        };

        match self.parent.notify(parent, &item.zone, item.rrtype).await {
            Ok(()) => log::info!("Sent NOTIFY({}) for {} to {}", item.rrtype, item.zone, parent),
            Err(e) => log::warn!("NOTIFY({}) for {} to {} failed: {}", item.rrtype, item.zone, parent, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::MemoryParent;
    use crate::store::testutil::temp_store;
    use crate::store::{FsmMode, ZoneType};

    #[tokio::test]
    async fn test_resolve_parent_order() {
        let store = temp_store().await;
        store
            .add_zone(None, "example.com.", ZoneType::Normal, FsmMode::Auto)
            .await
            .unwrap();

        assert_eq!(resolve_parent(&store, None, "example.com.").await.unwrap(), None);
        assert_eq!(
            resolve_parent(&store, Some("192.0.2.1:53"), "example.com.")
                .await
                .unwrap(),
            Some("192.0.2.1:53".parse().unwrap())
        );

        store
            .set_metadata(None, "example.com.", PARENT_ADDR, "192.0.2.2")
            .await
            .unwrap();
        assert_eq!(
            resolve_parent(&store, Some("192.0.2.1:53"), "example.com.")
                .await
                .unwrap(),
            Some("192.0.2.2:53".parse().unwrap())
        );

        store
            .set_metadata(None, "example.com.", PARENT_ADDR, "not an address")
            .await
            .unwrap();
        assert!(resolve_parent(&store, None, "example.com.").await.is_err());
    }

    #[tokio::test]
    async fn test_delayed_dispatch() {
        let store = temp_store().await;
        store
            .add_zone(None, "example.com.", ZoneType::Normal, FsmMode::Auto)
            .await
            .unwrap();
        let parent = Arc::new(MemoryParent::new());
        let notifier = Notifier::start(store, parent.clone(), Some("192.0.2.1:53".to_string()), None);

        notifier.enqueue("example.com.", QueryType::Cds, 0);
        notifier.enqueue("example.com.", QueryType::Csync, 2);
        assert_eq!(notifier.queued(), 2);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(parent.notifies(), vec![("example.com.".to_string(), QueryType::Cds)]);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(parent.notifies().len(), 2);
        assert_eq!(notifier.queued(), 0);
    }
}

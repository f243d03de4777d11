//! Process engine
//!
//! The [`Engine`] ties the record store, the signer gateway, the parent
//! agent and the process registry together. It attaches zones to
//! processes, steps them one transition at a time, runs the group-wide
//! signer lifecycle and owns the background tasks: the scheduler, the
//! parent NOTIFY queue and the DB writer.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::FsmEngineConfig;
use crate::fsm::Registry;
use crate::signer::{Gateway, ParentAgent};
use crate::store::Store;

pub mod context;
pub mod dbwriter;
pub mod driver;
pub mod lifecycle;
pub mod notify;
pub mod scheduler;
pub mod shutdown;

pub use context::{Outcome, ZoneCtx};
pub use dbwriter::DbWriter;
pub use notify::Notifier;
pub use scheduler::SchedulerHandle;
pub use shutdown::ShutdownCoordinator;

pub struct Engine {
    store: Store,
    gateway: Gateway,
    parent: Arc<dyn ParentAgent>,
    registry: Registry,
    config: FsmEngineConfig,
    writer: DbWriter,
    notifier: Notifier,
    scheduler: SchedulerHandle,
    /// Zones with a step in progress
    stepping: Mutex<HashSet<String>>,
}

impl Engine {
    /// Builds the engine and spawns its background tasks. The scheduler
    /// only runs when `config.active` is set; otherwise zones advance
    /// only when stepped explicitly. Must be called from within a tokio
    /// runtime.
    pub fn start(
        store: Store,
        gateway: Gateway,
        parent: Arc<dyn ParentAgent>,
        config: FsmEngineConfig,
        shutdown: Option<&ShutdownCoordinator>,
    ) -> Arc<Engine> {
        let writer = DbWriter::start(store.clone(), shutdown);
        let notifier = Notifier::start(
            store.clone(),
            parent.clone(),
            config.default_parent.clone(),
            shutdown,
        );
        let (scheduler, checks) = SchedulerHandle::new(&config.intervals);

        let engine = Arc::new(Engine {
            store,
            gateway,
            parent,
            registry: Registry::standard(),
            config,
            writer,
            notifier,
            scheduler,
            stepping: Mutex::new(HashSet::new()),
        });

        if engine.config.active {
            scheduler::spawn(&engine, checks, shutdown);
        } else {
            log::info!("Process engine inactive, zones advance only when stepped");
        }
        engine
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn parent(&self) -> &Arc<dyn ParentAgent> {
        &self.parent
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &FsmEngineConfig {
        &self.config
    }

    pub fn writer(&self) -> &DbWriter {
        &self.writer
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }
}

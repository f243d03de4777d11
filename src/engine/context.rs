//! The view of one zone that a transition works on
//!
//! A [`ZoneCtx`] is loaded at the start of a step and dropped at its
//! end. It carries snapshots of the zone and its signer group, and the
//! helpers transitions use to observe and change signers and the parent.
//! Every helper that fails records a stop reason on the context, so a
//! transition can simply return `false`.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::notify::resolve_parent;
use super::Engine;
use crate::config::FsmEngineConfig;
use crate::dns::protocol::{DnsRecord, QueryType};
use crate::store::{SignerGroup, Signer, Store, Zone};

/// Why the current step did not complete
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Blocked on an external fact
    Stop(String),
    /// Not before the given time
    Delay { reason: String, until: DateTime<Utc> },
}

impl Outcome {
    pub fn reason(&self) -> &str {
        match self {
            Outcome::Stop(reason) => reason,
            Outcome::Delay { reason, .. } => reason,
        }
    }
}

pub struct ZoneCtx {
    engine: Arc<Engine>,
    pub zone: Zone,
    pub group: SignerGroup,
    outcome: Mutex<Option<Outcome>>,
}

impl ZoneCtx {
    pub fn new(engine: Arc<Engine>, zone: Zone, group: SignerGroup) -> ZoneCtx {
        ZoneCtx {
            engine,
            zone,
            group,
            outcome: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.zone.name
    }

    pub fn store(&self) -> &Store {
        self.engine.store()
    }

    pub fn config(&self) -> &FsmEngineConfig {
        self.engine.config()
    }

    /// Every member of the zone's signer group.
    pub fn signers(&self) -> Vec<&Signer> {
        self.group.signers.iter().collect()
    }

    /// Members other than the signer the process focuses on.
    pub fn remaining_signers(&self) -> Vec<&Signer> {
        self.group
            .signers
            .iter()
            .filter(|s| s.name != self.zone.fsmsigner)
            .collect()
    }

    /// The signer being removed, taken from the zone's focus signer.
    pub fn leaving_signer(&self) -> Option<&Signer> {
        if self.zone.fsmsigner.is_empty() {
            return None;
        }
        self.group
            .signers
            .iter()
            .find(|s| s.name == self.zone.fsmsigner)
    }

    /// Records a stop reason for the zone.
    pub fn stop<S: Into<String>>(&self, reason: S) {
        let reason = reason.into();
        log::info!("Zone {}: {}", self.zone.name, reason);
        self.engine.writer().stop_reason(&self.zone.name, &reason);
        *self.outcome.lock() = Some(Outcome::Stop(reason));
    }

    /// Marks the zone as not to be stepped before `until`.
    pub fn delay<S: Into<String>>(&self, reason: S, until: DateTime<Utc>) {
        let reason = reason.into();
        log::info!("Zone {}: {} (until {})", self.zone.name, reason, until);
        self.engine
            .writer()
            .delay_reason(&self.zone.name, &reason, until);
        *self.outcome.lock() = Some(Outcome::Delay { reason, until });
    }

    /// Logs a malformed-model condition at fatal severity and blocks the
    /// zone with it.
    pub fn fatal<S: Into<String>>(&self, msg: S) {
        let msg = msg.into();
        log::error!("FATAL: zone {}: {}", self.zone.name, msg);
        self.stop(msg);
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome.lock().clone()
    }

    /// Fetches an apex RRset from one signer.
    pub async fn fetch(&self, signer: &Signer, rrtype: QueryType) -> Option<Vec<DnsRecord>> {
        let zone = &self.zone.name;
        match self
            .engine
            .gateway()
            .fetch_rrset(signer, zone, zone, rrtype)
            .await
        {
            Ok(records) => Some(records),
            Err(e) => {
                self.stop(format!("cannot fetch {} {} from {}: {}", zone, rrtype, signer.name, e));
                None
            }
        }
    }

    /// Fetches an apex RRset from each of `signers`. `None` as soon as
    /// one of them fails.
    pub async fn fetch_all<'s>(
        &self,
        signers: &[&'s Signer],
        rrtype: QueryType,
    ) -> Option<Vec<(&'s Signer, Vec<DnsRecord>)>> {
        let mut out = Vec::with_capacity(signers.len());
        for signer in signers {
            let records = self.fetch(signer, rrtype).await?;
            out.push((*signer, records));
        }
        Some(out)
    }

    /// Removes `removes` and adds `inserts` at the zone apex of one signer.
    pub async fn update(&self, signer: &Signer, inserts: &[Vec<DnsRecord>], removes: &[Vec<DnsRecord>]) -> bool {
        let zone = &self.zone.name;
        match self
            .engine
            .gateway()
            .update(signer, zone, zone, inserts, removes)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                self.stop(format!("cannot update {} on {}: {}", zone, signer.name, e));
                false
            }
        }
    }

    /// Deletes the apex RRsets whose types appear in `rrsets`.
    pub async fn remove_rrsets(&self, signer: &Signer, rrsets: &[Vec<DnsRecord>]) -> bool {
        let zone = &self.zone.name;
        match self
            .engine
            .gateway()
            .remove_rrset(signer, zone, zone, rrsets)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                self.stop(format!("cannot remove RRsets of {} on {}: {}", zone, signer.name, e));
                false
            }
        }
    }

    /// Address of the zone's parent, or a stop reason saying none is known.
    pub async fn parent_addr(&self) -> Option<SocketAddr> {
        let default_parent = self.config().default_parent.as_deref();
        match resolve_parent(self.store(), default_parent, &self.zone.name).await {
            Ok(Some(addr)) => Some(addr),
            Ok(None) => {
                self.stop(format!("no parent address known for zone {}", self.zone.name));
                None
            }
            Err(e) => {
                self.stop(e.to_string());
                None
            }
        }
    }

    /// The parent's delegation RRset (DS or NS) for the zone.
    pub async fn parent_rrset(&self, rrtype: QueryType) -> Option<Vec<DnsRecord>> {
        let parent = self.parent_addr().await?;
        match self
            .engine
            .parent()
            .delegation(parent, &self.zone.name, rrtype)
            .await
        {
            Ok(records) => Some(records),
            Err(e) => {
                self.stop(format!(
                    "cannot look up {} {} at parent {}: {}",
                    self.zone.name, rrtype, parent, e
                ));
                None
            }
        }
    }

    /// Asks for a NOTIFY(`rrtype`) to be sent to the parent.
    pub fn notify_parent(&self, rrtype: QueryType) {
        self.engine.notifier().enqueue(&self.zone.name, rrtype, 0);
    }
}

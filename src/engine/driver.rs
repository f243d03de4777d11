//! Zone driver: attaching zones to processes and stepping them

use std::collections::BTreeMap;
use std::sync::Arc;

use sqlx::SqliteConnection;

use super::{Engine, ZoneCtx};
use crate::dns::protocol::{fqdn, DnsRecord, QueryType};
use crate::errors::{MusicError, MusicResult};
use crate::fsm::{Edge, Process, STOP};
use crate::store::Zone;

/// Marks a zone as being stepped for as long as it lives.
struct StepGuard<'a> {
    engine: &'a Engine,
    zone: String,
}

impl<'a> Drop for StepGuard<'a> {
    fn drop(&mut self) {
        self.engine.stepping.lock().remove(&self.zone);
    }
}

fn choose_edge<'p>(process: &'p Process, state: &str, explicit_next: Option<&str>) -> MusicResult<&'p Edge> {
    let edges = match process.next_states(state) {
        Some(edges) => edges,
        None => {
            return Err(MusicError::validation(format!(
                "state {} does not exist in process {}",
                state, process.name
            )))
        }
    };

    match (edges, explicit_next) {
        ([], _) => Err(MusicError::internal(format!(
            "state {} of process {} has no next state",
            state, process.name
        ))),
        ([edge], None) => Ok(edge),
        (edges, Some(next)) => edges.iter().find(|e| e.to == next).ok_or_else(|| {
            MusicError::validation(format!(
                "{} is not a next state of {} in process {}",
                next, state, process.name
            ))
        }),
        (edges, None) => Err(MusicError::validation(format!(
            "multiple possible next states from {}: {}",
            state,
            edges.iter().map(|e| e.to).collect::<Vec<_>>().join(", ")
        ))),
    }
}

impl Engine {
    /// Attaches `zone` to `process` in its initial state with `focus` as
    /// the signer under focus. A zone already in a process is refused
    /// unless `preempt` is set, in which case that process is discarded.
    pub async fn attach(
        &self,
        conn: Option<&mut SqliteConnection>,
        zone: &str,
        process: &str,
        focus: &str,
        preempt: bool,
    ) -> MusicResult<String> {
        let name = fqdn(zone);
        let process = self.registry().require(process)?;

        let mut tx = self.store().tx(conn).await?;
        let current = self.store().get_zone(Some(tx.conn()), &name).await?;
        if current.sgroup.is_empty() {
            return Err(MusicError::validation(format!(
                "zone {} is not in any signer group",
                name
            )));
        }
        if current.in_process() {
            if !preempt {
                return Err(MusicError::invariant(format!(
                    "zone {} is already executing process {} (state {})",
                    name, current.fsm, current.state
                )));
            }
            log::info!(
                "Zone {}: discarding process {} in state {}",
                name,
                current.fsm,
                current.state
            );
        }

        self.store()
            .set_zone_fsm(Some(tx.conn()), &name, process.name, process.initial, focus)
            .await?;
        if current.in_process() && current.fsm != process.name {
            self.complete_process(Some(tx.conn()), &current.sgroup, &current.fsm)
                .await?;
        }
        tx.commit().await?;

        log::info!(
            "Zone {} attached to process {} in state {}",
            name,
            process.name,
            process.initial
        );
        Ok(format!(
            "Zone {} attached to process {} in state {}",
            name, process.name, process.initial
        ))
    }

    /// Detaches `zone` from `process`. An empty `process` detaches from
    /// whatever the zone executes. If it was the last zone of its group
    /// running the group's process, the group is unlocked as well.
    pub async fn detach(&self, conn: Option<&mut SqliteConnection>, zone: &str, process: &str) -> MusicResult<String> {
        let (current, closing) = self.detach_zone(conn, zone, process).await?;
        log::info!("Zone {} detached from process {}", current.name, current.fsm);
        let msg = format!("Zone {} detached from process {}", current.name, current.fsm);
        Ok(match closing {
            Some(closing) => format!("{}. {}", msg, closing),
            None => msg,
        })
    }

    /// Clears the zone's process and closes the group-wide process in
    /// the same transaction. Returns the zone as it was before.
    async fn detach_zone(
        &self,
        conn: Option<&mut SqliteConnection>,
        zone: &str,
        process: &str,
    ) -> MusicResult<(Zone, Option<String>)> {
        let name = fqdn(zone);
        let mut tx = self.store().tx(conn).await?;
        let current = self.store().get_zone(Some(tx.conn()), &name).await?;
        if !current.in_process() {
            return Err(MusicError::validation(format!(
                "zone {} is not executing any process",
                name
            )));
        }
        if !process.is_empty() && current.fsm != process {
            return Err(MusicError::validation(format!(
                "zone {} is executing {}, not {}",
                name, current.fsm, process
            )));
        }

        self.store().set_zone_fsm(Some(tx.conn()), &name, "", "", "").await?;
        let closing = self
            .complete_process(Some(tx.conn()), &current.sgroup, &current.fsm)
            .await?;
        tx.commit().await?;
        Ok((current, closing))
    }

    /// Detaches a zone that reached `stop` and closes the group-wide
    /// process if it was the last one.
    async fn finish(&self, zone: &Zone) -> MusicResult<String> {
        let (_, closing) = self.detach_zone(None, &zone.name, &zone.fsm).await?;
        log::info!("Zone {} completed process {}", zone.name, zone.fsm);
        let msg = format!("Zone {} completed process {}", zone.name, zone.fsm);
        Ok(match closing {
            Some(closing) => format!("{}. {}", msg, closing),
            None => msg,
        })
    }

    /// Tries to move `zone` one transition forward.
    ///
    /// Returns whether the zone changed state and a message saying what
    /// happened or why it is blocked. Blocking is not an error: failed
    /// pre- or post-conditions leave the state alone and record a stop or
    /// delay reason on the zone.
    pub async fn step(self: &Arc<Self>, zone: &str, explicit_next: Option<&str>) -> MusicResult<(bool, String)> {
        let name = fqdn(zone);
        {
            let mut stepping = self.stepping.lock();
            if !stepping.insert(name.clone()) {
                return Ok((false, format!("zone {} is already being stepped", name)));
            }
        }
        let _guard = StepGuard {
            engine: self,
            zone: name.clone(),
        };

        let zone = self.store().get_zone(None, &name).await?;
        if !zone.in_process() {
            return Err(MusicError::validation(format!(
                "zone {} is not executing any process",
                name
            )));
        }

        let process = match self.registry().get(&zone.fsm) {
            Some(process) => process,
            None => {
                log::error!("FATAL: zone {} is attached to unknown process {}", name, zone.fsm);
                return Err(MusicError::internal(format!(
                    "zone {} is attached to unknown process {}",
                    name, zone.fsm
                )));
            }
        };
        if !process.has_state(&zone.state) {
            log::error!(
                "FATAL: zone {} is in state {} which process {} does not have",
                name,
                zone.state,
                process.name
            );
            return Err(MusicError::internal(format!(
                "zone {} is in unknown state {} of process {}",
                name, zone.state, process.name
            )));
        }

        if zone.state == STOP {
            let msg = self.finish(&zone).await?;
            return Ok((false, msg));
        }

        let edge = match choose_edge(process, &zone.state, explicit_next) {
            Ok(edge) => edge,
            Err(e @ MusicError::Internal(_)) => {
                log::error!("FATAL: zone {}: {}", name, e);
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        let from = zone.state.clone();
        let group = self.store().get_group(None, &zone.sgroup).await?;
        let ctx = ZoneCtx::new(self.clone(), zone, group);
        let transition = edge.transition;

        log::debug!("Zone {}: trying {} -> {}", name, from, edge.to);
        let passed = (transition.pre)(&ctx).await
            && (transition.action)(&ctx).await
            && (transition.post)(&ctx).await;

        if !passed {
            let reason = match ctx.outcome() {
                Some(outcome) => outcome.reason().to_string(),
                None => {
                    let reason = format!("transition {} -> {} did not complete", from, edge.to);
                    ctx.stop(reason.clone());
                    reason
                }
            };
            self.writer().flush().await;
            return Ok((false, format!("Zone {} remains in {}: {}", name, from, reason)));
        }

        self.writer().flush().await;
        self.store().set_zone_state(None, &name, edge.to).await?;
        log::info!("Zone {} transitioned {} -> {}", name, from, edge.to);
        let mut msg = format!("Zone {} transitioned from {} to {}", name, from, edge.to);

        if edge.to == STOP {
            let mut done = ctx.zone.clone();
            done.state = STOP.to_string();
            msg = format!("{}. {}", msg, self.finish(&done).await?);
        }
        Ok((true, msg))
    }

    /// The RRset `owner`/`rrtype` as published by each member signer of
    /// the zone's group.
    pub async fn get_rrsets(
        &self,
        zone: &str,
        owner: &str,
        rrtype: QueryType,
    ) -> MusicResult<BTreeMap<String, Vec<DnsRecord>>> {
        let name = fqdn(zone);
        let owner = fqdn(owner);
        let current = self.store().get_zone(None, &name).await?;
        if current.sgroup.is_empty() {
            return Err(MusicError::validation(format!(
                "zone {} is not in any signer group",
                name
            )));
        }
        let group = self.store().get_group(None, &current.sgroup).await?;

        let mut out = BTreeMap::new();
        for signer in &group.signers {
            let records = self.gateway().fetch_rrset(signer, &name, &owner, rrtype).await?;
            out.insert(signer.name.clone(), records);
        }
        Ok(out)
    }

    /// Adds to `to` the records of `owner`/`rrtype` that `from` publishes
    /// and `to` does not.
    pub async fn copy_rrset(
        &self,
        zone: &str,
        owner: &str,
        rrtype: QueryType,
        from: &str,
        to: &str,
    ) -> MusicResult<String> {
        let name = fqdn(zone);
        let owner = fqdn(owner);
        let current = self.store().get_zone(None, &name).await?;
        let group = self.store().get_group(None, &current.sgroup).await?;

        let member = |signer: &str| {
            group.signers.iter().find(|s| s.name == signer).ok_or_else(|| {
                MusicError::validation(format!(
                    "signer {} is not a member of signer group {}",
                    signer, group.name
                ))
            })
        };
        let source = member(from)?;
        let target = member(to)?;

        let records = self.gateway().fetch_rrset(source, &name, &owner, rrtype).await?;
        let existing = self.gateway().fetch_rrset(target, &name, &owner, rrtype).await?;
        let missing: Vec<DnsRecord> = records.into_iter().filter(|r| !existing.contains(r)).collect();
        let count = missing.len();
        self.gateway()
            .update(target, &name, &owner, &[missing], &[])
            .await?;

        Ok(format!(
            "Copied {} {} {} record(s) from {} to {}",
            count, owner, rrtype, from, to
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::{always, proceed, ProcessType, Transition};

    fn fork() -> Process {
        let t = Transition {
            description: "test",
            mermaid: "test",
            pre: always,
            action: proceed,
            post: always,
        };
        Process::new("fork", ProcessType::SingleRun, "fork", "a")
            .transition("a", "b", t)
            .transition("a", "c", t)
            .transition("b", STOP, t)
    }

    #[test]
    fn test_choose_edge() {
        let process = fork();
        assert_eq!(choose_edge(&process, "b", None).unwrap().to, STOP);
        assert_eq!(choose_edge(&process, "a", Some("c")).unwrap().to, "c");

        let err = choose_edge(&process, "a", None).unwrap_err();
        assert!(err.to_string().contains("multiple possible next states"));
        assert!(matches!(
            choose_edge(&process, "a", Some("d")),
            Err(MusicError::Validation(_))
        ));
        assert!(matches!(
            choose_edge(&process, "nowhere", None),
            Err(MusicError::Validation(_))
        ));
        // c was only ever a target
        assert!(matches!(
            choose_edge(&process, "c", None),
            Err(MusicError::Internal(_))
        ));
    }
}

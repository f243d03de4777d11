//! Signer group lifecycle
//!
//! Joining or leaving a group that holds zones starts a process on every
//! one of those zones and locks the group until the last of them has
//! finished. Only one such change can be in flight per group.

use sqlx::SqliteConnection;

use super::Engine;
use crate::dns::protocol::fqdn;
use crate::errors::{MusicError, MusicResult};
use crate::fsm::checks::{attribute, origin_type};
use crate::fsm::{ADD_SIGNER, REMOVE_SIGNER};
use crate::store::records::OriginKind;
use crate::store::{Signer, SignerGroup};

fn check_unlocked(group: &SignerGroup) -> MusicResult<()> {
    if group.locked || !group.curprocess.is_empty() {
        return Err(MusicError::invariant(format!(
            "signer group {} is locked by process {}",
            group.name, group.curprocess
        )));
    }
    if !group.pendadd.is_empty() {
        return Err(MusicError::invariant(format!(
            "signer group {} is still adding signer {}",
            group.name, group.pendadd
        )));
    }
    if !group.pendremove.is_empty() {
        return Err(MusicError::invariant(format!(
            "signer group {} is still removing signer {}",
            group.name, group.pendremove
        )));
    }
    Ok(())
}

impl Engine {
    /// Makes `signer` a member of `group`. With at least two members and
    /// any zones, every zone of the group starts add-signer.
    pub async fn join_group(&self, signer: &str, group: &str) -> MusicResult<String> {
        let mut tx = self.store().tx(None).await?;
        let g = self.store().get_group(Some(tx.conn()), group).await?;
        self.store().get_signer(Some(tx.conn()), signer).await?;

        if g.has_member(signer) {
            return Err(MusicError::invariant(format!(
                "signer {} is already a member of signer group {}",
                signer, group
            )));
        }
        check_unlocked(&g)?;

        self.store().add_group_member(Some(tx.conn()), group, signer).await?;
        let zones = self.store().zones_in_group(Some(tx.conn()), group).await?;

        let mut msg = format!("Signer {} joined signer group {}", signer, group);
        let started = g.signers.len() + 1 >= 2 && !zones.is_empty();
        if started {
            self.store()
                .set_group_process(Some(tx.conn()), group, ADD_SIGNER, signer, "")
                .await?;
            for zone in &zones {
                self.attach(Some(tx.conn()), &zone.name, ADD_SIGNER, signer, true).await?;
            }
            msg = format!(
                "{}. Process {} started for {} zone(s)",
                msg,
                ADD_SIGNER,
                zones.len()
            );
        }
        tx.commit().await?;

        log::info!("{}", msg);
        if started {
            for zone in &zones {
                self.scheduler().check_now(&zone.name);
            }
        }
        Ok(msg)
    }

    /// Takes `signer` out of `group`. Without zones the membership goes
    /// at once; otherwise every zone starts remove-signer and the signer
    /// stays a member until they have all finished.
    pub async fn leave_group(&self, signer: &str, group: &str) -> MusicResult<String> {
        let mut tx = self.store().tx(None).await?;
        let g = self.store().get_group(Some(tx.conn()), group).await?;

        if !g.has_member(signer) {
            return Err(MusicError::invariant(format!(
                "signer {} is not a member of signer group {}",
                signer, group
            )));
        }
        check_unlocked(&g)?;

        let zones = self.store().zones_in_group(Some(tx.conn()), group).await?;
        if zones.is_empty() {
            self.store().remove_group_member(Some(tx.conn()), group, signer).await?;
            tx.commit().await?;
            log::info!("Signer {} left signer group {}", signer, group);
            return Ok(format!("Signer {} left signer group {}", signer, group));
        }

        if g.signers.len() <= 1 {
            return Err(MusicError::invariant(format!(
                "signer {} is the last signer of signer group {}, which still has {} zone(s)",
                signer,
                group,
                zones.len()
            )));
        }

        self.store()
            .set_group_process(Some(tx.conn()), group, REMOVE_SIGNER, "", signer)
            .await?;
        for zone in &zones {
            self.attach(Some(tx.conn()), &zone.name, REMOVE_SIGNER, signer, true).await?;
        }
        tx.commit().await?;

        let msg = format!(
            "Signer {} is leaving signer group {}. Process {} started for {} zone(s)",
            signer,
            group,
            REMOVE_SIGNER,
            zones.len()
        );
        log::info!("{}", msg);
        for zone in &zones {
            self.scheduler().check_now(&zone.name);
        }
        Ok(msg)
    }

    /// Puts a zone into a signer group and records which member
    /// introduced each of its DNSKEYs and NS names.
    pub async fn zone_join_group(&self, zone: &str, group: &str) -> MusicResult<String> {
        let name = fqdn(zone);
        let mut tx = self.store().tx(None).await?;
        let current = self.store().get_zone(Some(tx.conn()), &name).await?;
        let g = self.store().get_group(Some(tx.conn()), group).await?;

        if !current.sgroup.is_empty() {
            return Err(MusicError::invariant(format!(
                "zone {} is already in signer group {}",
                name, current.sgroup
            )));
        }
        if g.locked {
            return Err(MusicError::invariant(format!(
                "signer group {} is locked by process {}",
                group, g.curprocess
            )));
        }

        self.store().set_zone_group(Some(tx.conn()), &name, group).await?;
        tx.commit().await?;
        log::info!("Zone {} joined signer group {}", name, group);

        let signers: Vec<&Signer> = g.signers.iter().collect();
        for kind in [OriginKind::Dnskey, OriginKind::Ns] {
            if let Err(e) = self.record_member_origins(&name, &signers, kind).await {
                log::warn!("Zone {}: could not record {:?} origins: {}", name, kind, e);
            }
        }
        Ok(format!("Zone {} joined signer group {}", name, group))
    }

    async fn record_member_origins(&self, zone: &str, signers: &[&Signer], kind: OriginKind) -> MusicResult<()> {
        let rrtype = origin_type(kind);
        let mut rrsets = Vec::with_capacity(signers.len());
        for signer in signers {
            let records = self.gateway().fetch_rrset(signer, zone, zone, rrtype).await?;
            rrsets.push((*signer, records));
        }
        for (item, signer) in attribute(kind, &rrsets) {
            match kind {
                OriginKind::Dnskey => self.store().record_dnskey_origin(None, zone, &item, &signer).await?,
                OriginKind::Ns => self.store().record_ns_origin(None, zone, &item, &signer).await?,
            };
        }
        Ok(())
    }

    /// Takes a zone out of its signer group.
    pub async fn zone_leave_group(&self, zone: &str, group: &str) -> MusicResult<String> {
        let name = fqdn(zone);
        let mut tx = self.store().tx(None).await?;
        let current = self.store().get_zone(Some(tx.conn()), &name).await?;

        if current.sgroup != group {
            return Err(MusicError::validation(format!(
                "zone {} is not in signer group {}",
                name, group
            )));
        }
        if current.in_process() {
            return Err(MusicError::invariant(format!(
                "zone {} is executing process {} and cannot leave signer group {}",
                name, current.fsm, group
            )));
        }

        self.store().set_zone_group(Some(tx.conn()), &name, "").await?;
        tx.commit().await?;
        log::info!("Zone {} left signer group {}", name, group);
        Ok(format!("Zone {} left signer group {}", name, group))
    }

    /// Called whenever a zone of `group` leaves `process`, by finishing
    /// it, by being detached or by being preempted. When it was the last
    /// zone running the group's current process the group is unlocked
    /// and, for remove-signer, the leaving signer dropped along with its
    /// key and NS origins. Returns the closing message then.
    pub async fn complete_process(
        &self,
        conn: Option<&mut SqliteConnection>,
        group: &str,
        process: &str,
    ) -> MusicResult<Option<String>> {
        if group.is_empty() {
            return Ok(None);
        }
        let mut tx = self.store().tx(conn).await?;
        let g = self.store().get_group(Some(tx.conn()), group).await?;
        if g.curprocess.is_empty() || g.curprocess != process {
            return Ok(None);
        }
        let left = self
            .store()
            .count_process_zones(Some(tx.conn()), group, process)
            .await?;
        if left > 0 {
            log::debug!("Signer group {}: {} zone(s) still in {}", group, left, process);
            return Ok(None);
        }

        let mut msg = format!("Process {} complete for every zone of signer group {}", process, group);
        if process == REMOVE_SIGNER && !g.pendremove.is_empty() {
            self.store()
                .remove_group_member(Some(tx.conn()), group, &g.pendremove)
                .await?;
            for zone in self.store().zones_in_group(Some(tx.conn()), group).await? {
                self.store()
                    .delete_origins_of_signer(Some(tx.conn()), &zone.name, &g.pendremove)
                    .await?;
            }
            msg = format!("{}. Signer {} removed from the group", msg, g.pendremove);
        }
        self.store().clear_group_process(Some(tx.conn()), group).await?;
        tx.commit().await?;

        log::info!("{}", msg);
        Ok(Some(msg))
    }
}

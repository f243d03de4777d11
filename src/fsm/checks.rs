//! Observations and actions shared by the processes
//!
//! Every helper takes the zone context and a list of signers to act on.
//! Helpers that find a problem record it on the context and return
//! `false`, so transitions can chain them with plain `if !..`.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{Duration as ChronoDuration, Utc};

use crate::dns::dnssec::{self, DigestType};
use crate::dns::protocol::{DnsRecord, QueryType, TransientTtl};
use crate::engine::ZoneCtx;
use crate::store::records::OriginKind;
use crate::store::Signer;

/// CSYNC flags: immediate, soaminimum
pub const CSYNC_FLAGS: u16 = 3;

/// Types a CSYNC asks the parent to copy
pub const CSYNC_TYPES: [QueryType; 3] = [QueryType::A, QueryType::Ns, QueryType::Aaaa];

/// Keeps every record of an RRset.
pub fn any_record(_: &DnsRecord) -> bool {
    true
}

/// Human readable identity of a record for stop reasons.
pub fn describe(record: &DnsRecord) -> String {
    match record {
        DnsRecord::Dnskey { .. } | DnsRecord::Cdnskey { .. } | DnsRecord::Ds { .. } | DnsRecord::Cds { .. } => {
            match dnssec::key_tag(record) {
                Ok(tag) => format!("keytag {}", tag),
                Err(_) => record.rdata_text(),
            }
        }
        DnsRecord::Ns { host, .. } => host.clone(),
        other => other.rdata_text(),
    }
}

fn describe_all<'a, I: IntoIterator<Item = &'a DnsRecord>>(records: I) -> String {
    records.into_iter().map(describe).collect::<Vec<_>>().join(", ")
}

/// Union of the records `keep` accepts across every fetched RRset.
pub fn union(rrsets: &[(&Signer, Vec<DnsRecord>)], keep: fn(&DnsRecord) -> bool) -> BTreeSet<DnsRecord> {
    rrsets
        .iter()
        .flat_map(|(_, records)| records.iter())
        .filter(|r| keep(r))
        .cloned()
        .collect()
}

/// Largest TTL in any of the RRsets, 0 when all are empty.
pub fn max_ttl<'a, I: IntoIterator<Item = &'a DnsRecord>>(records: I) -> u32 {
    records.into_iter().map(DnsRecord::get_ttl).max().unwrap_or(0)
}

/// Makes every signer publish the union of the `keep` records of
/// `rrtype` found across `signers`. Inserted records take the TTL the
/// receiving signer already uses for the RRset.
pub async fn merge_rrset(ctx: &ZoneCtx, signers: &[&Signer], rrtype: QueryType, keep: fn(&DnsRecord) -> bool) -> bool {
    let rrsets = match ctx.fetch_all(signers, rrtype).await {
        Some(rrsets) => rrsets,
        None => return false,
    };
    let wanted = union(&rrsets, keep);

    for (signer, records) in &rrsets {
        let present: BTreeSet<&DnsRecord> = records.iter().collect();
        let ttl = records.first().map(DnsRecord::get_ttl);
        let missing: Vec<DnsRecord> = wanted
            .iter()
            .filter(|r| !present.contains(r))
            .map(|r| match ttl {
                Some(ttl) => r.with_ttl(ttl),
                None => r.clone(),
            })
            .collect();
        if missing.is_empty() {
            continue;
        }
        log::info!(
            "Zone {}: adding {} to {} {}",
            ctx.name(),
            describe_all(&missing),
            signer.name,
            rrtype
        );
        if !ctx.update(signer, &[missing], &[]).await {
            return false;
        }
    }
    true
}

/// Checks that every signer publishes the union of the `keep` records
/// of `rrtype`.
pub async fn verify_union(ctx: &ZoneCtx, signers: &[&Signer], rrtype: QueryType, keep: fn(&DnsRecord) -> bool) -> bool {
    let rrsets = match ctx.fetch_all(signers, rrtype).await {
        Some(rrsets) => rrsets,
        None => return false,
    };
    let wanted = union(&rrsets, keep);

    for (signer, records) in &rrsets {
        let missing: Vec<&DnsRecord> = wanted.iter().filter(|r| !records.contains(r)).collect();
        if !missing.is_empty() {
            ctx.stop(format!(
                "signer {} lacks {} {}",
                signer.name,
                rrtype,
                describe_all(missing)
            ));
            return false;
        }
    }
    true
}

/// Identity of a record in the origin table of `kind`.
pub fn origin_item(kind: OriginKind, record: &DnsRecord) -> Option<String> {
    match (kind, record) {
        (OriginKind::Dnskey, DnsRecord::Dnskey { .. }) => dnssec::fingerprint(record),
        (OriginKind::Ns, DnsRecord::Ns { host, .. }) => Some(host.clone()),
        _ => None,
    }
}

/// The record type an origin table tracks.
pub fn origin_type(kind: OriginKind) -> QueryType {
    match kind {
        OriginKind::Dnskey => QueryType::Dnskey,
        OriginKind::Ns => QueryType::Ns,
    }
}

/// Pairs of (item, signer) for the items published by exactly one of
/// the signers. Shared items have no single origin.
pub fn attribute(kind: OriginKind, rrsets: &[(&Signer, Vec<DnsRecord>)]) -> Vec<(String, String)> {
    let mut seen: BTreeMap<String, Vec<&str>> = BTreeMap::new();
    for (signer, records) in rrsets {
        for item in records.iter().filter_map(|r| origin_item(kind, r)) {
            let owners = seen.entry(item).or_default();
            if !owners.contains(&signer.name.as_str()) {
                owners.push(&signer.name);
            }
        }
    }
    seen.into_iter()
        .filter(|(_, owners)| owners.len() == 1)
        .map(|(item, owners)| (item, owners[0].to_string()))
        .collect()
}

/// Remembers which signer introduced each DNSKEY or NS.
pub async fn record_origins(ctx: &ZoneCtx, signers: &[&Signer], kind: OriginKind) -> bool {
    let rrsets = match ctx.fetch_all(signers, origin_type(kind)).await {
        Some(rrsets) => rrsets,
        None => return false,
    };

    for (item, signer) in attribute(kind, &rrsets) {
        let result = match kind {
            OriginKind::Dnskey => ctx.store().record_dnskey_origin(None, ctx.name(), &item, &signer).await,
            OriginKind::Ns => ctx.store().record_ns_origin(None, ctx.name(), &item, &signer).await,
        };
        if let Err(e) = result {
            ctx.stop(format!("cannot record origin of {}: {}", item, e));
            return false;
        }
    }
    true
}

/// The DNSKEY fingerprints or NS names `leaving` introduced into the
/// zone. Taken from the origin table; when nothing was recorded for the
/// signer, falls back to what it publishes (cached, else fetched) minus
/// anything attributed to another signer.
pub async fn leaving_items(ctx: &ZoneCtx, leaving: &Signer, kind: OriginKind) -> Option<BTreeSet<String>> {
    let recorded = match ctx.store().list_origins(None, kind, ctx.name()).await {
        Ok(recorded) => recorded,
        Err(e) => {
            ctx.stop(format!("cannot read origins of {}: {}", ctx.name(), e));
            return None;
        }
    };
    let own: BTreeSet<String> = recorded
        .iter()
        .filter(|o| o.signer == leaving.name)
        .map(|o| o.item.clone())
        .collect();
    if !own.is_empty() {
        return Some(own);
    }

    let others: BTreeSet<&str> = recorded.iter().map(|o| o.item.as_str()).collect();
    let rrtype = origin_type(kind);
    let published = match ctx
        .store()
        .cached_rrset(None, ctx.name(), ctx.name(), &leaving.name, rrtype)
        .await
    {
        Ok(cached) if !cached.is_empty() => cached,
        _ => ctx.fetch(leaving, rrtype).await?,
    };
    log::debug!(
        "Zone {}: no {:?} origins recorded for {}, using its published {}",
        ctx.name(),
        kind,
        leaving.name,
        rrtype
    );
    Some(
        published
            .iter()
            .filter_map(|r| origin_item(kind, r))
            .filter(|item| !others.contains(item.as_str()))
            .collect(),
    )
}

/// NS host names the parent delegates the zone to.
pub async fn parent_ns_hosts(ctx: &ZoneCtx) -> Option<BTreeSet<String>> {
    let records = ctx.parent_rrset(QueryType::Ns).await?;
    Some(
        records
            .iter()
            .filter_map(|r| origin_item(OriginKind::Ns, r))
            .collect(),
    )
}

/// The CDS and CDNSKEY records for every KSK published by `signers`.
async fn wanted_cds(ctx: &ZoneCtx, signers: &[&Signer]) -> Option<(BTreeSet<DnsRecord>, BTreeSet<DnsRecord>)> {
    let dnskeys = ctx.fetch_all(signers, QueryType::Dnskey).await?;
    let ksks = union(&dnskeys, dnssec::is_ksk);

    let mut cds = BTreeSet::new();
    let mut cdnskey = BTreeSet::new();
    for ksk in &ksks {
        match dnssec::cds_from_dnskey(ksk, DigestType::Sha256) {
            Ok(record) => {
                cds.insert(record);
            }
            Err(e) => {
                ctx.stop(format!("cannot derive CDS from {}: {}", describe(ksk), e));
                return None;
            }
        }
        if let Some(record) = dnssec::cdnskey_from_dnskey(ksk) {
            cdnskey.insert(record);
        }
    }
    Some((cds, cdnskey))
}

/// Brings an RRset on one signer to exactly `wanted`.
async fn replace_with(ctx: &ZoneCtx, signer: &Signer, rrtype: QueryType, wanted: &BTreeSet<DnsRecord>) -> Option<(Vec<DnsRecord>, Vec<DnsRecord>)> {
    let current = ctx.fetch(signer, rrtype).await?;
    let removes: Vec<DnsRecord> = current.iter().filter(|r| !wanted.contains(r)).cloned().collect();
    let inserts: Vec<DnsRecord> = wanted.iter().filter(|r| !current.contains(r)).cloned().collect();
    Some((inserts, removes))
}

/// Publishes CDS (SHA-256) and CDNSKEY for the KSKs of `signers` on each
/// of them, then asks for the parent to be notified.
pub async fn publish_cds(ctx: &ZoneCtx, signers: &[&Signer]) -> bool {
    let (cds, cdnskey) = match wanted_cds(ctx, signers).await {
        Some(wanted) => wanted,
        None => return false,
    };
    if cds.is_empty() {
        ctx.stop(format!("no KSK published by any signer of {}", ctx.name()));
        return false;
    }

    for signer in signers {
        let (cds_in, cds_out) = match replace_with(ctx, signer, QueryType::Cds, &cds).await {
            Some(diff) => diff,
            None => return false,
        };
        let (key_in, key_out) = match replace_with(ctx, signer, QueryType::Cdnskey, &cdnskey).await {
            Some(diff) => diff,
            None => return false,
        };
        if !ctx.update(signer, &[cds_in, key_in], &[cds_out, key_out]).await {
            return false;
        }
    }
    ctx.notify_parent(QueryType::Cds);
    true
}

/// Checks that every signer publishes exactly the CDS and CDNSKEY
/// records for the current KSK union.
pub async fn cds_published(ctx: &ZoneCtx, signers: &[&Signer]) -> bool {
    let (cds, cdnskey) = match wanted_cds(ctx, signers).await {
        Some(wanted) => wanted,
        None => return false,
    };
    for (rrtype, wanted) in [(QueryType::Cds, &cds), (QueryType::Cdnskey, &cdnskey)] {
        let rrsets = match ctx.fetch_all(signers, rrtype).await {
            Some(rrsets) => rrsets,
            None => return false,
        };
        for (signer, records) in rrsets {
            let published: BTreeSet<DnsRecord> = records.into_iter().collect();
            if &published != wanted {
                ctx.stop(format!("signer {} does not publish the expected {} RRset", signer.name, rrtype));
                return false;
            }
        }
    }
    true
}

/// Checks that the key tags of the parent's DS set are exactly the key
/// tags of the KSKs published by `signers`.
pub async fn parent_ds_matches(ctx: &ZoneCtx, signers: &[&Signer]) -> bool {
    let dnskeys = match ctx.fetch_all(signers, QueryType::Dnskey).await {
        Some(rrsets) => rrsets,
        None => return false,
    };
    let mut expected = BTreeSet::new();
    for ksk in union(&dnskeys, dnssec::is_ksk) {
        match dnssec::key_tag(&ksk) {
            Ok(tag) => {
                expected.insert(tag);
            }
            Err(e) => {
                ctx.stop(format!("cannot compute key tag of a KSK of {}: {}", ctx.name(), e));
                return false;
            }
        }
    }

    let parent_ds = match ctx.parent_rrset(QueryType::Ds).await {
        Some(records) => records,
        None => return false,
    };
    let present: BTreeSet<u16> = parent_ds
        .iter()
        .filter_map(|ds| dnssec::key_tag(ds).ok())
        .collect();

    let missing: Vec<String> = expected.difference(&present).map(u16::to_string).collect();
    let extra: Vec<String> = present.difference(&expected).map(u16::to_string).collect();
    if missing.is_empty() && extra.is_empty() {
        return true;
    }

    let mut problems = Vec::new();
    if !missing.is_empty() {
        problems.push(format!("missing DS keytag(s) {}", missing.join(", ")));
    }
    if !extra.is_empty() {
        problems.push(format!("unexpected DS keytag(s) {}", extra.join(", ")));
    }
    ctx.stop(format!("parent DS for {} not in sync: {}", ctx.name(), problems.join("; ")));
    false
}

/// Publishes a CSYNC carrying each signer's own SOA serial, then asks
/// for the parent to be notified.
pub async fn publish_csync(ctx: &ZoneCtx, signers: &[&Signer]) -> bool {
    for signer in signers {
        let soa = match ctx.fetch(signer, QueryType::Soa).await {
            Some(records) => records,
            None => return false,
        };
        let serial = match soa.iter().find_map(|r| match r {
            DnsRecord::Soa { serial, .. } => Some(*serial),
            _ => None,
        }) {
            Some(serial) => serial,
            None => {
                ctx.stop(format!("signer {} returned no SOA for {}", signer.name, ctx.name()));
                return false;
            }
        };

        let csync = DnsRecord::Csync {
            domain: ctx.name().to_string(),
            serial,
            flags: CSYNC_FLAGS,
            types: CSYNC_TYPES.to_vec(),
            ttl: TransientTtl(ctx.config().csync_ttl),
        };
        let wanted: BTreeSet<DnsRecord> = std::iter::once(csync).collect();
        let (inserts, removes) = match replace_with(ctx, signer, QueryType::Csync, &wanted).await {
            Some(diff) => diff,
            None => return false,
        };
        if !ctx.update(signer, &[inserts], &[removes]).await {
            return false;
        }
    }
    ctx.notify_parent(QueryType::Csync);
    true
}

pub async fn csync_published(ctx: &ZoneCtx, signers: &[&Signer]) -> bool {
    let rrsets = match ctx.fetch_all(signers, QueryType::Csync).await {
        Some(rrsets) => rrsets,
        None => return false,
    };
    for (signer, records) in rrsets {
        if records.is_empty() {
            ctx.stop(format!("signer {} publishes no CSYNC for {}", signer.name, ctx.name()));
            return false;
        }
    }
    true
}

/// Deletes the apex RRsets of `types` on every signer that has them.
pub async fn remove_types(ctx: &ZoneCtx, signers: &[&Signer], types: &[QueryType]) -> bool {
    for signer in signers {
        let mut rrsets = Vec::with_capacity(types.len());
        for rrtype in types {
            match ctx.fetch(signer, *rrtype).await {
                Some(records) if !records.is_empty() => rrsets.push(records),
                Some(_) => {}
                None => return false,
            }
        }
        if !rrsets.is_empty() && !ctx.remove_rrsets(signer, &rrsets).await {
            return false;
        }
    }
    true
}

/// Checks that no signer still publishes any of `types` at the apex.
pub async fn types_absent(ctx: &ZoneCtx, signers: &[&Signer], types: &[QueryType]) -> bool {
    for rrtype in types {
        let rrsets = match ctx.fetch_all(signers, *rrtype).await {
            Some(rrsets) => rrsets,
            None => return false,
        };
        for (signer, records) in rrsets {
            if !records.is_empty() {
                ctx.stop(format!("signer {} still publishes {} for {}", signer.name, rrtype, ctx.name()));
                return false;
            }
        }
    }
    true
}

/// True once the zone has been in its current state long enough for
/// data with `ttl` to expire from caches. Otherwise the zone is delayed
/// until that moment.
pub fn wait_propagation(ctx: &ZoneCtx, ttl: u32, what: &str) -> bool {
    let propagation = &ctx.config().propagation;
    let wait = match propagation.fixed_wait {
        Some(fixed) => fixed,
        None => propagation.min_wait.max(u64::from(ttl)),
    };
    let deadline = ctx.zone.statestamp + ChronoDuration::seconds(wait as i64);
    if Utc::now() >= deadline {
        return true;
    }
    ctx.delay(format!("waiting {}s for {} to propagate", wait, what), deadline);
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer(name: &str) -> Signer {
        Signer {
            name: name.to_string(),
            method: "memory".to_string(),
            auth: String::new(),
            address: String::new(),
            port: 53,
            usetcp: false,
            usetsig: false,
        }
    }

    fn rr(text: &str) -> DnsRecord {
        text.parse().unwrap()
    }

    #[test]
    fn test_union_filters_and_dedups() {
        let s1 = signer("s1");
        let s2 = signer("s2");
        let ksk = rr("example.com. 3600 IN DNSKEY 257 3 13 S1KSKAAA");
        let z1 = rr("example.com. 3600 IN DNSKEY 256 3 13 S1ZSKAAA");
        let z2 = rr("example.com. 300 IN DNSKEY 256 3 13 S2ZSKAAA");
        let rrsets = vec![
            (&s1, vec![ksk, z1.clone()]),
            (&s2, vec![z2.clone(), z1.with_ttl(60)]),
        ];

        let zsks = union(&rrsets, dnssec::is_zsk);
        assert_eq!(zsks.len(), 2);
        assert!(zsks.contains(&z1));
        assert!(zsks.contains(&z2));
        assert_eq!(union(&rrsets, any_record).len(), 3);
        assert_eq!(max_ttl(rrsets.iter().flat_map(|(_, r)| r.iter())), 3600);
    }

    #[test]
    fn test_describe() {
        assert_eq!(describe(&rr("example.com. 3600 IN NS ns1.example.net.")), "ns1.example.net.");
        let ds = rr("example.com. 3600 IN DS 12345 13 2 ABCDEF");
        assert_eq!(describe(&ds), "keytag 12345");
    }
}

//! remove-signer: take a signer out of the multi-signer setup
//!
//! Runs in the opposite order to add-signer. The leaving signer's NS
//! names go first and the parent follows through CSYNC; after the NS
//! TTL has passed its DNSKEYs are withdrawn from the remaining signers
//! and the parent DS set follows through CDS/CDNSKEY. The leaving signer
//! is the zone's focus signer and stays in the group until every zone
//! has finished.

use std::collections::BTreeSet;

use futures::future::BoxFuture;

use super::checks::{self, any_record};
use super::{always, proceed, Process, ProcessType, Transition, REMOVE_SIGNER, STOP};
use crate::dns::dnssec;
use crate::dns::protocol::{DnsRecord, QueryType};
use crate::engine::ZoneCtx;
use crate::store::records::OriginKind;
use crate::store::Signer;

pub const SIGNERS_UNSYNCED: &str = "signers-unsynced";
pub const NSES_SYNCED: &str = "nses-synced";
pub const CSYNC_ADDED: &str = "csync-added";
pub const PARENT_NS_SYNCED: &str = "parent-ns-synced";
pub const NS_PROPAGATED: &str = "ns-propagated";
pub const DNSKEYS_SYNCED: &str = "dnskeys-synced";
pub const CDS_ADDED: &str = "cds-added";
pub const PARENT_DS_SYNCED: &str = "parent-ds-synced";

pub fn process() -> Process {
    Process::new(
        REMOVE_SIGNER,
        ProcessType::SingleRun,
        "Remove a signer from the signer group of the zone",
        SIGNERS_UNSYNCED,
    )
    .transition(
        SIGNERS_UNSYNCED,
        NSES_SYNCED,
        Transition {
            description: "Remove the leaving signer's NS names from the remaining signers",
            mermaid: "remove leaving NS",
            pre: has_leaving_signer,
            action: remove_leaving_nses,
            post: leaving_nses_gone,
        },
    )
    .transition(
        NSES_SYNCED,
        CSYNC_ADDED,
        Transition {
            description: "Publish CSYNC on the remaining signers",
            mermaid: "publish CSYNC",
            pre: leaving_nses_gone,
            action: publish_csync,
            post: csync_published,
        },
    )
    .transition(
        CSYNC_ADDED,
        PARENT_NS_SYNCED,
        Transition {
            description: "Wait for the parent NS set to drop the leaving signer's NS names",
            mermaid: "parent NS excludes leaving signer",
            pre: parent_ns_excludes,
            action: proceed,
            post: always,
        },
    )
    .transition(
        PARENT_NS_SYNCED,
        NS_PROPAGATED,
        Transition {
            description: "Wait for the old NS RRsets to expire from caches, then withdraw CSYNC",
            mermaid: "NS propagated",
            pre: ns_propagated,
            action: remove_csync,
            post: csync_removed,
        },
    )
    .transition(
        NS_PROPAGATED,
        DNSKEYS_SYNCED,
        Transition {
            description: "Remove the leaving signer's DNSKEYs from the remaining signers",
            mermaid: "remove leaving DNSKEYs",
            pre: has_leaving_signer,
            action: remove_leaving_dnskeys,
            post: leaving_dnskeys_gone,
        },
    )
    .transition(
        DNSKEYS_SYNCED,
        CDS_ADDED,
        Transition {
            description: "Publish CDS and CDNSKEY for the remaining KSKs",
            mermaid: "publish CDS/CDNSKEY",
            pre: leaving_dnskeys_gone,
            action: publish_cds,
            post: cds_published,
        },
    )
    .transition(
        CDS_ADDED,
        PARENT_DS_SYNCED,
        Transition {
            description: "Wait for the parent DS set to match the remaining KSKs",
            mermaid: "parent DS matches",
            pre: parent_ds_matches,
            action: proceed,
            post: always,
        },
    )
    .transition(
        PARENT_DS_SYNCED,
        STOP,
        Transition {
            description: "Withdraw CDS and CDNSKEY from the remaining signers",
            mermaid: "remove CDS/CDNSKEY",
            pre: always,
            action: remove_cds,
            post: cds_removed,
        },
    )
}

fn leaving(ctx: &ZoneCtx) -> Option<&Signer> {
    match ctx.leaving_signer() {
        Some(signer) => Some(signer),
        None => {
            ctx.fatal(format!(
                "zone {} runs {} without a leaving signer in group {}",
                ctx.name(),
                REMOVE_SIGNER,
                ctx.group.name
            ));
            None
        }
    }
}

fn has_leaving_signer(ctx: &ZoneCtx) -> BoxFuture<'_, bool> {
    Box::pin(async move {
        if leaving(ctx).is_none() {
            return false;
        }
        if ctx.remaining_signers().is_empty() {
            ctx.stop(format!("no signer of {} would remain", ctx.name()));
            return false;
        }
        true
    })
}

/// Removes from each remaining signer the records of `rrtype` whose
/// origin identity is in `items`. A signer that would be left without
/// any record of the type blocks the zone instead.
async fn withdraw(ctx: &ZoneCtx, kind: OriginKind, rrtype: QueryType, items: &BTreeSet<String>) -> bool {
    for signer in ctx.remaining_signers() {
        let records = match ctx.fetch(signer, rrtype).await {
            Some(records) => records,
            None => return false,
        };
        let (removes, keeps): (Vec<DnsRecord>, Vec<DnsRecord>) = records.into_iter().partition(|r| {
            checks::origin_item(kind, r)
                .map(|item| items.contains(&item))
                .unwrap_or(false)
        });
        if removes.is_empty() {
            continue;
        }
        if keeps.is_empty() {
            ctx.stop(format!(
                "removing {} {} from {} would leave it without {}",
                rrtype,
                removes.iter().map(checks::describe).collect::<Vec<_>>().join(", "),
                signer.name,
                rrtype
            ));
            return false;
        }
        if !ctx.update(signer, &[], &[removes]).await {
            return false;
        }
    }
    true
}

/// Checks that no remaining signer still publishes anything the leaving
/// signer introduced.
async fn withdrawn(ctx: &ZoneCtx, kind: OriginKind, rrtype: QueryType) -> bool {
    let leaving = match leaving(ctx) {
        Some(signer) => signer,
        None => return false,
    };
    let items = match checks::leaving_items(ctx, leaving, kind).await {
        Some(items) => items,
        None => return false,
    };
    let remaining = ctx.remaining_signers();
    let rrsets = match ctx.fetch_all(&remaining, rrtype).await {
        Some(rrsets) => rrsets,
        None => return false,
    };
    for (signer, records) in rrsets {
        let left: Vec<String> = records
            .iter()
            .filter(|r| {
                checks::origin_item(kind, r)
                    .map(|item| items.contains(&item))
                    .unwrap_or(false)
            })
            .map(checks::describe)
            .collect();
        if !left.is_empty() {
            ctx.stop(format!(
                "signer {} still publishes {} {} of leaving signer {}",
                signer.name,
                rrtype,
                left.join(", "),
                leaving.name
            ));
            return false;
        }
    }
    true
}

async fn remove_leaving(ctx: &ZoneCtx, kind: OriginKind, rrtype: QueryType) -> bool {
    let leaving = match leaving(ctx) {
        Some(signer) => signer,
        None => return false,
    };
    let items = match checks::leaving_items(ctx, leaving, kind).await {
        Some(items) => items,
        None => return false,
    };
    if items.is_empty() {
        log::info!(
            "Zone {}: leaving signer {} introduced no {}",
            ctx.name(),
            leaving.name,
            rrtype
        );
        return true;
    }
    withdraw(ctx, kind, rrtype, &items).await
}

fn remove_leaving_nses(ctx: &ZoneCtx) -> BoxFuture<'_, bool> {
    Box::pin(remove_leaving(ctx, OriginKind::Ns, QueryType::Ns))
}

fn leaving_nses_gone(ctx: &ZoneCtx) -> BoxFuture<'_, bool> {
    Box::pin(withdrawn(ctx, OriginKind::Ns, QueryType::Ns))
}

fn publish_csync(ctx: &ZoneCtx) -> BoxFuture<'_, bool> {
    Box::pin(async move { checks::publish_csync(ctx, &ctx.remaining_signers()).await })
}

fn csync_published(ctx: &ZoneCtx) -> BoxFuture<'_, bool> {
    Box::pin(async move { checks::csync_published(ctx, &ctx.remaining_signers()).await })
}

fn parent_ns_excludes(ctx: &ZoneCtx) -> BoxFuture<'_, bool> {
    Box::pin(async move {
        let leaving = match leaving(ctx) {
            Some(signer) => signer,
            None => return false,
        };
        let hosts = match checks::leaving_items(ctx, leaving, OriginKind::Ns).await {
            Some(hosts) => hosts,
            None => return false,
        };
        let parent = match checks::parent_ns_hosts(ctx).await {
            Some(parent) => parent,
            None => return false,
        };
        if parent.is_empty() {
            ctx.stop(format!("parent returned no NS for {}", ctx.name()));
            return false;
        }
        let left: Vec<&String> = parent.intersection(&hosts).collect();
        if left.is_empty() {
            return true;
        }
        ctx.stop(format!(
            "parent NS for {} still contains {}",
            ctx.name(),
            left.iter().map(|h| h.as_str()).collect::<Vec<_>>().join(", ")
        ));
        false
    })
}

fn ns_propagated(ctx: &ZoneCtx) -> BoxFuture<'_, bool> {
    Box::pin(async move {
        let remaining = ctx.remaining_signers();
        let nses = match ctx.fetch_all(&remaining, QueryType::Ns).await {
            Some(rrsets) => rrsets,
            None => return false,
        };
        let parent = match ctx.parent_rrset(QueryType::Ns).await {
            Some(records) => records,
            None => return false,
        };
        let ttl = checks::max_ttl(
            nses.iter()
                .flat_map(|(_, records)| records.iter())
                .chain(parent.iter()),
        );
        checks::wait_propagation(ctx, ttl, "NS")
    })
}

fn remove_csync(ctx: &ZoneCtx) -> BoxFuture<'_, bool> {
    Box::pin(async move { checks::remove_types(ctx, &ctx.remaining_signers(), &[QueryType::Csync]).await })
}

fn csync_removed(ctx: &ZoneCtx) -> BoxFuture<'_, bool> {
    Box::pin(async move { checks::types_absent(ctx, &ctx.remaining_signers(), &[QueryType::Csync]).await })
}

fn remove_leaving_dnskeys(ctx: &ZoneCtx) -> BoxFuture<'_, bool> {
    Box::pin(remove_leaving(ctx, OriginKind::Dnskey, QueryType::Dnskey))
}

fn leaving_dnskeys_gone(ctx: &ZoneCtx) -> BoxFuture<'_, bool> {
    Box::pin(async move {
        let remaining = ctx.remaining_signers();
        withdrawn(ctx, OriginKind::Dnskey, QueryType::Dnskey).await
            && checks::verify_union(ctx, &remaining, QueryType::Dnskey, dnssec::is_zsk).await
    })
}

fn publish_cds(ctx: &ZoneCtx) -> BoxFuture<'_, bool> {
    Box::pin(async move { checks::publish_cds(ctx, &ctx.remaining_signers()).await })
}

fn cds_published(ctx: &ZoneCtx) -> BoxFuture<'_, bool> {
    Box::pin(async move { checks::cds_published(ctx, &ctx.remaining_signers()).await })
}

fn parent_ds_matches(ctx: &ZoneCtx) -> BoxFuture<'_, bool> {
    Box::pin(async move { checks::parent_ds_matches(ctx, &ctx.remaining_signers()).await })
}

fn remove_cds(ctx: &ZoneCtx) -> BoxFuture<'_, bool> {
    Box::pin(async move {
        checks::remove_types(ctx, &ctx.remaining_signers(), &[QueryType::Cds, QueryType::Cdnskey]).await
    })
}

fn cds_removed(ctx: &ZoneCtx) -> BoxFuture<'_, bool> {
    Box::pin(async move {
        checks::types_absent(ctx, &ctx.remaining_signers(), &[QueryType::Cds, QueryType::Cdnskey]).await
    })
}

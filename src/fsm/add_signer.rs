//! add-signer: bring a newly joined signer into the multi-signer setup
//!
//! The ZSKs of all members are merged first, then the parent DS set is
//! moved to cover every KSK via CDS/CDNSKEY, and only once that has
//! propagated is the NS set merged and the parent told to follow with
//! CSYNC.

use futures::future::BoxFuture;

use super::checks::{self, any_record};
use super::{always, proceed, Process, ProcessType, Transition, ADD_SIGNER};
use crate::dns::dnssec;
use crate::dns::protocol::QueryType;
use crate::engine::ZoneCtx;
use crate::store::records::OriginKind;

pub const SIGNERS_UNSYNCED: &str = "signers-unsynced";
pub const DNSKEYS_SYNCED: &str = "dnskeys-synced";
pub const CDS_ADDED: &str = "cds-added";
pub const PARENT_DS_SYNCED: &str = "parent-ds-synced";
pub const DS_PROPAGATED: &str = "ds-propagated";
pub const CSYNC_ADDED: &str = "csync-added";
pub const PARENT_NS_SYNCED: &str = "parent-ns-synced";

pub fn process() -> Process {
    Process::new(
        ADD_SIGNER,
        ProcessType::SingleRun,
        "Add a signer to the signer group of the zone",
        SIGNERS_UNSYNCED,
    )
    .transition(
        SIGNERS_UNSYNCED,
        DNSKEYS_SYNCED,
        Transition {
            description: "Publish the ZSKs of every signer on every signer",
            mermaid: "merge ZSKs",
            pre: dnskeys_reachable,
            action: merge_zsks,
            post: zsks_synced,
        },
    )
    .transition(
        DNSKEYS_SYNCED,
        CDS_ADDED,
        Transition {
            description: "Publish CDS and CDNSKEY for every KSK on every signer",
            mermaid: "publish CDS/CDNSKEY",
            pre: zsks_synced,
            action: publish_cds,
            post: cds_published,
        },
    )
    .transition(
        CDS_ADDED,
        PARENT_DS_SYNCED,
        Transition {
            description: "Wait for the parent DS set to match the KSKs, then withdraw CDS and CDNSKEY",
            mermaid: "parent DS matches",
            pre: parent_ds_matches,
            action: remove_cds,
            post: cds_removed,
        },
    )
    .transition(
        PARENT_DS_SYNCED,
        DS_PROPAGATED,
        Transition {
            description: "Wait for the old DNSKEY and DS RRsets to expire from caches",
            mermaid: "DS propagated",
            pre: ds_propagated,
            action: proceed,
            post: always,
        },
    )
    .transition(
        DS_PROPAGATED,
        CSYNC_ADDED,
        Transition {
            description: "Merge the NS RRsets of every signer and publish CSYNC",
            mermaid: "merge NS, publish CSYNC",
            pre: nses_reachable,
            action: merge_ns_publish_csync,
            post: csync_published,
        },
    )
    .transition(
        CSYNC_ADDED,
        PARENT_NS_SYNCED,
        Transition {
            description: "Wait for the parent NS set to cover every signer's NS names",
            mermaid: "parent NS covers signers",
            pre: parent_ns_covers,
            action: proceed,
            post: always,
        },
    )
    .transition(
        PARENT_NS_SYNCED,
        super::STOP,
        Transition {
            description: "Withdraw CSYNC from every signer",
            mermaid: "remove CSYNC",
            pre: always,
            action: remove_csync,
            post: csync_removed,
        },
    )
}

fn dnskeys_reachable(ctx: &ZoneCtx) -> BoxFuture<'_, bool> {
    Box::pin(async move {
        let signers = ctx.signers();
        ctx.fetch_all(&signers, QueryType::Dnskey).await.is_some()
    })
}

fn merge_zsks(ctx: &ZoneCtx) -> BoxFuture<'_, bool> {
    Box::pin(async move {
        let signers = ctx.signers();
        checks::record_origins(ctx, &signers, OriginKind::Dnskey).await
            && checks::merge_rrset(ctx, &signers, QueryType::Dnskey, dnssec::is_zsk).await
    })
}

fn zsks_synced(ctx: &ZoneCtx) -> BoxFuture<'_, bool> {
    Box::pin(async move {
        let signers = ctx.signers();
        checks::verify_union(ctx, &signers, QueryType::Dnskey, dnssec::is_zsk).await
    })
}

fn publish_cds(ctx: &ZoneCtx) -> BoxFuture<'_, bool> {
    Box::pin(async move { checks::publish_cds(ctx, &ctx.signers()).await })
}

fn cds_published(ctx: &ZoneCtx) -> BoxFuture<'_, bool> {
    Box::pin(async move { checks::cds_published(ctx, &ctx.signers()).await })
}

fn parent_ds_matches(ctx: &ZoneCtx) -> BoxFuture<'_, bool> {
    Box::pin(async move { checks::parent_ds_matches(ctx, &ctx.signers()).await })
}

fn remove_cds(ctx: &ZoneCtx) -> BoxFuture<'_, bool> {
    Box::pin(async move { checks::remove_types(ctx, &ctx.signers(), &[QueryType::Cds, QueryType::Cdnskey]).await })
}

fn cds_removed(ctx: &ZoneCtx) -> BoxFuture<'_, bool> {
    Box::pin(async move { checks::types_absent(ctx, &ctx.signers(), &[QueryType::Cds, QueryType::Cdnskey]).await })
}

fn ds_propagated(ctx: &ZoneCtx) -> BoxFuture<'_, bool> {
    Box::pin(async move {
        let signers = ctx.signers();
        let dnskeys = match ctx.fetch_all(&signers, QueryType::Dnskey).await {
            Some(rrsets) => rrsets,
            None => return false,
        };
        let parent_ds = match ctx.parent_rrset(QueryType::Ds).await {
            Some(records) => records,
            None => return false,
        };
        let ttl = checks::max_ttl(
            dnskeys
                .iter()
                .flat_map(|(_, records)| records.iter())
                .chain(parent_ds.iter()),
        );
        checks::wait_propagation(ctx, ttl, "DNSKEY and DS")
    })
}

fn nses_reachable(ctx: &ZoneCtx) -> BoxFuture<'_, bool> {
    Box::pin(async move {
        let signers = ctx.signers();
        ctx.fetch_all(&signers, QueryType::Ns).await.is_some()
    })
}

fn merge_ns_publish_csync(ctx: &ZoneCtx) -> BoxFuture<'_, bool> {
    Box::pin(async move {
        let signers = ctx.signers();
        checks::record_origins(ctx, &signers, OriginKind::Ns).await
            && checks::merge_rrset(ctx, &signers, QueryType::Ns, any_record).await
            && checks::publish_csync(ctx, &signers).await
    })
}

fn csync_published(ctx: &ZoneCtx) -> BoxFuture<'_, bool> {
    Box::pin(async move {
        let signers = ctx.signers();
        checks::verify_union(ctx, &signers, QueryType::Ns, any_record).await
            && checks::csync_published(ctx, &signers).await
    })
}

fn parent_ns_covers(ctx: &ZoneCtx) -> BoxFuture<'_, bool> {
    Box::pin(async move {
        let signers = ctx.signers();
        let nses = match ctx.fetch_all(&signers, QueryType::Ns).await {
            Some(rrsets) => rrsets,
            None => return false,
        };
        let parent = match checks::parent_ns_hosts(ctx).await {
            Some(hosts) => hosts,
            None => return false,
        };
        let missing: Vec<String> = checks::union(&nses, any_record)
            .iter()
            .filter_map(|r| checks::origin_item(OriginKind::Ns, r))
            .filter(|host| !parent.contains(host))
            .collect();
        if missing.is_empty() {
            return true;
        }
        ctx.stop(format!(
            "parent NS for {} lacks {}",
            ctx.name(),
            missing.join(", ")
        ));
        false
    })
}

fn remove_csync(ctx: &ZoneCtx) -> BoxFuture<'_, bool> {
    Box::pin(async move { checks::remove_types(ctx, &ctx.signers(), &[QueryType::Csync]).await })
}

fn csync_removed(ctx: &ZoneCtx) -> BoxFuture<'_, bool> {
    Box::pin(async move { checks::types_absent(ctx, &ctx.signers(), &[QueryType::Csync]).await })
}

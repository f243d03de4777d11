mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use music::dns::protocol::QueryType;
use music::errors::MusicError;
use music::signer::{Gateway, MemoryBackend, QueueLimits, RateLimited};
use music::store::{Signer, Store};

fn limited_signer(name: &str) -> Signer {
    Signer {
        name: name.to_string(),
        method: "rlmemory".to_string(),
        auth: String::new(),
        address: String::new(),
        port: 53,
        usetcp: true,
        usetsig: false,
    }
}

async fn limited_gateway(retries: u32) -> (Store, Arc<MemoryBackend>, Gateway) {
    let store = temp_store().await;
    let memory = Arc::new(MemoryBackend::new());
    let mut gateway = Gateway::new(store.clone());
    gateway.register(Arc::new(RateLimited::new(
        "rlmemory",
        memory.clone(),
        QueueLimits {
            fetch_per_sec: 2,
            update_per_sec: 2,
            throttle_retries: retries,
        },
        None,
    )));
    (store, memory, gateway)
}

#[tokio::test]
async fn test_throttled_fetch_succeeds_after_retry() {
    let (store, memory, gateway) = limited_gateway(3).await;
    let signer = limited_signer("s1");
    store.add_signer(None, &signer).await.unwrap();
    memory.set_rrset("s1", ZONE, QueryType::Ns, vec![ns("ns1.s1.example.net.")]);
    memory.throttle_next(1, Duration::from_millis(200));

    let records = gateway
        .fetch_rrset(&signer, ZONE, ZONE, QueryType::Ns)
        .await
        .unwrap();
    assert_eq!(records, vec![ns("ns1.s1.example.net.")]);
    assert_eq!(memory.call_times().len(), 2);

    let depths = gateway.queue_depths();
    assert!(depths.iter().any(|(method, f, u)| method == "rlmemory" && *f == 0 && *u == 0));
}

#[tokio::test]
async fn test_persistent_throttle_is_reported() {
    let (store, memory, gateway) = limited_gateway(1).await;
    let signer = limited_signer("s1");
    store.add_signer(None, &signer).await.unwrap();
    memory.throttle_next(10, Duration::from_millis(100));

    let err = gateway
        .fetch_rrset(&signer, ZONE, ZONE, QueryType::Dnskey)
        .await
        .unwrap_err();
    assert!(matches!(err, MusicError::Throttled { .. }), "{}", err);
}

#[tokio::test]
async fn test_fetch_replaces_cache() {
    let (store, memory, gateway) = limited_gateway(0).await;
    let signer = limited_signer("s1");
    store.add_signer(None, &signer).await.unwrap();

    memory.set_rrset("s1", ZONE, QueryType::Dnskey, vec![ksk(K1), zsk(Z1)]);
    gateway
        .fetch_rrset(&signer, ZONE, ZONE, QueryType::Dnskey)
        .await
        .unwrap();
    let cached = store
        .cached_rrset(None, ZONE, ZONE, "s1", QueryType::Dnskey)
        .await
        .unwrap();
    assert_eq!(cached.len(), 2);

    memory.set_rrset("s1", ZONE, QueryType::Dnskey, vec![ksk(K1)]);
    gateway
        .fetch_rrset(&signer, ZONE, ZONE, QueryType::Dnskey)
        .await
        .unwrap();
    let cached = store
        .cached_rrset(None, ZONE, ZONE, "s1", QueryType::Dnskey)
        .await
        .unwrap();
    assert_eq!(cached, vec![ksk(K1)]);
}

#[tokio::test]
async fn test_unknown_method_is_refused() {
    let (_store, _memory, gateway) = limited_gateway(0).await;
    let mut signer = limited_signer("s9");
    signer.method = "carrier-pigeon".to_string();
    let err = gateway
        .fetch_rrset(&signer, ZONE, ZONE, QueryType::Ns)
        .await
        .unwrap_err();
    assert!(matches!(err, MusicError::Validation(_)));
}

//! Shared setup for the integration tests: a fresh database, an
//! in-memory signer backend and an in-memory parent.

#![allow(dead_code)]

use std::sync::Arc;

use music::config::{FsmEngineConfig, PropagationConfig};
use music::dns::dnssec::{self, DigestType};
use music::dns::protocol::{DnsRecord, QueryType};
use music::engine::Engine;
use music::signer::{Gateway, MemoryBackend, MemoryParent};
use music::store::{FsmMode, Signer, Store, ZoneType};

pub const ZONE: &str = "example.com.";

pub const K1: &str = "r6u0EQZ2I6Zgcc1XSMKGn89s8YRRWERNIyOWghbkrSiSbMNGUr6fIsyki4pFUL9HzLGtjUyw7zjy9vh4wJK/Rg==";
pub const Z1: &str = "uF5fpuTsOTHOFAemu+VhcGjSd0GEUjDv/P1Vif9v4VZbIurNvAmnS7mn3tmeDNXYMYO3y9/kYYVl4o88YfmkdA==";
pub const K2: &str = "i4QI59b7r5o1aVRU9RkkC/drEDafXe1xCRz5BL9oQNuL28m6KZ3qoEsKSBF+4DWNazBjAmLtMwZ2vzHrW+Q/pA==";
pub const Z2: &str = "iu+/PvK16YK9J2DQy2czQnZ6kZK5zvNWQytuXxOVEx2Ax5zAKwOKRMoqrcd3M1rYvI6SlgMXKrMlSOoJcdRmoA==";

pub fn rr(text: &str) -> DnsRecord {
    text.parse().unwrap()
}

pub fn ksk(key: &str) -> DnsRecord {
    rr(&format!("{} 3600 IN DNSKEY 257 3 13 {}", ZONE, key))
}

pub fn zsk(key: &str) -> DnsRecord {
    rr(&format!("{} 3600 IN DNSKEY 256 3 13 {}", ZONE, key))
}

pub fn ns(host: &str) -> DnsRecord {
    rr(&format!("{} 3600 IN NS {}", ZONE, host))
}

pub fn ds_for(keys: &[&str]) -> Vec<DnsRecord> {
    keys.iter()
        .map(|key| dnssec::ds_from_dnskey(&ksk(key), DigestType::Sha256).unwrap())
        .collect()
}

pub async fn temp_store() -> Store {
    let path = std::env::temp_dir().join(format!("music-it-{}.db", uuid::Uuid::new_v4()));
    Store::open(path.to_str().unwrap()).await.unwrap()
}

pub fn engine_config(active: bool) -> FsmEngineConfig {
    FsmEngineConfig {
        active,
        propagation: PropagationConfig {
            min_wait: 60,
            fixed_wait: Some(0),
        },
        default_parent: Some("192.0.2.53:53".to_string()),
        ..FsmEngineConfig::default()
    }
}

pub struct Harness {
    pub store: Store,
    pub memory: Arc<MemoryBackend>,
    pub parent: Arc<MemoryParent>,
    pub engine: Arc<Engine>,
}

impl Harness {
    pub async fn new() -> Harness {
        Harness::with_config(engine_config(false)).await
    }

    pub async fn with_config(config: FsmEngineConfig) -> Harness {
        let store = temp_store().await;
        let memory = Arc::new(MemoryBackend::new());
        let parent = Arc::new(MemoryParent::new());
        let mut gateway = Gateway::new(store.clone());
        gateway.register(memory.clone());
        let engine = Engine::start(store.clone(), gateway, parent.clone(), config, None);
        Harness {
            store,
            memory,
            parent,
            engine,
        }
    }

    pub async fn add_signer(&self, name: &str) {
        let signer = Signer {
            name: name.to_string(),
            method: "memory".to_string(),
            auth: String::new(),
            address: String::new(),
            port: 53,
            usetcp: true,
            usetsig: false,
        };
        self.store.add_signer(None, &signer).await.unwrap();
    }

    pub async fn add_zone(&self, zone: &str) {
        self.store
            .add_zone(None, zone, ZoneType::Normal, FsmMode::Manual)
            .await
            .unwrap();
    }

    /// What one signer publishes at the apex of the test zone.
    pub fn publish(&self, signer: &str, ksk_key: &str, zsk_key: &str, ns_host: &str, serial: u32) {
        self.memory
            .set_rrset(signer, ZONE, QueryType::Dnskey, vec![ksk(ksk_key), zsk(zsk_key)]);
        self.memory.set_rrset(signer, ZONE, QueryType::Ns, vec![ns(ns_host)]);
        self.memory.set_rrset(
            signer,
            ZONE,
            QueryType::Soa,
            vec![rr(&format!(
                "{} 3600 IN SOA {} hostmaster.example.com. {} 7200 3600 1209600 300",
                ZONE, ns_host, serial
            ))],
        );
    }

    /// Group gA with s1 and the test zone, s1 publishing K1/Z1 and
    /// ns1.s1.example.net. The parent delegates to exactly that.
    pub async fn one_signer_zone(&self) {
        self.add_signer("s1").await;
        self.add_signer("s2").await;
        self.store.add_group(None, "gA").await.unwrap();
        self.engine.join_group("s1", "gA").await.unwrap();

        self.publish("s1", K1, Z1, "ns1.s1.example.net.", 2024010101);
        self.publish("s2", K2, Z2, "ns1.s2.example.net.", 2024020202);
        self.parent.set_delegation(ZONE, QueryType::Ds, ds_for(&[K1]));
        self.parent
            .set_delegation(ZONE, QueryType::Ns, vec![ns("ns1.s1.example.net.")]);

        self.add_zone(ZONE).await;
        self.engine.zone_join_group(ZONE, "gA").await.unwrap();
    }

    /// Steps the zone once and returns the state it is in afterwards.
    pub async fn step(&self) -> (bool, String) {
        let (moved, msg) = self.engine.step(ZONE, None).await.unwrap();
        let zone = self.store.get_zone(None, ZONE).await.unwrap();
        assert!(!msg.is_empty());
        (moved, zone.state)
    }

    pub fn dnskeys(&self, signer: &str) -> Vec<DnsRecord> {
        self.memory.rrset(signer, ZONE, QueryType::Dnskey)
    }
}

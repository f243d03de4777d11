//! In-process signer backend
//!
//! Keeps RRsets per (signer, owner, type) in memory. Useful for dry runs
//! and for driving the process engine in tests without any network. It
//! can also be told to throttle the next few calls, and it remembers
//! when each call reached it.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{rrset_types, GatewayError, SignerBackend, METHOD_MEMORY};
use crate::dns::protocol::{fqdn, DnsRecord, QueryType};
use crate::store::Signer;

type Key = (String, String, QueryType);

/// Signer backend holding its zones in memory
pub struct MemoryBackend {
    rrsets: Mutex<HashMap<Key, Vec<DnsRecord>>>,
    throttles: Mutex<(u32, Duration)>,
    calls: Mutex<Vec<Instant>>,
    latency: Duration,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        MemoryBackend::new()
    }
}

impl MemoryBackend {
    pub fn new() -> MemoryBackend {
        MemoryBackend {
            rrsets: Mutex::new(HashMap::new()),
            throttles: Mutex::new((0, Duration::from_secs(0))),
            calls: Mutex::new(Vec::new()),
            latency: Duration::from_millis(0),
        }
    }

    /// Every call takes at least `latency` to complete.
    pub fn with_latency(latency: Duration) -> MemoryBackend {
        MemoryBackend {
            latency,
            ..MemoryBackend::new()
        }
    }

    fn key(signer: &str, owner: &str, rrtype: QueryType) -> Key {
        (signer.to_string(), fqdn(owner), rrtype)
    }

    /// Replaces what `signer` publishes for `owner`/`rrtype`.
    pub fn set_rrset(&self, signer: &str, owner: &str, rrtype: QueryType, records: Vec<DnsRecord>) {
        let key = MemoryBackend::key(signer, owner, rrtype);
        if records.is_empty() {
            self.rrsets.lock().remove(&key);
        } else {
            self.rrsets.lock().insert(key, records);
        }
    }

    pub fn rrset(&self, signer: &str, owner: &str, rrtype: QueryType) -> Vec<DnsRecord> {
        self.rrsets
            .lock()
            .get(&MemoryBackend::key(signer, owner, rrtype))
            .cloned()
            .unwrap_or_default()
    }

    /// The next `count` calls fail with a throttle carrying `retry_after`.
    pub fn throttle_next(&self, count: u32, retry_after: Duration) {
        *self.throttles.lock() = (count, retry_after);
    }

    /// Completion times of every call, throttled ones included.
    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().clone()
    }

    async fn enter(&self) -> Result<(), GatewayError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.calls.lock().push(Instant::now());

        let mut throttles = self.throttles.lock();
        if throttles.0 > 0 {
            throttles.0 -= 1;
            return Err(GatewayError::Throttled {
                retry_after: throttles.1,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SignerBackend for MemoryBackend {
    fn method(&self) -> &'static str {
        METHOD_MEMORY
    }

    async fn fetch_rrset(
        &self,
        signer: &Signer,
        _zone: &str,
        owner: &str,
        rrtype: QueryType,
    ) -> Result<Vec<DnsRecord>, GatewayError> {
        self.enter().await?;
        Ok(self.rrset(&signer.name, owner, rrtype))
    }

    async fn update(
        &self,
        signer: &Signer,
        _zone: &str,
        _owner: &str,
        inserts: &[Vec<DnsRecord>],
        removes: &[Vec<DnsRecord>],
    ) -> Result<(), GatewayError> {
        self.enter().await?;
        let mut rrsets = self.rrsets.lock();

        for record in removes.iter().flatten() {
            let key = MemoryBackend::key(&signer.name, record.get_domain(), record.get_querytype());
            if let Some(existing) = rrsets.get_mut(&key) {
                existing.retain(|r| r != record);
                if existing.is_empty() {
                    rrsets.remove(&key);
                }
            }
        }
        for record in inserts.iter().flatten() {
            let key = MemoryBackend::key(&signer.name, record.get_domain(), record.get_querytype());
            let existing = rrsets.entry(key).or_default();
            if !existing.contains(record) {
                existing.push(record.clone());
            }
        }
        Ok(())
    }

    async fn remove_rrset(
        &self,
        signer: &Signer,
        _zone: &str,
        owner: &str,
        rrsets: &[Vec<DnsRecord>],
    ) -> Result<(), GatewayError> {
        self.enter().await?;
        let mut stored = self.rrsets.lock();
        for rrtype in rrset_types(rrsets) {
            stored.remove(&MemoryBackend::key(&signer.name, owner, rrtype));
        }
        Ok(())
    }
}

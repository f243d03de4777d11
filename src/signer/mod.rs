//! Signer gateway
//!
//! A uniform way to read and write RRsets on heterogeneous signers.
//! Every backend implements [`SignerBackend`] and registers under the
//! method name that signers are configured with. The [`Gateway`]
//! dispatches on that name and refreshes the RRset cache as a side
//! effect of every successful fetch.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use crate::dns::client::ClientError;
use crate::dns::protocol::{DnsRecord, QueryType, ResultCode};
use crate::dns::tsig::{TsigAlgorithm, TsigKey};
use crate::errors::{MusicError, MusicResult};
use crate::store::{Signer, Store};

pub mod ddns;
pub mod hosted;
pub mod memory;
pub mod parent;
pub mod queue;

pub use memory::MemoryBackend;
pub use parent::{DnsParent, MemoryParent, ParentAgent};
pub use queue::{QueueLimits, RateLimited};

pub const METHOD_DDNS: &str = "ddns";
pub const METHOD_RL_DDNS: &str = "rlddns";
pub const METHOD_HOSTED: &str = "hosted";
pub const METHOD_RL_HOSTED: &str = "rlhosted";
pub const METHOD_MEMORY: &str = "memory";

/// Failure of one backend operation
#[derive(Debug, Clone)]
pub enum GatewayError {
    /// Network or DNS exchange failure. Never retried.
    Transport(String),
    /// The backend asked us to slow down
    Throttled { retry_after: Duration },
    /// The backend rejected the request; the body is kept verbatim
    Api { status: u16, body: String },
    /// A DNS reply carried a non-success RCODE
    Rcode(ResultCode),
    /// The signer's configuration cannot be used by this backend
    Config(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Transport(msg) => write!(f, "transport error: {}", msg),
            GatewayError::Throttled { retry_after } => {
                write!(f, "throttled, retry after {}s", retry_after.as_secs())
            }
            GatewayError::Api { status, body } => write!(f, "API error {}: {}", status, body),
            GatewayError::Rcode(rcode) => write!(f, "signer replied {}", rcode),
            GatewayError::Config(msg) => write!(f, "configuration error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<ClientError> for GatewayError {
    fn from(err: ClientError) -> Self {
        GatewayError::Transport(err.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::Transport(err.to_string())
    }
}

impl GatewayError {
    /// Attaches the signer for reporting through the process engine.
    pub fn for_signer(self, signer: &str) -> MusicError {
        match self {
            GatewayError::Throttled { retry_after } => MusicError::Throttled {
                backend: signer.to_string(),
                retry_after,
            },
            GatewayError::Config(msg) => {
                MusicError::validation(format!("signer {}: {}", signer, msg))
            }
            other => MusicError::Backend(format!("signer {}: {}", signer, other)),
        }
    }
}

lazy_static::lazy_static! {
    static ref THROTTLE_HINT: Regex = Regex::new(r"available in (\d+) second").unwrap();
}

/// Extracts the back-off hint from a throttle response body, e.g.
/// `"Request was throttled. Expected available in 3 seconds."`.
pub fn throttle_hint(body: &str) -> Option<Duration> {
    THROTTLE_HINT
        .captures(body)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Parses a signer's TSIG auth blob, `algorithm:keyname:secret`.
pub fn parse_tsig_auth(auth: &str) -> Result<TsigKey, GatewayError> {
    let mut parts = auth.splitn(3, ':');
    let (alg, name, secret) = match (parts.next(), parts.next(), parts.next()) {
        (Some(alg), Some(name), Some(secret)) if !name.is_empty() => (alg, name, secret),
        _ => {
            return Err(GatewayError::Config(
                "TSIG auth must be algorithm:keyname:secret".to_string(),
            ))
        }
    };
    let algorithm = alg
        .parse::<TsigAlgorithm>()
        .map_err(|e| GatewayError::Config(e.to_string()))?;
    TsigKey::new(name, algorithm, secret).map_err(|e| GatewayError::Config(e.to_string()))
}

/// Resolves the signer's address and port.
pub async fn signer_addr(signer: &Signer) -> Result<SocketAddr, GatewayError> {
    if let Ok(ip) = signer.address.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, signer.port));
    }
    let mut addrs = tokio::net::lookup_host((signer.address.as_str(), signer.port))
        .await
        .map_err(|e| GatewayError::Transport(format!("resolving {}: {}", signer.address, e)))?;
    addrs
        .next()
        .ok_or_else(|| GatewayError::Transport(format!("{} has no address", signer.address)))
}

/// Distinct types of a list of RRsets, in first-seen order.
pub(crate) fn rrset_types(rrsets: &[Vec<DnsRecord>]) -> Vec<QueryType> {
    let mut types = Vec::new();
    for record in rrsets.iter().flatten() {
        let qtype = record.get_querytype();
        if !types.contains(&qtype) {
            types.push(qtype);
        }
    }
    types
}

/// One way of talking to a signer
#[async_trait]
pub trait SignerBackend: Send + Sync {
    /// The method name signers are configured with
    fn method(&self) -> &'static str;

    async fn fetch_rrset(
        &self,
        signer: &Signer,
        zone: &str,
        owner: &str,
        rrtype: QueryType,
    ) -> Result<Vec<DnsRecord>, GatewayError>;

    /// Removes the records in `removes` and then adds those in `inserts`,
    /// as one change where the backend allows it.
    async fn update(
        &self,
        signer: &Signer,
        zone: &str,
        owner: &str,
        inserts: &[Vec<DnsRecord>],
        removes: &[Vec<DnsRecord>],
    ) -> Result<(), GatewayError>;

    /// RRset types `update` has to read before it can write. Backends
    /// that apply changes without reading first need none.
    fn update_reads(&self, _inserts: &[Vec<DnsRecord>], _removes: &[Vec<DnsRecord>]) -> Vec<QueryType> {
        Vec::new()
    }

    /// `update` with the RRsets named by `update_reads` already fetched,
    /// so that a queue can charge those reads to its fetch budget.
    async fn update_with(
        &self,
        signer: &Signer,
        zone: &str,
        owner: &str,
        inserts: &[Vec<DnsRecord>],
        removes: &[Vec<DnsRecord>],
        _current: &[(QueryType, Vec<DnsRecord>)],
    ) -> Result<(), GatewayError> {
        self.update(signer, zone, owner, inserts, removes).await
    }

    /// Deletes, for each RRset given, every record of its owner and type.
    async fn remove_rrset(
        &self,
        signer: &Signer,
        zone: &str,
        owner: &str,
        rrsets: &[Vec<DnsRecord>],
    ) -> Result<(), GatewayError>;

    async fn login(&self, _signer: &Signer) -> Result<String, GatewayError> {
        Ok(format!("{} signers need no login", self.method()))
    }

    async fn logout(&self, _signer: &Signer) -> Result<String, GatewayError> {
        Ok(format!("{} signers need no logout", self.method()))
    }

    /// Operations waiting in this backend's queues, (fetch, update).
    fn queue_depths(&self) -> (usize, usize) {
        (0, 0)
    }
}

/// Dispatches operations to the backend named by the signer's method
#[derive(Clone)]
pub struct Gateway {
    store: Store,
    backends: HashMap<String, Arc<dyn SignerBackend>>,
}

impl Gateway {
    pub fn new(store: Store) -> Gateway {
        Gateway {
            store,
            backends: HashMap::new(),
        }
    }

    /// Registers a backend under its own method name.
    pub fn register(&mut self, backend: Arc<dyn SignerBackend>) {
        self.register_as(backend.method(), backend);
    }

    pub fn register_as(&mut self, method: &str, backend: Arc<dyn SignerBackend>) {
        log::info!("Signer backend {} registered", method);
        self.backends.insert(method.to_string(), backend);
    }

    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.backends.keys().cloned().collect();
        methods.sort();
        methods
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.backends.contains_key(method)
    }

    fn backend(&self, signer: &Signer) -> MusicResult<&Arc<dyn SignerBackend>> {
        self.backends.get(&signer.method).ok_or_else(|| {
            MusicError::validation(format!(
                "signer {} uses unknown method '{}'",
                signer.name, signer.method
            ))
        })
    }

    /// Fetches an RRset and replaces the cached copy with the result.
    pub async fn fetch_rrset(
        &self,
        signer: &Signer,
        zone: &str,
        owner: &str,
        rrtype: QueryType,
    ) -> MusicResult<Vec<DnsRecord>> {
        let backend = self.backend(signer)?;
        let records = backend
            .fetch_rrset(signer, zone, owner, rrtype)
            .await
            .map_err(|e| e.for_signer(&signer.name))?;

        log::debug!(
            "Fetched {} {} {} record(s) from {}",
            records.len(),
            owner,
            rrtype,
            signer.name
        );
        self.store
            .replace_rrset_cache(zone, owner, &signer.name, rrtype, &records)
            .await?;
        Ok(records)
    }

    pub async fn update(
        &self,
        signer: &Signer,
        zone: &str,
        owner: &str,
        inserts: &[Vec<DnsRecord>],
        removes: &[Vec<DnsRecord>],
    ) -> MusicResult<()> {
        if inserts.iter().all(Vec::is_empty) && removes.iter().all(Vec::is_empty) {
            return Ok(());
        }
        let backend = self.backend(signer)?;
        backend
            .update(signer, zone, owner, inserts, removes)
            .await
            .map_err(|e| e.for_signer(&signer.name))?;
        log::info!(
            "Updated {} on {}: {} added, {} removed",
            owner,
            signer.name,
            inserts.iter().map(Vec::len).sum::<usize>(),
            removes.iter().map(Vec::len).sum::<usize>()
        );
        Ok(())
    }

    pub async fn remove_rrset(
        &self,
        signer: &Signer,
        zone: &str,
        owner: &str,
        rrsets: &[Vec<DnsRecord>],
    ) -> MusicResult<()> {
        if rrsets.iter().all(Vec::is_empty) {
            return Ok(());
        }
        let backend = self.backend(signer)?;
        backend
            .remove_rrset(signer, zone, owner, rrsets)
            .await
            .map_err(|e| e.for_signer(&signer.name))
    }

    pub async fn login(&self, signer: &Signer) -> MusicResult<String> {
        let backend = self.backend(signer)?;
        backend.login(signer).await.map_err(|e| e.for_signer(&signer.name))
    }

    pub async fn logout(&self, signer: &Signer) -> MusicResult<String> {
        let backend = self.backend(signer)?;
        backend.logout(signer).await.map_err(|e| e.for_signer(&signer.name))
    }

    /// Queue depths of every backend that has queues.
    pub fn queue_depths(&self) -> Vec<(String, usize, usize)> {
        let mut out: Vec<(String, usize, usize)> = self
            .backends
            .iter()
            .map(|(name, b)| {
                let (fetch, update) = b.queue_depths();
                (name.clone(), fetch, update)
            })
            .collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::temp_store;

    fn memory_signer(name: &str) -> Signer {
        Signer {
            name: name.to_string(),
            method: METHOD_MEMORY.to_string(),
            auth: String::new(),
            address: String::new(),
            port: 53,
            usetcp: true,
            usetsig: false,
        }
    }

    #[test]
    fn test_throttle_hint() {
        assert_eq!(
            throttle_hint("Request was throttled. Expected available in 3 seconds."),
            Some(Duration::from_secs(3))
        );
        assert_eq!(
            throttle_hint(r#"{"detail":"Request was throttled. Expected available in 1 second."}"#),
            Some(Duration::from_secs(1))
        );
        assert_eq!(throttle_hint("Internal error"), None);
    }

    #[test]
    fn test_parse_tsig_auth() {
        let key = parse_tsig_auth("hmac-sha256:music.key.:c2VjcmV0c2VjcmV0").unwrap();
        assert_eq!(key.name, "music.key.");
        assert_eq!(key.algorithm, TsigAlgorithm::HmacSha256);

        assert!(matches!(parse_tsig_auth("hmac-sha256:k"), Err(GatewayError::Config(_))));
        assert!(matches!(
            parse_tsig_auth("hmac-md5:k:c2VjcmV0"),
            Err(GatewayError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_refreshes_cache() {
        let store = temp_store().await;
        let memory = Arc::new(MemoryBackend::new());
        let mut gateway = Gateway::new(store.clone());
        gateway.register(memory.clone());

        let ns: DnsRecord = "example.com. 300 IN NS ns1.s1.net.".parse().unwrap();
        memory.set_rrset("s1", "example.com.", QueryType::Ns, vec![ns.clone()]);

        let signer = memory_signer("s1");
        let fetched = gateway
            .fetch_rrset(&signer, "example.com.", "example.com.", QueryType::Ns)
            .await
            .unwrap();
        assert_eq!(fetched, vec![ns]);

        let cached = store
            .cached_rrset(None, "example.com.", "example.com.", "s1", QueryType::Ns)
            .await
            .unwrap();
        assert_eq!(cached, fetched);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let store = temp_store().await;
        let gateway = Gateway::new(store);
        let mut signer = memory_signer("s1");
        signer.method = "carrier-pigeon".to_string();
        assert!(matches!(
            gateway
                .fetch_rrset(&signer, "example.com.", "example.com.", QueryType::Ns)
                .await,
            Err(MusicError::Validation(_))
        ));
    }
}

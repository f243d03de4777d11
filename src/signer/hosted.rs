//! Hosted-DNS HTTP API backend
//!
//! RRsets are addressed as `/domains/{zone}/rrsets/{subname}/{type}/`,
//! where the apex subname is `@` in URLs and empty in request bodies.
//! Writes replace whole RRsets through the bulk endpoint
//! `/domains/{zone}/rrsets/`; an empty record list deletes the RRset.
//!
//! Calls authenticate with a token obtained from `/auth/login/`. The
//! token is persisted and replaced shortly before it would expire from
//! disuse or age.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::{rrset_types, throttle_hint, GatewayError, SignerBackend, METHOD_HOSTED};
use crate::config::HostedConfig;
use crate::dns::protocol::{fqdn, DnsRecord, QueryType};
use crate::store::{ApiToken, Signer, Store};

/// Store key of the persisted token
const TOKEN_KEY: &str = "hosted";

const DEFAULT_TTL: u32 = 3600;

/// One RRset as the API represents it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRRset {
    pub subname: String,
    #[serde(rename = "type")]
    pub rtype: String,
    pub ttl: u32,
    pub records: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
    created: Option<DateTime<Utc>>,
    max_unused_period: Option<String>,
    max_age: Option<String>,
}

/// The API's subname for `owner` in `zone`: `www` for `www.zone`, empty
/// at the apex.
pub fn subname(zone: &str, owner: &str) -> Result<String, GatewayError> {
    let zone = fqdn(zone);
    let owner = fqdn(owner);
    if owner == zone {
        return Ok(String::new());
    }
    match owner.strip_suffix(&format!(".{}", zone)) {
        Some(sub) if !sub.is_empty() => Ok(sub.to_string()),
        _ => Err(GatewayError::Config(format!(
            "{} is not inside zone {}",
            owner, zone
        ))),
    }
}

fn url_subname(sub: &str) -> &str {
    if sub.is_empty() {
        "@"
    } else {
        sub
    }
}

fn api_zone(zone: &str) -> String {
    fqdn(zone).trim_end_matches('.').to_string()
}

const MAX_DAYS: i64 = 100_000;

/// Parses API durations of the form `[days ]HH:MM:SS[.ffffff]`.
pub fn parse_api_duration(text: &str) -> Result<chrono::Duration, GatewayError> {
    let bad = || GatewayError::Transport(format!("invalid duration '{}'", text));
    let text = text.trim();

    let (days, clock) = match text.split_once(' ') {
        Some((days, clock)) => (days.trim().parse::<i64>().map_err(|_| bad())?, clock.trim()),
        None => (0, text),
    };

    let clock = clock.split('.').next().unwrap_or_default();
    let parts: Vec<&str> = clock.split(':').collect();
    if parts.len() != 3 {
        return Err(bad());
    }
    let mut fields = [0i64; 3];
    for (slot, part) in fields.iter_mut().zip(parts.iter()) {
        *slot = part.parse::<i64>().map_err(|_| bad())?;
        if *slot < 0 {
            return Err(bad());
        }
    }
    if fields[1] > 59 || fields[2] > 59 || !(0..=MAX_DAYS).contains(&days) || fields[0] > MAX_DAYS * 24 {
        return Err(bad());
    }

    Ok(chrono::Duration::days(days)
        + chrono::Duration::hours(fields[0])
        + chrono::Duration::minutes(fields[1])
        + chrono::Duration::seconds(fields[2]))
}

/// Turns a throttle or error reply into the matching gateway error.
async fn check(response: reqwest::Response) -> Result<reqwest::Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let header_hint = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = throttle_hint(&body)
            .or(header_hint)
            .unwrap_or_else(|| Duration::from_secs(1));
        return Err(GatewayError::Throttled { retry_after });
    }

    Err(GatewayError::Api {
        status: status.as_u16(),
        body,
    })
}

/// Backend for signers run by a hosted-DNS provider
pub struct HostedBackend {
    config: HostedConfig,
    http: reqwest::Client,
    store: Store,
    token: tokio::sync::Mutex<Option<ApiToken>>,
}

impl HostedBackend {
    pub fn new(config: HostedConfig, store: Store) -> Result<HostedBackend, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.update_timeout.max(config.fetch_timeout)))
            .build()?;
        Ok(HostedBackend {
            config,
            http,
            store,
            token: tokio::sync::Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.baseurl.trim_end_matches('/'), path)
    }

    async fn login_now(&self) -> Result<ApiToken, GatewayError> {
        if self.config.email.is_empty() || self.config.password.is_empty() {
            return Err(GatewayError::Config(
                "hosted API e-mail and password are not configured".to_string(),
            ));
        }

        let response = self
            .http
            .post(self.url("/auth/login/"))
            .timeout(Duration::from_secs(self.config.update_timeout))
            .json(&serde_json::json!({
                "email": self.config.email,
                "password": self.config.password,
            }))
            .send()
            .await?;
        let login: LoginResponse = check(response).await?.json().await?;

        let now = Utc::now();
        let token = ApiToken {
            token: login.token,
            created: login.created.unwrap_or(now),
            touched: now,
            max_unused: match login.max_unused_period {
                Some(ref d) => parse_api_duration(d)?,
                None => chrono::Duration::hours(1),
            },
            max_age: match login.max_age {
                Some(ref d) => parse_api_duration(d)?,
                None => chrono::Duration::zero(),
            },
        };

        if let Err(e) = self.store.save_token(None, TOKEN_KEY, &token).await {
            log::warn!("Could not persist hosted API token: {}", e);
        }
        log::info!("Logged in to hosted API {}", self.config.baseurl);
        Ok(token)
    }

    /// A usable token, logging in again when the current one is close
    /// to expiry.
    async fn bearer(&self) -> Result<String, GatewayError> {
        let mut cached = self.token.lock().await;
        if cached.is_none() {
            *cached = self
                .store
                .load_token(None, TOKEN_KEY)
                .await
                .map_err(|e| GatewayError::Transport(e.to_string()))?;
        }

        let now = Utc::now();
        let fresh = match cached.as_ref() {
            Some(token) if !token.needs_refresh(now) => None,
            _ => Some(self.login_now().await?),
        };
        if let Some(token) = fresh {
            *cached = Some(token);
        }

        match cached.as_mut() {
            Some(token) => {
                token.touched = now;
                if let Err(e) = self.store.touch_token(None, TOKEN_KEY).await {
                    log::warn!("Could not record hosted API token use: {}", e);
                }
                Ok(format!("{} {}", self.config.auth_scheme, token.token))
            }
            None => Err(GatewayError::Config("no hosted API token".to_string())),
        }
    }

    async fn get_rrset(&self, zone: &str, owner: &str, rrtype: QueryType) -> Result<Vec<DnsRecord>, GatewayError> {
        let sub = subname(zone, owner)?;
        let path = format!(
            "/domains/{}/rrsets/{}/{}/",
            api_zone(zone),
            url_subname(&sub),
            rrtype
        );
        let response = self
            .http
            .get(self.url(&path))
            .header(reqwest::header::AUTHORIZATION, self.bearer().await?)
            .timeout(Duration::from_secs(self.config.fetch_timeout))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let rrset: ApiRRset = check(response).await?.json().await?;

        let owner = fqdn(owner);
        rrset
            .records
            .iter()
            .map(|rdata| {
                DnsRecord::from_rdata(&owner, rrtype, rrset.ttl, rdata).map_err(|e| {
                    GatewayError::Transport(format!("unparseable {} record '{}': {}", rrtype, rdata, e))
                })
            })
            .collect()
    }

    async fn put_rrsets(&self, zone: &str, rrsets: &[ApiRRset]) -> Result<(), GatewayError> {
        if rrsets.is_empty() {
            return Ok(());
        }
        let path = format!("/domains/{}/rrsets/", api_zone(zone));
        let response = self
            .http
            .put(self.url(&path))
            .header(reqwest::header::AUTHORIZATION, self.bearer().await?)
            .timeout(Duration::from_secs(self.config.update_timeout))
            .json(rrsets)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}

/// The full RRsets to write after applying `removes` then `inserts` to
/// what is currently published.
pub fn merged_rrset(
    sub: &str,
    rrtype: QueryType,
    current: &[DnsRecord],
    inserts: &[&DnsRecord],
    removes: &[&DnsRecord],
) -> ApiRRset {
    let mut records: Vec<DnsRecord> = current
        .iter()
        .filter(|r| !removes.contains(r))
        .cloned()
        .collect();
    for record in inserts {
        if !records.contains(record) {
            records.push((*record).clone());
        }
    }

    let ttl = inserts
        .first()
        .map(|r| r.get_ttl())
        .or_else(|| current.first().map(|r| r.get_ttl()))
        .unwrap_or(DEFAULT_TTL);

    ApiRRset {
        subname: sub.to_string(),
        rtype: rrtype.to_string(),
        ttl,
        records: records.iter().map(DnsRecord::rdata_text).collect(),
    }
}

#[async_trait]
impl SignerBackend for HostedBackend {
    fn method(&self) -> &'static str {
        METHOD_HOSTED
    }

    async fn fetch_rrset(
        &self,
        _signer: &Signer,
        zone: &str,
        owner: &str,
        rrtype: QueryType,
    ) -> Result<Vec<DnsRecord>, GatewayError> {
        self.get_rrset(zone, owner, rrtype).await
    }

    async fn update(
        &self,
        signer: &Signer,
        zone: &str,
        owner: &str,
        inserts: &[Vec<DnsRecord>],
        removes: &[Vec<DnsRecord>],
    ) -> Result<(), GatewayError> {
        let mut current = Vec::new();
        for rrtype in self.update_reads(inserts, removes) {
            current.push((rrtype, self.get_rrset(zone, owner, rrtype).await?));
        }
        self.update_with(signer, zone, owner, inserts, removes, &current)
            .await
    }

    /// Every RRset touched is rewritten whole, so each is read first.
    fn update_reads(&self, inserts: &[Vec<DnsRecord>], removes: &[Vec<DnsRecord>]) -> Vec<QueryType> {
        let mut types = rrset_types(inserts);
        for rrtype in rrset_types(removes) {
            if !types.contains(&rrtype) {
                types.push(rrtype);
            }
        }
        types
    }

    async fn update_with(
        &self,
        _signer: &Signer,
        zone: &str,
        owner: &str,
        inserts: &[Vec<DnsRecord>],
        removes: &[Vec<DnsRecord>],
        current: &[(QueryType, Vec<DnsRecord>)],
    ) -> Result<(), GatewayError> {
        let sub = subname(zone, owner)?;
        let mut bodies = Vec::with_capacity(current.len());
        for rrtype in self.update_reads(inserts, removes) {
            let existing: &[DnsRecord] = match current.iter().find(|(t, _)| *t == rrtype) {
                Some((_, records)) => records.as_slice(),
                None => &[],
            };
            let ins: Vec<&DnsRecord> = inserts
                .iter()
                .flatten()
                .filter(|r| r.get_querytype() == rrtype)
                .collect();
            let rem: Vec<&DnsRecord> = removes
                .iter()
                .flatten()
                .filter(|r| r.get_querytype() == rrtype)
                .collect();
            bodies.push(merged_rrset(&sub, rrtype, existing, &ins, &rem));
        }

        self.put_rrsets(zone, &bodies).await
    }

    async fn remove_rrset(
        &self,
        _signer: &Signer,
        zone: &str,
        owner: &str,
        rrsets: &[Vec<DnsRecord>],
    ) -> Result<(), GatewayError> {
        let sub = subname(zone, owner)?;
        let bodies: Vec<ApiRRset> = rrset_types(rrsets)
            .into_iter()
            .map(|rrtype| ApiRRset {
                subname: sub.clone(),
                rtype: rrtype.to_string(),
                ttl: DEFAULT_TTL,
                records: Vec::new(),
            })
            .collect();
        self.put_rrsets(zone, &bodies).await
    }

    async fn login(&self, _signer: &Signer) -> Result<String, GatewayError> {
        let token = self.login_now().await?;
        let mut msg = format!("Logged in to {}", self.config.baseurl);
        if token.max_age > chrono::Duration::zero() {
            msg.push_str(&format!(
                ", token valid until {}",
                (token.created + token.max_age).format("%Y-%m-%d %H:%M:%S UTC")
            ));
        }
        *self.token.lock().await = Some(token);
        Ok(msg)
    }

    async fn logout(&self, _signer: &Signer) -> Result<String, GatewayError> {
        let mut cached = self.token.lock().await;
        if cached.is_none() {
            *cached = self
                .store
                .load_token(None, TOKEN_KEY)
                .await
                .map_err(|e| GatewayError::Transport(e.to_string()))?;
        }

        if let Some(token) = cached.take() {
            let response = self
                .http
                .post(self.url("/auth/logout/"))
                .header(
                    reqwest::header::AUTHORIZATION,
                    format!("{} {}", self.config.auth_scheme, token.token),
                )
                .timeout(Duration::from_secs(self.config.update_timeout))
                .send()
                .await?;
            check(response).await?;
        }

        self.store
            .clear_token(None, TOKEN_KEY)
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(format!("Logged out from {}", self.config.baseurl))
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use axum::extract::{Path, State};
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::{get, post, put};
    use axum::{Json, Router};
    use parking_lot::Mutex;

    use super::*;
    use crate::signer::queue::{QueueLimits, RateLimited};
    use crate::store::testutil::temp_store;

    #[derive(Default)]
    struct MockApi {
        logins: Mutex<u32>,
        throttle_once: Mutex<bool>,
        puts: Mutex<Vec<Vec<ApiRRset>>>,
        gets: Mutex<Vec<tokio::time::Instant>>,
    }

    async fn mock_login(State(api): State<Arc<MockApi>>) -> Json<serde_json::Value> {
        *api.logins.lock() += 1;
        Json(serde_json::json!({
            "token": "tok-1",
            "created": Utc::now().to_rfc3339(),
            "max_unused_period": "01:00:00",
            "max_age": "7 00:00:00",
        }))
    }

    async fn mock_get(
        State(api): State<Arc<MockApi>>,
        Path((zone, sub, rtype)): Path<(String, String, String)>,
    ) -> Result<Json<ApiRRset>, (AxumStatus, String)> {
        api.gets.lock().push(tokio::time::Instant::now());
        {
            let mut throttle = api.throttle_once.lock();
            if *throttle {
                *throttle = false;
                return Err((
                    AxumStatus::TOO_MANY_REQUESTS,
                    "Request was throttled. Expected available in 2 seconds.".to_string(),
                ));
            }
        }
        if zone == "example.com" && sub == "@" && rtype == "NS" {
            Ok(Json(ApiRRset {
                subname: String::new(),
                rtype,
                ttl: 3600,
                records: vec!["ns1.example.net.".to_string(), "ns2.example.net.".to_string()],
            }))
        } else {
            Err((AxumStatus::NOT_FOUND, "Not found.".to_string()))
        }
    }

    async fn mock_put(State(api): State<Arc<MockApi>>, Json(body): Json<Vec<ApiRRset>>) -> Json<Vec<ApiRRset>> {
        api.puts.lock().push(body.clone());
        Json(body)
    }

    async fn start_mock(api: Arc<MockApi>) -> SocketAddr {
        let app = Router::new()
            .route("/auth/login/", post(mock_login))
            .route("/domains/:zone/rrsets/:sub/:rtype/", get(mock_get))
            .route("/domains/:zone/rrsets/", put(mock_put))
            .with_state(api);
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service());
        tokio::spawn(server);
        addr
    }

    fn signer() -> Signer {
        Signer {
            name: "h1".to_string(),
            method: METHOD_HOSTED.to_string(),
            auth: String::new(),
            address: String::new(),
            port: 443,
            usetcp: true,
            usetsig: false,
        }
    }

    async fn backend(addr: SocketAddr) -> HostedBackend {
        let config = HostedConfig {
            baseurl: format!("http://{}", addr),
            email: "ops@example.com".to_string(),
            password: "secret".to_string(),
            ..HostedConfig::default()
        };
        HostedBackend::new(config, temp_store().await).unwrap()
    }

    #[test]
    fn test_subname() {
        assert_eq!(subname("example.com.", "example.com.").unwrap(), "");
        assert_eq!(subname("example.com", "WWW.example.com.").unwrap(), "www");
        assert_eq!(subname("example.com.", "a.b.example.com.").unwrap(), "a.b");
        assert!(subname("example.com.", "example.org.").is_err());
        assert!(subname("example.com.", "badexample.com.").is_err());
        assert_eq!(url_subname(""), "@");
    }

    #[test]
    fn test_parse_api_duration() {
        assert_eq!(parse_api_duration("01:00:00").unwrap(), chrono::Duration::hours(1));
        assert_eq!(parse_api_duration("7 00:00:00").unwrap(), chrono::Duration::days(7));
        assert_eq!(
            parse_api_duration("1 02:03:04.500000").unwrap(),
            chrono::Duration::seconds(86400 + 7384)
        );
        assert!(parse_api_duration("soon").is_err());
        assert!(parse_api_duration("00:61:00").is_err());
    }

    #[test]
    fn test_merged_rrset() {
        let a: DnsRecord = "example.com. 300 IN NS ns1.a.net.".parse().unwrap();
        let b: DnsRecord = "example.com. 300 IN NS ns1.b.net.".parse().unwrap();
        let c: DnsRecord = "example.com. 600 IN NS ns1.c.net.".parse().unwrap();

        let body = merged_rrset("", QueryType::Ns, &[a.clone(), b.clone()], &[&c], &[&a]);
        assert_eq!(body.records, vec!["ns1.b.net.".to_string(), "ns1.c.net.".to_string()]);
        assert_eq!(body.ttl, 600);
        assert_eq!(body.rtype, "NS");

        let emptied = merged_rrset("", QueryType::Ns, &[a.clone()], &[], &[&a]);
        assert!(emptied.records.is_empty());
        assert_eq!(emptied.ttl, 300);
    }

    #[tokio::test]
    async fn test_fetch_logs_in_and_parses() {
        let api = Arc::new(MockApi::default());
        let addr = start_mock(api.clone()).await;
        let backend = backend(addr).await;

        let ns = backend
            .fetch_rrset(&signer(), "example.com.", "example.com.", QueryType::Ns)
            .await
            .unwrap();
        assert_eq!(ns.len(), 2);
        assert_eq!(ns[0].get_ttl(), 3600);

        let missing = backend
            .fetch_rrset(&signer(), "example.com.", "www.example.com.", QueryType::A)
            .await
            .unwrap();
        assert!(missing.is_empty());
        assert_eq!(*api.logins.lock(), 1);

        let token = backend.store.load_token(None, TOKEN_KEY).await.unwrap().unwrap();
        assert_eq!(token.token, "tok-1");
        assert_eq!(token.max_age, chrono::Duration::days(7));
    }

    #[tokio::test]
    async fn test_throttle_reply_carries_hint() {
        let api = Arc::new(MockApi::default());
        *api.throttle_once.lock() = true;
        let addr = start_mock(api.clone()).await;
        let backend = backend(addr).await;

        let result = backend
            .fetch_rrset(&signer(), "example.com.", "example.com.", QueryType::Ns)
            .await;
        match result {
            Err(GatewayError::Throttled { retry_after }) => assert_eq!(retry_after.as_secs(), 2),
            other => panic!("expected throttle, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_puts_merged_rrset() {
        let api = Arc::new(MockApi::default());
        let addr = start_mock(api.clone()).await;
        let backend = backend(addr).await;

        let old: DnsRecord = "example.com. 3600 IN NS ns2.example.net.".parse().unwrap();
        let new: DnsRecord = "example.com. 3600 IN NS ns1.other.net.".parse().unwrap();
        backend
            .update(&signer(), "example.com.", "example.com.", &[vec![new]], &[vec![old]])
            .await
            .unwrap();

        let puts = api.puts.lock().clone();
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0][0].subname, "");
        assert_eq!(
            puts[0][0].records,
            vec!["ns1.example.net.".to_string(), "ns1.other.net.".to_string()]
        );
    }

    #[tokio::test]
    async fn test_update_reads_count_against_fetch_budget() {
        let api = Arc::new(MockApi::default());
        let addr = start_mock(api.clone()).await;
        let limited = Arc::new(RateLimited::new(
            "rlhosted",
            Arc::new(backend(addr).await),
            QueueLimits {
                fetch_per_sec: 2,
                update_per_sec: 2,
                throttle_retries: 0,
            },
            None,
        ));
        let ns: DnsRecord = "example.com. 3600 IN NS ns3.example.net.".parse().unwrap();

        let mut handles = Vec::new();
        for i in 0..6 {
            let limited = limited.clone();
            let ns = ns.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    limited
                        .fetch_rrset(&signer(), "example.com.", "example.com.", QueryType::Ns)
                        .await
                        .map(|_| ())
                } else {
                    limited
                        .update(&signer(), "example.com.", "example.com.", &[vec![ns]], &[])
                        .await
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let mut gets = api.gets.lock().clone();
        gets.sort();
        assert_eq!(gets.len(), 6);
        for (i, start) in gets.iter().enumerate() {
            let in_window = gets[i..]
                .iter()
                .take_while(|t| **t < *start + Duration::from_secs(1))
                .count();
            assert!(in_window <= 2, "{} GETs within one second", in_window);
        }

        let puts = api.puts.lock();
        assert_eq!(puts.len(), 3);
        assert_eq!(puts[0][0].records.len(), 3);
    }
}

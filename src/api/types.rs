//! Control-plane envelopes
//!
//! Every endpoint takes a POST body naming a `Command` and answers with
//! an [`ApiResponse`]. Field names are PascalCase on the wire.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::MusicError;
use crate::fsm::ProcessInfo;
use crate::store::metadata::Metadata;
use crate::store::{FsmMode, Signer, SignerGroup, Zone, ZoneType};

pub const API_PREFIX: &str = "/api/v1";
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Every route the daemon serves
pub const ROUTES: [&str; 7] = [
    "/api/v1/ping",
    "/api/v1/zone",
    "/api/v1/signer",
    "/api/v1/signergroup",
    "/api/v1/process",
    "/api/v1/show",
    "/api/v1/test",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PingPost {
    pub msg: String,
    pub pings: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ZonePost {
    pub command: String,
    pub zone: String,
    pub zone_type: Option<ZoneType>,
    pub fsm_mode: Option<FsmMode>,
    pub signer_group: String,
    /// Process to attach (`fsm`) or detach
    pub fsm: String,
    /// Signer under focus for the attached process
    pub fsm_signer: String,
    pub preempt: bool,
    /// Next state to take where a state has several (`step-fsm`)
    pub next_state: String,
    pub owner: String,
    #[serde(rename = "RRtype")]
    pub rrtype: String,
    pub from_signer: String,
    pub to_signer: String,
    pub meta_key: String,
    pub meta_value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SignerPost {
    pub command: String,
    pub name: String,
    pub method: String,
    pub auth: String,
    pub address: String,
    pub port: Option<u16>,
    #[serde(rename = "UseTCP")]
    pub use_tcp: Option<bool>,
    #[serde(rename = "UseTSIG")]
    pub use_tsig: Option<bool>,
    pub signer_group: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SignerGroupPost {
    pub command: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ProcessPost {
    pub command: String,
    pub process: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ShowPost {
    pub command: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TestPost {
    pub command: String,
    pub signer: String,
    pub zone: String,
    pub owner: String,
    #[serde(rename = "RRtype")]
    pub rrtype: String,
}

/// Queue depths of one signer backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QueueDepth {
    pub backend: String,
    pub fetch: usize,
    pub update: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EngineStatus {
    pub active: bool,
    /// Current scheduler interval in seconds
    pub interval: u64,
    pub pending_writes: usize,
    /// Status updates dropped after a database error
    #[serde(default)]
    pub failed_writes: usize,
    pub queued_notifies: usize,
    pub queues: Vec<QueueDepth>,
}

/// Answer of every endpoint. Payload fields are present only for the
/// commands that produce them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ApiResponse {
    pub time: Option<DateTime<Utc>>,
    pub client: String,
    pub error: bool,
    pub error_msg: String,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pongs: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zones: Option<Vec<Zone>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signers: Option<Vec<Signer>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signer_groups: Option<Vec<SignerGroup>>,
    /// Textual RRs per signer
    #[serde(rename = "RRsets", skip_serializing_if = "Option::is_none")]
    pub rrsets: Option<BTreeMap<String, Vec<String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Vec<Metadata>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processes: Option<Vec<ProcessInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<EngineStatus>,
    /// Whether `step-fsm` moved the zone
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transitioned: Option<bool>,
}

impl ApiResponse {
    pub fn message<S: Into<String>>(msg: S) -> ApiResponse {
        ApiResponse {
            msg: msg.into(),
            ..ApiResponse::default()
        }
    }

    pub fn failure(err: &MusicError) -> ApiResponse {
        ApiResponse {
            error: true,
            error_msg: err.to_string(),
            ..ApiResponse::default()
        }
    }

    /// Stamps the response with the time and the caller's address.
    pub fn stamped(mut self, client: String) -> ApiResponse {
        self.time = Some(Utc::now());
        self.client = client;
        self
    }
}

/// A signer as shown to API callers, with its secret blanked.
pub fn redacted(mut signer: Signer) -> Signer {
    if !signer.auth.is_empty() {
        signer.auth = match signer.auth.rsplit_once(':') {
            Some((prefix, _)) => format!("{}:***", prefix),
            None => "***".to_string(),
        };
    }
    signer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names() {
        let post: ZonePost = serde_json::from_str(
            r#"{"Command":"step-fsm","Zone":"example.com.","NextState":"dnskeys-synced","RRtype":"DNSKEY"}"#,
        )
        .unwrap();
        assert_eq!(post.command, "step-fsm");
        assert_eq!(post.next_state, "dnskeys-synced");
        assert_eq!(post.rrtype, "DNSKEY");
        assert!(!post.preempt);

        let json = serde_json::to_value(ApiResponse::message("ok").stamped("127.0.0.1:1".into())).unwrap();
        assert_eq!(json["Msg"], "ok");
        assert_eq!(json["Error"], false);
        assert_eq!(json["Client"], "127.0.0.1:1");
        assert!(json.get("Zones").is_none());
    }

    #[test]
    fn test_redacted() {
        let signer = Signer {
            name: "s1".to_string(),
            method: "ddns".to_string(),
            auth: "hmac-sha256:k:c2VjcmV0".to_string(),
            address: "198.51.100.10".to_string(),
            port: 53,
            usetcp: true,
            usetsig: true,
        };
        assert_eq!(redacted(signer).auth, "hmac-sha256:k:***");
    }
}

mod common;

use std::sync::Arc;

use common::*;
use music::api::types::{SignerGroupPost, SignerPost, ZonePost, ProcessPost};
use music::api::{self, ApiClient, ApiState, ClientError};
use music::store::FsmMode;

const KEY: &str = "test-api-key";

async fn serve(h: &Harness) -> String {
    let state = Arc::new(ApiState {
        engine: h.engine.clone(),
        apikey: KEY.to_string(),
    });
    let (addr, _handle) = api::spawn("127.0.0.1:0".parse().unwrap(), state, None).unwrap();
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_ping_pongs() {
    let h = Harness::new().await;
    let client = ApiClient::new(&serve(&h).await, KEY, None).unwrap();

    let resp = client.ping("hello").await.unwrap();
    assert!(!resp.error);
    assert_eq!(resp.pongs, Some(1));
    assert!(resp.time.is_some());
    assert!(resp.client.starts_with("127.0.0.1:"));
}

#[tokio::test]
async fn test_wrong_key_is_unauthorized() {
    let h = Harness::new().await;
    let client = ApiClient::new(&serve(&h).await, "not-the-key", None).unwrap();

    match client.ping("hello").await {
        Err(ClientError::Status { status, .. }) => assert_eq!(status, 401),
        other => panic!("expected 401, got {:?}", other.map(|r| r.msg)),
    }
}

#[tokio::test]
async fn test_zone_add_and_list() {
    let h = Harness::new().await;
    let client = ApiClient::new(&serve(&h).await, KEY, None).unwrap();

    let resp = client
        .zone(&ZonePost {
            command: "add".to_string(),
            zone: "api.example.org".to_string(),
            fsm_mode: Some(FsmMode::Manual),
            ..ZonePost::default()
        })
        .await
        .unwrap();
    assert!(!resp.error, "{}", resp.error_msg);

    let resp = client
        .zone(&ZonePost {
            command: "list".to_string(),
            ..ZonePost::default()
        })
        .await
        .unwrap();
    let zones = resp.zones.unwrap();
    assert_eq!(zones.len(), 1);
    assert_eq!(zones[0].name, "api.example.org.");
    assert_eq!(zones[0].fsmmode, FsmMode::Manual);
}

#[tokio::test]
async fn test_failures_come_back_in_the_envelope() {
    let h = Harness::new().await;
    let client = ApiClient::new(&serve(&h).await, KEY, None).unwrap();

    let resp = client
        .zone(&ZonePost {
            command: "frobnicate".to_string(),
            zone: ZONE.to_string(),
            ..ZonePost::default()
        })
        .await
        .unwrap();
    assert!(resp.error);
    assert!(resp.error_msg.contains("frobnicate"));

    let resp = client
        .signergroup(&SignerGroupPost {
            command: "delete".to_string(),
            name: "nosuchgroup".to_string(),
        })
        .await
        .unwrap();
    assert!(resp.error);
}

#[tokio::test]
async fn test_signer_add_checks_method_and_redacts() {
    let h = Harness::new().await;
    let client = ApiClient::new(&serve(&h).await, KEY, None).unwrap();

    let resp = client
        .signer(&SignerPost {
            command: "add".to_string(),
            name: "bad".to_string(),
            method: "carrier-pigeon".to_string(),
            ..SignerPost::default()
        })
        .await
        .unwrap();
    assert!(resp.error);

    let resp = client
        .signer(&SignerPost {
            command: "add".to_string(),
            name: "s1".to_string(),
            method: "memory".to_string(),
            auth: "hmac-sha256:music.key:c2VjcmV0".to_string(),
            ..SignerPost::default()
        })
        .await
        .unwrap();
    assert!(!resp.error, "{}", resp.error_msg);

    let resp = client
        .signer(&SignerPost {
            command: "list".to_string(),
            ..SignerPost::default()
        })
        .await
        .unwrap();
    let signers = resp.signers.unwrap();
    assert_eq!(signers.len(), 1);
    assert_eq!(signers[0].port, 53);
    assert!(signers[0].usetcp);
    assert!(!signers[0].auth.contains("c2VjcmV0"));
}

#[tokio::test]
async fn test_process_graph_and_show() {
    let h = Harness::new().await;
    let client = ApiClient::new(&serve(&h).await, KEY, None).unwrap();

    let resp = client
        .process(&ProcessPost {
            command: "list".to_string(),
            ..ProcessPost::default()
        })
        .await
        .unwrap();
    let names: Vec<String> = resp.processes.unwrap().into_iter().map(|p| p.name).collect();
    assert!(names.contains(&"add-signer".to_string()));
    assert!(names.contains(&"remove-signer".to_string()));

    let resp = client
        .process(&ProcessPost {
            command: "graph".to_string(),
            process: "add-signer".to_string(),
        })
        .await
        .unwrap();
    let graph = resp.graph.unwrap();
    assert!(graph.starts_with("flowchart TD"));
    assert!(graph.contains("cds-added"));

    let resp = client.show("api").await.unwrap();
    assert_eq!(resp.routes.unwrap().len(), 7);

    let resp = client.show("status").await.unwrap();
    let status = resp.status.unwrap();
    assert!(!status.active);
    assert_eq!(status.failed_writes, 0);
}

#[tokio::test]
async fn test_step_over_the_api() {
    let h = Harness::new().await;
    h.one_signer_zone().await;
    let client = ApiClient::new(&serve(&h).await, KEY, None).unwrap();

    let resp = client
        .signer(&SignerPost {
            command: "join".to_string(),
            name: "s2".to_string(),
            signer_group: "gA".to_string(),
            ..SignerPost::default()
        })
        .await
        .unwrap();
    assert!(!resp.error, "{}", resp.error_msg);

    let resp = client
        .zone(&ZonePost {
            command: "step-fsm".to_string(),
            zone: ZONE.to_string(),
            ..ZonePost::default()
        })
        .await
        .unwrap();
    assert!(!resp.error, "{}", resp.error_msg);
    assert_eq!(resp.transitioned, Some(true));
    assert_eq!(resp.zones.unwrap()[0].state, "dnskeys-synced");
}

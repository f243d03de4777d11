mod common;

use common::*;
use music::errors::MusicError;

#[tokio::test]
async fn test_lone_signer_joins_without_process() {
    let h = Harness::new().await;
    h.add_signer("s1").await;
    h.store.add_group(None, "gA").await.unwrap();

    h.engine.join_group("s1", "gA").await.unwrap();

    let group = h.store.get_group(None, "gA").await.unwrap();
    assert_eq!(group.signer_names(), vec!["s1".to_string()]);
    assert!(!group.locked);
    assert_eq!(group.curprocess, "");
}

#[tokio::test]
async fn test_second_signer_starts_add_signer() {
    let h = Harness::new().await;
    h.one_signer_zone().await;

    h.engine.join_group("s2", "gA").await.unwrap();

    let group = h.store.get_group(None, "gA").await.unwrap();
    assert_eq!(group.curprocess, "add-signer");
    assert_eq!(group.pendadd, "s2");
    assert!(group.locked);

    let zone = h.store.get_zone(None, ZONE).await.unwrap();
    assert_eq!(zone.fsm, "add-signer");
    assert_eq!(zone.state, "signers-unsynced");
    assert_eq!(zone.fsmsigner, "s2");
}

#[tokio::test]
async fn test_join_twice_is_refused() {
    let h = Harness::new().await;
    h.add_signer("s1").await;
    h.store.add_group(None, "gA").await.unwrap();

    h.engine.join_group("s1", "gA").await.unwrap();
    let before = h.store.get_group(None, "gA").await.unwrap();
    let err = h.engine.join_group("s1", "gA").await.unwrap_err();
    assert!(matches!(err, MusicError::Invariant(_)));
    assert_eq!(h.store.get_group(None, "gA").await.unwrap(), before);
}

#[tokio::test]
async fn test_leave_then_join_lone_signer() {
    let h = Harness::new().await;
    h.add_signer("s1").await;
    h.store.add_group(None, "gA").await.unwrap();

    h.engine.join_group("s1", "gA").await.unwrap();
    h.engine.leave_group("s1", "gA").await.unwrap();
    assert!(h.store.get_group(None, "gA").await.unwrap().signers.is_empty());

    h.engine.join_group("s1", "gA").await.unwrap();
    let group = h.store.get_group(None, "gA").await.unwrap();
    assert_eq!(group.signer_names(), vec!["s1".to_string()]);
    assert!(!group.locked);
}

#[tokio::test]
async fn test_locked_group_refuses_changes() {
    let h = Harness::new().await;
    h.one_signer_zone().await;
    h.add_signer("s3").await;

    h.engine.join_group("s2", "gA").await.unwrap();

    for result in [
        h.engine.join_group("s3", "gA").await,
        h.engine.leave_group("s1", "gA").await,
        h.engine.leave_group("s2", "gA").await,
    ] {
        assert!(matches!(result, Err(MusicError::Invariant(_))));
    }
    assert_eq!(h.store.get_group(None, "gA").await.unwrap().signers.len(), 2);
}

#[tokio::test]
async fn test_last_signer_cannot_leave_group_with_zones() {
    let h = Harness::new().await;
    h.one_signer_zone().await;

    let err = h.engine.leave_group("s1", "gA").await.unwrap_err();
    assert!(matches!(err, MusicError::Invariant(_)));
    assert!(err.to_string().contains("last signer"));
}

#[tokio::test]
async fn test_zone_join_records_origins() {
    use music::store::records::OriginKind;

    let h = Harness::new().await;
    h.one_signer_zone().await;

    let nses = h.store.list_origins(None, OriginKind::Ns, ZONE).await.unwrap();
    assert_eq!(nses.len(), 1);
    assert_eq!(nses[0].item, "ns1.s1.example.net.");
    assert_eq!(nses[0].signer, "s1");
    let keys = h.store.list_origins(None, OriginKind::Dnskey, ZONE).await.unwrap();
    assert_eq!(keys.len(), 2);
    assert!(keys.iter().all(|o| o.signer == "s1"));
}

#[tokio::test]
async fn test_zone_in_process_cannot_leave_group() {
    let h = Harness::new().await;
    h.one_signer_zone().await;
    h.engine.join_group("s2", "gA").await.unwrap();

    let err = h.engine.zone_leave_group(ZONE, "gA").await.unwrap_err();
    assert!(matches!(err, MusicError::Invariant(_)));
    assert!(matches!(
        h.engine.zone_leave_group(ZONE, "gB").await,
        Err(MusicError::Validation(_))
    ));
}

#[tokio::test]
async fn test_detaching_last_zone_unlocks_group() {
    let h = Harness::new().await;
    h.one_signer_zone().await;
    h.engine.join_group("s2", "gA").await.unwrap();
    assert!(h.store.get_group(None, "gA").await.unwrap().locked);

    let msg = h.engine.detach(None, ZONE, "").await.unwrap();
    assert!(msg.contains("complete"), "{}", msg);

    let zone = h.store.get_zone(None, ZONE).await.unwrap();
    assert_eq!(zone.fsm, "");
    let group = h.store.get_group(None, "gA").await.unwrap();
    assert!(!group.locked);
    assert_eq!(group.curprocess, "");
    assert_eq!(group.pendadd, "");

    // the group takes changes again
    h.engine.leave_group("s2", "gA").await.unwrap();
}

#[tokio::test]
async fn test_preempting_last_zone_unlocks_group() {
    let h = Harness::new().await;
    h.one_signer_zone().await;
    h.engine.join_group("s2", "gA").await.unwrap();

    h.engine
        .attach(None, ZONE, "remove-signer", "s2", true)
        .await
        .unwrap();

    let zone = h.store.get_zone(None, ZONE).await.unwrap();
    assert_eq!(zone.fsm, "remove-signer");
    let group = h.store.get_group(None, "gA").await.unwrap();
    assert!(!group.locked);
    assert_eq!(group.curprocess, "");
}

#[tokio::test]
async fn test_detach_and_unlock_share_one_transaction() {
    let h = Harness::new().await;
    h.one_signer_zone().await;
    h.engine.join_group("s2", "gA").await.unwrap();

    {
        let mut tx = h.store.tx(None).await.unwrap();
        h.engine.detach(Some(tx.conn()), ZONE, "").await.unwrap();
        // dropped without commit
    }

    let zone = h.store.get_zone(None, ZONE).await.unwrap();
    assert_eq!(zone.fsm, "add-signer");
    let group = h.store.get_group(None, "gA").await.unwrap();
    assert!(group.locked);
    assert_eq!(group.curprocess, "add-signer");
}

//! Operator reply in Matrix → phone reply endpoint.

use cona_types::{IdentityToken, UserId};
use serde_json::json;
use wiremock::MockServer;

use crate::common::{
    BridgeHarness, OPERATOR, ROOM_ID, ghost_for, json_body, mount_alias, mount_create_room,
    mount_ghost_endpoints, mount_joined_members, mount_reply, requests_to, wait_for_requests,
};

async fn operator_and(name: &str, homeserver: &MockServer) {
    let operator = UserId::parse(OPERATOR).unwrap();
    mount_joined_members(homeserver, &[operator, ghost_for(name)]).await;
}

#[tokio::test]
async fn operator_reply_is_forwarded_with_real_title() {
    let homeserver = MockServer::start().await;
    let phone = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    mount_ghost_endpoints(&homeserver).await;
    mount_alias(&homeserver, 2).await;
    mount_create_room(&homeserver, 1).await;
    operator_and("Alice Example", &homeserver).await;
    mount_reply(&phone).await;

    let bridge =
        BridgeHarness::start(&homeserver, &phone, &dir.path().join("title_map.json")).await;
    bridge.notify("com.teams.android", "Alice Example", "Hi").await;

    let response = bridge
        .push_message("txn1", OPERATOR, ROOM_ID, "m.text", "Sure")
        .await;
    assert_eq!(response.status(), 200);

    let replies = wait_for_requests(&phone, "/reply", 1).await;
    assert_eq!(
        json_body(&replies[0]),
        json!({"title": "Alice Example", "text": "Sure"})
    );
}

#[tokio::test]
async fn title_survives_restart() {
    let homeserver = MockServer::start().await;
    let phone = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let title_map = dir.path().join("title_map.json");
    mount_ghost_endpoints(&homeserver).await;
    mount_alias(&homeserver, 2).await;
    mount_create_room(&homeserver, 1).await;
    operator_and("山田 太郎", &homeserver).await;
    mount_reply(&phone).await;

    BridgeHarness::start(&homeserver, &phone, &title_map)
        .await
        .notify("com.teams.android", "山田 太郎", "こんにちは")
        .await;

    // A fresh bridge only knows the name through the title map on disk.
    let restarted = BridgeHarness::start(&homeserver, &phone, &title_map).await;
    restarted
        .push_message("txn1", OPERATOR, ROOM_ID, "m.text", "はい")
        .await;

    let replies = wait_for_requests(&phone, "/reply", 1).await;
    assert_eq!(json_body(&replies[0]), json!({"title": "山田 太郎", "text": "はい"}));
}

#[tokio::test]
async fn unknown_token_falls_back_to_label() {
    let homeserver = MockServer::start().await;
    let phone = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    operator_and("Alice Example", &homeserver).await;
    mount_reply(&phone).await;

    let bridge =
        BridgeHarness::start(&homeserver, &phone, &dir.path().join("title_map.json")).await;
    bridge
        .push_message("txn1", OPERATOR, ROOM_ID, "m.text", "Sure")
        .await;

    let replies = wait_for_requests(&phone, "/reply", 1).await;
    let label = IdentityToken::derive("Alice Example").humanize();
    assert_eq!(json_body(&replies[0]), json!({"title": label, "text": "Sure"}));
}

#[tokio::test]
async fn only_operator_text_is_forwarded() {
    let homeserver = MockServer::start().await;
    let phone = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    operator_and("Alice Example", &homeserver).await;
    mount_reply(&phone).await;

    let bridge =
        BridgeHarness::start(&homeserver, &phone, &dir.path().join("title_map.json")).await;
    let ghost = ghost_for("Alice Example");
    bridge
        .push_message("txn1", ghost.as_str(), ROOM_ID, "m.text", "echo")
        .await;
    bridge
        .push_message("txn2", OPERATOR, ROOM_ID, "m.notice", "notice")
        .await;
    bridge
        .push_message("txn3", OPERATOR, ROOM_ID, "m.text", "real")
        .await;

    // Events are drained in order, so once the last one lands the others
    // have already been dropped.
    let replies = wait_for_requests(&phone, "/reply", 1).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(json_body(&replies[0])["text"], "real");
    assert_eq!(requests_to(&homeserver, "/joined_members").await.len(), 1);
}

#[tokio::test]
async fn redelivered_transaction_is_forwarded_once() {
    let homeserver = MockServer::start().await;
    let phone = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    operator_and("Alice Example", &homeserver).await;
    mount_reply(&phone).await;

    let bridge =
        BridgeHarness::start(&homeserver, &phone, &dir.path().join("title_map.json")).await;
    for _ in 0..2 {
        let response = bridge
            .push_message("txn1", OPERATOR, ROOM_ID, "m.text", "Sure")
            .await;
        assert_eq!(response.status(), 200);
    }
    bridge
        .push_message("txn2", OPERATOR, ROOM_ID, "m.text", "marker")
        .await;

    let replies = wait_for_requests(&phone, "/reply", 2).await;
    let texts: Vec<_> = replies.iter().map(|r| json_body(r)["text"].clone()).collect();
    assert_eq!(texts, [json!("Sure"), json!("marker")]);
}

//! Phone notification → Matrix, through the real HTTP stack.

use std::fs;

use cona_types::IdentityToken;
use serde_json::json;
use wiremock::MockServer;

use crate::common::{
    BridgeHarness, OPERATOR, ROOM_ID, ghost_for, json_body, mount_alias, mount_create_room,
    mount_ghost_endpoints, requests_to,
};

#[tokio::test]
async fn first_notification_provisions_room_and_relays_text() {
    let homeserver = MockServer::start().await;
    let phone = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    mount_ghost_endpoints(&homeserver).await;
    mount_alias(&homeserver, 2).await;
    mount_create_room(&homeserver, 1).await;

    let bridge =
        BridgeHarness::start(&homeserver, &phone, &dir.path().join("title_map.json")).await;
    let response = bridge.notify("com.teams.android", "Alice Example", "Hi").await;
    assert_eq!(response.status(), 200);

    let ghost = ghost_for("Alice Example");
    let token = IdentityToken::derive("Alice Example");

    let register = requests_to(&homeserver, "/register").await;
    assert_eq!(register.len(), 1);
    assert_eq!(json_body(&register[0])["username"], ghost.localpart());

    let profile = requests_to(&homeserver, "/displayname").await;
    assert_eq!(json_body(&profile[0]), json!({"displayname": "Alice Example"}));

    let create = requests_to(&homeserver, "/createRoom").await;
    assert_eq!(create.len(), 1);
    assert_eq!(
        json_body(&create[0]),
        json!({
            "visibility": "private",
            "room_alias_name": format!("teams_{token}"),
            "invite": [OPERATOR],
            "name": "Teams - Alice Example",
            "is_direct": true,
        })
    );
    assert!(
        create[0]
            .url
            .query_pairs()
            .any(|(k, v)| k == "user_id" && v == ghost.as_str())
    );

    let sent = requests_to(&homeserver, "").await;
    let sends: Vec<_> = sent
        .iter()
        .filter(|r| r.url.path().contains("/send/m.room.message/"))
        .collect();
    assert_eq!(sends.len(), 1);
    assert!(sends[0].url.path().contains(&format!("/rooms/{ROOM_ID}/")));
    assert_eq!(json_body(sends[0]), json!({"msgtype": "m.text", "body": "Hi"}));

    let stored: serde_json::Value =
        serde_json::from_slice(&fs::read(&bridge.title_map).unwrap()).unwrap();
    assert_eq!(stored, json!({ token.as_str(): "Alice Example" }));
}

#[tokio::test]
async fn repeat_notification_reuses_room() {
    let homeserver = MockServer::start().await;
    let phone = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    mount_ghost_endpoints(&homeserver).await;
    mount_alias(&homeserver, 2).await;
    mount_create_room(&homeserver, 1).await;

    let bridge =
        BridgeHarness::start(&homeserver, &phone, &dir.path().join("title_map.json")).await;
    bridge.notify("com.teams.android", "Alice Example", "Hi").await;
    bridge.notify("com.teams.android", "Alice Example", "Again").await;

    let sends: Vec<_> = requests_to(&homeserver, "")
        .await
        .into_iter()
        .filter(|r| r.url.path().contains("/send/m.room.message/"))
        .collect();
    assert_eq!(sends.len(), 2);
    assert_eq!(json_body(&sends[1])["body"], "Again");
    // Distinct transaction IDs per message.
    assert_ne!(sends[0].url.path(), sends[1].url.path());
    // Registration is remembered for the process lifetime.
    assert_eq!(requests_to(&homeserver, "/register").await.len(), 1);
}

#[tokio::test]
async fn other_app_notification_is_ignored() {
    let homeserver = MockServer::start().await;
    let phone = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    let bridge =
        BridgeHarness::start(&homeserver, &phone, &dir.path().join("title_map.json")).await;
    let response = bridge.notify("com.other.app", "Alice Example", "Hi").await;

    assert_eq!(response.status(), 200);
    assert!(homeserver.received_requests().await.unwrap().is_empty());
    assert!(!bridge.title_map.exists());
}

#[tokio::test]
async fn homeserver_outage_still_records_title() {
    let homeserver = MockServer::start().await;
    let phone = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    // No mocks: every homeserver call answers 404 without a Matrix body,
    // which the alias lookup treats as "not found" and createRoom as failure.

    let bridge =
        BridgeHarness::start(&homeserver, &phone, &dir.path().join("title_map.json")).await;
    let response = bridge.notify("com.teams.android", "Bob", "Hi").await;
    assert_eq!(response.status(), 200);

    let stored: serde_json::Value =
        serde_json::from_slice(&fs::read(&bridge.title_map).unwrap()).unwrap();
    assert_eq!(stored[IdentityToken::derive("Bob").as_str()], "Bob");
    assert!(
        requests_to(&homeserver, "")
            .await
            .iter()
            .all(|r| !r.url.path().contains("/send/"))
    );
}

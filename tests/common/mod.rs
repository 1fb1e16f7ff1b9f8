//! Shared test utilities and fixtures
//!
//! A running bridge wired to wiremock stand-ins for the homeserver and the
//! phone's reply endpoint.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::pending;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cona_config::BridgeConfig;
use cona_core::{Bridge, HttpReplySink, ReplySink, TitleStore};
use cona_matrix::{AppserviceClient, ChatNetwork};
use cona_server::AppState;
use cona_types::{GhostNaming, IdentityToken, UserId};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

pub const OPERATOR: &str = "@operator:example.org";
pub const DOMAIN: &str = "example.org";
pub const HS_TOKEN: &str = "hs_secret";
pub const AS_TOKEN: &str = "as_secret";
pub const ROOM_ID: &str = "!alice:example.org";

pub fn naming() -> GhostNaming {
    GhostNaming::new("teams_", DOMAIN)
}

pub fn ghost_for(name: &str) -> UserId {
    naming().ghost_user_id(&IdentityToken::derive(name))
}

/// A bridge listening on an ephemeral port.
pub struct BridgeHarness {
    pub base: String,
    pub http: reqwest::Client,
    pub title_map: PathBuf,
}

impl BridgeHarness {
    pub async fn start(homeserver: &MockServer, phone: &MockServer, title_map: &Path) -> Self {
        let vars: HashMap<&str, String> = HashMap::from([
            ("MATRIX_USER_ID", OPERATOR.to_string()),
            ("MATRIX_HOMESERVER_URL", homeserver.uri()),
            ("MATRIX_DOMAIN", DOMAIN.to_string()),
            ("CONA_AS_TOKEN", AS_TOKEN.to_string()),
            ("CONA_HS_TOKEN", HS_TOKEN.to_string()),
            ("CONA_REPLY_URL", format!("{}/reply", phone.uri())),
            ("CONA_TITLE_MAP_PATH", title_map.display().to_string()),
        ]);
        let config = BridgeConfig::from_lookup(|key| vars.get(key).cloned()).unwrap();

        let network: Arc<dyn ChatNetwork> = Arc::new(
            AppserviceClient::new(config.homeserver_url.clone(), config.as_token.clone())
                .unwrap(),
        );
        let replies: Arc<dyn ReplySink> =
            Arc::new(HttpReplySink::new(config.reply_url.clone()).unwrap());
        let store = Arc::new(TitleStore::open(&config.title_map_path));
        let bridge = Bridge::new(&config, network, store, replies);
        let (state, _drain) = AppState::for_bridge(&bridge, &config);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(cona_server::serve(listener, state, pending()));

        Self {
            base,
            http: reqwest::Client::new(),
            title_map: title_map.to_path_buf(),
        }
    }

    pub async fn notify(&self, package: &str, title: &str, text: &str) -> reqwest::Response {
        self.http
            .post(format!("{}/event", self.base))
            .json(&json!({
                "packageName": package,
                "title": title,
                "text": text,
                "tag": null,
            }))
            .send()
            .await
            .unwrap()
    }

    /// Push one `m.room.message` from `sender` as a homeserver transaction.
    pub async fn push_message(
        &self,
        txn_id: &str,
        sender: &str,
        room: &str,
        msgtype: &str,
        body: &str,
    ) -> reqwest::Response {
        self.http
            .put(format!("{}/_matrix/app/v1/transactions/{txn_id}", self.base))
            .bearer_auth(HS_TOKEN)
            .json(&json!({
                "events": [{
                    "type": "m.room.message",
                    "event_id": format!("${txn_id}"),
                    "sender": sender,
                    "room_id": room,
                    "content": {"msgtype": msgtype, "body": body},
                }]
            }))
            .send()
            .await
            .unwrap()
    }
}

/// Register, profile and send endpoints that always succeed.
pub async fn mount_ghost_endpoints(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/_matrix/client/v3/register"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"user_id": "@x:example.org"})),
        )
        .mount(server)
        .await;
    Mock::given(method("PUT"))
        .and(path_regex(r"^/_matrix/client/v3/profile/[^/]+/displayname$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(server)
        .await;
    Mock::given(method("PUT"))
        .and(path_regex(r"^/_matrix/client/v3/rooms/[^/]+/send/m\.room\.message/[^/]+$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"event_id": "$sent"})))
        .mount(server)
        .await;
}

/// The alias is unknown for the first `misses` lookups, then resolves to
/// [`ROOM_ID`].
pub async fn mount_alias(server: &MockServer, misses: u64) {
    if misses > 0 {
        Mock::given(method("GET"))
            .and(path_regex(r"^/_matrix/client/v3/directory/room/.+$"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "errcode": "M_NOT_FOUND",
                "error": "Room alias not found",
            })))
            .up_to_n_times(misses)
            .mount(server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path_regex(r"^/_matrix/client/v3/directory/room/.+$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "room_id": ROOM_ID,
            "servers": [DOMAIN],
        })))
        .mount(server)
        .await;
}

pub async fn mount_create_room(server: &MockServer, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/_matrix/client/v3/createRoom"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"room_id": ROOM_ID})))
        .expect(expected_calls)
        .mount(server)
        .await;
}

pub async fn mount_joined_members(server: &MockServer, members: &[UserId]) {
    let joined: serde_json::Map<String, Value> = members
        .iter()
        .map(|user| (user.as_str().to_string(), json!({})))
        .collect();
    Mock::given(method("GET"))
        .and(path_regex(r"^/_matrix/client/v3/rooms/[^/]+/joined_members$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "joined": joined })))
        .mount(server)
        .await;
}

pub async fn mount_reply(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/reply"))
        .respond_with(ResponseTemplate::new(200).set_body_string("Reply sent"))
        .mount(server)
        .await;
}

/// Requests to `server` whose path matches `path_suffix`.
pub async fn requests_to(server: &MockServer, path_suffix: &str) -> Vec<Request> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|request| request.url.path().ends_with(path_suffix))
        .collect()
}

/// Wait until `server` has seen `count` requests ending in `path_suffix`.
/// Outbound delivery runs on a background task, so assertions poll.
pub async fn wait_for_requests(
    server: &MockServer,
    path_suffix: &str,
    count: usize,
) -> Vec<Request> {
    timeout(Duration::from_secs(5), async {
        loop {
            let requests = requests_to(server, path_suffix).await;
            if requests.len() >= count {
                return requests;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {count} request(s) to {path_suffix}"))
}

pub fn json_body(request: &Request) -> Value {
    serde_json::from_slice(&request.body).unwrap()
}

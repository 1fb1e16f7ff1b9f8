use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use cona_types::{AccessToken, RoomAlias, RoomId, UserId};
use reqwest::Method;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use url::Url;
use uuid::Uuid;

use crate::retry::{self, Idempotency, RetryConfig, RetryOutcome};
use crate::{ChatNetwork, CreateRoomRequest, MatrixError, NetFut, api_error, http_client_builder};

const CLIENT_API: [&str; 3] = ["_matrix", "client", "v3"];

/// Client-server API access as the application service.
///
/// Requests without a masqueraded user act as the bridge bot (the
/// registration's `sender_localpart`).
#[derive(Debug)]
pub struct AppserviceClient {
    http: reqwest::Client,
    homeserver: Url,
    as_token: AccessToken,
    retry: RetryConfig,
    /// Users already confirmed registered during this process lifetime.
    registered: Mutex<HashSet<UserId>>,
}

#[derive(Deserialize)]
struct RoomIdResponse {
    room_id: RoomId,
}

#[derive(Deserialize)]
struct EventIdResponse {
    event_id: String,
}

#[derive(Deserialize)]
struct JoinedMembersResponse {
    joined: serde_json::Map<String, Value>,
}

impl AppserviceClient {
    pub fn new(homeserver: Url, as_token: AccessToken) -> Result<Self, MatrixError> {
        let http = http_client_builder()
            .build()
            .map_err(|e| MatrixError::Decode(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_http_client(http, homeserver, as_token))
    }

    #[must_use]
    pub fn with_http_client(http: reqwest::Client, homeserver: Url, as_token: AccessToken) -> Self {
        Self {
            http,
            homeserver,
            as_token,
            retry: RetryConfig::default(),
            registered: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Build `{homeserver}/_matrix/client/v3/{segments..}`, percent-encoding
    /// each segment, with an optional `user_id` masquerade.
    fn endpoint(&self, segments: &[&str], as_user: Option<&UserId>) -> Result<Url, MatrixError> {
        let mut url = self.homeserver.clone();
        url.path_segments_mut()
            .map_err(|()| MatrixError::InvalidUrl(self.homeserver.to_string()))?
            .pop_if_empty()
            .extend(CLIENT_API)
            .extend(segments);
        if let Some(user) = as_user {
            url.query_pairs_mut().append_pair("user_id", user.as_str());
        }
        Ok(url)
    }

    async fn execute(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
        idempotency: Idempotency,
    ) -> Result<reqwest::Response, MatrixError> {
        let build = || {
            let request = self
                .http
                .request(method.clone(), url.clone())
                .bearer_auth(self.as_token.expose_secret());
            match body {
                Some(body) => request.json(body),
                None => request,
            }
        };

        match retry::send_with_retry(build, idempotency, &self.retry).await {
            RetryOutcome::Success(response) => Ok(response),
            RetryOutcome::HttpError(response) => Err(api_error(response).await),
            RetryOutcome::ConnectionError { attempts, source } => {
                Err(MatrixError::Transport { attempts, source })
            }
        }
    }

    async fn execute_json<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
        idempotency: Idempotency,
    ) -> Result<T, MatrixError> {
        let response = self.execute(method, url, body, idempotency).await?;
        let bytes = response.bytes().await.map_err(|e| MatrixError::Transport {
            attempts: 1,
            source: e,
        })?;
        serde_json::from_slice(&bytes).map_err(|e| MatrixError::Decode(e.to_string()))
    }

    fn is_known_registered(&self, user: &UserId) -> bool {
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(user)
    }

    fn mark_registered(&self, user: &UserId) {
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user.clone());
    }

    async fn register(&self, user: &UserId) -> Result<(), MatrixError> {
        if self.is_known_registered(user) {
            return Ok(());
        }

        let url = self.endpoint(&["register"], None)?;
        let body = json!({
            "type": "m.login.application_service",
            "username": user.localpart(),
            "inhibit_login": true,
        });
        match self
            .execute(Method::POST, url, Some(&body), Idempotency::Idempotent)
            .await
        {
            Ok(_) => {
                tracing::debug!(user = %user, "Registered ghost");
            }
            Err(e) if e.errcode() == Some("M_USER_IN_USE") => {}
            Err(e) => return Err(e),
        }
        self.mark_registered(user);
        Ok(())
    }

    async fn put_display_name(&self, user: &UserId, name: &str) -> Result<(), MatrixError> {
        let url = self.endpoint(&["profile", user.as_str(), "displayname"], Some(user))?;
        let body = json!({ "displayname": name });
        self.execute(Method::PUT, url, Some(&body), Idempotency::Idempotent)
            .await?;
        Ok(())
    }

    async fn lookup_alias(&self, alias: &RoomAlias) -> Result<Option<RoomId>, MatrixError> {
        let url = self.endpoint(&["directory", "room", alias.as_str()], None)?;
        match self
            .execute_json::<RoomIdResponse>(Method::GET, url, None, Idempotency::Idempotent)
            .await
        {
            Ok(resp) => Ok(Some(resp.room_id)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn post_create_room(
        &self,
        creator: &UserId,
        request: &CreateRoomRequest,
    ) -> Result<RoomId, MatrixError> {
        let url = self.endpoint(&["createRoom"], Some(creator))?;
        let body = serde_json::to_value(request).map_err(|e| MatrixError::Decode(e.to_string()))?;
        let resp: RoomIdResponse = self
            .execute_json(Method::POST, url, Some(&body), Idempotency::NonIdempotent)
            .await?;
        Ok(resp.room_id)
    }

    async fn put_text(
        &self,
        sender: &UserId,
        room: &RoomId,
        text: &str,
    ) -> Result<String, MatrixError> {
        // One transaction ID for every attempt so the homeserver deduplicates.
        let txn_id = Uuid::new_v4().to_string();
        let url = self.endpoint(
            &["rooms", room.as_str(), "send", "m.room.message", &txn_id],
            Some(sender),
        )?;
        let body = json!({ "msgtype": "m.text", "body": text });
        let resp: EventIdResponse = self
            .execute_json(Method::PUT, url, Some(&body), Idempotency::Idempotent)
            .await?;
        Ok(resp.event_id)
    }

    async fn get_joined_members(&self, room: &RoomId) -> Result<Vec<UserId>, MatrixError> {
        let url = self.endpoint(&["rooms", room.as_str(), "joined_members"], None)?;
        let resp: JoinedMembersResponse = self
            .execute_json(Method::GET, url, None, Idempotency::Idempotent)
            .await?;

        let mut members = Vec::with_capacity(resp.joined.len());
        for raw in resp.joined.keys() {
            match UserId::parse(raw.as_str()) {
                Ok(user) => members.push(user),
                Err(e) => tracing::warn!(room_id = %room, %e, "Skipping malformed member ID"),
            }
        }
        Ok(members)
    }
}

impl ChatNetwork for AppserviceClient {
    fn ensure_registered<'a>(&'a self, user: &'a UserId) -> NetFut<'a, ()> {
        Box::pin(self.register(user))
    }

    fn set_display_name<'a>(&'a self, user: &'a UserId, name: &'a str) -> NetFut<'a, ()> {
        Box::pin(self.put_display_name(user, name))
    }

    fn resolve_alias<'a>(&'a self, alias: &'a RoomAlias) -> NetFut<'a, Option<RoomId>> {
        Box::pin(self.lookup_alias(alias))
    }

    fn create_room<'a>(
        &'a self,
        creator: &'a UserId,
        request: &'a CreateRoomRequest,
    ) -> NetFut<'a, RoomId> {
        Box::pin(self.post_create_room(creator, request))
    }

    fn send_text<'a>(
        &'a self,
        sender: &'a UserId,
        room: &'a RoomId,
        body: &'a str,
    ) -> NetFut<'a, String> {
        Box::pin(self.put_text(sender, room, body))
    }

    fn joined_members<'a>(&'a self, room: &'a RoomId) -> NetFut<'a, Vec<UserId>> {
        Box::pin(self.get_joined_members(room))
    }
}

//! Matrix application-service plumbing.
//!
//! # Architecture
//!
//! - [`ChatNetwork`] - the operations the bridge core needs from the chat
//!   network. The core only ever sees this trait.
//! - [`AppserviceClient`] - client-server API implementation authenticated
//!   with the application-service token, impersonating ghosts via the
//!   `user_id` query parameter.
//! - [`transaction`] - decoding of homeserver-pushed transactions into
//!   [`ChatMessageEvent`]s.
//! - [`retry`] - transport-level retry with backoff.
//!
//! # Error Handling
//!
//! Every operation returns [`MatrixError`]. Homeserver rejections keep their
//! Matrix `errcode` so callers can distinguish "not found" from real faults.

mod client;
pub mod retry;
pub mod transaction;

pub use client::AppserviceClient;
pub use cona_types;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use cona_types::{ChatMessageEvent, RoomAlias, RoomId, UserId};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

const CONNECT_TIMEOUT_SECS: u64 = 30;
const TCP_KEEPALIVE_SECS: u64 = 60;
const POOL_IDLE_TIMEOUT_SECS: u64 = 90;
const MAX_ERROR_BODY_BYTES: usize = 32 * 1024;

/// Boxed future returned by [`ChatNetwork`] operations.
pub type NetFut<'a, T> = Pin<Box<dyn Future<Output = Result<T, MatrixError>> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum MatrixError {
    /// The homeserver answered with a non-success status. `errcode` is
    /// `None` when the body was not a Matrix error object.
    #[error(
        "homeserver returned {status} {}: {message}",
        errcode.as_deref().unwrap_or("(no errcode)")
    )]
    Api {
        status: u16,
        errcode: Option<String>,
        message: String,
    },
    #[error("request failed after {attempts} attempts: {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
    #[error("unexpected homeserver response: {0}")]
    Decode(String),
    #[error("cannot build request URL: {0}")]
    InvalidUrl(String),
}

impl MatrixError {
    #[must_use]
    pub fn errcode(&self) -> Option<&str> {
        match self {
            Self::Api { errcode, .. } => errcode.as_deref(),
            _ => None,
        }
    }

    /// `M_NOT_FOUND`, or a bare 404 without a Matrix error body. A 404 with
    /// any other errcode (`M_UNRECOGNIZED` from a wrong base path) is a fault.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Api {
                errcode: Some(code),
                ..
            } => code == "M_NOT_FOUND",
            Self::Api {
                status: 404,
                errcode: None,
                ..
            } => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

/// Body of `POST /createRoom`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateRoomRequest {
    pub visibility: Visibility,
    /// Localpart only; the homeserver appends its own server name.
    pub room_alias_name: String,
    pub invite: Vec<UserId>,
    pub name: String,
    pub is_direct: bool,
}

/// Chat-network operations used by the bridge core.
///
/// Futures are boxed so implementations can be stored as `Arc<dyn ChatNetwork>`.
pub trait ChatNetwork: Send + Sync {
    /// Register `user` in the application-service namespace. Re-registering
    /// an existing user succeeds.
    fn ensure_registered<'a>(&'a self, user: &'a UserId) -> NetFut<'a, ()>;

    fn set_display_name<'a>(&'a self, user: &'a UserId, name: &'a str) -> NetFut<'a, ()>;

    /// `Ok(None)` when the alias does not exist; other failures are errors.
    fn resolve_alias<'a>(&'a self, alias: &'a RoomAlias) -> NetFut<'a, Option<RoomId>>;

    fn create_room<'a>(
        &'a self,
        creator: &'a UserId,
        request: &'a CreateRoomRequest,
    ) -> NetFut<'a, RoomId>;

    /// Send an `m.text` message; returns the event ID.
    fn send_text<'a>(
        &'a self,
        sender: &'a UserId,
        room: &'a RoomId,
        body: &'a str,
    ) -> NetFut<'a, String>;

    fn joined_members<'a>(&'a self, room: &'a RoomId) -> NetFut<'a, Vec<UserId>>;
}

/// Sending half of the inbound chat event stream.
pub type ChatEventSender = mpsc::Sender<ChatMessageEvent>;
/// Receiving half of the inbound chat event stream.
pub type ChatEventReceiver = mpsc::Receiver<ChatMessageEvent>;

pub fn http_client_builder() -> reqwest::ClientBuilder {
    use reqwest::header::{HeaderMap, HeaderValue};

    let mut default_headers = HeaderMap::new();
    default_headers.insert(
        reqwest::header::USER_AGENT,
        HeaderValue::from_static(concat!("cona-bridge/", env!("CARGO_PKG_VERSION"))),
    );

    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .redirect(reqwest::redirect::Policy::none())
        .tcp_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS)))
        .pool_idle_timeout(Some(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS)))
        .default_headers(default_headers)
}

pub async fn read_capped_error_body(response: reqwest::Response) -> String {
    use futures_util::StreamExt;
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        body.extend_from_slice(&chunk);
        if body.len() > MAX_ERROR_BODY_BYTES {
            body.truncate(MAX_ERROR_BODY_BYTES);
            let text = String::from_utf8_lossy(&body);
            return format!("{text}...(truncated)");
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}

/// Turn a failed response into [`MatrixError::Api`], keeping the `errcode`.
pub async fn api_error(response: reqwest::Response) -> MatrixError {
    #[derive(serde::Deserialize)]
    struct ErrorBody {
        errcode: String,
        #[serde(default)]
        error: String,
    }

    let status = response.status().as_u16();
    let text = read_capped_error_body(response).await;
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => MatrixError::Api {
            status,
            errcode: Some(body.errcode),
            message: body.error,
        },
        Err(_) => MatrixError::Api {
            status,
            errcode: None,
            message: text,
        },
    }
}

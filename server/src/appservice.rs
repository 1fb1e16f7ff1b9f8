//! Homeserver → bridge half of the application-service protocol.

use std::collections::HashMap;
use std::sync::PoisonError;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use cona_matrix::transaction::Transaction;
use cona_types::UserId;
use serde_json::json;

use crate::AppState;

type QueryParams = Query<HashMap<String, String>>;

fn matrix_error(status: StatusCode, errcode: &str, message: &str) -> Response {
    (
        status,
        Json(json!({ "errcode": errcode, "error": message })),
    )
        .into_response()
}

fn empty_ok() -> Response {
    (StatusCode::OK, Json(json!({}))).into_response()
}

/// Check the homeserver token, sent either as a bearer token or as the
/// legacy `access_token` query parameter.
fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Result<(), Response> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    let Some(presented) = bearer.or_else(|| query.get("access_token").map(String::as_str)) else {
        return Err(matrix_error(
            StatusCode::UNAUTHORIZED,
            "M_MISSING_TOKEN",
            "Missing homeserver token",
        ));
    };
    if presented != state.hs_token.expose_secret() {
        tracing::warn!("Rejecting request with wrong homeserver token");
        return Err(matrix_error(
            StatusCode::FORBIDDEN,
            "M_FORBIDDEN",
            "Bad homeserver token",
        ));
    }
    Ok(())
}

/// `PUT /_matrix/app/v1/transactions/{txnId}`.
///
/// A transaction ID seen before, or still being queued by an earlier
/// request, is acknowledged without redelivery. The ID is only recorded once
/// every message is queued, so a failed push is retried in full by the
/// homeserver.
pub(crate) async fn transaction(
    State(state): State<AppState>,
    Path(txn_id): Path<String>,
    Query(query): QueryParams,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(rejection) = authorize(&state, &headers, &query) {
        return rejection;
    }

    let Some(claim) = TxnClaim::begin(&state, &txn_id) else {
        tracing::debug!(%txn_id, "Duplicate transaction");
        return empty_ok();
    };

    let transaction: Transaction = match serde_json::from_slice(&body) {
        Ok(transaction) => transaction,
        Err(e) => {
            tracing::warn!(%txn_id, error = %e, "Rejecting malformed transaction");
            return matrix_error(StatusCode::BAD_REQUEST, "M_NOT_JSON", "Malformed transaction");
        }
    };

    let messages = transaction.message_events();
    tracing::debug!(
        %txn_id,
        events = transaction.events.len(),
        messages = messages.len(),
        "Transaction received"
    );
    for message in messages {
        if state.events.send(message).await.is_err() {
            tracing::error!(%txn_id, "Outbound router is gone, refusing transaction");
            return matrix_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "M_UNKNOWN",
                "Bridge is shutting down",
            );
        }
    }

    claim.finish();
    empty_ok()
}

/// In-flight claim on a transaction ID. Dropped without [`TxnClaim::finish`]
/// (early return, or the request future cancelled on disconnect), it releases
/// the ID so the homeserver's redelivery is processed.
struct TxnClaim<'a> {
    state: &'a AppState,
    txn_id: &'a str,
    finished: bool,
}

impl<'a> TxnClaim<'a> {
    fn begin(state: &'a AppState, txn_id: &'a str) -> Option<Self> {
        let claimed = state
            .seen_txns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .begin(txn_id);
        claimed.then_some(Self {
            state,
            txn_id,
            finished: false,
        })
    }

    fn finish(mut self) {
        self.finished = true;
        self.state
            .seen_txns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .finish(self.txn_id.to_string());
    }
}

impl Drop for TxnClaim<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.state
                .seen_txns
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .abandon(self.txn_id);
        }
    }
}

/// `GET /_matrix/app/v1/users/{userId}`.
///
/// A 200 tells the homeserver the user now exists, so ghost IDs are
/// registered before answering. Anything that is not a ghost is 404.
pub(crate) async fn query_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): QueryParams,
    headers: HeaderMap,
) -> Response {
    if let Err(rejection) = authorize(&state, &headers, &query) {
        return rejection;
    }
    let Some(user) = UserId::parse(user_id)
        .ok()
        .filter(|user| state.naming.parse_ghost(user).is_some())
    else {
        return matrix_error(StatusCode::NOT_FOUND, "M_NOT_FOUND", "Not a bridge ghost");
    };
    match state.network.ensure_registered(&user).await {
        Ok(()) => {
            tracing::debug!(user_id = %user, "Ghost provisioned on user query");
            empty_ok()
        }
        Err(e) => {
            tracing::warn!(
                user_id = %user,
                error = %e,
                "Ghost registration failed on user query"
            );
            matrix_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "M_UNKNOWN",
                "Ghost registration failed",
            )
        }
    }
}

/// `GET /_matrix/app/v1/rooms/{alias}`.
///
/// Rooms only come into existence when a notification arrives.
pub(crate) async fn query_room(
    State(state): State<AppState>,
    Path(alias): Path<String>,
    Query(query): QueryParams,
    headers: HeaderMap,
) -> Response {
    if let Err(rejection) = authorize(&state, &headers, &query) {
        return rejection;
    }
    tracing::debug!(%alias, "Declining room query");
    matrix_error(StatusCode::NOT_FOUND, "M_NOT_FOUND", "Rooms are created on demand only")
}

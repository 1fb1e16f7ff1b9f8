use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use cona_types::NotificationEvent;
use serde_json::{Value, json};

use crate::AppState;

/// `POST /event`.
///
/// The body is parsed by hand rather than through the `Json` extractor: the
/// phone does not always send a JSON content type, and every decode failure
/// must be a plain 400.
pub(crate) async fn notification(State(state): State<AppState>, body: Bytes) -> StatusCode {
    let event: NotificationEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(error = %e, "Rejecting malformed notification");
            return StatusCode::BAD_REQUEST;
        }
    };

    let outcome = state.inbound.handle(&event).await;
    tracing::debug!(?outcome, "Notification handled");
    StatusCode::OK
}

pub(crate) async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

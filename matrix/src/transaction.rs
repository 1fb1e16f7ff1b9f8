//! Homeserver → application service transactions.
//!
//! The homeserver pushes batches of events to
//! `PUT /_matrix/app/v1/transactions/{txnId}`. Only `m.room.message` events
//! matter to the bridge; everything else in the batch is skipped.

use cona_types::{ChatMessageEvent, MessageType, RoomId, UserId};
use serde::Deserialize;
use serde_json::Value;

pub const ROOM_MESSAGE: &str = "m.room.message";

#[derive(Debug, Deserialize)]
pub struct Transaction {
    #[serde(default)]
    pub events: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    sender: String,
    room_id: String,
    #[serde(default)]
    event_id: Option<String>,
    #[serde(default)]
    content: Value,
}

impl Transaction {
    /// Room messages in this transaction, in delivery order.
    ///
    /// Events that are not messages, or that are malformed, are dropped with
    /// a debug log; one bad event never rejects the whole batch.
    #[must_use]
    pub fn message_events(&self) -> Vec<ChatMessageEvent> {
        self.events.iter().filter_map(decode_message).collect()
    }
}

fn decode_message(raw: &Value) -> Option<ChatMessageEvent> {
    let event: RawEvent = match serde_json::from_value(raw.clone()) {
        Ok(event) => event,
        Err(e) => {
            tracing::debug!(%e, "Skipping undecodable event in transaction");
            return None;
        }
    };
    if event.kind != ROOM_MESSAGE {
        return None;
    }

    let sender = UserId::parse(event.sender).ok()?;
    let room_id = RoomId::parse(event.room_id).ok()?;
    let msgtype = event.content.get("msgtype").and_then(Value::as_str)?;
    let body = event
        .content
        .get("body")
        .and_then(Value::as_str)
        .unwrap_or_default();

    Some(ChatMessageEvent {
        event_id: event.event_id,
        sender,
        room_id,
        msgtype: MessageType::parse(msgtype),
        body: body.to_string(),
    })
}

//! Payloads crossing the two sides of the bridge.

use serde::{Deserialize, Serialize};

use crate::ids::{RoomId, UserId};

/// Notification pushed by the phone to the `/event` webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    pub package_name: String,
    pub title: String,
    pub text: String,
    #[serde(default)]
    pub tag: Option<String>,
}

/// Body posted to the phone's reply endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyRequest {
    pub title: String,
    pub text: String,
}

/// `msgtype` of an `m.room.message` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageType {
    Text,
    Notice,
    Emote,
    Other(String),
}

impl MessageType {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "m.text" => Self::Text,
            "m.notice" => Self::Notice,
            "m.emote" => Self::Emote,
            other => Self::Other(other.to_string()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Text => "m.text",
            Self::Notice => "m.notice",
            Self::Emote => "m.emote",
            Self::Other(raw) => raw,
        }
    }
}

/// A room message delivered to the bridge by the homeserver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessageEvent {
    pub event_id: Option<String>,
    pub sender: UserId,
    pub room_id: RoomId,
    pub msgtype: MessageType,
    pub body: String,
}

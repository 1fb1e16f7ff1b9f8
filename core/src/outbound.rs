//! Operator reply → phone.

use std::sync::Arc;

use cona_matrix::{ChatEventReceiver, ChatNetwork};
use cona_types::{
    ChatMessageEvent, GhostNaming, IdentityToken, MessageType, ReplyRequest, UserId,
};

use crate::reply::ReplySink;
use crate::title_store::TitleStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundOutcome {
    /// Sent by someone other than the operator (ghosts echo here too).
    NotFromOperator,
    NotText,
    MembersUnavailable,
    /// The room has no bridge ghost in it.
    NoGhost,
    /// More than one ghost is joined; the recipient is ambiguous.
    AmbiguousGhost { count: usize },
    Forwarded { title: String, fallback: bool },
    ReplyFailed { title: String },
}

pub struct OutboundRouter {
    operator: UserId,
    naming: GhostNaming,
    store: Arc<TitleStore>,
    network: Arc<dyn ChatNetwork>,
    replies: Arc<dyn ReplySink>,
}

impl OutboundRouter {
    pub fn new(
        operator: UserId,
        naming: GhostNaming,
        store: Arc<TitleStore>,
        network: Arc<dyn ChatNetwork>,
        replies: Arc<dyn ReplySink>,
    ) -> Self {
        Self {
            operator,
            naming,
            store,
            network,
            replies,
        }
    }

    /// Drain `events` one at a time until every sender is dropped.
    pub async fn run(&self, mut events: ChatEventReceiver) {
        tracing::info!("Outbound router started");
        while let Some(event) = events.recv().await {
            self.handle(&event).await;
        }
        tracing::info!("Outbound router stopped");
    }

    pub async fn handle(&self, event: &ChatMessageEvent) -> OutboundOutcome {
        if event.sender != self.operator {
            tracing::debug!(
                sender = %event.sender,
                room_id = %event.room_id,
                "Ignoring non-operator message"
            );
            return OutboundOutcome::NotFromOperator;
        }
        if event.msgtype != MessageType::Text {
            tracing::debug!(
                msgtype = event.msgtype.as_str(),
                room_id = %event.room_id,
                "Ignoring non-text message"
            );
            return OutboundOutcome::NotText;
        }

        let members = match self.network.joined_members(&event.room_id).await {
            Ok(members) => members,
            Err(e) => {
                tracing::error!(
                    room_id = %event.room_id,
                    error = %e,
                    "Failed to list room members"
                );
                return OutboundOutcome::MembersUnavailable;
            }
        };

        let token = match self.sole_ghost(&members) {
            Ok(token) => token,
            Err(outcome) => {
                tracing::warn!(
                    room_id = %event.room_id,
                    ?outcome,
                    "Cannot tell who the reply is for, dropping it"
                );
                return outcome;
            }
        };

        let (title, fallback) = match self.store.get(&token) {
            Some(title) => (title, false),
            None => {
                let label = token.humanize();
                tracing::warn!(
                    %token,
                    label = %label,
                    "Title map has no entry, replying with fallback label"
                );
                (label, true)
            }
        };

        let reply = ReplyRequest {
            title,
            text: event.body.clone(),
        };
        match self.replies.send_reply(&reply).await {
            Ok(()) => {
                tracing::info!(%token, room_id = %event.room_id, "Forwarded reply");
                OutboundOutcome::Forwarded {
                    title: reply.title,
                    fallback,
                }
            }
            Err(e) => {
                tracing::error!(
                    %token,
                    room_id = %event.room_id,
                    error = %e,
                    "Failed to forward reply"
                );
                OutboundOutcome::ReplyFailed { title: reply.title }
            }
        }
    }

    fn sole_ghost(&self, members: &[UserId]) -> Result<IdentityToken, OutboundOutcome> {
        let mut ghosts = members.iter().filter_map(|user| self.naming.parse_ghost(user));
        match (ghosts.next(), ghosts.next()) {
            (Some(token), None) => Ok(token),
            (None, _) => Err(OutboundOutcome::NoGhost),
            (Some(_), Some(_)) => Err(OutboundOutcome::AmbiguousGhost {
                count: 2 + ghosts.count(),
            }),
        }
    }
}

//! Phone notification → ghost message.

use std::sync::Arc;

use cona_config::PackageFilter;
use cona_matrix::ChatNetwork;
use cona_types::{IdentityToken, NotificationEvent, RoomId, UserId};
use tokio::task;

use crate::resolver::RoomResolver;
use crate::title_store::TitleStore;

/// What happened to one notification. Every variant except `Delivered` has
/// already been logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Not from the bridged app.
    Filtered,
    Delivered {
        token: IdentityToken,
        room: RoomId,
        event_id: String,
    },
    /// No room could be found or created.
    RoomUnavailable { token: IdentityToken },
    SendFailed { token: IdentityToken, room: RoomId },
}

pub struct InboundRouter {
    filter: PackageFilter,
    operator: UserId,
    store: Arc<TitleStore>,
    resolver: Arc<RoomResolver>,
    network: Arc<dyn ChatNetwork>,
}

impl InboundRouter {
    pub fn new(
        filter: PackageFilter,
        operator: UserId,
        store: Arc<TitleStore>,
        resolver: Arc<RoomResolver>,
        network: Arc<dyn ChatNetwork>,
    ) -> Self {
        Self {
            filter,
            operator,
            store,
            resolver,
            network,
        }
    }

    /// Relay one notification into its sender's room.
    ///
    /// Each step runs at most once. A failure is logged and ends the
    /// handling of this event; nothing is surfaced to the webhook caller.
    pub async fn handle(&self, event: &NotificationEvent) -> InboundOutcome {
        if !self.filter.matches(&event.package_name) {
            tracing::debug!(package = %event.package_name, "Ignoring notification from other app");
            return InboundOutcome::Filtered;
        }

        let token = IdentityToken::derive(&event.title);
        tracing::debug!(%token, title = %event.title, "Notification received");

        // Written on every notification so a lost or stale map heals itself.
        self.remember_title(&token, &event.title).await;

        let room = match self
            .resolver
            .resolve_or_create(&token, &event.title, &self.operator)
            .await
        {
            Ok(room) => room,
            Err(e) => {
                tracing::error!(%token, error = %e, "No room for notification, dropping it");
                return InboundOutcome::RoomUnavailable { token };
            }
        };

        let ghost = self.resolver.naming().ghost_user_id(&token);
        match self.network.send_text(&ghost, &room, &event.text).await {
            Ok(event_id) => {
                tracing::info!(%token, room_id = %room, %event_id, "Relayed notification");
                InboundOutcome::Delivered {
                    token,
                    room,
                    event_id,
                }
            }
            Err(e) => {
                tracing::error!(
                    %token,
                    room_id = %room,
                    error = %e,
                    "Failed to relay notification"
                );
                InboundOutcome::SendFailed { token, room }
            }
        }
    }

    /// The store fsyncs under its write lock, so the write runs on the
    /// blocking pool instead of a runtime worker.
    async fn remember_title(&self, token: &IdentityToken, title: &str) {
        let store = Arc::clone(&self.store);
        let entry = (token.clone(), title.to_string());
        match task::spawn_blocking(move || store.put(entry.0, entry.1)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(%token, error = %e, "Failed to persist title map"),
            Err(e) => tracing::error!(%token, error = %e, "Title map write task failed"),
        }
    }
}

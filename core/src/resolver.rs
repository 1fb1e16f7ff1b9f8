//! Token → conversation room.
//!
//! The homeserver owns the alias directory, so the resolver keeps no room
//! cache: every call resolves the deterministic alias and only creates a room
//! when the alias is missing. Creation is serialized per token so concurrent
//! first notifications from one sender produce a single room.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use cona_matrix::{ChatNetwork, CreateRoomRequest, MatrixError, Visibility};
use cona_types::{GhostNaming, IdentityToken, RoomAlias, RoomId, UserId};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("resolving {alias} failed: {source}")]
    Lookup {
        alias: RoomAlias,
        #[source]
        source: MatrixError,
    },
    #[error("creating room {alias} failed: {source}")]
    Create {
        alias: RoomAlias,
        #[source]
        source: MatrixError,
    },
}

pub struct RoomResolver {
    network: Arc<dyn ChatNetwork>,
    naming: GhostNaming,
    room_name_prefix: String,
    /// One lock per token that has ever needed provisioning. Tokens are few
    /// (one per remote sender), so entries live for the whole process.
    provisioning: Mutex<HashMap<IdentityToken, Arc<AsyncMutex<()>>>>,
    /// Last display name successfully pushed for each ghost.
    display_names: Mutex<HashMap<IdentityToken, String>>,
}

impl RoomResolver {
    pub fn new(
        network: Arc<dyn ChatNetwork>,
        naming: GhostNaming,
        room_name_prefix: impl Into<String>,
    ) -> Self {
        Self {
            network,
            naming,
            room_name_prefix: room_name_prefix.into(),
            provisioning: Mutex::new(HashMap::new()),
            display_names: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn naming(&self) -> &GhostNaming {
        &self.naming
    }

    #[must_use]
    pub fn room_name(&self, display_name: &str) -> String {
        format!("{} - {display_name}", self.room_name_prefix)
    }

    /// Find the room for `token`, creating it as the ghost when the alias
    /// does not resolve.
    ///
    /// Ghost provisioning failures are logged and do not stop resolution.
    /// A lookup failure other than "not found" is returned as-is: creating a
    /// room on a transient error would fork the conversation.
    pub async fn resolve_or_create(
        &self,
        token: &IdentityToken,
        display_name: &str,
        invite_target: &UserId,
    ) -> Result<RoomId, ResolveError> {
        let ghost = self.naming.ghost_user_id(token);
        self.ensure_ghost(token, &ghost, display_name).await;

        let alias = self.naming.room_alias(token);
        if let Some(room) = self.lookup(&alias).await? {
            tracing::debug!(%token, room_id = %room, "Alias resolved");
            return Ok(room);
        }

        let lock = self.provision_lock(token);
        let _guard = lock.lock().await;

        // Another task may have created the room while we waited.
        if let Some(room) = self.lookup(&alias).await? {
            tracing::debug!(%token, room_id = %room, "Alias resolved after waiting");
            return Ok(room);
        }

        let request = CreateRoomRequest {
            visibility: Visibility::Private,
            room_alias_name: self.naming.localpart(token),
            invite: vec![invite_target.clone()],
            name: self.room_name(display_name),
            is_direct: true,
        };
        let room = self
            .network
            .create_room(&ghost, &request)
            .await
            .map_err(|source| ResolveError::Create {
                alias: alias.clone(),
                source,
            })?;
        tracing::info!(%token, room_id = %room, %alias, "Created conversation room");
        Ok(room)
    }

    async fn lookup(&self, alias: &RoomAlias) -> Result<Option<RoomId>, ResolveError> {
        self.network
            .resolve_alias(alias)
            .await
            .map_err(|source| ResolveError::Lookup {
                alias: alias.clone(),
                source,
            })
    }

    async fn ensure_ghost(&self, token: &IdentityToken, ghost: &UserId, display_name: &str) {
        if let Err(e) = self.network.ensure_registered(ghost).await {
            tracing::warn!(%token, user_id = %ghost, error = %e, "Ghost registration failed");
        }

        let unchanged = self
            .display_names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token)
            .is_some_and(|current| current == display_name);
        if unchanged {
            return;
        }

        match self.network.set_display_name(ghost, display_name).await {
            Ok(()) => {
                tracing::debug!(%token, display_name, "Ghost display name set");
                self.display_names
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(token.clone(), display_name.to_string());
            }
            Err(e) => {
                tracing::warn!(
                    %token,
                    user_id = %ghost,
                    error = %e,
                    "Setting ghost display name failed"
                );
            }
        }
    }

    fn provision_lock(&self, token: &IdentityToken) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .provisioning
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(token.clone()).or_default())
    }
}

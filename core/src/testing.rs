//! In-memory collaborators for router and resolver tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use cona_matrix::{ChatNetwork, CreateRoomRequest, MatrixError, NetFut};
use cona_types::{ReplyRequest, RoomAlias, RoomId, UserId};
use tokio::task;

use crate::reply::{ReplyError, ReplyFut, ReplySink};

fn injected(errcode: &str) -> MatrixError {
    MatrixError::Api {
        status: 500,
        errcode: Some(errcode.to_string()),
        message: "injected failure".to_string(),
    }
}

#[derive(Default)]
struct State {
    registered: HashSet<UserId>,
    display_names: HashMap<UserId, String>,
    display_name_calls: usize,
    aliases: HashMap<RoomAlias, RoomId>,
    members: HashMap<RoomId, Vec<UserId>>,
    created: Vec<(UserId, CreateRoomRequest)>,
    sent: Vec<(UserId, RoomId, String)>,
    fail_register: bool,
    fail_profile: bool,
    fail_resolve: bool,
    fail_send: bool,
    fail_members: bool,
}

/// A homeserver that keeps everything in maps. Invited users count as
/// joined so outbound tests can inspect membership right after creation.
#[derive(Default)]
pub struct FakeNetwork {
    state: Mutex<State>,
}

impl FakeNetwork {
    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn fail_register(&self, fail: bool) {
        self.with(|s| s.fail_register = fail);
    }

    pub fn fail_profile(&self, fail: bool) {
        self.with(|s| s.fail_profile = fail);
    }

    pub fn fail_resolve(&self, fail: bool) {
        self.with(|s| s.fail_resolve = fail);
    }

    pub fn fail_send(&self, fail: bool) {
        self.with(|s| s.fail_send = fail);
    }

    pub fn fail_members(&self, fail: bool) {
        self.with(|s| s.fail_members = fail);
    }

    /// Add a room with a fixed member list, bypassing `create_room`.
    pub fn insert_room(&self, room: &RoomId, members: Vec<UserId>) {
        self.with(|s| s.members.insert(room.clone(), members));
    }

    pub fn created(&self) -> Vec<(UserId, CreateRoomRequest)> {
        self.with(|s| s.created.clone())
    }

    pub fn sent(&self) -> Vec<(UserId, RoomId, String)> {
        self.with(|s| s.sent.clone())
    }

    pub fn is_registered(&self, user: &UserId) -> bool {
        self.with(|s| s.registered.contains(user))
    }

    pub fn display_name(&self, user: &UserId) -> Option<String> {
        self.with(|s| s.display_names.get(user).cloned())
    }

    pub fn display_name_calls(&self) -> usize {
        self.with(|s| s.display_name_calls)
    }
}

impl ChatNetwork for FakeNetwork {
    fn ensure_registered<'a>(&'a self, user: &'a UserId) -> NetFut<'a, ()> {
        Box::pin(async move {
            self.with(|s| {
                if s.fail_register {
                    return Err(injected("M_UNKNOWN"));
                }
                s.registered.insert(user.clone());
                Ok(())
            })
        })
    }

    fn set_display_name<'a>(&'a self, user: &'a UserId, name: &'a str) -> NetFut<'a, ()> {
        Box::pin(async move {
            self.with(|s| {
                s.display_name_calls += 1;
                if s.fail_profile {
                    return Err(injected("M_UNKNOWN"));
                }
                s.display_names.insert(user.clone(), name.to_string());
                Ok(())
            })
        })
    }

    fn resolve_alias<'a>(&'a self, alias: &'a RoomAlias) -> NetFut<'a, Option<RoomId>> {
        Box::pin(async move {
            self.with(|s| {
                if s.fail_resolve {
                    return Err(injected("M_UNKNOWN"));
                }
                Ok(s.aliases.get(alias).cloned())
            })
        })
    }

    fn create_room<'a>(
        &'a self,
        creator: &'a UserId,
        request: &'a CreateRoomRequest,
    ) -> NetFut<'a, RoomId> {
        Box::pin(async move {
            // Give concurrent resolvers a chance to interleave.
            task::yield_now().await;
            self.with(|s| {
                let alias = RoomAlias::new(&request.room_alias_name, creator.server_name());
                if s.aliases.contains_key(&alias) {
                    return Err(MatrixError::Api {
                        status: 400,
                        errcode: Some("M_ROOM_IN_USE".to_string()),
                        message: "Room alias already taken".to_string(),
                    });
                }
                let room = RoomId::parse(format!("!room{}:example.org", s.created.len() + 1))
                    .map_err(|e| MatrixError::Decode(e.to_string()))?;
                let mut members = vec![creator.clone()];
                members.extend(request.invite.iter().cloned());
                s.members.insert(room.clone(), members);
                s.aliases.insert(alias, room.clone());
                s.created.push((creator.clone(), request.clone()));
                Ok(room)
            })
        })
    }

    fn send_text<'a>(
        &'a self,
        sender: &'a UserId,
        room: &'a RoomId,
        body: &'a str,
    ) -> NetFut<'a, String> {
        Box::pin(async move {
            self.with(|s| {
                if s.fail_send {
                    return Err(injected("M_UNKNOWN"));
                }
                s.sent.push((sender.clone(), room.clone(), body.to_string()));
                Ok(format!("$event{}", s.sent.len()))
            })
        })
    }

    fn joined_members<'a>(&'a self, room: &'a RoomId) -> NetFut<'a, Vec<UserId>> {
        Box::pin(async move {
            self.with(|s| {
                if s.fail_members {
                    return Err(injected("M_FORBIDDEN"));
                }
                s.members.get(room).cloned().ok_or_else(|| MatrixError::Api {
                    status: 404,
                    errcode: Some("M_NOT_FOUND".to_string()),
                    message: "Unknown room".to_string(),
                })
            })
        })
    }
}

/// Reply sink that remembers everything it was asked to deliver.
#[derive(Default)]
pub struct RecordingReplies {
    replies: Mutex<Vec<ReplyRequest>>,
    fail: Mutex<bool>,
}

impl RecordingReplies {
    pub fn replies(&self) -> Vec<ReplyRequest> {
        self.replies.lock().unwrap().clone()
    }

    pub fn fail(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }
}

impl ReplySink for RecordingReplies {
    fn send_reply<'a>(&'a self, reply: &'a ReplyRequest) -> ReplyFut<'a> {
        Box::pin(async move {
            if *self.fail.lock().unwrap() {
                return Err(ReplyError::Status {
                    status: 404,
                    body: "Failed to reply (notification not found)".to_string(),
                });
            }
            self.replies.lock().unwrap().push(reply.clone());
            Ok(())
        })
    }
}

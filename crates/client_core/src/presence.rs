//! Who is online in the active room, and the room's member roster.
//!
//! Both are scoped to one room; anything tagged with another room is
//! dropped, and a scope change wipes the lot.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use shared::{
    domain::{Member, Room, RoomId, UserId},
    protocol::{EventKind, OnlineUser, ServerEvent},
};
use tracing::{debug, warn};

use crate::{
    backend::ChatBackend,
    dispatcher::{EventDispatcher, Subscription},
    error::{describe, SyncError, SyncResult},
    lock,
    room_session::RoomScope,
};

#[derive(Default)]
struct PresenceInner {
    room: Option<RoomId>,
    online: HashSet<UserId>,
    roster: Option<Room>,
    generation: u64,
}

pub struct PresenceTracker {
    backend: Arc<dyn ChatBackend>,
    local_user: UserId,
    inner: Mutex<PresenceInner>,
}

impl PresenceTracker {
    pub fn new(backend: Arc<dyn ChatBackend>, local_user: UserId) -> Arc<Self> {
        Arc::new(Self {
            backend,
            local_user,
            inner: Mutex::new(PresenceInner::default()),
        })
    }

    pub fn attach(self: &Arc<Self>, dispatcher: &Arc<EventDispatcher>) -> Vec<Subscription> {
        [
            EventKind::RoomJoined,
            EventKind::UserOnline,
            EventKind::UserOffline,
            EventKind::MemberJoined,
            EventKind::MemberRemoved,
            EventKind::Disconnected,
        ]
        .into_iter()
        .map(|kind| {
            let tracker = Arc::downgrade(self);
            dispatcher.on_fn(kind, move |event| {
                if let Some(tracker) = tracker.upgrade() {
                    tracker.handle_event(event);
                }
            })
        })
        .collect()
    }

    fn handle_event(self: &Arc<Self>, event: &ServerEvent) {
        match event {
            ServerEvent::RoomJoined(payload) => self.seed(payload.room_id, &payload.online_users),
            ServerEvent::UserOnline(payload) => {
                self.mark_online(payload.room_id, payload.user_id);
            }
            ServerEvent::UserOffline(payload) => {
                self.mark_offline(payload.room_id, payload.user_id);
            }
            ServerEvent::MemberJoined(payload) => self.spawn_roster_refresh(payload.room_id),
            ServerEvent::MemberRemoved(payload) => {
                self.mark_offline(payload.room_id, payload.user_id);
                self.spawn_roster_refresh(payload.room_id);
            }
            ServerEvent::Disconnected { .. } => self.scope(None),
            _ => {}
        }
    }

    /// Clears everything and scopes tracking to `room`.
    pub fn scope(&self, room: Option<RoomId>) {
        let mut inner = lock(&self.inner);
        inner.generation += 1;
        inner.room = room;
        inner.online.clear();
        inner.roster = None;
    }

    pub fn room(&self) -> Option<RoomId> {
        lock(&self.inner).room
    }

    /// Replaces the online set with the server's snapshot. The local user is
    /// always online in its own room.
    pub fn seed(&self, room: RoomId, snapshot: &[OnlineUser]) {
        let mut inner = lock(&self.inner);
        if inner.room != Some(room) {
            debug!(room_id = room.0, "presence: snapshot for inactive room ignored");
            return;
        }
        inner.online = snapshot.iter().map(|user| user.user_id).collect();
        inner.online.insert(self.local_user);
    }

    pub fn mark_online(&self, room: RoomId, user: UserId) -> bool {
        let mut inner = lock(&self.inner);
        inner.room == Some(room) && inner.online.insert(user)
    }

    pub fn mark_offline(&self, room: RoomId, user: UserId) -> bool {
        let mut inner = lock(&self.inner);
        inner.room == Some(room) && inner.online.remove(&user)
    }

    pub fn is_online(&self, user: UserId) -> bool {
        lock(&self.inner).online.contains(&user)
    }

    /// Online users in ascending id order.
    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = lock(&self.inner).online.iter().copied().collect();
        users.sort();
        users
    }

    pub fn roster(&self) -> Option<Room> {
        lock(&self.inner).roster.clone()
    }

    pub fn members(&self) -> Vec<Member> {
        lock(&self.inner)
            .roster
            .as_ref()
            .map(|room| room.members.clone())
            .unwrap_or_default()
    }

    /// Installs a freshly fetched roster, ordered owner, admin, member.
    pub fn set_roster(&self, mut room: Room) -> bool {
        let mut inner = lock(&self.inner);
        if inner.room != Some(room.id) {
            return false;
        }
        room.members.sort_by_key(|member| member.role.rank());
        inner.roster = Some(room);
        true
    }

    /// Re-fetches the whole roster for the scoped room. A result that
    /// arrives after the scope changed is dropped.
    pub async fn refresh_roster(&self) -> SyncResult<Option<Room>> {
        let (room_id, generation) = {
            let inner = lock(&self.inner);
            match inner.room {
                Some(room_id) => (room_id, inner.generation),
                None => return Ok(None),
            }
        };
        let room = self
            .backend
            .fetch_room(room_id)
            .await
            .map_err(|err| SyncError::MetadataFetchFailed {
                room_id,
                reason: describe(&err),
            })?;
        if lock(&self.inner).generation != generation {
            return Ok(None);
        }
        self.set_roster(room);
        Ok(self.roster())
    }

    fn spawn_roster_refresh(self: &Arc<Self>, room: RoomId) {
        if self.room() != Some(room) {
            return;
        }
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = tracker.refresh_roster().await {
                warn!(room_id = room.0, "presence: roster refresh failed: {err}");
            }
        });
    }
}

impl RoomScope for PresenceTracker {
    fn enter_room(&self, room: Option<RoomId>) {
        if self.room() != room {
            self.scope(room);
        }
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;

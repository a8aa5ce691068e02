//! One chat session: a connection plus the room-scoped state built on it.
//!
//! A `ChatSession` is constructed by whatever scope needs it and torn down
//! with [`ChatSession::dispose`]; nothing here is process-global.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use serde::Deserialize;
use shared::{
    domain::{Invitation, InvitationId, Member, Message, MessageId, Room, RoomId, UserId},
    protocol::{ClientRequest, EventKind, ServerEvent},
};
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::{
    backend::ChatBackend,
    config::ClientSettings,
    connection::{ConnectionManager, ConnectionState},
    dispatcher::{EventDispatcher, EventHandler, Subscription},
    error::{describe, SyncError, SyncResult},
    invitations::{InvitationPoller, PollerHandle},
    lock,
    message_store::{FixedRowHeight, MessageLayout, MessageStore, OlderPageOutcome},
    presence::PresenceTracker,
    room_session::{JoinedRoom, RoomScope, RoomSessionController},
    transport::Transport,
    typing::{RemoteTyper, TypingCoordinator},
};

const MIN_MEMBER_QUERY_CHARS: usize = 2;
const SOCKET_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Acknowledgement of a `send_message` written over the socket.
#[derive(Deserialize)]
struct SocketSendAck {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<Message>,
}

pub struct ChatSession {
    settings: ClientSettings,
    local_user: UserId,
    backend: Arc<dyn ChatBackend>,
    dispatcher: Arc<EventDispatcher>,
    connection: Arc<ConnectionManager>,
    rooms: Arc<RoomSessionController>,
    messages: Arc<MessageStore>,
    presence: Arc<PresenceTracker>,
    typing: Arc<TypingCoordinator>,
    invitations: Arc<InvitationPoller>,
    poller: Mutex<Option<PollerHandle>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl ChatSession {
    pub fn new(
        settings: ClientSettings,
        transport: Arc<dyn Transport>,
        backend: Arc<dyn ChatBackend>,
        local_user: UserId,
    ) -> Arc<Self> {
        Self::new_with_layout(
            settings,
            transport,
            backend,
            local_user,
            Arc::new(FixedRowHeight::default()),
        )
    }

    /// Must be called from within a tokio runtime; the invitation poller is
    /// started immediately.
    pub fn new_with_layout(
        settings: ClientSettings,
        transport: Arc<dyn Transport>,
        backend: Arc<dyn ChatBackend>,
        local_user: UserId,
        layout: Arc<dyn MessageLayout>,
    ) -> Arc<Self> {
        let dispatcher = EventDispatcher::new();
        let connection =
            ConnectionManager::new(settings.clone(), transport, Arc::clone(&dispatcher));
        // The room controller registers first so later handlers observe the
        // settled join state.
        let rooms = RoomSessionController::new(settings.clone(), Arc::clone(&connection));
        let messages = MessageStore::new(Arc::clone(&backend), layout);
        let presence = PresenceTracker::new(Arc::clone(&backend), local_user);
        let typing = TypingCoordinator::new(
            Arc::clone(&connection),
            local_user,
            settings.typing_debounce,
            settings.remote_typing_ttl,
        );
        let invitations =
            InvitationPoller::new(Arc::clone(&backend), settings.invitation_refresh_interval);

        rooms.add_scope(Arc::clone(&typing) as Arc<dyn RoomScope>);
        rooms.add_scope(Arc::clone(&presence) as Arc<dyn RoomScope>);
        rooms.add_scope(Arc::clone(&messages) as Arc<dyn RoomScope>);

        let mut subscriptions = messages.attach(&dispatcher);
        subscriptions.extend(presence.attach(&dispatcher));
        subscriptions.extend(typing.attach(&dispatcher));
        let poller = invitations.start(&dispatcher);

        Arc::new(Self {
            settings,
            local_user,
            backend,
            dispatcher,
            connection,
            rooms,
            messages,
            presence,
            typing,
            invitations,
            poller: Mutex::new(Some(poller)),
            subscriptions: Mutex::new(subscriptions),
        })
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn local_user(&self) -> UserId {
        self.local_user
    }

    pub async fn connect(&self, credential: &str) -> SyncResult<()> {
        self.connection.connect(credential).await
    }

    pub fn disconnect(&self, preserve_room_hint: bool) {
        self.connection.disconnect(preserve_room_hint);
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn status(&self) -> watch::Receiver<ConnectionState> {
        self.connection.status()
    }

    /// Joins `room_id`, leaving any other room first. The room controller
    /// moves history, presence and typing along with its own state; the
    /// member roster is fetched once the join settles.
    pub async fn join_room(&self, room_id: RoomId) -> SyncResult<JoinedRoom> {
        if !self.connection.is_connected() {
            return Err(SyncError::NotConnected);
        }
        let joined = self.rooms.join_room(room_id).await?;

        // Joins settled by the acknowledgement fallback never saw a snapshot.
        if !self.presence.is_online(self.local_user) {
            self.presence.seed(room_id, &joined.online_users);
        }
        if let Err(err) = self.presence.refresh_roster().await {
            warn!(room_id = room_id.0, "session: {err}");
        }
        info!(room_id = room_id.0, "session: room ready");
        Ok(joined)
    }

    pub fn leave_room(&self, room_id: RoomId) {
        self.rooms.leave_room(room_id);
    }

    /// Joins the room kept as rejoin hint across a connection loss.
    /// `None` when there is nothing to rejoin.
    pub async fn rejoin(&self) -> Option<SyncResult<JoinedRoom>> {
        let room_id = self.rooms.rejoin_hint()?;
        info!(room_id = room_id.0, "session: rejoining");
        Some(self.join_room(room_id).await)
    }

    pub fn current_room(&self) -> Option<RoomId> {
        self.rooms.current_room()
    }

    pub fn rejoin_hint(&self) -> Option<RoomId> {
        self.rooms.rejoin_hint()
    }

    fn clear_room_scope(&self) {
        self.typing.set_room(None);
        self.presence.scope(None);
        self.messages.reset(None);
    }

    fn joined_room(&self) -> SyncResult<RoomId> {
        self.rooms.current_room().ok_or(SyncError::NoActiveRoom)
    }

    pub async fn load_initial_page(&self) -> SyncResult<usize> {
        let room_id = self.joined_room()?;
        self.messages
            .load_initial_page(room_id, self.settings.page_size)
            .await
    }

    pub async fn load_older_page(&self) -> SyncResult<OlderPageOutcome> {
        self.messages.load_older_page().await
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.messages()
    }

    pub fn has_older_messages(&self) -> bool {
        self.messages.has_older()
    }

    pub async fn send_message(
        &self,
        content: &str,
        image_url: Option<String>,
    ) -> SyncResult<Message> {
        if !self.connection.is_connected() {
            return Err(SyncError::NotConnected);
        }
        let room_id = self.joined_room()?;
        self.typing.stop_local_typing();
        self.messages.send_message(room_id, content, image_url).await
    }

    /// Sends over the duplex channel instead of REST and waits for the
    /// server's acknowledgement, which carries the stored message.
    pub async fn send_message_over_socket(
        &self,
        content: &str,
        image_url: Option<String>,
    ) -> SyncResult<Message> {
        if !self.connection.is_connected() {
            return Err(SyncError::NotConnected);
        }
        let room_id = self.joined_room()?;
        let content = content.trim();
        if content.is_empty() && image_url.is_none() {
            return Err(SyncError::InvalidMessage);
        }
        self.typing.stop_local_typing();
        let ack = self.connection.request(ClientRequest::SendMessage {
            room_id,
            content: content.to_string(),
            image_url,
        })?;
        let body = match tokio::time::timeout(SOCKET_SEND_TIMEOUT, ack).await {
            Ok(Ok(body)) => body,
            Ok(Err(_)) => return Err(SyncError::NotConnected),
            Err(_) => return Err(SyncError::SendFailed("message send timed out".into())),
        };
        let ack: SocketSendAck = serde_json::from_value(body)
            .map_err(|err| SyncError::SendFailed(format!("unreadable acknowledgement: {err}")))?;
        if let Some(error) = ack.error {
            return Err(SyncError::SendFailed(error));
        }
        let message = ack
            .message
            .ok_or_else(|| SyncError::SendFailed("acknowledgement carried no message".into()))?;
        self.messages.apply_create(message.clone());
        Ok(message)
    }

    pub async fn edit_message(
        &self,
        message_id: MessageId,
        content: &str,
        image_url: Option<String>,
    ) -> SyncResult<Message> {
        self.joined_room()?;
        self.messages.edit_message(message_id, content, image_url).await
    }

    pub async fn delete_message(&self, message_id: MessageId) -> SyncResult<()> {
        let room_id = self.joined_room()?;
        self.messages.delete_message(room_id, message_id).await
    }

    pub fn notify_local_typing(&self) {
        self.typing.notify_local_typing();
    }

    pub fn remote_typer(&self) -> Option<RemoteTyper> {
        self.typing.remote_typer()
    }

    pub fn watch_remote_typer(&self) -> watch::Receiver<Option<RemoteTyper>> {
        self.typing.subscribe()
    }

    pub fn online_users(&self) -> Vec<UserId> {
        self.presence.online_users()
    }

    pub fn roster(&self) -> Option<Room> {
        self.presence.roster()
    }

    /// Roster members, owners first.
    pub fn members(&self) -> Vec<Member> {
        self.presence.members()
    }

    pub fn on(&self, kind: EventKind, handler: EventHandler) -> Subscription {
        self.dispatcher.on(kind, handler)
    }

    pub fn on_fn<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.dispatcher.on_fn(kind, handler)
    }

    pub fn off(&self, kind: EventKind, handler: &EventHandler) -> bool {
        self.dispatcher.off(kind, handler)
    }

    pub fn events(&self) -> broadcast::Receiver<ServerEvent> {
        self.dispatcher.subscribe()
    }

    pub fn invitations(&self) -> Vec<Invitation> {
        self.invitations.invitations()
    }

    pub fn watch_invitations(&self) -> watch::Receiver<Vec<Invitation>> {
        self.invitations.subscribe()
    }

    pub async fn refresh_invitations(&self) -> SyncResult<Vec<Invitation>> {
        self.invitations.refresh().await
    }

    pub async fn accept_invitation(&self, invitation_id: InvitationId) -> SyncResult<Option<RoomId>> {
        self.invitations.accept(invitation_id).await
    }

    pub async fn reject_invitation(&self, invitation_id: InvitationId) -> SyncResult<()> {
        self.invitations.reject(invitation_id).await
    }

    /// Candidate members for the add-member flow. Queries shorter than two
    /// characters return nothing without a round trip.
    pub async fn search_members(&self, query: &str) -> SyncResult<Vec<Member>> {
        let query = query.trim();
        if query.chars().count() < MIN_MEMBER_QUERY_CHARS {
            return Ok(Vec::new());
        }
        self.backend
            .search_members(query, self.settings.member_search_limit)
            .await
            .map_err(|err| SyncError::SearchFailed(describe(&err)))
    }

    /// Stops background work, drops every internal subscription and
    /// disconnects without keeping a rejoin hint.
    pub fn dispose(&self) {
        lock(&self.poller).take();
        lock(&self.subscriptions).clear();
        self.clear_room_scope();
        self.connection.disconnect(false);
        self.rooms.detach();
        info!("session: disposed");
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;

//! In-process doubles for the transport and REST collaborators.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use shared::{
    domain::{Invitation, InvitationId, Member, MemberRole, Message, MessageId, Room, RoomId, RoomVisibility, UserId},
    protocol::{
        AckFrame, ClientRequest, InboundFrame, MessagePage, OnlineUser, OutboundFrame, Pagination,
        RoomJoinedPayload, SendMessageBody, ServerEvent, UpdateMessageBody,
    },
};
use tokio::sync::{mpsc, Notify};

use crate::{
    backend::ChatBackend,
    config::ClientSettings,
    connection::ConnectionManager,
    dispatcher::EventDispatcher,
    transport::{ConnectRequest, Transport, TransportEvent, TransportLink},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkBehavior {
    /// Open succeeds and the server immediately confirms with `connected`.
    Accept,
    /// Open fails.
    Refuse,
    /// Open succeeds but the server never says anything.
    Silent,
}

/// Server side of one mock link.
pub(crate) struct Peer {
    pub request: ConnectRequest,
    pub sent: mpsc::UnboundedReceiver<OutboundFrame>,
    pub deliver: mpsc::UnboundedSender<TransportEvent>,
}

impl Peer {
    pub fn emit(&self, event: ServerEvent) {
        let _ = self.deliver.send(TransportEvent::Frame(InboundFrame::Event(event)));
    }

    pub fn ack(&self, id: u64, data: serde_json::Value) {
        let _ = self
            .deliver
            .send(TransportEvent::Frame(InboundFrame::Ack(AckFrame { ack: id, data })));
    }

    pub fn close(&self, reason: &str) {
        let _ = self.deliver.send(TransportEvent::Closed {
            reason: reason.into(),
        });
    }

    /// Everything written so far, handshake excluded.
    pub fn drain(&mut self) -> Vec<OutboundFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.sent.try_recv() {
            if !matches!(frame.request, ClientRequest::Authenticate { .. }) {
                frames.push(frame);
            }
        }
        frames
    }

    pub fn drain_requests(&mut self) -> Vec<ClientRequest> {
        self.drain().into_iter().map(|frame| frame.request).collect()
    }
}

pub(crate) struct MockTransport {
    behavior: Mutex<LinkBehavior>,
    opens: AtomicUsize,
    peers: Mutex<VecDeque<Peer>>,
}

impl MockTransport {
    pub fn new(behavior: LinkBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            opens: AtomicUsize::new(0),
            peers: Mutex::new(VecDeque::new()),
        })
    }

    pub fn set_behavior(&self, behavior: LinkBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Oldest link not yet taken by the test.
    pub fn take_peer(&self) -> Peer {
        self.peers.lock().unwrap().pop_front().expect("no link was opened")
    }

    pub fn latest_peer(&self) -> Peer {
        let mut peers = self.peers.lock().unwrap();
        let peer = peers.pop_back().expect("no link was opened");
        peers.clear();
        peer
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, request: &ConnectRequest) -> Result<TransportLink> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let behavior = *self.behavior.lock().unwrap();
        if behavior == LinkBehavior::Refuse {
            return Err(anyhow!("connection refused"));
        }

        let (outbound, sent) = mpsc::unbounded_channel();
        let (deliver, inbound) = mpsc::unbounded_channel();
        let _ = outbound.send(request.handshake());
        if behavior == LinkBehavior::Accept {
            let _ = deliver.send(TransportEvent::Frame(InboundFrame::Event(
                ServerEvent::Connected {
                    session_id: Some(format!("s{}", self.opens())),
                    user_id: None,
                },
            )));
        }
        self.peers.lock().unwrap().push_back(Peer {
            request: request.clone(),
            sent,
            deliver,
        });
        Ok(TransportLink { outbound, inbound })
    }
}

pub(crate) fn test_settings() -> ClientSettings {
    ClientSettings {
        max_reconnect_attempts: 3,
        reconnect_delay: Duration::from_millis(100),
        ..ClientSettings::default()
    }
}

pub(crate) struct Harness {
    pub transport: Arc<MockTransport>,
    pub dispatcher: Arc<EventDispatcher>,
    pub connection: Arc<ConnectionManager>,
}

impl Harness {
    pub fn new(settings: ClientSettings, behavior: LinkBehavior) -> Self {
        let transport = MockTransport::new(behavior);
        let dispatcher = EventDispatcher::new();
        let connection = ConnectionManager::new(
            settings,
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::clone(&dispatcher),
        );
        Self {
            transport,
            dispatcher,
            connection,
        }
    }

    /// Connected harness plus the server side of its link.
    pub async fn connected(settings: ClientSettings) -> (Self, Peer) {
        let harness = Self::new(settings, LinkBehavior::Accept);
        harness.connection.connect("token").await.expect("connect");
        let peer = harness.transport.take_peer();
        (harness, peer)
    }
}

/// Lets spawned tasks run to their next await point.
pub(crate) async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

pub(crate) fn at(hour: u32, minute: u32) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, 0)
        .single()
        .expect("valid time")
}

pub(crate) fn message(id: i64, room: i64, hour: u32, minute: u32) -> Message {
    Message {
        id: MessageId(id),
        room_id: RoomId(room),
        author_id: UserId(2),
        content: format!("m{id}"),
        created_at: at(hour, minute),
        image_url: None,
    }
}

pub(crate) fn member(id: i64, name: &str, role: MemberRole) -> Member {
    Member {
        user_id: UserId(id),
        username: name.into(),
        role,
        avatar_url: None,
    }
}

pub(crate) fn room(id: i64, members: Vec<Member>) -> Room {
    Room {
        id: RoomId(id),
        name: format!("room-{id}"),
        visibility: RoomVisibility::Public,
        member_count: members.len() as u32,
        members,
    }
}

pub(crate) fn invitation(id: i64, room: i64) -> Invitation {
    Invitation {
        id: InvitationId(id),
        inviter_id: UserId(9),
        room_id: RoomId(room),
        room_name: format!("room-{room}"),
        created_at: at(9, 0),
    }
}

pub(crate) fn room_joined(room: i64, online: &[i64]) -> ServerEvent {
    ServerEvent::RoomJoined(RoomJoinedPayload {
        room_id: RoomId(room),
        room_name: None,
        online_users: online
            .iter()
            .map(|id| OnlineUser {
                user_id: UserId(*id),
                username: None,
            })
            .collect(),
    })
}

/// Scripted REST backend. Pages are served newest-first like the server.
#[derive(Default)]
pub(crate) struct MockBackend {
    pub rooms: Mutex<HashMap<RoomId, Room>>,
    pub pages: Mutex<HashMap<(RoomId, u32), MessagePage>>,
    pub invitations: Mutex<Vec<Invitation>>,
    pub members: Mutex<Vec<Member>>,
    pub fail_messages: Mutex<bool>,
    pub fail_invitation_calls: Mutex<bool>,
    pub posted: Mutex<Vec<SendMessageBody>>,
    pub edits: Mutex<Vec<(MessageId, UpdateMessageBody)>>,
    pub deletes: Mutex<Vec<MessageId>>,
    pub room_fetches: AtomicUsize,
    pub invitation_fetches: AtomicUsize,
    pub search_calls: Mutex<Vec<(String, u32)>>,
    next_message_id: AtomicUsize,
    /// When set, message page fetches wait for a permit.
    pub page_gate: Mutex<Option<Arc<Notify>>>,
    /// When set, invitation list fetches wait for a permit.
    pub invitation_gate: Mutex<Option<Arc<Notify>>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_message_id: AtomicUsize::new(1000),
            ..Self::default()
        })
    }

    pub fn set_page(&self, room: i64, page: u32, pages: u32, messages: Vec<Message>) {
        self.pages.lock().unwrap().insert(
            (RoomId(room), page),
            MessagePage {
                messages,
                pagination: Some(Pagination { page, pages }),
            },
        );
    }

    pub fn set_room(&self, room: Room) {
        self.rooms.lock().unwrap().insert(room.id, room);
    }

    pub fn set_invitations(&self, invitations: Vec<Invitation>) {
        *self.invitations.lock().unwrap() = invitations;
    }

    /// Messages the server knows about: every scripted page.
    fn find_message(&self, message_id: MessageId) -> Result<Message> {
        self.pages
            .lock()
            .unwrap()
            .values()
            .flat_map(|page| page.messages.iter())
            .find(|message| message.id == message_id)
            .cloned()
            .ok_or_else(|| anyhow!("Message not found or unauthorized"))
    }
}

#[async_trait]
impl ChatBackend for MockBackend {
    async fn fetch_room(&self, room_id: RoomId) -> Result<Room> {
        self.room_fetches.fetch_add(1, Ordering::SeqCst);
        self.rooms
            .lock()
            .unwrap()
            .get(&room_id)
            .cloned()
            .ok_or_else(|| anyhow!("Room not found"))
    }

    async fn fetch_messages(&self, room_id: RoomId, page: u32, _per_page: u32) -> Result<MessagePage> {
        let gate = self.page_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if *self.fail_messages.lock().unwrap() {
            return Err(anyhow!("Server error: 500"));
        }
        Ok(self
            .pages
            .lock()
            .unwrap()
            .get(&(room_id, page))
            .cloned()
            .unwrap_or(MessagePage {
                messages: Vec::new(),
                pagination: Some(Pagination { page, pages: page }),
            }))
    }

    async fn post_message(&self, body: &SendMessageBody) -> Result<Message> {
        self.posted.lock().unwrap().push(body.clone());
        let id = self.next_message_id.fetch_add(1, Ordering::SeqCst) as i64;
        Ok(Message {
            id: MessageId(id),
            room_id: body.room_id,
            author_id: UserId(1),
            content: body.content.clone(),
            created_at: at(12, 0),
            image_url: body.image_url.clone(),
        })
    }

    async fn update_message(
        &self,
        message_id: MessageId,
        body: &UpdateMessageBody,
    ) -> Result<Message> {
        self.edits.lock().unwrap().push((message_id, body.clone()));
        let mut message = self.find_message(message_id)?;
        message.content = body.content.clone();
        message.image_url = body.image_url.clone();
        Ok(message)
    }

    async fn delete_message(&self, message_id: MessageId) -> Result<()> {
        self.find_message(message_id)?;
        self.deletes.lock().unwrap().push(message_id);
        Ok(())
    }

    async fn fetch_invitations(&self) -> Result<Vec<Invitation>> {
        self.invitation_fetches.fetch_add(1, Ordering::SeqCst);
        let gate = self.invitation_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(self.invitations.lock().unwrap().clone())
    }

    async fn accept_invitation(&self, invitation_id: InvitationId) -> Result<Option<RoomId>> {
        if *self.fail_invitation_calls.lock().unwrap() {
            return Err(anyhow!("Invitation expired"));
        }
        let invitations = self.invitations.lock().unwrap();
        Ok(invitations
            .iter()
            .find(|invitation| invitation.id == invitation_id)
            .map(|invitation| invitation.room_id))
    }

    async fn reject_invitation(&self, _invitation_id: InvitationId) -> Result<()> {
        if *self.fail_invitation_calls.lock().unwrap() {
            return Err(anyhow!("Invitation expired"));
        }
        Ok(())
    }

    async fn search_members(&self, query: &str, limit: u32) -> Result<Vec<Member>> {
        self.search_calls
            .lock()
            .unwrap()
            .push((query.to_string(), limit));
        Ok(self
            .members
            .lock()
            .unwrap()
            .iter()
            .filter(|member| member.username.contains(query))
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

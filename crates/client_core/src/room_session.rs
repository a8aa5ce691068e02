//! Join/leave state machine for the one room a session may occupy.
//!
//! A join resolves on the first of: the server's `room_joined` event, a
//! `room_error` for the room, a negative request acknowledgement, or the join
//! timeout. The `room_joined` event is authoritative; an acknowledgement with
//! an explicit `success: true` only resolves the join after a short grace
//! period in case the event never arrives.
//!
//! Room-scoped state (history, presence, typing) is registered as a
//! [`RoomScope`] and moved by the controller itself when it starts joining a
//! room, leaves it, or a join fails.

use std::sync::{Arc, Mutex, Weak};

use shared::{
    domain::RoomId,
    protocol::{ClientRequest, EventKind, OnlineUser, RequestAck, RoomJoinedPayload, ServerEvent},
};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::{
    config::ClientSettings,
    connection::ConnectionManager,
    dispatcher::Subscription,
    error::{SyncError, SyncResult},
    lock,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedRoom {
    pub room_id: RoomId,
    pub room_name: Option<String>,
    pub online_users: Vec<OnlineUser>,
}

impl JoinedRoom {
    fn acknowledged(room_id: RoomId) -> Self {
        Self {
            room_id,
            room_name: None,
            online_users: Vec::new(),
        }
    }
}

impl From<&RoomJoinedPayload> for JoinedRoom {
    fn from(payload: &RoomJoinedPayload) -> Self {
        Self {
            room_id: payload.room_id,
            room_name: payload.room_name.clone(),
            online_users: payload.online_users.clone(),
        }
    }
}

type JoinOutcome = SyncResult<JoinedRoom>;

/// State that follows the room the controller is in or joining. `None`
/// means no room.
pub trait RoomScope: Send + Sync {
    fn enter_room(&self, room: Option<RoomId>);
}

enum RoomState {
    Idle,
    Joining {
        room_id: RoomId,
        attempt: u64,
        outcome: watch::Sender<Option<JoinOutcome>>,
    },
    Joined(JoinedRoom),
    Leaving(RoomId),
}

struct SessionInner {
    state: RoomState,
    rejoin_hint: Option<RoomId>,
    next_attempt: u64,
}

enum JoinStep {
    Done(JoinedRoom),
    Await {
        outcome: watch::Receiver<Option<JoinOutcome>>,
        same_room: bool,
    },
    LeaveFirst(RoomId),
    Started {
        attempt: u64,
        outcome: watch::Receiver<Option<JoinOutcome>>,
    },
}

pub struct RoomSessionController {
    settings: ClientSettings,
    connection: Arc<ConnectionManager>,
    inner: Mutex<SessionInner>,
    subscriptions: Mutex<Vec<Subscription>>,
    scopes: Mutex<Vec<Arc<dyn RoomScope>>>,
}

impl RoomSessionController {
    pub fn new(settings: ClientSettings, connection: Arc<ConnectionManager>) -> Arc<Self> {
        let controller = Arc::new(Self {
            settings,
            connection,
            inner: Mutex::new(SessionInner {
                state: RoomState::Idle,
                rejoin_hint: None,
                next_attempt: 0,
            }),
            subscriptions: Mutex::new(Vec::new()),
            scopes: Mutex::new(Vec::new()),
        });
        controller.attach();
        controller
    }

    fn attach(self: &Arc<Self>) {
        let dispatcher = self.connection.dispatcher();
        let kinds = [
            EventKind::RoomJoined,
            EventKind::RoomError,
            EventKind::RoomLeft,
            EventKind::Disconnected,
        ];
        let subscriptions = kinds
            .into_iter()
            .map(|kind| {
                let controller = Arc::downgrade(self);
                dispatcher.on_fn(kind, move |event| {
                    if let Some(controller) = controller.upgrade() {
                        controller.handle_event(event);
                    }
                })
            })
            .collect();
        *lock(&self.subscriptions) = subscriptions;
    }

    /// Scopes are moved in registration order.
    pub fn add_scope(&self, scope: Arc<dyn RoomScope>) {
        lock(&self.scopes).push(scope);
    }

    fn rescope(&self, room: Option<RoomId>) {
        let scopes = lock(&self.scopes).clone();
        for scope in scopes {
            scope.enter_room(room);
        }
    }

    /// Drops the event subscriptions; the controller stops tracking the
    /// server afterwards.
    pub fn detach(&self) {
        lock(&self.subscriptions).clear();
    }

    /// The room the session is confirmed in.
    pub fn current_room(&self) -> Option<RoomId> {
        match &lock(&self.inner).state {
            RoomState::Joined(joined) => Some(joined.room_id),
            _ => None,
        }
    }

    /// Confirmed or pending room; the scope events are filtered against.
    pub fn active_room(&self) -> Option<RoomId> {
        match &lock(&self.inner).state {
            RoomState::Joined(joined) => Some(joined.room_id),
            RoomState::Joining { room_id, .. } => Some(*room_id),
            _ => None,
        }
    }

    pub fn is_joining(&self) -> bool {
        matches!(lock(&self.inner).state, RoomState::Joining { .. })
    }

    /// Last joined room kept across a connection loss.
    pub fn rejoin_hint(&self) -> Option<RoomId> {
        lock(&self.inner).rejoin_hint
    }

    pub async fn join_room(self: &Arc<Self>, room_id: RoomId) -> JoinOutcome {
        loop {
            if !self.connection.is_connected() {
                return Err(SyncError::NotConnected);
            }
            match self.next_join_step(room_id) {
                JoinStep::Done(joined) => return Ok(joined),
                JoinStep::Await { outcome, same_room } => {
                    debug!(room_id = room_id.0, same_room, "room: awaiting in-flight join");
                    let result = wait_for_outcome(outcome).await;
                    if same_room {
                        return result;
                    }
                }
                JoinStep::LeaveFirst(previous) => self.leave_room(previous),
                JoinStep::Started { attempt, outcome } => {
                    // Before the request goes out, so the join snapshot lands
                    // in the new scope.
                    self.rescope(Some(room_id));
                    return self.start_join(room_id, attempt, outcome).await;
                }
            }
        }
    }

    fn next_join_step(&self, room_id: RoomId) -> JoinStep {
        let mut inner = lock(&self.inner);
        match &inner.state {
            RoomState::Joined(joined) if joined.room_id == room_id => {
                return JoinStep::Done(joined.clone())
            }
            RoomState::Joined(joined) => return JoinStep::LeaveFirst(joined.room_id),
            RoomState::Joining {
                room_id: pending,
                outcome,
                ..
            } => {
                return JoinStep::Await {
                    outcome: outcome.subscribe(),
                    same_room: *pending == room_id,
                }
            }
            RoomState::Idle | RoomState::Leaving(_) => {}
        }
        inner.next_attempt += 1;
        let attempt = inner.next_attempt;
        let (outcome, outcome_rx) = watch::channel(None);
        inner.state = RoomState::Joining {
            room_id,
            attempt,
            outcome,
        };
        JoinStep::Started {
            attempt,
            outcome: outcome_rx,
        }
    }

    async fn start_join(
        self: &Arc<Self>,
        room_id: RoomId,
        attempt: u64,
        outcome: watch::Receiver<Option<JoinOutcome>>,
    ) -> JoinOutcome {
        let ack = match self.connection.request(ClientRequest::JoinRoom { room_id }) {
            Ok(ack) => ack,
            Err(err) => {
                self.resolve(attempt, Err(err.clone()));
                return Err(err);
            }
        };
        info!(room_id = room_id.0, attempt, "room: join requested");
        tokio::spawn(drive_join(
            Arc::downgrade(self),
            room_id,
            attempt,
            ack,
            self.settings.clone(),
        ));
        wait_for_outcome(outcome).await
    }

    /// Best effort: the leave is written whenever connected, and local state
    /// only changes when `room_id` is the room we are in or joining.
    pub fn leave_room(&self, room_id: RoomId) {
        let (was_joined, cancelled) = {
            let mut inner = lock(&self.inner);
            if inner.rejoin_hint == Some(room_id) {
                inner.rejoin_hint = None;
            }
            let (was_joined, cancelled) = match &inner.state {
                RoomState::Joined(joined) => (joined.room_id == room_id, None),
                RoomState::Joining {
                    room_id: pending,
                    attempt,
                    ..
                } if *pending == room_id => (false, Some(*attempt)),
                _ => (false, None),
            };
            if was_joined {
                inner.state = RoomState::Leaving(room_id);
            }
            (was_joined, cancelled)
        };
        if was_joined || cancelled.is_some() {
            self.rescope(None);
        }
        if let Some(attempt) = cancelled {
            self.resolve(
                attempt,
                Err(SyncError::JoinRejected {
                    room_id,
                    reason: "left before join completed".into(),
                }),
            );
        }
        if self.connection.is_connected() {
            if let Err(err) = self.connection.send(ClientRequest::LeaveRoom { room_id }) {
                debug!(room_id = room_id.0, "room: leave not sent: {err}");
            }
        }
        info!(room_id = room_id.0, "room: left");
    }

    /// Settles a pending join. Only the first resolution for an attempt
    /// counts.
    fn resolve(&self, attempt: u64, result: JoinOutcome) {
        let failed = {
            let mut inner = lock(&self.inner);
            let room_id = match &inner.state {
                RoomState::Joining {
                    room_id,
                    attempt: pending,
                    outcome,
                } if *pending == attempt => {
                    outcome.send_replace(Some(result.clone()));
                    *room_id
                }
                _ => return,
            };
            match result {
                Ok(joined) => {
                    info!(room_id = room_id.0, attempt, "room: joined");
                    inner.rejoin_hint = Some(room_id);
                    inner.state = RoomState::Joined(joined);
                    false
                }
                Err(err) => {
                    warn!(room_id = room_id.0, attempt, "room: join failed: {err}");
                    inner.state = RoomState::Idle;
                    true
                }
            }
        };
        if failed {
            self.rescope(None);
        }
    }

    fn pending_attempt(&self) -> Option<(RoomId, u64)> {
        match &lock(&self.inner).state {
            RoomState::Joining {
                room_id, attempt, ..
            } => Some((*room_id, *attempt)),
            _ => None,
        }
    }

    fn handle_event(&self, event: &ServerEvent) {
        match event {
            ServerEvent::RoomJoined(payload) => match self.pending_attempt() {
                Some((room_id, attempt)) if room_id == payload.room_id => {
                    self.resolve(attempt, Ok(JoinedRoom::from(payload)));
                }
                _ => debug!(room_id = payload.room_id.0, "room: unsolicited room_joined"),
            },
            ServerEvent::RoomError {
                room_id: failed,
                message,
            } => {
                if let Some((room_id, attempt)) = self.pending_attempt() {
                    if failed.map_or(true, |failed| failed == room_id) {
                        self.resolve(
                            attempt,
                            Err(SyncError::JoinRejected {
                                room_id,
                                reason: message.clone(),
                            }),
                        );
                    }
                }
            }
            ServerEvent::RoomLeft { room_id } => {
                let mut inner = lock(&self.inner);
                if matches!(inner.state, RoomState::Leaving(leaving) if leaving == *room_id) {
                    inner.state = RoomState::Idle;
                }
            }
            ServerEvent::Disconnected {
                preserve_room_hint,
                ..
            } => self.handle_disconnected(*preserve_room_hint),
            _ => {}
        }
    }

    fn handle_disconnected(&self, preserve_room_hint: bool) {
        if let Some((room_id, attempt)) = self.pending_attempt() {
            self.resolve(attempt, Err(SyncError::NotConnected));
            if preserve_room_hint {
                lock(&self.inner).rejoin_hint = Some(room_id);
            }
        }
        let mut inner = lock(&self.inner);
        if let RoomState::Joined(joined) = &inner.state {
            let room_id = joined.room_id;
            inner.rejoin_hint = Some(room_id);
            debug!(room_id = room_id.0, "room: connection lost while joined");
        }
        inner.state = RoomState::Idle;
        if !preserve_room_hint {
            inner.rejoin_hint = None;
        }
    }
}

async fn wait_for_outcome(mut outcome: watch::Receiver<Option<JoinOutcome>>) -> JoinOutcome {
    match outcome.wait_for(Option::is_some).await {
        Ok(settled) => settled.clone().unwrap_or(Err(SyncError::NotConnected)),
        Err(_) => Err(SyncError::NotConnected),
    }
}

/// Fallback resolution path: the acknowledgement and the join timeout.
async fn drive_join(
    controller: Weak<RoomSessionController>,
    room_id: RoomId,
    attempt: u64,
    ack: oneshot::Receiver<serde_json::Value>,
    settings: ClientSettings,
) {
    let deadline = tokio::time::sleep(settings.join_timeout);
    tokio::pin!(deadline);

    let acked = tokio::select! {
        body = ack => Some(body.ok()),
        _ = &mut deadline => None,
    };
    let result = match acked {
        Some(Some(body)) => match serde_json::from_value::<RequestAck>(body) {
            Ok(ack) if ack.is_rejection() => Err(SyncError::JoinRejected {
                room_id,
                reason: ack.reason(),
            }),
            Ok(ack) if ack.is_confirmation() => {
                tokio::time::sleep(settings.join_ack_grace).await;
                Ok(JoinedRoom::acknowledged(room_id))
            }
            _ => {
                debug!(room_id = room_id.0, "room: inconclusive join ack");
                deadline.await;
                Err(SyncError::JoinTimeout { room_id })
            }
        },
        // Link went away without an ack; only the event path can still win.
        Some(None) => {
            deadline.await;
            Err(SyncError::JoinTimeout { room_id })
        }
        None => Err(SyncError::JoinTimeout { room_id }),
    };

    if let Some(controller) = controller.upgrade() {
        controller.resolve(attempt, result);
    }
}

#[cfg(test)]
#[path = "tests/room_session_tests.rs"]
mod tests;

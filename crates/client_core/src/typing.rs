//! Typing indicators in both directions.
//!
//! Outgoing: the first keystroke sends `typing {is_typing: true}`, further
//! keystrokes re-send it at most once per debounce window, and a quiet
//! period of the same length sends the stop.
//!
//! Incoming: one remote typer is shown at a time; it expires on its own if no
//! explicit stop arrives.

use std::sync::{Arc, Mutex, Weak};

use shared::{
    domain::{RoomId, UserId},
    protocol::{ClientRequest, EventKind, ServerEvent},
};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Duration, Instant},
};
use tracing::debug;

use crate::{
    connection::ConnectionManager,
    dispatcher::{EventDispatcher, Subscription},
    lock,
    room_session::RoomScope,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTyper {
    pub user_id: UserId,
    pub username: String,
}

#[derive(Default)]
struct TypingInner {
    room: Option<RoomId>,
    last_start_sent: Option<Instant>,
    stop_task: Option<JoinHandle<()>>,
    remote: Option<(RemoteTyper, Instant)>,
    remote_generation: u64,
    expiry_task: Option<JoinHandle<()>>,
}

impl TypingInner {
    fn clear_remote(&mut self) -> bool {
        self.remote_generation += 1;
        if let Some(task) = self.expiry_task.take() {
            task.abort();
        }
        self.remote.take().is_some()
    }
}

pub struct TypingCoordinator {
    connection: Arc<ConnectionManager>,
    local_user: UserId,
    debounce: Duration,
    remote_ttl: Duration,
    inner: Mutex<TypingInner>,
    display: watch::Sender<Option<RemoteTyper>>,
}

impl TypingCoordinator {
    pub fn new(
        connection: Arc<ConnectionManager>,
        local_user: UserId,
        debounce: Duration,
        remote_ttl: Duration,
    ) -> Arc<Self> {
        let (display, _) = watch::channel(None);
        Arc::new(Self {
            connection,
            local_user,
            debounce,
            remote_ttl,
            inner: Mutex::new(TypingInner::default()),
            display,
        })
    }

    pub fn attach(self: &Arc<Self>, dispatcher: &Arc<EventDispatcher>) -> Vec<Subscription> {
        [EventKind::UserTyping, EventKind::Disconnected]
            .into_iter()
            .map(|kind| {
                let typing = Arc::downgrade(self);
                dispatcher.on_fn(kind, move |event| {
                    let Some(typing) = typing.upgrade() else {
                        return;
                    };
                    match event {
                        ServerEvent::UserTyping {
                            room_id,
                            user_id,
                            username,
                            is_typing,
                        } => typing.on_remote_typing(*room_id, *user_id, username, *is_typing),
                        ServerEvent::Disconnected { .. } => typing.reset(),
                        _ => {}
                    }
                })
            })
            .collect()
    }

    /// Moves to a new room: the local indicator is stopped for the old one
    /// and the remote display is cleared.
    pub fn set_room(&self, room: Option<RoomId>) {
        self.stop_local_typing();
        let cleared = {
            let mut inner = lock(&self.inner);
            inner.room = room;
            inner.clear_remote()
        };
        if cleared {
            self.display.send_replace(None);
        }
    }

    pub fn room(&self) -> Option<RoomId> {
        lock(&self.inner).room
    }

    /// Call on every local keystroke.
    pub fn notify_local_typing(self: &Arc<Self>) {
        if !self.connection.is_connected() {
            return;
        }
        let now = Instant::now();
        let (room, send_start) = {
            let mut inner = lock(&self.inner);
            let Some(room) = inner.room else {
                return;
            };
            let send_start = inner
                .last_start_sent
                .map_or(true, |sent| now.duration_since(sent) >= self.debounce);
            if send_start {
                inner.last_start_sent = Some(now);
            }
            if let Some(task) = inner.stop_task.take() {
                task.abort();
            }
            inner.stop_task = Some(self.spawn_idle_stop());
            (room, send_start)
        };
        if send_start {
            self.send(room, true);
        }
    }

    /// Sends the stop signal if a start was sent and cancels the idle timer.
    pub fn stop_local_typing(&self) {
        let (room, was_typing) = {
            let mut inner = lock(&self.inner);
            if let Some(task) = inner.stop_task.take() {
                task.abort();
            }
            (inner.room, inner.last_start_sent.take().is_some())
        };
        if let (Some(room), true) = (room, was_typing) {
            self.send(room, false);
        }
    }

    pub fn is_local_typing(&self) -> bool {
        lock(&self.inner).last_start_sent.is_some()
    }

    fn send(&self, room_id: RoomId, is_typing: bool) {
        if !self.connection.is_connected() {
            return;
        }
        if let Err(err) = self.connection.send(ClientRequest::Typing { room_id, is_typing }) {
            debug!(room_id = room_id.0, is_typing, "typing: signal not sent: {err}");
        }
    }

    fn spawn_idle_stop(self: &Arc<Self>) -> JoinHandle<()> {
        let typing: Weak<Self> = Arc::downgrade(self);
        let quiet = self.debounce;
        tokio::spawn(async move {
            tokio::time::sleep(quiet).await;
            if let Some(typing) = typing.upgrade() {
                typing.stop_local_typing();
            }
        })
    }

    /// Remote typer currently on display, if it has not expired.
    pub fn remote_typer(&self) -> Option<RemoteTyper> {
        let inner = lock(&self.inner);
        inner
            .remote
            .as_ref()
            .filter(|(_, expires_at)| Instant::now() < *expires_at)
            .map(|(typer, _)| typer.clone())
    }

    /// Watch of the remote typer on display; updated on start, stop and
    /// expiry.
    pub fn subscribe(&self) -> watch::Receiver<Option<RemoteTyper>> {
        self.display.subscribe()
    }

    fn on_remote_typing(self: &Arc<Self>, room: RoomId, user: UserId, username: &str, is_typing: bool) {
        if user == self.local_user {
            return;
        }
        let shown = {
            let mut inner = lock(&self.inner);
            if inner.room != Some(room) {
                return;
            }
            if is_typing {
                let typer = RemoteTyper {
                    user_id: user,
                    username: username.to_string(),
                };
                inner.clear_remote();
                inner.remote = Some((typer.clone(), Instant::now() + self.remote_ttl));
                let generation = inner.remote_generation;
                inner.expiry_task = Some(self.spawn_expiry(generation));
                Some(Some(typer))
            } else if inner
                .remote
                .as_ref()
                .is_some_and(|(typer, _)| typer.user_id == user)
            {
                inner.clear_remote();
                Some(None)
            } else {
                None
            }
        };
        if let Some(shown) = shown {
            self.display.send_replace(shown);
        }
    }

    fn spawn_expiry(self: &Arc<Self>, generation: u64) -> JoinHandle<()> {
        let typing = Arc::downgrade(self);
        let ttl = self.remote_ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let Some(typing) = typing.upgrade() else {
                return;
            };
            let expired = {
                let mut inner = lock(&typing.inner);
                if inner.remote_generation != generation {
                    return;
                }
                inner.expiry_task.take();
                inner.remote.take().is_some()
            };
            if expired {
                typing.display.send_replace(None);
            }
        })
    }

    /// Connection loss: nothing is sent, all state is dropped.
    fn reset(&self) {
        let cleared = {
            let mut inner = lock(&self.inner);
            if let Some(task) = inner.stop_task.take() {
                task.abort();
            }
            inner.last_start_sent = None;
            inner.clear_remote()
        };
        if cleared {
            self.display.send_replace(None);
        }
    }
}

impl RoomScope for TypingCoordinator {
    fn enter_room(&self, room: Option<RoomId>) {
        if self.room() != room {
            self.set_room(room);
        }
    }
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;

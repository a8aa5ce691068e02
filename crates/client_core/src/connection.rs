//! Owns the single duplex channel to the server.
//!
//! Every link gets a fresh epoch. Tasks that outlive their link (readers,
//! retry timers) compare epochs before touching shared state, so a late frame
//! from a torn-down link is never mistaken for the current one.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
};

use shared::protocol::{AckFrame, ClientRequest, InboundFrame, OutboundFrame, ServerEvent};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    config::ClientSettings,
    dispatcher::EventDispatcher,
    error::{describe, SyncError, SyncResult},
    lock,
    transport::{ConnectRequest, Transport, TransportEvent},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

struct ActiveLink {
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    reader: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct ConnectionInner {
    epoch: u64,
    link: Option<ActiveLink>,
    credential: Option<String>,
    failed_attempts: u32,
    gave_up: bool,
    last_error: Option<SyncError>,
    retry_task: Option<JoinHandle<()>>,
    next_ack: u64,
    pending_acks: HashMap<u64, oneshot::Sender<serde_json::Value>>,
}

impl ConnectionInner {
    fn drop_link(&mut self) {
        if let Some(link) = self.link.take() {
            if let Some(reader) = link.reader {
                reader.abort();
            }
        }
        self.pending_acks.clear();
    }

    fn cancel_retry(&mut self) {
        if let Some(task) = self.retry_task.take() {
            task.abort();
        }
    }
}

pub struct ConnectionManager {
    settings: ClientSettings,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<EventDispatcher>,
    state: watch::Sender<ConnectionState>,
    inner: Mutex<ConnectionInner>,
}

/// Strips an optional `Bearer ` prefix. Blank credentials are rejected.
pub fn normalize_credential(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))
        .unwrap_or(trimmed)
        .trim();
    (!token.is_empty()).then(|| token.to_string())
}

impl ConnectionManager {
    pub fn new(
        settings: ClientSettings,
        transport: Arc<dyn Transport>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            settings,
            transport,
            dispatcher,
            state,
            inner: Mutex::new(ConnectionInner::default()),
        })
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Live view of the connection state.
    pub fn status(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn failed_attempts(&self) -> u32 {
        lock(&self.inner).failed_attempts
    }

    /// Opens the channel and waits for the server's `connected` event.
    ///
    /// Calling this while already connected is a no-op; calling it while an
    /// attempt is in flight waits on that attempt. An explicit call resets the
    /// retry budget.
    pub async fn connect(self: &Arc<Self>, credential: &str) -> SyncResult<()> {
        let token = normalize_credential(credential).ok_or(SyncError::MissingCredential)?;
        let in_flight = {
            let mut inner = lock(&self.inner);
            match self.state() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting => true,
                ConnectionState::Disconnected | ConnectionState::Error => {
                    inner.credential = Some(token);
                    inner.failed_attempts = 0;
                    inner.gave_up = false;
                    inner.cancel_retry();
                    false
                }
            }
        };
        if in_flight {
            return self.wait_for_attempt().await;
        }
        self.attempt().await
    }

    /// Tears the channel down and cancels any scheduled reconnect.
    /// `preserve_room_hint` is forwarded on the `disconnected` event so the
    /// room layer knows whether to rejoin on the next connect.
    pub fn disconnect(&self, preserve_room_hint: bool) {
        {
            let mut inner = lock(&self.inner);
            inner.epoch += 1;
            inner.drop_link();
            inner.cancel_retry();
            inner.failed_attempts = 0;
            inner.gave_up = false;
            inner.credential = None;
            self.state.send_replace(ConnectionState::Disconnected);
        }
        info!(preserve_room_hint, "connection: client disconnect");
        self.dispatcher.emit(&ServerEvent::Disconnected {
            reason: "client disconnect".into(),
            preserve_room_hint,
        });
    }

    /// Fire-and-forget write.
    pub fn send(&self, request: ClientRequest) -> SyncResult<()> {
        self.write(OutboundFrame { request, ack: None })
    }

    /// Write that asks the server to acknowledge. The receiver yields the
    /// ack body, or errors if the link goes away first.
    pub fn request(
        &self,
        request: ClientRequest,
    ) -> SyncResult<oneshot::Receiver<serde_json::Value>> {
        let (tx, rx) = oneshot::channel();
        let mut inner = lock(&self.inner);
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        inner.next_ack += 1;
        let id = inner.next_ack;
        let outbound = inner
            .link
            .as_ref()
            .map(|link| link.outbound.clone())
            .ok_or(SyncError::NotConnected)?;
        inner.pending_acks.insert(id, tx);
        if outbound
            .send(OutboundFrame {
                request,
                ack: Some(id),
            })
            .is_err()
        {
            inner.pending_acks.remove(&id);
            return Err(SyncError::NotConnected);
        }
        Ok(rx)
    }

    fn write(&self, frame: OutboundFrame) -> SyncResult<()> {
        let inner = lock(&self.inner);
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        let link = inner.link.as_ref().ok_or(SyncError::NotConnected)?;
        link.outbound
            .send(frame)
            .map_err(|_| SyncError::NotConnected)
    }

    async fn wait_for_attempt(&self) -> SyncResult<()> {
        let timeout = self.settings.connect_timeout;
        let mut status = self.status();
        let settled = tokio::time::timeout(
            timeout,
            status.wait_for(|state| *state != ConnectionState::Connecting),
        )
        .await
        .map(|result| result.map(|state| *state));
        match settled {
            Ok(Ok(ConnectionState::Connected)) => Ok(()),
            Ok(_) => Err(self.last_error()),
            Err(_) => Err(SyncError::ConnectionTimeout(timeout)),
        }
    }

    fn last_error(&self) -> SyncError {
        lock(&self.inner)
            .last_error
            .clone()
            .unwrap_or(SyncError::NotConnected)
    }

    async fn attempt(self: &Arc<Self>) -> SyncResult<()> {
        let (epoch, token) = {
            let mut inner = lock(&self.inner);
            let Some(token) = inner.credential.clone() else {
                return Err(SyncError::MissingCredential);
            };
            inner.epoch += 1;
            inner.drop_link();
            inner.last_error = None;
            self.state.send_replace(ConnectionState::Connecting);
            (inner.epoch, token)
        };

        let url = match self.settings.socket_url() {
            Ok(url) => url,
            Err(err) => return Err(self.fail_attempt(epoch, SyncError::Transport(describe(&err)))),
        };
        let request = ConnectRequest::new(url, token);
        let timeout = self.settings.connect_timeout;
        let deadline = Instant::now() + timeout;
        debug!(url = %request.url, epoch, "connection: opening link");

        let link = match tokio::time::timeout_at(deadline, self.transport.open(&request)).await {
            Ok(Ok(link)) => link,
            Ok(Err(err)) => {
                return Err(self.fail_attempt(epoch, SyncError::Transport(describe(&err))))
            }
            Err(_) => return Err(self.fail_attempt(epoch, SyncError::ConnectionTimeout(timeout))),
        };

        let mut status = self.status();
        {
            let mut inner = lock(&self.inner);
            if inner.epoch != epoch {
                debug!(epoch, "connection: attempt superseded before link was installed");
                return Err(SyncError::NotConnected);
            }
            inner.link = Some(ActiveLink {
                outbound: link.outbound,
                reader: None,
            });
            let reader = tokio::spawn(run_reader(Arc::downgrade(self), epoch, link.inbound));
            if let Some(active) = inner.link.as_mut() {
                active.reader = Some(reader);
            }
        }

        let settled = tokio::time::timeout_at(
            deadline,
            status.wait_for(|state| *state != ConnectionState::Connecting),
        )
        .await
        .map(|result| result.map(|state| *state));
        match settled {
            Ok(Ok(ConnectionState::Connected)) => Ok(()),
            Ok(_) => Err(self.last_error()),
            Err(_) => Err(self.fail_attempt(epoch, SyncError::ConnectionTimeout(timeout))),
        }
    }

    /// Records a failed attempt, emits `connect_error`, and either schedules
    /// the next retry or gives up once the budget is spent. The terminal
    /// `max_reconnect_attempts` event is emitted at most once per budget.
    fn fail_attempt(self: &Arc<Self>, epoch: u64, error: SyncError) -> SyncError {
        let max = self.settings.max_reconnect_attempts;
        let (attempt, retry, give_up) = {
            let mut inner = lock(&self.inner);
            if inner.epoch != epoch {
                return error;
            }
            inner.drop_link();
            inner.failed_attempts += 1;
            inner.last_error = Some(error.clone());
            self.state.send_replace(ConnectionState::Error);

            let attempt = inner.failed_attempts;
            let exhausted = attempt >= max;
            let give_up = exhausted && !inner.gave_up;
            if exhausted {
                inner.gave_up = true;
            }
            let retry = !exhausted && self.settings.auto_reconnect && inner.credential.is_some();
            (attempt, retry, give_up)
        };

        warn!(attempt, max, "connection: attempt failed: {error}");
        self.dispatcher.emit(&ServerEvent::ConnectError {
            message: error.to_string(),
            attempt,
        });
        if give_up {
            warn!(attempts = attempt, "connection: giving up on reconnect");
            self.dispatcher
                .emit(&ServerEvent::MaxReconnectAttempts { attempts: attempt });
        }
        if retry {
            self.schedule_retry();
        }
        error
    }

    fn schedule_retry(self: &Arc<Self>) {
        let delay = self.settings.reconnect_delay;
        let manager = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(manager) = manager.upgrade() else {
                return;
            };
            {
                let mut inner = lock(&manager.inner);
                // Detach ourselves so the next failure can schedule a fresh timer.
                inner.retry_task.take();
                if inner.gave_up || inner.credential.is_none() {
                    return;
                }
            }
            if matches!(
                manager.state(),
                ConnectionState::Connected | ConnectionState::Connecting
            ) {
                return;
            }
            debug!("connection: retrying");
            if let Err(err) = manager.attempt().await {
                debug!("connection: retry failed: {err}");
            }
        });
        let mut inner = lock(&self.inner);
        if let Some(previous) = inner.retry_task.replace(task) {
            previous.abort();
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        lock(&self.inner).epoch == epoch
    }

    fn handle_ack(&self, epoch: u64, ack: AckFrame) {
        let waiter = {
            let mut inner = lock(&self.inner);
            if inner.epoch != epoch {
                return;
            }
            inner.pending_acks.remove(&ack.ack)
        };
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(ack.data);
            }
            None => debug!(ack = ack.ack, "connection: ack with no waiter"),
        }
    }

    fn handle_event(self: &Arc<Self>, epoch: u64, event: ServerEvent) {
        if !self.is_current(epoch) {
            return;
        }
        if event.is_local() {
            debug!(event = event.kind().name(), "connection: ignoring client-only event from wire");
            return;
        }
        match &event {
            ServerEvent::Connected { session_id, .. } => {
                {
                    let mut inner = lock(&self.inner);
                    inner.failed_attempts = 0;
                    inner.gave_up = false;
                    inner.last_error = None;
                    self.state.send_replace(ConnectionState::Connected);
                }
                info!(session_id = session_id.as_deref().unwrap_or("-"), "connection: connected");
            }
            ServerEvent::Unauthorized { message } => {
                warn!("connection: server rejected credential: {message}");
            }
            _ => {}
        }
        self.dispatcher.emit(&event);
    }

    fn handle_closed(self: &Arc<Self>, epoch: u64, reason: String) {
        let was_connected = {
            let mut inner = lock(&self.inner);
            if inner.epoch != epoch || inner.link.is_none() {
                return;
            }
            let was_connected = self.state() == ConnectionState::Connected;
            if was_connected {
                inner.drop_link();
                self.state.send_replace(ConnectionState::Disconnected);
            }
            was_connected
        };

        if !was_connected {
            self.fail_attempt(epoch, SyncError::Transport(reason));
            return;
        }

        warn!("connection: link lost: {reason}");
        self.dispatcher.emit(&ServerEvent::Disconnected {
            reason,
            preserve_room_hint: true,
        });
        let retry = {
            let inner = lock(&self.inner);
            inner.epoch == epoch && inner.credential.is_some()
        };
        if retry && self.settings.auto_reconnect {
            self.schedule_retry();
        }
    }
}

async fn run_reader(
    manager: Weak<ConnectionManager>,
    epoch: u64,
    mut inbound: mpsc::UnboundedReceiver<TransportEvent>,
) {
    let reason = loop {
        let Some(event) = inbound.recv().await else {
            break "transport closed".to_string();
        };
        let Some(manager) = manager.upgrade() else {
            return;
        };
        match event {
            TransportEvent::Frame(InboundFrame::Ack(ack)) => manager.handle_ack(epoch, ack),
            TransportEvent::Frame(InboundFrame::Event(event)) => manager.handle_event(epoch, event),
            TransportEvent::Closed { reason } => break reason,
        }
    };
    if let Some(manager) = manager.upgrade() {
        manager.handle_closed(epoch, reason);
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;

use std::{
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use shared::{
    domain::{Invitation, InvitationId, RoomId},
    protocol::EventKind,
};
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{
    backend::ChatBackend,
    dispatcher::{EventDispatcher, Subscription},
    error::{describe, SyncError, SyncResult},
    lock,
};

/// Orders overlapping refreshes: a response is applied only if no later
/// request has been applied already and no local mutation happened since it
/// was issued.
#[derive(Default)]
struct RefreshOrder {
    issued: u64,
    applied: u64,
}

pub struct InvitationPoller {
    backend: Arc<dyn ChatBackend>,
    interval: Duration,
    list: watch::Sender<Vec<Invitation>>,
    order: Mutex<RefreshOrder>,
}

/// Keeps the poller running. Dropping it stops the timer and the push
/// triggered refreshes.
pub struct PollerHandle {
    task: JoinHandle<()>,
    _subscriptions: Vec<Subscription>,
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl InvitationPoller {
    pub fn new(backend: Arc<dyn ChatBackend>, interval: Duration) -> Arc<Self> {
        let (list, _) = watch::channel(Vec::new());
        Arc::new(Self {
            backend,
            interval,
            list,
            order: Mutex::new(RefreshOrder::default()),
        })
    }

    pub fn invitations(&self) -> Vec<Invitation> {
        self.list.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Invitation>> {
        self.list.subscribe()
    }

    /// Starts the fixed-interval refresh and hooks `room_invitation` and
    /// `connected` to trigger an immediate one.
    pub fn start(self: &Arc<Self>, dispatcher: &Arc<EventDispatcher>) -> PollerHandle {
        let poller = Arc::downgrade(self);
        let period = self.interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(poller) = poller.upgrade() else {
                    return;
                };
                if let Err(err) = poller.refresh().await {
                    debug!("invitations: periodic refresh failed: {err}");
                }
            }
        });

        let subscriptions = [EventKind::RoomInvitation, EventKind::Connected]
            .into_iter()
            .map(|kind| {
                let poller = Arc::downgrade(self);
                dispatcher.on_fn(kind, move |_| spawn_refresh(&poller))
            })
            .collect();

        info!(interval_secs = period.as_secs(), "invitations: poller started");
        PollerHandle {
            task,
            _subscriptions: subscriptions,
        }
    }

    /// Fetches the authoritative list. Responses that lost a race with a
    /// newer refresh or with a local accept/reject are discarded.
    pub async fn refresh(&self) -> SyncResult<Vec<Invitation>> {
        let ticket = {
            let mut order = lock(&self.order);
            order.issued += 1;
            order.issued
        };
        let fetched = self
            .backend
            .fetch_invitations()
            .await
            .map_err(|err| SyncError::InvitationsUnavailable(describe(&err)))?;

        let mut order = lock(&self.order);
        if ticket > order.applied {
            order.applied = ticket;
            self.list.send_replace(fetched);
        } else {
            debug!(ticket, applied = order.applied, "invitations: stale refresh dropped");
        }
        Ok(self.invitations())
    }

    /// Accepts and drops the invitation locally. Returns the room the server
    /// admitted us to, when it says.
    pub async fn accept(&self, invitation_id: InvitationId) -> SyncResult<Option<RoomId>> {
        let room = self
            .backend
            .accept_invitation(invitation_id)
            .await
            .map_err(|err| SyncError::InvitationFailed {
                invitation_id,
                reason: describe(&err),
            })?;
        self.remove(invitation_id);
        info!(invitation_id = invitation_id.0, "invitations: accepted");
        Ok(room)
    }

    pub async fn reject(&self, invitation_id: InvitationId) -> SyncResult<()> {
        self.backend
            .reject_invitation(invitation_id)
            .await
            .map_err(|err| SyncError::InvitationFailed {
                invitation_id,
                reason: describe(&err),
            })?;
        self.remove(invitation_id);
        info!(invitation_id = invitation_id.0, "invitations: rejected");
        Ok(())
    }

    fn remove(&self, invitation_id: InvitationId) {
        let mut order = lock(&self.order);
        // Anything fetched before this point may still list the invitation.
        order.applied = order.issued;
        self.list
            .send_modify(|list| list.retain(|invitation| invitation.id != invitation_id));
    }
}

fn spawn_refresh(poller: &Weak<InvitationPoller>) {
    let Some(poller) = poller.upgrade() else {
        return;
    };
    tokio::spawn(async move {
        if let Err(err) = poller.refresh().await {
            warn!("invitations: refresh failed: {err}");
        }
    });
}

#[cfg(test)]
#[path = "tests/invitations_tests.rs"]
mod tests;

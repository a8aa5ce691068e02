//! Named-event fan-out between the connection and its consumers.
//!
//! Handlers are registered per [`EventKind`] and run in registration order.
//! A registration lives as long as the [`Subscription`] guard it returned, so
//! a consumer that goes away cannot leave a dangling handler behind. Async
//! consumers can instead take the broadcast stream from
//! [`EventDispatcher::subscribe`].

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, Weak},
};

use shared::protocol::{EventKind, ServerEvent};
use tokio::sync::broadcast;
use tracing::{debug, error};

use crate::lock;

pub type EventHandler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

const EVENT_STREAM_CAPACITY: usize = 1024;

struct Entry {
    id: u64,
    kind: EventKind,
    handler: EventHandler,
    guards: usize,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    entries: Vec<Entry>,
}

pub struct EventDispatcher {
    registry: Mutex<Registry>,
    stream: broadcast::Sender<ServerEvent>,
}

/// Keeps a handler registered until dropped.
#[must_use = "dropping a Subscription unregisters its handler"]
pub struct Subscription {
    dispatcher: Weak<EventDispatcher>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.release(self.id);
        }
    }
}

impl EventDispatcher {
    pub fn new() -> Arc<Self> {
        let (stream, _) = broadcast::channel(EVENT_STREAM_CAPACITY);
        Arc::new(Self {
            registry: Mutex::new(Registry::default()),
            stream,
        })
    }

    /// Registers `handler` for `kind`. Registering the same handler (same
    /// `Arc`) for the same kind again reuses the existing entry.
    pub fn on(self: &Arc<Self>, kind: EventKind, handler: EventHandler) -> Subscription {
        let mut registry = lock(&self.registry);
        let existing = registry
            .entries
            .iter_mut()
            .find(|entry| entry.kind == kind && Arc::ptr_eq(&entry.handler, &handler));
        let id = match existing {
            Some(entry) => {
                entry.guards += 1;
                entry.id
            }
            None => {
                registry.next_id += 1;
                let id = registry.next_id;
                registry.entries.push(Entry {
                    id,
                    kind,
                    handler,
                    guards: 1,
                });
                id
            }
        };
        debug!(event = kind.name(), handler_id = id, "registered event handler");
        Subscription {
            dispatcher: Arc::downgrade(self),
            id,
        }
    }

    /// Convenience wrapper around [`EventDispatcher::on`] for closures.
    pub fn on_fn<F>(self: &Arc<Self>, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.on(kind, Arc::new(handler))
    }

    /// Removes `handler` from `kind` regardless of outstanding guards.
    /// Returns whether anything was removed.
    pub fn off(&self, kind: EventKind, handler: &EventHandler) -> bool {
        let mut registry = lock(&self.registry);
        let before = registry.entries.len();
        registry
            .entries
            .retain(|entry| !(entry.kind == kind && Arc::ptr_eq(&entry.handler, handler)));
        before != registry.entries.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.stream.subscribe()
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        lock(&self.registry)
            .entries
            .iter()
            .filter(|entry| entry.kind == kind)
            .count()
    }

    /// Delivers one event to every handler registered for its kind, then to
    /// stream subscribers. Only the connection layer calls this.
    pub(crate) fn emit(&self, event: &ServerEvent) {
        let kind = event.kind();
        let handlers: Vec<(u64, EventHandler)> = lock(&self.registry)
            .entries
            .iter()
            .filter(|entry| entry.kind == kind)
            .map(|entry| (entry.id, Arc::clone(&entry.handler)))
            .collect();

        for (id, handler) in handlers {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(event)));
            if outcome.is_err() {
                error!(event = kind.name(), handler_id = id, "event handler panicked");
            }
        }

        let _ = self.stream.send(event.clone());
    }

    fn release(&self, id: u64) {
        let mut registry = lock(&self.registry);
        if let Some(pos) = registry.entries.iter().position(|entry| entry.id == id) {
            let entry = &mut registry.entries[pos];
            entry.guards = entry.guards.saturating_sub(1);
            if entry.guards == 0 {
                registry.entries.remove(pos);
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;

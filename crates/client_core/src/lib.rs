//! Client-side synchronization core for the chat service: one duplex
//! connection, a named-event dispatcher, and the per-room state (membership,
//! message history, presence, typing, invitations) kept consistent on top of
//! it.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod backend;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod invitations;
pub mod message_store;
pub mod presence;
pub mod room_session;
pub mod session;
pub mod transport;
pub mod typing;

pub use backend::{ChatBackend, RestBackend};
pub use config::{load_settings, ClientSettings};
pub use connection::{ConnectionManager, ConnectionState};
pub use dispatcher::{EventDispatcher, EventHandler, Subscription};
pub use error::{SyncError, SyncResult};
pub use invitations::{InvitationPoller, PollerHandle};
pub use message_store::{FixedRowHeight, MessageLayout, MessageStore, OlderPageOutcome};
pub use presence::PresenceTracker;
pub use room_session::{JoinedRoom, RoomScope, RoomSessionController};
pub use session::ChatSession;
pub use transport::{ConnectRequest, Transport, TransportEvent, TransportLink, WebSocketTransport};
pub use typing::{RemoteTyper, TypingCoordinator};

/// State guarded here is only touched synchronously, so a panic in another
/// holder cannot leave it half-updated in a way later readers care about.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

use std::time::Duration;

use shared::domain::{InvitationId, MessageId, RoomId};
use thiserror::Error;

pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Failures surfaced by the synchronization core.
///
/// Values are `Clone` because a single join outcome is shared by every caller
/// awaiting the same in-flight join.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("socket connection timed out after {0:?}")]
    ConnectionTimeout(Duration),
    #[error("socket not connected")]
    NotConnected,
    #[error("no authentication token provided")]
    MissingCredential,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("room {room_id} join timed out")]
    JoinTimeout { room_id: RoomId },
    #[error("failed to join room {room_id}: {reason}")]
    JoinRejected { room_id: RoomId, reason: String },
    #[error("no room joined")]
    NoActiveRoom,
    #[error("failed to send message: {0}")]
    SendFailed(String),
    #[error("failed to change message {message_id}: {reason}")]
    MessageEditFailed {
        message_id: MessageId,
        reason: String,
    },
    #[error("message must have content or an image")]
    InvalidMessage,
    #[error("failed to load messages: {0}")]
    PageLoadFailed(String),
    #[error("failed to load room {room_id}: {reason}")]
    MetadataFetchFailed { room_id: RoomId, reason: String },
    #[error("invitation {invitation_id} failed: {reason}")]
    InvitationFailed {
        invitation_id: InvitationId,
        reason: String,
    },
    #[error("failed to load invitations: {0}")]
    InvitationsUnavailable(String),
    #[error("member search failed: {0}")]
    SearchFailed(String),
    #[error("gave up reconnecting after {attempts} attempts")]
    MaxReconnectAttemptsExceeded { attempts: u32 },
}

impl SyncError {
    /// Room-level errors are not retried automatically and should be shown to
    /// the user as-is. Everything else is reported through connection status.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            Self::JoinRejected { .. }
                | Self::SendFailed(_)
                | Self::MessageEditFailed { .. }
                | Self::InvalidMessage
                | Self::PageLoadFailed(_)
                | Self::InvitationFailed { .. }
        )
    }
}

/// Flattens an `anyhow` chain into one line for the string-carrying variants.
pub(crate) fn describe(err: &anyhow::Error) -> String {
    format!("{err:#}")
}

use serde::{Deserialize, Serialize};

use crate::domain::{Member, Message, MessageId, RoomId, UserId};

/// Requests the client writes to the duplex channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientRequest {
    Authenticate {
        token: String,
    },
    JoinRoom {
        room_id: RoomId,
    },
    LeaveRoom {
        room_id: RoomId,
    },
    SendMessage {
        room_id: RoomId,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image_url: Option<String>,
    },
    Typing {
        room_id: RoomId,
        is_typing: bool,
    },
}

impl ClientRequest {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::JoinRoom { .. } => "join_room",
            Self::LeaveRoom { .. } => "leave_room",
            Self::SendMessage { .. } => "send_message",
            Self::Typing { .. } => "typing",
        }
    }
}

/// Outbound frame: a request plus an optional acknowledgement id the server
/// echoes back when it invokes the request callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundFrame {
    #[serde(flatten)]
    pub request: ClientRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckFrame {
    pub ack: u64,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InboundFrame {
    Ack(AckFrame),
    Event(ServerEvent),
}

/// Body of a request acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestAck {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl RequestAck {
    pub fn is_rejection(&self) -> bool {
        self.error.is_some() || self.success == Some(false)
    }

    /// Only an explicit `success: true` counts as a positive answer.
    pub fn is_confirmation(&self) -> bool {
        self.success == Some(true) && self.error.is_none()
    }

    pub fn reason(&self) -> String {
        self.error
            .clone()
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| "request rejected".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineUser {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomJoinedPayload {
    pub room_id: RoomId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_name: Option<String>,
    #[serde(default)]
    pub online_users: Vec<OnlineUser>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberEventPayload {
    pub room_id: RoomId,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// Named events delivered to dispatcher subscribers.
///
/// Everything except `Disconnected`, `ConnectError` and
/// `MaxReconnectAttempts` arrives from the wire; those three are produced by
/// the client's connection layer when the channel changes state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        user_id: Option<UserId>,
    },
    Disconnected {
        reason: String,
        #[serde(default = "default_true")]
        preserve_room_hint: bool,
    },
    ConnectError {
        message: String,
        #[serde(default)]
        attempt: u32,
    },
    MaxReconnectAttempts {
        attempts: u32,
    },
    RoomJoined(RoomJoinedPayload),
    RoomLeft {
        room_id: RoomId,
    },
    RoomError {
        #[serde(default)]
        room_id: Option<RoomId>,
        message: String,
    },
    NewMessage(Message),
    MessageUpdated(Message),
    MessageDeleted {
        room_id: RoomId,
        message_id: MessageId,
    },
    UserTyping {
        room_id: RoomId,
        user_id: UserId,
        username: String,
        is_typing: bool,
    },
    UserOnline(MemberEventPayload),
    UserOffline(MemberEventPayload),
    MemberJoined(MemberEventPayload),
    MemberRemoved(MemberEventPayload),
    RoomInvitation {
        room_id: RoomId,
        #[serde(default)]
        room_name: Option<String>,
        #[serde(default)]
        inviter_username: Option<String>,
    },
    Unauthorized {
        #[serde(default)]
        message: String,
    },
    Error {
        #[serde(default)]
        message: String,
    },
}

fn default_true() -> bool {
    true
}

/// Event names, used as subscription keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Connected,
    Disconnected,
    ConnectError,
    MaxReconnectAttempts,
    RoomJoined,
    RoomLeft,
    RoomError,
    NewMessage,
    MessageUpdated,
    MessageDeleted,
    UserTyping,
    UserOnline,
    UserOffline,
    MemberJoined,
    MemberRemoved,
    RoomInvitation,
    Unauthorized,
    Error,
}

impl EventKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::ConnectError => "connect_error",
            Self::MaxReconnectAttempts => "max_reconnect_attempts",
            Self::RoomJoined => "room_joined",
            Self::RoomLeft => "room_left",
            Self::RoomError => "room_error",
            Self::NewMessage => "new_message",
            Self::MessageUpdated => "message_updated",
            Self::MessageDeleted => "message_deleted",
            Self::UserTyping => "user_typing",
            Self::UserOnline => "user_online",
            Self::UserOffline => "user_offline",
            Self::MemberJoined => "member_joined",
            Self::MemberRemoved => "member_removed",
            Self::RoomInvitation => "room_invitation",
            Self::Unauthorized => "unauthorized",
            Self::Error => "error",
        }
    }
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connected { .. } => EventKind::Connected,
            Self::Disconnected { .. } => EventKind::Disconnected,
            Self::ConnectError { .. } => EventKind::ConnectError,
            Self::MaxReconnectAttempts { .. } => EventKind::MaxReconnectAttempts,
            Self::RoomJoined(_) => EventKind::RoomJoined,
            Self::RoomLeft { .. } => EventKind::RoomLeft,
            Self::RoomError { .. } => EventKind::RoomError,
            Self::NewMessage(_) => EventKind::NewMessage,
            Self::MessageUpdated(_) => EventKind::MessageUpdated,
            Self::MessageDeleted { .. } => EventKind::MessageDeleted,
            Self::UserTyping { .. } => EventKind::UserTyping,
            Self::UserOnline(_) => EventKind::UserOnline,
            Self::UserOffline(_) => EventKind::UserOffline,
            Self::MemberJoined(_) => EventKind::MemberJoined,
            Self::MemberRemoved(_) => EventKind::MemberRemoved,
            Self::RoomInvitation { .. } => EventKind::RoomInvitation,
            Self::Unauthorized { .. } => EventKind::Unauthorized,
            Self::Error { .. } => EventKind::Error,
        }
    }

    /// Room the event is scoped to, if any.
    pub fn room_id(&self) -> Option<RoomId> {
        match self {
            Self::RoomJoined(payload) => Some(payload.room_id),
            Self::RoomLeft { room_id }
            | Self::MessageDeleted { room_id, .. }
            | Self::UserTyping { room_id, .. }
            | Self::RoomInvitation { room_id, .. } => Some(*room_id),
            Self::RoomError { room_id, .. } => *room_id,
            Self::NewMessage(message) | Self::MessageUpdated(message) => Some(message.room_id),
            Self::UserOnline(payload)
            | Self::UserOffline(payload)
            | Self::MemberJoined(payload)
            | Self::MemberRemoved(payload) => Some(payload.room_id),
            _ => None,
        }
    }

    /// True for the lifecycle events the client synthesises itself.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Self::Disconnected { .. } | Self::ConnectError { .. } | Self::MaxReconnectAttempts { .. }
        )
    }
}

// REST payloads.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub pages: u32,
}

impl Pagination {
    pub fn has_older(&self) -> bool {
        self.page < self.pages
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePage {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageBody {
    pub room_id: RoomId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// Body of `PUT /messages/{id}`. The server replaces both fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMessageBody {
    pub content: String,
    #[serde(default)]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemberSuggestions {
    #[serde(default)]
    pub suggestions: Vec<Member>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_room_joined_event_frame() {
        let raw = r#"{"event":"room_joined","data":{"room_id":7,"room_name":"general","message":"Joined general","online_users":[{"user_id":2,"username":"bob"}]}}"#;
        let frame: InboundFrame = serde_json::from_str(raw).expect("frame");
        match frame {
            InboundFrame::Event(ServerEvent::RoomJoined(payload)) => {
                assert_eq!(payload.room_id, RoomId(7));
                assert_eq!(payload.online_users.len(), 1);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn decodes_ack_frame_before_events() {
        let raw = r#"{"ack":3,"data":{"success":false,"error":"Room not found"}}"#;
        let frame: InboundFrame = serde_json::from_str(raw).expect("frame");
        let InboundFrame::Ack(ack) = frame else {
            panic!("expected ack frame");
        };
        let body: RequestAck = serde_json::from_value(ack.data).expect("ack body");
        assert!(body.is_rejection());
        assert_eq!(body.reason(), "Room not found");
    }

    #[test]
    fn decodes_new_message_with_naive_timestamp() {
        let raw = r#"{"event":"new_message","data":{"id":11,"room_id":7,"user_id":3,"content":"hi","image_url":null,"created_at":"2024-05-01T10:00:00.123456","is_deleted":false}}"#;
        let frame: InboundFrame = serde_json::from_str(raw).expect("frame");
        let InboundFrame::Event(event) = frame else {
            panic!("expected event");
        };
        assert_eq!(event.kind(), EventKind::NewMessage);
        assert_eq!(event.room_id(), Some(RoomId(7)));
    }

    #[test]
    fn decodes_backend_message_frame_with_nested_author() {
        let raw = r#"{"event":"new_message","data":{"id":11,"content":"hi","image_url":"","room_id":7,"parent_id":null,"is_deleted":false,"replies_count":0,"created_at":"2024-05-01T10:00:00.123456","updated_at":null,"user":{"id":3,"username":"bob","avatar_url":"","role":"member","is_banned":false}}}"#;
        let frame: InboundFrame = serde_json::from_str(raw).expect("frame");
        let InboundFrame::Event(ServerEvent::NewMessage(message)) = frame else {
            panic!("expected new_message");
        };
        assert_eq!(message.author_id, UserId(3));
        assert_eq!(message.image_url, None);
    }

    #[test]
    fn outbound_frame_carries_event_name_data_and_ack() {
        let frame = OutboundFrame {
            request: ClientRequest::JoinRoom { room_id: RoomId(3) },
            ack: Some(1),
        };
        let value = serde_json::to_value(&frame).expect("encode");
        assert_eq!(value["event"], "join_room");
        assert_eq!(value["data"]["room_id"], 3);
        assert_eq!(value["ack"], 1);
    }

    #[test]
    fn room_error_without_room_id_is_unscoped() {
        let raw = r#"{"event":"room_error","data":{"message":"Room ID required","room_id":null}}"#;
        let InboundFrame::Event(event) = serde_json::from_str(raw).expect("frame") else {
            panic!("expected event");
        };
        assert_eq!(event.room_id(), None);
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::timestamp;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(RoomId);
id_newtype!(MessageId);
id_newtype!(InvitationId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomVisibility {
    Global,
    Public,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Owner,
    Admin,
    Member,
}

impl MemberRole {
    /// Display rank: owners first, plain members last.
    pub fn rank(self) -> u8 {
        match self {
            Self::Owner => 0,
            Self::Admin => 1,
            Self::Member => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub user_id: UserId,
    pub username: String,
    #[serde(default = "default_role")]
    pub role: MemberRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

fn default_role() -> MemberRole {
    MemberRole::Member
}

// Image-only messages carry `content: null`.
fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    #[serde(rename = "room_type")]
    pub visibility: RoomVisibility,
    #[serde(default)]
    pub member_count: u32,
    #[serde(default)]
    pub members: Vec<Member>,
}

// Text-only messages carry `image_url: ""`.
fn blank_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.filter(|url| !url.trim().is_empty()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "MessageWire")]
pub struct Message {
    pub id: MessageId,
    pub room_id: RoomId,
    #[serde(rename = "user_id")]
    pub author_id: UserId,
    pub content: String,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

#[derive(Deserialize)]
struct AuthorRef {
    id: UserId,
}

/// Accepted message shapes: the author either as a flat `user_id` or nested
/// under `user`, which is how the backend serializes it.
#[derive(Deserialize)]
struct MessageWire {
    id: MessageId,
    room_id: RoomId,
    #[serde(default)]
    user_id: Option<UserId>,
    #[serde(default)]
    user: Option<AuthorRef>,
    #[serde(default, deserialize_with = "null_as_empty")]
    content: String,
    #[serde(with = "timestamp")]
    created_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "blank_as_none")]
    image_url: Option<String>,
}

impl TryFrom<MessageWire> for Message {
    type Error = String;

    fn try_from(wire: MessageWire) -> Result<Self, Self::Error> {
        let author_id = wire
            .user_id
            .or(wire.user.map(|user| user.id))
            .ok_or_else(|| format!("message {} has no author", wire.id))?;
        Ok(Self {
            id: wire.id,
            room_id: wire.room_id,
            author_id,
            content: wire.content,
            created_at: wire.created_at,
            image_url: wire.image_url,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitation {
    pub id: InvitationId,
    pub inviter_id: UserId,
    pub room_id: RoomId,
    #[serde(default)]
    pub room_name: String,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use shared::{
    domain::{Invitation, InvitationId, Member, Message, MessageId, Room, RoomId},
    error::{ApiErrorBody, ApiException},
    protocol::{MemberSuggestions, MessagePage, SendMessageBody, UpdateMessageBody},
};

/// REST collaborator used for everything that is not pushed over the
/// duplex channel.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn fetch_room(&self, room_id: RoomId) -> Result<Room>;
    async fn fetch_messages(&self, room_id: RoomId, page: u32, per_page: u32)
        -> Result<MessagePage>;
    async fn post_message(&self, body: &SendMessageBody) -> Result<Message>;
    /// Only the author may edit or delete a message.
    async fn update_message(&self, message_id: MessageId, body: &UpdateMessageBody)
        -> Result<Message>;
    async fn delete_message(&self, message_id: MessageId) -> Result<()>;
    async fn fetch_invitations(&self) -> Result<Vec<Invitation>>;
    /// Returns the room the invitation admitted us to, when the server says.
    async fn accept_invitation(&self, invitation_id: InvitationId) -> Result<Option<RoomId>>;
    async fn reject_invitation(&self, invitation_id: InvitationId) -> Result<()>;
    async fn search_members(&self, query: &str, limit: u32) -> Result<Vec<Member>>;
}

#[derive(Deserialize)]
struct RoomEnvelope {
    room: Room,
}

#[derive(Deserialize)]
struct PostedMessage {
    message_data: Message,
}

#[derive(Deserialize)]
struct InvitationList {
    #[serde(default)]
    invitations: Vec<Invitation>,
}

#[derive(Deserialize)]
struct RoomRef {
    id: RoomId,
}

#[derive(Deserialize, Default)]
struct AcceptedInvitation {
    #[serde(default)]
    room: Option<RoomRef>,
}

pub struct RestBackend {
    http: Client,
    server_url: String,
    token: String,
}

impl RestBackend {
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_client(Client::new(), server_url, token)
    }

    pub fn with_client(http: Client, server_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http,
            server_url: server_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.server_url)
    }
}

/// Maps non-2xx responses to [`ApiException`] using the server's error body.
async fn checked(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.json::<ApiErrorBody>().await.unwrap_or_default();
    Err(ApiException::from_body(status.as_u16(), body).into())
}

#[async_trait]
impl ChatBackend for RestBackend {
    async fn fetch_room(&self, room_id: RoomId) -> Result<Room> {
        let response = self
            .http
            .get(self.url(&format!("/rooms/{room_id}")))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let envelope: RoomEnvelope = checked(response).await?.json().await?;
        Ok(envelope.room)
    }

    async fn fetch_messages(
        &self,
        room_id: RoomId,
        page: u32,
        per_page: u32,
    ) -> Result<MessagePage> {
        let response = self
            .http
            .get(self.url(&format!("/messages/room/{room_id}")))
            .query(&[("page", page), ("per_page", per_page)])
            .bearer_auth(&self.token)
            .send()
            .await?;
        Ok(checked(response).await?.json().await?)
    }

    async fn post_message(&self, body: &SendMessageBody) -> Result<Message> {
        let response = self
            .http
            .post(self.url("/messages"))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        let posted: PostedMessage = checked(response).await?.json().await?;
        Ok(posted.message_data)
    }

    async fn update_message(
        &self,
        message_id: MessageId,
        body: &UpdateMessageBody,
    ) -> Result<Message> {
        let response = self
            .http
            .put(self.url(&format!("/messages/{message_id}")))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        let updated: PostedMessage = checked(response).await?.json().await?;
        Ok(updated.message_data)
    }

    async fn delete_message(&self, message_id: MessageId) -> Result<()> {
        let response = self
            .http
            .delete(self.url(&format!("/messages/{message_id}")))
            .bearer_auth(&self.token)
            .send()
            .await?;
        checked(response).await?;
        Ok(())
    }

    async fn fetch_invitations(&self) -> Result<Vec<Invitation>> {
        let response = self
            .http
            .get(self.url("/invitations"))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let list: InvitationList = checked(response).await?.json().await?;
        Ok(list.invitations)
    }

    async fn accept_invitation(&self, invitation_id: InvitationId) -> Result<Option<RoomId>> {
        let response = self
            .http
            .post(self.url(&format!("/invitations/{invitation_id}/accept")))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let bytes = checked(response).await?.bytes().await?;
        let accepted: AcceptedInvitation = if bytes.is_empty() {
            AcceptedInvitation::default()
        } else {
            serde_json::from_slice(&bytes)?
        };
        Ok(accepted.room.map(|room| room.id))
    }

    async fn reject_invitation(&self, invitation_id: InvitationId) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!("/invitations/{invitation_id}/reject")))
            .bearer_auth(&self.token)
            .send()
            .await?;
        checked(response).await?;
        Ok(())
    }

    async fn search_members(&self, query: &str, limit: u32) -> Result<Vec<Member>> {
        let response = self
            .http
            .get(self.url("/users/search"))
            .query(&[("q", query.to_string()), ("limit", limit.to_string())])
            .bearer_auth(&self.token)
            .send()
            .await?;
        let found: MemberSuggestions = checked(response).await?.json().await?;
        Ok(found.suggestions)
    }
}

#[cfg(test)]
#[path = "tests/backend_tests.rs"]
mod tests;

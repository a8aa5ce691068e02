//! Ordered, de-duplicated message history for the active room.
//!
//! The list is kept sorted by `(created_at, id)` no matter which path a
//! message arrives through: initial page, older page, push event or the
//! echo of a local send.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use shared::{
    domain::{Message, MessageId, RoomId},
    protocol::{EventKind, SendMessageBody, ServerEvent, UpdateMessageBody},
};
use tracing::{debug, info, warn};

use crate::{
    backend::ChatBackend,
    dispatcher::{EventDispatcher, Subscription},
    error::{describe, SyncError, SyncResult},
    lock,
    room_session::RoomScope,
};

/// Rendered height of messages, used to keep the viewport anchored when
/// older history is prepended.
pub trait MessageLayout: Send + Sync {
    fn message_height(&self, message: &Message) -> f64;

    fn content_height(&self, messages: &[Message]) -> f64 {
        messages.iter().map(|message| self.message_height(message)).sum()
    }
}

/// One row per text line, plus a fixed block for an attached image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedRowHeight {
    pub row: f64,
    pub image: f64,
}

impl Default for FixedRowHeight {
    fn default() -> Self {
        Self {
            row: 20.0,
            image: 200.0,
        }
    }
}

impl MessageLayout for FixedRowHeight {
    fn message_height(&self, message: &Message) -> f64 {
        let lines = message.content.lines().count().max(1) as f64;
        let image = if message.image_url.is_some() {
            self.image
        } else {
            0.0
        };
        self.row * lines + image
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OlderPageOutcome {
    Loaded {
        added: usize,
        /// Height added above the viewport; scroll down by this much to keep
        /// the same message in view.
        scroll_delta: f64,
        has_older: bool,
    },
    /// Another older-page load is running; this call did nothing.
    InFlight,
    /// Nothing older to fetch.
    Exhausted,
    /// The room changed while the page was in flight; it was discarded.
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Paging {
    Unloaded,
    Ready { loaded_pages: u32, has_older: bool },
    LoadingOlder { loaded_pages: u32 },
}

struct StoreInner {
    room: Option<RoomId>,
    messages: Vec<Message>,
    ids: HashSet<MessageId>,
    paging: Paging,
    page_size: u32,
    generation: u64,
}

impl StoreInner {
    fn insert(&mut self, message: Message) -> bool {
        if self.room != Some(message.room_id) || !self.ids.insert(message.id) {
            return false;
        }
        let key = (message.created_at, message.id);
        let pos = self
            .messages
            .partition_point(|existing| (existing.created_at, existing.id) <= key);
        self.messages.insert(pos, message);
        true
    }
}

pub struct MessageStore {
    backend: Arc<dyn ChatBackend>,
    layout: Arc<dyn MessageLayout>,
    inner: Mutex<StoreInner>,
}

impl MessageStore {
    pub fn new(backend: Arc<dyn ChatBackend>, layout: Arc<dyn MessageLayout>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            layout,
            inner: Mutex::new(StoreInner {
                room: None,
                messages: Vec::new(),
                ids: HashSet::new(),
                paging: Paging::Unloaded,
                page_size: 10,
                generation: 0,
            }),
        })
    }

    /// Routes message push events into the store.
    pub fn attach(self: &Arc<Self>, dispatcher: &Arc<EventDispatcher>) -> Vec<Subscription> {
        [
            EventKind::NewMessage,
            EventKind::MessageUpdated,
            EventKind::MessageDeleted,
        ]
        .into_iter()
        .map(|kind| {
            let store = Arc::downgrade(self);
            dispatcher.on_fn(kind, move |event| {
                let Some(store) = store.upgrade() else {
                    return;
                };
                match event {
                    ServerEvent::NewMessage(message) => {
                        store.apply_create(message.clone());
                    }
                    ServerEvent::MessageUpdated(message) => {
                        store.apply_update(message);
                    }
                    ServerEvent::MessageDeleted {
                        room_id,
                        message_id,
                    } => {
                        store.apply_delete(*room_id, *message_id);
                    }
                    _ => {}
                }
            })
        })
        .collect()
    }

    /// Drops all history and scopes the store to `room`.
    pub fn reset(&self, room: Option<RoomId>) {
        let mut inner = lock(&self.inner);
        inner.generation += 1;
        inner.room = room;
        inner.messages.clear();
        inner.ids.clear();
        inner.paging = Paging::Unloaded;
    }

    pub fn room(&self) -> Option<RoomId> {
        lock(&self.inner).room
    }

    pub fn messages(&self) -> Vec<Message> {
        lock(&self.inner).messages.clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_older(&self) -> bool {
        matches!(
            lock(&self.inner).paging,
            Paging::Ready {
                has_older: true,
                ..
            }
        )
    }

    /// Fetches the most recent page for `room`, replacing whatever was held.
    pub async fn load_initial_page(&self, room: RoomId, page_size: u32) -> SyncResult<usize> {
        self.reset(Some(room));
        let generation = {
            let mut inner = lock(&self.inner);
            inner.page_size = page_size.max(1);
            inner.generation
        };

        let page = self
            .backend
            .fetch_messages(room, 1, page_size.max(1))
            .await
            .map_err(|err| SyncError::PageLoadFailed(describe(&err)))?;

        let mut inner = lock(&self.inner);
        if inner.generation != generation {
            debug!(room_id = room.0, "messages: initial page superseded");
            return Ok(0);
        }
        let fetched = page.messages.len();
        let has_older = page
            .pagination
            .map_or(fetched as u32 >= inner.page_size, |pagination| pagination.has_older());
        let added = page
            .messages
            .into_iter()
            .map(|message| inner.insert(message))
            .filter(|inserted| *inserted)
            .count();
        inner.paging = Paging::Ready {
            loaded_pages: 1,
            has_older,
        };
        info!(room_id = room.0, added, has_older, "messages: initial page loaded");
        Ok(added)
    }

    /// Prepends the next older page. A call made while another is running
    /// returns [`OlderPageOutcome::InFlight`] without fetching anything.
    pub async fn load_older_page(&self) -> SyncResult<OlderPageOutcome> {
        let (room, loaded_pages, page_size, generation) = {
            let mut inner = lock(&self.inner);
            let Some(room) = inner.room else {
                return Ok(OlderPageOutcome::Exhausted);
            };
            let loaded_pages = match inner.paging {
                Paging::LoadingOlder { .. } => return Ok(OlderPageOutcome::InFlight),
                Paging::Unloaded
                | Paging::Ready {
                    has_older: false, ..
                } => return Ok(OlderPageOutcome::Exhausted),
                Paging::Ready { loaded_pages, .. } => loaded_pages,
            };
            inner.paging = Paging::LoadingOlder { loaded_pages };
            (room, loaded_pages, inner.page_size, inner.generation)
        };

        let page_number = loaded_pages + 1;
        let fetched = self
            .backend
            .fetch_messages(room, page_number, page_size)
            .await;

        let mut inner = lock(&self.inner);
        if inner.generation != generation {
            return Ok(OlderPageOutcome::Superseded);
        }
        let page = match fetched {
            Ok(page) => page,
            Err(err) => {
                inner.paging = Paging::Ready {
                    loaded_pages,
                    has_older: true,
                };
                warn!(room_id = room.0, page = page_number, "messages: older page failed: {err:#}");
                return Err(SyncError::PageLoadFailed(describe(&err)));
            }
        };

        let has_older = page
            .pagination
            .map_or(page.messages.len() as u32 >= page_size, |pagination| {
                pagination.has_older()
            });
        let height_before = self.layout.content_height(&inner.messages);
        let added = page
            .messages
            .into_iter()
            .map(|message| inner.insert(message))
            .filter(|inserted| *inserted)
            .count();
        let scroll_delta = self.layout.content_height(&inner.messages) - height_before;
        inner.paging = Paging::Ready {
            loaded_pages: page_number,
            has_older,
        };
        debug!(room_id = room.0, page = page_number, added, "messages: older page loaded");
        Ok(OlderPageOutcome::Loaded {
            added,
            scroll_delta,
            has_older,
        })
    }

    /// Inserts a pushed or locally created message. Returns false for
    /// duplicates and for messages belonging to another room.
    pub fn apply_create(&self, message: Message) -> bool {
        let mut inner = lock(&self.inner);
        let id = message.id;
        let inserted = inner.insert(message);
        if !inserted {
            debug!(message_id = id.0, "messages: ignored create");
        }
        inserted
    }

    /// Replaces content and image of a known message in place.
    pub fn apply_update(&self, message: &Message) -> bool {
        let mut inner = lock(&self.inner);
        if inner.room != Some(message.room_id) {
            return false;
        }
        match inner
            .messages
            .iter_mut()
            .find(|existing| existing.id == message.id)
        {
            Some(existing) => {
                existing.content = message.content.clone();
                existing.image_url = message.image_url.clone();
                true
            }
            None => false,
        }
    }

    pub fn apply_delete(&self, room_id: RoomId, message_id: MessageId) -> bool {
        let mut inner = lock(&self.inner);
        if inner.room != Some(room_id) || !inner.ids.remove(&message_id) {
            return false;
        }
        inner.messages.retain(|message| message.id != message_id);
        true
    }

    /// Posts a message over REST and merges the stored copy. Content is
    /// trimmed; a message needs text or an image.
    pub async fn send_message(
        &self,
        room_id: RoomId,
        content: &str,
        image_url: Option<String>,
    ) -> SyncResult<Message> {
        let content = content.trim();
        if content.is_empty() && image_url.is_none() {
            return Err(SyncError::InvalidMessage);
        }
        let body = SendMessageBody {
            room_id,
            content: content.to_string(),
            image_url,
        };
        let message = self
            .backend
            .post_message(&body)
            .await
            .map_err(|err| SyncError::SendFailed(describe(&err)))?;
        self.apply_create(message.clone());
        Ok(message)
    }

    /// Edits one of our own messages and applies the server's copy. The
    /// `message_updated` push that follows is a no-op replace.
    pub async fn edit_message(
        &self,
        message_id: MessageId,
        content: &str,
        image_url: Option<String>,
    ) -> SyncResult<Message> {
        let content = content.trim();
        if content.is_empty() && image_url.is_none() {
            return Err(SyncError::InvalidMessage);
        }
        let body = UpdateMessageBody {
            content: content.to_string(),
            image_url,
        };
        let message = self
            .backend
            .update_message(message_id, &body)
            .await
            .map_err(|err| SyncError::MessageEditFailed {
                message_id,
                reason: describe(&err),
            })?;
        self.apply_update(&message);
        Ok(message)
    }

    /// Deletes one of our own messages. Removal is local right away; the
    /// `message_deleted` push that follows finds nothing to remove.
    pub async fn delete_message(&self, room_id: RoomId, message_id: MessageId) -> SyncResult<()> {
        self.backend
            .delete_message(message_id)
            .await
            .map_err(|err| SyncError::MessageEditFailed {
                message_id,
                reason: describe(&err),
            })?;
        self.apply_delete(room_id, message_id);
        info!(message_id = message_id.0, "messages: deleted");
        Ok(())
    }
}

impl RoomScope for MessageStore {
    fn enter_room(&self, room: Option<RoomId>) {
        if self.room() != room {
            self.reset(room);
        }
    }
}

#[cfg(test)]
#[path = "tests/message_store_tests.rs"]
mod tests;

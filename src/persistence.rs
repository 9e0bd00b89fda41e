//! Narrow contract to the on-device message database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use message_outbox::{new_local_id, SyncStatus};
use parking_lot::Mutex;

use crate::error::{SyncError, SyncResult};
use crate::models::Message;

#[async_trait]
pub trait MessagePersistence: Send + Sync {
    /// Insert or update a message. Provisional messages without a local id get
    /// one assigned; the stored copy is returned.
    async fn save_message(&self, message: &Message) -> SyncResult<Message>;

    /// Messages of a conversation, oldest first, optionally only those at or
    /// after `since`.
    async fn get_messages_for_chat(
        &self,
        chat_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> SyncResult<Vec<Message>>;

    /// Record the delivery state of a provisional message.
    async fn update_sync_status(
        &self,
        local_id: &str,
        confirmed_id: Option<&str>,
        status: SyncStatus,
        error: Option<&str>,
    ) -> SyncResult<()>;

    /// Tombstone a message. Rows are never physically removed here.
    async fn delete_message(&self, id: &str) -> SyncResult<()>;
}

/// Process-local [`MessagePersistence`], used by tests and hosts without a
/// database.
#[derive(Default)]
pub struct InMemoryMessageStore {
    messages: Mutex<Vec<StoredMessage>>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message: Message,
    last_error: Option<String>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    /// Look up by server id or local id.
    pub fn get(&self, key: &str) -> Option<Message> {
        self.messages
            .lock()
            .iter()
            .find(|s| Self::matches_key(&s.message, key))
            .map(|s| s.message.clone())
    }

    pub fn last_error(&self, local_id: &str) -> Option<String> {
        self.messages
            .lock()
            .iter()
            .find(|s| s.message.local_id.as_deref() == Some(local_id))
            .and_then(|s| s.last_error.clone())
    }

    fn matches_key(message: &Message, key: &str) -> bool {
        message.id.as_deref() == Some(key) || message.local_id.as_deref() == Some(key)
    }
}

#[async_trait]
impl MessagePersistence for InMemoryMessageStore {
    async fn save_message(&self, message: &Message) -> SyncResult<Message> {
        let mut stored = message.clone();
        if stored.is_provisional() && stored.local_id.is_none() {
            stored.local_id = Some(new_local_id());
        }

        let mut messages = self.messages.lock();
        let existing = messages.iter_mut().find(|s| match &stored.id {
            Some(id) => s.message.id.as_deref() == Some(id.as_str()),
            None => s.message.local_id.is_some() && s.message.local_id == stored.local_id,
        });
        match existing {
            Some(slot) => slot.message = stored.clone(),
            None => messages.push(StoredMessage {
                message: stored.clone(),
                last_error: None,
            }),
        }
        Ok(stored)
    }

    async fn get_messages_for_chat(
        &self,
        chat_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> SyncResult<Vec<Message>> {
        let mut messages: Vec<Message> = self
            .messages
            .lock()
            .iter()
            .map(|s| &s.message)
            .filter(|m| m.chat_id == chat_id)
            .filter(|m| since.map_or(true, |since| m.timestamp >= since))
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.timestamp);
        Ok(messages)
    }

    async fn update_sync_status(
        &self,
        local_id: &str,
        confirmed_id: Option<&str>,
        status: SyncStatus,
        error: Option<&str>,
    ) -> SyncResult<()> {
        let mut messages = self.messages.lock();

        // The confirmed copy may already be stored under its server id
        if let Some(confirmed_id) = confirmed_id {
            let has_confirmed = messages
                .iter()
                .any(|s| s.message.id.as_deref() == Some(confirmed_id));
            if has_confirmed {
                messages.retain(|s| {
                    s.message.id.is_some() || s.message.local_id.as_deref() != Some(local_id)
                });
                return Ok(());
            }
        }

        let slot = messages
            .iter_mut()
            .find(|s| s.message.local_id.as_deref() == Some(local_id))
            .ok_or_else(|| SyncError::Persistence(format!("no stored message {local_id}")))?;
        slot.message.sync_status = status;
        if let Some(confirmed_id) = confirmed_id {
            slot.message.id = Some(confirmed_id.to_string());
        }
        slot.last_error = error.map(str::to_string);
        Ok(())
    }

    async fn delete_message(&self, id: &str) -> SyncResult<()> {
        let mut messages = self.messages.lock();
        let slot = messages
            .iter_mut()
            .find(|s| Self::matches_key(&s.message, id))
            .ok_or_else(|| SyncError::Persistence(format!("no stored message {id}")))?;
        slot.message.tombstone();
        Ok(())
    }
}

//! Real-time events delivered by the socket layer.

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::error::{SyncError, SyncResult};

pub const EVENT_PRIVATE_MESSAGE: &str = "private_message";
pub const EVENT_GROUP_MESSAGE: &str = "group_message";
pub const EVENT_MESSAGE_EDITED: &str = "message_edited";
pub const EVENT_MESSAGE_DELETED: &str = "message_deleted";
pub const EVENT_REACTION_UPDATED: &str = "reaction_updated";

#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    /// Raw message payload
    NewMessage(JsonValue),
    /// Raw message payload carrying the new content
    MessageEdited(JsonValue),
    MessageDeleted {
        message_id: String,
        chat_id: Option<String>,
    },
    /// Informational; reactions converge through the next refresh
    ReactionUpdated {
        message_id: Option<String>,
        chat_id: Option<String>,
        payload: JsonValue,
    },
}

impl PushEvent {
    /// Decode a socket event. Unknown event names yield `Ok(None)`.
    ///
    /// New-message events may wrap the message as
    /// `{ message, chatId, chatType, senderInfo }`; the wrapper's `chatId` is
    /// copied into the message when it has no `chat` of its own.
    pub fn decode(event: &str, payload: JsonValue) -> SyncResult<Option<Self>> {
        let decoded = match event {
            EVENT_PRIVATE_MESSAGE | EVENT_GROUP_MESSAGE => {
                PushEvent::NewMessage(unwrap_message(payload)?)
            }
            EVENT_MESSAGE_EDITED => PushEvent::MessageEdited(unwrap_message(payload)?),
            EVENT_MESSAGE_DELETED => {
                let message_id = string_field(&payload, &["id", "_id", "messageId"])
                    .ok_or_else(|| {
                        SyncError::Parse("message_deleted event without message id".to_string())
                    })?;
                PushEvent::MessageDeleted {
                    message_id,
                    chat_id: string_field(&payload, &["chat", "chatId"]),
                }
            }
            EVENT_REACTION_UPDATED => PushEvent::ReactionUpdated {
                message_id: string_field(&payload, &["messageId", "_id", "id"]),
                chat_id: string_field(&payload, &["chat", "chatId"]),
                payload,
            },
            _ => return Ok(None),
        };
        Ok(Some(decoded))
    }

    /// Conversation the event belongs to, when the payload says.
    pub fn chat_id(&self) -> Option<String> {
        match self {
            PushEvent::NewMessage(payload) | PushEvent::MessageEdited(payload) => {
                string_field(payload, &["chat"])
            }
            PushEvent::MessageDeleted { chat_id, .. }
            | PushEvent::ReactionUpdated { chat_id, .. } => chat_id.clone(),
        }
    }
}

fn unwrap_message(payload: JsonValue) -> SyncResult<JsonValue> {
    let JsonValue::Object(mut outer) = payload else {
        return Err(SyncError::Parse("push payload is not an object".to_string()));
    };

    match outer.remove("message") {
        Some(JsonValue::Object(mut inner)) => {
            if !inner.contains_key("chat") {
                if let Some(chat_id) = outer.get("chatId").cloned() {
                    inner.insert("chat".to_string(), chat_id);
                }
            }
            Ok(JsonValue::Object(inner))
        }
        Some(other) => {
            // A plain message whose `message` field is something else
            outer.insert("message".to_string(), other);
            Ok(JsonValue::Object(outer))
        }
        None => Ok(JsonValue::Object(outer)),
    }
}

/// First present field among `keys`, as a string. Populated references
/// (`{ "_id": ... }`) resolve to their id.
fn string_field(payload: &JsonValue, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match payload.get(key)? {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Object(object) => object
            .get("_id")
            .and_then(JsonValue::as_str)
            .map(str::to_string),
        _ => None,
    })
}

/// Callback surface the socket layer drives.
#[async_trait]
pub trait PushSink: Send + Sync {
    async fn on_new_message(&self, payload: JsonValue) -> SyncResult<()>;
    async fn on_message_edited(&self, payload: JsonValue) -> SyncResult<()>;
    async fn on_message_deleted(&self, payload: JsonValue) -> SyncResult<()>;
    async fn on_reaction_updated(&self, payload: JsonValue) -> SyncResult<()>;

    /// Route a raw socket event by name. Unknown events are ignored.
    async fn deliver(&self, event: &str, payload: JsonValue) -> SyncResult<()> {
        match event {
            EVENT_PRIVATE_MESSAGE | EVENT_GROUP_MESSAGE => self.on_new_message(payload).await,
            EVENT_MESSAGE_EDITED => self.on_message_edited(payload).await,
            EVENT_MESSAGE_DELETED => self.on_message_deleted(payload).await,
            EVENT_REACTION_UPDATED => self.on_reaction_updated(payload).await,
            _ => Ok(()),
        }
    }
}

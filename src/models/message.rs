use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use message_outbox::{new_local_id, SyncStatus};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::error::{SyncError, SyncResult};
use crate::signature;

/// Content shown in place of a deleted message.
pub const DELETED_MESSAGE_TEXT: &str = "This message was deleted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
    Audio,
    Video,
    System,
    /// Any type this client does not know about
    #[serde(other)]
    Other,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Image => "image",
            MessageType::File => "file",
            MessageType::Audio => "audio",
            MessageType::Video => "video",
            MessageType::System => "system",
            MessageType::Other => "other",
        }
    }

    /// Lenient parse used for server payloads.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" | "" => MessageType::Text,
            "image" => MessageType::Image,
            "file" => MessageType::File,
            "audio" => MessageType::Audio,
            "video" => MessageType::Video,
            "system" => MessageType::System,
            _ => MessageType::Other,
        }
    }

    /// Only text messages have content that is known at creation time.
    pub fn is_text(&self) -> bool {
        matches!(self, MessageType::Text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub size: u64,
}

/// Emoji reactions on a message.
///
/// `summary` is the per-emoji count, `mine` is the viewer's own reaction (at
/// most one per viewer).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reactions {
    #[serde(default)]
    pub summary: BTreeMap<String, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mine: Option<String>,
}

impl Reactions {
    /// Toggle the viewer's reaction.
    ///
    /// Reacting with the current emoji removes it; a different emoji moves the
    /// reaction. Returns true when the viewer ends up reacting with `emoji`.
    pub fn toggle(&mut self, emoji: &str) -> bool {
        let previous = self.mine.take();
        if let Some(prev) = &previous {
            self.decrement(prev);
        }
        if previous.as_deref() == Some(emoji) {
            return false;
        }
        *self.summary.entry(emoji.to_string()).or_insert(0) += 1;
        self.mine = Some(emoji.to_string());
        true
    }

    pub fn total(&self) -> u32 {
        self.summary.values().sum()
    }

    fn decrement(&mut self, emoji: &str) {
        if let Some(count) = self.summary.get_mut(emoji) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.summary.remove(emoji);
            }
        }
    }
}

/// The unit of reconciliation.
///
/// Server-confirmed messages carry `id`. Messages composed on this device carry
/// `local_id` and `client_nonce` until the server confirms them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_nonce: Option<String>,
    pub chat_id: String,
    pub sender_id: String,
    #[serde(rename = "type", default)]
    pub kind: MessageType,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(default)]
    pub reactions: Reactions,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sync_status: SyncStatus,
    /// Fallback dedup key, fixed when the message is created
    #[serde(default)]
    pub local_signature: String,
}

/// What the user composed, before it becomes a provisional [`Message`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MessageDraft {
    pub kind: MessageType,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub reply_to_id: Option<String>,
}

impl MessageDraft {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            kind: MessageType::Text,
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn reply_to(mut self, message_id: impl Into<String>) -> Self {
        self.reply_to_id = Some(message_id.into());
        self
    }
}

impl Message {
    /// Build the optimistic local copy of an outgoing message.
    pub fn provisional(chat_id: &str, sender_id: &str, draft: MessageDraft) -> Self {
        let mut message = Self {
            id: None,
            local_id: Some(new_local_id()),
            client_nonce: Some(signature::new_client_nonce()),
            chat_id: chat_id.to_string(),
            sender_id: sender_id.to_string(),
            kind: draft.kind,
            content: draft.content,
            attachments: draft.attachments,
            timestamp: now_millis(),
            reply_to_id: draft.reply_to_id,
            reactions: Reactions::default(),
            is_read: false,
            is_deleted: false,
            is_edited: false,
            edited_at: None,
            sync_status: SyncStatus::Pending,
            local_signature: String::new(),
        };
        message.local_signature = signature::signature_of(&message);
        message
    }

    /// True until the server has assigned an id.
    pub fn is_provisional(&self) -> bool {
        self.id.is_none()
    }

    /// Server id if confirmed, local id otherwise.
    pub fn key(&self) -> &str {
        self.id
            .as_deref()
            .or(self.local_id.as_deref())
            .unwrap_or_default()
    }

    /// Replace content with the deletion sentinel. The row itself stays.
    pub fn tombstone(&mut self) {
        self.is_deleted = true;
        self.content = DELETED_MESSAGE_TEXT.to_string();
        self.attachments.clear();
        self.reactions = Reactions::default();
    }

    /// Request body for `POST /api/messages`.
    pub fn to_send_payload(&self) -> JsonValue {
        let mut body = json!({
            "chatId": self.chat_id,
            "content": self.content,
            "type": self.kind.as_str(),
            "attachments": self.attachments,
        });
        if let Some(reply_to) = &self.reply_to_id {
            body["replyTo"] = json!(reply_to);
        }
        if let Some(nonce) = &self.client_nonce {
            body["clientNonce"] = json!(nonce);
        }
        body
    }

    /// Decode a server message.
    ///
    /// `viewer_id` resolves which reaction (if any) belongs to the current user.
    pub fn from_wire(value: &JsonValue, viewer_id: &str) -> SyncResult<Self> {
        let wire = WireMessage::deserialize(value)
            .map_err(|e| SyncError::Parse(format!("invalid message payload: {e}")))?;

        let id = wire
            .id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| SyncError::Parse("message payload without _id".to_string()))?;

        let timestamp = match wire.timestamp.or(wire.created_at) {
            Some(ts) => ts.into_datetime()?,
            None => {
                return Err(SyncError::Parse(format!(
                    "message {id} has neither timestamp nor createdAt"
                )))
            }
        };
        let edited_at = wire.edited_at.map(WireTimestamp::into_datetime).transpose()?;

        let mine = wire
            .reactions
            .iter()
            .find(|r| r.user.as_ref().map(IdRef::id) == Some(viewer_id))
            .map(|r| r.emoji.clone());
        let mut summary = wire.reaction_summary;
        if summary.is_empty() {
            for reaction in &wire.reactions {
                *summary.entry(reaction.emoji.clone()).or_insert(0) += 1;
            }
        }

        let mut message = Self {
            id: Some(id),
            local_id: None,
            client_nonce: wire.client_nonce.filter(|n| !n.is_empty()),
            chat_id: wire.chat.map(|c| c.id().to_string()).unwrap_or_default(),
            sender_id: wire.sender.map(|s| s.id().to_string()).unwrap_or_default(),
            kind: wire.kind.as_deref().map(MessageType::parse).unwrap_or_default(),
            content: wire.content.unwrap_or_default(),
            attachments: wire.attachments,
            timestamp,
            reply_to_id: wire.reply_to.map(|r| r.id().to_string()),
            reactions: Reactions { summary, mine },
            is_read: wire.is_read,
            is_deleted: wire.is_deleted,
            is_edited: wire.is_edited.or(wire.edited).unwrap_or(edited_at.is_some()),
            edited_at,
            sync_status: SyncStatus::Synced,
            local_signature: String::new(),
        };
        message.local_signature = signature::signature_of(&message);
        if message.is_deleted {
            message.tombstone();
        }
        Ok(message)
    }
}

/// Current time truncated to the millisecond precision used on the wire.
fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    Utc.timestamp_millis_opt(now.timestamp_millis())
        .single()
        .unwrap_or(now)
}

/// Server representation of a message.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(rename = "_id", default)]
    id: Option<String>,
    #[serde(default)]
    chat: Option<IdRef>,
    #[serde(default)]
    sender: Option<IdRef>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    attachments: Vec<Attachment>,
    #[serde(default)]
    timestamp: Option<WireTimestamp>,
    #[serde(default)]
    created_at: Option<WireTimestamp>,
    #[serde(default)]
    reply_to: Option<IdRef>,
    #[serde(default)]
    reaction_summary: BTreeMap<String, u32>,
    #[serde(default)]
    reactions: Vec<WireReaction>,
    #[serde(default)]
    is_read: bool,
    #[serde(default)]
    is_deleted: bool,
    #[serde(default)]
    edited: Option<bool>,
    #[serde(default)]
    is_edited: Option<bool>,
    #[serde(default)]
    edited_at: Option<WireTimestamp>,
    #[serde(default)]
    client_nonce: Option<String>,
}

/// A reference that is either a bare id or a populated document.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IdRef {
    Id(String),
    Object {
        #[serde(rename = "_id")]
        id: String,
    },
}

impl IdRef {
    fn id(&self) -> &str {
        match self {
            IdRef::Id(id) => id,
            IdRef::Object { id } => id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireReaction {
    #[serde(default)]
    user: Option<IdRef>,
    emoji: String,
}

/// Milliseconds since the epoch or an RFC 3339 string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum WireTimestamp {
    Millis(i64),
    Text(String),
}

impl WireTimestamp {
    pub(crate) fn into_datetime(self) -> SyncResult<DateTime<Utc>> {
        match self {
            WireTimestamp::Millis(ms) => Utc
                .timestamp_millis_opt(ms)
                .single()
                .ok_or_else(|| SyncError::Parse(format!("timestamp out of range: {ms}"))),
            WireTimestamp::Text(text) => DateTime::parse_from_rfc3339(&text)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| SyncError::Parse(format!("invalid timestamp {text:?}: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_populated_server_message() {
        let raw = json!({
            "_id": "65f0c2a9e4b0a1b2c3d4e5f6",
            "chat": "chat-1",
            "sender": { "_id": "user-1", "username": "alice", "avatar": "" },
            "type": "text",
            "content": "hello",
            "createdAt": "2024-03-12T10:00:00.000Z",
            "replyTo": { "_id": "m0", "content": "hi", "sender": "user-2" },
            "reactions": [
                { "user": "user-2", "emoji": "👍" },
                { "user": "viewer", "emoji": "❤️" }
            ],
            "clientNonce": "nonce-1",
            "isRead": true
        });

        let message = Message::from_wire(&raw, "viewer").unwrap();
        assert_eq!(message.id.as_deref(), Some("65f0c2a9e4b0a1b2c3d4e5f6"));
        assert_eq!(message.sender_id, "user-1");
        assert_eq!(message.chat_id, "chat-1");
        assert_eq!(message.reply_to_id.as_deref(), Some("m0"));
        assert_eq!(message.client_nonce.as_deref(), Some("nonce-1"));
        assert_eq!(message.reactions.summary.get("👍"), Some(&1));
        assert_eq!(message.reactions.mine.as_deref(), Some("❤️"));
        assert_eq!(message.sync_status, SyncStatus::Synced);
        assert!(message.is_read);
        assert!(!message.is_provisional());
    }

    #[test]
    fn test_decode_millis_timestamp_and_unknown_type() {
        let raw = json!({
            "_id": "m1",
            "chat": "chat-1",
            "sender": "user-1",
            "type": "sticker",
            "timestamp": 1_700_000_000_000i64,
            "editedAt": 1_700_000_100_000i64
        });

        let message = Message::from_wire(&raw, "viewer").unwrap();
        assert_eq!(message.kind, MessageType::Other);
        assert_eq!(message.timestamp.timestamp_millis(), 1_700_000_000_000);
        assert!(message.is_edited);
    }

    #[test]
    fn test_decode_rejects_malformed_payloads() {
        assert!(matches!(
            Message::from_wire(&json!("not an object"), "viewer"),
            Err(SyncError::Parse(_))
        ));
        assert!(matches!(
            Message::from_wire(&json!({ "content": "x", "timestamp": 1 }), "viewer"),
            Err(SyncError::Parse(_))
        ));
        assert!(matches!(
            Message::from_wire(&json!({ "_id": "m1", "sender": "u" }), "viewer"),
            Err(SyncError::Parse(_))
        ));
        assert!(matches!(
            Message::from_wire(&json!({ "_id": "m1", "timestamp": "yesterday" }), "viewer"),
            Err(SyncError::Parse(_))
        ));
    }

    #[test]
    fn test_deleted_server_message_is_tombstoned() {
        let raw = json!({
            "_id": "m1",
            "sender": "user-1",
            "content": "secret",
            "isDeleted": true,
            "timestamp": 1
        });
        let message = Message::from_wire(&raw, "viewer").unwrap();
        assert!(message.is_deleted);
        assert_eq!(message.content, DELETED_MESSAGE_TEXT);
    }

    #[test]
    fn test_provisional_message_has_local_identity() {
        let message = Message::provisional("chat-1", "me", MessageDraft::text("hi"));
        assert!(message.is_provisional());
        assert!(message
            .local_id
            .as_deref()
            .is_some_and(message_outbox::is_local_id));
        assert!(message.client_nonce.is_some());
        assert_eq!(message.sync_status, SyncStatus::Pending);
        assert_eq!(message.local_signature, "me|text|hi");
        assert_eq!(message.key(), message.local_id.as_deref().unwrap());
    }

    #[test]
    fn test_send_payload_carries_nonce_and_reply() {
        let message = Message::provisional("chat-1", "me", MessageDraft::text("hi").reply_to("m0"));
        let payload = message.to_send_payload();
        assert_eq!(payload["chatId"], "chat-1");
        assert_eq!(payload["type"], "text");
        assert_eq!(payload["replyTo"], "m0");
        assert_eq!(payload["clientNonce"], json!(message.client_nonce));
    }

    #[test]
    fn test_reaction_toggle() {
        let mut reactions = Reactions::default();
        assert!(reactions.toggle("👍"));
        assert_eq!(reactions.summary.get("👍"), Some(&1));

        // Switching moves the reaction
        assert!(reactions.toggle("❤️"));
        assert_eq!(reactions.summary.get("👍"), None);
        assert_eq!(reactions.summary.get("❤️"), Some(&1));

        // Same emoji removes it
        assert!(!reactions.toggle("❤️"));
        assert_eq!(reactions.total(), 0);
        assert!(reactions.mine.is_none());
    }

    #[test]
    fn test_local_copy_round_trips_through_json() {
        let message = Message::provisional("chat-1", "me", MessageDraft::text("hi"));
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["syncStatus"], "pending");
        let back: Message = serde_json::from_value(value).unwrap();
        assert_eq!(back, message);
    }
}

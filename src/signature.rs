//! Dedup keys used to pair a provisional message with its confirmed copy.
//!
//! The client nonce is the strong key. When the server does not echo it, the
//! signature `sender|type|contentKey` is the fallback: `contentKey` is the text
//! for text messages and a fixed placeholder for binary types, whose content is
//! not known when the message is created. Two sends of the same text by the same
//! sender share a signature; that collision is accepted.

use uuid::Uuid;

use crate::models::Message;

/// Content key for messages whose body is not text.
pub const BINARY_CONTENT_KEY: &str = "img";

pub fn signature_of(message: &Message) -> String {
    let content_key = if message.kind.is_text() {
        message.content.as_str()
    } else {
        BINARY_CONTENT_KEY
    };
    format!(
        "{}|{}|{}",
        message.sender_id,
        message.kind.as_str(),
        content_key
    )
}

/// The message's client nonce, or an empty string.
pub fn client_nonce_of(message: &Message) -> &str {
    message.client_nonce.as_deref().unwrap_or_default()
}

pub fn new_client_nonce() -> String {
    Uuid::new_v4().to_string()
}

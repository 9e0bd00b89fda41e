//! Network side of synchronization.
//!
//! Transports hand back raw JSON; decoding happens at the reconciliation
//! point so one malformed message never fails a whole page.

mod http;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::error::SyncResult;

pub use http::HttpTransport;

/// One page of messages as returned by the server, oldest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedPage {
    pub messages: Vec<JsonValue>,
    /// Explicit "more history exists" flag, when the server sends one
    pub has_more_hint: Option<bool>,
}

#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Fetch page `page` (1 = newest) of a conversation.
    async fn fetch_messages(&self, chat_id: &str, page: u32, page_size: u32)
        -> SyncResult<FetchedPage>;

    /// Send one message and return the server's confirmed copy.
    ///
    /// Fails with `SyncError::Network` for transient problems and
    /// `SyncError::Rejected` for business-rule rejections.
    async fn send_message(&self, payload: &JsonValue) -> SyncResult<JsonValue>;
}

use message_outbox::{FailureKind, OutboxError};
use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Transient transport failure; retried through the outbox or the next poll
    #[error("network error: {0}")]
    Network(String),

    /// Business-rule rejection by the server (blocked sender, validation)
    #[error("rejected by server: {0}")]
    Rejected(String),

    #[error("malformed payload: {0}")]
    Parse(String),

    /// Response issued before the latest initial load; dropped silently
    #[error("stale response from epoch {response}, current epoch is {current}")]
    StaleEpoch { response: u64, current: u64 },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("outbox error: {0}")]
    Outbox(#[from] OutboxError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("sync engine is not running")]
    EngineClosed,
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Parse(e.to_string())
    }
}

impl SyncError {
    /// Returns whether a later attempt may succeed without user action.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Network(_) => true,
            SyncError::Outbox(OutboxError::DatabaseError(_)) => true,
            _ => false,
        }
    }

    /// How a failed send should be recorded in the outbox.
    ///
    /// Only an explicit rejection parks the entry; anything else (including a
    /// garbled confirmation) leaves it pending for the next connectivity signal.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            SyncError::Rejected(_) => FailureKind::Rejected,
            _ => FailureKind::Transient,
        }
    }
}

//! Error types for the local outbox.

use thiserror::Error;

/// Result type alias for outbox operations.
pub type OutboxResult<T> = Result<T, OutboxError>;

/// Errors that can occur during outbox operations.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Database operation failed
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// Entry not found in outbox
    #[error("Outbox entry not found: {0}")]
    EntryNotFound(String),

    /// The entry is not in a state that allows the requested change
    #[error("Invalid transition for {local_id}: {from} -> {to}")]
    InvalidTransition {
        local_id: String,
        from: String,
        to: String,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic error with context
    #[error("Outbox error: {0}")]
    Other(#[from] anyhow::Error),
}

//! # Local Message Outbox
//!
//! Durable queue for messages composed on this device that the server has not
//! confirmed yet. Every user-composed message is written here before it is
//! shown optimistically, so that no input is lost across network failures or
//! process restarts.
//!
//! ## Entry lifecycle
//!
//! ```text
//!            enqueue
//!               │
//!               ▼
//!   ┌──────► pending ──claim/drain──► sending ──mark_synced──► synced
//!   │           ▲                        │
//!   │           └──mark_failed(Transient)┘
//!   │                                    │
//!   └──────requeue─── failed ◄──mark_failed(Rejected)
//! ```
//!
//! - Network failures put the entry back to `pending`; the next connectivity
//!   signal retries it.
//! - Explicit server rejections (blocked sender, validation) park the entry in
//!   `failed`. It is never retried automatically and never dropped; the user
//!   retries it by hand through [`LocalOutbox::requeue`].
//! - `claim` is an atomic `pending → sending` transition, so a drain triggered
//!   by connectivity and a direct send of the same entry cannot both transmit.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use message_outbox::{LocalOutbox, NewOutboxEntry, SqliteOutboxRepository};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let repository = SqliteOutboxRepository::connect("sqlite://outbox.db?mode=rwc").await?;
//! let outbox = LocalOutbox::new(Arc::new(repository));
//!
//! // After a crash, anything left mid-send becomes pending again.
//! outbox.recover_in_flight().await?;
//!
//! let entry = outbox
//!     .enqueue(NewOutboxEntry::new(
//!         "chat-1",
//!         "nonce-1",
//!         serde_json::json!({ "content": "hi" }),
//!     ))
//!     .await?;
//!
//! for entry in outbox.drain_pending().await? {
//!     // send entry.payload, then mark_synced / mark_failed
//!     let _ = entry;
//! }
//! # let _ = entry;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

mod error;
mod memory;
pub mod metrics;
mod sqlite;

pub use error::{OutboxError, OutboxResult};
pub use memory::MemoryOutboxRepository;
pub use sqlite::SqliteOutboxRepository;

/// Prefix that marks an identifier as client-generated and provisional.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Generate a fresh provisional identifier.
pub fn new_local_id() -> String {
    format!("{}{}", LOCAL_ID_PREFIX, Uuid::new_v4())
}

/// Returns true when the identifier was generated on this device.
pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

/// Delivery state of an outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Waiting to be sent (initial state, and after a network failure)
    Pending,
    /// Claimed by a sender, request in flight
    Sending,
    /// Confirmed by the server
    #[default]
    Synced,
    /// Rejected by the server; waits for a manual retry
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Sending => "sending",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = OutboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "sending" => Ok(SyncStatus::Sending),
            "synced" => Ok(SyncStatus::Synced),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(OutboxError::Other(anyhow::anyhow!(
                "unknown sync status: {other}"
            ))),
        }
    }
}

/// Why a send attempt did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network-level failure; the entry goes back to `pending`
    Transient,
    /// Explicit business rejection; the entry stays `failed`
    Rejected,
}

/// A message waiting in the outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Client-generated provisional identifier (`local-<uuid>`)
    pub local_id: String,

    /// Conversation this message belongs to
    pub chat_id: String,

    /// Opaque token echoed back by the server, used for deduplication
    pub client_nonce: String,

    /// Serialized outgoing message
    pub payload: serde_json::Value,

    pub sync_status: SyncStatus,

    /// Number of failed send attempts
    pub retry_count: i32,

    /// Last error message from a failed send attempt
    pub last_error: Option<String>,

    /// Server-assigned id once the send is confirmed
    pub confirmed_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for [`LocalOutbox::enqueue`].
#[derive(Debug, Clone)]
pub struct NewOutboxEntry {
    /// Provisional id; generated when absent
    pub local_id: Option<String>,
    pub chat_id: String,
    pub client_nonce: String,
    pub payload: serde_json::Value,
}

impl NewOutboxEntry {
    pub fn new(
        chat_id: impl Into<String>,
        client_nonce: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            local_id: None,
            chat_id: chat_id.into(),
            client_nonce: client_nonce.into(),
            payload,
        }
    }

    pub fn with_local_id(mut self, local_id: impl Into<String>) -> Self {
        self.local_id = Some(local_id.into());
        self
    }
}

/// Storage contract for outbox entries.
///
/// Every method is a single atomic write or read of one entry (or, for
/// `claim_pending`, one atomic statement over the pending set); a concurrent
/// drain never observes a half-written entry.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Insert a new entry in `pending` state.
    async fn insert(&self, entry: &OutboxEntry) -> OutboxResult<()>;

    /// Fetch one entry by local id.
    async fn get(&self, local_id: &str) -> OutboxResult<Option<OutboxEntry>>;

    /// Atomically move one entry from `pending` to `sending`.
    ///
    /// Returns `None` when the entry is not pending.
    async fn claim(&self, local_id: &str) -> OutboxResult<Option<OutboxEntry>>;

    /// Atomically move every `pending` entry to `sending`.
    ///
    /// Returned entries are ordered oldest first.
    async fn claim_pending(&self) -> OutboxResult<Vec<OutboxEntry>>;

    /// Record a server confirmation. Idempotent.
    async fn mark_synced(&self, local_id: &str, confirmed_id: Option<&str>) -> OutboxResult<()>;

    /// Record a failed attempt and move the entry to `status`.
    async fn mark_failed(&self, local_id: &str, status: SyncStatus, error: &str)
        -> OutboxResult<()>;

    /// Move a `failed` entry back to `pending`. Returns false if it was not failed.
    async fn requeue(&self, local_id: &str) -> OutboxResult<bool>;

    /// Move every `sending` entry back to `pending`. Returns affected count.
    async fn reset_in_flight(&self) -> OutboxResult<u64>;

    /// List entries in the given status, oldest first.
    async fn list(&self, status: SyncStatus) -> OutboxResult<Vec<OutboxEntry>>;

    /// Every entry not yet synced, in insertion order.
    async fn list_unconfirmed(&self) -> OutboxResult<Vec<OutboxEntry>>;

    /// Pending count and age of the oldest pending entry in seconds (0 if none).
    async fn pending_stats(&self) -> OutboxResult<(i64, i64)>;

    /// Delete synced entries last updated before `before`. Returns deleted count.
    async fn purge_synced(&self, before: DateTime<Utc>) -> OutboxResult<u64>;
}

/// Front door to the outbox used by the sync engine.
///
/// Cheap to clone; all clones share the same repository.
#[derive(Clone)]
pub struct LocalOutbox {
    repository: Arc<dyn OutboxRepository>,
    metrics: Option<crate::metrics::OutboxMetrics>,
}

impl LocalOutbox {
    pub fn new(repository: Arc<dyn OutboxRepository>) -> Self {
        Self {
            repository,
            metrics: None,
        }
    }

    /// Create an outbox that also updates Prometheus metrics.
    pub fn new_with_metrics(
        repository: Arc<dyn OutboxRepository>,
        metrics: crate::metrics::OutboxMetrics,
    ) -> Self {
        Self {
            repository,
            metrics: Some(metrics),
        }
    }

    /// Persist a new outgoing message with `pending` status.
    pub async fn enqueue(&self, new_entry: NewOutboxEntry) -> OutboxResult<OutboxEntry> {
        let now = Utc::now();
        let entry = OutboxEntry {
            local_id: new_entry.local_id.unwrap_or_else(new_local_id),
            chat_id: new_entry.chat_id,
            client_nonce: new_entry.client_nonce,
            payload: new_entry.payload,
            sync_status: SyncStatus::Pending,
            retry_count: 0,
            last_error: None,
            confirmed_id: None,
            created_at: now,
            updated_at: now,
        };

        self.repository.insert(&entry).await?;
        self.refresh_pending_gauge().await;

        debug!(
            local_id = %entry.local_id,
            chat_id = %entry.chat_id,
            "Message enqueued in outbox"
        );

        Ok(entry)
    }

    /// Claim a single entry for sending.
    pub async fn claim(&self, local_id: &str) -> OutboxResult<Option<OutboxEntry>> {
        self.repository.claim(local_id).await
    }

    /// Claim every pending entry, oldest first. Called when connectivity returns.
    pub async fn drain_pending(&self) -> OutboxResult<Vec<OutboxEntry>> {
        let entries = self.repository.claim_pending().await?;
        if !entries.is_empty() {
            info!(count = entries.len(), "Draining pending outbox entries");
        }
        Ok(entries)
    }

    pub async fn mark_synced(&self, local_id: &str, confirmed_id: Option<&str>) -> OutboxResult<()> {
        self.repository.mark_synced(local_id, confirmed_id).await?;

        if let Some(metrics) = &self.metrics {
            metrics.synced.inc();
        }
        self.refresh_pending_gauge().await;

        debug!(local_id = %local_id, confirmed_id = ?confirmed_id, "Outbox entry synced");
        Ok(())
    }

    /// Record a failed send.
    ///
    /// A transient failure returns the entry to `pending`; a rejection leaves it
    /// `failed` until [`requeue`](Self::requeue) is called.
    pub async fn mark_failed(
        &self,
        local_id: &str,
        kind: FailureKind,
        error: &str,
    ) -> OutboxResult<()> {
        let status = match kind {
            FailureKind::Transient => SyncStatus::Pending,
            FailureKind::Rejected => SyncStatus::Failed,
        };

        self.repository.mark_failed(local_id, status, error).await?;

        if let Some(metrics) = &self.metrics {
            match kind {
                FailureKind::Transient => metrics.retried.inc(),
                FailureKind::Rejected => metrics.failed.inc(),
            }
        }
        self.refresh_pending_gauge().await;

        warn!(
            local_id = %local_id,
            status = %status,
            error = %error,
            "Outbox send failed"
        );
        Ok(())
    }

    /// Manual retry of a rejected entry.
    pub async fn requeue(&self, local_id: &str) -> OutboxResult<()> {
        if self.repository.requeue(local_id).await? {
            self.refresh_pending_gauge().await;
            info!(local_id = %local_id, "Outbox entry requeued");
            return Ok(());
        }

        match self.repository.get(local_id).await? {
            Some(entry) => Err(OutboxError::InvalidTransition {
                local_id: local_id.to_string(),
                from: entry.sync_status.to_string(),
                to: SyncStatus::Pending.to_string(),
            }),
            None => Err(OutboxError::EntryNotFound(local_id.to_string())),
        }
    }

    /// Return entries stuck in `sending` (after a crash) to `pending`.
    pub async fn recover_in_flight(&self) -> OutboxResult<u64> {
        let recovered = self.repository.reset_in_flight().await?;
        if recovered > 0 {
            info!(recovered, "Recovered in-flight outbox entries");
        }
        self.refresh_pending_gauge().await;
        Ok(recovered)
    }

    pub async fn get(&self, local_id: &str) -> OutboxResult<Option<OutboxEntry>> {
        self.repository.get(local_id).await
    }

    pub async fn list(&self, status: SyncStatus) -> OutboxResult<Vec<OutboxEntry>> {
        self.repository.list(status).await
    }

    /// Entries the user still sees as unsent: pending, sending and failed, oldest first.
    pub async fn unconfirmed(&self) -> OutboxResult<Vec<OutboxEntry>> {
        self.repository.list_unconfirmed().await
    }

    pub async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
        self.repository.pending_stats().await
    }

    pub async fn purge_synced(&self, before: DateTime<Utc>) -> OutboxResult<u64> {
        self.repository.purge_synced(before).await
    }

    async fn refresh_pending_gauge(&self) {
        if let Some(metrics) = &self.metrics {
            if let Ok((pending, _age)) = self.repository.pending_stats().await {
                metrics.pending.set(pending);
            }
        }
    }
}

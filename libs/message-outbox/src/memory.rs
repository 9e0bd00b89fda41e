use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::{OutboxEntry, OutboxError, OutboxRepository, OutboxResult, SyncStatus};

/// In-process outbox repository.
///
/// Entries are kept in insertion order behind a single mutex, so each
/// operation is atomic with respect to the others. Nothing survives a restart;
/// use [`SqliteOutboxRepository`](crate::SqliteOutboxRepository) for that.
#[derive(Default)]
pub struct MemoryOutboxRepository {
    entries: Mutex<Vec<OutboxEntry>>,
}

impl MemoryOutboxRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OutboxRepository for MemoryOutboxRepository {
    async fn insert(&self, entry: &OutboxEntry) -> OutboxResult<()> {
        let mut entries = self.entries.lock();
        if entries.iter().any(|e| e.local_id == entry.local_id) {
            return Err(OutboxError::Other(anyhow::anyhow!(
                "duplicate outbox entry: {}",
                entry.local_id
            )));
        }
        entries.push(entry.clone());
        Ok(())
    }

    async fn get(&self, local_id: &str) -> OutboxResult<Option<OutboxEntry>> {
        Ok(self
            .entries
            .lock()
            .iter()
            .find(|e| e.local_id == local_id)
            .cloned())
    }

    async fn claim(&self, local_id: &str) -> OutboxResult<Option<OutboxEntry>> {
        let mut entries = self.entries.lock();
        let claimed = entries
            .iter_mut()
            .find(|e| e.local_id == local_id && e.sync_status == SyncStatus::Pending)
            .map(|entry| {
                entry.sync_status = SyncStatus::Sending;
                entry.updated_at = Utc::now();
                entry.clone()
            });
        Ok(claimed)
    }

    async fn claim_pending(&self) -> OutboxResult<Vec<OutboxEntry>> {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        Ok(entries
            .iter_mut()
            .filter(|e| e.sync_status == SyncStatus::Pending)
            .map(|entry| {
                entry.sync_status = SyncStatus::Sending;
                entry.updated_at = now;
                entry.clone()
            })
            .collect())
    }

    async fn mark_synced(&self, local_id: &str, confirmed_id: Option<&str>) -> OutboxResult<()> {
        let mut entries = self.entries.lock();
        let entry = entries
            .iter_mut()
            .find(|e| e.local_id == local_id)
            .ok_or_else(|| OutboxError::EntryNotFound(local_id.to_string()))?;

        entry.sync_status = SyncStatus::Synced;
        entry.last_error = None;
        if confirmed_id.is_some() {
            entry.confirmed_id = confirmed_id.map(str::to_string);
        }
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_failed(
        &self,
        local_id: &str,
        status: SyncStatus,
        error: &str,
    ) -> OutboxResult<()> {
        let mut entries = self.entries.lock();
        let entry = entries
            .iter_mut()
            .find(|e| e.local_id == local_id)
            .ok_or_else(|| OutboxError::EntryNotFound(local_id.to_string()))?;

        if entry.sync_status == SyncStatus::Synced {
            debug!(local_id = %local_id, "Ignoring failure for already synced entry");
            return Ok(());
        }

        entry.sync_status = status;
        entry.retry_count += 1;
        entry.last_error = Some(error.to_string());
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn requeue(&self, local_id: &str) -> OutboxResult<bool> {
        let mut entries = self.entries.lock();
        match entries
            .iter_mut()
            .find(|e| e.local_id == local_id && e.sync_status == SyncStatus::Failed)
        {
            Some(entry) => {
                entry.sync_status = SyncStatus::Pending;
                entry.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn reset_in_flight(&self) -> OutboxResult<u64> {
        let mut entries = self.entries.lock();
        let mut reset = 0;
        for entry in entries
            .iter_mut()
            .filter(|e| e.sync_status == SyncStatus::Sending)
        {
            entry.sync_status = SyncStatus::Pending;
            reset += 1;
        }
        Ok(reset)
    }

    async fn list(&self, status: SyncStatus) -> OutboxResult<Vec<OutboxEntry>> {
        Ok(self
            .entries
            .lock()
            .iter()
            .filter(|e| e.sync_status == status)
            .cloned()
            .collect())
    }

    async fn list_unconfirmed(&self) -> OutboxResult<Vec<OutboxEntry>> {
        Ok(self
            .entries
            .lock()
            .iter()
            .filter(|e| e.sync_status != SyncStatus::Synced)
            .cloned()
            .collect())
    }

    async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
        let entries = self.entries.lock();
        let pending: Vec<_> = entries
            .iter()
            .filter(|e| e.sync_status == SyncStatus::Pending)
            .collect();

        let age = pending
            .iter()
            .map(|e| e.created_at)
            .min()
            .map(|oldest| (Utc::now() - oldest).num_seconds().max(0))
            .unwrap_or(0);

        Ok((pending.len() as i64, age))
    }

    async fn purge_synced(&self, before: DateTime<Utc>) -> OutboxResult<u64> {
        let mut entries = self.entries.lock();
        let len_before = entries.len();
        entries.retain(|e| !(e.sync_status == SyncStatus::Synced && e.updated_at < before));
        Ok((len_before - entries.len()) as u64)
    }
}

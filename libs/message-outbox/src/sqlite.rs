use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, warn};

use crate::{OutboxEntry, OutboxError, OutboxRepository, OutboxResult, SyncStatus};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS outbox_entries (
    seq           INTEGER PRIMARY KEY AUTOINCREMENT,
    local_id      TEXT    NOT NULL UNIQUE,
    chat_id       TEXT    NOT NULL,
    client_nonce  TEXT    NOT NULL,
    payload       TEXT    NOT NULL,
    sync_status   TEXT    NOT NULL,
    retry_count   INTEGER NOT NULL DEFAULT 0,
    last_error    TEXT,
    confirmed_id  TEXT,
    created_at    INTEGER NOT NULL,
    updated_at    INTEGER NOT NULL
)
"#;

const CREATE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_outbox_entries_status_seq
    ON outbox_entries (sync_status, seq);
"#;

const COLUMNS: &str = "local_id, chat_id, client_nonce, payload, sync_status, retry_count, \
                       last_error, confirmed_id, created_at, updated_at";

/// SQLite-backed outbox repository.
///
/// The outbox lives in the device's local database so queued messages survive
/// restarts. Each state change is a single statement, which SQLite executes
/// atomically.
pub struct SqliteOutboxRepository {
    pool: SqlitePool,
}

impl SqliteOutboxRepository {
    /// Open (or create) the outbox database and make sure the schema exists.
    ///
    /// In-memory databases are limited to one connection, since every
    /// connection to `sqlite::memory:` opens a separate database.
    pub async fn connect(database_url: &str) -> OutboxResult<Self> {
        let max_connections = if database_url.contains(":memory:") { 1 } else { 4 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .with_context(|| format!("Failed to open outbox database {database_url}"))?;

        let repository = Self::new(pool);
        repository.ensure_schema().await?;
        Ok(repository)
    }

    /// Wrap an existing pool. Call [`ensure_schema`](Self::ensure_schema) before use.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> OutboxResult<()> {
        for statement in [CREATE_TABLE, CREATE_INDEX] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to create outbox schema")?;
        }
        Ok(())
    }

    async fn exists(&self, local_id: &str) -> OutboxResult<bool> {
        let row = sqlx::query("SELECT 1 FROM outbox_entries WHERE local_id = ?")
            .bind(local_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to look up outbox entry")?;
        Ok(row.is_some())
    }
}

fn millis_to_datetime(ms: i64) -> OutboxResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| OutboxError::Other(anyhow::anyhow!("invalid timestamp: {ms}")))
}

fn row_to_entry(row: &SqliteRow) -> OutboxResult<OutboxEntry> {
    let payload: String = row.try_get("payload")?;
    let status: String = row.try_get("sync_status")?;
    let retry_count: i64 = row.try_get("retry_count")?;

    Ok(OutboxEntry {
        local_id: row.try_get("local_id")?,
        chat_id: row.try_get("chat_id")?,
        client_nonce: row.try_get("client_nonce")?,
        payload: serde_json::from_str(&payload)?,
        sync_status: status.parse()?,
        retry_count: retry_count as i32,
        last_error: row.try_get("last_error")?,
        confirmed_id: row.try_get("confirmed_id")?,
        created_at: millis_to_datetime(row.try_get("created_at")?)?,
        updated_at: millis_to_datetime(row.try_get("updated_at")?)?,
    })
}

#[async_trait]
impl OutboxRepository for SqliteOutboxRepository {
    async fn insert(&self, entry: &OutboxEntry) -> OutboxResult<()> {
        let payload = serde_json::to_string(&entry.payload)?;

        sqlx::query(
            r#"
            INSERT INTO outbox_entries (
                local_id,
                chat_id,
                client_nonce,
                payload,
                sync_status,
                retry_count,
                last_error,
                confirmed_id,
                created_at,
                updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.local_id)
        .bind(&entry.chat_id)
        .bind(&entry.client_nonce)
        .bind(payload)
        .bind(entry.sync_status.as_str())
        .bind(entry.retry_count as i64)
        .bind(&entry.last_error)
        .bind(&entry.confirmed_id)
        .bind(entry.created_at.timestamp_millis())
        .bind(entry.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to insert entry into outbox")?;

        debug!(local_id = %entry.local_id, "Outbox entry inserted");
        Ok(())
    }

    async fn get(&self, local_id: &str) -> OutboxResult<Option<OutboxEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM outbox_entries WHERE local_id = ?"
        ))
        .bind(local_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch outbox entry")?;

        row.as_ref().map(row_to_entry).transpose()
    }

    async fn claim(&self, local_id: &str) -> OutboxResult<Option<OutboxEntry>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE outbox_entries
            SET sync_status = 'sending', updated_at = ?
            WHERE local_id = ? AND sync_status = 'pending'
            RETURNING {COLUMNS}
            "#
        ))
        .bind(Utc::now().timestamp_millis())
        .bind(local_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to claim outbox entry")?;

        row.as_ref().map(row_to_entry).transpose()
    }

    async fn claim_pending(&self) -> OutboxResult<Vec<OutboxEntry>> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE outbox_entries
            SET sync_status = 'sending', updated_at = ?
            WHERE sync_status = 'pending'
            RETURNING seq, {COLUMNS}
            "#
        ))
        .bind(Utc::now().timestamp_millis())
        .fetch_all(&self.pool)
        .await
        .context("Failed to claim pending outbox entries")?;

        // RETURNING does not guarantee row order
        let mut claimed = rows
            .iter()
            .map(|row| Ok((row.try_get::<i64, _>("seq")?, row_to_entry(row)?)))
            .collect::<OutboxResult<Vec<_>>>()?;
        claimed.sort_by_key(|(seq, _)| *seq);

        debug!(count = claimed.len(), "Claimed pending outbox entries");
        Ok(claimed.into_iter().map(|(_, entry)| entry).collect())
    }

    async fn mark_synced(&self, local_id: &str, confirmed_id: Option<&str>) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_entries
            SET sync_status = 'synced',
                confirmed_id = COALESCE(?, confirmed_id),
                last_error = NULL,
                updated_at = ?
            WHERE local_id = ?
            "#,
        )
        .bind(confirmed_id)
        .bind(Utc::now().timestamp_millis())
        .bind(local_id)
        .execute(&self.pool)
        .await
        .context("Failed to mark outbox entry as synced")?;

        if result.rows_affected() == 0 {
            warn!(local_id = %local_id, "Outbox entry not found when marking as synced");
            return Err(OutboxError::EntryNotFound(local_id.to_string()));
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        local_id: &str,
        status: SyncStatus,
        error: &str,
    ) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_entries
            SET sync_status = ?,
                retry_count = retry_count + 1,
                last_error = ?,
                updated_at = ?
            WHERE local_id = ? AND sync_status != 'synced'
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now().timestamp_millis())
        .bind(local_id)
        .execute(&self.pool)
        .await
        .context("Failed to mark outbox entry as failed")?;

        if result.rows_affected() == 0 {
            if self.exists(local_id).await? {
                debug!(local_id = %local_id, "Ignoring failure for already synced entry");
                return Ok(());
            }
            warn!(local_id = %local_id, "Outbox entry not found when marking as failed");
            return Err(OutboxError::EntryNotFound(local_id.to_string()));
        }
        Ok(())
    }

    async fn requeue(&self, local_id: &str) -> OutboxResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_entries
            SET sync_status = 'pending', updated_at = ?
            WHERE local_id = ? AND sync_status = 'failed'
            "#,
        )
        .bind(Utc::now().timestamp_millis())
        .bind(local_id)
        .execute(&self.pool)
        .await
        .context("Failed to requeue outbox entry")?;

        Ok(result.rows_affected() > 0)
    }

    async fn reset_in_flight(&self) -> OutboxResult<u64> {
        let result = sqlx::query(
            "UPDATE outbox_entries SET sync_status = 'pending' WHERE sync_status = 'sending'",
        )
        .execute(&self.pool)
        .await
        .context("Failed to reset in-flight outbox entries")?;

        Ok(result.rows_affected())
    }

    async fn list(&self, status: SyncStatus) -> OutboxResult<Vec<OutboxEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM outbox_entries WHERE sync_status = ? ORDER BY seq ASC"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list outbox entries")?;

        rows.iter().map(row_to_entry).collect()
    }

    async fn list_unconfirmed(&self) -> OutboxResult<Vec<OutboxEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM outbox_entries WHERE sync_status != 'synced' ORDER BY seq ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list unconfirmed outbox entries")?;

        rows.iter().map(row_to_entry).collect()
    }

    async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS pending, MIN(created_at) AS oldest
            FROM outbox_entries
            WHERE sync_status = 'pending'
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to compute pending stats")?;

        let pending: i64 = row.try_get("pending").unwrap_or(0);
        let oldest: Option<i64> = row.try_get("oldest").unwrap_or(None);
        let age = oldest
            .map(|ms| ((Utc::now().timestamp_millis() - ms) / 1000).max(0))
            .unwrap_or(0);

        Ok((pending, age))
    }

    async fn purge_synced(&self, before: DateTime<Utc>) -> OutboxResult<u64> {
        let result = sqlx::query(
            "DELETE FROM outbox_entries WHERE sync_status = 'synced' AND updated_at < ?",
        )
        .bind(before.timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to purge synced outbox entries")?;

        Ok(result.rows_affected())
    }
}

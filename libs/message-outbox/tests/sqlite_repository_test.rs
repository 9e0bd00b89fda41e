//! Integration tests for the SQLite outbox repository.
//!
//! These run against an in-memory SQLite database, so no external services are
//! needed:
//! ```bash
//! cargo test --package message-outbox --test sqlite_repository_test
//! ```

use chrono::{Duration, Utc};
use message_outbox::{
    FailureKind, LocalOutbox, NewOutboxEntry, OutboxEntry, OutboxRepository,
    SqliteOutboxRepository, SyncStatus,
};
use serde_json::json;
use std::sync::Arc;

/// Helper function to create a fresh outbox on an in-memory database
async fn create_test_outbox() -> (LocalOutbox, Arc<SqliteOutboxRepository>) {
    let repository = Arc::new(
        SqliteOutboxRepository::connect("sqlite::memory:")
            .await
            .expect("Failed to open in-memory outbox"),
    );
    (LocalOutbox::new(repository.clone()), repository)
}

/// Helper function to enqueue a text message
async fn enqueue_text(outbox: &LocalOutbox, nonce: &str, content: &str) -> String {
    outbox
        .enqueue(NewOutboxEntry::new(
            "chat-1",
            nonce,
            json!({ "content": content, "type": "text", "clientNonce": nonce }),
        ))
        .await
        .expect("Failed to enqueue")
        .local_id
}

#[tokio::test]
async fn test_enqueue_persists_payload() {
    let (outbox, _) = create_test_outbox().await;
    let local_id = enqueue_text(&outbox, "nonce-1", "hi").await;

    let stored = outbox.get(&local_id).await.unwrap().expect("entry exists");
    assert_eq!(stored.sync_status, SyncStatus::Pending);
    assert_eq!(stored.client_nonce, "nonce-1");
    assert_eq!(stored.payload["content"], "hi");
}

#[tokio::test]
async fn test_drain_pending_is_fifo_and_claims_entries() {
    let (outbox, _) = create_test_outbox().await;
    let first = enqueue_text(&outbox, "n1", "first").await;
    let second = enqueue_text(&outbox, "n2", "second").await;
    let third = enqueue_text(&outbox, "n3", "third").await;

    let drained: Vec<_> = outbox
        .drain_pending()
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.local_id)
        .collect();
    assert_eq!(drained, vec![first, second, third]);

    // A concurrent drain sees nothing: everything is already claimed
    assert!(outbox.drain_pending().await.unwrap().is_empty());
    assert_eq!(outbox.list(SyncStatus::Sending).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_claim_is_exclusive() {
    let (outbox, _) = create_test_outbox().await;
    let local_id = enqueue_text(&outbox, "n1", "hi").await;

    assert!(outbox.claim(&local_id).await.unwrap().is_some());
    assert!(outbox.claim(&local_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_network_failure_keeps_entry_for_retry() {
    let (outbox, _) = create_test_outbox().await;
    let local_id = enqueue_text(&outbox, "n1", "hi").await;
    outbox.claim(&local_id).await.unwrap();

    outbox
        .mark_failed(&local_id, FailureKind::Transient, "timeout")
        .await
        .unwrap();

    let stored = outbox.get(&local_id).await.unwrap().unwrap();
    assert_eq!(stored.sync_status, SyncStatus::Pending);
    assert_eq!(stored.retry_count, 1);
    assert_eq!(stored.last_error.as_deref(), Some("timeout"));

    let (pending, _age) = outbox.pending_stats().await.unwrap();
    assert_eq!(pending, 1);
}

#[tokio::test]
async fn test_mark_synced_records_confirmed_id_and_wins_over_late_failure() {
    let (outbox, _) = create_test_outbox().await;
    let local_id = enqueue_text(&outbox, "n1", "hi").await;
    outbox.claim(&local_id).await.unwrap();

    outbox.mark_synced(&local_id, Some("abc123")).await.unwrap();
    // Idempotent
    outbox.mark_synced(&local_id, None).await.unwrap();
    // A late failure report must not regress a confirmed entry
    outbox
        .mark_failed(&local_id, FailureKind::Transient, "late timeout")
        .await
        .unwrap();

    let stored = outbox.get(&local_id).await.unwrap().unwrap();
    assert_eq!(stored.sync_status, SyncStatus::Synced);
    assert_eq!(stored.confirmed_id.as_deref(), Some("abc123"));
    assert_eq!(stored.retry_count, 0);
}

#[tokio::test]
async fn test_rejected_entry_waits_for_requeue() {
    let (outbox, _) = create_test_outbox().await;
    let local_id = enqueue_text(&outbox, "n1", "hi").await;
    outbox.claim(&local_id).await.unwrap();
    outbox
        .mark_failed(&local_id, FailureKind::Rejected, "blocked user")
        .await
        .unwrap();

    assert!(outbox.drain_pending().await.unwrap().is_empty());

    outbox.requeue(&local_id).await.unwrap();
    let drained = outbox.drain_pending().await.unwrap();
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].retry_count, 1);
}

#[tokio::test]
async fn test_recover_in_flight_after_restart() {
    let (outbox, _) = create_test_outbox().await;
    enqueue_text(&outbox, "n1", "a").await;
    enqueue_text(&outbox, "n2", "b").await;
    outbox.drain_pending().await.unwrap();

    assert_eq!(outbox.recover_in_flight().await.unwrap(), 2);
    assert_eq!(outbox.list(SyncStatus::Pending).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_purge_synced_only_removes_old_synced_entries() {
    let (outbox, repository) = create_test_outbox().await;
    let synced = enqueue_text(&outbox, "n1", "a").await;
    let pending = enqueue_text(&outbox, "n2", "b").await;
    outbox.mark_synced(&synced, Some("srv-1")).await.unwrap();

    let purged = repository
        .purge_synced(Utc::now() + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(purged, 1);
    assert!(outbox.get(&synced).await.unwrap().is_none());
    assert!(outbox.get(&pending).await.unwrap().is_some());
}

#[tokio::test]
async fn test_unknown_entry_errors() {
    let (outbox, _) = create_test_outbox().await;
    assert!(outbox.mark_synced("local-missing", None).await.is_err());
    assert!(outbox
        .mark_failed("local-missing", FailureKind::Transient, "x")
        .await
        .is_err());
}

fn entry_at(local_id: &str, status: SyncStatus, at: chrono::DateTime<Utc>) -> OutboxEntry {
    OutboxEntry {
        local_id: local_id.to_string(),
        chat_id: "chat-1".to_string(),
        client_nonce: format!("nonce-{local_id}"),
        payload: json!({ "content": local_id }),
        sync_status: status,
        retry_count: 0,
        last_error: None,
        confirmed_id: None,
        created_at: at,
        updated_at: at,
    }
}

#[tokio::test]
async fn test_unconfirmed_keeps_queue_order_within_same_millisecond() {
    let (outbox, repository) = create_test_outbox().await;
    let at = Utc::now();

    // Same creation instant, statuses deliberately out of status-group order
    for (local_id, status) in [
        ("local-1", SyncStatus::Failed),
        ("local-2", SyncStatus::Synced),
        ("local-3", SyncStatus::Sending),
        ("local-4", SyncStatus::Pending),
        ("local-5", SyncStatus::Failed),
    ] {
        repository.insert(&entry_at(local_id, status, at)).await.unwrap();
    }

    let ids: Vec<_> = outbox
        .unconfirmed()
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.local_id)
        .collect();
    assert_eq!(ids, vec!["local-1", "local-3", "local-4", "local-5"]);
}

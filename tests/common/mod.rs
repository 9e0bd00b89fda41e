//! Shared test doubles for engine integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use message_outbox::{LocalOutbox, MemoryOutboxRepository};
use message_sync::{
    FetchedPage, InMemoryMessageStore, MessageTransport, SyncConfig, SyncDeps, SyncError,
    SyncHandle, SyncResult,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{oneshot, Notify};

pub const CHAT: &str = "chat-1";
pub const ME: &str = "me";
pub const PEER: &str = "peer";

const BASE_TS: i64 = 1_700_000_000_000;

/// A server message as the message API returns it.
pub fn server_message(id: &str, sender: &str, content: &str, ts_ms: i64) -> Value {
    json!({
        "_id": id,
        "id": id,
        "chat": CHAT,
        "sender": { "_id": sender, "username": sender },
        "type": "text",
        "content": content,
        "createdAt": Utc.timestamp_millis_opt(ts_ms).unwrap().to_rfc3339(),
        "reactions": [],
        "isRead": false,
    })
}

/// In-process stand-in for the message API.
///
/// Holds the conversation oldest first and pages it newest first, like the
/// real endpoint.
pub struct MockServer {
    messages: Mutex<Vec<Value>>,
    online: AtomicBool,
    reject_sends: AtomicBool,
    echo_nonce: AtomicBool,
    next_ids: Mutex<VecDeque<String>>,
    clock: AtomicI64,
    id_seq: AtomicUsize,
    pub fetch_calls: AtomicUsize,
    pub send_calls: AtomicUsize,
    pub sent_payloads: Mutex<Vec<Value>>,
    fetch_gate: Mutex<Option<oneshot::Receiver<()>>>,
    pub fetch_started: Notify,
}

impl MockServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            messages: Mutex::new(Vec::new()),
            online: AtomicBool::new(true),
            reject_sends: AtomicBool::new(false),
            echo_nonce: AtomicBool::new(true),
            next_ids: Mutex::new(VecDeque::new()),
            clock: AtomicI64::new(BASE_TS),
            id_seq: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            send_calls: AtomicUsize::new(0),
            sent_payloads: Mutex::new(Vec::new()),
            fetch_gate: Mutex::new(None),
            fetch_started: Notify::new(),
        })
    }

    /// Server with `count` messages from the peer, ids `m1..=m{count}`.
    pub fn with_history(count: usize) -> Arc<Self> {
        let server = Self::new();
        for i in 1..=count {
            server.add_message(&format!("m{i}"), PEER, &format!("message {i}"));
        }
        server
    }

    fn tick(&self) -> i64 {
        self.clock.fetch_add(1000, Ordering::SeqCst) + 1000
    }

    /// Append a message to the conversation and return its wire form.
    pub fn add_message(&self, id: &str, sender: &str, content: &str) -> Value {
        let message = server_message(id, sender, content, self.tick());
        self.messages.lock().push(message.clone());
        message
    }

    pub fn replace_history(&self, messages: Vec<Value>) {
        *self.messages.lock() = messages;
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn set_reject_sends(&self, reject: bool) {
        self.reject_sends.store(reject, Ordering::SeqCst);
    }

    pub fn set_echo_nonce(&self, echo: bool) {
        self.echo_nonce.store(echo, Ordering::SeqCst);
    }

    /// Ids handed out to the next accepted sends, in order.
    pub fn queue_ids(&self, ids: &[&str]) {
        self.next_ids
            .lock()
            .extend(ids.iter().map(|id| id.to_string()));
    }

    /// Hold the next fetch until the returned sender fires or is dropped.
    /// The held fetch answers with the history as it was when it started.
    pub fn hold_next_fetch(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.fetch_gate.lock() = Some(rx);
        tx
    }

    fn page(&self, page: u32, page_size: u32) -> Vec<Value> {
        let messages = self.messages.lock();
        let total = messages.len();
        let skip = (page.saturating_sub(1) * page_size) as usize;
        let end = total.saturating_sub(skip);
        let start = end.saturating_sub(page_size as usize);
        messages[start..end].to_vec()
    }
}

#[async_trait]
impl MessageTransport for MockServer {
    async fn fetch_messages(
        &self,
        chat_id: &str,
        page: u32,
        page_size: u32,
    ) -> SyncResult<FetchedPage> {
        assert_eq!(chat_id, CHAT);
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if !self.online.load(Ordering::SeqCst) {
            self.fetch_started.notify_one();
            return Err(SyncError::Network("connection refused".to_string()));
        }

        let messages = self.page(page, page_size);
        let gate = self.fetch_gate.lock().take();
        self.fetch_started.notify_one();
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        Ok(FetchedPage {
            messages,
            has_more_hint: None,
        })
    }

    async fn send_message(&self, payload: &Value) -> SyncResult<Value> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        self.sent_payloads.lock().push(payload.clone());
        if !self.online.load(Ordering::SeqCst) {
            return Err(SyncError::Network("connection refused".to_string()));
        }
        if self.reject_sends.load(Ordering::SeqCst) {
            return Err(SyncError::Rejected(
                "You cannot send messages to this user".to_string(),
            ));
        }

        let id = self.next_ids.lock().pop_front().unwrap_or_else(|| {
            format!("srv-{}", self.id_seq.fetch_add(1, Ordering::SeqCst) + 1)
        });
        let mut message = server_message(
            &id,
            ME,
            payload["content"].as_str().unwrap_or_default(),
            self.tick(),
        );
        if self.echo_nonce.load(Ordering::SeqCst) {
            if let Some(nonce) = payload.get("clientNonce") {
                message["clientNonce"] = nonce.clone();
            }
        }
        self.messages.lock().push(message.clone());
        Ok(message)
    }
}

pub struct Harness {
    pub server: Arc<MockServer>,
    pub persistence: Arc<InMemoryMessageStore>,
    pub outbox: LocalOutbox,
    pub handle: SyncHandle,
}

pub fn config() -> SyncConfig {
    SyncConfig {
        page_size: 20,
        ..SyncConfig::default()
    }
}

pub fn harness(server: Arc<MockServer>) -> Harness {
    harness_with(server, Arc::new(InMemoryMessageStore::new()))
}

pub fn harness_with(server: Arc<MockServer>, persistence: Arc<InMemoryMessageStore>) -> Harness {
    let outbox = LocalOutbox::new(Arc::new(MemoryOutboxRepository::new()));
    let deps = SyncDeps {
        transport: server.clone(),
        persistence: persistence.clone(),
        outbox: outbox.clone(),
    };
    let handle = SyncHandle::spawn(CHAT, ME, &config(), deps);
    Harness {
        server,
        persistence,
        outbox,
        handle,
    }
}

/// Ids of the store in order; provisional messages show their local id.
pub async fn keys(handle: &SyncHandle) -> Vec<String> {
    handle
        .snapshot()
        .await
        .unwrap()
        .iter()
        .map(|m| m.key().to_string())
        .collect()
}

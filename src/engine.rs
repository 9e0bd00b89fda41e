//! Single-writer sync engine.
//!
//! One actor task owns the reconciliation engine, the pagination cursor and the
//! load epoch. Every mutation arrives as a command on a bounded channel and
//! is applied in arrival order. Network calls run in spawned tasks that post
//! their result back onto the same channel, tagged with the epoch that issued
//! them; a result from an older epoch (an initial load happened meanwhile) is
//! dropped.
//!
//! Sends are not epoch-bound: their confirmation must reach the outbox even if
//! the conversation was reloaded while the request was in flight.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use message_outbox::metrics::OutboxMetrics;
use message_outbox::{
    FailureKind, LocalOutbox, NewOutboxEntry, OutboxEntry, SqliteOutboxRepository, SyncStatus,
};
use serde_json::Value as JsonValue;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::metrics;
use crate::models::{Message, MessageDraft};
use crate::pagination::{PageRequest, PageState, PaginationController, PrependDelta};
use crate::persistence::MessagePersistence;
use crate::push::{PushEvent, PushSink};
use crate::reconcile::{Origin, ReconcileOutcome, ReconciliationEngine};
use crate::store::StoreChange;
use crate::transport::{FetchedPage, HttpTransport, MessageTransport};

const VIEW_EVENT_CAPACITY: usize = 256;
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Signals for the renderer beyond per-row store changes.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewEvent {
    /// New messages arrived while the viewport was at the bottom, or the user sent one
    ScrollToBottom,
    /// New messages arrived while the user was reading history
    UnseenMessages { count: usize, offer_summary: bool },
    /// Older history was prepended
    Prepended(PrependDelta),
    SendFailed {
        local_id: String,
        reason: String,
        /// False when the server rejected the message; it waits for a manual retry
        retryable: bool,
    },
    /// The store was replaced by an initial load
    Reloaded { count: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViewState {
    pub message_count: usize,
    pub has_unseen_new_messages: bool,
    pub unseen_count: usize,
    pub at_bottom: bool,
    pub page_state: PageState,
    pub has_more: bool,
    pub current_page: u32,
    pub epoch: u64,
}

/// Collaborators injected into the engine.
#[derive(Clone)]
pub struct SyncDeps {
    pub transport: Arc<dyn MessageTransport>,
    pub persistence: Arc<dyn MessagePersistence>,
    pub outbox: LocalOutbox,
}

impl SyncDeps {
    /// Wire the HTTP transport and the SQLite outbox from configuration.
    ///
    /// Entries left `sending` by a previous process are put back to `pending`
    /// so the next connectivity signal resends them.
    pub async fn connect(
        config: &SyncConfig,
        persistence: Arc<dyn MessagePersistence>,
    ) -> anyhow::Result<Self> {
        let transport = HttpTransport::from_config(config)
            .context("Failed to build message API client")?;

        let repository = SqliteOutboxRepository::connect(&config.outbox_database_url)
            .await
            .context("Failed to open local outbox")?;
        let outbox = LocalOutbox::new_with_metrics(
            Arc::new(repository),
            OutboxMetrics::new("message-sync"),
        );

        let recovered = outbox
            .recover_in_flight()
            .await
            .context("Failed to recover in-flight outbox entries")?;
        if recovered > 0 {
            info!(recovered, "Recovered interrupted sends");
        }

        Ok(Self {
            transport: Arc::new(transport),
            persistence,
            outbox,
        })
    }
}

enum FetchKind {
    Initial(oneshot::Sender<SyncResult<usize>>),
    Refresh(oneshot::Sender<SyncResult<()>>),
    Older(oneshot::Sender<SyncResult<Option<PrependDelta>>>),
}

type SendReply = oneshot::Sender<SyncResult<Message>>;

enum Command {
    LoadInitial(oneshot::Sender<SyncResult<usize>>),
    Refresh(oneshot::Sender<SyncResult<()>>),
    LoadOlder(oneshot::Sender<SyncResult<Option<PrependDelta>>>),
    Send {
        draft: MessageDraft,
        reply: SendReply,
    },
    Retry {
        local_id: String,
        reply: SendReply,
    },
    ConnectivityRestored(oneshot::Sender<SyncResult<usize>>),
    UpdateViewport {
        first_visible: usize,
        last_visible: usize,
        reply: oneshot::Sender<bool>,
    },
    ToggleReaction {
        message_id: String,
        emoji: String,
        reply: oneshot::Sender<Option<Message>>,
    },
    Push(PushEvent),
    Snapshot(oneshot::Sender<Vec<Message>>),
    ViewState(oneshot::Sender<ViewState>),
    SubscribeChanges(oneshot::Sender<broadcast::Receiver<StoreChange>>),

    // Results posted back by network tasks
    PageFetched {
        epoch: u64,
        kind: FetchKind,
        result: SyncResult<FetchedPage>,
    },
    SendCompleted {
        entry: OutboxEntry,
        result: SyncResult<JsonValue>,
        reply: Option<SendReply>,
    },
    DrainFinished {
        count: usize,
        reply: oneshot::Sender<SyncResult<usize>>,
    },
}

/// Cloneable front door to a running sync engine.
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ViewEvent>,
}

struct SyncEngine {
    reconciler: ReconciliationEngine,
    pages: PaginationController,
    epoch: u64,
    deps: SyncDeps,
    prefetch_threshold: usize,
    summary_unread_threshold: usize,
    /// Used by network tasks to post results; weak so the engine stops once
    /// every handle is dropped
    results: mpsc::WeakSender<Command>,
    events: broadcast::Sender<ViewEvent>,
}

impl SyncHandle {
    /// Start the engine for one conversation. Must be called inside a Tokio
    /// runtime.
    pub fn spawn(
        chat_id: impl Into<String>,
        viewer_id: impl Into<String>,
        config: &SyncConfig,
        deps: SyncDeps,
    ) -> Self {
        let (commands, rx) = mpsc::channel(config.command_buffer.max(1));
        let (events, _) = broadcast::channel(VIEW_EVENT_CAPACITY);

        let engine = SyncEngine {
            reconciler: ReconciliationEngine::new(chat_id, viewer_id, config.bottom_threshold),
            pages: PaginationController::new(config.page_size),
            epoch: 0,
            deps,
            prefetch_threshold: config.prefetch_threshold,
            summary_unread_threshold: config.summary_unread_threshold,
            results: commands.downgrade(),
            events: events.clone(),
        };
        tokio::spawn(engine.run(rx));

        Self { commands, events }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> SyncResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SyncError::EngineClosed)?;
        rx.await.map_err(|_| SyncError::EngineClosed)
    }

    /// Replace the conversation with its newest page. Resolves once applied.
    ///
    /// On a network failure the store is filled from local persistence and the
    /// network error is still returned.
    pub async fn load_initial(&self) -> SyncResult<usize> {
        self.request(Command::LoadInitial).await?
    }

    /// Merge the newest page without touching the pagination cursor.
    pub async fn refresh(&self) -> SyncResult<()> {
        self.request(Command::Refresh).await?
    }

    /// Prepend the next older page. `Ok(None)` when a backfill is already
    /// running or history is exhausted.
    pub async fn load_older(&self) -> SyncResult<Option<PrependDelta>> {
        self.request(Command::LoadOlder).await?
    }

    /// Send a text message.
    pub async fn send_text(
        &self,
        content: impl Into<String>,
        reply_to: Option<String>,
    ) -> SyncResult<Message> {
        let mut draft = MessageDraft::text(content);
        draft.reply_to_id = reply_to;
        self.send(draft).await
    }

    /// Queue a message durably, echo it optimistically and send it.
    ///
    /// The provisional copy is in the store before this resolves; the returned
    /// future completes with the confirmed copy or the send error. A failed
    /// send stays visible and queued.
    pub async fn send(&self, draft: MessageDraft) -> SyncResult<Message> {
        self.request(|reply| Command::Send { draft, reply }).await?
    }

    /// Manually retry a message the server rejected.
    pub async fn retry(&self, local_id: impl Into<String>) -> SyncResult<Message> {
        let local_id = local_id.into();
        self.request(|reply| Command::Retry { local_id, reply }).await?
    }

    /// Resend every pending outbox entry, oldest first, one at a time.
    /// Resolves with the number of entries attempted once all are applied.
    pub async fn connectivity_restored(&self) -> SyncResult<usize> {
        self.request(Command::ConnectivityRestored).await?
    }

    /// Report the visible range. Returns true when older history should be
    /// prefetched.
    pub async fn update_viewport(&self, first_visible: usize, last_visible: usize) -> SyncResult<bool> {
        self.request(|reply| Command::UpdateViewport {
            first_visible,
            last_visible,
            reply,
        })
        .await
    }

    pub async fn toggle_reaction(
        &self,
        message_id: impl Into<String>,
        emoji: impl Into<String>,
    ) -> SyncResult<Option<Message>> {
        let (message_id, emoji) = (message_id.into(), emoji.into());
        self.request(|reply| Command::ToggleReaction {
            message_id,
            emoji,
            reply,
        })
        .await
    }

    pub async fn push(&self, event: PushEvent) -> SyncResult<()> {
        self.commands
            .send(Command::Push(event))
            .await
            .map_err(|_| SyncError::EngineClosed)
    }

    pub async fn snapshot(&self) -> SyncResult<Vec<Message>> {
        self.request(Command::Snapshot).await
    }

    pub async fn view_state(&self) -> SyncResult<ViewState> {
        self.request(Command::ViewState).await
    }

    pub async fn subscribe_changes(&self) -> SyncResult<broadcast::Receiver<StoreChange>> {
        self.request(Command::SubscribeChanges).await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ViewEvent> {
        self.events.subscribe()
    }

    async fn push_raw(&self, event: &str, payload: JsonValue) -> SyncResult<()> {
        match PushEvent::decode(event, payload) {
            Ok(Some(event)) => self.push(event).await,
            Ok(None) => Ok(()),
            Err(e) => {
                warn!(event = %event, error = %e, "Dropping malformed push event");
                Err(e)
            }
        }
    }
}

#[async_trait::async_trait]
impl PushSink for SyncHandle {
    async fn on_new_message(&self, payload: JsonValue) -> SyncResult<()> {
        self.push_raw(crate::push::EVENT_PRIVATE_MESSAGE, payload).await
    }

    async fn on_message_edited(&self, payload: JsonValue) -> SyncResult<()> {
        self.push_raw(crate::push::EVENT_MESSAGE_EDITED, payload).await
    }

    async fn on_message_deleted(&self, payload: JsonValue) -> SyncResult<()> {
        self.push_raw(crate::push::EVENT_MESSAGE_DELETED, payload).await
    }

    async fn on_reaction_updated(&self, payload: JsonValue) -> SyncResult<()> {
        self.push_raw(crate::push::EVENT_REACTION_UPDATED, payload).await
    }
}

/// Refresh the conversation every `interval`. Runs until the engine stops or
/// the returned handle is aborted.
///
/// A refresh waits for the previous one to be applied, so slow responses do not
/// pile up.
pub fn spawn_poller(handle: SyncHandle, interval: Duration) -> JoinHandle<()> {
    let interval = if interval.is_zero() {
        warn!(
            "Poll interval is zero, using {}ms",
            MIN_POLL_INTERVAL.as_millis()
        );
        MIN_POLL_INTERVAL
    } else {
        interval
    };

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match handle.refresh().await {
                Ok(()) => {}
                Err(SyncError::EngineClosed) => break,
                Err(e) => debug!(error = %e, "Background refresh failed"),
            }
        }
        debug!("Poller stopped");
    })
}

impl SyncEngine {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        info!(
            chat_id = %self.reconciler.chat_id(),
            viewer_id = %self.reconciler.viewer_id(),
            "Sync engine started"
        );
        while let Some(command) = rx.recv().await {
            self.handle(command).await;
        }
        info!(chat_id = %self.reconciler.chat_id(), "Sync engine stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::LoadInitial(reply) => {
                self.epoch += 1;
                let request = self.pages.reset();
                debug!(chat_id = %self.reconciler.chat_id(), epoch = self.epoch, "Initial load");
                self.spawn_fetch(request, FetchKind::Initial(reply));
            }
            Command::Refresh(reply) => {
                let request = self.pages.recent();
                self.spawn_fetch(request, FetchKind::Refresh(reply));
            }
            Command::LoadOlder(reply) => match self.pages.begin_older() {
                Some(request) => self.spawn_fetch(request, FetchKind::Older(reply)),
                None => {
                    let _ = reply.send(Ok(None));
                }
            },
            Command::Send { draft, reply } => self.handle_send(draft, reply).await,
            Command::Retry { local_id, reply } => self.handle_retry(local_id, reply).await,
            Command::ConnectivityRestored(reply) => self.handle_connectivity(reply).await,
            Command::UpdateViewport {
                first_visible,
                last_visible,
                reply,
            } => {
                self.reconciler.update_viewport(first_visible, last_visible);
                let prefetch = first_visible <= self.prefetch_threshold
                    && !self.reconciler.store().is_empty()
                    && self.pages.has_more()
                    && self.pages.state() == PageState::Idle;
                let _ = reply.send(prefetch);
            }
            Command::ToggleReaction {
                message_id,
                emoji,
                reply,
            } => {
                let updated = self.reconciler.toggle_reaction(&message_id, &emoji);
                if let Some(message) = &updated {
                    self.save(message).await;
                }
                let _ = reply.send(updated);
            }
            Command::Push(event) => self.handle_push(event).await,
            Command::Snapshot(reply) => {
                let _ = reply.send(self.reconciler.store().messages().to_vec());
            }
            Command::ViewState(reply) => {
                let _ = reply.send(self.view_state());
            }
            Command::SubscribeChanges(reply) => {
                let _ = reply.send(self.reconciler.store().subscribe());
            }
            Command::PageFetched {
                epoch,
                kind,
                result,
            } => self.handle_page(epoch, kind, result).await,
            Command::SendCompleted {
                entry,
                result,
                reply,
            } => self.handle_send_completed(entry, result, reply).await,
            Command::DrainFinished { count, reply } => {
                info!(chat_id = %self.reconciler.chat_id(), count, "Outbox drain finished");
                let _ = reply.send(Ok(count));
            }
        }
    }

    fn view_state(&self) -> ViewState {
        ViewState {
            message_count: self.reconciler.store().len(),
            has_unseen_new_messages: self.reconciler.has_unseen_new_messages(),
            unseen_count: self.reconciler.unseen_count(),
            at_bottom: self.reconciler.is_at_bottom(),
            page_state: self.pages.state(),
            has_more: self.pages.has_more(),
            current_page: self.pages.current_page(),
            epoch: self.epoch,
        }
    }

    fn emit(&self, event: ViewEvent) {
        let _ = self.events.send(event);
    }

    fn spawn_fetch(&self, request: PageRequest, kind: FetchKind) {
        let transport = self.deps.transport.clone();
        let results = self.results.clone();
        let chat_id = self.reconciler.chat_id().to_string();
        let epoch = self.epoch;

        tokio::spawn(async move {
            let result = transport
                .fetch_messages(&chat_id, request.page, request.page_size)
                .await;
            if let Some(results) = results.upgrade() {
                let _ = results
                    .send(Command::PageFetched {
                        epoch,
                        kind,
                        result,
                    })
                    .await;
            }
        });
    }

    /// Send `entries` one after another from a single task. Each result is
    /// posted back before the next request starts, so drained entries keep
    /// their queue order on the server.
    fn spawn_send(
        &self,
        entries: Vec<OutboxEntry>,
        reply: Option<SendReply>,
        drained: Option<oneshot::Sender<SyncResult<usize>>>,
    ) {
        let transport = self.deps.transport.clone();
        let results = self.results.clone();

        tokio::spawn(async move {
            let count = entries.len();
            let mut reply = reply;
            for entry in entries {
                let result = match outgoing_payload(&entry) {
                    Ok(payload) => transport.send_message(&payload).await,
                    Err(e) => Err(e),
                };
                let Some(results) = results.upgrade() else {
                    return;
                };
                let _ = results
                    .send(Command::SendCompleted {
                        entry,
                        result,
                        reply: reply.take(),
                    })
                    .await;
            }
            if let Some(reply) = drained {
                if let Some(results) = results.upgrade() {
                    let _ = results.send(Command::DrainFinished { count, reply }).await;
                }
            }
        });
    }

    async fn handle_page(&mut self, epoch: u64, kind: FetchKind, result: SyncResult<FetchedPage>) {
        if epoch != self.epoch {
            metrics::record_stale_response();
            let stale = SyncError::StaleEpoch {
                response: epoch,
                current: self.epoch,
            };
            debug!(error = %stale, "Discarding stale page");
            match kind {
                FetchKind::Initial(reply) => {
                    let _ = reply.send(Err(stale));
                }
                FetchKind::Refresh(reply) => {
                    let _ = reply.send(Err(stale));
                }
                FetchKind::Older(reply) => {
                    let _ = reply.send(Err(stale));
                }
            }
            return;
        }

        let label = match kind {
            FetchKind::Initial(_) => "initial",
            FetchKind::Refresh(_) => "refresh",
            FetchKind::Older(_) => "older",
        };
        metrics::record_page(label, result.is_ok());

        match kind {
            FetchKind::Initial(reply) => {
                let _ = reply.send(self.apply_initial(result).await);
            }
            FetchKind::Refresh(reply) => {
                let outcome = result.map(|page| {
                    let batch = self.reconciler.decode_batch(&page.messages);
                    self.reconciler.apply(Origin::Refresh, batch)
                });
                let reply_result = match outcome {
                    Ok(outcome) => {
                        self.after_merge(outcome).await;
                        Ok(())
                    }
                    Err(e) => {
                        debug!(chat_id = %self.reconciler.chat_id(), error = %e, "Refresh failed, keeping last known state");
                        Err(e)
                    }
                };
                let _ = reply.send(reply_result);
            }
            FetchKind::Older(reply) => {
                let _ = reply.send(self.apply_older(result).await);
            }
        }
    }

    async fn apply_initial(&mut self, result: SyncResult<FetchedPage>) -> SyncResult<usize> {
        let outstanding = self.outstanding_sends().await;

        let (batch, network_error) = match result {
            Ok(page) => {
                self.pages
                    .initial_loaded(page.messages.len(), page.has_more_hint);
                (self.reconciler.decode_batch(&page.messages), None)
            }
            Err(e) if e.is_retryable() => {
                self.pages.fail_initial();
                warn!(
                    chat_id = %self.reconciler.chat_id(),
                    error = %e,
                    "Initial load failed, showing stored messages"
                );
                let cached: Vec<Message> = match self
                    .deps
                    .persistence
                    .get_messages_for_chat(self.reconciler.chat_id(), None)
                    .await
                {
                    Ok(messages) => messages.into_iter().filter(|m| !m.is_provisional()).collect(),
                    Err(pe) => {
                        warn!(error = %pe, "Failed to read stored messages");
                        Vec::new()
                    }
                };
                (cached, Some(e))
            }
            Err(e) => {
                self.pages.fail_initial();
                warn!(chat_id = %self.reconciler.chat_id(), error = %e, "Initial load failed");
                return Err(e);
            }
        };

        let outcome = self.reconciler.load_initial(batch, outstanding);
        let count = self.reconciler.store().len();
        if network_error.is_none() {
            self.persist_outcome(&outcome).await;
        } else {
            self.confirm_outbox(&outcome).await;
        }
        self.emit(ViewEvent::Reloaded { count });
        self.emit(ViewEvent::ScrollToBottom);

        match network_error {
            Some(e) => Err(e),
            None => Ok(count),
        }
    }

    async fn apply_older(&mut self, result: SyncResult<FetchedPage>) -> SyncResult<Option<PrependDelta>> {
        let page = match result {
            Ok(page) => page,
            Err(e) => {
                self.pages.fail_older();
                debug!(chat_id = %self.reconciler.chat_id(), error = %e, "Older page failed");
                return Err(e);
            }
        };

        let batch = self.reconciler.decode_batch(&page.messages);
        let delta = self.reconciler.prepend_older(batch);
        self.pages
            .complete_older(page.messages.len(), page.has_more_hint);

        let prepended: Vec<Message> = self
            .reconciler
            .store()
            .messages()
            .iter()
            .take(delta.prepended_count)
            .cloned()
            .collect();
        for message in &prepended {
            self.save(message).await;
        }

        info!(
            chat_id = %self.reconciler.chat_id(),
            page = self.pages.current_page(),
            prepended = delta.prepended_count,
            has_more = self.pages.has_more(),
            "Older messages loaded"
        );
        if delta.prepended_count > 0 {
            self.emit(ViewEvent::Prepended(delta));
        }
        Ok(Some(delta))
    }

    async fn after_merge(&mut self, outcome: ReconcileOutcome) {
        self.persist_outcome(&outcome).await;

        if outcome.scroll_to_bottom {
            self.emit(ViewEvent::ScrollToBottom);
        } else if outcome.inserted > 0 {
            let count = self.reconciler.unseen_count();
            self.emit(ViewEvent::UnseenMessages {
                count,
                offer_summary: count >= self.summary_unread_threshold,
            });
        }
    }

    async fn persist_outcome(&self, outcome: &ReconcileOutcome) {
        metrics::record_reconciled(
            outcome.inserted,
            outcome.updated,
            outcome.confirmations.len(),
        );
        self.confirm_outbox(outcome).await;
        for message in &outcome.written {
            self.save(message).await;
        }
    }

    /// Confirmations that arrived through a page or push close the outbox
    /// entry too, so it is never resent.
    async fn confirm_outbox(&self, outcome: &ReconcileOutcome) {
        for confirmation in &outcome.confirmations {
            self.mark_confirmed(&confirmation.local_id, &confirmation.confirmed_id)
                .await;
        }
    }

    async fn mark_confirmed(&self, local_id: &str, confirmed_id: &str) {
        if let Err(e) = self.deps.outbox.mark_synced(local_id, Some(confirmed_id)).await {
            warn!(local_id = %local_id, error = %e, "Failed to mark outbox entry synced");
        }
        if let Err(e) = self
            .deps
            .persistence
            .update_sync_status(local_id, Some(confirmed_id), SyncStatus::Synced, None)
            .await
        {
            debug!(local_id = %local_id, error = %e, "Failed to update stored sync status");
        }
    }

    async fn save(&self, message: &Message) {
        if let Err(e) = self.deps.persistence.save_message(message).await {
            warn!(message_key = %message.key(), error = %e, "Failed to save message");
        }
    }

    /// Unconfirmed outbox entries of this conversation as provisional messages.
    async fn outstanding_sends(&self) -> Vec<Message> {
        let entries = match self.deps.outbox.unconfirmed().await {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %e, "Failed to read outbox");
                return Vec::new();
            }
        };

        entries
            .into_iter()
            .filter(|entry| entry.chat_id == self.reconciler.chat_id())
            .filter_map(|entry| match provisional_from_entry(&entry) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(local_id = %entry.local_id, error = %e, "Unreadable outbox entry");
                    None
                }
            })
            .collect()
    }

    async fn handle_send(&mut self, draft: MessageDraft, reply: SendReply) {
        let message = Message::provisional(
            self.reconciler.chat_id(),
            self.reconciler.viewer_id(),
            draft,
        );
        let Some(local_id) = message.local_id.clone() else {
            let _ = reply.send(Err(SyncError::Parse(
                "provisional message without local id".into(),
            )));
            return;
        };

        let payload = match serde_json::to_value(&message) {
            Ok(payload) => payload,
            Err(e) => {
                let _ = reply.send(Err(e.into()));
                return;
            }
        };
        let new_entry = NewOutboxEntry::new(
            message.chat_id.clone(),
            message.client_nonce.clone().unwrap_or_default(),
            payload,
        )
        .with_local_id(local_id.clone());

        if let Err(e) = self.deps.outbox.enqueue(new_entry).await {
            error!(local_id = %local_id, error = %e, "Failed to queue outgoing message");
            let _ = reply.send(Err(e.into()));
            return;
        }

        self.save(&message).await;
        self.reconciler.insert_provisional(message);
        self.emit(ViewEvent::ScrollToBottom);

        self.claim_and_send(&local_id, reply).await;
    }

    async fn handle_retry(&mut self, local_id: String, reply: SendReply) {
        if let Err(e) = self.deps.outbox.requeue(&local_id).await {
            let _ = reply.send(Err(e.into()));
            return;
        }
        info!(local_id = %local_id, "Retrying rejected message");
        self.claim_and_send(&local_id, reply).await;
    }

    async fn claim_and_send(&mut self, local_id: &str, reply: SendReply) {
        match self.deps.outbox.claim(local_id).await {
            Ok(Some(entry)) => {
                self.reconciler
                    .set_provisional_status(local_id, SyncStatus::Sending);
                self.spawn_send(vec![entry], Some(reply), None);
            }
            Ok(None) => {
                // A connectivity drain already picked it up
                debug!(local_id = %local_id, "Outbox entry already claimed");
                let current = self.reconciler.provisional(local_id).cloned();
                let _ = reply.send(current.ok_or_else(|| {
                    SyncError::Persistence(format!("message {local_id} is no longer pending"))
                }));
            }
            Err(e) => {
                let _ = reply.send(Err(e.into()));
            }
        }
    }

    async fn handle_connectivity(&mut self, reply: oneshot::Sender<SyncResult<usize>>) {
        let entries = match self.deps.outbox.drain_pending().await {
            Ok(entries) => entries,
            Err(e) => {
                let _ = reply.send(Err(e.into()));
                return;
            }
        };
        if entries.is_empty() {
            let _ = reply.send(Ok(0));
            return;
        }

        for entry in &entries {
            self.reconciler
                .set_provisional_status(&entry.local_id, SyncStatus::Sending);
        }
        self.spawn_send(entries, None, Some(reply));
    }

    async fn handle_send_completed(
        &mut self,
        entry: OutboxEntry,
        result: SyncResult<JsonValue>,
        reply: Option<SendReply>,
    ) {
        let local_id = entry.local_id.as_str();
        let confirmed = result.and_then(|raw| {
            let mut confirmed = Message::from_wire(&raw, self.reconciler.viewer_id())?;
            if confirmed.chat_id.is_empty() {
                confirmed.chat_id = entry.chat_id.clone();
            }
            if confirmed.client_nonce.is_none() && !entry.client_nonce.is_empty() {
                confirmed.client_nonce = Some(entry.client_nonce.clone());
            }
            Ok(confirmed)
        });

        let outcome = match confirmed {
            Ok(confirmed) => {
                let confirmed_id = confirmed.id.clone().unwrap_or_default();
                if entry.chat_id == self.reconciler.chat_id() {
                    self.reconciler.confirm_send(local_id, confirmed.clone());
                }
                self.mark_confirmed(local_id, &confirmed_id).await;
                self.save(&confirmed).await;
                metrics::record_send("ok");
                info!(local_id = %local_id, message_id = %confirmed_id, "Message sent");
                Ok(confirmed)
            }
            Err(e) => {
                self.record_send_failure(&entry, &e).await;
                Err(e)
            }
        };

        if let Some(reply) = reply {
            let _ = reply.send(outcome);
        }
    }

    async fn record_send_failure(&mut self, entry: &OutboxEntry, e: &SyncError) {
        let local_id = entry.local_id.as_str();
        let kind = e.failure_kind();
        let status = match kind {
            FailureKind::Transient => SyncStatus::Pending,
            FailureKind::Rejected => SyncStatus::Failed,
        };
        let reason = e.to_string();
        metrics::record_send(match kind {
            FailureKind::Transient => "transient",
            FailureKind::Rejected => "rejected",
        });

        if let Err(oe) = self.deps.outbox.mark_failed(local_id, kind, &reason).await {
            error!(local_id = %local_id, error = %oe, "Failed to record send failure");
        }
        if let Err(pe) = self
            .deps
            .persistence
            .update_sync_status(local_id, None, status, Some(&reason))
            .await
        {
            debug!(local_id = %local_id, error = %pe, "Failed to update stored sync status");
        }

        if self.reconciler.set_provisional_status(local_id, status) {
            self.emit(ViewEvent::SendFailed {
                local_id: local_id.to_string(),
                reason,
                retryable: kind == FailureKind::Transient,
            });
        }
    }

    async fn handle_push(&mut self, event: PushEvent) {
        if let Some(chat_id) = event.chat_id() {
            if chat_id != self.reconciler.chat_id() {
                debug!(other_chat_id = %chat_id, "Ignoring push for another conversation");
                return;
            }
        }

        match event {
            PushEvent::NewMessage(raw) => {
                let batch = self.reconciler.decode_batch(std::slice::from_ref(&raw));
                let outcome = self.reconciler.apply(Origin::Push, batch);
                self.after_merge(outcome).await;
            }
            PushEvent::MessageEdited(raw) => {
                match Message::from_wire(&raw, self.reconciler.viewer_id()) {
                    Ok(edited) => {
                        if let Some(updated) = self.reconciler.apply_edit(&edited) {
                            self.save(&updated).await;
                        }
                    }
                    Err(e) => warn!(error = %e, "Skipping malformed edit event"),
                }
            }
            PushEvent::MessageDeleted { message_id, .. } => {
                if self.reconciler.apply_delete(&message_id).is_some() {
                    if let Err(e) = self.deps.persistence.delete_message(&message_id).await {
                        debug!(message_id = %message_id, error = %e, "Failed to tombstone stored message");
                    }
                }
            }
            PushEvent::ReactionUpdated { message_id, .. } => {
                debug!(message_id = ?message_id, "Reaction update received");
            }
        }
    }
}

/// The provisional message stored in an outbox entry, with the entry's
/// delivery state.
fn provisional_from_entry(entry: &OutboxEntry) -> SyncResult<Message> {
    let mut message: Message = serde_json::from_value(entry.payload.clone())?;
    message.local_id = Some(entry.local_id.clone());
    message.sync_status = entry.sync_status;
    Ok(message)
}

fn outgoing_payload(entry: &OutboxEntry) -> SyncResult<JsonValue> {
    Ok(provisional_from_entry(entry)?.to_send_payload())
}

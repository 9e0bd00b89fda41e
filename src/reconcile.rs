//! Merge of incoming message batches into the conversation store.
//!
//! Each batch comes from exactly one origin. An initial load replaces the
//! store. Refreshes and pushes are merged message by message:
//!
//! 1. a server id already in the store is updated in place;
//! 2. otherwise a provisional placeholder of the same sender is replaced in
//!    place, matched by client nonce (newest placeholder first) or, failing
//!    that, by signature (oldest placeholder first, so confirmations pair
//!    with sends in order);
//! 3. otherwise the message is appended.
//!
//! Applying the same batch twice leaves the store as after the first pass.

use std::collections::HashMap;

use chrono::Utc;
use message_outbox::SyncStatus;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::models::Message;
use crate::pagination::PrependDelta;
use crate::signature::signature_of;
use crate::store::ConversationStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    InitialLoad,
    /// Periodic poll or post-send refetch
    Refresh,
    /// Single real-time event
    Push,
}

/// A provisional message that was replaced by its confirmed copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub local_id: String,
    pub confirmed_id: String,
    /// Store index of the confirmed copy
    pub index: usize,
}

#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    /// Truly new messages (not placeholder replacements)
    pub inserted: usize,
    /// Existing messages whose fields changed
    pub updated: usize,
    pub confirmations: Vec<Confirmation>,
    /// Confirmed messages written to the store, for persistence
    pub written: Vec<Message>,
    /// New messages arrived while the viewport was at the bottom
    pub scroll_to_bottom: bool,
}

impl ReconcileOutcome {
    pub fn is_noop(&self) -> bool {
        self.inserted == 0 && self.updated == 0 && self.confirmations.is_empty()
    }
}

enum Step {
    Unchanged,
    Updated,
    Confirmed(Confirmation),
    Appended,
}

pub struct ReconciliationEngine {
    chat_id: String,
    viewer_id: String,
    store: ConversationStore,
    first_visible: usize,
    /// `None` until the renderer reports a viewport
    last_visible: Option<usize>,
    bottom_threshold: usize,
    unseen: usize,
}

impl ReconciliationEngine {
    pub fn new(chat_id: impl Into<String>, viewer_id: impl Into<String>, bottom_threshold: usize) -> Self {
        Self {
            chat_id: chat_id.into(),
            viewer_id: viewer_id.into(),
            store: ConversationStore::new(),
            first_visible: 0,
            last_visible: None,
            bottom_threshold,
            unseen: 0,
        }
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn has_unseen_new_messages(&self) -> bool {
        self.unseen > 0
    }

    pub fn unseen_count(&self) -> usize {
        self.unseen
    }

    pub fn first_visible(&self) -> usize {
        self.first_visible
    }

    /// Within `bottom_threshold` items of the end. True before any viewport
    /// report and for an empty conversation.
    pub fn is_at_bottom(&self) -> bool {
        match self.last_visible {
            None => true,
            Some(_) if self.store.is_empty() => true,
            Some(last) => last.saturating_add(self.bottom_threshold) >= self.store.len(),
        }
    }

    /// Record what the renderer shows. Reaching the bottom clears the unseen
    /// counter.
    pub fn update_viewport(&mut self, first_visible: usize, last_visible: usize) {
        self.first_visible = first_visible;
        self.last_visible = Some(last_visible.max(first_visible));
        if self.is_at_bottom() {
            self.unseen = 0;
        }
    }

    /// Decode raw server payloads for this conversation.
    ///
    /// Malformed entries and messages of other conversations are skipped; the
    /// rest of the batch is kept.
    pub fn decode_batch(&self, raw: &[JsonValue]) -> Vec<Message> {
        raw.iter()
            .filter_map(|value| match Message::from_wire(value, &self.viewer_id) {
                Ok(mut message) => {
                    if message.chat_id.is_empty() {
                        message.chat_id = self.chat_id.clone();
                    }
                    if message.chat_id != self.chat_id {
                        debug!(
                            chat_id = %self.chat_id,
                            other_chat_id = %message.chat_id,
                            "Skipping message for another conversation"
                        );
                        return None;
                    }
                    Some(message)
                }
                Err(e) => {
                    warn!(chat_id = %self.chat_id, error = %e, "Skipping malformed message");
                    None
                }
            })
            .collect()
    }

    pub fn apply(&mut self, origin: Origin, batch: Vec<Message>) -> ReconcileOutcome {
        match origin {
            Origin::InitialLoad => self.load_initial(batch, Vec::new()),
            Origin::Refresh | Origin::Push => self.merge(origin, batch),
        }
    }

    /// Replace the store with `batch`, then re-attach `outstanding` provisional
    /// messages the page does not already confirm (matched by client nonce).
    pub fn load_initial(&mut self, batch: Vec<Message>, outstanding: Vec<Message>) -> ReconcileOutcome {
        let mut page: Vec<Message> = Vec::with_capacity(batch.len() + outstanding.len());
        let mut index_by_id: HashMap<String, usize> = HashMap::new();
        for message in batch {
            let Some(id) = message.id.clone() else {
                warn!(chat_id = %self.chat_id, "Dropping provisional message from server page");
                continue;
            };
            match index_by_id.get(&id) {
                Some(&existing) => {
                    warn!(chat_id = %self.chat_id, message_id = %id, "Duplicate id in page, keeping last");
                    page[existing] = message;
                }
                None => {
                    index_by_id.insert(id, page.len());
                    page.push(message);
                }
            }
        }
        page.sort_by_key(|m| m.timestamp);

        let mut outcome = ReconcileOutcome {
            inserted: page.len(),
            written: page.clone(),
            scroll_to_bottom: true,
            ..Default::default()
        };

        let index_by_nonce: HashMap<String, (usize, String)> = page
            .iter()
            .enumerate()
            .filter_map(|(i, m)| {
                let nonce = m.client_nonce.clone()?;
                Some((nonce, (i, m.id.clone()?)))
            })
            .collect();

        for provisional in outstanding {
            let Some(local_id) = provisional.local_id.clone() else {
                continue;
            };
            let confirmed = provisional
                .client_nonce
                .as_ref()
                .and_then(|nonce| index_by_nonce.get(nonce));
            match confirmed {
                Some((index, confirmed_id)) => outcome.confirmations.push(Confirmation {
                    local_id,
                    confirmed_id: confirmed_id.clone(),
                    index: *index,
                }),
                None => page.push(provisional),
            }
        }

        let total = page.len();
        self.store.reset(page);
        self.unseen = 0;
        self.first_visible = 0;
        self.last_visible = None;

        info!(
            chat_id = %self.chat_id,
            messages = total,
            confirmed = outcome.confirmations.len(),
            "Conversation loaded"
        );
        outcome
    }

    fn merge(&mut self, origin: Origin, batch: Vec<Message>) -> ReconcileOutcome {
        let was_at_bottom = self.is_at_bottom();
        let mut outcome = ReconcileOutcome::default();

        for message in batch {
            let Some(id) = message.id.clone() else {
                warn!(chat_id = %self.chat_id, ?origin, "Ignoring message without server id");
                continue;
            };
            match self.merge_one(&id, message.clone()) {
                Step::Unchanged => {}
                Step::Updated => {
                    outcome.updated += 1;
                    outcome.written.push(message);
                }
                Step::Confirmed(confirmation) => {
                    debug!(
                        chat_id = %self.chat_id,
                        local_id = %confirmation.local_id,
                        message_id = %id,
                        index = confirmation.index,
                        "Placeholder confirmed"
                    );
                    outcome.confirmations.push(confirmation);
                    outcome.written.push(message);
                }
                Step::Appended => {
                    outcome.inserted += 1;
                    outcome.written.push(message);
                }
            }
        }

        if outcome.inserted > 0 {
            if was_at_bottom {
                outcome.scroll_to_bottom = true;
            } else {
                self.unseen += outcome.inserted;
            }
        }

        if !outcome.is_noop() {
            debug!(
                chat_id = %self.chat_id,
                ?origin,
                inserted = outcome.inserted,
                updated = outcome.updated,
                confirmed = outcome.confirmations.len(),
                "Batch reconciled"
            );
        }
        outcome
    }

    fn merge_one(&mut self, id: &str, message: Message) -> Step {
        if let Some(index) = self.store.find_index_by_id(id) {
            if self.store.get(index) == Some(&message) {
                return Step::Unchanged;
            }
            self.store.replace_at(index, message);
            return Step::Updated;
        }

        if let Some(index) = self.find_placeholder(&message) {
            let previous = self.store.replace_at(index, message);
            let local_id = previous.and_then(|p| p.local_id).unwrap_or_default();
            return Step::Confirmed(Confirmation {
                local_id,
                confirmed_id: id.to_string(),
                index,
            });
        }

        self.store.append(message);
        Step::Appended
    }

    fn find_placeholder(&self, incoming: &Message) -> Option<usize> {
        let sender = incoming.sender_id.as_str();

        if let Some(nonce) = incoming.client_nonce.as_deref() {
            let by_nonce = self.store.find_index_by_placeholder(|p| {
                p.sender_id == sender && p.client_nonce.as_deref() == Some(nonce)
            });
            if by_nonce.is_some() {
                return by_nonce;
            }
        }

        // A placeholder carrying a different nonce is a different send
        let signature = signature_of(incoming);
        self.store.find_oldest_placeholder(|p| {
            p.sender_id == sender
                && p.local_signature == signature
                && (incoming.client_nonce.is_none() || p.client_nonce.is_none())
        })
    }

    /// Apply an edit event. Edits always carry a server id; no placeholder search.
    pub fn apply_edit(&mut self, edited: &Message) -> Option<Message> {
        let id = edited.id.as_deref()?;
        let Some(index) = self.store.find_index_by_id(id) else {
            debug!(chat_id = %self.chat_id, message_id = %id, "Edit for unknown message");
            return None;
        };
        if self.store.get(index).is_some_and(|m| m.is_deleted) {
            debug!(chat_id = %self.chat_id, message_id = %id, "Ignoring edit of deleted message");
            return None;
        }
        let current = self.store.get(index)?;
        if current.is_edited && current.content == edited.content {
            return None;
        }

        let content = edited.content.clone();
        let edited_at = edited.edited_at.unwrap_or_else(Utc::now);
        self.store
            .update_at(index, |m| {
                m.content = content;
                m.is_edited = true;
                m.edited_at = Some(edited_at);
            })
            .cloned()
    }

    /// Tombstone a message in place. The row is never removed.
    pub fn apply_delete(&mut self, id: &str) -> Option<Message> {
        let Some(index) = self.store.find_index_by_id(id) else {
            debug!(chat_id = %self.chat_id, message_id = %id, "Delete for unknown message");
            return None;
        };
        if self.store.get(index).is_some_and(|m| m.is_deleted) {
            return None;
        }
        self.store.update_at(index, Message::tombstone).cloned()
    }

    /// Optimistic local reaction toggle by the viewer.
    pub fn toggle_reaction(&mut self, message_key: &str, emoji: &str) -> Option<Message> {
        let index = self
            .store
            .find_index_by_id(message_key)
            .or_else(|| self.store.find_index_by_local_id(message_key))?;
        if self.store.get(index).is_some_and(|m| m.is_deleted) {
            return None;
        }
        self.store
            .update_at(index, |m| {
                m.reactions.toggle(emoji);
            })
            .cloned()
    }

    /// Optimistic echo of a message composed on this device.
    pub fn insert_provisional(&mut self, message: Message) -> usize {
        self.unseen = 0;
        self.store.append(message)
    }

    pub fn provisional(&self, local_id: &str) -> Option<&Message> {
        self.store
            .find_index_by_local_id(local_id)
            .and_then(|index| self.store.get(index))
            .filter(|m| m.is_provisional())
    }

    /// Update the delivery state shown on a provisional message.
    pub fn set_provisional_status(&mut self, local_id: &str, status: SyncStatus) -> bool {
        let Some(index) = self.store.find_index_by_local_id(local_id) else {
            return false;
        };
        if !self.store.get(index).is_some_and(|m| m.is_provisional()) {
            return false;
        }
        if self.store.get(index).map(|m| m.sync_status) == Some(status) {
            return true;
        }
        self.store.update_at(index, |m| m.sync_status = status);
        true
    }

    /// Apply the server's answer to our own send.
    ///
    /// If a refresh or push already delivered the confirmed copy, the
    /// placeholder is dropped so the message exists once.
    pub fn confirm_send(&mut self, local_id: &str, confirmed: Message) -> Option<Confirmation> {
        let confirmed_id = confirmed.id.clone()?;
        let placeholder = self.store.find_index_by_local_id(local_id);
        let existing = self.store.find_index_by_id(&confirmed_id);

        let index = match (placeholder, existing) {
            (Some(placeholder), None) => {
                self.store.replace_at(placeholder, confirmed);
                placeholder
            }
            (Some(placeholder), Some(existing)) => {
                if self.store.get(existing) != Some(&confirmed) {
                    self.store.replace_at(existing, confirmed);
                }
                self.store.remove_at(placeholder);
                if placeholder < existing {
                    existing - 1
                } else {
                    existing
                }
            }
            (None, Some(_)) => {
                debug!(local_id = %local_id, message_id = %confirmed_id, "Send already confirmed");
                return None;
            }
            (None, None) => self.store.append(confirmed),
        };

        Some(Confirmation {
            local_id: local_id.to_string(),
            confirmed_id,
            index,
        })
    }

    /// Prepend an older page, skipping ids already present.
    pub fn prepend_older(&mut self, batch: Vec<Message>) -> PrependDelta {
        let anchor_index_before = self.first_visible;
        let mut page: Vec<Message> = Vec::with_capacity(batch.len());
        for message in batch {
            let Some(id) = message.id.as_deref() else {
                continue;
            };
            let duplicate = self.store.find_index_by_id(id).is_some()
                || page.iter().any(|m| m.id.as_deref() == Some(id));
            if !duplicate {
                page.push(message);
            }
        }
        page.sort_by_key(|m| m.timestamp);

        let prepended_count = self.store.prepend_all(page);
        self.first_visible += prepended_count;
        if let Some(last) = self.last_visible.as_mut() {
            *last += prepended_count;
        }

        PrependDelta {
            prepended_count,
            anchor_index_before,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageDraft, DELETED_MESSAGE_TEXT};
    use serde_json::json;

    const ME: &str = "me";
    const CHAT: &str = "chat-1";

    fn engine() -> ReconciliationEngine {
        ReconciliationEngine::new(CHAT, ME, 7)
    }

    fn server(id: &str, sender: &str, content: &str, ts: i64) -> Message {
        Message::from_wire(
            &json!({
                "_id": id,
                "chat": CHAT,
                "sender": sender,
                "type": "text",
                "content": content,
                "timestamp": ts,
            }),
            ME,
        )
        .unwrap()
    }

    fn with_nonce(mut message: Message, nonce: &str) -> Message {
        message.client_nonce = Some(nonce.to_string());
        message
    }

    fn page(n: i64) -> Vec<Message> {
        (1..=n)
            .map(|i| server(&format!("m{i}"), "other", &format!("msg {i}"), i * 1000))
            .collect()
    }

    fn ids(engine: &ReconciliationEngine) -> Vec<String> {
        engine.store().iter().map(|m| m.key().to_string()).collect()
    }

    #[test]
    fn test_initial_load_orders_and_dedups_last_wins() {
        let mut engine = engine();
        let batch = vec![
            server("b", "other", "second", 2000),
            server("a", "other", "first", 1000),
            server("b", "other", "second (fixed)", 2000),
        ];

        let outcome = engine.apply(Origin::InitialLoad, batch);

        assert_eq!(outcome.inserted, 2);
        assert_eq!(ids(&engine), vec!["a", "b"]);
        assert_eq!(engine.store().get(1).unwrap().content, "second (fixed)");
    }

    #[test]
    fn test_initial_load_of_twenty() {
        let mut engine = engine();
        engine.apply(Origin::InitialLoad, page(20));
        assert_eq!(engine.store().len(), 20);
        let timestamps: Vec<_> = engine.store().iter().map(|m| m.timestamp).collect();
        let mut sorted = timestamps.clone();
        sorted.sort();
        assert_eq!(timestamps, sorted);
    }

    #[test]
    fn test_refresh_is_idempotent() {
        let mut engine = engine();
        engine.apply(Origin::InitialLoad, page(5));
        let placeholder = Message::provisional(CHAT, ME, MessageDraft::text("ok"));
        engine.insert_provisional(placeholder);

        let batch = vec![
            server("m5", "other", "edited text", 5000),
            server("m6", "other", "new", 6000),
            server("m7", ME, "ok", 7000),
        ];
        engine.apply(Origin::Refresh, batch.clone());
        let after_first = engine.store().messages().to_vec();

        let second = engine.apply(Origin::Refresh, batch);
        assert!(second.is_noop());
        assert_eq!(engine.store().messages(), after_first.as_slice());
    }

    #[test]
    fn test_nonce_confirmation_replaces_in_place() {
        let mut engine = engine();
        engine.apply(Origin::InitialLoad, page(3));
        let placeholder = Message::provisional(CHAT, ME, MessageDraft::text("hi"));
        let local_id = placeholder.local_id.clone().unwrap();
        let nonce = placeholder.client_nonce.clone().unwrap();
        let index = engine.insert_provisional(placeholder);

        let confirmed = with_nonce(server("abc123", ME, "hi", 9000), &nonce);
        let outcome = engine.apply(Origin::Refresh, vec![confirmed]);

        assert_eq!(engine.store().len(), 4);
        assert_eq!(outcome.inserted, 0);
        assert_eq!(
            outcome.confirmations,
            vec![Confirmation {
                local_id,
                confirmed_id: "abc123".to_string(),
                index,
            }]
        );
        let slot = engine.store().get(index).unwrap();
        assert_eq!(slot.id.as_deref(), Some("abc123"));
        assert_eq!(slot.sync_status, SyncStatus::Synced);
    }

    #[test]
    fn test_signature_fallback_confirms_oldest_placeholder() {
        let mut engine = engine();
        let first = Message::provisional(CHAT, ME, MessageDraft::text("ok"));
        let second = Message::provisional(CHAT, ME, MessageDraft::text("ok"));
        let first_local = first.local_id.clone().unwrap();
        let second_local = second.local_id.clone().unwrap();
        engine.insert_provisional(first);
        engine.insert_provisional(second);

        // Server did not echo the nonce
        engine.apply(Origin::Refresh, vec![server("s1", ME, "ok", 1000)]);

        assert_eq!(engine.store().len(), 2);
        assert_eq!(engine.store().get(0).unwrap().id.as_deref(), Some("s1"));
        assert!(engine.provisional(&first_local).is_none());
        assert!(engine.provisional(&second_local).is_some());
    }

    #[test]
    fn test_nonce_picks_exact_placeholder_among_identical_texts() {
        let mut engine = engine();
        let first = Message::provisional(CHAT, ME, MessageDraft::text("ok"));
        let second = Message::provisional(CHAT, ME, MessageDraft::text("ok"));
        let second_nonce = second.client_nonce.clone().unwrap();
        engine.insert_provisional(first.clone());
        engine.insert_provisional(second);

        engine.apply(
            Origin::Push,
            vec![with_nonce(server("s2", ME, "ok", 2000), &second_nonce)],
        );

        assert_eq!(engine.store().get(1).unwrap().id.as_deref(), Some("s2"));
        assert_eq!(engine.store().get(0).unwrap(), &first);
    }

    #[test]
    fn test_foreign_nonce_does_not_steal_placeholder() {
        let mut engine = engine();
        let mine = Message::provisional(CHAT, ME, MessageDraft::text("ok"));
        engine.insert_provisional(mine.clone());

        // Same text sent from another device of the same user
        let outcome = engine.apply(
            Origin::Push,
            vec![with_nonce(server("s9", ME, "ok", 2000), "other-device-nonce")],
        );

        assert_eq!(outcome.inserted, 1);
        assert_eq!(engine.store().get(0).unwrap(), &mine);
    }

    #[test]
    fn test_other_senders_never_match_placeholders() {
        let mut engine = engine();
        engine.insert_provisional(Message::provisional(CHAT, ME, MessageDraft::text("ok")));
        let outcome = engine.apply(Origin::Push, vec![server("s1", "other", "ok", 1000)]);
        assert_eq!(outcome.inserted, 1);
        assert_eq!(engine.store().len(), 2);
    }

    #[test]
    fn test_id_match_wins_over_placeholder() {
        let mut engine = engine();
        let placeholder = Message::provisional(CHAT, ME, MessageDraft::text("ok"));
        let nonce = placeholder.client_nonce.clone().unwrap();
        engine.apply(Origin::InitialLoad, vec![server("s1", ME, "ok", 1000)]);
        engine.insert_provisional(placeholder.clone());

        // Duplicate echo of an already confirmed message
        let outcome = engine.apply(
            Origin::Refresh,
            vec![with_nonce(server("s1", ME, "ok", 1000), &nonce)],
        );

        assert!(outcome.confirmations.is_empty());
        assert_eq!(engine.store().get(1).unwrap(), &placeholder);
    }

    #[test]
    fn test_push_replay_does_not_grow_store() {
        let mut engine = engine();
        engine.apply(Origin::InitialLoad, page(3));
        let event = server("m9", "other", "hey", 9000);

        engine.apply(Origin::Push, vec![event.clone()]);
        engine.apply(Origin::Push, vec![event]);

        assert_eq!(engine.store().len(), 4);
    }

    #[test]
    fn test_new_messages_scroll_only_at_bottom() {
        let mut engine = engine();
        engine.apply(Origin::InitialLoad, page(20));

        engine.update_viewport(15, 19);
        let outcome = engine.apply(Origin::Refresh, vec![server("n1", "other", "a", 21_000)]);
        assert!(outcome.scroll_to_bottom);
        assert!(!engine.has_unseen_new_messages());

        // User scrolled up to read history
        engine.update_viewport(0, 5);
        let outcome = engine.apply(
            Origin::Refresh,
            vec![
                server("n2", "other", "b", 22_000),
                server("n3", "other", "c", 23_000),
            ],
        );
        assert!(!outcome.scroll_to_bottom);
        assert_eq!(engine.unseen_count(), 2);

        // In-place updates are not "new"
        engine.apply(Origin::Refresh, vec![server("n3", "other", "c2", 23_000)]);
        assert_eq!(engine.unseen_count(), 2);

        engine.update_viewport(17, 22);
        assert!(!engine.has_unseen_new_messages());
    }

    #[test]
    fn test_out_of_range_viewport_counts_as_bottom() {
        let mut engine = engine();
        engine.apply(Origin::InitialLoad, page(20));

        engine.update_viewport(usize::MAX, usize::MAX);
        assert!(engine.is_at_bottom());

        let outcome = engine.apply(Origin::Refresh, vec![server("n1", "other", "a", 21_000)]);
        assert!(outcome.scroll_to_bottom);
    }

    #[test]
    fn test_edit_and_delete_in_place() {
        let mut engine = engine();
        engine.apply(Origin::InitialLoad, page(3));
        let mut edited = server("m2", "other", "changed", 2000);
        edited.is_edited = true;

        let updated = engine.apply_edit(&edited).unwrap();
        assert_eq!(updated.content, "changed");
        assert!(engine.store().get(1).unwrap().is_edited);

        let deleted = engine.apply_delete("m2").unwrap();
        assert!(deleted.is_deleted);
        assert_eq!(engine.store().len(), 3);
        assert_eq!(engine.store().get(1).unwrap().content, DELETED_MESSAGE_TEXT);

        // Repeats and unknown ids are no-ops
        assert!(engine.apply_delete("m2").is_none());
        assert!(engine.apply_delete("nope").is_none());
        assert!(engine.apply_edit(&edited).is_none());
    }

    #[test]
    fn test_decode_batch_skips_bad_entries() {
        let engine = engine();
        let raw = vec![
            json!({ "_id": "m1", "chat": CHAT, "sender": "u", "timestamp": 1 }),
            json!({ "content": "no id", "timestamp": 2 }),
            json!(42),
            json!({ "_id": "m3", "chat": "chat-2", "sender": "u", "timestamp": 3 }),
            json!({ "_id": "m4", "sender": "u", "timestamp": 4 }),
        ];
        let decoded = engine.decode_batch(&raw);
        let ids: Vec<_> = decoded.iter().map(|m| m.key()).collect();
        assert_eq!(ids, vec!["m1", "m4"]);
        assert_eq!(decoded[1].chat_id, CHAT);
    }

    #[test]
    fn test_prepend_older_dedups_and_reports_delta() {
        let mut engine = engine();
        let all = page(25);
        engine.apply(Origin::InitialLoad, all[5..].to_vec());
        engine.update_viewport(2, 10);

        // Overlapping, unsorted older page
        let mut older: Vec<_> = all[..6].to_vec();
        older.reverse();
        let delta = engine.prepend_older(older);

        assert_eq!(
            delta,
            PrependDelta {
                prepended_count: 5,
                anchor_index_before: 2,
            }
        );
        assert_eq!(engine.store().len(), 25);
        let expected: Vec<_> = all.iter().map(|m| m.key().to_string()).collect();
        assert_eq!(ids(&engine), expected);
        assert_eq!(engine.first_visible(), 7);
    }

    #[test]
    fn test_initial_load_reattaches_outstanding_sends() {
        let mut engine = engine();
        let confirmed_elsewhere = Message::provisional(CHAT, ME, MessageDraft::text("a"));
        let still_pending = Message::provisional(CHAT, ME, MessageDraft::text("b"));
        let nonce = confirmed_elsewhere.client_nonce.clone().unwrap();

        let outcome = engine.load_initial(
            vec![with_nonce(server("s1", ME, "a", 1000), &nonce)],
            vec![confirmed_elsewhere.clone(), still_pending.clone()],
        );

        assert_eq!(engine.store().len(), 2);
        assert_eq!(outcome.confirmations.len(), 1);
        assert_eq!(
            outcome.confirmations[0].local_id,
            confirmed_elsewhere.local_id.unwrap()
        );
        assert_eq!(engine.store().get(1).unwrap(), &still_pending);
    }

    #[test]
    fn test_confirm_send_after_refresh_keeps_single_copy() {
        let mut engine = engine();
        let placeholder = Message::provisional(CHAT, ME, MessageDraft::text("hi"));
        let local_id = placeholder.local_id.clone().unwrap();
        engine.insert_provisional(placeholder);
        // Someone else's message lands between placeholder and confirmation
        engine.apply(Origin::Push, vec![server("x", "other", "yo", 500)]);
        // The server copy arrived with a different nonce-less shape before our response
        engine.apply(Origin::Refresh, vec![server("s1", ME, "different", 1000)]);
        assert_eq!(engine.store().len(), 3);

        let confirmation = engine
            .confirm_send(&local_id, server("s1", ME, "hi", 1000))
            .unwrap();

        assert_eq!(engine.store().len(), 2);
        assert_eq!(confirmation.index, 1);
        assert_eq!(engine.store().get(1).unwrap().content, "hi");
        assert!(engine.provisional(&local_id).is_none());
    }

    #[test]
    fn test_reaction_toggle_and_status() {
        let mut engine = engine();
        engine.apply(Origin::InitialLoad, page(1));
        let updated = engine.toggle_reaction("m1", "👍").unwrap();
        assert_eq!(updated.reactions.summary.get("👍"), Some(&1));
        let updated = engine.toggle_reaction("m1", "👍").unwrap();
        assert!(updated.reactions.summary.is_empty());

        let placeholder = Message::provisional(CHAT, ME, MessageDraft::text("x"));
        let local_id = placeholder.local_id.clone().unwrap();
        engine.insert_provisional(placeholder);
        assert!(engine.set_provisional_status(&local_id, SyncStatus::Failed));
        assert_eq!(
            engine.provisional(&local_id).unwrap().sync_status,
            SyncStatus::Failed
        );
        assert!(!engine.set_provisional_status("local-unknown", SyncStatus::Pending));
    }
}

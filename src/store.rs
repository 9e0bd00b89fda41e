//! Ordered in-memory view of one conversation.
//!
//! Every mutation publishes a [`StoreChange`] so a renderer can apply a
//! minimal diff instead of redrawing the whole list.

use tokio::sync::broadcast;

use crate::models::Message;

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Inserted,
    Changed,
    Removed,
    RangeInserted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreChange {
    pub kind: ChangeKind,
    pub index: usize,
    pub count: usize,
}

impl StoreChange {
    fn new(kind: ChangeKind, index: usize, count: usize) -> Self {
        Self { kind, index, count }
    }
}

pub struct ConversationStore {
    messages: Vec<Message>,
    changes: broadcast::Sender<StoreChange>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            messages: Vec::new(),
            changes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Message> {
        self.messages.get(index)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    /// Replace the slot at `index`, returning the previous message.
    pub fn replace_at(&mut self, index: usize, message: Message) -> Option<Message> {
        let slot = self.messages.get_mut(index)?;
        let previous = std::mem::replace(slot, message);
        self.notify(StoreChange::new(ChangeKind::Changed, index, 1));
        Some(previous)
    }

    /// Mutate the slot at `index` in place.
    pub fn update_at<F>(&mut self, index: usize, f: F) -> Option<&Message>
    where
        F: FnOnce(&mut Message),
    {
        let slot = self.messages.get_mut(index)?;
        f(slot);
        self.notify(StoreChange::new(ChangeKind::Changed, index, 1));
        self.messages.get(index)
    }

    /// Insert at `index` (clamped to the end).
    pub fn insert_at(&mut self, index: usize, message: Message) -> usize {
        let index = index.min(self.messages.len());
        self.messages.insert(index, message);
        self.notify(StoreChange::new(ChangeKind::Inserted, index, 1));
        index
    }

    pub fn append(&mut self, message: Message) -> usize {
        self.messages.push(message);
        let index = self.messages.len() - 1;
        self.notify(StoreChange::new(ChangeKind::Inserted, index, 1));
        index
    }

    /// Insert `messages` before the current first item, keeping their order.
    pub fn prepend_all(&mut self, messages: Vec<Message>) -> usize {
        let count = messages.len();
        if count == 0 {
            return 0;
        }
        self.messages.splice(0..0, messages);
        self.notify(StoreChange::new(ChangeKind::RangeInserted, 0, count));
        count
    }

    pub fn remove_at(&mut self, index: usize) -> Option<Message> {
        if index >= self.messages.len() {
            return None;
        }
        let removed = self.messages.remove(index);
        self.notify(StoreChange::new(ChangeKind::Removed, index, 1));
        Some(removed)
    }

    /// Drop everything and load `messages` as the new content.
    pub fn reset(&mut self, messages: Vec<Message>) {
        let previous = self.messages.len();
        if previous > 0 {
            self.messages.clear();
            self.notify(StoreChange::new(ChangeKind::Removed, 0, previous));
        }
        let count = messages.len();
        self.messages = messages;
        if count > 0 {
            self.notify(StoreChange::new(ChangeKind::RangeInserted, 0, count));
        }
    }

    /// Index of the message with server id `id`, scanning from the newest end.
    pub fn find_index_by_id(&self, id: &str) -> Option<usize> {
        self.messages
            .iter()
            .rposition(|m| m.id.as_deref() == Some(id))
    }

    pub fn find_index_by_local_id(&self, local_id: &str) -> Option<usize> {
        self.messages
            .iter()
            .rposition(|m| m.local_id.as_deref() == Some(local_id))
    }

    /// Newest provisional message matching `predicate`.
    pub fn find_index_by_placeholder<P>(&self, predicate: P) -> Option<usize>
    where
        P: Fn(&Message) -> bool,
    {
        self.messages
            .iter()
            .rposition(|m| m.is_provisional() && predicate(m))
    }

    /// Oldest provisional message matching `predicate`.
    pub fn find_oldest_placeholder<P>(&self, predicate: P) -> Option<usize>
    where
        P: Fn(&Message) -> bool,
    {
        self.messages
            .iter()
            .position(|m| m.is_provisional() && predicate(m))
    }

    fn notify(&self, change: StoreChange) {
        // No subscribers is fine; the renderer may not be attached yet
        let _ = self.changes.send(change);
    }
}

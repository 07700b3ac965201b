//! The entity store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use palaver_types::{DeliveryStatus, Message, MessageId, Participant, ParticipantId};

use crate::live::{ChangeHub, StoreEvent, StoreSubscription};
use crate::view::{group_by_author, MessageGroup};

/// Shared handle to the store. All mutations go through this single lock;
/// critical sections never await.
pub type SharedStore = Arc<Mutex<EntityStore>>;

/// Normalized maps of messages and participants, keyed by identifier.
///
/// The display order (ascending `(sent_at, id)`) is maintained as a sorted
/// index next to the message map, so merges stay cheap for the common cases
/// of appending new messages and prepending history pages.
pub struct EntityStore {
    messages: HashMap<MessageId, Message>,
    /// Sorted `(sent_at, id)` index over `messages`.
    order: Vec<(i64, MessageId)>,
    participants: HashMap<ParticipantId, Participant>,
    version: u64,
    hub: ChangeHub,
}

impl EntityStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            messages: HashMap::new(),
            order: Vec::new(),
            participants: HashMap::new(),
            version: 0,
            hub: ChangeHub::new(),
        }
    }

    /// Wraps the store in the shared handle used by the engine and outbox.
    pub fn into_shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Merges a batch of messages.
    ///
    /// Absent identifiers are inserted; present ones are replaced only when
    /// the incoming `updated_at` is strictly greater than the stored value,
    /// so re-applying a batch is a no-op. Returns the identifiers that
    /// actually changed.
    pub fn upsert_messages(&mut self, batch: Vec<Message>) -> Vec<MessageId> {
        let mut changed = Vec::new();
        for incoming in batch {
            self.apply_upsert(incoming, &mut changed);
        }

        if !changed.is_empty() {
            debug!(count = changed.len(), "Merged message batch");
            self.mutated(StoreEvent::MessagesChanged(changed.clone()));
        }
        changed
    }

    /// Merges a page of historical messages (ordered oldest-to-newest).
    ///
    /// Identifiers already present are dropped silently; overlap at page
    /// boundaries is expected. Returns the number of messages inserted.
    pub fn insert_older_messages(&mut self, batch: Vec<Message>) -> usize {
        let mut inserted = Vec::new();
        for msg in batch {
            if self.messages.contains_key(&msg.id) {
                continue;
            }
            inserted.push(msg.id.clone());
            self.insert_message(msg);
        }

        let count = inserted.len();
        if count > 0 {
            debug!(count, "Merged history page");
            self.mutated(StoreEvent::MessagesChanged(inserted));
        }
        count
    }

    /// Merges a batch of participants, last write wins.
    ///
    /// Returns the identifiers whose stored value actually changed.
    pub fn upsert_participants(&mut self, batch: Vec<Participant>) -> Vec<ParticipantId> {
        let mut changed = Vec::new();
        for incoming in batch {
            if self.participants.get(&incoming.id) != Some(&incoming) {
                changed.push(incoming.id.clone());
            }
            self.participants.insert(incoming.id.clone(), incoming);
        }

        if !changed.is_empty() {
            debug!(count = changed.len(), "Merged participant batch");
            self.mutated(StoreEvent::ParticipantsChanged(changed.clone()));
        }
        changed
    }

    /// Swaps a provisional message for its canonical server counterpart in
    /// one step, so subscribers never observe both.
    pub fn replace(&mut self, local_id: &MessageId, canonical: Message) -> Vec<MessageId> {
        let mut changed = Vec::new();

        if let Some(old) = self.messages.remove(local_id) {
            self.remove_order_entry(old.sent_at, local_id);
            changed.push(local_id.clone());
        }

        // The canonical message may already be here if a poll raced the send
        // confirmation; the strictly-newer rule keeps this a no-op then.
        self.apply_upsert(canonical, &mut changed);

        if !changed.is_empty() {
            self.mutated(StoreEvent::MessagesChanged(changed.clone()));
        }
        changed
    }

    /// Flips the delivery status of a message. Returns false if the message
    /// is unknown or already in that state.
    pub fn set_delivery_status(&mut self, id: &MessageId, status: DeliveryStatus) -> bool {
        match self.messages.get_mut(id) {
            Some(msg) if msg.status != status => {
                msg.status = status;
                self.mutated(StoreEvent::MessagesChanged(vec![id.clone()]));
                true
            }
            _ => false,
        }
    }

    /// Clears both maps. Used when the backend session identifier changes.
    pub fn reset(&mut self) {
        info!(
            messages = self.messages.len(),
            participants = self.participants.len(),
            "Resetting entity store"
        );
        self.messages.clear();
        self.order.clear();
        self.participants.clear();
        self.mutated(StoreEvent::Reset);
    }

    /// Seeds the store from a persisted snapshot.
    ///
    /// Restore is silent: no events are emitted, matching a renderer that
    /// has not subscribed yet. Duplicate identifiers are dropped.
    pub fn seed(&mut self, messages: Vec<Message>, participants: Vec<Participant>) {
        for msg in messages {
            if !self.messages.contains_key(&msg.id) {
                self.insert_message(msg);
            }
        }
        for p in participants {
            self.participants.insert(p.id.clone(), p);
        }
        self.version += 1;
        debug!(
            messages = self.messages.len(),
            participants = self.participants.len(),
            "Seeded store from persisted state"
        );
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Messages in display order (ascending `sent_at`, ties by id).
    pub fn messages(&self) -> Vec<&Message> {
        self.order
            .iter()
            .filter_map(|(_, id)| self.messages.get(id))
            .collect()
    }

    /// Looks up a single message.
    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        self.messages.get(id)
    }

    /// Looks up a participant. A `None` here renders as a degraded,
    /// anonymous header, never a failure.
    pub fn participant(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.get(id)
    }

    /// Number of messages held.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the store holds no messages.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Number of participants held.
    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Identifiers of messages still awaiting delivery confirmation.
    pub fn pending_messages(&self) -> Vec<MessageId> {
        self.messages
            .values()
            .filter(|m| m.status == DeliveryStatus::Pending)
            .map(|m| m.id.clone())
            .collect()
    }

    /// Monotonic mutation counter for cheap dirty checks.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Subscribes to change events.
    pub fn subscribe(&self) -> StoreSubscription {
        self.hub.subscribe()
    }

    /// Clones the current state into an immutable view for rendering or
    /// persistence.
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            messages: self.messages().into_iter().cloned().collect(),
            participants: self.participants.clone(),
            version: self.version,
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn mutated(&mut self, event: StoreEvent) {
        self.version += 1;
        self.hub.notify(event);
    }

    fn apply_upsert(&mut self, incoming: Message, changed: &mut Vec<MessageId>) {
        match self.messages.get(&incoming.id) {
            None => {
                changed.push(incoming.id.clone());
                self.insert_message(incoming);
            }
            Some(stored) => {
                if incoming.updated_at <= stored.updated_at {
                    return;
                }
                let prior_sent_at = stored.sent_at;
                if incoming.sent_at != prior_sent_at {
                    self.remove_order_entry(prior_sent_at, &incoming.id);
                    self.insert_order_entry(incoming.sent_at, incoming.id.clone());
                }
                changed.push(incoming.id.clone());
                self.messages.insert(incoming.id.clone(), incoming);
            }
        }
    }

    fn insert_message(&mut self, msg: Message) {
        self.insert_order_entry(msg.sent_at, msg.id.clone());
        self.messages.insert(msg.id.clone(), msg);
    }

    /// Keeps the order index sorted. Fast paths cover the common cases:
    /// new messages append, history pages prepend.
    fn insert_order_entry(&mut self, sent_at: i64, id: MessageId) {
        let key = (sent_at, id);
        if self.order.last().is_none_or(|last| key >= *last) {
            self.order.push(key);
        } else if self.order.first().is_some_and(|first| key <= *first) {
            self.order.insert(0, key);
        } else {
            let idx = self.order.binary_search(&key).unwrap_or_else(|i| i);
            self.order.insert(idx, key);
        }
    }

    fn remove_order_entry(&mut self, sent_at: i64, id: &MessageId) {
        let key = (sent_at, id.clone());
        match self.order.binary_search(&key) {
            Ok(idx) => {
                self.order.remove(idx);
            }
            Err(_) => {
                self.order.retain(|entry| &entry.1 != id);
            }
        }
    }
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

/// An immutable, cloned view of the store at a point in time.
#[derive(Clone, Debug)]
pub struct StoreSnapshot {
    /// Messages in display order.
    pub messages: Vec<Message>,
    pub participants: HashMap<ParticipantId, Participant>,
    /// Store version this snapshot was taken at.
    pub version: u64,
}

impl StoreSnapshot {
    /// Resolves a message's author. `None` means the renderer should fall
    /// back to an anonymous header.
    pub fn author_of(&self, msg: &Message) -> Option<&Participant> {
        self.participants.get(&msg.author_id)
    }

    /// Consecutive same-author runs, for bubble grouping.
    pub fn grouped(&self) -> Vec<MessageGroup<'_>> {
        group_by_author(&self.messages)
    }
}

//! Live change notifications for store subscribers.
//!
//! Subscribers are notified after a mutation has been applied; events carry
//! the identifiers that changed so a renderer can diff instead of redrawing
//! everything. Events sent before a subscription exists are not replayed.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::RwLock;

use palaver_types::{MessageId, ParticipantId};

/// A change that happened to the store.
#[derive(Clone, Debug, PartialEq)]
pub enum StoreEvent {
    /// Messages were inserted or replaced.
    MessagesChanged(Vec<MessageId>),
    /// Participants were inserted or replaced.
    ParticipantsChanged(Vec<ParticipantId>),
    /// The whole store was cleared (backend session change).
    Reset,
}

/// A subscription to store changes.
pub struct StoreSubscription {
    receiver: Receiver<StoreEvent>,
}

impl StoreSubscription {
    fn new(receiver: Receiver<StoreEvent>) -> Self {
        Self { receiver }
    }

    /// Blocks until the next event arrives, or returns None once the store
    /// has been dropped.
    pub fn recv(&self) -> Option<StoreEvent> {
        self.receiver.recv().ok()
    }

    /// Returns the next event if one is immediately available.
    pub fn try_recv(&self) -> Option<StoreEvent> {
        self.receiver.try_recv().ok()
    }

    /// Drains every event that is immediately available.
    pub fn drain(&self) -> Vec<StoreEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

/// Fan-out hub owned by the store.
#[derive(Debug, Default)]
pub(crate) struct ChangeHub {
    senders: RwLock<Vec<Sender<StoreEvent>>>,
}

impl ChangeHub {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn subscribe(&self) -> StoreSubscription {
        let (sender, receiver) = mpsc::channel();
        self.senders.write().expect("lock poisoned").push(sender);
        StoreSubscription::new(receiver)
    }

    /// Sends the event to every live subscriber, pruning dead ones.
    pub(crate) fn notify(&self, event: StoreEvent) {
        let mut senders = self.senders.write().expect("lock poisoned");
        senders.retain(|sender| sender.send(event.clone()).is_ok());
    }
}

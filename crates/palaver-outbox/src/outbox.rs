//! The outbox.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, info, warn};

use palaver_remote::ChatApiHandle;
use palaver_store::SharedStore;
use palaver_types::{DeliveryStatus, Message, MessageId, ParticipantId};

/// Manages optimistic message creation and reconciliation.
///
/// Sends may overlap each other and anything the sync engine is doing; each
/// dispatch is its own spawned task holding cloned handles. Failed sends are
/// never retried automatically; duplicate sends are worse than surfaced
/// failures.
pub struct Outbox {
    client: ChatApiHandle,
    store: SharedStore,
    /// Author stamped on provisional messages so they render as "mine"
    /// before the server assigns the canonical author.
    local_author: ParticipantId,
    /// Provisional identifiers without a confirmed outcome yet. The
    /// messages themselves live in the store; this is only a tag set.
    pending: Arc<Mutex<HashSet<MessageId>>>,
    runtime: tokio::runtime::Handle,
}

impl Outbox {
    /// Creates an outbox.
    ///
    /// # Arguments
    /// * `client` - Backend handle used for `POST /messages/new`
    /// * `store` - Shared entity store receiving provisional and canonical messages
    /// * `local_author` - Participant identifier of the local user
    /// * `runtime` - Tokio runtime handle dispatch tasks are spawned on
    pub fn new(
        client: ChatApiHandle,
        store: SharedStore,
        local_author: ParticipantId,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        Self {
            client,
            store,
            local_author,
            pending: Arc::new(Mutex::new(HashSet::new())),
            runtime,
        }
    }

    /// Sends a message.
    ///
    /// Empty or whitespace-only text is a no-op and returns `None`.
    /// Otherwise a provisional message lands in the store immediately and
    /// the network call runs in the background; the returned identifier is
    /// the provisional one, valid until confirmation swaps it out.
    pub fn send(&self, text: &str) -> Option<MessageId> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            debug!("Ignoring empty send");
            return None;
        }

        let now_ms = Utc::now().timestamp_millis();
        let provisional = Message::provisional(trimmed, self.local_author.clone(), now_ms);
        let local_id = provisional.id.clone();

        self.pending
            .lock()
            .expect("lock poisoned")
            .insert(local_id.clone());
        self.store
            .lock()
            .expect("lock poisoned")
            .upsert_messages(vec![provisional]);

        debug!(local_id = %local_id, "Dispatching send");
        self.dispatch(local_id.clone(), trimmed.to_string());

        Some(local_id)
    }

    /// Retries a failed send. Returns false if the identifier is unknown or
    /// the message is not currently failed.
    ///
    /// The text is taken from the stored message, so a failed send restored
    /// from disk after a restart is just as retryable as a fresh one.
    pub fn retry(&self, id: &MessageId) -> bool {
        let text = {
            let mut store = self.store.lock().expect("lock poisoned");
            let Some(text) = store
                .message(id)
                .filter(|m| m.status == DeliveryStatus::Failed)
                .map(|m| m.text.clone())
            else {
                return false;
            };
            store.set_delivery_status(id, DeliveryStatus::Pending);
            text
        };

        self.pending.lock().expect("lock poisoned").insert(id.clone());
        info!(local_id = %id, "Retrying failed send");
        self.dispatch(id.clone(), text);
        true
    }

    /// Drops all pending bookkeeping. Used on backend session change, after
    /// the store itself has been reset.
    pub fn reset(&self) {
        let mut pending = self.pending.lock().expect("lock poisoned");
        if !pending.is_empty() {
            info!(count = pending.len(), "Dropping pending sends");
            pending.clear();
        }
    }

    /// Number of sends still awaiting confirmation or retry.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("lock poisoned").len()
    }

    /// Spawns the network call and the follow-up reconciliation.
    fn dispatch(&self, local_id: MessageId, text: String) {
        let client = self.client.clone();
        let store = self.store.clone();
        let pending = self.pending.clone();

        self.runtime.spawn(async move {
            match client.post_message(&text).await {
                Ok(canonical) => {
                    // A reset while the request was in flight cancels the
                    // send; the confirmation belongs to the previous backend
                    // session and must not land in the fresh store.
                    if !pending.lock().expect("lock poisoned").contains(&local_id) {
                        info!(local_id = %local_id, "Discarding confirmation for a cancelled send");
                        return;
                    }
                    debug!(
                        local_id = %local_id,
                        canonical_id = %canonical.id,
                        "Send confirmed"
                    );
                    // Single store operation: subscribers never observe the
                    // provisional and canonical entries side by side.
                    store
                        .lock()
                        .expect("lock poisoned")
                        .replace(&local_id, canonical);
                    pending.lock().expect("lock poisoned").remove(&local_id);
                }
                Err(err) => {
                    warn!(local_id = %local_id, error = %err, "Send failed");
                    let marked = store
                        .lock()
                        .expect("lock poisoned")
                        .set_delivery_status(&local_id, DeliveryStatus::Failed);
                    if !marked {
                        // The store was reset while the send was in flight;
                        // nothing left to badge.
                        pending.lock().expect("lock poisoned").remove(&local_id);
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use palaver_remote::{ChatApi, RemoteError, RemoteResult};
    use palaver_store::EntityStore;
    use palaver_types::{ChatInfo, Participant};

    /// Scripted backend: pops one result per post_message call.
    struct ScriptedBackend {
        post_results: Mutex<VecDeque<Result<Message, u16>>>,
        post_calls: AtomicUsize,
        post_delay: Mutex<Option<Duration>>,
    }

    impl ScriptedBackend {
        fn new(results: Vec<Result<Message, u16>>) -> Arc<Self> {
            Arc::new(Self {
                post_results: Mutex::new(results.into()),
                post_calls: AtomicUsize::new(0),
                post_delay: Mutex::new(None),
            })
        }

        fn calls(&self) -> usize {
            self.post_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChatApi for ScriptedBackend {
        async fn info(&self) -> RemoteResult<ChatInfo> {
            Ok(ChatInfo {
                session_uuid: "s-1".to_string(),
                api_version: "1".to_string(),
            })
        }

        async fn all_messages(&self, _page: u32) -> RemoteResult<Vec<Message>> {
            Ok(Vec::new())
        }

        async fn latest_messages(&self) -> RemoteResult<Vec<Message>> {
            Ok(Vec::new())
        }

        async fn older_messages(&self, _before: &MessageId) -> RemoteResult<Vec<Message>> {
            Ok(Vec::new())
        }

        async fn message_updates(&self, _since_ms: i64) -> RemoteResult<Vec<Message>> {
            Ok(Vec::new())
        }

        async fn all_participants(&self) -> RemoteResult<Vec<Participant>> {
            Ok(Vec::new())
        }

        async fn participant_updates(&self, _since_ms: i64) -> RemoteResult<Vec<Participant>> {
            Ok(Vec::new())
        }

        async fn post_message(&self, _text: &str) -> RemoteResult<Message> {
            self.post_calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.post_delay.lock().expect("lock poisoned");
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let next = self
                .post_results
                .lock()
                .expect("lock poisoned")
                .pop_front()
                .expect("unscripted post_message call");
            next.map_err(|status| RemoteError::Api {
                status,
                message: "scripted failure".to_string(),
            })
        }
    }

    fn canonical(id: &str, text: &str, sent_at: i64) -> Message {
        Message {
            id: MessageId::from(id),
            text: text.to_string(),
            author_id: ParticipantId::from("user-1"),
            attachments: Vec::new(),
            reactions: Vec::new(),
            sent_at,
            updated_at: sent_at,
            status: DeliveryStatus::Confirmed,
        }
    }

    fn outbox_with(backend: Arc<ScriptedBackend>) -> (Outbox, SharedStore) {
        let store = EntityStore::new().into_shared();
        let outbox = Outbox::new(
            backend,
            store.clone(),
            ParticipantId::from("user-1"),
            tokio::runtime::Handle::current(),
        );
        (outbox, store)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn empty_or_whitespace_text_is_a_no_op() {
        let backend = ScriptedBackend::new(vec![]);
        let (outbox, store) = outbox_with(backend.clone());

        assert!(outbox.send("").is_none());
        assert!(outbox.send("   \n\t").is_none());
        settle().await;

        assert_eq!(backend.calls(), 0);
        assert!(store.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_inserts_provisional_immediately() {
        let backend = ScriptedBackend::new(vec![Ok(canonical("srv-1", "hello", 100))]);
        let (outbox, store) = outbox_with(backend);

        let local_id = outbox.send("hello").unwrap();

        // Before the dispatch resolves, the provisional message is visible.
        {
            let store = store.lock().unwrap();
            let msg = store.message(&local_id).unwrap();
            assert_eq!(msg.text, "hello");
            assert_eq!(msg.status, DeliveryStatus::Pending);
            assert_eq!(store.len(), 1);
        }
    }

    #[tokio::test]
    async fn confirmation_leaves_exactly_the_canonical_message() {
        let backend = ScriptedBackend::new(vec![Ok(canonical("srv-1", "hello", 100))]);
        let (outbox, store) = outbox_with(backend);

        let local_id = outbox.send("hello").unwrap();
        settle().await;

        let store = store.lock().unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.message(&local_id).is_none());
        let msg = store.message(&MessageId::from("srv-1")).unwrap();
        assert_eq!(msg.text, "hello");
        assert_eq!(msg.status, DeliveryStatus::Confirmed);
        assert_eq!(outbox.pending_count(), 0);
    }

    #[tokio::test]
    async fn send_trims_surrounding_whitespace() {
        let backend = ScriptedBackend::new(vec![Ok(canonical("srv-1", "hello", 100))]);
        let (outbox, store) = outbox_with(backend);

        let local_id = outbox.send("  hello  ").unwrap();
        assert_eq!(store.lock().unwrap().message(&local_id).unwrap().text, "hello");
    }

    #[tokio::test]
    async fn failure_badges_the_message_instead_of_removing_it() {
        let backend = ScriptedBackend::new(vec![Err(500)]);
        let (outbox, store) = outbox_with(backend.clone());

        let local_id = outbox.send("hello").unwrap();
        settle().await;

        {
            let store = store.lock().unwrap();
            let msg = store.message(&local_id).unwrap();
            assert_eq!(msg.status, DeliveryStatus::Failed);
            assert_eq!(store.len(), 1);
        }

        // No automatic retry happened.
        assert_eq!(backend.calls(), 1);
        assert_eq!(outbox.pending_count(), 1);
    }

    #[tokio::test]
    async fn explicit_retry_re_dispatches_and_reconciles() {
        let backend =
            ScriptedBackend::new(vec![Err(503), Ok(canonical("srv-9", "hello", 100))]);
        let (outbox, store) = outbox_with(backend.clone());

        let local_id = outbox.send("hello").unwrap();
        settle().await;
        assert_eq!(
            store.lock().unwrap().message(&local_id).unwrap().status,
            DeliveryStatus::Failed
        );

        assert!(outbox.retry(&local_id));
        settle().await;

        let store = store.lock().unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.message(&MessageId::from("srv-9")).is_some());
        assert_eq!(backend.calls(), 2);
        assert_eq!(outbox.pending_count(), 0);
    }

    #[tokio::test]
    async fn retry_refuses_unknown_and_in_flight_sends() {
        let backend = ScriptedBackend::new(vec![Ok(canonical("srv-1", "hello", 100))]);
        let (outbox, _store) = outbox_with(backend);

        // Unknown id.
        assert!(!outbox.retry(&MessageId::from("ghost")));

        // Still pending: must not double-send.
        let local_id = outbox.send("hello").unwrap();
        assert!(!outbox.retry(&local_id));
        settle().await;
    }

    #[tokio::test]
    async fn provisional_sorts_after_existing_messages() {
        let backend = ScriptedBackend::new(vec![Ok(canonical("srv-2", "reply", 200))]);
        let (outbox, store) = outbox_with(backend);

        store
            .lock()
            .unwrap()
            .upsert_messages(vec![canonical("srv-1", "earlier", 100)]);

        let local_id = outbox.send("reply").unwrap();
        {
            let store = store.lock().unwrap();
            let ids: Vec<_> = store.messages().iter().map(|m| m.id.clone()).collect();
            assert_eq!(ids, vec![MessageId::from("srv-1"), local_id.clone()]);
        }
        settle().await;
    }

    #[tokio::test]
    async fn reset_discards_a_late_confirmation() {
        let backend = ScriptedBackend::new(vec![Ok(canonical("srv-1", "hello", 100))]);
        *backend.post_delay.lock().unwrap() = Some(Duration::from_millis(100));
        let (outbox, store) = outbox_with(backend);

        outbox.send("hello").unwrap();

        // The backend session changes while the request is in flight.
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.lock().unwrap().reset();
        outbox.reset();

        tokio::time::sleep(Duration::from_millis(150)).await;

        // The confirmation belongs to the old session: nothing lands.
        assert!(store.lock().unwrap().is_empty());
        assert_eq!(outbox.pending_count(), 0);
    }

    #[tokio::test]
    async fn reset_drops_pending_bookkeeping() {
        let backend = ScriptedBackend::new(vec![Err(500)]);
        let (outbox, store) = outbox_with(backend);

        let local_id = outbox.send("hello").unwrap();
        settle().await;
        assert_eq!(outbox.pending_count(), 1);

        store.lock().unwrap().reset();
        outbox.reset();

        assert_eq!(outbox.pending_count(), 0);
        assert!(!outbox.retry(&local_id));
    }
}

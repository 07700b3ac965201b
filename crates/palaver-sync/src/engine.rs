//! The sync engine.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

use palaver_outbox::Outbox;
use palaver_remote::{ChatApiHandle, RemoteError};
use palaver_store::{EntityStore, SharedStore, StoreSnapshot, StoreSubscription};
use palaver_types::{ChatInfo, DeliveryStatus, Message, MessageId, ParticipantId};

use crate::config::{retry_backoff, SyncConfig};
use crate::error::SyncResult;
use crate::persist::{PersistedState, StateStoreHandle};

/// Where the engine currently is in its lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyncPhase {
    /// Not started, or stopped.
    Idle,
    /// Verifying the backend session identity.
    SessionCheck,
    /// Fetching the full history and participant list. There may be no
    /// data to show yet; `last_error` carries the failure, if any.
    InitialLoad,
    /// Synchronized; polling for updates.
    Steady,
}

/// Outcome of a `/info` comparison against the recorded session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SessionVerdict {
    /// No session was recorded before; this one is now recorded.
    Fresh,
    /// Same session as recorded; local state is still valid.
    Unchanged,
    /// Different session: the backend restarted with fresh data. Local
    /// state has been discarded by the time this verdict is returned.
    Changed,
}

/// Client-side chat synchronization engine.
///
/// Owns the entity store, the outbox, and the polling lifecycle. All
/// background work runs in spawned tasks holding shared handles, so
/// [`SyncEngine::stop`] halts future ticks without aborting requests that
/// are already in flight.
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    client: ChatApiHandle,
    store: SharedStore,
    outbox: Outbox,
    state_store: StateStoreHandle,
    config: SyncConfig,
    runtime: tokio::runtime::Handle,

    session: Mutex<Option<ChatInfo>>,
    /// Update watermark: the newest server-reported `updated_at` merged so
    /// far. Advanced only after a successful merge, never from the local
    /// clock.
    cursor_ms: AtomicI64,
    phase: Mutex<SyncPhase>,
    last_error: Mutex<Option<String>>,

    // One in-flight guard per request category; categories are independent.
    poll_in_flight: AtomicBool,
    older_in_flight: AtomicBool,
    recheck_in_flight: AtomicBool,

    poll_failures: AtomicU32,
    /// Poll backoff gate: ticks before this local-clock instant are skipped.
    next_poll_at_ms: AtomicI64,

    shutdown: watch::Sender<bool>,
    loop_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SyncEngine {
    /// Creates an engine.
    ///
    /// # Arguments
    /// * `client` - Backend handle (an [`palaver_remote::HttpChatClient`] in production)
    /// * `state_store` - Durable blob storage for restarts
    /// * `local_author` - Participant identifier provisional sends render under
    /// * `config` - Polling and backoff configuration
    /// * `runtime` - Tokio runtime handle background tasks are spawned on
    pub fn new(
        client: ChatApiHandle,
        state_store: StateStoreHandle,
        local_author: ParticipantId,
        config: SyncConfig,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        let store = EntityStore::new().into_shared();
        let outbox = Outbox::new(client.clone(), store.clone(), local_author, runtime.clone());
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(EngineInner {
                client,
                store,
                outbox,
                state_store,
                config,
                runtime,
                session: Mutex::new(None),
                cursor_ms: AtomicI64::new(0),
                phase: Mutex::new(SyncPhase::Idle),
                last_error: Mutex::new(None),
                poll_in_flight: AtomicBool::new(false),
                older_in_flight: AtomicBool::new(false),
                recheck_in_flight: AtomicBool::new(false),
                poll_failures: AtomicU32::new(0),
                next_poll_at_ms: AtomicI64::new(0),
                shutdown,
                loop_task: Mutex::new(None),
            }),
        }
    }

    /// Starts the engine: restores persisted state, then runs
    /// session check → initial load → steady polling in the background.
    ///
    /// Calling start on a running engine is a no-op.
    pub fn start(&self) {
        let mut task_slot = self.inner.loop_task.lock().expect("lock poisoned");
        if task_slot.is_some() {
            warn!("Sync engine already started");
            return;
        }

        let _ = self.inner.shutdown.send(false);
        self.inner.restore();

        let inner = self.inner.clone();
        let shutdown_rx = self.inner.shutdown.subscribe();
        *task_slot = Some(self.inner.runtime.spawn(run(inner, shutdown_rx)));
        info!("Sync engine started");
    }

    /// Stops the poll timer and persists current state.
    ///
    /// In-flight requests are not aborted; their responses are applied only
    /// if the backend session is still the one they were issued under.
    pub fn stop(&self) {
        let task = self.inner.loop_task.lock().expect("lock poisoned").take();
        if task.is_none() {
            return;
        }

        let _ = self.inner.shutdown.send(true);
        self.inner.save_state();
        self.inner.set_phase(SyncPhase::Idle);
        info!("Sync engine stopped");
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> SyncPhase {
        self.inner.phase()
    }

    /// Most recent bootstrap failure, cleared once the engine reaches
    /// Steady. Meaningful while `phase()` is `InitialLoad` or `SessionCheck`.
    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().expect("lock poisoned").clone()
    }

    /// The recorded backend session, if one has been seen.
    pub fn session_info(&self) -> Option<ChatInfo> {
        self.inner.session.lock().expect("lock poisoned").clone()
    }

    /// Current update watermark (epoch milliseconds, server clock).
    pub fn cursor_ms(&self) -> i64 {
        self.inner.cursor_ms.load(Ordering::SeqCst)
    }

    /// Shared handle to the entity store.
    pub fn store(&self) -> SharedStore {
        self.inner.store.clone()
    }

    /// Subscribes to store change events.
    pub fn subscribe(&self) -> StoreSubscription {
        self.inner.store.lock().expect("lock poisoned").subscribe()
    }

    /// Immutable view of the current chat state.
    pub fn snapshot(&self) -> StoreSnapshot {
        self.inner.store.lock().expect("lock poisoned").snapshot()
    }

    /// Sends a message optimistically. See [`Outbox::send`].
    pub fn send(&self, text: &str) -> Option<MessageId> {
        let id = self.inner.outbox.send(text);
        if id.is_some() {
            self.inner.save_state();
        }
        id
    }

    /// Retries a failed send. See [`Outbox::retry`].
    pub fn retry_send(&self, id: &MessageId) -> bool {
        self.inner.outbox.retry(id)
    }

    /// Number of sends awaiting confirmation or retry.
    pub fn pending_sends(&self) -> usize {
        self.inner.outbox.pending_count()
    }

    /// Loads a page of history older than the given message.
    ///
    /// User-triggered and independent of the poll loop. A second call while
    /// one is in flight is a no-op returning `Ok(0)`. Returns the number of
    /// messages merged.
    pub async fn load_older(&self, before: &MessageId) -> SyncResult<usize> {
        self.inner.load_older(before).await
    }

    /// Catch-up fetch of `/messages/latest`, for when the engine resumes
    /// after a pause and the UI wants the tail immediately rather than on
    /// the next poll tick. Shares the poll in-flight guard.
    pub async fn refresh_latest(&self) -> SyncResult<usize> {
        self.inner.refresh_latest().await
    }
}

/// Bootstrap, then tick until shutdown.
async fn run(inner: Arc<EngineInner>, mut shutdown: watch::Receiver<bool>) {
    if !inner.bootstrap(&mut shutdown).await {
        debug!("Engine shut down before reaching steady state");
        return;
    }

    let mut ticker = interval(inner.config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut tick: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                tick += 1;

                let every = inner.config.session_check_every as u64;
                if every > 0 && tick % every == 0 {
                    let inner = inner.clone();
                    let shutdown = shutdown.clone();
                    inner.runtime.clone().spawn(async move {
                        inner.recheck_session(shutdown).await;
                    });
                }

                let inner = inner.clone();
                inner.runtime.clone().spawn(async move {
                    inner.poll_once().await;
                });
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("Poll loop stopped");
                    break;
                }
            }
        }
    }
}

/// Sleeps for `delay`, returning false if shutdown was requested first.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = sleep(delay) => true,
        changed = shutdown.changed() => changed.is_err() || !*shutdown.borrow(),
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl EngineInner {
    // =========================================================================
    // Bootstrap: session check + initial load
    // =========================================================================

    /// Drives the engine to Steady. Returns false on shutdown.
    async fn bootstrap(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut failures = 0u32;
        loop {
            if *shutdown.borrow() {
                return false;
            }

            self.set_phase(SyncPhase::SessionCheck);
            match self.session_check().await {
                Ok(verdict) => {
                    if verdict == SessionVerdict::Unchanged && !self.store_is_empty() {
                        debug!("Session unchanged; restored state is current");
                    } else {
                        self.set_phase(SyncPhase::InitialLoad);
                        if !self.initial_load(shutdown).await {
                            return false;
                        }
                    }
                    self.clear_error();
                    self.set_phase(SyncPhase::Steady);
                    self.save_state();
                    return true;
                }
                Err(err) => {
                    failures += 1;
                    self.record_error(&err);
                    let delay = retry_backoff(failures, &self.config);
                    warn!(
                        error = %err,
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        "Session check failed; retrying"
                    );
                    if !sleep_or_shutdown(delay, shutdown).await {
                        return false;
                    }
                }
            }
        }
    }

    /// Fetches `/info` and compares against the recorded session. On a
    /// change, local state is discarded before returning.
    async fn session_check(&self) -> Result<SessionVerdict, RemoteError> {
        let incoming = self.client.info().await?;

        let verdict = {
            let mut session = self.session.lock().expect("lock poisoned");
            let verdict = match session.as_ref() {
                None => {
                    info!(session_uuid = %incoming.session_uuid, "Recorded backend session");
                    SessionVerdict::Fresh
                }
                Some(prev) if prev.session_uuid == incoming.session_uuid => {
                    SessionVerdict::Unchanged
                }
                Some(prev) => {
                    info!(
                        old = %prev.session_uuid,
                        new = %incoming.session_uuid,
                        "Backend session changed; discarding local state"
                    );
                    SessionVerdict::Changed
                }
            };
            *session = Some(incoming);
            verdict
        };

        if verdict == SessionVerdict::Changed {
            self.store.lock().expect("lock poisoned").reset();
            self.cursor_ms.store(0, Ordering::SeqCst);
            self.outbox.reset();
        }

        Ok(verdict)
    }

    /// Retries the initial load with backoff until it succeeds or shutdown
    /// is requested. Returns false on shutdown.
    async fn initial_load(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut failures = 0u32;
        loop {
            if *shutdown.borrow() {
                return false;
            }

            match self.try_initial_load().await {
                Ok((messages, participants)) => {
                    info!(messages, participants, "Initial load complete");
                    return true;
                }
                Err(err) => {
                    failures += 1;
                    self.record_error(&err);
                    let delay = retry_backoff(failures, &self.config);
                    warn!(
                        error = %err,
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        "Initial load failed; retrying"
                    );
                    if !sleep_or_shutdown(delay, shutdown).await {
                        return false;
                    }
                }
            }
        }
    }

    /// One attempt: full history and participant list, fetched
    /// concurrently. Both must succeed for the attempt to count.
    async fn try_initial_load(&self) -> Result<(usize, usize), RemoteError> {
        let (messages, participants) =
            tokio::try_join!(self.fetch_full_history(), self.client.all_participants())?;

        // The cursor is rebuilt from scratch: after a session change the old
        // watermark means nothing.
        let cursor = messages.iter().map(|m| m.updated_at).max().unwrap_or(0);

        let (message_count, participant_count) = {
            let mut store = self.store.lock().expect("lock poisoned");
            let message_count = store.upsert_messages(messages).len();
            let participant_count = store.upsert_participants(participants).len();
            (message_count, participant_count)
        };
        self.cursor_ms.store(cursor, Ordering::SeqCst);

        Ok((message_count, participant_count))
    }

    /// Pages through `/messages/all` until the backend reports an empty
    /// page. The empty page terminates the loop; no further page is
    /// requested.
    async fn fetch_full_history(&self) -> Result<Vec<Message>, RemoteError> {
        let mut all = Vec::new();
        let mut page = 0u32;
        loop {
            let batch = self.client.all_messages(page).await?;
            if batch.is_empty() {
                debug!(pages = page, total = all.len(), "History paging complete");
                return Ok(all);
            }
            all.extend(batch);
            page += 1;
        }
    }

    // =========================================================================
    // Steady: polling
    // =========================================================================

    /// One poll tick. Skips itself if a poll is already outstanding, the
    /// engine is not in Steady, or a failure backoff is active.
    async fn poll_once(&self) {
        if self
            .poll_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Previous poll still in flight; skipping tick");
            return;
        }

        self.poll_guarded().await;
        self.poll_in_flight.store(false, Ordering::SeqCst);
    }

    async fn poll_guarded(&self) {
        if self.phase() != SyncPhase::Steady {
            return;
        }
        if now_ms() < self.next_poll_at_ms.load(Ordering::SeqCst) {
            debug!("Poll backoff active; skipping tick");
            return;
        }
        let Some(session_uuid) = self.current_session_uuid() else {
            return;
        };

        let since = self.cursor_ms.load(Ordering::SeqCst);
        match self.fetch_and_merge_updates(since, &session_uuid).await {
            Ok(applied) => {
                self.poll_failures.store(0, Ordering::SeqCst);
                self.next_poll_at_ms.store(0, Ordering::SeqCst);
                if applied {
                    self.save_state();
                }
            }
            Err(err) => {
                let failures = self.poll_failures.fetch_add(1, Ordering::SeqCst) + 1;
                let delay = retry_backoff(failures, &self.config);
                self.next_poll_at_ms
                    .store(now_ms() + delay.as_millis() as i64, Ordering::SeqCst);
                warn!(
                    error = %err,
                    failures,
                    delay_ms = delay.as_millis() as u64,
                    "Poll failed; backing off"
                );
            }
        }
    }

    async fn fetch_and_merge_updates(
        &self,
        since: i64,
        session_uuid: &str,
    ) -> Result<bool, RemoteError> {
        let messages = self.client.message_updates(since).await?;
        let mut applied = self.merge_message_updates(session_uuid, messages) > 0;

        let participants = self.client.participant_updates(since).await?;
        {
            let mut store = self.store.lock().expect("lock poisoned");
            if self.session_matches(session_uuid) && !participants.is_empty() {
                applied |= !store.upsert_participants(participants).is_empty();
            }
        }

        Ok(applied)
    }

    /// Merges a message batch and advances the cursor, returning the number
    /// of messages applied. If the backend session changed while the request
    /// was in flight, the stale response is discarded, not merged.
    fn merge_message_updates(&self, session_uuid: &str, messages: Vec<Message>) -> usize {
        let mut store = self.store.lock().expect("lock poisoned");
        if !self.session_matches(session_uuid) {
            info!("Discarding response issued under a previous session");
            return 0;
        }
        if messages.is_empty() {
            return 0;
        }

        let newest = messages.iter().map(|m| m.updated_at).max().unwrap_or(0);
        let changed = store.upsert_messages(messages);
        self.cursor_ms.fetch_max(newest, Ordering::SeqCst);
        changed.len()
    }

    /// Periodic `/info` re-check from the poll loop. On a session change,
    /// runs a full reload before returning to Steady.
    async fn recheck_session(&self, mut shutdown: watch::Receiver<bool>) {
        if self
            .recheck_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        match self.session_check().await {
            Ok(SessionVerdict::Changed) => {
                self.set_phase(SyncPhase::InitialLoad);
                if self.initial_load(&mut shutdown).await {
                    self.clear_error();
                    self.set_phase(SyncPhase::Steady);
                    self.save_state();
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "Periodic session check failed");
            }
        }

        self.recheck_in_flight.store(false, Ordering::SeqCst);
    }

    // =========================================================================
    // Out-of-band operations
    // =========================================================================

    async fn load_older(&self, before: &MessageId) -> SyncResult<usize> {
        if self
            .older_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("History fetch already in flight; ignoring");
            return Ok(0);
        }

        let result = self.load_older_guarded(before).await;
        self.older_in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn load_older_guarded(&self, before: &MessageId) -> SyncResult<usize> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.client.older_messages(before).await {
                Ok(batch) => {
                    if batch.is_empty() {
                        debug!(before = %before, "Start of history reached");
                        return Ok(0);
                    }
                    let count = self
                        .store
                        .lock()
                        .expect("lock poisoned")
                        .insert_older_messages(batch);
                    self.save_state();
                    return Ok(count);
                }
                Err(err) if attempt < self.config.pagination_retries => {
                    let delay = retry_backoff(attempt, &self.config);
                    warn!(error = %err, attempt, "History fetch failed; retrying");
                    sleep(delay).await;
                }
                Err(err) => {
                    warn!(error = %err, attempt, "History fetch failed; giving up");
                    return Err(err.into());
                }
            }
        }
    }

    async fn refresh_latest(&self) -> SyncResult<usize> {
        if self
            .poll_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(0);
        }

        let result = self.refresh_latest_guarded().await;
        self.poll_in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn refresh_latest_guarded(&self) -> SyncResult<usize> {
        let Some(session_uuid) = self.current_session_uuid() else {
            return Ok(0);
        };

        let batch = self.client.latest_messages().await?;
        let count = self.merge_message_updates(&session_uuid, batch);
        if count > 0 {
            self.save_state();
        }
        Ok(count)
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Restores persisted state. Absent or unreadable blobs mean cold
    /// start; restore is silent and emits no store events.
    fn restore(&self) {
        let Some(blob) = self.state_store.load() else {
            debug!("No persisted state; cold start");
            return;
        };

        match PersistedState::decode(&blob) {
            Ok(state) => {
                let messages = state.messages.len();
                {
                    let mut store = self.store.lock().expect("lock poisoned");
                    store.seed(state.messages, state.participants);
                    // Sends interrupted by the previous shutdown can never
                    // be confirmed; surface them as failed, ready for retry.
                    for id in store.pending_messages() {
                        store.set_delivery_status(&id, DeliveryStatus::Failed);
                    }
                }
                self.cursor_ms.store(state.cursor_ms, Ordering::SeqCst);
                *self.session.lock().expect("lock poisoned") = state.session;
                info!(messages, "Restored persisted chat state");
            }
            Err(err) => {
                warn!(error = %err, "Persisted state unreadable; cold start");
            }
        }
    }

    /// Persists the current snapshot. Failures degrade to in-memory
    /// operation; they are logged, never propagated.
    fn save_state(&self) {
        let snapshot = self.store.lock().expect("lock poisoned").snapshot();
        let state = PersistedState {
            session: self.session.lock().expect("lock poisoned").clone(),
            cursor_ms: self.cursor_ms.load(Ordering::SeqCst),
            messages: snapshot.messages,
            participants: snapshot.participants.into_values().collect(),
        };

        match state.encode() {
            Ok(blob) => {
                if let Err(err) = self.state_store.save(&blob) {
                    warn!(error = %err, "State not persisted; continuing in memory");
                }
            }
            Err(err) => {
                warn!(error = %err, "State snapshot could not be serialized");
            }
        }
    }

    // =========================================================================
    // Small helpers
    // =========================================================================

    fn phase(&self) -> SyncPhase {
        *self.phase.lock().expect("lock poisoned")
    }

    fn set_phase(&self, phase: SyncPhase) {
        *self.phase.lock().expect("lock poisoned") = phase;
    }

    fn record_error(&self, err: &RemoteError) {
        *self.last_error.lock().expect("lock poisoned") = Some(err.to_string());
    }

    fn clear_error(&self) {
        *self.last_error.lock().expect("lock poisoned") = None;
    }

    fn current_session_uuid(&self) -> Option<String> {
        self.session
            .lock()
            .expect("lock poisoned")
            .as_ref()
            .map(|info| info.session_uuid.clone())
    }

    fn session_matches(&self, session_uuid: &str) -> bool {
        self.session
            .lock()
            .expect("lock poisoned")
            .as_ref()
            .is_some_and(|info| info.session_uuid == session_uuid)
    }

    fn store_is_empty(&self) -> bool {
        self.store.lock().expect("lock poisoned").is_empty()
    }
}

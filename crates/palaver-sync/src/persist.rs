//! Durable state snapshots.
//!
//! Durability is an opaque key-value blob: the engine serializes a
//! [`PersistedState`] and hands it to a [`StateStore`]. A missing or
//! unreadable blob is a cold start, never an error; the backend remains
//! the source of truth.

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use palaver_types::{ChatInfo, Message, Participant};

/// Durable blob storage for engine state.
///
/// Implementations must tolerate concurrent processes at most as well as the
/// platform requires; the engine itself serializes its own save calls.
pub trait StateStore: Send + Sync {
    /// Returns the last saved blob, or None if nothing (readable) is there.
    fn load(&self) -> Option<Vec<u8>>;

    /// Persists a blob, replacing any previous one.
    fn save(&self, blob: &[u8]) -> io::Result<()>;
}

/// Shared handle to a state store.
pub type StateStoreHandle = Arc<dyn StateStore>;

/// Everything the engine persists across restarts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    /// Session descriptor the state was synced under.
    pub session: Option<ChatInfo>,
    /// Update watermark (epoch milliseconds, server clock).
    pub cursor_ms: i64,
    pub messages: Vec<Message>,
    pub participants: Vec<Participant>,
}

impl PersistedState {
    /// Serializes to the blob format.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Deserializes from the blob format.
    pub fn decode(blob: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(blob)
    }
}

/// File-backed state store.
///
/// Writes go to a sibling temp file first and are renamed into place, so a
/// crash mid-write leaves the previous blob intact rather than a torn one.
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Option<Vec<u8>> {
        std::fs::read(&self.path).ok()
    }

    fn save(&self, blob: &[u8]) -> io::Result<()> {
        let temp = self.temp_path();
        std::fs::write(&temp, blob)?;
        std::fs::rename(&temp, &self.path)
    }
}

/// In-memory state store, for tests and for explicitly ephemeral sessions.
#[derive(Default)]
pub struct MemoryStateStore {
    blob: Mutex<Option<Vec<u8>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seeds the store with a blob, as if a previous run had saved it.
    pub fn with_blob(blob: Vec<u8>) -> Self {
        Self {
            blob: Mutex::new(Some(blob)),
        }
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Option<Vec<u8>> {
        self.blob.lock().expect("lock poisoned").clone()
    }

    fn save(&self, blob: &[u8]) -> io::Result<()> {
        *self.blob.lock().expect("lock poisoned") = Some(blob.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_types::{DeliveryStatus, MessageId, ParticipantId};

    fn sample_state() -> PersistedState {
        PersistedState {
            session: Some(ChatInfo {
                session_uuid: "s-1".to_string(),
                api_version: "1".to_string(),
            }),
            cursor_ms: 1_700_000_000_000,
            messages: vec![Message {
                id: MessageId::from("m-1"),
                text: "hello".to_string(),
                author_id: ParticipantId::from("u-1"),
                attachments: Vec::new(),
                reactions: Vec::new(),
                sent_at: 1,
                updated_at: 1,
                status: DeliveryStatus::Confirmed,
            }],
            participants: vec![Participant {
                id: ParticipantId::from("u-1"),
                name: "Ada".to_string(),
                avatar_url: String::new(),
            }],
        }
    }

    #[test]
    fn state_round_trips_through_the_blob_format() {
        let state = sample_state();
        let blob = state.encode().unwrap();
        assert_eq!(PersistedState::decode(&blob).unwrap(), state);
    }

    #[test]
    fn garbage_blob_fails_to_decode() {
        assert!(PersistedState::decode(b"not json").is_err());
        assert!(PersistedState::decode(b"{\"unexpected\":true}").is_err());
    }

    #[test]
    fn file_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("chat-state.json"));

        assert!(store.load().is_none());

        let blob = sample_state().encode().unwrap();
        store.save(&blob).unwrap();
        assert_eq!(store.load().unwrap(), blob);

        // Overwrites replace the previous blob.
        store.save(b"[]").unwrap();
        assert_eq!(store.load().unwrap(), b"[]");
    }

    #[test]
    fn file_store_leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat-state.json");
        let store = FileStateStore::new(&path);

        store.save(b"{}").unwrap();
        assert!(path.exists());
        assert!(!store.temp_path().exists());
    }

    #[test]
    fn memory_store_round_trips() {
        let store = MemoryStateStore::new();
        assert!(store.load().is_none());

        store.save(b"blob").unwrap();
        assert_eq!(store.load().unwrap(), b"blob");

        let seeded = MemoryStateStore::with_blob(b"seed".to_vec());
        assert_eq!(seeded.load().unwrap(), b"seed");
    }
}

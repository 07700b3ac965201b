//! The backend request seam.

use std::sync::Arc;

use async_trait::async_trait;

use palaver_types::{ChatInfo, Message, MessageId, Participant};

use crate::error::RemoteResult;

/// Request surface of the chat backend.
///
/// One method per endpoint of the fixed REST contract. Implementations
/// return parsed payloads or a `RemoteError`; they never retry and never
/// merge: that is the sync engine's job. Tests substitute scripted
/// implementations for the HTTP client through this trait.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// `GET /info`: session descriptor for the current backend run.
    async fn info(&self) -> RemoteResult<ChatInfo>;

    /// `GET /messages/all?page=N`: one page of the full history, oldest
    /// first. An empty array signals the end of the pages.
    async fn all_messages(&self, page: u32) -> RemoteResult<Vec<Message>>;

    /// `GET /messages/latest`: messages newer than any previously
    /// fetched page.
    async fn latest_messages(&self) -> RemoteResult<Vec<Message>>;

    /// `GET /messages/older/:refMessageUuid`: messages older than the
    /// reference message.
    async fn older_messages(&self, before: &MessageId) -> RemoteResult<Vec<Message>>;

    /// `GET /messages/updates/:sinceTimestamp`: messages changed since the
    /// watermark (epoch milliseconds).
    async fn message_updates(&self, since_ms: i64) -> RemoteResult<Vec<Message>>;

    /// `GET /participants/all`: the full participant list.
    async fn all_participants(&self) -> RemoteResult<Vec<Participant>>;

    /// `GET /participants/updates/:sinceTimestamp`: participants changed
    /// since the watermark.
    async fn participant_updates(&self, since_ms: i64) -> RemoteResult<Vec<Participant>>;

    /// `POST /messages/new`: create a message; returns the canonical
    /// server-side message.
    async fn post_message(&self, text: &str) -> RemoteResult<Message>;
}

/// Shared handle to a backend implementation.
pub type ChatApiHandle = Arc<dyn ChatApi>;

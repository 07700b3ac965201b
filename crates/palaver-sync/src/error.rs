//! Engine error types.

use thiserror::Error;

use palaver_remote::RemoteError;

/// Errors surfaced by engine operations that return a result directly to
/// the caller (pagination, catch-up fetches).
///
/// Poll-loop failures never appear here; they are logged and absorbed by
/// backoff so the UI keeps showing stale-but-consistent data.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A backend request failed after the engine's own retries.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The persisted state blob could not be encoded.
    #[error("state serialization failed: {0}")]
    State(#[from] serde_json::Error),
}

/// Convenience Result alias for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

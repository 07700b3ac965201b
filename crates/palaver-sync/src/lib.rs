//! # palaver-sync
//!
//! The sync coordinator: the component that keeps the local entity store
//! consistent with the chat backend.
//!
//! ## State machine
//!
//! ```text
//! Idle → SessionCheck → InitialLoad → Steady(polling)
//!              ↑                          |
//!              └── backend session change ┘
//! ```
//!
//! - **SessionCheck** fetches `/info`. A changed session uuid means the
//!   backend restarted with fresh data: local state is discarded and a full
//!   reload runs. A matching uuid (restored from disk) skips straight to
//!   Steady.
//! - **InitialLoad** pages through the full history concurrently with the
//!   participant list, retrying with capped exponential backoff until both
//!   succeed or the engine is stopped.
//! - **Steady** polls for updates on a fixed interval. At most one poll is
//!   outstanding at a time; a tick that fires while one is in flight is
//!   skipped, not queued. Failures back off by skipping ticks.
//!
//! Backward pagination and sends run out of band, each behind its own
//! in-flight guard, so a slow history fetch never blocks the poll loop and
//! vice versa.
//!
//! Durability is an opaque blob behind [`StateStore`]: the engine restores
//! it at start (corrupt or absent means cold start, never an error) and
//! saves at lifecycle points. Persistence failures degrade the engine to
//! in-memory operation for the run.

mod config;
mod engine;
mod error;
mod persist;

pub use config::{retry_backoff, SyncConfig};
pub use engine::{SyncEngine, SyncPhase};
pub use error::{SyncError, SyncResult};
pub use persist::{FileStateStore, MemoryStateStore, PersistedState, StateStore, StateStoreHandle};

//! # palaver-store
//!
//! Normalized in-memory store for chat messages and participants.
//!
//! The store is the single owner of entity state. It enforces the merge
//! rules the rest of the engine relies on:
//!
//! - message identifiers are unique; re-applying a batch is a no-op
//! - a stored message is only replaced by a strictly newer `updated_at`
//! - display order is ascending `(sent_at, id)` at all times
//! - participants merge last-write-wins
//!
//! Reads never cause side-effects. Mutations bump a version counter and
//! fan out [`StoreEvent`]s to live subscribers; rendering layers subscribe
//! and pull a [`StoreSnapshot`] when notified.

mod live;
mod store;
mod view;

pub use live::{StoreEvent, StoreSubscription};
pub use store::{EntityStore, SharedStore, StoreSnapshot};
pub use view::{group_by_author, MessageGroup};

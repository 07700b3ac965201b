//! # palaver-outbox
//!
//! Optimistic local sends.
//!
//! The outbox owns no entity state of its own: it only tags which message
//! identifiers are still awaiting server confirmation. The entity store
//! remains the single owner of the messages themselves, including the text
//! a retry re-submits.
//!
//! A send inserts a provisional message immediately (optimistic UI), then
//! dispatches the network call in the background. On confirmation the
//! provisional entry is swapped for the canonical server message in a single
//! store operation; on failure the message is badged failed and left in
//! place until the user retries.

mod outbox;

pub use outbox::Outbox;

//! # palaver-remote
//!
//! Typed HTTP boundary for the Palaver chat backend.
//!
//! [`ChatApi`] is the seam the sync engine and the outbox program against;
//! [`HttpChatClient`] is the production implementation over reqwest. The
//! client performs no retries and no merging; failures are mapped to a
//! [`RemoteError`] and handed to the caller, which owns retry policy.

mod api;
mod error;
mod http;

pub use api::{ChatApi, ChatApiHandle};
pub use error::{RemoteError, RemoteResult};
pub use http::HttpChatClient;

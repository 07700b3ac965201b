//! # palaver-types
//!
//! Domain and wire types for the Palaver chat sync engine.
//!
//! Everything the backend sends is JSON with camelCase keys; the structs in
//! [`models`] deserialize that contract directly and double as the engine's
//! in-memory representation. The one piece of purely local state is
//! [`models::DeliveryStatus`], which the server never sends and which
//! defaults to `Confirmed` on deserialization.

pub mod ids;
pub mod models;

pub use ids::{MessageId, ParticipantId};
pub use models::{
    Attachment, AttachmentKind, ChatInfo, DeliveryStatus, Message, Participant, Reaction,
};

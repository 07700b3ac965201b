//! Chat entities as they appear on the wire.
//!
//! The backend contract is fixed JSON with camelCase keys and epoch
//! millisecond timestamps. These structs are both the wire format and the
//! engine's in-memory representation; only [`DeliveryStatus`] is local state.

use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, ParticipantId};

/// A chat message.
///
/// Invariant: `updated_at >= sent_at`. A message has been edited exactly
/// when the two differ.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub text: String,
    pub author_id: ParticipantId,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    /// When the message was sent (epoch milliseconds, server clock).
    pub sent_at: i64,
    /// When the message last changed (epoch milliseconds, server clock).
    pub updated_at: i64,
    /// Local delivery state. Never sent by the server; anything that came
    /// off the wire is confirmed by definition.
    #[serde(default, skip_serializing_if = "DeliveryStatus::is_confirmed")]
    pub status: DeliveryStatus,
}

impl Message {
    /// Creates a provisional message for an optimistic local send.
    ///
    /// The identifier is client-generated and both timestamps are the local
    /// clock; the canonical server message replaces all of this wholesale on
    /// confirmation.
    pub fn provisional(text: impl Into<String>, author_id: ParticipantId, now_ms: i64) -> Self {
        Self {
            id: MessageId::provisional(),
            text: text.into(),
            author_id,
            attachments: Vec::new(),
            reactions: Vec::new(),
            sent_at: now_ms,
            updated_at: now_ms,
            status: DeliveryStatus::Pending,
        }
    }

    /// Whether this message has been edited since it was sent.
    pub fn is_edited(&self) -> bool {
        self.updated_at != self.sent_at
    }
}

/// Delivery state of a message from the local client's point of view.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Sent optimistically, awaiting server confirmation.
    Pending,
    /// Acknowledged by the server (or received from it).
    #[default]
    Confirmed,
    /// The send failed; surfaced to the user, retried only on request.
    Failed,
}

impl DeliveryStatus {
    /// Used to keep confirmed (the overwhelming default) off the wire.
    pub fn is_confirmed(&self) -> bool {
        matches!(self, DeliveryStatus::Confirmed)
    }
}

/// A file attached to a message. Immutable once attached.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub kind: AttachmentKind,
    pub url: String,
    /// Pixel width.
    pub width: u32,
    /// Pixel height.
    pub height: u32,
}

/// Attachment kind. Only images are rendered today; unknown kinds must
/// still round-trip so newer servers don't break older clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    #[serde(untagged)]
    Other(String),
}

/// A single reaction on a message.
///
/// Owned by exactly one message; the whole list is replaced when a message
/// update supersedes it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub id: String,
    pub participant_id: ParticipantId,
    /// Display glyph, e.g. an emoji.
    pub value: String,
}

/// A chat participant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    pub avatar_url: String,
}

/// Backend session descriptor from `GET /info`.
///
/// A changed `session_uuid` between two fetches means the backend restarted
/// with fresh seed data and all locally cached state must be discarded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatInfo {
    pub session_uuid: String,
    pub api_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire_message() -> &'static str {
        r#"{
            "id": "msg-1",
            "text": "hello there",
            "authorId": "user-7",
            "attachments": [
                { "id": "att-1", "kind": "image", "url": "https://cdn.example/a.png", "width": 640, "height": 480 }
            ],
            "reactions": [
                { "id": "rx-1", "participantId": "user-2", "value": "👍" }
            ],
            "sentAt": 1700000000000,
            "updatedAt": 1700000000000
        }"#
    }

    #[test]
    fn message_parses_from_wire_json() {
        let msg: Message = serde_json::from_str(wire_message()).unwrap();
        assert_eq!(msg.id.as_str(), "msg-1");
        assert_eq!(msg.author_id.as_str(), "user-7");
        assert_eq!(msg.attachments.len(), 1);
        assert_eq!(msg.attachments[0].kind, AttachmentKind::Image);
        assert_eq!(msg.reactions[0].value, "👍");
        assert_eq!(msg.status, DeliveryStatus::Confirmed);
        assert!(!msg.is_edited());
    }

    #[test]
    fn missing_attachments_and_reactions_default_empty() {
        let msg: Message = serde_json::from_str(
            r#"{ "id": "m", "text": "t", "authorId": "a", "sentAt": 1, "updatedAt": 1 }"#,
        )
        .unwrap();
        assert!(msg.attachments.is_empty());
        assert!(msg.reactions.is_empty());
    }

    #[test]
    fn edited_iff_updated_differs_from_sent() {
        let mut msg: Message = serde_json::from_str(wire_message()).unwrap();
        assert!(!msg.is_edited());

        msg.updated_at += 5_000;
        assert!(msg.is_edited());
    }

    #[test]
    fn unknown_attachment_kind_round_trips() {
        let json = r#"{ "id": "att-2", "kind": "video", "url": "u", "width": 1, "height": 1 }"#;
        let att: Attachment = serde_json::from_str(json).unwrap();
        assert_eq!(att.kind, AttachmentKind::Other("video".to_string()));

        let back = serde_json::to_string(&att).unwrap();
        assert!(back.contains("\"video\""));
    }

    #[test]
    fn provisional_message_is_pending_with_local_id() {
        let msg = Message::provisional("hi", ParticipantId::from("me"), 42);
        assert!(msg.id.is_provisional());
        assert_eq!(msg.status, DeliveryStatus::Pending);
        assert_eq!(msg.sent_at, 42);
        assert_eq!(msg.updated_at, 42);
        assert!(!msg.is_edited());
    }

    #[test]
    fn confirmed_status_stays_off_the_wire() {
        let msg: Message = serde_json::from_str(wire_message()).unwrap();
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("status"));

        let pending = Message::provisional("hi", ParticipantId::from("me"), 1);
        let json = serde_json::to_string(&pending).unwrap();
        assert!(json.contains("\"status\":\"pending\""));
    }

    #[test]
    fn chat_info_parses() {
        let info: ChatInfo = serde_json::from_str(
            r#"{ "sessionUuid": "s-1", "apiVersion": "1.4" }"#,
        )
        .unwrap();
        assert_eq!(info.session_uuid, "s-1");
        assert_eq!(info.api_version, "1.4");
    }
}

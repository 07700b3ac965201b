//! Derived render projections.
//!
//! Grouping is stateless: it is computed from the ordered message sequence
//! on demand and never stored, so it can't drift from the store.

use palaver_types::{Message, ParticipantId};

/// A run of consecutive messages by the same author.
#[derive(Debug, PartialEq)]
pub struct MessageGroup<'a> {
    pub author_id: &'a ParticipantId,
    pub messages: Vec<&'a Message>,
}

/// Splits an ordered message sequence into consecutive same-author runs.
///
/// A run ends as soon as a message by a different author intervenes; the
/// same author appearing again later starts a fresh group.
pub fn group_by_author(messages: &[Message]) -> Vec<MessageGroup<'_>> {
    let mut groups: Vec<MessageGroup<'_>> = Vec::new();

    for msg in messages {
        match groups.last_mut() {
            Some(group) if group.author_id == &msg.author_id => {
                group.messages.push(msg);
            }
            _ => {
                groups.push(MessageGroup {
                    author_id: &msg.author_id,
                    messages: vec![msg],
                });
            }
        }
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_types::{DeliveryStatus, MessageId};

    fn msg(id: &str, author: &str, sent_at: i64) -> Message {
        Message {
            id: MessageId::from(id),
            text: id.to_string(),
            author_id: ParticipantId::from(author),
            attachments: Vec::new(),
            reactions: Vec::new(),
            sent_at,
            updated_at: sent_at,
            status: DeliveryStatus::Confirmed,
        }
    }

    #[test]
    fn consecutive_messages_by_one_author_form_one_group() {
        let messages = vec![msg("a", "u1", 1), msg("b", "u1", 2), msg("c", "u1", 3)];
        let groups = group_by_author(&messages);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].messages.len(), 3);
    }

    #[test]
    fn author_change_starts_a_new_group() {
        let messages = vec![
            msg("a", "u1", 1),
            msg("b", "u1", 2),
            msg("c", "u2", 3),
            msg("d", "u1", 4),
        ];
        let groups = group_by_author(&messages);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].author_id, &ParticipantId::from("u1"));
        assert_eq!(groups[1].author_id, &ParticipantId::from("u2"));
        assert_eq!(groups[2].author_id, &ParticipantId::from("u1"));
        assert_eq!(groups[2].messages.len(), 1);
    }

    #[test]
    fn empty_sequence_yields_no_groups() {
        assert!(group_by_author(&[]).is_empty());
    }
}

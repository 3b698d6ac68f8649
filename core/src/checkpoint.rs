use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::chat::{Chat, Message};
use crate::validator::stable_prefix_len;

/// Snapshot of the last validated-stable message sequence of a chat.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct Checkpoint {
    pub id: Uuid,
    pub chat_id: Uuid,
    /// Serialized `Vec<Message>`. Never returned to end users.
    #[serde(skip_serializing)]
    pub snapshot: serde_json::Value,
    pub message_count: i32,
    /// Hex SHA-256 of the canonical snapshot bytes
    pub digest: String,
    pub created_at: DateTime<Utc>,
}

fn digest_of(snapshot: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(snapshot.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

impl Checkpoint {
    /// Capture the longest quiescent stable prefix of `chat`. Returns `None`
    /// when that prefix is empty.
    pub fn capture(chat: &Chat) -> Option<Self> {
        let len = stable_prefix_len(&chat.messages);
        if len == 0 {
            return None;
        }
        Self::from_messages(chat.id, &chat.messages[..len])
    }

    pub fn from_messages(chat_id: Uuid, messages: &[Message]) -> Option<Self> {
        let message_count = i32::try_from(messages.len()).ok()?;
        let snapshot = serde_json::to_value(messages).ok()?;
        Some(Self {
            id: Uuid::now_v7(),
            chat_id,
            digest: digest_of(&snapshot),
            snapshot,
            message_count,
            created_at: Utc::now(),
        })
    }

    pub fn verify(&self) -> bool {
        digest_of(&self.snapshot) == self.digest
    }

    /// Decode the snapshot. `None` if it is corrupt or fails its digest.
    pub fn messages(&self) -> Option<Vec<Message>> {
        if !self.verify() {
            return None;
        }
        let expected = usize::try_from(self.message_count).ok()?;
        let messages: Vec<Message> = serde_json::from_value(self.snapshot.clone()).ok()?;
        (messages.len() == expected).then_some(messages)
    }
}

pub fn retention_cutoff(now: DateTime<Utc>, retention: Duration) -> DateTime<Utc> {
    now - retention
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ToolCall;

    #[test]
    fn captures_only_the_quiescent_prefix() {
        let mut chat = Chat::new(Uuid::now_v7(), Uuid::now_v7());
        let id = chat.id;
        chat.messages = vec![
            Message::user(id, "hi"),
            Message::assistant(id, "hello", vec![]),
            Message::user(id, "search"),
            Message::assistant(id, "", vec![ToolCall::new("c1", "search")]),
        ];
        let checkpoint = Checkpoint::capture(&chat).expect("non-empty prefix");
        assert_eq!(checkpoint.message_count, 3);
        let restored = checkpoint.messages().expect("snapshot decodes");
        assert_eq!(restored, chat.messages[..3].to_vec());
    }

    #[test]
    fn empty_chat_has_no_checkpoint() {
        let chat = Chat::new(Uuid::now_v7(), Uuid::now_v7());
        assert!(Checkpoint::capture(&chat).is_none());
    }

    #[test]
    fn tampered_snapshot_is_rejected() {
        let id = Uuid::now_v7();
        let mut checkpoint =
            Checkpoint::from_messages(id, &[Message::user(id, "hi")]).expect("serializable");
        assert!(checkpoint.verify());
        checkpoint.snapshot = serde_json::json!([]);
        assert!(!checkpoint.verify());
        assert!(checkpoint.messages().is_none());
    }

    #[test]
    fn negative_message_count_is_unreadable() {
        let id = Uuid::now_v7();
        let mut checkpoint =
            Checkpoint::from_messages(id, &[Message::user(id, "hi")]).expect("serializable");
        checkpoint.message_count = -1;
        assert!(checkpoint.verify());
        assert!(checkpoint.messages().is_none());
    }
}

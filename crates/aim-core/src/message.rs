use serde::{Deserialize, Serialize};

use crate::error::AimError;
use crate::types::Timestamp;

// ── Conversation ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationType {
    Direct,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    In,
    Out,
}

// ── Status lattice ───────────────────────────────────────────────────────────

/// Delivery status. Upgrades follow the monotone order
/// `pending < sent < delivered < read`; `failed` is a terminal sink reachable
/// only from `pending` or from an empty slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    fn rank(self) -> u8 {
        match self {
            MessageStatus::Pending => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Delivered => 2,
            MessageStatus::Read => 3,
            // Failed sits outside the order; merge() special-cases it.
            MessageStatus::Failed => 0,
        }
    }

    /// Merge an incoming status into the current one. Regardless of arrival
    /// order the result is the lattice maximum; `failed` only lands on
    /// `pending` (or an empty slot) and never downgrades `sent`/`delivered`/
    /// `read`. Once failed, a slot stays failed.
    pub fn merge(current: Option<MessageStatus>, next: MessageStatus) -> MessageStatus {
        match current {
            None => next,
            Some(MessageStatus::Failed) => MessageStatus::Failed,
            Some(cur) => {
                if next == MessageStatus::Failed {
                    if cur == MessageStatus::Pending {
                        MessageStatus::Failed
                    } else {
                        cur
                    }
                } else if next.rank() > cur.rank() {
                    next
                } else {
                    cur
                }
            }
        }
    }
}

// ── Message ──────────────────────────────────────────────────────────────────

/// One persisted chat message, inbound or outbound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Stable unique id (`msg1_…` for locally composed messages; inbound
    /// messages keep the sender-assigned wire id).
    pub id: String,
    /// The direct peer, or the sender for group messages.
    pub contact_id: String,
    /// Normalized on save: direct messages default to `contact_id`.
    #[serde(default)]
    pub conversation_id: String,
    pub conversation_type: ConversationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(with = "content_hex")]
    pub content: Vec<u8>,
    pub content_type: String,
    /// UTC milliseconds.
    pub timestamp: Timestamp,
    pub direction: Direction,
    pub status: MessageStatus,
    #[serde(default)]
    pub edited: bool,
}

mod content_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    // Hex keeps the persisted snapshot greppable while staying binary-safe.
    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

impl Message {
    /// Apply save-time normalization: a direct message with no conversation id
    /// belongs to the conversation named after its contact.
    pub fn normalize(&mut self) {
        if self.conversation_type == ConversationType::Direct && self.conversation_id.is_empty() {
            self.conversation_id = self.contact_id.clone();
        }
    }

    /// Canonical serialized form used for the byte-identical re-save check.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, AimError> {
        serde_json::to_vec(self).map_err(|e| AimError::Storage(e.to_string()))
    }
}

// ── Pending retry record ─────────────────────────────────────────────────────

/// One outbound message awaiting re-publish. Created when a publish fails
/// transiently; removed on success or when the retry cap overflows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMessage {
    pub message_id: String,
    pub retry_count: u32,
    pub next_retry_at: Timestamp,
    #[serde(default)]
    pub last_error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_merge_is_monotone() {
        use MessageStatus::*;
        assert_eq!(MessageStatus::merge(Some(Pending), Sent), Sent);
        assert_eq!(MessageStatus::merge(Some(Sent), Pending), Sent);
        assert_eq!(MessageStatus::merge(Some(Delivered), Sent), Delivered);
        assert_eq!(MessageStatus::merge(Some(Read), Delivered), Read);
    }

    #[test]
    fn failed_only_from_pending_or_empty() {
        use MessageStatus::*;
        assert_eq!(MessageStatus::merge(None, Failed), Failed);
        assert_eq!(MessageStatus::merge(Some(Pending), Failed), Failed);
        assert_eq!(MessageStatus::merge(Some(Delivered), Failed), Delivered);
        assert_eq!(MessageStatus::merge(Some(Read), Failed), Read);
    }

    #[test]
    fn failed_is_a_sink() {
        use MessageStatus::*;
        assert_eq!(MessageStatus::merge(Some(Failed), Read), Failed);
        assert_eq!(MessageStatus::merge(Some(Failed), Sent), Failed);
    }

    #[test]
    fn direct_message_normalizes_conversation() {
        let mut m = Message {
            id: "msg1_aa".into(),
            contact_id: "aim1friend".into(),
            conversation_id: String::new(),
            conversation_type: ConversationType::Direct,
            thread_id: None,
            content: b"hi".to_vec(),
            content_type: "text/plain".into(),
            timestamp: 1,
            direction: Direction::Out,
            status: MessageStatus::Pending,
            edited: false,
        };
        m.normalize();
        assert_eq!(m.conversation_id, "aim1friend");
    }
}

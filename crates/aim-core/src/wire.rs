use serde::{Deserialize, Serialize};

use crate::message::{ConversationType, MessageStatus};
use crate::types::{IdentityId, Timestamp};

// ── Wire kinds ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireKind {
    Chat,
    GroupEvent,
    Receipt,
    DeviceRevoke,
}

impl WireKind {
    /// Latency-critical wires are never padded and never delayed, and do not
    /// trigger delivered receipts.
    pub fn latency_critical(&self) -> bool {
        matches!(self, WireKind::Receipt | WireKind::DeviceRevoke)
    }
}

// ── Embedded bodies ──────────────────────────────────────────────────────────

/// Inbound device revocation, relayed inside a `device_revoke` wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRevocation {
    pub device_id: String,
    pub issued_at: Timestamp,
    /// Identity signature over `"revoke|{device_id}|{issued_at}"`, base64.
    pub sig: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptBody {
    pub message_id: String,
    pub status: MessageStatus,
}

// ── Wire ─────────────────────────────────────────────────────────────────────

/// The signed JSON envelope exchanged over the transport for one logical
/// message or event. Field order is fixed by declaration order so padding
/// arithmetic is stable across re-serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wire {
    pub kind: WireKind,
    /// Unique per wire; doubles as the replay-guard unique id and as the
    /// message id for chat wires.
    pub wire_id: String,
    pub sender: IdentityId,
    pub sender_device: String,
    #[serde(default)]
    pub conversation_id: String,
    pub conversation_type: ConversationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Sender-side event time, UTC milliseconds.
    pub occurred_at: Timestamp,
    /// Session ciphertext, base64. Mutually exclusive with `plain`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ciphertext: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Sender's contact-card fingerprint, hex. Receivers cross-check it
    /// against their contact record when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocation: Option<DeviceRevocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<ReceiptBody>,
    /// Detached device signature over `signing_bytes()`, base64.
    #[serde(default)]
    pub device_sig: String,
    /// Metadata-hardening filler; semantically empty.
    #[serde(default)]
    pub padding: String,
}

impl Wire {
    pub fn latency_critical(&self) -> bool {
        self.kind.latency_critical()
    }

    /// The canonical bytes the device signature covers: this wire serialized
    /// with the signature and padding fields blank.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.device_sig = String::new();
        unsigned.padding = String::new();
        serde_json::to_vec(&unsigned).expect("wire serialization is infallible")
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("wire serialization is infallible")
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

// ── Transport envelope ───────────────────────────────────────────────────────

/// The transport-level record carried by the gossip layer: an opaque payload
/// (the serialized wire) addressed to one recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivateEnvelope {
    pub id: String,
    pub sender_id: IdentityId,
    pub recipient: IdentityId,
    pub payload: Vec<u8>,
}

impl PrivateEnvelope {
    /// Serialize for gossip propagation.
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("envelope serialization is infallible")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

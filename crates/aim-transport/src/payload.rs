use aim_core::error::UnavailableReason;
use aim_core::interfaces::{BlobAnnounce, FetchedBlob};
use aim_core::types::IdentityId;
use aim_core::wire::PrivateEnvelope;
use aim_core::AimError;
use serde::{Deserialize, Serialize};

/// Everything that rides the gossip mesh. Private envelopes and blob
/// request/response travel on per-identity topics; announces on the shared
/// announce topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipPayload {
    Private(PrivateEnvelope),
    Announce(BlobAnnounce),
    BlobRequest {
        req_id: String,
        blob_id: String,
        requester: IdentityId,
    },
    BlobResponse {
        req_id: String,
        result: Result<FetchedBlob, ServeError>,
    },
}

/// Serving-side refusals that must survive the wire with their meaning
/// intact; the fetch loop treats an access denial very differently from a
/// transient failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServeError {
    AccessDenied,
    NotFound,
    TemporarilyUnavailable,
    Other(String),
}

impl From<&AimError> for ServeError {
    fn from(e: &AimError) -> Self {
        match e {
            AimError::AttachmentAccessDenied => ServeError::AccessDenied,
            AimError::AttachmentNotFound(_) => ServeError::NotFound,
            AimError::AttachmentTemporarilyUnavailable { .. } => {
                ServeError::TemporarilyUnavailable
            }
            other => ServeError::Other(other.to_string()),
        }
    }
}

impl From<ServeError> for AimError {
    fn from(e: ServeError) -> Self {
        match e {
            ServeError::AccessDenied => AimError::AttachmentAccessDenied,
            ServeError::NotFound => AimError::AttachmentNotFound("remote".into()),
            ServeError::TemporarilyUnavailable => AimError::AttachmentTemporarilyUnavailable {
                reason: UnavailableReason::ProvidersFailed,
            },
            ServeError::Other(msg) => AimError::Transport(msg),
        }
    }
}

impl GossipPayload {
    /// Serialize for gossip propagation.
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("gossip payload serialization is infallible")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// The per-identity gossip topic carrying private traffic for `id`.
pub fn private_topic(id: &str) -> String {
    format!("aim/private/{id}")
}

/// The shared topic carrying provider announces.
pub const ANNOUNCE_TOPIC: &str = "aim/blob-announce";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trips() {
        let p = GossipPayload::BlobRequest {
            req_id: "r1".into(),
            blob_id: "att1_00".into(),
            requester: "aim1peer".into(),
        };
        let back = GossipPayload::from_bytes(&p.to_bytes()).unwrap();
        match back {
            GossipPayload::BlobRequest { req_id, blob_id, requester } => {
                assert_eq!(req_id, "r1");
                assert_eq!(blob_id, "att1_00");
                assert_eq!(requester, "aim1peer");
            }
            _ => panic!("wrong variant"),
        }
    }
}

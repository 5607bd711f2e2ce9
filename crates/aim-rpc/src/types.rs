use serde::{Deserialize, Serialize};

use aim_core::message::{ConversationType, Direction, Message, MessageStatus};
use aim_service::MetricsSnapshot;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcMessage {
    pub id: String,
    pub contact_id: String,
    pub conversation_id: String,
    pub conversation_type: ConversationType,
    pub thread_id: Option<String>,
    pub content_b64: String,
    pub content_type: String,
    pub timestamp_ms: i64,
    pub direction: Direction,
    pub status: MessageStatus,
    pub edited: bool,
}

impl From<Message> for RpcMessage {
    fn from(m: Message) -> Self {
        use base64::Engine as _;
        Self {
            id: m.id,
            contact_id: m.contact_id,
            conversation_id: m.conversation_id,
            conversation_type: m.conversation_type,
            thread_id: m.thread_id,
            content_b64: base64::engine::general_purpose::STANDARD.encode(&m.content),
            content_type: m.content_type,
            timestamp_ms: m.timestamp,
            direction: m.direction,
            status: m.status,
            edited: m.edited,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcAttachmentMeta {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub class: String,
    pub size: u64,
    pub created_at: i64,
    pub last_access_at: i64,
    pub pinned: bool,
}

impl From<aim_core::attachment::AttachmentMeta> for RpcAttachmentMeta {
    fn from(m: aim_core::attachment::AttachmentMeta) -> Self {
        Self {
            id: m.id.clone(),
            name: m.name.clone(),
            mime_type: m.mime_type.clone(),
            class: m.class.as_str().to_string(),
            size: m.size,
            created_at: m.created_at,
            last_access_at: m.last_access_at,
            pinned: m.pinned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcBlob {
    pub name: String,
    pub mime_type: String,
    pub data_b64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcDaemonStatus {
    pub identity_fingerprint: String,
    pub active_account: String,
    pub networking_active: bool,
    pub transport_state: String,
    pub listen_addresses: Vec<String>,
    pub peer_count: usize,
    pub pending_queue: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcLinkCode {
    pub link_code: String,
    pub challenge: String,
    pub expires_at: i64,
    pub identity_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcBindingRecord {
    pub identity_id: String,
    pub node_id: String,
    pub bound_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcAccount {
    pub id: String,
    pub rel_path: String,
    pub created_at: i64,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcEnrollmentClaims {
    pub token_id: String,
    pub subject_node_group: String,
    pub expires_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcServingLimits {
    pub soft_kbps: u32,
    pub hard_kbps: u32,
    pub max_concurrent: u32,
    pub per_peer_per_minute: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcStoragePolicy {
    pub image_max_item_bytes: Option<u64>,
    pub image_quota_bytes: Option<u64>,
    pub file_max_item_bytes: Option<u64>,
    pub file_quota_bytes: Option<u64>,
    pub image_ttl_ms: Option<i64>,
    pub file_ttl_ms: Option<i64>,
    pub high_watermark: Option<u8>,
    pub full_cap: Option<u8>,
    pub aggressive_target: Option<u8>,
}

pub type RpcMetrics = MetricsSnapshot;

//! Interface contracts for the daemon's external collaborators: the gossip
//! transport, the E2EE session manager, and the identity manager. The service
//! core only ever sees these traits; concrete implementations live in
//! `aim-transport` and `aim-crypto`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::AimError;
use crate::types::{IdentityId, Timestamp};
use crate::wire::{DeviceRevocation, PrivateEnvelope};

// ── Transport ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    Stopped,
    Starting,
    Running,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportStatus {
    pub state: TransportState,
    pub peer_count: usize,
    /// Timestamp of the last successful sync or inbound delivery, UTC millis.
    pub last_sync: Timestamp,
    pub bootstrap_peers: usize,
    pub bootstrap_connected: bool,
}

/// Callback invoked for every inbound private envelope addressed to us.
pub type InboundCallback = Arc<dyn Fn(PrivateEnvelope) + Send + Sync>;

/// Callback invoked when a peer announces that it can serve a blob.
pub type AnnounceCallback = Arc<dyn Fn(BlobAnnounce) + Send + Sync>;

/// Local serving hook: given `(requester, blob_id)`, read the blob or refuse.
/// Runs on the serving node with its ACL and bandwidth guards applied.
pub type BlobServeFn =
    Arc<dyn Fn(&str, &str) -> Result<FetchedBlob, AimError> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobAnnounce {
    pub blob_id: String,
    pub provider: IdentityId,
    /// Validity of the announcement, milliseconds.
    pub ttl_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedBlob {
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// The pub/sub-and-store gossip network. Consumed by the service; only this
/// surface is relied upon.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn start(&self) -> Result<(), AimError>;
    async fn stop(&self) -> Result<(), AimError>;

    /// Bind the local identity; must be called before `start`.
    fn set_identity(&self, id: IdentityId);

    /// Addresses the transport is currently listening on. Empty while
    /// stopped, and possibly briefly empty right after start while listeners
    /// bind.
    async fn listen_addresses(&self) -> Vec<String>;

    /// Register the single ingress callback for inbound private envelopes.
    fn subscribe_private(&self, cb: InboundCallback);

    async fn publish_private(&self, env: PrivateEnvelope) -> Result<(), AimError>;

    /// Store-and-forward recovery: envelopes addressed to `recipient` first
    /// seen after `since`, capped at `max`.
    async fn fetch_private_since(
        &self,
        recipient: &str,
        since: Timestamp,
        max: usize,
    ) -> Result<Vec<PrivateEnvelope>, AimError>;

    fn status(&self) -> TransportStatus;

    // ── Blob distribution plumbing ───────────────────────────────────────────

    /// Broadcast that this node can serve `blob_id` for `ttl_ms`.
    async fn announce_blob(&self, blob_id: &str, ttl_ms: i64) -> Result<(), AimError>;

    fn subscribe_blob_announce(&self, cb: AnnounceCallback);

    /// Install the local serving hook invoked when peers fetch from us.
    fn set_blob_server(&self, serve: BlobServeFn);

    /// Fetch `blob_id` from `provider` over the wire.
    async fn fetch_blob(&self, provider: &str, blob_id: &str)
        -> Result<FetchedBlob, AimError>;
}

// ── Session manager ──────────────────────────────────────────────────────────

/// Ratcheted E2EE sessions, one per contact. The core never introspects
/// session state beyond encrypt/decrypt and snapshotting for backup.
pub trait SessionManager: Send + Sync {
    fn init_session(
        &self,
        local_id: &str,
        contact_id: &str,
        shared_key: [u8; 32],
    ) -> Result<(), AimError>;

    fn has_session(&self, contact_id: &str) -> bool;

    fn encrypt(&self, contact_id: &str, plaintext: &[u8]) -> Result<Vec<u8>, AimError>;

    fn decrypt(&self, contact_id: &str, ciphertext: &[u8]) -> Result<Vec<u8>, AimError>;

    /// Opaque snapshot of all session state for backup export.
    fn snapshot(&self) -> Result<serde_json::Value, AimError>;

    fn restore(&self, snapshot: serde_json::Value) -> Result<(), AimError>;

    fn wipe(&self);
}

// ── Identity manager ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactRecord {
    pub identity_id: IdentityId,
    /// Hex fingerprint of the contact's identity public key.
    pub fingerprint: String,
    pub verified: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceAuth {
    pub device_id: String,
    /// Detached signature, base64.
    pub signature: String,
}

pub trait IdentityManager: Send + Sync {
    fn identity(&self) -> IdentityId;

    /// Base64 of the identity public key (used in binding records).
    fn identity_public_key_b64(&self) -> String;

    /// Hex fingerprint of the local identity public key, embedded in
    /// outbound wires as the contact card fingerprint.
    fn own_fingerprint(&self) -> String;

    fn has_contact(&self, id: &str) -> bool;

    fn has_verified_contact(&self, id: &str) -> bool;

    fn contact(&self, id: &str) -> Option<ContactRecord>;

    fn add_contact_by_identity_id(&self, id: &str) -> Result<(), AimError>;

    /// Sign `payload` with the active device key.
    fn active_device_auth(&self, payload: &[u8]) -> Result<DeviceAuth, AimError>;

    /// Verify a device signature against `sender`'s known device set.
    fn verify_device(
        &self,
        sender: &str,
        device_id: &str,
        payload: &[u8],
        signature_b64: &str,
    ) -> Result<(), AimError>;

    fn apply_device_revocation(
        &self,
        sender: &str,
        rev: &DeviceRevocation,
    ) -> Result<(), AimError>;

    /// Sign with the long-term identity key (account-binding records).
    fn sign_with_identity(&self, payload: &[u8]) -> Result<String, AimError>;

    /// Opaque snapshot of identity key material for backup export.
    fn snapshot_identity_keys(&self) -> Result<serde_json::Value, AimError>;

    /// Replace the local identity with a previously exported snapshot
    /// (backup restore, identity import).
    fn restore_identity_keys(&self, snapshot: serde_json::Value) -> Result<(), AimError>;
}

// ── Blob fetch callbacks ─────────────────────────────────────────────────────

/// Deferred fetch from one provider, registered in the provider registry.
pub type BlobFetchFn =
    Arc<dyn Fn() -> BoxFuture<'static, Result<FetchedBlob, AimError>> + Send + Sync>;

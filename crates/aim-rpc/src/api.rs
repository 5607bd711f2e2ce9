use jsonrpsee::core::RpcResult;
use jsonrpsee::proc_macros::rpc;

use crate::types::{
    RpcAccount, RpcAttachmentMeta, RpcBindingRecord, RpcBlob, RpcDaemonStatus,
    RpcEnrollmentClaims, RpcLinkCode, RpcMessage, RpcMetrics, RpcServingLimits,
    RpcStoragePolicy,
};

/// AIM daemon JSON-RPC 2.0 API definition.
///
/// All method names are prefixed with "aim_" via `namespace = "aim"`.
#[rpc(server, namespace = "aim")]
pub trait AimApi {
    /// Daemon status: identity fingerprint, active profile, networking state.
    #[method(name = "getStatus")]
    async fn get_status(&self) -> RpcResult<RpcDaemonStatus>;

    /// Single metrics snapshot (counters, latencies, disk usage).
    #[method(name = "getMetrics")]
    async fn get_metrics(&self) -> RpcResult<RpcMetrics>;

    // ── Networking ────────────────────────────────────────────────────────────

    #[method(name = "startNetworking")]
    async fn start_networking(&self) -> RpcResult<bool>;

    #[method(name = "stopNetworking")]
    async fn stop_networking(&self) -> RpcResult<bool>;

    // ── Chat ─────────────────────────────────────────────────────────────────

    /// Send a direct message. `content_b64` is the raw content base64-encoded.
    #[method(name = "sendMessage")]
    async fn send_message(
        &self,
        contact_id: String,
        content_b64: String,
        content_type: String,
    ) -> RpcResult<RpcMessage>;

    /// Send into a group conversation.
    #[method(name = "sendGroupMessage")]
    async fn send_group_message(
        &self,
        group_id: String,
        content_b64: String,
        content_type: String,
    ) -> RpcResult<RpcMessage>;

    /// Paginated conversation listing, timestamp ascending.
    #[method(name = "listMessages")]
    async fn list_messages(
        &self,
        conversation_id: String,
        conversation_type: String,
        limit: usize,
        offset: usize,
    ) -> RpcResult<Vec<RpcMessage>>;

    /// Mark a message read and emit the read receipt.
    #[method(name = "markRead")]
    async fn mark_read(&self, contact_id: String, message_id: String) -> RpcResult<bool>;

    // ── Contacts & privacy ───────────────────────────────────────────────────

    #[method(name = "addContact")]
    async fn add_contact(&self, identity_id: String) -> RpcResult<bool>;

    /// Privacy mode: "everyone", "contacts_only" or "nobody".
    #[method(name = "setPrivacyMode")]
    async fn set_privacy_mode(&self, mode: String) -> RpcResult<bool>;

    #[method(name = "blockContact")]
    async fn block_contact(&self, identity_id: String) -> RpcResult<bool>;

    #[method(name = "unblockContact")]
    async fn unblock_contact(&self, identity_id: String) -> RpcResult<bool>;

    // ── Request inbox ────────────────────────────────────────────────────────

    /// Queued request threads: sender → messages.
    #[method(name = "listInbox")]
    async fn list_inbox(&self) -> RpcResult<std::collections::BTreeMap<String, Vec<RpcMessage>>>;

    /// Accept a sender's thread into the message log. Returns moved count.
    #[method(name = "acceptInbox")]
    async fn accept_inbox(&self, sender: String) -> RpcResult<usize>;

    #[method(name = "declineInbox")]
    async fn decline_inbox(&self, sender: String) -> RpcResult<bool>;

    // ── Attachments / blobs ──────────────────────────────────────────────────

    #[method(name = "putAttachment")]
    async fn put_attachment(
        &self,
        name: String,
        mime_type: String,
        data_b64: String,
    ) -> RpcResult<RpcAttachmentMeta>;

    /// Local read or provider fetch with failover.
    #[method(name = "getAttachment")]
    async fn get_attachment(&self, blob_id: String) -> RpcResult<RpcBlob>;

    #[method(name = "pinBlob")]
    async fn pin_blob(&self, blob_id: String) -> RpcResult<RpcAttachmentMeta>;

    #[method(name = "unpinBlob")]
    async fn unpin_blob(&self, blob_id: String) -> RpcResult<RpcAttachmentMeta>;

    // ── Enrollment & node binding ────────────────────────────────────────────

    /// Verify and redeem a single-use enrollment token.
    #[method(name = "redeemEnrollmentToken")]
    async fn redeem_enrollment_token(&self, token: String) -> RpcResult<RpcEnrollmentClaims>;

    #[method(name = "createNodeBindingLinkCode")]
    async fn create_node_binding_link_code(&self, ttl_seconds: i64) -> RpcResult<RpcLinkCode>;

    #[method(name = "completeNodeBinding")]
    async fn complete_node_binding(
        &self,
        link_code: String,
        node_id: String,
        node_public_key_b64: String,
        node_signature_b64: String,
        allow_rebind: bool,
    ) -> RpcResult<RpcBindingRecord>;

    /// Remove the active binding. `confirm` must be true.
    #[method(name = "unbindNode")]
    async fn unbind_node(&self, node_id: Option<String>, confirm: bool) -> RpcResult<bool>;

    // ── Account profiles ─────────────────────────────────────────────────────

    #[method(name = "listAccounts")]
    async fn list_accounts(&self) -> RpcResult<Vec<RpcAccount>>;

    #[method(name = "switchAccount")]
    async fn switch_account(&self, id: String) -> RpcResult<bool>;

    /// Allocate a fresh profile with a newly generated identity. Returns the
    /// profile id.
    #[method(name = "createIdentity")]
    async fn create_identity(&self) -> RpcResult<String>;

    /// Allocate a fresh profile seeded with an exported identity snapshot.
    #[method(name = "importIdentity")]
    async fn import_identity(&self, snapshot: serde_json::Value) -> RpcResult<String>;

    // ── Data lifecycle ───────────────────────────────────────────────────────

    /// Destroy content state. `consent` must match exactly.
    #[method(name = "wipeData")]
    async fn wipe_data(&self, consent: String) -> RpcResult<bool>;

    /// Export a sealed backup bundle, base64-encoded.
    #[method(name = "exportBackup")]
    async fn export_backup(&self, consent: String, passphrase: String) -> RpcResult<String>;

    #[method(name = "restoreBackup")]
    async fn restore_backup(
        &self,
        consent: String,
        passphrase: String,
        blob_b64: String,
    ) -> RpcResult<bool>;

    // ── Policies & diagnostics ───────────────────────────────────────────────

    #[method(name = "setBlobNodePreset")]
    async fn set_blob_node_preset(&self, limits: RpcServingLimits) -> RpcResult<bool>;

    #[method(name = "updateNodePolicies")]
    async fn update_node_policies(
        &self,
        acl_mode: Option<String>,
        allowlist: Option<Vec<String>>,
        public_serving: Option<bool>,
    ) -> RpcResult<bool>;

    #[method(name = "updateStoragePolicy")]
    async fn update_storage_policy(&self, policy: RpcStoragePolicy) -> RpcResult<bool>;

    /// Redacted diagnostics bundle as a JSON string.
    #[method(name = "exportDiagnosticsBundle")]
    async fn export_diagnostics_bundle(&self, window_minutes: i64) -> RpcResult<String>;
}

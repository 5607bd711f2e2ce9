use std::net::SocketAddr;
use std::sync::Arc;

use base64::Engine as _;
use jsonrpsee::core::{async_trait, RpcResult};
use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::types::ErrorObject;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use aim_core::attachment::{AttachmentClassLimits, AttachmentTtls, ClassLimits, HardCapPolicy};
use aim_core::message::ConversationType;
use aim_core::{AimError, CancelToken, ErrorCategory};
use aim_service::config::{AclMode, PrivacyMode, ServingLimits};
use aim_service::Service;

use crate::api::AimApiServer;
use crate::types::{
    RpcAccount, RpcAttachmentMeta, RpcBindingRecord, RpcBlob, RpcDaemonStatus,
    RpcEnrollmentClaims, RpcLinkCode, RpcMessage, RpcMetrics, RpcServingLimits,
    RpcStoragePolicy,
};

fn rpc_err(code: i32, msg: impl Into<String>) -> ErrorObject<'static> {
    ErrorObject::owned(code, msg.into(), None::<()>)
}

/// Map a service error onto a JSON-RPC error code by category.
fn map_err(e: AimError) -> ErrorObject<'static> {
    let code = match e.category() {
        ErrorCategory::Api => -32602,
        ErrorCategory::Policy => -32001,
        ErrorCategory::Network => -32002,
        ErrorCategory::Storage => -32003,
        ErrorCategory::Crypto => -32004,
        ErrorCategory::State => -32603,
    };
    rpc_err(code, e.to_string())
}

fn decode_b64(data: &str, what: &str) -> Result<Vec<u8>, ErrorObject<'static>> {
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| rpc_err(-32602, format!("invalid base64 {what}: {e}")))
}

fn parse_conversation_type(s: &str) -> Result<ConversationType, ErrorObject<'static>> {
    match s {
        "direct" => Ok(ConversationType::Direct),
        "group" => Ok(ConversationType::Group),
        other => Err(rpc_err(-32602, format!("unknown conversation type: {other}"))),
    }
}

/// Shared state passed to the RPC server.
pub struct RpcServerState {
    pub service: Arc<Service>,
}

/// The RPC server implementation.
pub struct RpcServer {
    state: Arc<RpcServerState>,
}

impl RpcServer {
    pub fn new(state: Arc<RpcServerState>) -> Self {
        Self { state }
    }

    /// Start the JSON-RPC server on `addr` with permissive CORS headers.
    /// Returns a handle to stop it.
    pub async fn start(self, addr: SocketAddr) -> anyhow::Result<ServerHandle> {
        let cors = CorsLayer::new()
            .allow_methods(Any)
            .allow_origin(Any)
            .allow_headers(Any);

        let server = Server::builder()
            .set_http_middleware(tower::ServiceBuilder::new().layer(cors))
            .build(addr)
            .await?;

        let module = self.into_rpc();
        let handle = server.start(module);
        info!(%addr, "RPC server started");
        Ok(handle)
    }

    fn service(&self) -> &Arc<Service> {
        &self.state.service
    }
}

#[async_trait]
impl AimApiServer for RpcServer {
    async fn get_status(&self) -> RpcResult<RpcDaemonStatus> {
        let service = self.service();
        let transport = service.transport.status();
        let listen_addresses = service.transport.listen_addresses().await;
        let snap = service.metrics_snapshot();
        Ok(RpcDaemonStatus {
            identity_fingerprint: service.sanitizer.fingerprint(&service.identity_id()),
            active_account: service.active_account(),
            networking_active: service.networking_active(),
            transport_state: format!("{:?}", transport.state).to_lowercase(),
            listen_addresses,
            peer_count: transport.peer_count,
            pending_queue: snap.pending_queue,
        })
    }

    async fn get_metrics(&self) -> RpcResult<RpcMetrics> {
        Ok(self.service().metrics_snapshot())
    }

    async fn start_networking(&self) -> RpcResult<bool> {
        self.service().start_networking().await.map_err(map_err)?;
        Ok(true)
    }

    async fn stop_networking(&self) -> RpcResult<bool> {
        self.service().stop_networking().await.map_err(map_err)?;
        Ok(true)
    }

    async fn send_message(
        &self,
        contact_id: String,
        content_b64: String,
        content_type: String,
    ) -> RpcResult<RpcMessage> {
        let content = decode_b64(&content_b64, "content")?;
        let cancel = CancelToken::new();
        let msg = self
            .service()
            .send_message(&cancel, &contact_id, content, &content_type)
            .await
            .map_err(map_err)?;
        Ok(msg.into())
    }

    async fn send_group_message(
        &self,
        group_id: String,
        content_b64: String,
        content_type: String,
    ) -> RpcResult<RpcMessage> {
        let content = decode_b64(&content_b64, "content")?;
        let cancel = CancelToken::new();
        let msg = self
            .service()
            .send_group_message(&cancel, &group_id, content, &content_type)
            .await
            .map_err(map_err)?;
        Ok(msg.into())
    }

    async fn list_messages(
        &self,
        conversation_id: String,
        conversation_type: String,
        limit: usize,
        offset: usize,
    ) -> RpcResult<Vec<RpcMessage>> {
        let ctype = parse_conversation_type(&conversation_type)?;
        Ok(self
            .service()
            .list_messages(&conversation_id, ctype, limit, offset)
            .into_iter()
            .map(RpcMessage::from)
            .collect())
    }

    async fn mark_read(&self, contact_id: String, message_id: String) -> RpcResult<bool> {
        self.service().mark_read(&contact_id, &message_id).await.map_err(map_err)?;
        Ok(true)
    }

    async fn add_contact(&self, identity_id: String) -> RpcResult<bool> {
        self.service().add_contact(&identity_id).map_err(map_err)?;
        Ok(true)
    }

    async fn set_privacy_mode(&self, mode: String) -> RpcResult<bool> {
        let mode = match mode.as_str() {
            "everyone" => PrivacyMode::Everyone,
            "contacts_only" => PrivacyMode::ContactsOnly,
            "nobody" => PrivacyMode::Nobody,
            other => return Err(rpc_err(-32602, format!("unknown privacy mode: {other}"))),
        };
        self.service().set_privacy_mode(mode);
        Ok(true)
    }

    async fn block_contact(&self, identity_id: String) -> RpcResult<bool> {
        self.service().block_contact(&identity_id);
        Ok(true)
    }

    async fn unblock_contact(&self, identity_id: String) -> RpcResult<bool> {
        self.service().unblock_contact(&identity_id);
        Ok(true)
    }

    async fn list_inbox(
        &self,
    ) -> RpcResult<std::collections::BTreeMap<String, Vec<RpcMessage>>> {
        Ok(self
            .service()
            .inbox_threads()
            .into_iter()
            .map(|(sender, msgs)| (sender, msgs.into_iter().map(RpcMessage::from).collect()))
            .collect())
    }

    async fn accept_inbox(&self, sender: String) -> RpcResult<usize> {
        self.service().inbox_accept(&sender).map_err(map_err)
    }

    async fn decline_inbox(&self, sender: String) -> RpcResult<bool> {
        self.service().inbox_decline(&sender).map_err(map_err)?;
        Ok(true)
    }

    async fn put_attachment(
        &self,
        name: String,
        mime_type: String,
        data_b64: String,
    ) -> RpcResult<RpcAttachmentMeta> {
        let data = decode_b64(&data_b64, "attachment data")?;
        let meta =
            self.service().put_attachment(&name, &mime_type, &data).await.map_err(map_err)?;
        Ok(meta.into())
    }

    async fn get_attachment(&self, blob_id: String) -> RpcResult<RpcBlob> {
        let cancel = CancelToken::new();
        let blob = self.service().get_attachment(&cancel, &blob_id).await.map_err(map_err)?;
        Ok(RpcBlob {
            name: blob.name,
            mime_type: blob.mime_type,
            data_b64: base64::engine::general_purpose::STANDARD.encode(&blob.data),
        })
    }

    async fn pin_blob(&self, blob_id: String) -> RpcResult<RpcAttachmentMeta> {
        Ok(self.service().pin_blob(&blob_id).await.map_err(map_err)?.into())
    }

    async fn unpin_blob(&self, blob_id: String) -> RpcResult<RpcAttachmentMeta> {
        Ok(self.service().unpin_blob(&blob_id).await.map_err(map_err)?.into())
    }

    async fn redeem_enrollment_token(&self, token: String) -> RpcResult<RpcEnrollmentClaims> {
        let claims = self.service().redeem_enrollment_token(&token).map_err(map_err)?;
        Ok(RpcEnrollmentClaims {
            token_id: claims.token_id,
            subject_node_group: claims.subject_node_group,
            expires_at: claims.expires_at,
        })
    }

    async fn create_node_binding_link_code(&self, ttl_seconds: i64) -> RpcResult<RpcLinkCode> {
        let grant = self.service().create_node_binding_link_code(ttl_seconds);
        Ok(RpcLinkCode {
            link_code: grant.link_code,
            challenge: grant.challenge,
            expires_at: grant.expires_at,
            identity_id: grant.identity_id,
        })
    }

    async fn complete_node_binding(
        &self,
        link_code: String,
        node_id: String,
        node_public_key_b64: String,
        node_signature_b64: String,
        allow_rebind: bool,
    ) -> RpcResult<RpcBindingRecord> {
        let record = self
            .service()
            .complete_node_binding(
                &link_code,
                &node_id,
                &node_public_key_b64,
                &node_signature_b64,
                allow_rebind,
            )
            .map_err(map_err)?;
        Ok(RpcBindingRecord {
            identity_id: record.identity_id,
            node_id: record.node_id,
            bound_at: record.bound_at,
            updated_at: record.updated_at,
        })
    }

    async fn unbind_node(&self, node_id: Option<String>, confirm: bool) -> RpcResult<bool> {
        self.service().unbind_node(node_id.as_deref(), confirm).map_err(map_err)?;
        Ok(true)
    }

    async fn list_accounts(&self) -> RpcResult<Vec<RpcAccount>> {
        let service = self.service();
        let active = service.active_account();
        Ok(service
            .list_accounts()
            .into_iter()
            .map(|a| RpcAccount {
                active: a.id == active,
                id: a.id,
                rel_path: a.rel_path,
                created_at: a.created_at,
            })
            .collect())
    }

    async fn switch_account(&self, id: String) -> RpcResult<bool> {
        self.service().switch_account(&id).await.map_err(map_err)?;
        Ok(true)
    }

    async fn create_identity(&self) -> RpcResult<String> {
        self.service().create_identity().await.map_err(map_err)
    }

    async fn import_identity(&self, snapshot: serde_json::Value) -> RpcResult<String> {
        self.service().import_identity(snapshot).await.map_err(map_err)
    }

    async fn wipe_data(&self, consent: String) -> RpcResult<bool> {
        self.service().wipe_data(&consent).await.map_err(map_err)?;
        Ok(true)
    }

    async fn export_backup(&self, consent: String, passphrase: String) -> RpcResult<String> {
        let bundle = self.service().export_backup(&consent, &passphrase).map_err(map_err)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(bundle))
    }

    async fn restore_backup(
        &self,
        consent: String,
        passphrase: String,
        blob_b64: String,
    ) -> RpcResult<bool> {
        let blob = decode_b64(&blob_b64, "backup bundle")?;
        self.service().restore_backup(&consent, &passphrase, &blob).map_err(map_err)?;
        Ok(true)
    }

    async fn set_blob_node_preset(&self, limits: RpcServingLimits) -> RpcResult<bool> {
        self.service().set_blob_node_preset(ServingLimits {
            soft_kbps: limits.soft_kbps,
            hard_kbps: limits.hard_kbps,
            max_concurrent: limits.max_concurrent,
            per_peer_per_minute: limits.per_peer_per_minute,
        });
        Ok(true)
    }

    async fn update_node_policies(
        &self,
        acl_mode: Option<String>,
        allowlist: Option<Vec<String>>,
        public_serving: Option<bool>,
    ) -> RpcResult<bool> {
        let mode = match acl_mode.as_deref() {
            None => None,
            Some(raw) => Some(
                AclMode::parse(raw)
                    .ok_or_else(|| rpc_err(-32602, format!("unknown acl mode: {raw}")))?,
            ),
        };
        self.service().update_node_policies(mode, allowlist, public_serving);
        Ok(true)
    }

    async fn update_storage_policy(&self, policy: RpcStoragePolicy) -> RpcResult<bool> {
        let service = self.service();

        let limits = if policy.image_max_item_bytes.is_some()
            || policy.image_quota_bytes.is_some()
            || policy.file_max_item_bytes.is_some()
            || policy.file_quota_bytes.is_some()
        {
            let current = service.cfg.attachment_limits;
            Some(AttachmentClassLimits {
                image: ClassLimits {
                    max_item_bytes: policy
                        .image_max_item_bytes
                        .unwrap_or(current.image.max_item_bytes),
                    quota_bytes: policy.image_quota_bytes.unwrap_or(current.image.quota_bytes),
                },
                file: ClassLimits {
                    max_item_bytes: policy
                        .file_max_item_bytes
                        .unwrap_or(current.file.max_item_bytes),
                    quota_bytes: policy.file_quota_bytes.unwrap_or(current.file.quota_bytes),
                },
            })
        } else {
            None
        };

        let ttls = if policy.image_ttl_ms.is_some() || policy.file_ttl_ms.is_some() {
            Some(AttachmentTtls {
                image_ms: policy.image_ttl_ms.unwrap_or(0),
                file_ms: policy.file_ttl_ms.unwrap_or(0),
            })
        } else {
            None
        };

        let hard_cap = match (policy.high_watermark, policy.full_cap, policy.aggressive_target) {
            (None, None, None) => None,
            (hw, fc, at) => {
                let current = service.cfg.hard_cap;
                Some(HardCapPolicy {
                    high_watermark: hw.unwrap_or(current.high_watermark),
                    full_cap: fc.unwrap_or(current.full_cap),
                    aggressive_target: at.unwrap_or(current.aggressive_target),
                })
            }
        };

        service.update_storage_policy(limits, ttls, hard_cap).map_err(map_err)?;
        Ok(true)
    }

    async fn export_diagnostics_bundle(&self, window_minutes: i64) -> RpcResult<String> {
        self.service().export_diagnostics_bundle(window_minutes).map_err(map_err)
    }
}

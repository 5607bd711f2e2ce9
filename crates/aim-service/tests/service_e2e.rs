//! End-to-end scenarios for the service orchestrator, run against the
//! in-process hub transport: two (or three) complete services exchanging
//! messages and blobs, with failure injection via the hub.

use std::sync::Arc;
use std::time::{Duration, Instant};

use aim_core::interfaces::{IdentityManager, SessionManager, Transport};
use aim_core::message::{MessageStatus, PendingMessage};
use aim_core::{AimError, CancelToken};
use aim_crypto::{KeyPair, LocalIdentityManager, LocalSessionManager};
use aim_service::binding::challenge_payload;
use aim_service::config::{PrivacyMode, ServiceConfig};
use aim_service::outbound::RetryPolicy;
use aim_service::Service;
use aim_transport::{MemHub, MemTransport};

// ── Harness ───────────────────────────────────────────────────────────────────

struct TestNode {
    _dir: tempfile::TempDir,
    service: Arc<Service>,
    identity: Arc<LocalIdentityManager>,
    sessions: Arc<LocalSessionManager>,
    transport: Arc<MemTransport>,
}

impl TestNode {
    fn id(&self) -> String {
        self.identity.identity()
    }
}

fn build_node(hub: &Arc<MemHub>, cfg: ServiceConfig) -> TestNode {
    let dir = tempfile::tempdir().unwrap();
    let identity = Arc::new(LocalIdentityManager::generate());
    let sessions = Arc::new(LocalSessionManager::new());
    let transport = Arc::new(MemTransport::new(Arc::clone(hub)));
    let service = Service::build(
        dir.path(),
        cfg,
        Arc::clone(&identity) as Arc<dyn IdentityManager>,
        Arc::clone(&sessions) as Arc<dyn SessionManager>,
        Arc::clone(&transport) as Arc<dyn Transport>,
    )
    .unwrap();
    TestNode { _dir: dir, service, identity, sessions, transport }
}

/// Make two nodes mutual verified contacts with live sessions, the way the
/// out-of-scope contact-exchange flow would.
fn befriend(a: &TestNode, b: &TestNode) {
    let shared = [42u8; 32];
    for (us, them) in [(a, b), (b, a)] {
        us.identity.add_contact_by_identity_id(&them.id()).unwrap();
        us.identity.set_contact_fingerprint(&them.id(), &them.identity.own_fingerprint());
        us.identity.register_contact_device(
            &them.id(),
            &them.identity.device_id(),
            them.identity.device_public_key(),
        );
        us.sessions.init_session(&us.id(), &them.id(), shared).unwrap();
    }
}

async fn wait_until<F: Fn() -> bool>(cond: F, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

// ── Messaging ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn chat_delivery_and_delivered_receipt() {
    let hub = MemHub::new();
    let a = build_node(&hub, ServiceConfig::default());
    let b = build_node(&hub, ServiceConfig::default());
    befriend(&a, &b);

    a.service.start_networking().await.unwrap();
    b.service.start_networking().await.unwrap();

    let addrs = a.service.transport.listen_addresses().await;
    assert_eq!(addrs, vec![format!("/mem/{}", a.id())]);

    let cancel = CancelToken::new();
    let msg = a
        .service
        .send_message(&cancel, &b.id(), b"hello bob".to_vec(), "text/plain")
        .await
        .unwrap();
    assert_eq!(msg.status, MessageStatus::Sent);

    // B persists the decrypted message.
    let b_store = Arc::clone(&b.service);
    let msg_id = msg.id.clone();
    wait_until(
        || b_store.stores.current().messages.get(&msg_id).is_some(),
        "message to land at B",
    )
    .await;
    let received = b.service.stores.current().messages.get(&msg.id).unwrap();
    assert_eq!(received.content, b"hello bob");
    assert_eq!(received.contact_id, a.id());
    assert_eq!(received.status, MessageStatus::Delivered);

    // A's copy is upgraded to delivered by the receipt.
    let a_store = Arc::clone(&a.service);
    let msg_id = msg.id.clone();
    wait_until(
        || {
            a_store.stores.current().messages.get(&msg_id).map(|m| m.status)
                == Some(MessageStatus::Delivered)
        },
        "delivered receipt at A",
    )
    .await;

    // B emitted exactly one delivered receipt for the chat wire.
    assert_eq!(b.service.metrics.receipts_emitted.load(std::sync::atomic::Ordering::Relaxed), 1);

    a.service.stop_networking().await.unwrap();
    b.service.stop_networking().await.unwrap();
}

#[tokio::test]
async fn stranger_message_is_queued_and_acceptable() {
    let hub = MemHub::new();
    let a = build_node(&hub, ServiceConfig::default());
    let mut cfg = ServiceConfig::default();
    cfg.privacy_mode = PrivacyMode::ContactsOnly;
    let b = build_node(&hub, cfg);

    // A knows B, B does not know A.
    a.identity.add_contact_by_identity_id(&b.id()).unwrap();

    a.service.start_networking().await.unwrap();
    b.service.start_networking().await.unwrap();

    let cancel = CancelToken::new();
    a.service
        .send_message(&cancel, &b.id(), b"may I write to you?".to_vec(), "text/plain")
        .await
        .unwrap();

    let b_service = Arc::clone(&b.service);
    wait_until(|| b_service.inbox_threads().len() == 1, "request inbox thread").await;
    let sender = a.id();
    assert!(b.service.inbox_threads().contains_key(&sender));
    assert_eq!(b.service.stores.current().messages.message_count(), 0, "queued, not persisted");

    let moved = b.service.inbox_accept(&sender).unwrap();
    assert_eq!(moved, 1);
    assert!(b.identity.has_contact(&sender));
    assert_eq!(b.service.stores.current().messages.message_count(), 1);

    a.service.stop_networking().await.unwrap();
    b.service.stop_networking().await.unwrap();
}

#[tokio::test]
async fn offline_publish_queues_and_retries_to_success() {
    let hub = MemHub::new();
    let a = build_node(&hub, ServiceConfig::default());
    let b = build_node(&hub, ServiceConfig::default());
    befriend(&a, &b);

    a.service.start_networking().await.unwrap();
    b.service.start_networking().await.unwrap();

    hub.sever(true);
    let cancel = CancelToken::new();
    let msg = a
        .service
        .send_message(&cancel, &b.id(), b"see you soon".to_vec(), "text/plain")
        .await
        .unwrap();
    assert_eq!(msg.status, MessageStatus::Pending);
    assert_eq!(a.service.stores.current().messages.pending_count(), 1);

    hub.sever(false);
    // Force the due date and run one scheduler pass by hand.
    let pending = a.service.stores.current().messages.get_pending(&msg.id).unwrap();
    a.service
        .stores
        .current()
        .messages
        .upsert_pending(PendingMessage { next_retry_at: 0, ..pending })
        .unwrap();
    a.service
        .outbound
        .process_due_pending(aim_core::types::now_ms(), RetryPolicy::Escalate)
        .await;

    assert_eq!(a.service.stores.current().messages.pending_count(), 0);
    let b_service = Arc::clone(&b.service);
    let msg_id = msg.id.clone();
    wait_until(
        || b_service.stores.current().messages.get(&msg_id).is_some(),
        "retried message at B",
    )
    .await;

    a.service.stop_networking().await.unwrap();
    b.service.stop_networking().await.unwrap();
}

#[tokio::test]
async fn retry_cap_escalates_to_terminal_failed() {
    let hub = MemHub::new();
    let a = build_node(&hub, ServiceConfig::default());
    let b = build_node(&hub, ServiceConfig::default());
    befriend(&a, &b);

    a.service.start_networking().await.unwrap();

    hub.sever(true);
    let cancel = CancelToken::new();
    let msg = a
        .service
        .send_message(&cancel, &b.id(), b"doomed".to_vec(), "text/plain")
        .await
        .unwrap();

    // A pending entry that has already burned through the retry budget.
    a.service
        .stores
        .current()
        .messages
        .upsert_pending(PendingMessage {
            message_id: msg.id.clone(),
            retry_count: 8,
            next_retry_at: 0,
            last_error: "network down".into(),
        })
        .unwrap();

    // One tick with the network still down: terminal failure.
    a.service
        .outbound
        .process_due_pending(aim_core::types::now_ms(), RetryPolicy::Escalate)
        .await;

    assert_eq!(a.service.stores.current().messages.pending_count(), 0);
    assert_eq!(
        a.service.stores.current().messages.get(&msg.id).unwrap().status,
        MessageStatus::Failed
    );

    a.service.stop_networking().await.unwrap();
}

#[tokio::test]
async fn cancellation_before_publish_skips_retry_queue() {
    let hub = MemHub::new();
    let a = build_node(&hub, ServiceConfig::default());
    let b = build_node(&hub, ServiceConfig::default());
    befriend(&a, &b);
    a.service.start_networking().await.unwrap();

    let cancel = CancelToken::new();
    cancel.cancel();
    let result = a
        .service
        .send_message(&cancel, &b.id(), b"never mind".to_vec(), "text/plain")
        .await;
    assert!(matches!(result, Err(AimError::Cancelled)));
    assert_eq!(a.service.stores.current().messages.pending_count(), 0);

    a.service.stop_networking().await.unwrap();
}

// ── Blob distribution ─────────────────────────────────────────────────────────

#[tokio::test]
async fn blob_provider_failover_prefers_then_skips_bad_provider() {
    let hub = MemHub::new();
    let provider = build_node(&hub, ServiceConfig::default());
    let decoy = build_node(&hub, ServiceConfig::default());
    let client = build_node(&hub, ServiceConfig::default());

    provider.service.start_networking().await.unwrap();
    decoy.service.start_networking().await.unwrap();
    client.service.start_networking().await.unwrap();

    // The real provider stores and announces the blob.
    let meta = provider.service.put_attachment("ok.txt", "text/plain", b"ok").await.unwrap();
    let client_service = Arc::clone(&client.service);
    let blob_id = meta.id.clone();
    wait_until(
        || !client_service.providers.list_providers(&blob_id, aim_core::types::now_ms()).is_empty(),
        "announce to reach the client",
    )
    .await;

    // The decoy announces the same blob with a longer TTL, so failover
    // tries it first and finds nothing there.
    decoy.transport.announce_blob(&meta.id, 3_600_000).await.unwrap();
    wait_until(
        || {
            client_service
                .providers
                .list_providers(&blob_id, aim_core::types::now_ms())
                .len()
                == 2
        },
        "both providers registered",
    )
    .await;
    let order: Vec<String> = client
        .service
        .providers
        .list_providers(&meta.id, aim_core::types::now_ms())
        .into_iter()
        .map(|e| e.peer_id)
        .collect();
    assert_eq!(order[0], decoy.id(), "longest expiry first");

    let cancel = CancelToken::new();
    let blob = client.service.get_attachment(&cancel, &meta.id).await.unwrap();
    assert_eq!(blob.name, "ok.txt");
    assert_eq!(blob.mime_type, "text/plain");
    assert_eq!(blob.data, b"ok");

    // The fetched blob is served from the ephemeral cache on re-fetch.
    assert!(client.service.cache.get(&meta.id, aim_core::types::now_ms()).is_some());

    provider.service.stop_networking().await.unwrap();
    decoy.service.stop_networking().await.unwrap();
    client.service.stop_networking().await.unwrap();
}

#[tokio::test]
async fn acl_owner_contacts_denies_then_allows() {
    let hub = MemHub::new();
    let owner = build_node(&hub, ServiceConfig::default());
    let receiver = build_node(&hub, ServiceConfig::default());

    owner.service.start_networking().await.unwrap();
    receiver.service.start_networking().await.unwrap();

    // The ACL only bites once the owner identity is node-bound.
    let node_key = KeyPair::generate();
    let grant = owner.service.create_node_binding_link_code(120);
    let payload =
        challenge_payload(&grant.identity_id, &grant.link_code, "node-1", &grant.challenge);
    let sig = node_key.sign_b64(payload.as_bytes()).unwrap();
    owner
        .service
        .complete_node_binding(&grant.link_code, "node-1", &node_key.public_key_b64(), &sig, false)
        .unwrap();

    let meta = owner.service.put_attachment("payload.txt", "text/plain", b"payload").await.unwrap();
    let receiver_service = Arc::clone(&receiver.service);
    let blob_id = meta.id.clone();
    wait_until(
        || {
            !receiver_service
                .providers
                .list_providers(&blob_id, aim_core::types::now_ms())
                .is_empty()
        },
        "announce to reach receiver",
    )
    .await;

    let cancel = CancelToken::new();
    let denied = receiver.service.get_attachment(&cancel, &meta.id).await;
    assert!(matches!(denied, Err(AimError::AttachmentAccessDenied)), "got {denied:?}");

    owner.service.add_contact(&receiver.id()).unwrap();
    let blob = receiver.service.get_attachment(&cancel, &meta.id).await.unwrap();
    assert_eq!(blob.data, b"payload");

    owner.service.stop_networking().await.unwrap();
    receiver.service.stop_networking().await.unwrap();
}

// ── Backup / wipe / restore ───────────────────────────────────────────────────

#[tokio::test]
async fn backup_wipe_restore_round_trip() {
    let hub = MemHub::new();
    let a = build_node(&hub, ServiceConfig::default());
    let b = build_node(&hub, ServiceConfig::default());
    befriend(&a, &b);
    a.service.start_networking().await.unwrap();
    b.service.start_networking().await.unwrap();

    let cancel = CancelToken::new();
    let sent =
        a.service.send_message(&cancel, &b.id(), b"keep me".to_vec(), "text/plain").await.unwrap();
    let identity_before = a.service.identity_id();

    // Wrong consent tokens are exact-match rejected.
    assert!(matches!(
        a.service.export_backup("yes please", "pw"),
        Err(AimError::ConsentMismatch)
    ));
    let bundle = a.service.export_backup("aim-consent-export", "pw").unwrap();

    assert!(matches!(
        a.service.wipe_data("wipe").await,
        Err(AimError::ConsentMismatch)
    ));
    a.service.wipe_data("aim-consent-wipe-all").await.unwrap();
    assert_eq!(a.service.stores.current().messages.message_count(), 0);
    assert!(!a.sessions.has_session(&b.id()));

    // Wrong passphrase fails authentication.
    assert!(a.service.restore_backup("aim-consent-restore", "wrong", &bundle).is_err());
    a.service.restore_backup("aim-consent-restore", "pw", &bundle).unwrap();

    assert_eq!(a.service.identity_id(), identity_before);
    assert!(a.sessions.has_session(&b.id()));
    let restored = a.service.stores.current().messages.get(&sent.id).unwrap();
    assert_eq!(restored.content, b"keep me");
}

// ── Profiles ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn create_identity_switches_profile_and_back() {
    let hub = MemHub::new();
    let a = build_node(&hub, ServiceConfig::default());
    let legacy_identity = a.service.identity_id();

    let new_profile = a.service.create_identity().await.unwrap();
    assert!(new_profile.starts_with("acct_"));
    assert_eq!(a.service.active_account(), new_profile);
    assert_ne!(a.service.identity_id(), legacy_identity);
    assert_eq!(a.service.stores.current().messages.message_count(), 0);

    // The legacy profile is still there and switchable.
    a.service.switch_account("legacy").await.unwrap();
    assert_eq!(a.service.active_account(), "legacy");

    assert!(matches!(
        a.service.switch_account("acct_missing").await,
        Err(AimError::UnknownProfile(_))
    ));
}

// ── Enrollment through the service surface ────────────────────────────────────

#[tokio::test]
async fn enrollment_redeem_is_single_use_through_service() {
    use aim_service::enroll::{mint_token, EnrollmentClaims};
    use pqcrypto_traits::sign::{PublicKey, SecretKey};

    let (pk, sk) = pqcrypto_dilithium::dilithium2::keypair();
    let hub = MemHub::new();
    let mut cfg = ServiceConfig::default();
    cfg.enrollment_issuer_keys.insert("issuer-k1".to_string(), pk.as_bytes().to_vec());
    let node = build_node(&hub, cfg);

    let now = aim_core::types::now_ms();
    let claims = EnrollmentClaims {
        token_id: "tok-service".into(),
        issued_at: now - 1_000,
        expires_at: now + 600_000,
        scope: "aim:node:enroll".into(),
        subject_node_group: "group-green".into(),
        issuer: "aim-enrollment-authority".into(),
        key_id: "issuer-k1".into(),
    };
    let token = mint_token(&claims, sk.as_bytes()).unwrap();

    let accepted = node.service.redeem_enrollment_token(&token).unwrap();
    assert_eq!(accepted.subject_node_group, "group-green");
    assert!(matches!(
        node.service.redeem_enrollment_token(&token),
        Err(AimError::TokenAlreadyUsed)
    ));
    // Redemption survives the audit trail.
    assert!(!node.service.audit.is_empty());
}

// ── Diagnostics ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn diagnostics_bundle_is_redacted() {
    let hub = MemHub::new();
    let a = build_node(&hub, ServiceConfig::default());
    let bundle = a.service.export_diagnostics_bundle(30).unwrap();

    let raw_identity = a.service.identity_id();
    assert!(!bundle.contains(&raw_identity), "identity ids must be fingerprinted");
    assert!(bundle.contains("fp_"));
    let parsed: serde_json::Value = serde_json::from_str(&bundle).unwrap();
    assert_eq!(parsed["window_minutes"], 30);
}

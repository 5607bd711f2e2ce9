//! Node enrollment binding: single-use link codes, challenge/response, and
//! the identity-signed binding record.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use aim_core::constants::{clamp_link_ttl_secs, BIND_CONTEXT, LINK_CODE_ENTROPY_BYTES};
use aim_core::interfaces::IdentityManager;
use aim_core::types::{now_ms, IdentityId, Timestamp};
use aim_core::AimError;
use aim_store::{NodeBindingRecord, NodeBindingStore};
use base64::Engine as _;
use chrono::SecondsFormat;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkCodeGrant {
    pub link_code: String,
    pub challenge: String,
    pub expires_at: Timestamp,
    pub identity_id: IdentityId,
}

struct PendingLink {
    challenge: String,
    expires_at: Timestamp,
    identity_id: IdentityId,
}

/// Issues link codes and completes bindings. Codes live only in memory; the
/// completed record is persisted by the binding store.
pub struct BindingManager {
    identity: Arc<dyn IdentityManager>,
    links: Mutex<HashMap<String, PendingLink>>,
}

fn random_token() -> String {
    let mut raw = [0u8; LINK_CODE_ENTROPY_BYTES];
    rand::thread_rng().fill_bytes(&mut raw);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw)
}

/// The payload a candidate node must sign to prove it holds its key and saw
/// our challenge.
pub fn challenge_payload(
    identity_id: &str,
    link_code: &str,
    node_id: &str,
    challenge: &str,
) -> String {
    format!("{BIND_CONTEXT}|challenge|{identity_id}|{link_code}|{node_id}|{challenge}")
}

/// The canonical account-binding string countersigned by the identity.
pub fn account_binding_payload(
    identity_id: &str,
    node_id: &str,
    challenge: &str,
    now_rfc3339_nano: &str,
) -> String {
    format!("{BIND_CONTEXT}|account|{identity_id}|{node_id}|{challenge}|{now_rfc3339_nano}")
}

impl BindingManager {
    pub fn new(identity: Arc<dyn IdentityManager>) -> Self {
        Self { identity, links: Mutex::new(HashMap::new()) }
    }

    /// Issue a link code with a TTL clamped into protocol bounds.
    pub fn create_link_code(&self, ttl_seconds: i64) -> LinkCodeGrant {
        let ttl = clamp_link_ttl_secs(ttl_seconds);
        let grant = LinkCodeGrant {
            link_code: random_token(),
            challenge: random_token(),
            expires_at: now_ms() + ttl * 1_000,
            identity_id: self.identity.identity(),
        };
        self.links.lock().unwrap().insert(
            grant.link_code.clone(),
            PendingLink {
                challenge: grant.challenge.clone(),
                expires_at: grant.expires_at,
                identity_id: grant.identity_id.clone(),
            },
        );
        grant
    }

    /// Atomically consume the link code and, if everything checks out, store
    /// the binding record.
    #[allow(clippy::too_many_arguments)]
    pub fn complete_binding(
        &self,
        store: &NodeBindingStore,
        link_code: &str,
        node_id: &str,
        node_public_key_b64: &str,
        node_signature_b64: &str,
        allow_rebind: bool,
        now: Timestamp,
    ) -> Result<NodeBindingRecord, AimError> {
        if node_id.is_empty() {
            return Err(AimError::InvalidArgument("empty node id".into()));
        }

        // Single use: the code is gone whether or not the rest succeeds.
        let pending = self
            .links
            .lock()
            .unwrap()
            .remove(link_code)
            .ok_or(AimError::LinkCodeUnknown)?;
        if pending.expires_at <= now {
            return Err(AimError::LinkCodeExpired);
        }

        let node_pubkey = base64::engine::general_purpose::STANDARD
            .decode(node_public_key_b64)
            .map_err(|_| AimError::InvalidArgument("node public key is not base64".into()))?;
        let payload =
            challenge_payload(&pending.identity_id, link_code, node_id, &pending.challenge);
        aim_crypto::sign::verify_detached_b64(&node_pubkey, payload.as_bytes(), node_signature_b64)?;

        if let Some(existing) = store.active(&pending.identity_id) {
            if existing.node_id != node_id && !allow_rebind {
                return Err(AimError::AlreadyBound(existing.node_id));
            }
        }

        let stamp = chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
        let account_payload =
            account_binding_payload(&pending.identity_id, node_id, &pending.challenge, &stamp);
        let account_signature_b64 =
            self.identity.sign_with_identity(account_payload.as_bytes())?;

        let bound_at =
            store.active(&pending.identity_id).map(|r| r.bound_at).unwrap_or(now);
        let record = NodeBindingRecord {
            identity_id: pending.identity_id.clone(),
            node_id: node_id.to_string(),
            node_public_key_b64: node_public_key_b64.to_string(),
            node_signature_b64: node_signature_b64.to_string(),
            account_signature_b64,
            bound_at,
            updated_at: now,
        };
        store.set(record.clone())?;
        info!(node = %node_id, "node binding completed");
        Ok(record)
    }

    /// Remove the active binding. Requires explicit confirmation; when
    /// `node_id` is given it must match the active record.
    pub fn unbind(
        &self,
        store: &NodeBindingStore,
        node_id: Option<&str>,
        confirm: bool,
    ) -> Result<(), AimError> {
        if !confirm {
            return Err(AimError::UnbindNotConfirmed);
        }
        let identity_id = self.identity.identity();
        let active = store
            .active(&identity_id)
            .ok_or_else(|| AimError::BindingNotFound(node_id.unwrap_or("any").to_string()))?;
        if let Some(requested) = node_id {
            if requested != active.node_id {
                return Err(AimError::BindingNotFound(requested.to_string()));
            }
        }
        store.clear(&identity_id)?;
        info!(node = %active.node_id, "node unbound");
        Ok(())
    }

    pub fn pending_link_count(&self) -> usize {
        self.links.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aim_crypto::{KeyPair, LocalIdentityManager};
    use aim_store::EnvelopeCodec;

    fn setup() -> (BindingManager, NodeBindingStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = NodeBindingStore::open(
            dir.path().join("node_bindings.json"),
            EnvelopeCodec::plaintext(),
        )
        .unwrap();
        let identity: Arc<dyn IdentityManager> = Arc::new(LocalIdentityManager::generate());
        (BindingManager::new(identity), store, dir)
    }

    fn sign_challenge(node: &KeyPair, grant: &LinkCodeGrant, node_id: &str) -> String {
        let payload = challenge_payload(
            &grant.identity_id,
            &grant.link_code,
            node_id,
            &grant.challenge,
        );
        node.sign_b64(payload.as_bytes()).unwrap()
    }

    #[test]
    fn link_code_entropy_and_ttl() {
        let (mgr, _store, _dir) = setup();
        let before = now_ms();
        let grant = mgr.create_link_code(0);
        assert!(grant.link_code.len() >= 24, "20 bytes base64url is at least 27 chars");
        assert_ne!(grant.link_code, grant.challenge);
        assert!(grant.expires_at >= before + 89_000 && grant.expires_at <= before + 92_000);

        let capped = mgr.create_link_code(86_400);
        assert!(capped.expires_at <= now_ms() + 601_000, "ttl clamped to ten minutes");
    }

    #[test]
    fn complete_binding_round_trip() {
        let (mgr, store, _dir) = setup();
        let node = KeyPair::generate();
        let grant = mgr.create_link_code(120);
        let sig = sign_challenge(&node, &grant, "node-1");

        let record = mgr
            .complete_binding(&store, &grant.link_code, "node-1", &node.public_key_b64(), &sig, false, now_ms())
            .unwrap();
        assert_eq!(record.node_id, "node-1");
        assert!(store.is_bound(&grant.identity_id));

        // The link code is consumed.
        let again = mgr.complete_binding(
            &store, &grant.link_code, "node-1", &node.public_key_b64(), &sig, false, now_ms());
        assert!(matches!(again, Err(AimError::LinkCodeUnknown)));
    }

    #[test]
    fn expired_code_and_bad_signature_fail() {
        let (mgr, store, _dir) = setup();
        let node = KeyPair::generate();

        let grant = mgr.create_link_code(120);
        let sig = sign_challenge(&node, &grant, "node-1");
        let result = mgr.complete_binding(
            &store,
            &grant.link_code,
            "node-1",
            &node.public_key_b64(),
            &sig,
            false,
            grant.expires_at + 1,
        );
        assert!(matches!(result, Err(AimError::LinkCodeExpired)));

        let grant = mgr.create_link_code(120);
        let sig = sign_challenge(&node, &grant, "node-OTHER");
        let result = mgr.complete_binding(
            &store, &grant.link_code, "node-1", &node.public_key_b64(), &sig, false, now_ms());
        assert!(matches!(result, Err(AimError::SignatureInvalid)));
    }

    #[test]
    fn rebind_requires_explicit_consent() {
        let (mgr, store, _dir) = setup();
        let node_a = KeyPair::generate();
        let node_b = KeyPair::generate();

        let grant = mgr.create_link_code(120);
        let sig = sign_challenge(&node_a, &grant, "node-a");
        mgr.complete_binding(
            &store, &grant.link_code, "node-a", &node_a.public_key_b64(), &sig, false, now_ms())
            .unwrap();

        let grant = mgr.create_link_code(120);
        let sig = sign_challenge(&node_b, &grant, "node-b");
        let denied = mgr.complete_binding(
            &store, &grant.link_code, "node-b", &node_b.public_key_b64(), &sig, false, now_ms());
        assert!(matches!(denied, Err(AimError::AlreadyBound(_))));

        let grant = mgr.create_link_code(120);
        let sig = sign_challenge(&node_b, &grant, "node-b");
        let record = mgr
            .complete_binding(
                &store, &grant.link_code, "node-b", &node_b.public_key_b64(), &sig, true, now_ms())
            .unwrap();
        assert_eq!(record.node_id, "node-b");
    }

    #[test]
    fn unbind_needs_confirmation_and_matching_node() {
        let (mgr, store, _dir) = setup();
        let node = KeyPair::generate();
        let grant = mgr.create_link_code(120);
        let sig = sign_challenge(&node, &grant, "node-1");
        mgr.complete_binding(
            &store, &grant.link_code, "node-1", &node.public_key_b64(), &sig, false, now_ms())
            .unwrap();

        assert!(matches!(mgr.unbind(&store, None, false), Err(AimError::UnbindNotConfirmed)));
        assert!(matches!(
            mgr.unbind(&store, Some("node-wrong"), true),
            Err(AimError::BindingNotFound(_))
        ));
        mgr.unbind(&store, Some("node-1"), true).unwrap();
        assert!(!store.is_bound(&grant.identity_id));
    }
}

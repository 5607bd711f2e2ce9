use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use aim_core::constants::STORE_SNAPSHOT_VERSION;
use aim_core::types::{IdentityId, Timestamp};
use aim_core::AimError;
use serde::{Deserialize, Serialize};

use crate::envelope::EnvelopeCodec;

/// A completed identity-to-node binding. The node signed our challenge, and
/// the identity countersigned the canonical account-binding string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeBindingRecord {
    pub identity_id: IdentityId,
    pub node_id: String,
    pub node_public_key_b64: String,
    /// Node signature over the challenge payload, base64.
    pub node_signature_b64: String,
    /// Identity signature over the account-binding string, base64.
    pub account_signature_b64: String,
    pub bound_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(Default, Clone, Serialize, Deserialize)]
struct BindingSnapshot {
    version: u32,
    /// At most one active record per identity.
    bindings: BTreeMap<IdentityId, NodeBindingRecord>,
}

/// Node-binding store. Replacing an identity's record is the caller's
/// decision (`allow_rebind`); the store just persists atomically.
pub struct NodeBindingStore {
    path: PathBuf,
    codec: EnvelopeCodec,
    mu: Mutex<BindingSnapshot>,
}

impl NodeBindingStore {
    pub fn open(path: PathBuf, codec: EnvelopeCodec) -> Result<Self, AimError> {
        let state = match codec.read_file(&path)? {
            None => BindingSnapshot { version: STORE_SNAPSHOT_VERSION, ..Default::default() },
            Some(bytes) => {
                let snap: BindingSnapshot = serde_json::from_slice(&bytes)
                    .map_err(|e| AimError::Storage(format!("binding snapshot: {e}")))?;
                if snap.version > STORE_SNAPSHOT_VERSION {
                    return Err(AimError::UnsupportedStorageSchema {
                        got: snap.version,
                        max: STORE_SNAPSHOT_VERSION,
                    });
                }
                snap
            }
        };
        Ok(Self { path, codec, mu: Mutex::new(state) })
    }

    fn persist(&self, state: &BindingSnapshot) -> Result<(), AimError> {
        let bytes = serde_json::to_vec(state).map_err(|e| AimError::Storage(e.to_string()))?;
        self.codec.write_file(&self.path, &bytes)
    }

    pub fn active(&self, identity_id: &str) -> Option<NodeBindingRecord> {
        self.mu.lock().unwrap().bindings.get(identity_id).cloned()
    }

    pub fn is_bound(&self, identity_id: &str) -> bool {
        self.mu.lock().unwrap().bindings.contains_key(identity_id)
    }

    pub fn set(&self, record: NodeBindingRecord) -> Result<(), AimError> {
        let mut state = self.mu.lock().unwrap();
        let mut scratch = state.clone();
        scratch.bindings.insert(record.identity_id.clone(), record);
        self.persist(&scratch)?;
        *state = scratch;
        Ok(())
    }

    pub fn clear(&self, identity_id: &str) -> Result<(), AimError> {
        let mut state = self.mu.lock().unwrap();
        if !state.bindings.contains_key(identity_id) {
            return Ok(());
        }
        let mut scratch = state.clone();
        scratch.bindings.remove(identity_id);
        self.persist(&scratch)?;
        *state = scratch;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(identity: &str, node: &str) -> NodeBindingRecord {
        NodeBindingRecord {
            identity_id: identity.into(),
            node_id: node.into(),
            node_public_key_b64: "cGs=".into(),
            node_signature_b64: "c2ln".into(),
            account_signature_b64: "YWNj".into(),
            bound_at: 1,
            updated_at: 1,
        }
    }

    #[test]
    fn one_active_record_per_identity() {
        let dir = tempfile::tempdir().unwrap();
        let st = NodeBindingStore::open(
            dir.path().join("node_bindings.json"),
            EnvelopeCodec::plaintext(),
        )
        .unwrap();

        st.set(record("aim1me", "node-a")).unwrap();
        st.set(record("aim1me", "node-b")).unwrap();
        assert_eq!(st.active("aim1me").unwrap().node_id, "node-b");

        st.clear("aim1me").unwrap();
        assert!(!st.is_bound("aim1me"));
    }
}

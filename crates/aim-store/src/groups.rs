use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use aim_core::constants::STORE_SNAPSHOT_VERSION;
use aim_core::types::{IdentityId, Timestamp};
use aim_core::AimError;
use serde::{Deserialize, Serialize};

use crate::envelope::EnvelopeCodec;

/// Membership state of one group conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupState {
    pub group_id: String,
    pub name: String,
    pub members: Vec<IdentityId>,
    pub updated_at: Timestamp,
}

impl GroupState {
    pub fn has_member(&self, id: &str) -> bool {
        self.members.iter().any(|m| m == id)
    }
}

#[derive(Default, Clone, Serialize, Deserialize)]
struct GroupSnapshot {
    version: u32,
    groups: BTreeMap<String, GroupState>,
}

/// Group-state store with the same atomic snapshot discipline as the other
/// stores.
pub struct GroupStateStore {
    path: PathBuf,
    codec: EnvelopeCodec,
    mu: Mutex<GroupSnapshot>,
}

impl GroupStateStore {
    pub fn open(path: PathBuf, codec: EnvelopeCodec) -> Result<Self, AimError> {
        let state = match codec.read_file(&path)? {
            None => GroupSnapshot { version: STORE_SNAPSHOT_VERSION, ..Default::default() },
            Some(bytes) => {
                let snap: GroupSnapshot = serde_json::from_slice(&bytes)
                    .map_err(|e| AimError::Storage(format!("group snapshot: {e}")))?;
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

    fn persist(&self, state: &GroupSnapshot) -> Result<(), AimError> {
        let bytes = serde_json::to_vec(state).map_err(|e| AimError::Storage(e.to_string()))?;
        self.codec.write_file(&self.path, &bytes)
    }

    pub fn upsert(&self, group: GroupState) -> Result<(), AimError> {
        let mut state = self.mu.lock().unwrap();
        let mut scratch = state.clone();
        scratch.groups.insert(group.group_id.clone(), group);
        self.persist(&scratch)?;
        *state = scratch;
        Ok(())
    }

    pub fn get(&self, group_id: &str) -> Option<GroupState> {
        self.mu.lock().unwrap().groups.get(group_id).cloned()
    }

    pub fn remove(&self, group_id: &str) -> Result<(), AimError> {
        let mut state = self.mu.lock().unwrap();
        if !state.groups.contains_key(group_id) {
            return Ok(());
        }
        let mut scratch = state.clone();
        scratch.groups.remove(group_id);
        self.persist(&scratch)?;
        *state = scratch;
        Ok(())
    }

    pub fn list(&self) -> Vec<GroupState> {
        self.mu.lock().unwrap().groups.values().cloned().collect()
    }

    /// Whether `a` and `b` share at least one active group membership.
    pub fn share_group(&self, a: &str, b: &str) -> bool {
        self.mu
            .lock()
            .unwrap()
            .groups
            .values()
            .any(|g| g.has_member(a) && g.has_member(b))
    }

    pub fn wipe(&self) -> Result<(), AimError> {
        let mut state = self.mu.lock().unwrap();
        let scratch = GroupSnapshot { version: STORE_SNAPSHOT_VERSION, ..Default::default() };
        self.persist(&scratch)?;
        *state = scratch;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_group_detects_common_membership() {
        let dir = tempfile::tempdir().unwrap();
        let st =
            GroupStateStore::open(dir.path().join("groups.json"), EnvelopeCodec::plaintext())
                .unwrap();
        st.upsert(GroupState {
            group_id: "grp1".into(),
            name: "friends".into(),
            members: vec!["aim1a".into(), "aim1b".into()],
            updated_at: 1,
        })
        .unwrap();

        assert!(st.share_group("aim1a", "aim1b"));
        assert!(!st.share_group("aim1a", "aim1c"));
    }

    #[test]
    fn reopen_restores_groups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("groups.json");
        let codec = EnvelopeCodec::from_passphrase(Some("pw"));
        {
            let st = GroupStateStore::open(path.clone(), codec.clone()).unwrap();
            st.upsert(GroupState {
                group_id: "grp1".into(),
                name: "team".into(),
                members: vec!["aim1a".into()],
                updated_at: 7,
            })
            .unwrap();
        }
        let st = GroupStateStore::open(path, codec).unwrap();
        assert_eq!(st.get("grp1").unwrap().name, "team");
    }
}

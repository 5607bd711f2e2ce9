use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use aim_core::constants::STORE_SNAPSHOT_VERSION;
use aim_core::message::Message;
use aim_core::AimError;
use serde::{Deserialize, Serialize};

use crate::envelope::EnvelopeCodec;

#[derive(Default, Clone, Serialize, Deserialize)]
struct InboxSnapshot {
    version: u32,
    /// sender → queued request messages, oldest first.
    seen: BTreeMap<String, Vec<Message>>,
}

/// Message-request inbox: threads from unknown senders queued until the user
/// accepts or declines. `take` removes a thread atomically; `restore_if_empty`
/// undoes a take that the caller could not complete.
pub struct RequestInboxStore {
    path: PathBuf,
    codec: EnvelopeCodec,
    mu: Mutex<InboxSnapshot>,
}

impl RequestInboxStore {
    pub fn open(path: PathBuf, codec: EnvelopeCodec) -> Result<Self, AimError> {
        let state = match codec.read_file(&path)? {
            None => InboxSnapshot { version: STORE_SNAPSHOT_VERSION, ..Default::default() },
            Some(bytes) => {
                let snap: InboxSnapshot = serde_json::from_slice(&bytes)
                    .map_err(|e| AimError::Storage(format!("inbox snapshot: {e}")))?;
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

    fn persist(&self, state: &InboxSnapshot) -> Result<(), AimError> {
        let bytes = serde_json::to_vec(state).map_err(|e| AimError::Storage(e.to_string()))?;
        self.codec.write_file(&self.path, &bytes)
    }

    pub fn append(&self, sender: &str, msg: Message) -> Result<(), AimError> {
        let mut state = self.mu.lock().unwrap();
        let mut scratch = state.clone();
        scratch.seen.entry(sender.to_string()).or_default().push(msg);
        self.persist(&scratch)?;
        *state = scratch;
        Ok(())
    }

    /// Return and remove the whole thread for `sender` atomically.
    pub fn take(&self, sender: &str) -> Result<Option<Vec<Message>>, AimError> {
        let mut state = self.mu.lock().unwrap();
        if !state.seen.contains_key(sender) {
            return Ok(None);
        }
        let mut scratch = state.clone();
        let thread = scratch.seen.remove(sender);
        self.persist(&scratch)?;
        *state = scratch;
        Ok(thread)
    }

    /// Re-insert a taken thread, but only if the slot is still empty.
    /// Returns whether the restore happened.
    pub fn restore_if_empty(&self, sender: &str, msgs: Vec<Message>) -> Result<bool, AimError> {
        let mut state = self.mu.lock().unwrap();
        let occupied = state.seen.get(sender).map(|t| !t.is_empty()).unwrap_or(false);
        if occupied {
            return Ok(false);
        }
        let mut scratch = state.clone();
        scratch.seen.insert(sender.to_string(), msgs);
        self.persist(&scratch)?;
        *state = scratch;
        Ok(true)
    }

    pub fn remove(&self, sender: &str) -> Result<(), AimError> {
        let mut state = self.mu.lock().unwrap();
        if !state.seen.contains_key(sender) {
            return Ok(());
        }
        let mut scratch = state.clone();
        scratch.seen.remove(sender);
        self.persist(&scratch)?;
        *state = scratch;
        Ok(())
    }

    pub fn snapshot_map(&self) -> BTreeMap<String, Vec<Message>> {
        self.mu.lock().unwrap().seen.clone()
    }

    pub fn thread_count(&self) -> usize {
        self.mu.lock().unwrap().seen.len()
    }

    pub fn wipe(&self) -> Result<(), AimError> {
        let mut state = self.mu.lock().unwrap();
        let scratch = InboxSnapshot { version: STORE_SNAPSHOT_VERSION, ..Default::default() };
        self.persist(&scratch)?;
        *state = scratch;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aim_core::message::{ConversationType, Direction, MessageStatus};

    fn msg(id: &str, sender: &str) -> Message {
        Message {
            id: id.into(),
            contact_id: sender.into(),
            conversation_id: sender.into(),
            conversation_type: ConversationType::Direct,
            thread_id: None,
            content: b"hello?".to_vec(),
            content_type: "text/plain".into(),
            timestamp: 1,
            direction: Direction::In,
            status: MessageStatus::Delivered,
            edited: false,
        }
    }

    fn store() -> (tempfile::TempDir, RequestInboxStore) {
        let dir = tempfile::tempdir().unwrap();
        let st = RequestInboxStore::open(
            dir.path().join("request_inbox.json"),
            EnvelopeCodec::plaintext(),
        )
        .unwrap();
        (dir, st)
    }

    #[test]
    fn take_removes_thread_atomically() {
        let (_dir, st) = store();
        st.append("aim1stranger", msg("m1", "aim1stranger")).unwrap();
        st.append("aim1stranger", msg("m2", "aim1stranger")).unwrap();

        let thread = st.take("aim1stranger").unwrap().unwrap();
        assert_eq!(thread.len(), 2);
        assert!(st.take("aim1stranger").unwrap().is_none());
    }

    #[test]
    fn restore_only_into_empty_slot() {
        let (_dir, st) = store();
        st.append("aim1s", msg("m1", "aim1s")).unwrap();
        let thread = st.take("aim1s").unwrap().unwrap();

        assert!(st.restore_if_empty("aim1s", thread.clone()).unwrap());
        assert!(!st.restore_if_empty("aim1s", thread).unwrap(), "slot no longer empty");
    }

    #[test]
    fn persist_failure_leaves_memory_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        let st =
            RequestInboxStore::open(sub.join("inbox.json"), EnvelopeCodec::plaintext()).unwrap();
        std::fs::write(&sub, b"blocker").unwrap();

        assert!(st.append("aim1s", msg("m1", "aim1s")).is_err());
        assert_eq!(st.thread_count(), 0);
    }

    #[test]
    fn snapshot_shape_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inbox.json");
        {
            let st = RequestInboxStore::open(path.clone(), EnvelopeCodec::plaintext()).unwrap();
            st.append("aim1s", msg("m1", "aim1s")).unwrap();
        }
        let raw = std::fs::read(&path).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(json["version"], 1);
        assert!(json["seen"]["aim1s"].is_array());

        let st = RequestInboxStore::open(path, EnvelopeCodec::plaintext()).unwrap();
        assert_eq!(st.thread_count(), 1);
    }
}

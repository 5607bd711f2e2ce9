use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use aim_core::constants::STORE_SNAPSHOT_VERSION;
use aim_core::message::{ConversationType, Message, MessageStatus, PendingMessage};
use aim_core::types::Timestamp;
use aim_core::AimError;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::envelope::EnvelopeCodec;

// ── Snapshot ─────────────────────────────────────────────────────────────────

#[derive(Default, Clone, Serialize, Deserialize)]
struct MessageSnapshot {
    version: u32,
    messages: BTreeMap<String, Message>,
    pending: BTreeMap<String, PendingMessage>,
}

// ── Store ────────────────────────────────────────────────────────────────────

/// Append-only message store keyed by message id, with the pending retry
/// queue persisted in the same snapshot. All mutations stage a scratch copy,
/// persist it, then swap; a failed persist leaves memory untouched.
pub struct MessageStore {
    path: PathBuf,
    codec: EnvelopeCodec,
    persist_enabled: AtomicBool,
    mu: Mutex<MessageSnapshot>,
}

impl MessageStore {
    pub fn open(path: PathBuf, codec: EnvelopeCodec) -> Result<Self, AimError> {
        let state = match codec.read_file(&path)? {
            None => MessageSnapshot { version: STORE_SNAPSHOT_VERSION, ..Default::default() },
            Some(bytes) => {
                let snap: MessageSnapshot = serde_json::from_slice(&bytes)
                    .map_err(|e| AimError::Storage(format!("message snapshot: {e}")))?;
                if snap.version > STORE_SNAPSHOT_VERSION {
                    return Err(AimError::UnsupportedStorageSchema {
                        got: snap.version,
                        max: STORE_SNAPSHOT_VERSION,
                    });
                }
                snap
            }
        };
        Ok(Self { path, codec, persist_enabled: AtomicBool::new(true), mu: Mutex::new(state) })
    }

    pub fn set_persistence(&self, enabled: bool) {
        self.persist_enabled.store(enabled, Ordering::SeqCst);
    }

    fn persist(&self, state: &MessageSnapshot) -> Result<(), AimError> {
        if !self.persist_enabled.load(Ordering::SeqCst) {
            return Ok(());
        }
        let bytes =
            serde_json::to_vec(state).map_err(|e| AimError::Storage(e.to_string()))?;
        self.codec.write_file(&self.path, &bytes)
    }

    // ── Messages ─────────────────────────────────────────────────────────────

    /// Save a message. A byte-identical re-save is a no-op; a differing
    /// payload under an existing id fails with `MessageIdConflict`.
    pub fn save_message(&self, mut msg: Message) -> Result<(), AimError> {
        msg.normalize();
        let mut state = self.mu.lock().unwrap();

        if let Some(existing) = state.messages.get(&msg.id) {
            if existing.canonical_bytes()? == msg.canonical_bytes()? {
                return Ok(());
            }
            return Err(AimError::MessageIdConflict(msg.id));
        }

        let mut scratch = state.clone();
        scratch.messages.insert(msg.id.clone(), msg);
        self.persist(&scratch)?;
        *state = scratch;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Message> {
        self.mu.lock().unwrap().messages.get(id).cloned()
    }

    /// Merge `next` into the stored status via the monotone lattice. Returns
    /// the effective status after the merge.
    pub fn update_status(&self, id: &str, next: MessageStatus) -> Result<MessageStatus, AimError> {
        let mut state = self.mu.lock().unwrap();
        let current = state
            .messages
            .get(id)
            .map(|m| m.status)
            .ok_or_else(|| AimError::MessageNotFound(id.to_string()))?;

        let merged = MessageStatus::merge(Some(current), next);
        if merged == current {
            return Ok(current);
        }

        let mut scratch = state.clone();
        scratch.messages.get_mut(id).expect("checked above").status = merged;
        self.persist(&scratch)?;
        *state = scratch;
        Ok(merged)
    }

    pub fn delete(&self, id: &str) -> Result<(), AimError> {
        let mut state = self.mu.lock().unwrap();
        if !state.messages.contains_key(id) && !state.pending.contains_key(id) {
            return Ok(());
        }
        let mut scratch = state.clone();
        scratch.messages.remove(id);
        scratch.pending.remove(id);
        self.persist(&scratch)?;
        *state = scratch;
        Ok(())
    }

    /// Remove messages whose timestamp is at or before `cutoff`, cascading to
    /// their pending entries. Returns the number removed.
    pub fn purge_older_than(&self, cutoff: Timestamp) -> Result<usize, AimError> {
        let mut state = self.mu.lock().unwrap();
        let doomed: Vec<String> = state
            .messages
            .values()
            .filter(|m| m.timestamp <= cutoff)
            .map(|m| m.id.clone())
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }
        let mut scratch = state.clone();
        for id in &doomed {
            scratch.messages.remove(id);
            scratch.pending.remove(id);
        }
        self.persist(&scratch)?;
        *state = scratch;
        debug!(removed = doomed.len(), "purged messages older than cutoff");
        Ok(doomed.len())
    }

    pub fn wipe(&self) -> Result<(), AimError> {
        let mut state = self.mu.lock().unwrap();
        let scratch = MessageSnapshot { version: STORE_SNAPSHOT_VERSION, ..Default::default() };
        self.persist(&scratch)?;
        *state = scratch;
        Ok(())
    }

    // ── Listing ──────────────────────────────────────────────────────────────

    fn page(mut msgs: Vec<Message>, limit: usize, offset: usize) -> Vec<Message> {
        msgs.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        let iter = msgs.into_iter().skip(offset);
        if limit == 0 {
            iter.collect()
        } else {
            iter.take(limit).collect()
        }
    }

    pub fn list(&self, limit: usize, offset: usize) -> Vec<Message> {
        let state = self.mu.lock().unwrap();
        Self::page(state.messages.values().cloned().collect(), limit, offset)
    }

    pub fn list_by_contact(&self, contact_id: &str, limit: usize, offset: usize) -> Vec<Message> {
        let state = self.mu.lock().unwrap();
        let msgs = state
            .messages
            .values()
            .filter(|m| m.contact_id == contact_id)
            .cloned()
            .collect();
        Self::page(msgs, limit, offset)
    }

    pub fn list_by_conversation(
        &self,
        conversation_id: &str,
        conversation_type: ConversationType,
        limit: usize,
        offset: usize,
    ) -> Vec<Message> {
        let state = self.mu.lock().unwrap();
        let msgs = state
            .messages
            .values()
            .filter(|m| {
                m.conversation_id == conversation_id && m.conversation_type == conversation_type
            })
            .cloned()
            .collect();
        Self::page(msgs, limit, offset)
    }

    pub fn list_by_thread(
        &self,
        conversation_id: &str,
        conversation_type: ConversationType,
        thread_id: &str,
        limit: usize,
        offset: usize,
    ) -> Vec<Message> {
        let state = self.mu.lock().unwrap();
        let msgs = state
            .messages
            .values()
            .filter(|m| {
                m.conversation_id == conversation_id
                    && m.conversation_type == conversation_type
                    && m.thread_id.as_deref() == Some(thread_id)
            })
            .cloned()
            .collect();
        Self::page(msgs, limit, offset)
    }

    pub fn message_count(&self) -> usize {
        self.mu.lock().unwrap().messages.len()
    }

    // ── Pending queue ────────────────────────────────────────────────────────

    pub fn upsert_pending(&self, entry: PendingMessage) -> Result<(), AimError> {
        let mut state = self.mu.lock().unwrap();
        let mut scratch = state.clone();
        scratch.pending.insert(entry.message_id.clone(), entry);
        self.persist(&scratch)?;
        *state = scratch;
        Ok(())
    }

    pub fn remove_pending(&self, message_id: &str) -> Result<(), AimError> {
        let mut state = self.mu.lock().unwrap();
        if !state.pending.contains_key(message_id) {
            return Ok(());
        }
        let mut scratch = state.clone();
        scratch.pending.remove(message_id);
        self.persist(&scratch)?;
        *state = scratch;
        Ok(())
    }

    /// Pending entries due at `horizon`, each paired with its message.
    pub fn due_pending(&self, horizon: Timestamp) -> Vec<(PendingMessage, Message)> {
        let state = self.mu.lock().unwrap();
        let mut due: Vec<(PendingMessage, Message)> = state
            .pending
            .values()
            .filter(|p| p.next_retry_at <= horizon)
            .filter_map(|p| state.messages.get(&p.message_id).map(|m| (p.clone(), m.clone())))
            .collect();
        due.sort_by_key(|(p, _)| p.next_retry_at);
        due
    }

    pub fn pending_count(&self) -> usize {
        self.mu.lock().unwrap().pending.len()
    }

    pub fn get_pending(&self, message_id: &str) -> Option<PendingMessage> {
        self.mu.lock().unwrap().pending.get(message_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aim_core::message::Direction;

    fn msg(id: &str, contact: &str, ts: Timestamp) -> Message {
        Message {
            id: id.into(),
            contact_id: contact.into(),
            conversation_id: String::new(),
            conversation_type: ConversationType::Direct,
            thread_id: None,
            content: b"body".to_vec(),
            content_type: "text/plain".into(),
            timestamp: ts,
            direction: Direction::Out,
            status: MessageStatus::Pending,
            edited: false,
        }
    }

    fn store() -> (tempfile::TempDir, MessageStore) {
        let dir = tempfile::tempdir().unwrap();
        let st =
            MessageStore::open(dir.path().join("messages.json"), EnvelopeCodec::plaintext())
                .unwrap();
        (dir, st)
    }

    #[test]
    fn byte_equal_resave_is_noop_and_conflict_fails() {
        let (_dir, st) = store();
        st.save_message(msg("m1", "aim1c", 10)).unwrap();
        st.save_message(msg("m1", "aim1c", 10)).unwrap();

        let mut other = msg("m1", "aim1c", 10);
        other.content = b"different".to_vec();
        assert!(matches!(st.save_message(other), Err(AimError::MessageIdConflict(_))));
        assert_eq!(st.get("m1").unwrap().content, b"body");
    }

    #[test]
    fn save_normalizes_direct_conversation() {
        let (_dir, st) = store();
        st.save_message(msg("m1", "aim1peer", 10)).unwrap();
        assert_eq!(st.get("m1").unwrap().conversation_id, "aim1peer");
    }

    #[test]
    fn status_lattice_is_enforced() {
        let (_dir, st) = store();
        st.save_message(msg("m1", "aim1c", 10)).unwrap();
        assert_eq!(st.update_status("m1", MessageStatus::Delivered).unwrap(), MessageStatus::Delivered);
        // failed after delivered stays delivered
        assert_eq!(st.update_status("m1", MessageStatus::Failed).unwrap(), MessageStatus::Delivered);
        assert_eq!(st.update_status("m1", MessageStatus::Sent).unwrap(), MessageStatus::Delivered);
        assert_eq!(st.update_status("m1", MessageStatus::Read).unwrap(), MessageStatus::Read);
    }

    #[test]
    fn purge_cascades_to_pending() {
        let (_dir, st) = store();
        st.save_message(msg("old", "aim1c", 100)).unwrap();
        st.save_message(msg("new", "aim1c", 200)).unwrap();
        st.upsert_pending(PendingMessage {
            message_id: "old".into(),
            retry_count: 1,
            next_retry_at: 0,
            last_error: "net".into(),
        })
        .unwrap();

        assert_eq!(st.purge_older_than(100).unwrap(), 1);
        assert!(st.get("old").is_none());
        assert!(st.get_pending("old").is_none());
        assert!(st.get("new").is_some());
    }

    #[test]
    fn failed_persist_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        let st = MessageStore::open(sub.join("messages.json"), EnvelopeCodec::plaintext())
            .unwrap();

        // A regular file now occupies the store's parent path: every persist
        // fails, and the in-memory state must stay untouched.
        std::fs::write(&sub, b"file, not a dir").unwrap();
        assert!(st.save_message(msg("m1", "aim1c", 1)).is_err());
        assert!(st.get("m1").is_none());
        assert_eq!(st.message_count(), 0);
    }

    #[test]
    fn listing_paginates_by_timestamp() {
        let (_dir, st) = store();
        for (i, ts) in [30i64, 10, 20].iter().enumerate() {
            st.save_message(msg(&format!("m{i}"), "aim1c", *ts)).unwrap();
        }
        let page = st.list(2, 0);
        assert_eq!(page.iter().map(|m| m.timestamp).collect::<Vec<_>>(), vec![10, 20]);
        let rest = st.list(2, 2);
        assert_eq!(rest.iter().map(|m| m.timestamp).collect::<Vec<_>>(), vec![30]);
    }

    #[test]
    fn due_pending_respects_horizon() {
        let (_dir, st) = store();
        st.save_message(msg("m1", "aim1c", 1)).unwrap();
        st.save_message(msg("m2", "aim1c", 2)).unwrap();
        st.upsert_pending(PendingMessage {
            message_id: "m1".into(), retry_count: 0, next_retry_at: 50, last_error: String::new(),
        }).unwrap();
        st.upsert_pending(PendingMessage {
            message_id: "m2".into(), retry_count: 0, next_retry_at: 500, last_error: String::new(),
        }).unwrap();

        let due = st.due_pending(100);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0.message_id, "m1");
    }

    #[test]
    fn reopen_restores_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.json");
        let codec = EnvelopeCodec::from_passphrase(Some("pw"));
        {
            let st = MessageStore::open(path.clone(), codec.clone()).unwrap();
            st.save_message(msg("m1", "aim1c", 10)).unwrap();
        }
        let st = MessageStore::open(path, codec).unwrap();
        assert_eq!(st.get("m1").unwrap().content, b"body");
    }
}

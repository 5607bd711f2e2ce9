use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use aim_core::types::Timestamp;
use aim_core::AimError;
use serde::{Deserialize, Serialize};

use crate::envelope::EnvelopeCodec;

/// Single-use bookkeeping for enrollment tokens.
pub trait RedemptionStore: Send + Sync {
    /// Record `token_id` as redeemed at `now`. Returns `false` when the token
    /// was already present (i.e. this is a replay). The write must be durable
    /// before `true` is returned.
    fn try_redeem(&self, token_id: &str, now: Timestamp) -> Result<bool, AimError>;
}

// ── In-memory ────────────────────────────────────────────────────────────────

/// Never persisted; suitable for ephemeral verifiers and tests.
#[derive(Default)]
pub struct InMemoryRedemptions {
    seen: Mutex<BTreeMap<String, Timestamp>>,
}

impl InMemoryRedemptions {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RedemptionStore for InMemoryRedemptions {
    fn try_redeem(&self, token_id: &str, now: Timestamp) -> Result<bool, AimError> {
        let mut seen = self.seen.lock().unwrap();
        if seen.contains_key(token_id) {
            return Ok(false);
        }
        seen.insert(token_id.to_string(), now);
        Ok(true)
    }
}

// ── File-backed ──────────────────────────────────────────────────────────────

#[derive(Default, Clone, Serialize, Deserialize)]
struct RedemptionFile {
    seen: BTreeMap<String, Timestamp>,
}

/// Durable redemption ledger: `{seen: {token_id → at}}` JSON through the
/// at-rest envelope.
pub struct FileRedemptions {
    path: PathBuf,
    codec: EnvelopeCodec,
    mu: Mutex<RedemptionFile>,
}

impl FileRedemptions {
    pub fn open(path: PathBuf, codec: EnvelopeCodec) -> Result<Self, AimError> {
        let state = match codec.read_file(&path)? {
            None => RedemptionFile::default(),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| AimError::Storage(format!("redemption ledger: {e}")))?,
        };
        Ok(Self { path, codec, mu: Mutex::new(state) })
    }
}

impl RedemptionStore for FileRedemptions {
    fn try_redeem(&self, token_id: &str, now: Timestamp) -> Result<bool, AimError> {
        let mut state = self.mu.lock().unwrap();
        if state.seen.contains_key(token_id) {
            return Ok(false);
        }
        let mut scratch = state.clone();
        scratch.seen.insert(token_id.to_string(), now);
        let bytes = serde_json::to_vec(&scratch).map_err(|e| AimError::Storage(e.to_string()))?;
        self.codec.write_file(&self.path, &bytes)?;
        *state = scratch;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_single_use() {
        let st = InMemoryRedemptions::new();
        assert!(st.try_redeem("tok-1", 100).unwrap());
        assert!(!st.try_redeem("tok-1", 200).unwrap());
        assert!(st.try_redeem("tok-2", 200).unwrap());
    }

    #[test]
    fn file_backed_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("redeemed_tokens.json");
        let codec = EnvelopeCodec::from_passphrase(Some("pw"));
        {
            let st = FileRedemptions::open(path.clone(), codec.clone()).unwrap();
            assert!(st.try_redeem("tok-1", 100).unwrap());
        }
        let st = FileRedemptions::open(path, codec).unwrap();
        assert!(!st.try_redeem("tok-1", 300).unwrap());
    }

    #[test]
    fn failed_durable_write_does_not_redeem() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        let st =
            FileRedemptions::open(sub.join("ledger.json"), EnvelopeCodec::plaintext()).unwrap();
        std::fs::write(&sub, b"blocker").unwrap();

        assert!(st.try_redeem("tok-1", 1).is_err());
        // The failed attempt must not have poisoned the in-memory map either.
        std::fs::remove_file(&sub).unwrap();
        assert!(st.try_redeem("tok-1", 2).unwrap());
    }
}

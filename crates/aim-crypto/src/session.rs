use std::collections::HashMap;
use std::sync::RwLock;

use aim_core::interfaces::SessionManager;
use aim_core::AimError;
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{AeadCore, ChaCha20Poly1305, Key, Nonce};
use serde::{Deserialize, Serialize};

/// Per-message key derivation context. The root key never encrypts directly;
/// each message uses `derive_key(context, root || counter)` so a leaked
/// message key does not expose the root.
const SESSION_KDF_CONTEXT: &str = "aim session message key v1";

struct SessionState {
    root_key: zeroize::Zeroizing<[u8; 32]>,
    send_counter: u64,
}

/// Reference session manager: symmetric sessions keyed by contact, seeded
/// with an externally established shared key. Real deployments plug a full
/// ratchet in behind the same trait.
pub struct LocalSessionManager {
    sessions: RwLock<HashMap<String, SessionState>>,
}

#[derive(Serialize, Deserialize)]
struct SessionSnapshot {
    sessions: HashMap<String, SessionExport>,
}

#[derive(Serialize, Deserialize)]
struct SessionExport {
    root_key_hex: String,
    send_counter: u64,
}

impl Default for LocalSessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalSessionManager {
    pub fn new() -> Self {
        Self { sessions: RwLock::new(HashMap::new()) }
    }

    fn message_key(root: &[u8; 32], counter: u64) -> [u8; 32] {
        let mut input = Vec::with_capacity(40);
        input.extend_from_slice(root);
        input.extend_from_slice(&counter.to_le_bytes());
        blake3::derive_key(SESSION_KDF_CONTEXT, &input)
    }
}

impl SessionManager for LocalSessionManager {
    fn init_session(
        &self,
        _local_id: &str,
        contact_id: &str,
        shared_key: [u8; 32],
    ) -> Result<(), AimError> {
        if contact_id.is_empty() {
            return Err(AimError::InvalidArgument("empty contact id".into()));
        }
        let mut sessions = self.sessions.write().unwrap();
        sessions.insert(
            contact_id.to_string(),
            SessionState { root_key: zeroize::Zeroizing::new(shared_key), send_counter: 0 },
        );
        Ok(())
    }

    fn has_session(&self, contact_id: &str) -> bool {
        self.sessions.read().unwrap().contains_key(contact_id)
    }

    /// Output layout: `counter (8 LE) || nonce (12) || ciphertext+tag`.
    fn encrypt(&self, contact_id: &str, plaintext: &[u8]) -> Result<Vec<u8>, AimError> {
        let mut sessions = self.sessions.write().unwrap();
        let session = sessions
            .get_mut(contact_id)
            .ok_or_else(|| AimError::NoSession(contact_id.to_string()))?;

        let counter = session.send_counter;
        session.send_counter += 1;

        let key = Self::message_key(&session.root_key, counter);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ct = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| AimError::DecryptFailed)?;

        let mut out = Vec::with_capacity(8 + 12 + ct.len());
        out.extend_from_slice(&counter.to_le_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    fn decrypt(&self, contact_id: &str, ciphertext: &[u8]) -> Result<Vec<u8>, AimError> {
        let sessions = self.sessions.read().unwrap();
        let session = sessions
            .get(contact_id)
            .ok_or_else(|| AimError::NoSession(contact_id.to_string()))?;

        if ciphertext.len() < 20 {
            return Err(AimError::DecryptFailed);
        }
        let mut counter_bytes = [0u8; 8];
        counter_bytes.copy_from_slice(&ciphertext[..8]);
        let counter = u64::from_le_bytes(counter_bytes);
        let nonce = Nonce::from_slice(&ciphertext[8..20]);

        let key = Self::message_key(&session.root_key, counter);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        cipher.decrypt(nonce, &ciphertext[20..]).map_err(|_| AimError::DecryptFailed)
    }

    fn snapshot(&self) -> Result<serde_json::Value, AimError> {
        let sessions = self.sessions.read().unwrap();
        let snap = SessionSnapshot {
            sessions: sessions
                .iter()
                .map(|(id, s)| {
                    (
                        id.clone(),
                        SessionExport {
                            root_key_hex: hex::encode(s.root_key.as_slice()),
                            send_counter: s.send_counter,
                        },
                    )
                })
                .collect(),
        };
        serde_json::to_value(snap).map_err(|e| AimError::Storage(e.to_string()))
    }

    fn restore(&self, snapshot: serde_json::Value) -> Result<(), AimError> {
        let snap: SessionSnapshot = serde_json::from_value(snapshot)
            .map_err(|e| AimError::InvalidArgument(format!("session snapshot: {e}")))?;
        let mut restored = HashMap::new();
        for (id, s) in snap.sessions {
            let bytes = hex::decode(&s.root_key_hex)
                .map_err(|e| AimError::InvalidArgument(format!("session key hex: {e}")))?;
            if bytes.len() != 32 {
                return Err(AimError::InvalidArgument("session key must be 32 bytes".into()));
            }
            let mut key = [0u8; 32];
            key.copy_from_slice(&bytes);
            restored.insert(
                id,
                SessionState {
                    root_key: zeroize::Zeroizing::new(key),
                    send_counter: s.send_counter,
                },
            );
        }
        *self.sessions.write().unwrap() = restored;
        Ok(())
    }

    fn wipe(&self) {
        self.sessions.write().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (LocalSessionManager, LocalSessionManager) {
        let a = LocalSessionManager::new();
        let b = LocalSessionManager::new();
        let shared = [7u8; 32];
        a.init_session("aim1a", "aim1b", shared).unwrap();
        b.init_session("aim1b", "aim1a", shared).unwrap();
        (a, b)
    }

    #[test]
    fn encrypt_decrypt_between_peers() {
        let (a, b) = pair();
        let ct = a.encrypt("aim1b", b"hello bob").unwrap();
        assert_eq!(b.decrypt("aim1a", &ct).unwrap(), b"hello bob");
    }

    #[test]
    fn each_message_uses_a_fresh_key() {
        let (a, b) = pair();
        let ct1 = a.encrypt("aim1b", b"same").unwrap();
        let ct2 = a.encrypt("aim1b", b"same").unwrap();
        assert_ne!(ct1, ct2);
        assert_ne!(ct1[..8], ct2[..8], "counters must advance");
        assert_eq!(b.decrypt("aim1a", &ct1).unwrap(), b"same");
        assert_eq!(b.decrypt("aim1a", &ct2).unwrap(), b"same");
    }

    #[test]
    fn missing_session_errors() {
        let a = LocalSessionManager::new();
        assert!(matches!(a.encrypt("aim1x", b"hi"), Err(AimError::NoSession(_))));
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let (a, b) = pair();
        let snap = a.snapshot().unwrap();
        let a2 = LocalSessionManager::new();
        a2.restore(snap).unwrap();
        let ct = a2.encrypt("aim1b", b"after restore").unwrap();
        assert_eq!(b.decrypt("aim1a", &ct).unwrap(), b"after restore");
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let (a, b) = pair();
        let mut ct = a.encrypt("aim1b", b"payload").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0xff;
        assert!(b.decrypt("aim1a", &ct).is_err());
    }
}

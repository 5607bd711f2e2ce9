use aim_core::AimError;
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{AeadCore, ChaCha20Poly1305, Key, Nonce};

/// Domain separator for deriving the storage key from the user secret.
const STORAGE_KDF_CONTEXT: &str = "aim storage at-rest v1";

/// At-rest cipher for store files and blobs. The key is derived from the
/// configured passphrase via the BLAKE3 KDF; each seal uses a fresh random
/// nonce prepended to the ciphertext.
#[derive(Clone)]
pub struct StorageCipher {
    key: Key,
}

impl StorageCipher {
    pub fn from_passphrase(passphrase: &str) -> Self {
        let derived = blake3::derive_key(STORAGE_KDF_CONTEXT, passphrase.as_bytes());
        Self { key: Key::from(derived) }
    }

    pub fn from_key(key: [u8; 32]) -> Self {
        Self { key: Key::from(key) }
    }

    /// Encrypt `plaintext`; output is `nonce (12 bytes) || ciphertext+tag`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, AimError> {
        let cipher = ChaCha20Poly1305::new(&self.key);
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ct = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| AimError::Storage("encryption failed".into()))?;
        let mut out = Vec::with_capacity(12 + ct.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    /// Decrypt a `seal` output. Authentication failure is a `DecryptFailed`.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, AimError> {
        if sealed.len() < 12 {
            return Err(AimError::DecryptFailed);
        }
        let (nonce_bytes, ct) = sealed.split_at(12);
        let cipher = ChaCha20Poly1305::new(&self.key);
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ct)
            .map_err(|_| AimError::DecryptFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let c = StorageCipher::from_passphrase("correct horse");
        let sealed = c.seal(b"the quick brown fox").unwrap();
        assert_ne!(&sealed[12..], b"the quick brown fox".as_slice());
        assert_eq!(c.open(&sealed).unwrap(), b"the quick brown fox");
    }

    #[test]
    fn wrong_passphrase_fails_auth() {
        let c1 = StorageCipher::from_passphrase("one");
        let c2 = StorageCipher::from_passphrase("two");
        let sealed = c1.seal(b"secret").unwrap();
        assert!(matches!(c2.open(&sealed), Err(AimError::DecryptFailed)));
    }

    #[test]
    fn truncated_input_is_rejected() {
        let c = StorageCipher::from_passphrase("p");
        assert!(c.open(b"short").is_err());
    }
}

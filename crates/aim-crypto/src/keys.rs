use aim_core::types::{identity_id_from_pubkey, IdentityId};
use aim_core::AimError;
use pqcrypto_dilithium::dilithium2;
use pqcrypto_traits::sign::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};

use crate::sign;

/// A Dilithium2 keypair with its derived identity id. Secret bytes are
/// zeroized on drop.
pub struct KeyPair {
    pub identity_id: IdentityId,
    pub public_key: Vec<u8>,
    secret_key: zeroize::Zeroizing<Vec<u8>>,
}

impl KeyPair {
    pub fn generate() -> Self {
        let (pk, sk) = dilithium2::keypair();
        let public_key = pk.as_bytes().to_vec();
        Self {
            identity_id: identity_id_from_pubkey(&public_key),
            public_key,
            secret_key: zeroize::Zeroizing::new(sk.as_bytes().to_vec()),
        }
    }

    pub fn from_bytes(public_key: Vec<u8>, secret_key: Vec<u8>) -> Self {
        Self {
            identity_id: identity_id_from_pubkey(&public_key),
            public_key,
            secret_key: zeroize::Zeroizing::new(secret_key),
        }
    }

    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, AimError> {
        sign::sign_detached(&self.secret_key, message)
    }

    pub fn sign_b64(&self, message: &[u8]) -> Result<String, AimError> {
        sign::sign_detached_b64(&self.secret_key, message)
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), AimError> {
        sign::verify_detached(&self.public_key, message, signature)
    }

    pub fn public_key_b64(&self) -> String {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD.encode(&self.public_key)
    }

    /// Serializable key material for backup export.
    pub fn export(&self) -> KeyPairExport {
        KeyPairExport {
            public_key_hex: hex::encode(&self.public_key),
            secret_key_hex: hex::encode(self.secret_key.as_slice()),
        }
    }

    pub fn import(export: &KeyPairExport) -> Result<Self, AimError> {
        let pk = hex::decode(&export.public_key_hex)
            .map_err(|e| AimError::InvalidArgument(format!("public key hex: {e}")))?;
        let sk = hex::decode(&export.secret_key_hex)
            .map_err(|e| AimError::InvalidArgument(format!("secret key hex: {e}")))?;
        Ok(Self::from_bytes(pk, sk))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPairExport {
    pub public_key_hex: String,
    pub secret_key_hex: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("identity_id", &self.identity_id)
            .field("public_key", &format_args!("{}b", self.public_key.len()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_pair_signs_and_verifies() {
        let kp = KeyPair::generate();
        let sig = kp.sign(b"hello").unwrap();
        assert!(kp.verify(b"hello", &sig).is_ok());
        assert!(kp.verify(b"other", &sig).is_err());
    }

    #[test]
    fn export_import_preserves_identity() {
        let kp = KeyPair::generate();
        let restored = KeyPair::import(&kp.export()).unwrap();
        assert_eq!(kp.identity_id, restored.identity_id);
        let sig = restored.sign(b"payload").unwrap();
        assert!(kp.verify(b"payload", &sig).is_ok());
    }
}

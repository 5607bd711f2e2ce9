use aim_core::AimError;
use pqcrypto_dilithium::dilithium2;
use pqcrypto_traits::sign::{DetachedSignature, PublicKey, SecretKey};

/// Sign `message` with a Dilithium2 secret key. Returns the detached
/// signature bytes.
pub fn sign_detached(secret_key_bytes: &[u8], message: &[u8]) -> Result<Vec<u8>, AimError> {
    let sk = dilithium2::SecretKey::from_bytes(secret_key_bytes)
        .map_err(|_| AimError::SignatureInvalid)?;
    let sig = dilithium2::detached_sign(message, &sk);
    Ok(sig.as_bytes().to_vec())
}

/// Verify a detached Dilithium2 signature over `message`.
pub fn verify_detached(
    public_key_bytes: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), AimError> {
    let pk = dilithium2::PublicKey::from_bytes(public_key_bytes)
        .map_err(|_| AimError::SignatureInvalid)?;
    let sig = dilithium2::DetachedSignature::from_bytes(signature)
        .map_err(|_| AimError::SignatureInvalid)?;
    dilithium2::verify_detached_signature(&sig, message, &pk)
        .map_err(|_| AimError::SignatureInvalid)
}

/// Base64 convenience wrappers used at wire boundaries.
pub fn sign_detached_b64(secret_key_bytes: &[u8], message: &[u8]) -> Result<String, AimError> {
    use base64::Engine as _;
    let sig = sign_detached(secret_key_bytes, message)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(sig))
}

pub fn verify_detached_b64(
    public_key_bytes: &[u8],
    message: &[u8],
    signature_b64: &str,
) -> Result<(), AimError> {
    use base64::Engine as _;
    let sig = base64::engine::general_purpose::STANDARD
        .decode(signature_b64)
        .map_err(|_| AimError::SignatureInvalid)?;
    verify_detached(public_key_bytes, message, &sig)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pqcrypto_dilithium::dilithium2;
    use pqcrypto_traits::sign::{PublicKey, SecretKey};

    #[test]
    fn sign_verify_round_trip() {
        let (pk, sk) = dilithium2::keypair();
        let message = b"private by default";
        let sig = sign_detached(sk.as_bytes(), message).unwrap();
        assert!(verify_detached(pk.as_bytes(), message, &sig).is_ok());
    }

    #[test]
    fn tampered_message_fails() {
        let (pk, sk) = dilithium2::keypair();
        let sig = sign_detached(sk.as_bytes(), b"original").unwrap();
        assert!(verify_detached(pk.as_bytes(), b"tampered", &sig).is_err());
    }

    #[test]
    fn b64_wrappers_round_trip() {
        let (pk, sk) = dilithium2::keypair();
        let sig = sign_detached_b64(sk.as_bytes(), b"payload").unwrap();
        assert!(verify_detached_b64(pk.as_bytes(), b"payload", &sig).is_ok());
        assert!(verify_detached_b64(pk.as_bytes(), b"payload", "not base64!").is_err());
    }
}

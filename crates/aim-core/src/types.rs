use std::fmt;

/// Unix timestamp in milliseconds, UTC.
pub type Timestamp = i64;

/// Identity identifier: `aim1` followed by base-58 of BLAKE3(identity public key).
pub type IdentityId = String;

/// Node identifier (one device enrolled under an identity).
pub type NodeId = String;

/// Content-addressed-or-random attachment identifier (`att1_` + 12 random bytes hex).
pub type BlobId = String;

/// Current wall-clock time in UTC milliseconds.
pub fn now_ms() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

// ── Fingerprint ──────────────────────────────────────────────────────────────

/// 32-byte contact-card fingerprint: BLAKE3 of the contact's identity public key.
#[derive(Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    pub fn from_bytes(b: [u8; 32]) -> Self {
        Self(b)
    }

    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({}…)", &self.to_hex()[..16])
    }
}

// ── Identity id derivation ───────────────────────────────────────────────────

/// Derive the `aim1…` identity id from raw public key bytes.
pub fn identity_id_from_pubkey(pubkey_bytes: &[u8]) -> IdentityId {
    let digest = blake3::hash(pubkey_bytes);
    format!(
        "{}{}",
        crate::constants::IDENTITY_ID_PREFIX,
        bs58::encode(digest.as_bytes()).into_string()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_id_is_prefixed_and_stable() {
        let a = identity_id_from_pubkey(b"some public key");
        let b = identity_id_from_pubkey(b"some public key");
        assert_eq!(a, b);
        assert!(a.starts_with("aim1"));
    }

    #[test]
    fn fingerprint_hex_round_trip() {
        let fp = Fingerprint::of(b"contact card");
        let parsed = Fingerprint::from_hex(&fp.to_hex()).unwrap();
        assert_eq!(fp, parsed);
    }
}

//! Enrollment token verification and single-use redemption.
//!
//! Token layout: `base64url(claims_json) "." base64url(signature)`, the
//! signature computed over the raw JSON payload bytes with the issuer key
//! selected by `key_id`. Verification runs in a fixed order and every
//! rejection emits an audit event with its stable reason string.

use std::collections::HashMap;

use aim_core::constants::{ENROLLMENT_ISSUER, ENROLLMENT_SCOPE};
use aim_core::types::Timestamp;
use aim_core::AimError;
use aim_store::RedemptionStore;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::sanitize::Sanitizer;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentClaims {
    pub token_id: String,
    /// Unix milliseconds.
    pub issued_at: Timestamp,
    pub expires_at: Timestamp,
    pub scope: String,
    pub subject_node_group: String,
    pub issuer: String,
    pub key_id: String,
}

/// Audit sink for enrollment decisions; the service feeds these into its
/// audit ring and structured logs.
pub trait EnrollmentAudit: Send + Sync {
    fn rejected(&self, reason: &'static str, detail: &str);
    fn accepted(&self, token_id: &str, node_group: &str);
}

pub struct EnrollmentVerifier {
    /// kid → issuer public key bytes, frozen at startup.
    issuer_keys: HashMap<String, Vec<u8>>,
}

impl EnrollmentVerifier {
    pub fn new(issuer_keys: HashMap<String, Vec<u8>>) -> Self {
        Self { issuer_keys }
    }

    /// Verify `token` and redeem it exactly once through `redemptions`.
    pub fn verify_and_redeem(
        &self,
        token: &str,
        redemptions: &dyn RedemptionStore,
        audit: &dyn EnrollmentAudit,
        sanitizer: &Sanitizer,
        now: Timestamp,
    ) -> Result<EnrollmentClaims, AimError> {
        match self.verify_inner(token, redemptions, now) {
            Ok(claims) => {
                audit.accepted(&claims.token_id, &claims.subject_node_group);
                Ok(claims)
            }
            Err(e) => {
                let reason = e.enrollment_reason().unwrap_or("TOKEN_REDEEM_FAILED");
                let detail = sanitizer.redact_line(&e.to_string());
                warn!(reason, detail = %detail, "enrollment token rejected");
                audit.rejected(reason, &detail);
                Err(e)
            }
        }
    }

    fn verify_inner(
        &self,
        token: &str,
        redemptions: &dyn RedemptionStore,
        now: Timestamp,
    ) -> Result<EnrollmentClaims, AimError> {
        // 1. Decode.
        let (payload_b64, sig_b64) =
            token.split_once('.').ok_or(AimError::TokenMalformed)?;
        let b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let payload = b64.decode(payload_b64).map_err(|_| AimError::TokenMalformed)?;
        let signature = b64.decode(sig_b64).map_err(|_| AimError::TokenMalformed)?;
        let claims: EnrollmentClaims =
            serde_json::from_slice(&payload).map_err(|_| AimError::TokenMalformed)?;

        // 2. Claims shape.
        if claims.issuer.trim() != ENROLLMENT_ISSUER {
            return Err(AimError::TokenIssuerInvalid);
        }
        if claims.scope != ENROLLMENT_SCOPE {
            return Err(AimError::TokenScopeInvalid);
        }
        if claims.token_id.is_empty()
            || claims.key_id.is_empty()
            || claims.subject_node_group.is_empty()
            || claims.issued_at == 0
            || claims.expires_at == 0
            || claims.expires_at <= claims.issued_at
        {
            return Err(AimError::TokenClaimsInvalid);
        }

        // 3. Expiry.
        if claims.expires_at <= now {
            return Err(AimError::TokenExpired);
        }

        // 4. Signature over the exact decoded payload bytes.
        let issuer_key = self
            .issuer_keys
            .get(&claims.key_id)
            .ok_or(AimError::TokenSignatureInvalid)?;
        aim_crypto::verify_detached(issuer_key, &payload, &signature)
            .map_err(|_| AimError::TokenSignatureInvalid)?;

        // 5. Single use. The redemption write is durable before acceptance.
        match redemptions.try_redeem(&claims.token_id, now) {
            Ok(true) => Ok(claims),
            Ok(false) => Err(AimError::TokenAlreadyUsed),
            Err(e) => Err(AimError::TokenRedeemFailed(e.to_string())),
        }
    }
}

/// Mint a signed token; issuer-side helper used by tests and provisioning
/// tooling.
pub fn mint_token(claims: &EnrollmentClaims, issuer_secret_key: &[u8]) -> Result<String, AimError> {
    let b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let payload = serde_json::to_vec(claims).map_err(|e| AimError::InvalidArgument(e.to_string()))?;
    let signature = aim_crypto::sign_detached(issuer_secret_key, &payload)?;
    Ok(format!("{}.{}", b64.encode(payload), b64.encode(signature)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aim_store::InMemoryRedemptions;
    use pqcrypto_dilithium::dilithium2;
    use pqcrypto_traits::sign::{PublicKey, SecretKey};
    use std::sync::Mutex;

    struct RecordingAudit {
        rejections: Mutex<Vec<&'static str>>,
        accepts: Mutex<Vec<String>>,
    }

    impl RecordingAudit {
        fn new() -> Self {
            Self { rejections: Mutex::new(vec![]), accepts: Mutex::new(vec![]) }
        }
    }

    impl EnrollmentAudit for RecordingAudit {
        fn rejected(&self, reason: &'static str, _detail: &str) {
            self.rejections.lock().unwrap().push(reason);
        }
        fn accepted(&self, token_id: &str, _node_group: &str) {
            self.accepts.lock().unwrap().push(token_id.to_string());
        }
    }

    fn claims(token_id: &str, now: Timestamp) -> EnrollmentClaims {
        EnrollmentClaims {
            token_id: token_id.into(),
            issued_at: now - 60_000,
            expires_at: now + 600_000,
            scope: ENROLLMENT_SCOPE.into(),
            subject_node_group: "group-blue".into(),
            issuer: ENROLLMENT_ISSUER.into(),
            key_id: "issuer-k1".into(),
        }
    }

    fn setup() -> (EnrollmentVerifier, Vec<u8>, RecordingAudit, Sanitizer) {
        let (pk, sk) = dilithium2::keypair();
        let mut keys = HashMap::new();
        keys.insert("issuer-k1".to_string(), pk.as_bytes().to_vec());
        (
            EnrollmentVerifier::new(keys),
            sk.as_bytes().to_vec(),
            RecordingAudit::new(),
            Sanitizer::new(),
        )
    }

    #[test]
    fn valid_token_is_accepted_once() {
        let (verifier, sk, audit, sanitizer) = setup();
        let now = 1_700_000_000_000;
        let token = mint_token(&claims("tok-single-use", now), &sk).unwrap();
        let redemptions = InMemoryRedemptions::new();

        let accepted = verifier
            .verify_and_redeem(&token, &redemptions, &audit, &sanitizer, now)
            .unwrap();
        assert_eq!(accepted.token_id, "tok-single-use");

        let second = verifier.verify_and_redeem(&token, &redemptions, &audit, &sanitizer, now);
        assert!(matches!(second, Err(AimError::TokenAlreadyUsed)));
        assert_eq!(audit.rejections.lock().unwrap().as_slice(), &["TOKEN_ALREADY_USED"]);
    }

    #[test]
    fn expired_token_is_rejected() {
        let (verifier, sk, audit, sanitizer) = setup();
        let now = 1_700_000_000_000;
        let mut c = claims("tok-expired", now);
        c.issued_at = now - 600_000;
        c.expires_at = now - 60_000; // expired one minute ago
        let token = mint_token(&c, &sk).unwrap();

        let result = verifier.verify_and_redeem(
            &token,
            &InMemoryRedemptions::new(),
            &audit,
            &sanitizer,
            now,
        );
        assert!(matches!(result, Err(AimError::TokenExpired)));
        assert_eq!(audit.rejections.lock().unwrap().as_slice(), &["TOKEN_EXPIRED"]);
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        let (verifier, _sk, audit, sanitizer) = setup();
        let redemptions = InMemoryRedemptions::new();
        for bad in ["", "nodot", "a.b", "!!!.###"] {
            let result =
                verifier.verify_and_redeem(bad, &redemptions, &audit, &sanitizer, 1_000);
            assert!(matches!(result, Err(AimError::TokenMalformed)), "token {bad:?}");
        }
    }

    #[test]
    fn wrong_issuer_scope_and_claims() {
        let (verifier, sk, audit, sanitizer) = setup();
        let now = 1_700_000_000_000;
        let redemptions = InMemoryRedemptions::new();

        let mut c = claims("t1", now);
        c.issuer = "someone-else".into();
        let r = verifier.verify_and_redeem(
            &mint_token(&c, &sk).unwrap(), &redemptions, &audit, &sanitizer, now);
        assert!(matches!(r, Err(AimError::TokenIssuerInvalid)));

        let mut c = claims("t2", now);
        c.scope = "aim:other".into();
        let r = verifier.verify_and_redeem(
            &mint_token(&c, &sk).unwrap(), &redemptions, &audit, &sanitizer, now);
        assert!(matches!(r, Err(AimError::TokenScopeInvalid)));

        let mut c = claims("t3", now);
        c.subject_node_group = String::new();
        let r = verifier.verify_and_redeem(
            &mint_token(&c, &sk).unwrap(), &redemptions, &audit, &sanitizer, now);
        assert!(matches!(r, Err(AimError::TokenClaimsInvalid)));

        let mut c = claims("t4", now);
        c.expires_at = c.issued_at; // not strictly after issuance
        let r = verifier.verify_and_redeem(
            &mint_token(&c, &sk).unwrap(), &redemptions, &audit, &sanitizer, now);
        assert!(matches!(r, Err(AimError::TokenClaimsInvalid)));
    }

    #[test]
    fn wrong_key_signature_is_rejected() {
        let (verifier, _sk, audit, sanitizer) = setup();
        let now = 1_700_000_000_000;

        // Signed by a key the verifier does not know under this kid.
        let (_pk2, sk2) = dilithium2::keypair();
        let token = mint_token(&claims("t5", now), sk2.as_bytes()).unwrap();
        let r = verifier.verify_and_redeem(
            &token,
            &InMemoryRedemptions::new(),
            &audit,
            &sanitizer,
            now,
        );
        assert!(matches!(r, Err(AimError::TokenSignatureInvalid)));

        // Unknown kid entirely.
        let (verifier2, sk, audit2, sanitizer2) = setup();
        let _ = verifier2;
        let mut c = claims("t6", now);
        c.key_id = "issuer-unknown".into();
        let token = mint_token(&c, &sk).unwrap();
        let r = EnrollmentVerifier::new(HashMap::new()).verify_and_redeem(
            &token,
            &InMemoryRedemptions::new(),
            &audit2,
            &sanitizer2,
            now,
        );
        assert!(matches!(r, Err(AimError::TokenSignatureInvalid)));
    }
}

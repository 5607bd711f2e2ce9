use std::fmt;
use thiserror::Error;

/// Coarse error category attached at component boundaries. Only `Network`
/// errors escalate to the retry scheduler; everything else surfaces to the
/// caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Api,
    Policy,
    Network,
    Storage,
    Crypto,
    State,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Api => "api",
            ErrorCategory::Policy => "policy",
            ErrorCategory::Network => "network",
            ErrorCategory::Storage => "storage",
            ErrorCategory::Crypto => "crypto",
            ErrorCategory::State => "state",
        };
        f.write_str(s)
    }
}

/// Reason tag recorded in metrics when a blob fetch exhausts all options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableReason {
    NoProviders,
    RateLimited,
    Forbidden,
    ProvidersFailed,
    Timeout,
    Cancelled,
}

impl UnavailableReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnavailableReason::NoProviders => "no_providers",
            UnavailableReason::RateLimited => "rate_limited",
            UnavailableReason::Forbidden => "forbidden",
            UnavailableReason::ProvidersFailed => "providers_failed",
            UnavailableReason::Timeout => "timeout",
            UnavailableReason::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum AimError {
    // ── API (bad input) ──────────────────────────────────────────────────────
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("consent token mismatch")]
    ConsentMismatch,

    #[error("unknown account profile: {0}")]
    UnknownProfile(String),

    #[error("account profile already exists: {0}")]
    ProfileExists(String),

    // ── Policy ───────────────────────────────────────────────────────────────
    #[error("rejected by privacy policy")]
    PolicyRejected,

    #[error("sender is blocked")]
    SenderBlocked,

    #[error("contact card fingerprint mismatch for {0}")]
    ContactFingerprintMismatch(String),

    // ── Network ──────────────────────────────────────────────────────────────
    #[error("transport error: {0}")]
    Transport(String),

    #[error("publish timed out after {0} ms")]
    PublishTimeout(u64),

    #[error("networking is not active")]
    NetworkInactive,

    #[error("operation cancelled")]
    Cancelled,

    // ── Storage ──────────────────────────────────────────────────────────────
    #[error("storage error: {0}")]
    Storage(String),

    #[error("message id conflict: {0}")]
    MessageIdConflict(String),

    #[error("message not found: {0}")]
    MessageNotFound(String),

    #[error("unsupported storage schema version {got} (this build reads up to {max})")]
    UnsupportedStorageSchema { got: u32, max: u32 },

    // ── Attachments ──────────────────────────────────────────────────────────
    #[error("attachment not found: {0}")]
    AttachmentNotFound(String),

    #[error("attachment access denied")]
    AttachmentAccessDenied,

    #[error("attachment temporarily unavailable ({reason})")]
    AttachmentTemporarilyUnavailable { reason: UnavailableReason },

    #[error("attachment hard cap reached for class {class}")]
    AttachmentHardCapReached { class: String },

    #[error("attachment exceeds per-item limit for class {class}: {size} > {max}")]
    AttachmentItemTooLarge { class: String, size: u64, max: u64 },

    // ── Crypto ───────────────────────────────────────────────────────────────
    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("decryption failed")]
    DecryptFailed,

    #[error("no session established with {0}")]
    NoSession(String),

    #[error("unknown device {device} for sender {sender}")]
    UnknownDevice { sender: String, device: String },

    #[error("device has been revoked: {0}")]
    DeviceRevoked(String),

    // ── Enrollment tokens ────────────────────────────────────────────────────
    #[error("enrollment token malformed")]
    TokenMalformed,

    #[error("enrollment token issuer invalid")]
    TokenIssuerInvalid,

    #[error("enrollment token scope invalid")]
    TokenScopeInvalid,

    #[error("enrollment token claims invalid")]
    TokenClaimsInvalid,

    #[error("enrollment token expired")]
    TokenExpired,

    #[error("enrollment token signature invalid")]
    TokenSignatureInvalid,

    #[error("enrollment token already used")]
    TokenAlreadyUsed,

    #[error("enrollment token redemption failed: {0}")]
    TokenRedeemFailed(String),

    // ── Node binding ─────────────────────────────────────────────────────────
    #[error("link code not found or already consumed")]
    LinkCodeUnknown,

    #[error("link code expired")]
    LinkCodeExpired,

    #[error("identity is already bound to node {0}; pass allow_rebind to replace")]
    AlreadyBound(String),

    #[error("unbind requires explicit confirmation")]
    UnbindNotConfirmed,

    #[error("no binding found for node {0}")]
    BindingNotFound(String),

    // ── Replay / state ───────────────────────────────────────────────────────
    #[error("duplicate group event rejected by replay guard")]
    ReplayRejected,

    #[error("event timestamp outside replay window")]
    ReplayOutOfWindow,

    #[error("invariant violation: {0}")]
    State(String),
}

impl AimError {
    /// The boundary category of this error.
    pub fn category(&self) -> ErrorCategory {
        use AimError::*;
        match self {
            InvalidArgument(_) | ConsentMismatch | UnknownProfile(_) | ProfileExists(_)
            | AttachmentItemTooLarge { .. } | UnbindNotConfirmed | BindingNotFound(_) => {
                ErrorCategory::Api
            }

            PolicyRejected | SenderBlocked | ContactFingerprintMismatch(_)
            | AttachmentAccessDenied | AlreadyBound(_) => ErrorCategory::Policy,

            Transport(_) | PublishTimeout(_) | NetworkInactive | Cancelled
            | AttachmentTemporarilyUnavailable { .. } => ErrorCategory::Network,

            Storage(_) | MessageIdConflict(_) | MessageNotFound(_)
            | UnsupportedStorageSchema { .. } | AttachmentNotFound(_)
            | AttachmentHardCapReached { .. } | TokenRedeemFailed(_) => ErrorCategory::Storage,

            SignatureInvalid | DecryptFailed | NoSession(_) | UnknownDevice { .. }
            | DeviceRevoked(_) | TokenMalformed | TokenIssuerInvalid | TokenScopeInvalid
            | TokenClaimsInvalid | TokenExpired | TokenSignatureInvalid | TokenAlreadyUsed
            | LinkCodeUnknown | LinkCodeExpired => ErrorCategory::Crypto,

            ReplayRejected | ReplayOutOfWindow | State(_) => ErrorCategory::State,
        }
    }

    /// Only network-category failures are eligible for the retry queue.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Network && !matches!(self, AimError::Cancelled)
    }

    /// Audit reason string for enrollment failures (stable wire names).
    pub fn enrollment_reason(&self) -> Option<&'static str> {
        use AimError::*;
        match self {
            TokenMalformed => Some("TOKEN_MALFORMED"),
            TokenIssuerInvalid => Some("TOKEN_ISSUER_INVALID"),
            TokenScopeInvalid => Some("TOKEN_SCOPE_INVALID"),
            TokenClaimsInvalid => Some("TOKEN_CLAIMS_INVALID"),
            TokenExpired => Some("TOKEN_EXPIRED"),
            TokenSignatureInvalid => Some("TOKEN_SIGNATURE_INVALID"),
            TokenAlreadyUsed => Some("TOKEN_ALREADY_USED"),
            TokenRedeemFailed(_) => Some("TOKEN_REDEEM_FAILED"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_errors_retry() {
        assert!(AimError::Transport("down".into()).is_retryable());
        assert!(AimError::PublishTimeout(10_000).is_retryable());
        assert!(!AimError::Cancelled.is_retryable());
        assert!(!AimError::Storage("disk".into()).is_retryable());
        assert!(!AimError::PolicyRejected.is_retryable());
    }

    #[test]
    fn categories_are_stable() {
        assert_eq!(AimError::TokenExpired.category(), ErrorCategory::Crypto);
        assert_eq!(AimError::ReplayRejected.category(), ErrorCategory::State);
        assert_eq!(
            AimError::AttachmentTemporarilyUnavailable { reason: UnavailableReason::NoProviders }
                .category(),
            ErrorCategory::Network
        );
    }
}

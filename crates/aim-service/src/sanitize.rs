//! Log and diagnostics sanitizer. Identifiers are fingerprinted with a
//! per-boot nonce so operators can correlate lines within one run without
//! learning the identifier; secret-bearing keys are redacted outright.

use once_cell::sync::Lazy;
use rand::RngCore;
use regex::Regex;
use sha2::{Digest, Sha256};

static SECRET_KEY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)("?(?:[a-z0-9_\-]*(?:token|secret|password|passphrase|authorization|auth)[a-z0-9_\-]*)"?\s*[:=]\s*)("[^"]*"|\S+)"#)
        .expect("secret key regex compiles")
});

static RPC_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"rpc_[A-Za-z0-9_\-]+").expect("rpc token regex compiles"));

static IDENTITY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"aim1[1-9A-HJ-NP-Za-km-z]{8,}").expect("identity regex compiles"));

pub struct Sanitizer {
    boot_nonce: [u8; 16],
}

impl Sanitizer {
    pub fn new() -> Self {
        let mut boot_nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut boot_nonce);
        Self { boot_nonce }
    }

    /// `fp_` + first 16 hex chars of SHA-256(id ‖ boot nonce). Stable within
    /// one daemon run, meaningless across runs.
    pub fn fingerprint(&self, id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(id.as_bytes());
        hasher.update(self.boot_nonce);
        let digest = hasher.finalize();
        format!("fp_{}", &hex::encode(digest)[..16])
    }

    /// Redact values of secret-bearing keys in a log line. The replacement
    /// stays quoted so redacting serialized JSON keeps it parseable.
    pub fn redact_line(&self, line: &str) -> String {
        SECRET_KEY_RE.replace_all(line, "$1\"[REDACTED]\"").into_owned()
    }

    /// Diagnostics-grade pass: key redaction plus `rpc_*` tokens and `aim1…`
    /// identifiers replaced by their per-boot fingerprints.
    pub fn redact_diagnostics(&self, text: &str) -> String {
        let pass1 = self.redact_line(text);
        let pass2 = RPC_TOKEN_RE.replace_all(&pass1, "rpc_[REDACTED]");
        IDENTITY_RE
            .replace_all(&pass2, |caps: &regex::Captures<'_>| self.fingerprint(&caps[0]))
            .into_owned()
    }
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprints_are_stable_within_a_boot() {
        let s = Sanitizer::new();
        let a = s.fingerprint("aim1somebody");
        assert_eq!(a, s.fingerprint("aim1somebody"));
        assert!(a.starts_with("fp_"));
        assert_eq!(a.len(), 3 + 16);
        assert_ne!(a, s.fingerprint("aim1somebodyelse"));
    }

    #[test]
    fn nonce_varies_across_boots() {
        let a = Sanitizer::new().fingerprint("aim1somebody");
        let b = Sanitizer::new().fingerprint("aim1somebody");
        assert_ne!(a, b);
    }

    #[test]
    fn secret_keys_are_redacted() {
        let s = Sanitizer::new();
        let line = r#"auth_token=tok123 passphrase: "hunter2" peer=aim1x"#;
        let out = s.redact_line(line);
        assert!(!out.contains("tok123"));
        assert!(!out.contains("hunter2"));
        assert!(out.contains("peer=aim1x"), "non-secret keys untouched");
    }

    #[test]
    fn diagnostics_redacts_rpc_and_identities() {
        let s = Sanitizer::new();
        let text = "call rpc_deadbeef123 from aim1BvQhT3yGm9WxYzK1 ok";
        let out = s.redact_diagnostics(text);
        assert!(!out.contains("rpc_deadbeef123"));
        assert!(out.contains("rpc_[REDACTED]"));
        assert!(!out.contains("aim1BvQhT3yGm9WxYzK1"));
        assert!(out.contains("fp_"));
    }
}

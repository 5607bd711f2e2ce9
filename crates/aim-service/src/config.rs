//! Frozen runtime configuration. Environment is read exactly once at
//! startup into `ServiceConfig`; nothing else in the daemon touches env.

use std::collections::HashMap;

use aim_core::attachment::{AttachmentClassLimits, AttachmentTtls, ClassLimits, HardCapPolicy};
use aim_core::constants::{
    BATCH_WINDOW_DEFAULT_MS, BATCH_WINDOW_MAX_MS, JITTER_MAX_CEILING_MS, JITTER_MAX_DEFAULT_MS,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

// ── Enumerated modes ─────────────────────────────────────────────────────────

/// Whether this node announces itself as a blob provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationMode {
    OnDemand,
    PinnedOnly,
    None,
}

impl ReplicationMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "on_demand" => Some(ReplicationMode::OnDemand),
            "pinned_only" => Some(ReplicationMode::PinnedOnly),
            "none" => Some(ReplicationMode::None),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AclMode {
    OwnerOnly,
    OwnerContacts,
    OwnerGroupsMembers,
    Allowlist,
}

impl AclMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "owner_only" => Some(AclMode::OwnerOnly),
            "owner_contacts" => Some(AclMode::OwnerContacts),
            "owner_groups_members" => Some(AclMode::OwnerGroupsMembers),
            "allowlist" => Some(AclMode::Allowlist),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivacyMode {
    Everyone,
    ContactsOnly,
    Nobody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionMode {
    Standard,
    ZeroRetention,
}

// ── Serving limits ───────────────────────────────────────────────────────────

/// One public-serving preset: bandwidth, concurrency and per-peer budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServingLimits {
    pub soft_kbps: u32,
    pub hard_kbps: u32,
    pub max_concurrent: u32,
    pub per_peer_per_minute: u32,
}

impl Default for ServingLimits {
    fn default() -> Self {
        Self { soft_kbps: 512, hard_kbps: 2048, max_concurrent: 8, per_peer_per_minute: 30 }
    }
}

/// Resource-pressure thresholds driving the public-serving state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradeConfig {
    pub memory_bytes: u64,
    pub pending_len: usize,
    pub loop_lag_ms: u64,
    pub overload_window_ms: i64,
    pub recovery_window_ms: i64,
    /// Serve bandwidth multiplier while degraded, percent.
    pub degraded_factor_pct: u32,
    pub degraded_limits: ServingLimits,
}

impl Default for DegradeConfig {
    fn default() -> Self {
        Self {
            memory_bytes: 512 * 1024 * 1024,
            pending_len: 256,
            loop_lag_ms: 2_000,
            overload_window_ms: 30_000,
            recovery_window_ms: 60_000,
            degraded_factor_pct: 25,
            degraded_limits: ServingLimits {
                soft_kbps: 128,
                hard_kbps: 512,
                max_concurrent: 2,
                per_peer_per_minute: 6,
            },
        }
    }
}

// ── Service config ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// kid → issuer public key bytes.
    pub enrollment_issuer_keys: HashMap<String, Vec<u8>>,
    pub storage_passphrase: Option<String>,
    pub replication_mode: ReplicationMode,
    pub blob_fetch_enabled: bool,
    pub blob_announce_enabled: bool,
    /// Store remotely fetched public blobs durably, not just in the cache.
    pub public_store_enabled: bool,
    pub public_serving_enabled: bool,
    /// Deterministic rollout bucket for the fetch path, percent.
    pub rollout_pct: u8,
    pub acl_mode: AclMode,
    pub acl_allowlist: Vec<String>,
    pub metadata_hardening: bool,
    pub batch_window_ms: u64,
    pub jitter_max_ms: u64,
    pub privacy_mode: PrivacyMode,
    pub retention: RetentionMode,
    pub serving: ServingLimits,
    pub degrade: DegradeConfig,
    pub attachment_limits: AttachmentClassLimits,
    pub attachment_ttls: AttachmentTtls,
    pub hard_cap: HardCapPolicy,
    pub fetch_bandwidth_kbps: u32,
    pub diagnostics_window_min: i64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            enrollment_issuer_keys: HashMap::new(),
            storage_passphrase: None,
            replication_mode: ReplicationMode::OnDemand,
            blob_fetch_enabled: true,
            blob_announce_enabled: true,
            public_store_enabled: false,
            public_serving_enabled: true,
            rollout_pct: 100,
            acl_mode: AclMode::OwnerContacts,
            acl_allowlist: Vec::new(),
            metadata_hardening: true,
            batch_window_ms: BATCH_WINDOW_DEFAULT_MS,
            jitter_max_ms: JITTER_MAX_DEFAULT_MS,
            privacy_mode: PrivacyMode::Everyone,
            retention: RetentionMode::Standard,
            serving: ServingLimits::default(),
            degrade: DegradeConfig::default(),
            attachment_limits: AttachmentClassLimits {
                image: ClassLimits { max_item_bytes: 32 * 1024 * 1024, quota_bytes: 0 },
                file: ClassLimits { max_item_bytes: 256 * 1024 * 1024, quota_bytes: 0 },
            },
            attachment_ttls: AttachmentTtls::default(),
            hard_cap: HardCapPolicy::default(),
            fetch_bandwidth_kbps: 4096,
            diagnostics_window_min: 60,
        }
    }
}

fn env_str(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_bool(name: &str, default: bool) -> bool {
    match env_str(name).as_deref() {
        Some("1") | Some("true") | Some("yes") | Some("on") => true,
        Some("0") | Some("false") | Some("no") | Some("off") => false,
        Some(other) => {
            warn!(var = name, value = other, "unrecognized boolean; using default");
            default
        }
        None => default,
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    match env_str(name).map(|v| v.parse::<u64>()) {
        Some(Ok(v)) => v,
        Some(Err(_)) => {
            warn!(var = name, "unparseable integer; using default");
            default
        }
        None => default,
    }
}

impl ServiceConfig {
    /// Build the frozen configuration from process environment. Called once
    /// at startup; later env changes are invisible.
    pub fn from_env() -> Self {
        use base64::Engine as _;
        let mut cfg = Self::default();

        if let Some(raw) = env_str("AIM_ENROLLMENT_ISSUER_KEYS") {
            for pair in raw.split(',') {
                let Some((kid, b64)) = pair.trim().split_once(':') else {
                    warn!(entry = pair, "ignoring malformed issuer key entry");
                    continue;
                };
                match base64::engine::general_purpose::STANDARD.decode(b64.trim()) {
                    Ok(pk) => {
                        cfg.enrollment_issuer_keys.insert(kid.trim().to_string(), pk);
                    }
                    Err(e) => warn!(kid = kid, error = %e, "ignoring undecodable issuer key"),
                }
            }
        }

        cfg.storage_passphrase = env_str("AIM_STORAGE_PASSPHRASE");

        if let Some(raw) = env_str("AIM_BLOB_REPLICATION_MODE") {
            match ReplicationMode::parse(&raw) {
                Some(mode) => cfg.replication_mode = mode,
                None => warn!(value = raw, "unknown replication mode; using default"),
            }
        }

        cfg.blob_fetch_enabled = env_bool("AIM_BLOB_PROVIDER_FETCH_ENABLED", cfg.blob_fetch_enabled);
        cfg.blob_announce_enabled =
            env_bool("AIM_BLOB_PROVIDER_ANNOUNCE_ENABLED", cfg.blob_announce_enabled);
        cfg.public_store_enabled =
            env_bool("AIM_BLOB_PROVIDER_PUBLIC_STORE", cfg.public_store_enabled);
        cfg.rollout_pct =
            env_u64("AIM_BLOB_PROVIDER_ROLLOUT_PCT", cfg.rollout_pct as u64).min(100) as u8;

        if let Some(raw) = env_str("AIM_BLOB_ACL_MODE") {
            match AclMode::parse(&raw) {
                Some(mode) => cfg.acl_mode = mode,
                None => warn!(value = raw, "unknown acl mode; using default"),
            }
        }
        if let Some(raw) = env_str("AIM_BLOB_ACL_ALLOWLIST") {
            cfg.acl_allowlist =
                raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        }

        cfg.metadata_hardening = env_bool("AIM_METADATA_HARDENING", cfg.metadata_hardening);
        cfg.batch_window_ms =
            env_u64("AIM_BATCH_WINDOW_MS", cfg.batch_window_ms).min(BATCH_WINDOW_MAX_MS);
        cfg.jitter_max_ms =
            env_u64("AIM_JITTER_MAX_MS", cfg.jitter_max_ms).min(JITTER_MAX_CEILING_MS);

        cfg.public_serving_enabled =
            env_bool("AIM_PUBLIC_SERVING_ENABLED", cfg.public_serving_enabled);
        cfg.degrade.memory_bytes =
            env_u64("AIM_PUBLIC_SERVING_MEMORY_BYTES", cfg.degrade.memory_bytes);
        cfg.degrade.pending_len =
            env_u64("AIM_PUBLIC_SERVING_PENDING_LEN", cfg.degrade.pending_len as u64) as usize;
        cfg.degrade.loop_lag_ms = env_u64("AIM_PUBLIC_SERVING_LAG_MS", cfg.degrade.loop_lag_ms);
        cfg.degrade.overload_window_ms =
            env_u64("AIM_PUBLIC_SERVING_OVERLOAD_WINDOW_MS", cfg.degrade.overload_window_ms as u64)
                as i64;
        cfg.degrade.recovery_window_ms =
            env_u64("AIM_PUBLIC_SERVING_RECOVERY_WINDOW_MS", cfg.degrade.recovery_window_ms as u64)
                as i64;
        cfg.degrade.degraded_factor_pct =
            env_u64("AIM_PUBLIC_SERVING_DEGRADED_FACTOR_PCT", cfg.degrade.degraded_factor_pct as u64)
                .min(100) as u32;

        cfg.diagnostics_window_min =
            env_u64("AIM_DIAGNOSTICS_EXPORT_WINDOW_MIN", cfg.diagnostics_window_min as u64) as i64;

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parsers() {
        assert_eq!(ReplicationMode::parse("on_demand"), Some(ReplicationMode::OnDemand));
        assert_eq!(ReplicationMode::parse("pinned_only"), Some(ReplicationMode::PinnedOnly));
        assert_eq!(ReplicationMode::parse("none"), Some(ReplicationMode::None));
        assert_eq!(ReplicationMode::parse("sometimes"), None);

        assert_eq!(AclMode::parse("owner_only"), Some(AclMode::OwnerOnly));
        assert_eq!(AclMode::parse("owner_contacts"), Some(AclMode::OwnerContacts));
        assert_eq!(AclMode::parse("owner_groups_members"), Some(AclMode::OwnerGroupsMembers));
        assert_eq!(AclMode::parse("allowlist"), Some(AclMode::Allowlist));
    }

    #[test]
    fn defaults_are_sane() {
        let cfg = ServiceConfig::default();
        assert!(cfg.batch_window_ms <= BATCH_WINDOW_MAX_MS);
        assert!(cfg.jitter_max_ms <= JITTER_MAX_CEILING_MS);
        assert!(cfg.hard_cap.validate().is_ok());
    }
}

//! ─── AIM protocol constants ─────────────────────────────────────────────────
//!
//! Clamps, defaults and fixed strings shared across the daemon. Tunables that
//! may vary per node live in `aim_service::config`; everything here is part of
//! the protocol itself.

use crate::types::Timestamp;

// ── Identifiers ──────────────────────────────────────────────────────────────

/// Prefix of every identity id.
pub const IDENTITY_ID_PREFIX: &str = "aim1";

/// Prefix of attachment ids (`att1_` + 12 random bytes hex).
pub const ATTACHMENT_ID_PREFIX: &str = "att1_";

/// Prefix of message ids (`msg1_` + 12 random bytes hex).
pub const MESSAGE_ID_PREFIX: &str = "msg1_";

/// Prefix of account-profile ids allocated by create/import identity.
pub const ACCOUNT_ID_PREFIX: &str = "acct_";

/// The always-present profile that maps to the base data directory.
pub const LEGACY_PROFILE_ID: &str = "legacy";

// ── Metadata hardening ───────────────────────────────────────────────────────

/// Discrete wire size buckets in bytes; a serialized non-latency-critical wire
/// is padded up to the smallest bucket that holds it.
pub const PAD_BUCKETS: [usize; 6] = [256, 512, 1024, 2048, 4096, 8192];

pub const BATCH_WINDOW_DEFAULT_MS: u64 = 80;
pub const BATCH_WINDOW_MAX_MS: u64 = 200;

pub const JITTER_MAX_DEFAULT_MS: u64 = 220;
pub const JITTER_MAX_CEILING_MS: u64 = 600;

// ── Retry scheduler ──────────────────────────────────────────────────────────

/// Maximum publish attempts before a pending message becomes terminally failed.
pub const RETRY_MAX_ATTEMPTS: u32 = 8;

/// Exponential backoff: min(base * 2^(n-1), cap), ±10% jitter.
pub const RETRY_BACKOFF_BASE_MS: i64 = 2_000;
pub const RETRY_BACKOFF_CAP_MS: i64 = 120_000;

/// Cadence of the cooperative retry loop.
pub const RETRY_LOOP_TICK_MS: u64 = 1_000;

/// On network start, pending entries due within this window are processed
/// once with a log-only error handler (no retry-count bump).
pub const STARTUP_RETRY_LOOKAHEAD_MS: i64 = 3_600_000;

/// Per-publish transport timeout.
pub const PUBLISH_TIMEOUT_MS: u64 = 10_000;

// ── Inbound ──────────────────────────────────────────────────────────────────

/// Group replay guard window: events outside now ± window are rejected.
pub const REPLAY_WINDOW_MS: i64 = 600_000;

/// Missed messages fetched from the transport on network start.
pub const MISSED_FETCH_WINDOW_MS: i64 = 24 * 3600 * 1000;

/// Upper bound on one missed-message fetch batch.
pub const MISSED_FETCH_MAX: usize = 512;

// ── Enrollment ───────────────────────────────────────────────────────────────

/// Required `issuer` claim of every enrollment token.
pub const ENROLLMENT_ISSUER: &str = "aim-enrollment-authority";

/// Required `scope` claim of every enrollment token.
pub const ENROLLMENT_SCOPE: &str = "aim:node:enroll";

// ── Node binding ─────────────────────────────────────────────────────────────

/// Domain separator of every binding payload.
pub const BIND_CONTEXT: &str = "aim-bind-v1";

/// Entropy of link codes and challenges, bytes (base64url-encoded on the wire).
pub const LINK_CODE_ENTROPY_BYTES: usize = 20;

pub const LINK_CODE_DEFAULT_TTL_SECS: i64 = 90;
pub const LINK_CODE_MAX_TTL_SECS: i64 = 600;

// ── Lifecycle ────────────────────────────────────────────────────────────────

/// Bounded stop-networking during account switch and shutdown.
pub const STOP_NETWORK_TIMEOUT_MS: u64 = 5_000;

// ── Consent tokens (exact match) ─────────────────────────────────────────────

pub const CONSENT_WIPE: &str = "aim-consent-wipe-all";
pub const CONSENT_EXPORT: &str = "aim-consent-export";
pub const CONSENT_RESTORE: &str = "aim-consent-restore";

// ── Storage ──────────────────────────────────────────────────────────────────

/// Magic header of the at-rest encrypted envelope, on its own line.
pub const STORAGE_MAGIC: &[u8] = b"AIMENC1\n";

/// Current attachment index schema version.
pub const ATTACHMENT_SCHEMA_VERSION: u32 = 2;

/// Current snapshot version of message / inbox / group / binding stores.
pub const STORE_SNAPSHOT_VERSION: u32 = 1;

/// Account registry version.
pub const ACCOUNT_REGISTRY_VERSION: u32 = 1;

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Clamp a millisecond duration into `[0, max]`.
pub fn clamp_ms(value: u64, max: u64) -> u64 {
    value.min(max)
}

/// Clamp a link-code TTL into the protocol bounds; zero selects the default.
pub fn clamp_link_ttl_secs(requested: i64) -> i64 {
    if requested <= 0 {
        LINK_CODE_DEFAULT_TTL_SECS
    } else {
        requested.min(LINK_CODE_MAX_TTL_SECS)
    }
}

/// The retry backoff ladder. `n` is the 1-based attempt count.
pub fn backoff_ms(n: u32) -> i64 {
    let n = n.max(1);
    let exp = (n - 1).min(30);
    let raw = RETRY_BACKOFF_BASE_MS.saturating_mul(1i64 << exp);
    raw.min(RETRY_BACKOFF_CAP_MS)
}

/// Whether `ts` falls within `now ± window`.
pub fn within_window(ts: Timestamp, now: Timestamp, window: i64) -> bool {
    ts >= now - window && ts <= now + window
}

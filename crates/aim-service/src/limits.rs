//! Rate limiters: a single token-bucket bandwidth limiter (bytes/sec) and a
//! per-key map-limiter with idle eviction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

// ── Token bucket ─────────────────────────────────────────────────────────────

struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    fn new(rate: f64, burst: f64) -> Self {
        Self { rate, burst, tokens: burst, last: Instant::now() }
    }

    fn allow(&mut self, n: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }
}

// ── Bandwidth limiter ────────────────────────────────────────────────────────

/// Byte-rate limiter: `rate = kbps × 1024` bytes/sec with equal burst.
/// A limit of zero disables the limiter entirely.
pub struct BandwidthLimiter {
    inner: Mutex<Option<TokenBucket>>,
    limit_kbps: AtomicU32,
}

impl BandwidthLimiter {
    pub fn new(limit_kbps: u32) -> Self {
        let limiter = Self { inner: Mutex::new(None), limit_kbps: AtomicU32::new(0) };
        limiter.set_limit_kbps(limit_kbps);
        limiter
    }

    /// Consume `n` bytes now, or reject.
    pub fn allow_bytes(&self, n: usize) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.as_mut() {
            None => true,
            Some(bucket) => bucket.allow(n as f64),
        }
    }

    /// Swap the inner bucket atomically; zero disables.
    pub fn set_limit_kbps(&self, limit_kbps: u32) {
        let mut inner = self.inner.lock().unwrap();
        *inner = if limit_kbps == 0 {
            None
        } else {
            let rate = limit_kbps as f64 * 1024.0;
            Some(TokenBucket::new(rate, rate))
        };
        self.limit_kbps.store(limit_kbps, Ordering::SeqCst);
    }

    pub fn limit_kbps(&self) -> u32 {
        self.limit_kbps.load(Ordering::SeqCst)
    }
}

// ── Map limiter ──────────────────────────────────────────────────────────────

const EVICT_EVERY: u64 = 512;

struct MapEntry {
    bucket: TokenBucket,
    last_seen: Instant,
}

/// Per-key token buckets with idle eviction. Roughly every 512 `allow` calls
/// the map is swept for entries idle past the TTL. Empty keys allow by
/// default.
pub struct MapLimiter {
    rate: f64,
    burst: f64,
    idle_ttl: Duration,
    entries: Mutex<HashMap<String, MapEntry>>,
    op_count: AtomicU64,
}

impl MapLimiter {
    /// `rate` events/sec with `burst` headroom per key.
    pub fn new(rate: f64, burst: f64, idle_ttl: Duration) -> Self {
        Self { rate, burst, idle_ttl, entries: Mutex::new(HashMap::new()), op_count: AtomicU64::new(0) }
    }

    /// Budget one event for `key`.
    pub fn allow(&self, key: &str) -> bool {
        if key.is_empty() {
            return true;
        }
        let ops = self.op_count.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock().unwrap();

        if ops % EVICT_EVERY == EVICT_EVERY - 1 {
            let ttl = self.idle_ttl;
            let now = Instant::now();
            entries.retain(|_, e| now.duration_since(e.last_seen) < ttl);
        }

        let entry = entries.entry(key.to_string()).or_insert_with(|| MapEntry {
            bucket: TokenBucket::new(self.rate, self.burst),
            last_seen: Instant::now(),
        });
        entry.last_seen = Instant::now();
        entry.bucket.allow(1.0)
    }

    pub fn tracked_keys(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bandwidth_limiter_enforces_burst() {
        let lim = BandwidthLimiter::new(1); // 1024 bytes/sec, burst 1024
        assert!(lim.allow_bytes(1024));
        assert!(!lim.allow_bytes(1024), "burst exhausted");
    }

    #[test]
    fn zero_limit_always_allows() {
        let lim = BandwidthLimiter::new(0);
        assert!(lim.allow_bytes(usize::MAX / 2));
        assert_eq!(lim.limit_kbps(), 0);
    }

    #[test]
    fn reconfigure_swaps_bucket() {
        let lim = BandwidthLimiter::new(1);
        assert!(lim.allow_bytes(1024));
        assert!(!lim.allow_bytes(1024));

        lim.set_limit_kbps(64);
        assert_eq!(lim.limit_kbps(), 64);
        assert!(lim.allow_bytes(32 * 1024), "fresh bucket after reconfigure");

        lim.set_limit_kbps(0);
        assert!(lim.allow_bytes(usize::MAX / 2));
    }

    #[test]
    fn map_limiter_is_per_key() {
        let lim = MapLimiter::new(1.0, 2.0, Duration::from_secs(60));
        assert!(lim.allow("peer-a"));
        assert!(lim.allow("peer-a"));
        assert!(!lim.allow("peer-a"), "per-key burst of 2 exhausted");
        assert!(lim.allow("peer-b"), "other keys unaffected");
    }

    #[test]
    fn empty_key_allows_by_default() {
        let lim = MapLimiter::new(0.0, 0.0, Duration::from_secs(1));
        assert!(lim.allow(""));
    }

    #[test]
    fn idle_entries_are_swept() {
        let lim = MapLimiter::new(100.0, 100.0, Duration::from_millis(0));
        lim.allow("peer-a");
        assert_eq!(lim.tracked_keys(), 1);
        // Force a sweep pass: entries with zero TTL are all idle.
        for _ in 0..EVICT_EVERY {
            lim.allow("peer-b");
        }
        assert!(lim.tracked_keys() <= 2);
    }
}

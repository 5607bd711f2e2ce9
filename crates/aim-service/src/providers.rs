//! Blob provider registry: which peers claim to hold which blobs, with
//! expiring announcements and the announce/fetch rate budgets.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use aim_core::interfaces::BlobFetchFn;
use aim_core::types::Timestamp;
use aim_core::AimError;

use crate::limits::MapLimiter;

/// One provider advertisement for a blob.
#[derive(Clone)]
pub struct ProviderEntry {
    pub peer_id: String,
    pub expires_at: Timestamp,
    pub fetch: BlobFetchFn,
}

pub struct ProviderRegistry {
    by_blob: Mutex<HashMap<String, HashMap<String, ProviderEntry>>>,
    announce_limiter: MapLimiter,
    fetch_limiter: MapLimiter,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            // Announce budget: 2/sec sustained, burst 20 per peer.
            announce_limiter: MapLimiter::new(2.0, 20.0, Duration::from_secs(600)),
            // Fetch budget per requester→provider pair: 1/sec, burst 10.
            fetch_limiter: MapLimiter::new(1.0, 10.0, Duration::from_secs(600)),
            by_blob: Mutex::new(HashMap::new()),
        }
    }

    /// Upsert a provider advertisement valid for `ttl_ms`.
    pub fn announce(
        &self,
        blob_id: &str,
        peer_id: &str,
        ttl_ms: i64,
        fetch: BlobFetchFn,
        now: Timestamp,
    ) -> Result<(), AimError> {
        if blob_id.is_empty() || peer_id.is_empty() {
            return Err(AimError::InvalidArgument("announce requires blob and peer ids".into()));
        }
        if ttl_ms <= 0 {
            return Err(AimError::InvalidArgument("announce ttl must be positive".into()));
        }
        if !self.announce_limiter.allow(peer_id) {
            return Err(AimError::InvalidArgument(format!(
                "announce budget exceeded for {peer_id}"
            )));
        }
        let mut by_blob = self.by_blob.lock().unwrap();
        by_blob.entry(blob_id.to_string()).or_default().insert(
            peer_id.to_string(),
            ProviderEntry { peer_id: peer_id.to_string(), expires_at: now + ttl_ms, fetch },
        );
        Ok(())
    }

    /// Live candidates for `blob_id`, pruning expired entries. Sorted by
    /// latest expiry, ties broken by peer id, so failover order is
    /// deterministic.
    pub fn list_providers(&self, blob_id: &str, now: Timestamp) -> Vec<ProviderEntry> {
        let mut by_blob = self.by_blob.lock().unwrap();
        let Some(peers) = by_blob.get_mut(blob_id) else { return Vec::new() };
        peers.retain(|_, e| e.expires_at > now);
        if peers.is_empty() {
            by_blob.remove(blob_id);
            return Vec::new();
        }
        let mut out: Vec<ProviderEntry> = peers.values().cloned().collect();
        out.sort_by(|a, b| {
            b.expires_at.cmp(&a.expires_at).then_with(|| a.peer_id.cmp(&b.peer_id))
        });
        out
    }

    /// Budget one fetch for the `requester → provider` pair.
    pub fn allow_fetch(&self, requester: &str, provider: &str) -> bool {
        self.fetch_limiter.allow(&format!("{requester}\u{2192}{provider}"))
    }

    /// Drop every advertisement from `peer_id`.
    pub fn remove_peer(&self, peer_id: &str) {
        let mut by_blob = self.by_blob.lock().unwrap();
        by_blob.retain(|_, peers| {
            peers.remove(peer_id);
            !peers.is_empty()
        });
    }

    /// Drop one `(blob, peer)` advertisement.
    pub fn remove_blob_peer(&self, blob_id: &str, peer_id: &str) {
        let mut by_blob = self.by_blob.lock().unwrap();
        if let Some(peers) = by_blob.get_mut(blob_id) {
            peers.remove(peer_id);
            if peers.is_empty() {
                by_blob.remove(blob_id);
            }
        }
    }

    pub fn blob_count(&self) -> usize {
        self.by_blob.lock().unwrap().len()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aim_core::interfaces::FetchedBlob;
    use std::sync::Arc;

    fn noop_fetch() -> BlobFetchFn {
        Arc::new(|| {
            Box::pin(async {
                Ok(FetchedBlob { name: "x".into(), mime_type: "text/plain".into(), data: vec![] })
            })
        })
    }

    #[test]
    fn announce_validates_arguments() {
        let reg = ProviderRegistry::new();
        assert!(reg.announce("", "aim1p", 1_000, noop_fetch(), 0).is_err());
        assert!(reg.announce("blob", "", 1_000, noop_fetch(), 0).is_err());
        assert!(reg.announce("blob", "aim1p", 0, noop_fetch(), 0).is_err());
        assert!(reg.announce("blob", "aim1p", 1_000, noop_fetch(), 0).is_ok());
    }

    #[test]
    fn candidates_sorted_by_expiry_then_peer() {
        let reg = ProviderRegistry::new();
        reg.announce("blob", "aim1zed", 1_000, noop_fetch(), 0).unwrap();
        reg.announce("blob", "aim1abe", 1_000, noop_fetch(), 0).unwrap();
        reg.announce("blob", "aim1mid", 5_000, noop_fetch(), 0).unwrap();

        let order: Vec<String> =
            reg.list_providers("blob", 0).into_iter().map(|e| e.peer_id).collect();
        assert_eq!(order, vec!["aim1mid", "aim1abe", "aim1zed"]);
    }

    #[test]
    fn expired_entries_are_pruned_and_empty_blob_removed() {
        let reg = ProviderRegistry::new();
        reg.announce("blob", "aim1p", 100, noop_fetch(), 0).unwrap();
        assert_eq!(reg.list_providers("blob", 50).len(), 1);
        assert!(reg.list_providers("blob", 200).is_empty());
        assert_eq!(reg.blob_count(), 0);
    }

    #[test]
    fn remove_operations() {
        let reg = ProviderRegistry::new();
        reg.announce("b1", "aim1p", 1_000, noop_fetch(), 0).unwrap();
        reg.announce("b2", "aim1p", 1_000, noop_fetch(), 0).unwrap();
        reg.announce("b2", "aim1q", 1_000, noop_fetch(), 0).unwrap();

        reg.remove_blob_peer("b2", "aim1q");
        assert_eq!(reg.list_providers("b2", 0).len(), 1);

        reg.remove_peer("aim1p");
        assert_eq!(reg.blob_count(), 0);
    }

    #[test]
    fn announce_budget_is_per_peer() {
        let reg = ProviderRegistry::new();
        let mut rejected = false;
        for i in 0..64 {
            if reg.announce(&format!("b{i}"), "aim1spammer", 1_000, noop_fetch(), 0).is_err() {
                rejected = true;
                break;
            }
        }
        assert!(rejected, "sustained announces must trip the budget");
        assert!(reg.announce("b-other", "aim1quiet", 1_000, noop_fetch(), 0).is_ok());
    }
}

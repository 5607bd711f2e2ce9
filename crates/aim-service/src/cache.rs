//! Ephemeral public cache: a size- and TTL-bounded in-memory LRU for fetched
//! public blobs. Used to short-circuit immediate re-fetches on nodes that do
//! not durably store public blobs.

use std::collections::HashMap;
use std::sync::Mutex;

use aim_core::interfaces::FetchedBlob;
use aim_core::types::Timestamp;

struct CacheEntry {
    blob: FetchedBlob,
    expires_at: Timestamp,
    last_access: Timestamp,
}

pub struct EphemeralCache {
    max_bytes: u64,
    ttl_ms: i64,
    mu: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    total_bytes: u64,
}

impl EphemeralCache {
    pub fn new(max_bytes: u64, ttl_ms: i64) -> Self {
        Self { max_bytes, ttl_ms, mu: Mutex::new(CacheState::default()) }
    }

    /// Insert a blob. Entries larger than the cache itself are rejected;
    /// overflow evicts by least-recent access. Returns whether the blob was
    /// cached.
    pub fn put(&self, id: &str, blob: FetchedBlob, now: Timestamp) -> bool {
        let size = blob.data.len() as u64;
        if size > self.max_bytes {
            return false;
        }
        let mut state = self.mu.lock().unwrap();

        if let Some(old) = state.entries.remove(id) {
            state.total_bytes -= old.blob.data.len() as u64;
        }

        while state.total_bytes + size > self.max_bytes {
            let victim = state
                .entries
                .iter()
                .min_by_key(|(vid, e)| (e.last_access, (*vid).clone()))
                .map(|(vid, _)| vid.clone());
            match victim {
                Some(vid) => {
                    if let Some(e) = state.entries.remove(&vid) {
                        state.total_bytes -= e.blob.data.len() as u64;
                    }
                }
                None => break,
            }
        }

        state.entries.insert(
            id.to_string(),
            CacheEntry { blob, expires_at: now + self.ttl_ms, last_access: now },
        );
        state.total_bytes += size;
        true
    }

    /// Look up a blob, refreshing its expiry and access time on hit.
    pub fn get(&self, id: &str, now: Timestamp) -> Option<FetchedBlob> {
        let mut state = self.mu.lock().unwrap();
        let expired = match state.entries.get(id) {
            None => return None,
            Some(e) => e.expires_at <= now,
        };
        if expired {
            if let Some(e) = state.entries.remove(id) {
                state.total_bytes -= e.blob.data.len() as u64;
            }
            return None;
        }
        let entry = state.entries.get_mut(id).expect("checked above");
        entry.expires_at = now + self.ttl_ms;
        entry.last_access = now;
        Some(entry.blob.clone())
    }

    /// Drop entries whose expiry has passed.
    pub fn purge_expired(&self, now: Timestamp) -> usize {
        let mut state = self.mu.lock().unwrap();
        let doomed: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &doomed {
            if let Some(e) = state.entries.remove(id) {
                state.total_bytes -= e.blob.data.len() as u64;
            }
        }
        doomed.len()
    }

    pub fn usage_bytes(&self) -> u64 {
        self.mu.lock().unwrap().total_bytes
    }

    pub fn len(&self) -> usize {
        self.mu.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.mu.lock().unwrap();
        state.entries.clear();
        state.total_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(data: &[u8]) -> FetchedBlob {
        FetchedBlob { name: "f".into(), mime_type: "application/octet-stream".into(), data: data.to_vec() }
    }

    #[test]
    fn oversized_entries_are_rejected() {
        let cache = EphemeralCache::new(4, 1_000);
        assert!(!cache.put("big", blob(b"12345"), 0));
        assert!(cache.put("ok", blob(b"1234"), 0));
    }

    #[test]
    fn overflow_evicts_least_recently_accessed() {
        let cache = EphemeralCache::new(8, 1_000);
        cache.put("a", blob(b"aaaa"), 0);
        cache.put("b", blob(b"bbbb"), 1);
        cache.get("a", 2); // touch `a`, making `b` the LRU victim

        cache.put("c", blob(b"cccc"), 3);
        assert!(cache.get("a", 4).is_some());
        assert!(cache.get("b", 4).is_none());
        assert!(cache.get("c", 4).is_some());
    }

    #[test]
    fn get_refreshes_ttl() {
        let cache = EphemeralCache::new(64, 100);
        cache.put("a", blob(b"x"), 0); // expires at 100
        assert!(cache.get("a", 90).is_some()); // now expires at 190
        assert!(cache.get("a", 150).is_some(), "touch extended the ttl");
        assert!(cache.get("a", 1_000).is_none(), "expired entries miss");
    }

    #[test]
    fn purge_expired_accounts_bytes() {
        let cache = EphemeralCache::new(64, 10);
        cache.put("a", blob(b"aaaa"), 0);
        cache.put("b", blob(b"bb"), 100);
        assert_eq!(cache.purge_expired(50), 1);
        assert_eq!(cache.usage_bytes(), 2);
        assert_eq!(cache.len(), 1);
    }
}

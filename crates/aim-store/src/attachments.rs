use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use aim_core::attachment::{
    AttachmentClass, AttachmentClassLimits, AttachmentMeta, AttachmentTtls, HardCapPolicy,
    PinState,
};
use aim_core::constants::{ATTACHMENT_ID_PREFIX, ATTACHMENT_SCHEMA_VERSION};
use aim_core::types::Timestamp;
use aim_core::AimError;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::envelope::EnvelopeCodec;

// ── Index file ───────────────────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
struct IndexFile {
    schema_version: u32,
    items: BTreeMap<String, AttachmentMeta>,
}

// ── Store ────────────────────────────────────────────────────────────────────

/// Attachment store: a JSON index plus one opaque blob file per item at
/// `blobs/{id}.bin`, both written through the at-rest envelope. Write
/// admission enforces per-class item/quota limits and the hard-cap policy;
/// a single-writer GC applies the TTL and LRU passes.
pub struct AttachmentStore {
    dir: PathBuf,
    codec: EnvelopeCodec,
    mu: Mutex<Inner>,
}

struct Inner {
    items: BTreeMap<String, AttachmentMeta>,
    limits: AttachmentClassLimits,
    hard_cap: HardCapPolicy,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AttachmentUsage {
    pub image_bytes: u64,
    pub image_count: usize,
    pub file_bytes: u64,
    pub file_count: usize,
}

impl AttachmentStore {
    pub fn open(
        dir: PathBuf,
        codec: EnvelopeCodec,
        limits: AttachmentClassLimits,
        hard_cap: HardCapPolicy,
    ) -> Result<Self, AimError> {
        hard_cap.validate()?;
        EnvelopeCodec::ensure_dir(&dir)?;

        let index_path = dir.join("index.json");
        let items = match codec.read_file(&index_path)? {
            None => BTreeMap::new(),
            Some(bytes) => {
                let mut index: IndexFile = serde_json::from_slice(&bytes)
                    .map_err(|e| AimError::Storage(format!("attachment index: {e}")))?;
                if index.schema_version > ATTACHMENT_SCHEMA_VERSION {
                    return Err(AimError::UnsupportedStorageSchema {
                        got: index.schema_version,
                        max: ATTACHMENT_SCHEMA_VERSION,
                    });
                }
                if index.schema_version < ATTACHMENT_SCHEMA_VERSION {
                    // Older index: class and pin_state may predate their
                    // introduction; recompute the class from the MIME type
                    // and rewrite at the current version.
                    for meta in index.items.values_mut() {
                        meta.class = AttachmentClass::from_mime(&meta.mime_type);
                    }
                    index.schema_version = ATTACHMENT_SCHEMA_VERSION;
                    let bytes = serde_json::to_vec(&index)
                        .map_err(|e| AimError::Storage(e.to_string()))?;
                    codec.write_file(&index_path, &bytes)?;
                    debug!("upgraded attachment index to schema {}", ATTACHMENT_SCHEMA_VERSION);
                }
                index.items
            }
        };

        Ok(Self { dir, codec, mu: Mutex::new(Inner { items, limits, hard_cap }) })
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join("index.json")
    }

    fn blob_path(&self, id: &str) -> PathBuf {
        self.dir.join("blobs").join(format!("{id}.bin"))
    }

    fn persist_items(&self, items: &BTreeMap<String, AttachmentMeta>) -> Result<(), AimError> {
        let index =
            IndexFile { schema_version: ATTACHMENT_SCHEMA_VERSION, items: items.clone() };
        let bytes = serde_json::to_vec(&index).map_err(|e| AimError::Storage(e.to_string()))?;
        self.codec.write_file(&self.index_path(), &bytes)
    }

    fn usage_of(items: &BTreeMap<String, AttachmentMeta>, class: AttachmentClass) -> u64 {
        items.values().filter(|m| m.class == class).map(|m| m.size).sum()
    }

    fn new_id() -> String {
        let mut raw = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut raw);
        format!("{ATTACHMENT_ID_PREFIX}{}", hex::encode(raw))
    }

    /// Least-recently-accessed non-pinned entries of `class`, evicted from
    /// `items` until its usage drops to `target` bytes. Best effort: stops
    /// when only pinned entries remain.
    fn evict_lru(
        items: &mut BTreeMap<String, AttachmentMeta>,
        class: AttachmentClass,
        target: u64,
    ) -> Vec<String> {
        let mut evicted = Vec::new();
        loop {
            if Self::usage_of(items, class) <= target {
                break;
            }
            let victim = items
                .values()
                .filter(|m| m.class == class && !m.pinned())
                .min_by_key(|m| (m.last_access_at, m.id.clone()))
                .map(|m| m.id.clone());
            match victim {
                Some(id) => {
                    items.remove(&id);
                    evicted.push(id);
                }
                None => break,
            }
        }
        evicted
    }

    fn remove_blob_files(&self, ids: &[String]) {
        for id in ids {
            if let Err(e) = std::fs::remove_file(self.blob_path(id)) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(blob = %id, error = %e, "failed to remove evicted blob file");
                }
            }
        }
    }

    // ── Put / Get ────────────────────────────────────────────────────────────

    pub fn put(
        &self,
        name: &str,
        mime_type: &str,
        data: &[u8],
        now: Timestamp,
    ) -> Result<AttachmentMeta, AimError> {
        self.put_with_id(&Self::new_id(), name, mime_type, data, now)
    }

    /// Store a blob under a caller-supplied id (used when replicating a
    /// remotely fetched blob). A byte-equal existing entry is a no-op.
    pub fn put_with_id(
        &self,
        id: &str,
        name: &str,
        mime_type: &str,
        data: &[u8],
        now: Timestamp,
    ) -> Result<AttachmentMeta, AimError> {
        let class = AttachmentClass::from_mime(mime_type);
        let size = data.len() as u64;

        let mut inner = self.mu.lock().unwrap();
        if let Some(existing) = inner.items.get(id) {
            return Ok(existing.clone());
        }

        let lim = inner.limits.for_class(class);
        if lim.max_item_bytes > 0 && size > lim.max_item_bytes {
            return Err(AimError::AttachmentItemTooLarge {
                class: class.as_str().into(),
                size,
                max: lim.max_item_bytes,
            });
        }

        let mut scratch = inner.items.clone();
        let mut evicted = Vec::new();
        if lim.quota_bytes > 0 {
            let usage = Self::usage_of(&scratch, class);
            if usage.saturating_add(size) > lim.quota_bytes {
                let target = lim.quota_bytes.saturating_sub(size);
                evicted = Self::evict_lru(&mut scratch, class, target);
            }
            // Admission check runs after the eviction attempt: what remains
            // is pinned or still warm, and the write must fit under the cap.
            let full_cap = HardCapPolicy::fraction_of(lim.quota_bytes, inner.hard_cap.full_cap);
            if Self::usage_of(&scratch, class).saturating_add(size) > full_cap {
                return Err(AimError::AttachmentHardCapReached { class: class.as_str().into() });
            }
        }

        let meta = AttachmentMeta {
            id: id.to_string(),
            name: name.to_string(),
            mime_type: mime_type.to_string(),
            class,
            size,
            created_at: now,
            last_access_at: now,
            pin_state: PinState::Unpinned,
        };

        let blob_path = self.blob_path(id);
        self.codec.write_file(&blob_path, data)?;

        scratch.insert(id.to_string(), meta.clone());
        if let Err(e) = self.persist_items(&scratch) {
            let _ = std::fs::remove_file(&blob_path);
            return Err(e);
        }

        self.remove_blob_files(&evicted);
        inner.items = scratch;
        Ok(meta)
    }

    pub fn get(&self, id: &str, now: Timestamp) -> Result<(AttachmentMeta, Vec<u8>), AimError> {
        let mut inner = self.mu.lock().unwrap();
        if !inner.items.contains_key(id) {
            return Err(AimError::AttachmentNotFound(id.to_string()));
        }

        let data = self
            .codec
            .read_file(&self.blob_path(id))?
            .ok_or_else(|| AimError::AttachmentNotFound(id.to_string()))?;

        let mut scratch = inner.items.clone();
        scratch.get_mut(id).expect("checked above").last_access_at = now;
        match self.persist_items(&scratch) {
            Ok(()) => inner.items = scratch,
            // The read still succeeds; only the access-time touch is lost.
            Err(e) => warn!(blob = %id, error = %e, "failed to persist access time"),
        }
        let meta = inner.items.get(id).expect("checked above").clone();
        Ok((meta, data))
    }

    pub fn get_meta(&self, id: &str) -> Option<AttachmentMeta> {
        self.mu.lock().unwrap().items.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.mu.lock().unwrap().items.contains_key(id)
    }

    pub fn delete(&self, id: &str) -> Result<(), AimError> {
        let mut inner = self.mu.lock().unwrap();
        if !inner.items.contains_key(id) {
            return Ok(());
        }
        let mut scratch = inner.items.clone();
        scratch.remove(id);
        self.persist_items(&scratch)?;
        self.remove_blob_files(std::slice::from_ref(&id.to_string()));
        inner.items = scratch;
        Ok(())
    }

    // ── Pinning ──────────────────────────────────────────────────────────────

    pub fn set_pin(&self, id: &str, pin: PinState) -> Result<AttachmentMeta, AimError> {
        let mut inner = self.mu.lock().unwrap();
        if !inner.items.contains_key(id) {
            return Err(AimError::AttachmentNotFound(id.to_string()));
        }
        let mut scratch = inner.items.clone();
        scratch.get_mut(id).expect("checked above").pin_state = pin;
        self.persist_items(&scratch)?;
        inner.items = scratch;
        Ok(inner.items.get(id).expect("checked above").clone())
    }

    /// Ids of all pinned blobs (used by `pinned_only` replication).
    pub fn pinned_ids(&self) -> Vec<String> {
        self.mu
            .lock()
            .unwrap()
            .items
            .values()
            .filter(|m| m.pinned())
            .map(|m| m.id.clone())
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.mu.lock().unwrap().items.keys().cloned().collect()
    }

    pub fn list(&self) -> Vec<AttachmentMeta> {
        self.mu.lock().unwrap().items.values().cloned().collect()
    }

    // ── GC ───────────────────────────────────────────────────────────────────

    /// Two-pass GC: (1) evict non-pinned entries past their class TTL;
    /// (2) while class usage exceeds `high_watermark × quota`, evict by LRU
    /// down to `aggressive_target × quota`. Returns the evicted ids.
    pub fn gc(&self, now: Timestamp, ttls: AttachmentTtls) -> Result<Vec<String>, AimError> {
        self.gc_inner(now, ttls, false)
    }

    /// Report what `gc` would evict without mutating any state.
    pub fn gc_dry_run(&self, now: Timestamp, ttls: AttachmentTtls) -> Vec<String> {
        self.gc_inner(now, ttls, true).expect("dry run cannot fail")
    }

    fn gc_inner(
        &self,
        now: Timestamp,
        ttls: AttachmentTtls,
        dry_run: bool,
    ) -> Result<Vec<String>, AimError> {
        let mut inner = self.mu.lock().unwrap();
        let mut scratch = inner.items.clone();
        let mut evicted = Vec::new();

        // Pass 1: TTL.
        for class in [AttachmentClass::Image, AttachmentClass::File] {
            let ttl = ttls.for_class(class);
            if ttl <= 0 {
                continue;
            }
            let expired: Vec<String> = scratch
                .values()
                .filter(|m| m.class == class && !m.pinned() && m.created_at + ttl <= now)
                .map(|m| m.id.clone())
                .collect();
            for id in expired {
                scratch.remove(&id);
                evicted.push(id);
            }
        }

        // Pass 2: LRU down to the aggressive target.
        for class in [AttachmentClass::Image, AttachmentClass::File] {
            let lim = inner.limits.for_class(class);
            if lim.quota_bytes == 0 {
                continue;
            }
            let high =
                HardCapPolicy::fraction_of(lim.quota_bytes, inner.hard_cap.high_watermark);
            if Self::usage_of(&scratch, class) > high {
                let target = HardCapPolicy::fraction_of(
                    lim.quota_bytes,
                    inner.hard_cap.aggressive_target,
                );
                evicted.extend(Self::evict_lru(&mut scratch, class, target));
            }
        }

        if dry_run || evicted.is_empty() {
            return Ok(evicted);
        }

        self.persist_items(&scratch)?;
        self.remove_blob_files(&evicted);
        inner.items = scratch;
        debug!(evicted = evicted.len(), "attachment gc complete");
        Ok(evicted)
    }

    // ── Policy & reporting ───────────────────────────────────────────────────

    pub fn set_limits(&self, limits: AttachmentClassLimits) {
        self.mu.lock().unwrap().limits = limits;
    }

    pub fn set_hard_cap(&self, policy: HardCapPolicy) -> Result<(), AimError> {
        policy.validate()?;
        self.mu.lock().unwrap().hard_cap = policy;
        Ok(())
    }

    pub fn usage(&self) -> AttachmentUsage {
        let inner = self.mu.lock().unwrap();
        let mut usage = AttachmentUsage::default();
        for m in inner.items.values() {
            match m.class {
                AttachmentClass::Image => {
                    usage.image_bytes += m.size;
                    usage.image_count += 1;
                }
                AttachmentClass::File => {
                    usage.file_bytes += m.size;
                    usage.file_count += 1;
                }
            }
        }
        usage
    }

    pub fn wipe(&self) -> Result<(), AimError> {
        let mut inner = self.mu.lock().unwrap();
        let ids: Vec<String> = inner.items.keys().cloned().collect();
        self.persist_items(&BTreeMap::new())?;
        self.remove_blob_files(&ids);
        inner.items.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aim_core::attachment::ClassLimits;

    fn open_store(dir: &std::path::Path, quota: u64) -> AttachmentStore {
        let limits = AttachmentClassLimits {
            image: ClassLimits { max_item_bytes: 0, quota_bytes: quota },
            file: ClassLimits { max_item_bytes: 0, quota_bytes: quota },
        };
        AttachmentStore::open(
            dir.to_path_buf(),
            EnvelopeCodec::from_passphrase(Some("pw")),
            limits,
            HardCapPolicy::default(),
        )
        .unwrap()
    }

    #[test]
    fn put_get_round_trip_encrypted() {
        let dir = tempfile::tempdir().unwrap();
        let st = open_store(dir.path(), 0);
        let meta = st.put("photo.png", "image/png", b"pixels", 100).unwrap();
        assert!(meta.id.starts_with("att1_"));
        assert_eq!(meta.class, AttachmentClass::Image);

        let (got, data) = st.get(&meta.id, 200).unwrap();
        assert_eq!(data, b"pixels");
        assert_eq!(got.last_access_at, 200);

        // The blob on disk must not contain the plaintext.
        let raw = std::fs::read(dir.path().join("blobs").join(format!("{}.bin", meta.id))).unwrap();
        assert!(raw.starts_with(b"AIMENC1\n"));
        assert!(!raw.windows(6).any(|w| w == b"pixels"));
    }

    #[test]
    fn put_get_round_trip_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let st = AttachmentStore::open(
            dir.path().to_path_buf(),
            EnvelopeCodec::plaintext(),
            AttachmentClassLimits::default(),
            HardCapPolicy::default(),
        )
        .unwrap();
        let meta = st.put("doc.txt", "text/plain", b"contents", 1).unwrap();
        let (_, data) = st.get(&meta.id, 2).unwrap();
        assert_eq!(data, b"contents");
    }

    #[test]
    fn item_limit_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let limits = AttachmentClassLimits {
            image: ClassLimits::default(),
            file: ClassLimits { max_item_bytes: 4, quota_bytes: 0 },
        };
        let st = AttachmentStore::open(
            dir.path().to_path_buf(),
            EnvelopeCodec::plaintext(),
            limits,
            HardCapPolicy::default(),
        )
        .unwrap();
        assert!(matches!(
            st.put("big.bin", "application/octet-stream", b"12345", 1),
            Err(AimError::AttachmentItemTooLarge { .. })
        ));
    }

    #[test]
    fn hard_cap_rejects_and_write_evicts_lru() {
        let dir = tempfile::tempdir().unwrap();
        // quota 10, full_cap 100% → hard cap 10 bytes.
        let st = open_store(dir.path(), 10);

        let a = st.put("a", "text/plain", b"aaaa", 1).unwrap(); // 4 bytes, oldest access
        let b = st.put("b", "text/plain", b"bbbb", 2).unwrap(); // 4 bytes

        // 12 > full cap → rejected outright.
        assert!(matches!(
            st.put("huge", "text/plain", b"xxxxxxxxxxxx", 3),
            Err(AimError::AttachmentHardCapReached { .. })
        ));

        // 4+4+4 > quota 10 → LRU-evict `a` down to quota − size.
        let c = st.put("c", "text/plain", b"cccc", 4).unwrap();
        assert!(!st.contains(&a.id));
        assert!(st.contains(&b.id));
        assert!(st.contains(&c.id));
    }

    #[test]
    fn write_eviction_skips_pinned() {
        let dir = tempfile::tempdir().unwrap();
        let st = open_store(dir.path(), 10);
        let a = st.put("a", "text/plain", b"aaaa", 1).unwrap();
        st.set_pin(&a.id, PinState::Pinned).unwrap();
        let b = st.put("b", "text/plain", b"bbbb", 2).unwrap();

        let c = st.put("c", "text/plain", b"cccc", 3).unwrap();
        assert!(st.contains(&a.id), "pinned entries are never evicted");
        assert!(!st.contains(&b.id));
        assert!(st.contains(&c.id));
    }

    #[test]
    fn gc_ttl_and_lru_passes() {
        let dir = tempfile::tempdir().unwrap();
        let limits = AttachmentClassLimits {
            image: ClassLimits::default(),
            file: ClassLimits { max_item_bytes: 0, quota_bytes: 100 },
        };
        let policy =
            HardCapPolicy { high_watermark: 50, full_cap: 100, aggressive_target: 30 };
        let st = AttachmentStore::open(
            dir.path().to_path_buf(),
            EnvelopeCodec::plaintext(),
            limits,
            policy,
        )
        .unwrap();

        let old = st.put("old", "text/plain", &[0u8; 10], 0).unwrap();
        let pinned = st.put("pin", "text/plain", &[0u8; 30], 1).unwrap();
        st.set_pin(&pinned.id, PinState::Pinned).unwrap();
        let fresh = st.put("fresh", "text/plain", &[0u8; 30], 1_000).unwrap();

        let ttls = AttachmentTtls { image_ms: 0, file_ms: 500 };

        // Dry run must not mutate.
        let planned = st.gc_dry_run(1_000, ttls);
        assert!(planned.contains(&old.id));
        assert!(st.contains(&old.id));

        // TTL pass evicts `old` (created 0 + 500 <= 1000). Usage is then
        // 60 > high watermark 50 → LRU pass evicts `fresh` (only non-pinned
        // left), stopping at the pinned remainder.
        let evicted = st.gc(1_000, ttls).unwrap();
        assert!(evicted.contains(&old.id));
        assert!(evicted.contains(&fresh.id));
        assert!(st.contains(&pinned.id), "pinned survives every gc");
    }

    #[test]
    fn newer_schema_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let index = serde_json::json!({ "schema_version": 99, "items": {} });
        EnvelopeCodec::plaintext()
            .write_file(&dir.path().join("index.json"), index.to_string().as_bytes())
            .unwrap();

        let result = AttachmentStore::open(
            dir.path().to_path_buf(),
            EnvelopeCodec::plaintext(),
            AttachmentClassLimits::default(),
            HardCapPolicy::default(),
        );
        assert!(matches!(result, Err(AimError::UnsupportedStorageSchema { got: 99, .. })));
    }

    #[test]
    fn older_schema_is_upgraded_with_backfill() {
        let dir = tempfile::tempdir().unwrap();
        // Version-1 index: no class, no pin_state.
        let index = serde_json::json!({
            "schema_version": 1,
            "items": {
                "att1_00": {
                    "id": "att1_00",
                    "name": "p.png",
                    "mime_type": "image/png",
                    "size": 3,
                    "created_at": 1,
                    "last_access_at": 1
                }
            }
        });
        EnvelopeCodec::plaintext()
            .write_file(&dir.path().join("index.json"), index.to_string().as_bytes())
            .unwrap();

        let st = AttachmentStore::open(
            dir.path().to_path_buf(),
            EnvelopeCodec::plaintext(),
            AttachmentClassLimits::default(),
            HardCapPolicy::default(),
        )
        .unwrap();
        let meta = st.get_meta("att1_00").unwrap();
        assert_eq!(meta.class, AttachmentClass::Image, "class backfilled from mime");
        assert_eq!(meta.pin_state, PinState::Unpinned, "pin state backfilled");
    }
}

//! Blob distribution: put/get with provider failover, ACL enforcement,
//! caching, serving-side guards, and replication announcements.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aim_core::attachment::{AttachmentMeta, PinState};
use aim_core::error::UnavailableReason;
use aim_core::interfaces::{BlobAnnounce, BlobFetchFn, BlobServeFn, FetchedBlob, IdentityManager, Transport};
use aim_core::types::now_ms;
use aim_core::{AimError, CancelToken};
use tracing::{debug, warn};

use crate::acl::{allows_peer, BlobAcl, BlobOperation, ReplicationState, ServeGuard};
use crate::cache::EphemeralCache;
use crate::degrade::DegradeState;
use crate::limits::BandwidthLimiter;
use crate::metrics::Metrics;
use crate::providers::ProviderRegistry;
use crate::stores::StoresHandle;

/// Provider announcements made by this node are valid this long.
pub const ANNOUNCE_TTL_MS: i64 = 30 * 60 * 1000;

/// Remote fetch attempts before giving up.
const MAX_FETCH_ATTEMPTS: u32 = 3;

pub struct BlobSubsystem {
    pub stores: StoresHandle,
    pub cache: Arc<EphemeralCache>,
    pub providers: Arc<ProviderRegistry>,
    pub acl: Arc<BlobAcl>,
    pub replication: Arc<ReplicationState>,
    pub fetch_bw: Arc<BandwidthLimiter>,
    pub serve_soft: Arc<BandwidthLimiter>,
    pub serve_hard: Arc<BandwidthLimiter>,
    pub serve_guard: Arc<ServeGuard>,
    pub degrade: Arc<DegradeState>,
    pub transport: Arc<dyn Transport>,
    pub identity: Arc<dyn IdentityManager>,
    pub metrics: Arc<Metrics>,
    pub rollout_pct: u8,
    pub net_active: Arc<AtomicBool>,
}

impl BlobSubsystem {
    fn own_id(&self) -> String {
        self.identity.identity()
    }

    // ── Serving side ─────────────────────────────────────────────────────────

    /// The serving hook handed to the transport: runs on this node when a
    /// peer fetches from us.
    pub fn serve_fn(self: &Arc<Self>) -> BlobServeFn {
        let this = Arc::clone(self);
        Arc::new(move |requester, blob_id| this.serve_local(requester, blob_id))
    }

    /// Guarded local read for a remote `requester`.
    pub fn serve_local(&self, requester: &str, blob_id: &str) -> Result<FetchedBlob, AimError> {
        // 1. ACL re-check at serve time.
        self.acl.authorize(requester, BlobOperation::Fetch)?;

        // 2. Serving must be switched on.
        if !self.replication.public_serving_enabled() {
            return Err(AimError::AttachmentTemporarilyUnavailable {
                reason: UnavailableReason::ProvidersFailed,
            });
        }

        // 3. Per-peer QPS budget and a concurrency slot.
        let _slot = self.serve_guard.try_acquire(requester)?;

        // 4. Local read, ephemeral cache included.
        let now = now_ms();
        let blob = match self.read_local(blob_id, now) {
            Some(b) => b,
            None => return Err(AimError::AttachmentNotFound(blob_id.to_string())),
        };

        // 5. Bandwidth accounting: the soft limiter only flags pressure, the
        //    hard limiter actually refuses.
        let n = blob.data.len();
        if !self.serve_soft.allow_bytes(n) {
            self.degrade.flag_soft_cap();
        }
        if !self.serve_hard.allow_bytes(n) {
            return Err(AimError::AttachmentTemporarilyUnavailable {
                reason: UnavailableReason::RateLimited,
            });
        }

        self.metrics.blob_fetches_served.fetch_add(1, Ordering::Relaxed);
        Ok(blob)
    }

    fn read_local(&self, blob_id: &str, now: i64) -> Option<FetchedBlob> {
        let stores = self.stores.current();
        if let Ok((meta, data)) = stores.attachments.get(blob_id, now) {
            return Some(FetchedBlob { name: meta.name, mime_type: meta.mime_type, data });
        }
        self.cache.get(blob_id, now)
    }

    // ── Announcements ────────────────────────────────────────────────────────

    /// Register a remote peer's announcement, with a fetch callback that
    /// rides the transport.
    pub fn on_remote_announce(&self, announce: BlobAnnounce) {
        if announce.provider == self.own_id() {
            return;
        }
        let fetch = self.transport_fetch_fn(&announce.provider, &announce.blob_id);
        if let Err(e) = self.providers.announce(
            &announce.blob_id,
            &announce.provider,
            announce.ttl_ms,
            fetch,
            now_ms(),
        ) {
            debug!(error = %e, "announce dropped");
        }
    }

    fn transport_fetch_fn(&self, provider: &str, blob_id: &str) -> BlobFetchFn {
        let transport = Arc::clone(&self.transport);
        let provider = provider.to_string();
        let blob_id = blob_id.to_string();
        Arc::new(move || {
            let transport = Arc::clone(&transport);
            let provider = provider.clone();
            let blob_id = blob_id.clone();
            Box::pin(async move { transport.fetch_blob(&provider, &blob_id).await })
        })
    }

    /// Broadcast that we can serve `blob_id`, and mirror the entry into our
    /// own registry so lifecycle code sees the local peer as a provider.
    pub async fn announce_local(&self, blob_id: &str) -> Result<(), AimError> {
        if !self.net_active.load(Ordering::SeqCst) {
            return Err(AimError::NetworkInactive);
        }
        self.transport.announce_blob(blob_id, ANNOUNCE_TTL_MS).await?;

        let own = self.own_id();
        let stores = self.stores.clone();
        let cache = Arc::clone(&self.cache);
        let id = blob_id.to_string();
        let local_fetch: BlobFetchFn = Arc::new(move || {
            let stores = stores.clone();
            let cache = Arc::clone(&cache);
            let id = id.clone();
            Box::pin(async move {
                let now = now_ms();
                if let Ok((meta, data)) = stores.current().attachments.get(&id, now) {
                    return Ok(FetchedBlob { name: meta.name, mime_type: meta.mime_type, data });
                }
                cache.get(&id, now).ok_or(AimError::AttachmentNotFound(id.clone()))
            })
        });
        let _ = self.providers.announce(blob_id, &own, ANNOUNCE_TTL_MS, local_fetch, now_ms());
        Ok(())
    }

    /// Announce every local blob the replication mode covers.
    pub async fn announce_all_local(&self) {
        let stores = self.stores.current();
        for meta in stores.attachments.list() {
            if self.replication.should_announce(meta.pinned()) {
                if let Err(e) = self.announce_local(&meta.id).await {
                    debug!(blob = %meta.id, error = %e, "local announce failed");
                    break;
                }
            }
        }
    }

    // ── Put / pin ────────────────────────────────────────────────────────────

    pub async fn put(
        &self,
        name: &str,
        mime_type: &str,
        data: &[u8],
    ) -> Result<AttachmentMeta, AimError> {
        self.acl.authorize(&self.own_id(), BlobOperation::Upload)?;
        let stores = self.stores.current();
        let meta = match stores.attachments.put(name, mime_type, data, now_ms()) {
            Ok(meta) => meta,
            Err(e) => {
                if matches!(e, AimError::AttachmentHardCapReached { .. }) {
                    self.metrics.hard_cap_hits.fetch_add(1, Ordering::Relaxed);
                }
                return Err(e);
            }
        };

        if self.net_active.load(Ordering::SeqCst)
            && self.replication.should_announce(meta.pinned())
        {
            if let Err(e) = self.announce_local(&meta.id).await {
                warn!(blob = %meta.id, error = %e, "announce after put failed");
            }
        }
        Ok(meta)
    }

    pub async fn set_pin(&self, blob_id: &str, pin: PinState) -> Result<AttachmentMeta, AimError> {
        let meta = self.stores.current().attachments.set_pin(blob_id, pin)?;
        // Pinning can newly qualify a blob for announcement under
        // pinned_only replication.
        if self.net_active.load(Ordering::SeqCst)
            && self.replication.should_announce(meta.pinned())
        {
            let _ = self.announce_local(blob_id).await;
        }
        Ok(meta)
    }

    // ── Get with failover ────────────────────────────────────────────────────

    pub async fn get(&self, cancel: &CancelToken, blob_id: &str) -> Result<FetchedBlob, AimError> {
        let now = now_ms();

        // Local durable store, then the ephemeral cache.
        if let Some(blob) = self.read_local(blob_id, now) {
            self.metrics.blob_fetches_ok.fetch_add(1, Ordering::Relaxed);
            return Ok(blob);
        }

        if !self.replication.fetch_enabled() || !allows_peer(self.rollout_pct, &self.own_id()) {
            return Err(AimError::AttachmentNotFound(blob_id.to_string()));
        }

        match self.fetch_remote(cancel, blob_id).await {
            Ok(blob) => {
                self.cache.put(blob_id, blob.clone(), now_ms());
                if self.replication.public_store_enabled() {
                    let stores = self.stores.current();
                    if let Err(e) = stores.attachments.put_with_id(
                        blob_id,
                        &blob.name,
                        &blob.mime_type,
                        &blob.data,
                        now_ms(),
                    ) {
                        warn!(blob = %blob_id, error = %e, "durable replication failed");
                    }
                }
                if self.net_active.load(Ordering::SeqCst) && self.replication.announce_enabled() {
                    let _ = self.announce_local(blob_id).await;
                }
                self.metrics.blob_fetches_ok.fetch_add(1, Ordering::Relaxed);
                Ok(blob)
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_remote(
        &self,
        cancel: &CancelToken,
        blob_id: &str,
    ) -> Result<FetchedBlob, AimError> {
        let own = self.own_id();
        let mut reason = UnavailableReason::NoProviders;

        for attempt in 0..MAX_FETCH_ATTEMPTS {
            if cancel.is_cancelled() {
                reason = UnavailableReason::Cancelled;
                break;
            }

            let candidates: Vec<_> = self
                .providers
                .list_providers(blob_id, now_ms())
                .into_iter()
                .filter(|c| c.peer_id != own)
                .collect();

            if !candidates.is_empty() {
                let mut any_allowed = false;
                for candidate in &candidates {
                    if cancel.is_cancelled() {
                        reason = UnavailableReason::Cancelled;
                        break;
                    }
                    if !self.providers.allow_fetch(&own, &candidate.peer_id) {
                        if !any_allowed {
                            reason = UnavailableReason::RateLimited;
                        }
                        continue;
                    }
                    any_allowed = true;

                    match (candidate.fetch)().await {
                        Ok(blob) => {
                            if !self.fetch_bw.allow_bytes(blob.data.len()) {
                                reason = UnavailableReason::RateLimited;
                                continue;
                            }
                            return Ok(blob);
                        }
                        Err(AimError::AttachmentAccessDenied) => {
                            // A definitive refusal is surfaced immediately.
                            self.metrics.count_unavailable(UnavailableReason::Forbidden);
                            return Err(AimError::AttachmentAccessDenied);
                        }
                        Err(AimError::PublishTimeout(_)) => {
                            reason = UnavailableReason::Timeout;
                        }
                        Err(e) => {
                            debug!(provider = %candidate.peer_id, error = %e, "provider fetch failed");
                            reason = UnavailableReason::ProvidersFailed;
                        }
                    }
                }
                if reason == UnavailableReason::Cancelled {
                    break;
                }
            }

            // Context-aware backoff between attempts.
            if attempt + 1 < MAX_FETCH_ATTEMPTS {
                let pause = Duration::from_millis(100 * (1 << attempt));
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = cancel.cancelled() => {
                        reason = UnavailableReason::Cancelled;
                        break;
                    }
                }
            }
        }

        self.metrics.count_unavailable(reason);
        Err(AimError::AttachmentTemporarilyUnavailable { reason })
    }
}

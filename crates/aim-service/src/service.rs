//! The service orchestrator (the daemon's one long-lived object): owns the
//! stores, sub-systems and long-running loops, and exposes the chat, inbox,
//! blob, enrollment, binding, profile and diagnostics APIs.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aim_core::attachment::{AttachmentClassLimits, AttachmentMeta, AttachmentTtls, HardCapPolicy, PinState};
use aim_core::constants::{
    MISSED_FETCH_MAX, MISSED_FETCH_WINDOW_MS, RETRY_LOOP_TICK_MS, STARTUP_RETRY_LOOKAHEAD_MS,
    STOP_NETWORK_TIMEOUT_MS,
};
use aim_core::interfaces::{FetchedBlob, IdentityManager, SessionManager, Transport};
use aim_core::message::{ConversationType, Message, MessageStatus};
use aim_core::types::{now_ms, IdentityId};
use aim_core::{AimError, CancelToken};
use aim_store::{AccountRegistry, GroupState, NodeBindingRecord};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::acl::{AclDeps, BlobAcl, ReplicationState, ServeGuard};
use crate::binding::{BindingManager, LinkCodeGrant};
use crate::blobs::BlobSubsystem;
use crate::cache::EphemeralCache;
use crate::config::{AclMode, PrivacyMode, RetentionMode, ServiceConfig, ServingLimits};
use crate::degrade::{DegradeState, PressureSignals, Transition};
use crate::diagnostics::AuditRing;
use crate::enroll::{EnrollmentClaims, EnrollmentVerifier};
use crate::events::{EventBus, ServiceEvent};
use crate::harden::HardeningConfig;
use crate::inbound::Inbound;
use crate::limits::BandwidthLimiter;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::outbound::{Outbound, RetryPolicy};
use crate::providers::ProviderRegistry;
use crate::replay::ReplayGuard;
use crate::sanitize::Sanitizer;
use crate::stores::{StorageBundle, StoresHandle};

/// Ephemeral cache sizing; modest because it is pure overhead on nodes with
/// the public store enabled.
const CACHE_MAX_BYTES: u64 = 64 * 1024 * 1024;
const CACHE_TTL_MS: i64 = 10 * 60 * 1000;

/// Bootstrap-refresh loop cadence.
const REFRESH_INTERVAL: Duration = Duration::from_secs(300);

struct PresetState {
    base: ServingLimits,
    current: ServingLimits,
}

struct RuntimeHandles {
    shutdown: watch::Sender<bool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

pub struct Service {
    pub cfg: ServiceConfig,
    pub base_dir: PathBuf,
    pub registry: AccountRegistry,
    pub stores: StoresHandle,
    pub identity: Arc<dyn IdentityManager>,
    pub sessions: Arc<dyn SessionManager>,
    pub transport: Arc<dyn Transport>,
    pub outbound: Arc<Outbound>,
    pub inbound: Arc<Inbound>,
    pub blobs: Arc<BlobSubsystem>,
    pub providers: Arc<ProviderRegistry>,
    pub cache: Arc<EphemeralCache>,
    pub serve_soft: Arc<BandwidthLimiter>,
    pub serve_hard: Arc<BandwidthLimiter>,
    pub serve_guard: Arc<ServeGuard>,
    pub acl: Arc<BlobAcl>,
    pub replication: Arc<ReplicationState>,
    pub degrade: Arc<DegradeState>,
    pub preset: Mutex<PresetState>,
    pub privacy: Arc<Mutex<PrivacyMode>>,
    pub blocked: Arc<Mutex<HashSet<String>>>,
    pub attachment_ttls: Mutex<AttachmentTtls>,
    pub binding: BindingManager,
    pub enrollment: EnrollmentVerifier,
    pub metrics: Arc<Metrics>,
    pub audit: Arc<AuditRing>,
    pub events: EventBus,
    pub sanitizer: Arc<Sanitizer>,
    pub net_active: Arc<AtomicBool>,
    pub retry_lag_ms: Arc<AtomicU64>,
    pub start_stop: tokio::sync::Mutex<()>,
    pub profile_mu: tokio::sync::Mutex<()>,
    pub runtime: Mutex<Option<RuntimeHandles>>,
}

impl Service {
    /// Wire the whole daemon under `base_dir`. Storage for the active
    /// profile is opened here; networking stays down until
    /// `start_networking`.
    pub fn build(
        base_dir: &Path,
        cfg: ServiceConfig,
        identity: Arc<dyn IdentityManager>,
        sessions: Arc<dyn SessionManager>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>, AimError> {
        let registry = AccountRegistry::load_or_init(base_dir)?;
        let active = registry
            .get(&registry.active_id())
            .ok_or_else(|| AimError::State("active profile missing from registry".into()))?;
        let profile_dir = registry.resolve(&active);
        let stores = StoresHandle::new(StorageBundle::open(&profile_dir, &cfg)?);

        let metrics = Arc::new(Metrics::new());
        let events = EventBus::new();
        let sanitizer = Arc::new(Sanitizer::new());
        let audit = Arc::new(AuditRing::new());
        let net_active = Arc::new(AtomicBool::new(false));

        // ACL capabilities are narrow closures over the stores handle and
        // identity manager; the policy object never sees the service.
        let owner = identity.identity();
        let acl = Arc::new(BlobAcl::new(
            owner.clone(),
            cfg.acl_mode,
            cfg.acl_allowlist.clone(),
            AclDeps {
                is_bound: Arc::new({
                    let stores = stores.clone();
                    let identity = Arc::clone(&identity);
                    move || stores.current().bindings.is_bound(&identity.identity())
                }),
                is_contact: Arc::new({
                    let identity = Arc::clone(&identity);
                    move |peer| identity.has_contact(peer)
                }),
                shares_group: Arc::new({
                    let stores = stores.clone();
                    let identity = Arc::clone(&identity);
                    move |peer| {
                        stores.current().groups.share_group(&identity.identity(), peer)
                    }
                }),
            },
        ));

        let replication = Arc::new(ReplicationState::new(
            cfg.replication_mode,
            cfg.blob_fetch_enabled,
            cfg.blob_announce_enabled,
            cfg.public_store_enabled,
            cfg.public_serving_enabled,
        ));

        let providers = Arc::new(ProviderRegistry::new());
        let cache = Arc::new(EphemeralCache::new(CACHE_MAX_BYTES, CACHE_TTL_MS));
        let fetch_bw = Arc::new(BandwidthLimiter::new(cfg.fetch_bandwidth_kbps));
        let serve_soft = Arc::new(BandwidthLimiter::new(cfg.serving.soft_kbps));
        let serve_hard = Arc::new(BandwidthLimiter::new(cfg.serving.hard_kbps));
        let serve_guard = Arc::new(ServeGuard::new(&cfg.serving));
        let degrade = Arc::new(DegradeState::new(cfg.degrade));

        let harden_cfg =
            HardeningConfig::new(cfg.metadata_hardening, cfg.batch_window_ms, cfg.jitter_max_ms);

        let outbound = Arc::new(Outbound {
            transport: Arc::clone(&transport),
            identity: Arc::clone(&identity),
            sessions: Arc::clone(&sessions),
            stores: stores.clone(),
            harden_cfg,
            metrics: Arc::clone(&metrics),
            events: events.clone(),
            net_active: Arc::clone(&net_active),
        });

        let privacy = Arc::new(Mutex::new(cfg.privacy_mode));
        let blocked: Arc<Mutex<HashSet<String>>> = Arc::default();
        let replay = Arc::new(ReplayGuard::new(aim_core::constants::REPLAY_WINDOW_MS));

        let inbound = Arc::new(Inbound {
            identity: Arc::clone(&identity),
            sessions: Arc::clone(&sessions),
            stores: stores.clone(),
            replay,
            privacy: Arc::clone(&privacy),
            blocked: Arc::clone(&blocked),
            events: events.clone(),
            metrics: Arc::clone(&metrics),
            sanitizer: Arc::clone(&sanitizer),
            outbound: Arc::clone(&outbound),
        });

        let blobs = Arc::new(BlobSubsystem {
            stores: stores.clone(),
            cache: Arc::clone(&cache),
            providers: Arc::clone(&providers),
            acl: Arc::clone(&acl),
            replication: Arc::clone(&replication),
            fetch_bw,
            serve_soft: Arc::clone(&serve_soft),
            serve_hard: Arc::clone(&serve_hard),
            serve_guard: Arc::clone(&serve_guard),
            degrade: Arc::clone(&degrade),
            transport: Arc::clone(&transport),
            identity: Arc::clone(&identity),
            metrics: Arc::clone(&metrics),
            rollout_pct: cfg.rollout_pct,
            net_active: Arc::clone(&net_active),
        });

        let binding = BindingManager::new(Arc::clone(&identity));
        let enrollment = EnrollmentVerifier::new(cfg.enrollment_issuer_keys.clone());

        let service = Arc::new(Self {
            preset: Mutex::new(PresetState { base: cfg.serving, current: cfg.serving }),
            attachment_ttls: Mutex::new(cfg.attachment_ttls),
            cfg,
            base_dir: base_dir.to_path_buf(),
            registry,
            stores,
            identity,
            sessions,
            transport,
            outbound,
            inbound,
            blobs,
            providers,
            cache,
            serve_soft,
            serve_hard,
            serve_guard,
            acl,
            replication,
            degrade,
            privacy,
            blocked,
            binding,
            enrollment,
            metrics,
            audit,
            events,
            sanitizer,
            net_active,
            retry_lag_ms: Arc::new(AtomicU64::new(0)),
            start_stop: tokio::sync::Mutex::new(()),
            profile_mu: tokio::sync::Mutex::new(()),
            runtime: Mutex::new(None),
        });
        info!(identity = %service.sanitizer.fingerprint(&owner), "service wired");
        Ok(service)
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn identity_id(&self) -> IdentityId {
        self.identity.identity()
    }

    pub fn networking_active(&self) -> bool {
        self.net_active.load(Ordering::SeqCst)
    }

    // ── Networking lifecycle ─────────────────────────────────────────────────

    pub async fn start_networking(self: &Arc<Self>) -> Result<(), AimError> {
        let _guard = self.start_stop.lock().await;
        if self.networking_active() {
            return Ok(());
        }
        let own = self.identity.identity();
        self.transport.set_identity(own.clone());

        // Single ingress callback: envelopes are queued and drained by an
        // owned task so the transport subscriber never blocks on disk.
        let (ingress_tx, mut ingress_rx) = mpsc::channel(256);
        {
            let tx = ingress_tx.clone();
            self.transport.subscribe_private(Arc::new(move |env| {
                if tx.try_send(env).is_err() {
                    warn!("inbound queue full; dropping envelope");
                }
            }));
        }
        {
            let blobs = Arc::clone(&self.blobs);
            self.transport.subscribe_blob_announce(Arc::new(move |a| blobs.on_remote_announce(a)));
        }
        self.transport.set_blob_server(self.blobs.serve_fn());

        self.transport.start().await?;
        self.net_active.store(true, Ordering::SeqCst);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        // Ingress drain task.
        {
            let inbound = Arc::clone(&self.inbound);
            let mut shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        env = ingress_rx.recv() => match env {
                            Some(env) => inbound.handle_envelope(env).await,
                            None => break,
                        },
                    }
                }
            }));
        }

        // Catch up on messages missed while offline.
        let since = now_ms() - MISSED_FETCH_WINDOW_MS;
        match self.transport.fetch_private_since(&own, since, MISSED_FETCH_MAX).await {
            Ok(missed) => {
                debug!(count = missed.len(), "processing missed messages");
                for env in missed {
                    self.inbound.handle_envelope(env).await;
                }
            }
            Err(e) => warn!(error = %e, "missed-message fetch failed"),
        }

        // Announce local blobs per replication mode.
        self.blobs.announce_all_local().await;

        // Startup recovery scan: due-soon pending, log-only error handling.
        self.outbound
            .process_due_pending(now_ms() + STARTUP_RETRY_LOOKAHEAD_MS, RetryPolicy::LogOnly)
            .await;

        // Retry loop.
        {
            let service = Arc::clone(self);
            let mut shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                let tick = Duration::from_millis(RETRY_LOOP_TICK_MS);
                let mut interval = tokio::time::interval(tick);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                let mut last_tick = std::time::Instant::now();
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = interval.tick() => {
                            let lag = last_tick.elapsed().saturating_sub(tick);
                            last_tick = std::time::Instant::now();
                            service.retry_lag_ms.store(lag.as_millis() as u64, Ordering::SeqCst);
                            service.outbound
                                .process_due_pending(now_ms(), RetryPolicy::Escalate)
                                .await;
                            service.evaluate_degrade();
                        }
                    }
                }
            }));
        }

        // Bootstrap refresh loop: re-announce, sweep caches, run GC.
        {
            let service = Arc::clone(self);
            let mut shutdown = shutdown_rx;
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(REFRESH_INTERVAL);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = interval.tick() => {
                            service.blobs.announce_all_local().await;
                            service.cache.purge_expired(now_ms());
                            let ttls = *service.attachment_ttls.lock().unwrap();
                            if let Err(e) = service.stores.current().attachments.gc(now_ms(), ttls) {
                                warn!(error = %e, "attachment gc failed");
                            }
                            let status = service.transport.status();
                            debug!(peers = status.peer_count, "bootstrap refresh");
                        }
                    }
                }
            }));
        }

        *self.runtime.lock().unwrap() = Some(RuntimeHandles { shutdown: shutdown_tx, tasks });
        self.events.publish(ServiceEvent::NetworkingStarted);
        info!("networking started");
        Ok(())
    }

    pub async fn stop_networking(self: &Arc<Self>) -> Result<(), AimError> {
        let _guard = self.start_stop.lock().await;
        if !self.networking_active() {
            return Ok(());
        }

        let handles = self.runtime.lock().unwrap().take();
        if let Some(handles) = handles {
            let _ = handles.shutdown.send(true);
            for task in handles.tasks {
                if tokio::time::timeout(
                    Duration::from_millis(STOP_NETWORK_TIMEOUT_MS),
                    task,
                )
                .await
                .is_err()
                {
                    warn!("runtime task did not stop within the bounded window");
                }
            }
        }

        if let Err(e) = tokio::time::timeout(
            Duration::from_millis(STOP_NETWORK_TIMEOUT_MS),
            self.transport.stop(),
        )
        .await
        .unwrap_or_else(|_| Err(AimError::PublishTimeout(STOP_NETWORK_TIMEOUT_MS)))
        {
            warn!(error = %e, "transport stop reported an error");
        }

        self.providers.remove_peer(&self.identity.identity());
        self.net_active.store(false, Ordering::SeqCst);

        if self.cfg.retention == RetentionMode::ZeroRetention {
            info!("zero retention: wiping content state on stop");
            if let Err(e) = self.stores.current().wipe_content() {
                warn!(error = %e, "zero-retention wipe failed");
            }
            self.cache.clear();
        }

        self.events.publish(ServiceEvent::NetworkingStopped);
        info!("networking stopped");
        Ok(())
    }

    // ── Autodegrade ──────────────────────────────────────────────────────────

    fn evaluate_degrade(&self) {
        let signals = PressureSignals {
            memory_bytes: resident_memory_bytes(),
            pending_len: self.stores.current().messages.pending_count(),
            loop_lag_ms: self.retry_lag_ms.load(Ordering::SeqCst),
            soft_cap_exceeded: false, // the sticky flag is folded in by evaluate()
        };
        match self.degrade.evaluate(signals, now_ms()) {
            Some(Transition::Entered) => {
                let mut preset = self.preset.lock().unwrap();
                let factor = self.cfg.degrade.degraded_factor_pct;
                let degraded = self.cfg.degrade.degraded_limits;
                self.serve_soft.set_limit_kbps(preset.base.soft_kbps * factor / 100);
                self.serve_hard.set_limit_kbps(preset.base.hard_kbps * factor / 100);
                self.serve_guard.reconfigure(&degraded);
                preset.current = degraded;
                drop(preset);
                warn!("public serving degraded under resource pressure");
                self.events.publish(ServiceEvent::DegradeEntered);
            }
            Some(Transition::Recovered) => {
                let mut preset = self.preset.lock().unwrap();
                let base = preset.base;
                self.serve_soft.set_limit_kbps(base.soft_kbps);
                self.serve_hard.set_limit_kbps(base.hard_kbps);
                self.serve_guard.reconfigure(&base);
                preset.current = base;
                drop(preset);
                info!("public serving recovered");
                self.events.publish(ServiceEvent::DegradeRecovered);
            }
            None => {}
        }
    }

    // ── Chat API ─────────────────────────────────────────────────────────────

    pub async fn send_message(
        &self,
        cancel: &CancelToken,
        contact_id: &str,
        content: Vec<u8>,
        content_type: &str,
    ) -> Result<Message, AimError> {
        let started = std::time::Instant::now();
        let result = self
            .outbound
            .send_message(cancel, ConversationType::Direct, contact_id, content, content_type)
            .await;
        self.metrics.record_latency_ms("send_message", started.elapsed().as_millis() as u64);
        result
    }

    pub async fn send_group_message(
        &self,
        cancel: &CancelToken,
        group_id: &str,
        content: Vec<u8>,
        content_type: &str,
    ) -> Result<Message, AimError> {
        self.outbound
            .send_message(cancel, ConversationType::Group, group_id, content, content_type)
            .await
    }

    pub async fn mark_read(&self, contact_id: &str, message_id: &str) -> Result<(), AimError> {
        let status = self.stores.current().messages.update_status(message_id, MessageStatus::Read)?;
        if status == MessageStatus::Read {
            self.outbound.emit_receipt(contact_id, message_id, MessageStatus::Read).await;
        }
        Ok(())
    }

    pub fn list_messages(
        &self,
        conversation_id: &str,
        conversation_type: ConversationType,
        limit: usize,
        offset: usize,
    ) -> Vec<Message> {
        self.stores.current().messages.list_by_conversation(
            conversation_id,
            conversation_type,
            limit,
            offset,
        )
    }

    pub fn purge_messages_older_than(&self, cutoff_ms: i64) -> Result<usize, AimError> {
        self.stores.current().messages.purge_older_than(cutoff_ms)
    }

    // ── Groups ───────────────────────────────────────────────────────────────

    pub fn upsert_group(&self, group: GroupState) -> Result<(), AimError> {
        self.stores.current().groups.upsert(group)
    }

    pub fn group(&self, group_id: &str) -> Option<GroupState> {
        self.stores.current().groups.get(group_id)
    }

    // ── Contacts & privacy ───────────────────────────────────────────────────

    pub fn add_contact(&self, identity_id: &str) -> Result<(), AimError> {
        self.identity.add_contact_by_identity_id(identity_id)
    }

    pub fn set_privacy_mode(&self, mode: PrivacyMode) {
        *self.privacy.lock().unwrap() = mode;
    }

    pub fn block_contact(&self, identity_id: &str) {
        self.blocked.lock().unwrap().insert(identity_id.to_string());
    }

    pub fn unblock_contact(&self, identity_id: &str) {
        self.blocked.lock().unwrap().remove(identity_id);
    }

    // ── Request inbox ────────────────────────────────────────────────────────

    pub fn inbox_threads(&self) -> std::collections::BTreeMap<String, Vec<Message>> {
        self.stores.current().inbox.snapshot_map()
    }

    /// Accept a stranger's thread: add the contact, move the queued messages
    /// into the message log, and restore the thread on any failure.
    pub fn inbox_accept(&self, sender: &str) -> Result<usize, AimError> {
        let stores = self.stores.current();
        let thread = match stores.inbox.take(sender)? {
            Some(t) => t,
            None => return Ok(0),
        };
        let count = thread.len();

        let apply = || -> Result<(), AimError> {
            self.identity.add_contact_by_identity_id(sender)?;
            for msg in &thread {
                match stores.messages.save_message(msg.clone()) {
                    Ok(()) | Err(AimError::MessageIdConflict(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        };
        if let Err(e) = apply() {
            let _ = stores.inbox.restore_if_empty(sender, thread);
            return Err(e);
        }
        Ok(count)
    }

    pub fn inbox_decline(&self, sender: &str) -> Result<(), AimError> {
        self.stores.current().inbox.remove(sender)
    }

    // ── Blobs ────────────────────────────────────────────────────────────────

    pub async fn put_attachment(
        &self,
        name: &str,
        mime_type: &str,
        data: &[u8],
    ) -> Result<AttachmentMeta, AimError> {
        self.blobs.put(name, mime_type, data).await
    }

    pub async fn get_attachment(
        &self,
        cancel: &CancelToken,
        blob_id: &str,
    ) -> Result<FetchedBlob, AimError> {
        let started = std::time::Instant::now();
        let result = self.blobs.get(cancel, blob_id).await;
        self.metrics.record_latency_ms("get_attachment", started.elapsed().as_millis() as u64);
        result
    }

    pub async fn pin_blob(&self, blob_id: &str) -> Result<AttachmentMeta, AimError> {
        self.blobs.set_pin(blob_id, PinState::Pinned).await
    }

    pub async fn unpin_blob(&self, blob_id: &str) -> Result<AttachmentMeta, AimError> {
        self.blobs.set_pin(blob_id, PinState::Unpinned).await
    }

    // ── Enrollment & binding ─────────────────────────────────────────────────

    pub fn redeem_enrollment_token(&self, token: &str) -> Result<EnrollmentClaims, AimError> {
        let stores = self.stores.current();
        self.enrollment.verify_and_redeem(
            token,
            &stores.redemptions,
            self.audit.as_ref(),
            &self.sanitizer,
            now_ms(),
        )
    }

    pub fn create_node_binding_link_code(&self, ttl_seconds: i64) -> LinkCodeGrant {
        self.binding.create_link_code(ttl_seconds)
    }

    pub fn complete_node_binding(
        &self,
        link_code: &str,
        node_id: &str,
        node_public_key_b64: &str,
        node_signature_b64: &str,
        allow_rebind: bool,
    ) -> Result<NodeBindingRecord, AimError> {
        let stores = self.stores.current();
        self.binding.complete_binding(
            &stores.bindings,
            link_code,
            node_id,
            node_public_key_b64,
            node_signature_b64,
            allow_rebind,
            now_ms(),
        )
    }

    pub fn unbind_node(&self, node_id: Option<&str>, confirm: bool) -> Result<(), AimError> {
        self.binding.unbind(&self.stores.current().bindings, node_id, confirm)
    }

    pub fn node_binding(&self) -> Option<NodeBindingRecord> {
        self.stores.current().bindings.active(&self.identity.identity())
    }

    // ── Policies ─────────────────────────────────────────────────────────────

    /// Install a new serving preset. Captured as the base the autodegrade
    /// machinery restores to; applied immediately unless degraded.
    pub fn set_blob_node_preset(&self, limits: ServingLimits) {
        let mut preset = self.preset.lock().unwrap();
        preset.base = limits;
        if self.degrade.mode() == crate::degrade::DegradeMode::Normal {
            self.serve_soft.set_limit_kbps(limits.soft_kbps);
            self.serve_hard.set_limit_kbps(limits.hard_kbps);
            self.serve_guard.reconfigure(&limits);
            preset.current = limits;
        }
    }

    pub fn update_node_policies(
        &self,
        acl_mode: Option<AclMode>,
        allowlist: Option<Vec<String>>,
        public_serving: Option<bool>,
    ) {
        if let Some(mode) = acl_mode {
            self.acl.set_mode(mode);
        }
        if let Some(list) = allowlist {
            self.acl.set_allowlist(list);
        }
        if let Some(enabled) = public_serving {
            self.replication.set_public_serving(enabled);
        }
    }

    pub fn update_storage_policy(
        &self,
        limits: Option<AttachmentClassLimits>,
        ttls: Option<AttachmentTtls>,
        hard_cap: Option<HardCapPolicy>,
    ) -> Result<(), AimError> {
        let stores = self.stores.current();
        if let Some(limits) = limits {
            stores.attachments.set_limits(limits);
        }
        if let Some(ttls) = ttls {
            *self.attachment_ttls.lock().unwrap() = ttls;
        }
        if let Some(policy) = hard_cap {
            stores.attachments.set_hard_cap(policy)?;
        }
        Ok(())
    }

    // ── Metrics & diagnostics ────────────────────────────────────────────────

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        let mut snap = self.metrics.snapshot();
        let stores = self.stores.current();
        snap.peer_count = self.transport.status().peer_count;
        snap.pending_queue = stores.messages.pending_count();
        let usage = stores.attachments.usage();
        snap.attachment_image_bytes = usage.image_bytes;
        snap.attachment_file_bytes = usage.file_bytes;
        snap.notification_backlog = self.events.backlog_estimate() as u64;
        snap
    }

    /// Export the redacted diagnostics bundle as a JSON string.
    pub fn export_diagnostics_bundle(&self, window_minutes: i64) -> Result<String, AimError> {
        let window = if window_minutes > 0 {
            window_minutes
        } else {
            self.cfg.diagnostics_window_min
        };
        let cutoff = now_ms() - window * 60 * 1000;
        let bundle = serde_json::json!({
            "generated_at": chrono::Utc::now().to_rfc3339(),
            "window_minutes": window,
            "identity": self.sanitizer.fingerprint(&self.identity.identity()),
            "networking_active": self.networking_active(),
            "transport": self.transport.status(),
            "degrade_mode": self.degrade.mode(),
            "metrics": self.metrics_snapshot(),
            "audit": self.audit.since(cutoff),
            "provider_blobs": self.providers.blob_count(),
            "cache_bytes": self.cache.usage_bytes(),
        });
        let raw = serde_json::to_string_pretty(&bundle)
            .map_err(|e| AimError::State(e.to_string()))?;
        Ok(self.sanitizer.redact_diagnostics(&raw))
    }
}

/// Resident set size of this process, best effort. Zero when the platform
/// offers no cheap probe.
fn resident_memory_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
            if let Some(resident_pages) =
                statm.split_whitespace().nth(1).and_then(|f| f.parse::<u64>().ok())
            {
                return resident_pages * 4096;
            }
        }
    }
    0
}

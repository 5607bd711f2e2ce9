//! Blob ACL and serving-side guards.
//!
//! The ACL is only *enforced* while the identity is node-bound; an unbound
//! node serves nobody any guarantees and the policy stays advisory. The
//! serve guard combines the per-peer QPS budget with a concurrency cap.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aim_core::AimError;
use serde::{Deserialize, Serialize};

use crate::config::{AclMode, ReplicationMode, ServingLimits};
use crate::limits::MapLimiter;

// ── ACL ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobOperation {
    Upload,
    Fetch,
}

/// Capabilities the ACL consults, wired in as closures at construction so the
/// policy never reaches back into the service.
pub struct AclDeps {
    /// Whether the owner identity currently has a node binding.
    pub is_bound: Arc<dyn Fn() -> bool + Send + Sync>,
    /// Whether `peer` is a contact of the owner.
    pub is_contact: Arc<dyn Fn(&str) -> bool + Send + Sync>,
    /// Whether `peer` shares at least one active group with the owner.
    pub shares_group: Arc<dyn Fn(&str) -> bool + Send + Sync>,
}

pub struct BlobAcl {
    owner: Mutex<String>,
    mode: Mutex<AclMode>,
    allowlist: Mutex<HashSet<String>>,
    deps: AclDeps,
}

impl BlobAcl {
    pub fn new(owner: String, mode: AclMode, allowlist: Vec<String>, deps: AclDeps) -> Self {
        Self {
            owner: Mutex::new(owner),
            mode: Mutex::new(mode),
            allowlist: Mutex::new(allowlist.into_iter().collect()),
            deps,
        }
    }

    pub fn set_mode(&self, mode: AclMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn mode(&self) -> AclMode {
        *self.mode.lock().unwrap()
    }

    pub fn set_allowlist(&self, peers: Vec<String>) {
        *self.allowlist.lock().unwrap() = peers.into_iter().collect();
    }

    pub fn set_owner(&self, owner: String) {
        *self.owner.lock().unwrap() = owner;
    }

    /// Authorize `peer` for `_op`. The owner is always allowed; everyone else
    /// is judged by the active mode, and only when the identity is bound.
    pub fn authorize(&self, peer: &str, _op: BlobOperation) -> Result<(), AimError> {
        let owner = self.owner.lock().unwrap().clone();
        if peer == owner {
            return Ok(());
        }
        if !(self.deps.is_bound)() {
            // Policy is not enforced until the identity is node-bound.
            return Ok(());
        }
        let allowed = match self.mode() {
            AclMode::OwnerOnly => false,
            AclMode::OwnerContacts => (self.deps.is_contact)(peer),
            AclMode::OwnerGroupsMembers => {
                (self.deps.is_contact)(peer) || (self.deps.shares_group)(peer)
            }
            AclMode::Allowlist => self.allowlist.lock().unwrap().contains(peer),
        };
        if allowed {
            Ok(())
        } else {
            Err(AimError::AttachmentAccessDenied)
        }
    }
}

// ── Serve guard ──────────────────────────────────────────────────────────────

/// Concurrency slots plus per-peer per-minute budget for local blob serving.
pub struct ServeGuard {
    max_concurrent: AtomicU32,
    in_flight: Arc<AtomicU32>,
    per_peer: Mutex<MapLimiter>,
}

/// RAII slot; dropping releases the concurrency permit.
pub struct ServeSlot {
    in_flight: Arc<AtomicU32>,
}

impl Drop for ServeSlot {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn per_peer_limiter(per_minute: u32) -> MapLimiter {
    MapLimiter::new(per_minute as f64 / 60.0, per_minute.max(1) as f64, Duration::from_secs(600))
}

impl ServeGuard {
    pub fn new(limits: &ServingLimits) -> Self {
        Self {
            max_concurrent: AtomicU32::new(limits.max_concurrent),
            in_flight: Arc::new(AtomicU32::new(0)),
            per_peer: Mutex::new(per_peer_limiter(limits.per_peer_per_minute)),
        }
    }

    pub fn reconfigure(&self, limits: &ServingLimits) {
        self.max_concurrent.store(limits.max_concurrent, Ordering::SeqCst);
        *self.per_peer.lock().unwrap() = per_peer_limiter(limits.per_peer_per_minute);
    }

    /// Pass the per-peer budget and take a concurrency slot.
    pub fn try_acquire(&self, peer: &str) -> Result<ServeSlot, AimError> {
        if !self.per_peer.lock().unwrap().allow(peer) {
            return Err(AimError::AttachmentTemporarilyUnavailable {
                reason: aim_core::error::UnavailableReason::RateLimited,
            });
        }
        let max = self.max_concurrent.load(Ordering::SeqCst);
        let prev = self.in_flight.fetch_add(1, Ordering::SeqCst);
        if prev >= max {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(AimError::AttachmentTemporarilyUnavailable {
                reason: aim_core::error::UnavailableReason::RateLimited,
            });
        }
        Ok(ServeSlot { in_flight: Arc::clone(&self.in_flight) })
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }
}

// ── Replication / serving state ──────────────────────────────────────────────

/// Hot-read replication mode and serving flags.
pub struct ReplicationState {
    mode: Mutex<ReplicationMode>,
    fetch_enabled: AtomicBool,
    announce_enabled: AtomicBool,
    public_store_enabled: AtomicBool,
    public_serving_enabled: AtomicBool,
}

impl ReplicationState {
    pub fn new(
        mode: ReplicationMode,
        fetch_enabled: bool,
        announce_enabled: bool,
        public_store_enabled: bool,
        public_serving_enabled: bool,
    ) -> Self {
        Self {
            mode: Mutex::new(mode),
            fetch_enabled: AtomicBool::new(fetch_enabled),
            announce_enabled: AtomicBool::new(announce_enabled),
            public_store_enabled: AtomicBool::new(public_store_enabled),
            public_serving_enabled: AtomicBool::new(public_serving_enabled),
        }
    }

    pub fn mode(&self) -> ReplicationMode {
        *self.mode.lock().unwrap()
    }

    pub fn set_mode(&self, mode: ReplicationMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn fetch_enabled(&self) -> bool {
        self.fetch_enabled.load(Ordering::SeqCst)
    }

    pub fn announce_enabled(&self) -> bool {
        self.announce_enabled.load(Ordering::SeqCst)
    }

    pub fn public_store_enabled(&self) -> bool {
        self.public_store_enabled.load(Ordering::SeqCst)
    }

    pub fn public_serving_enabled(&self) -> bool {
        self.public_serving_enabled.load(Ordering::SeqCst)
    }

    pub fn set_public_serving(&self, enabled: bool) {
        self.public_serving_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether a blob should be announced under the current mode.
    pub fn should_announce(&self, pinned: bool) -> bool {
        if !self.announce_enabled() {
            return false;
        }
        match self.mode() {
            ReplicationMode::OnDemand => true,
            ReplicationMode::PinnedOnly => pinned,
            ReplicationMode::None => false,
        }
    }
}

/// Deterministic rollout bucket: a peer participates in the fetch path iff
/// its hashed id lands under the configured percentage.
pub fn allows_peer(rollout_pct: u8, peer_id: &str) -> bool {
    if rollout_pct >= 100 {
        return true;
    }
    if rollout_pct == 0 {
        return false;
    }
    let digest = blake3::hash(peer_id.as_bytes());
    let bucket = u64::from_le_bytes(digest.as_bytes()[..8].try_into().expect("8 bytes")) % 100;
    bucket < rollout_pct as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool as StdAtomicBool;

    fn acl_with(mode: AclMode, bound: bool, contact: bool, grouped: bool) -> BlobAcl {
        let bound_flag = Arc::new(StdAtomicBool::new(bound));
        let bf = Arc::clone(&bound_flag);
        BlobAcl::new(
            "aim1owner".into(),
            mode,
            vec!["aim1listed".into()],
            AclDeps {
                is_bound: Arc::new(move || bf.load(Ordering::SeqCst)),
                is_contact: Arc::new(move |_| contact),
                shares_group: Arc::new(move |_| grouped),
            },
        )
    }

    #[test]
    fn owner_is_always_allowed() {
        let acl = acl_with(AclMode::OwnerOnly, true, false, false);
        assert!(acl.authorize("aim1owner", BlobOperation::Fetch).is_ok());
        assert!(acl.authorize("aim1peer", BlobOperation::Fetch).is_err());
    }

    #[test]
    fn unbound_identity_does_not_enforce() {
        let acl = acl_with(AclMode::OwnerOnly, false, false, false);
        assert!(acl.authorize("aim1peer", BlobOperation::Fetch).is_ok());
    }

    #[test]
    fn contacts_mode_consults_contact_manager() {
        let yes = acl_with(AclMode::OwnerContacts, true, true, false);
        assert!(yes.authorize("aim1peer", BlobOperation::Fetch).is_ok());
        let no = acl_with(AclMode::OwnerContacts, true, false, false);
        assert!(matches!(
            no.authorize("aim1peer", BlobOperation::Fetch),
            Err(AimError::AttachmentAccessDenied)
        ));
    }

    #[test]
    fn groups_mode_accepts_shared_membership() {
        let acl = acl_with(AclMode::OwnerGroupsMembers, true, false, true);
        assert!(acl.authorize("aim1peer", BlobOperation::Fetch).is_ok());
        let acl = acl_with(AclMode::OwnerGroupsMembers, true, false, false);
        assert!(acl.authorize("aim1peer", BlobOperation::Fetch).is_err());
    }

    #[test]
    fn allowlist_mode() {
        let acl = acl_with(AclMode::Allowlist, true, false, false);
        assert!(acl.authorize("aim1listed", BlobOperation::Fetch).is_ok());
        assert!(acl.authorize("aim1unlisted", BlobOperation::Fetch).is_err());
    }

    #[test]
    fn serve_guard_concurrency_and_release() {
        let guard = ServeGuard::new(&ServingLimits {
            soft_kbps: 0,
            hard_kbps: 0,
            max_concurrent: 2,
            per_peer_per_minute: 1_000,
        });
        let a = guard.try_acquire("aim1p").unwrap();
        let _b = guard.try_acquire("aim1q").unwrap();
        assert!(guard.try_acquire("aim1r").is_err(), "slots exhausted");
        drop(a);
        assert!(guard.try_acquire("aim1r").is_ok(), "slot released on drop");
    }

    #[test]
    fn serve_guard_per_peer_budget() {
        let guard = ServeGuard::new(&ServingLimits {
            soft_kbps: 0,
            hard_kbps: 0,
            max_concurrent: 100,
            per_peer_per_minute: 2,
        });
        let s1 = guard.try_acquire("aim1p").unwrap();
        let s2 = guard.try_acquire("aim1p").unwrap();
        drop((s1, s2));
        assert!(guard.try_acquire("aim1p").is_err(), "per-minute budget spent");
        assert!(guard.try_acquire("aim1other").is_ok());
    }

    #[test]
    fn rollout_is_deterministic() {
        for pct in [0u8, 25, 50, 75, 100] {
            let first = allows_peer(pct, "aim1somebody");
            for _ in 0..10 {
                assert_eq!(first, allows_peer(pct, "aim1somebody"));
            }
        }
        assert!(allows_peer(100, "anyone"));
        assert!(!allows_peer(0, "anyone"));
    }

    #[test]
    fn replication_announce_policy() {
        let st = ReplicationState::new(ReplicationMode::OnDemand, true, true, false, true);
        assert!(st.should_announce(false));
        st.set_mode(ReplicationMode::PinnedOnly);
        assert!(!st.should_announce(false));
        assert!(st.should_announce(true));
        st.set_mode(ReplicationMode::None);
        assert!(!st.should_announce(true));
    }
}

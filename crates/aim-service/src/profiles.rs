//! Account profiles: hot switching between per-profile data directories,
//! and profile allocation for create/import identity. All operations hold
//! the profile mutex; switching tears networking down and restarts it.

use std::sync::Arc;

use aim_core::constants::ACCOUNT_ID_PREFIX;
use aim_core::types::now_ms;
use aim_core::AimError;
use aim_store::AccountProfile;
use rand::RngCore;
use tracing::{info, warn};

use crate::events::ServiceEvent;
use crate::service::Service;
use crate::stores::StorageBundle;

fn new_profile_id() -> String {
    let mut raw = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut raw);
    format!("{ACCOUNT_ID_PREFIX}{}", hex::encode(raw))
}

impl Service {
    pub fn list_accounts(&self) -> Vec<AccountProfile> {
        self.registry.list()
    }

    pub fn active_account(&self) -> String {
        self.registry.active_id()
    }

    /// Switch the active profile. Reentrant-safe: networking is stopped
    /// under the start/stop lock, the storage bundle is rebuilt under the
    /// new profile directory, and any mid-step failure rolls back to the
    /// previous profile (restarting networking if it was running).
    pub async fn switch_account(self: &Arc<Self>, id: &str) -> Result<(), AimError> {
        let _guard = self.profile_mu.lock().await;
        let target = self
            .registry
            .get(id)
            .ok_or_else(|| AimError::UnknownProfile(id.to_string()))?;
        if self.registry.active_id() == id {
            return Ok(());
        }

        let was_running = self.networking_active();
        if was_running {
            self.stop_networking().await?;
        }

        let new_dir = self.registry.resolve(&target);
        let bundle = match StorageBundle::open(&new_dir, &self.cfg) {
            Ok(b) => b,
            Err(e) => {
                warn!(profile = id, error = %e, "profile storage open failed; rolling back");
                if was_running {
                    let _ = self.start_networking().await;
                }
                return Err(e);
            }
        };

        let previous = self.stores.swap(bundle);
        if let Err(e) = self.registry.set_active(id) {
            warn!(profile = id, error = %e, "active-profile persist failed; rolling back");
            self.stores.swap_arc(previous);
            if was_running {
                let _ = self.start_networking().await;
            }
            return Err(e);
        }

        if was_running {
            if let Err(e) = self.start_networking().await {
                warn!(error = %e, "networking restart after switch failed");
            }
        }
        self.events.publish(ServiceEvent::AccountSwitched { profile_id: id.to_string() });
        info!(profile = id, "account switched");
        Ok(())
    }

    /// Allocate a fresh profile, switch to it, and generate a new identity
    /// inside it. On failure the profile is removed and the prior one
    /// restored.
    pub async fn create_identity(self: &Arc<Self>) -> Result<String, AimError> {
        let snapshot = {
            let fresh = aim_crypto::LocalIdentityManager::generate();
            aim_core::interfaces::IdentityManager::snapshot_identity_keys(&fresh)?
        };
        self.provision_profile_with_identity(snapshot).await
    }

    /// Allocate a fresh profile, switch to it, and install an imported
    /// identity snapshot. Same rollback discipline as `create_identity`.
    pub async fn import_identity(
        self: &Arc<Self>,
        snapshot: serde_json::Value,
    ) -> Result<String, AimError> {
        self.provision_profile_with_identity(snapshot).await
    }

    async fn provision_profile_with_identity(
        self: &Arc<Self>,
        snapshot: serde_json::Value,
    ) -> Result<String, AimError> {
        let prior = self.registry.active_id();
        let id = new_profile_id();
        let profile = AccountProfile {
            id: id.clone(),
            rel_path: format!("profiles/{id}"),
            created_at: now_ms(),
        };
        self.registry.add(profile)?;

        let run = async {
            self.switch_account(&id).await?;
            self.identity.restore_identity_keys(snapshot.clone())?;
            self.sessions.wipe();
            self.acl.set_owner(self.identity.identity());
            Ok::<(), AimError>(())
        };

        if let Err(e) = run.await {
            warn!(profile = %id, error = %e, "identity provisioning failed; restoring prior profile");
            let _ = self.switch_account(&prior).await;
            let _ = self.registry.remove(&id);
            return Err(e);
        }
        Ok(id)
    }
}

//! Backup export/restore and data wipe, all gated on exact-match consent
//! tokens. Bundles are sealed with a passphrase-derived key in the same
//! envelope format the stores use at rest.

use std::sync::Arc;

use aim_core::constants::{CONSENT_EXPORT, CONSENT_RESTORE, CONSENT_WIPE, STORAGE_MAGIC};
use aim_core::message::Message;
use aim_core::AimError;
use aim_crypto::StorageCipher;
use aim_store::GroupState;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::service::Service;

#[derive(Serialize, Deserialize)]
struct BackupBundle {
    version: u32,
    exported_at: String,
    identity_keys: serde_json::Value,
    sessions: serde_json::Value,
    messages: Vec<Message>,
    groups: Vec<GroupState>,
}

impl Service {
    /// Destroy all content state. Requires the exact wipe consent token.
    pub async fn wipe_data(self: &Arc<Self>, consent: &str) -> Result<(), AimError> {
        if consent != CONSENT_WIPE {
            return Err(AimError::ConsentMismatch);
        }
        if self.networking_active() {
            self.stop_networking().await?;
        }
        self.stores.current().wipe_content()?;
        self.sessions.wipe();
        self.cache.clear();
        info!("data wiped on user consent");
        Ok(())
    }

    /// Export identity, sessions, messages and group state as one sealed
    /// bundle.
    pub fn export_backup(&self, consent: &str, passphrase: &str) -> Result<Vec<u8>, AimError> {
        if consent != CONSENT_EXPORT {
            return Err(AimError::ConsentMismatch);
        }
        if passphrase.is_empty() {
            return Err(AimError::InvalidArgument("backup passphrase must not be empty".into()));
        }
        let stores = self.stores.current();
        let bundle = BackupBundle {
            version: 1,
            exported_at: chrono::Utc::now().to_rfc3339(),
            identity_keys: self.identity.snapshot_identity_keys()?,
            sessions: self.sessions.snapshot()?,
            messages: stores.messages.list(0, 0),
            groups: stores.groups.list(),
        };
        let plain = serde_json::to_vec(&bundle).map_err(|e| AimError::Storage(e.to_string()))?;
        let sealed = StorageCipher::from_passphrase(passphrase).seal(&plain)?;
        let mut out = Vec::with_capacity(STORAGE_MAGIC.len() + sealed.len());
        out.extend_from_slice(STORAGE_MAGIC);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Restore a previously exported bundle into the active profile.
    pub fn restore_backup(
        &self,
        consent: &str,
        passphrase: &str,
        blob: &[u8],
    ) -> Result<(), AimError> {
        if consent != CONSENT_RESTORE {
            return Err(AimError::ConsentMismatch);
        }
        let sealed = blob
            .strip_prefix(STORAGE_MAGIC)
            .ok_or_else(|| AimError::InvalidArgument("not a backup bundle".into()))?;
        let plain = StorageCipher::from_passphrase(passphrase).open(sealed)?;
        let bundle: BackupBundle = serde_json::from_slice(&plain)
            .map_err(|e| AimError::InvalidArgument(format!("backup bundle: {e}")))?;
        if bundle.version != 1 {
            return Err(AimError::UnsupportedStorageSchema { got: bundle.version, max: 1 });
        }

        self.identity.restore_identity_keys(bundle.identity_keys)?;
        self.sessions.restore(bundle.sessions)?;
        self.acl.set_owner(self.identity.identity());

        let stores = self.stores.current();
        for msg in bundle.messages {
            match stores.messages.save_message(msg) {
                Ok(()) | Err(AimError::MessageIdConflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        for group in bundle.groups {
            stores.groups.upsert(group)?;
        }
        info!("backup restored");
        Ok(())
    }
}

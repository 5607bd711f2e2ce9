use std::path::{Path, PathBuf};
use std::sync::Mutex;

use aim_core::constants::{ACCOUNT_REGISTRY_VERSION, LEGACY_PROFILE_ID};
use aim_core::types::Timestamp;
use aim_core::AimError;
use serde::{Deserialize, Serialize};

use crate::envelope::EnvelopeCodec;

/// One account profile: a data directory relative to the base data dir.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountProfile {
    pub id: String,
    pub rel_path: String,
    pub created_at: Timestamp,
}

#[derive(Clone, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    active_id: String,
    accounts: Vec<AccountProfile>,
}

/// The `accounts.json` registry at the base data dir. The `legacy` profile is
/// always present and always resolves to the base dir itself. The registry is
/// profile-selection metadata and deliberately lives outside the per-profile
/// encrypted state.
pub struct AccountRegistry {
    path: PathBuf,
    base_dir: PathBuf,
    mu: Mutex<RegistryFile>,
}

impl AccountRegistry {
    pub fn load_or_init(base_dir: &Path) -> Result<Self, AimError> {
        let path = base_dir.join("accounts.json");
        let codec = EnvelopeCodec::plaintext();
        let mut reg = match codec.read_file(&path)? {
            None => RegistryFile {
                version: ACCOUNT_REGISTRY_VERSION,
                active_id: LEGACY_PROFILE_ID.to_string(),
                accounts: Vec::new(),
            },
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| AimError::Storage(format!("account registry: {e}")))?,
        };
        if reg.version > ACCOUNT_REGISTRY_VERSION {
            return Err(AimError::UnsupportedStorageSchema {
                got: reg.version,
                max: ACCOUNT_REGISTRY_VERSION,
            });
        }

        if !reg.accounts.iter().any(|a| a.id == LEGACY_PROFILE_ID) {
            reg.accounts.insert(
                0,
                AccountProfile {
                    id: LEGACY_PROFILE_ID.to_string(),
                    rel_path: ".".to_string(),
                    created_at: 0,
                },
            );
        }

        let registry = Self { path, base_dir: base_dir.to_path_buf(), mu: Mutex::new(reg) };
        registry.persist_current()?;
        Ok(registry)
    }

    fn persist_current(&self) -> Result<(), AimError> {
        let state = self.mu.lock().unwrap().clone();
        self.persist(&state)
    }

    fn persist(&self, state: &RegistryFile) -> Result<(), AimError> {
        let bytes =
            serde_json::to_vec_pretty(state).map_err(|e| AimError::Storage(e.to_string()))?;
        EnvelopeCodec::plaintext().write_file(&self.path, &bytes)
    }

    pub fn list(&self) -> Vec<AccountProfile> {
        self.mu.lock().unwrap().accounts.clone()
    }

    pub fn active_id(&self) -> String {
        self.mu.lock().unwrap().active_id.clone()
    }

    pub fn get(&self, id: &str) -> Option<AccountProfile> {
        self.mu.lock().unwrap().accounts.iter().find(|a| a.id == id).cloned()
    }

    pub fn set_active(&self, id: &str) -> Result<(), AimError> {
        let mut state = self.mu.lock().unwrap();
        if !state.accounts.iter().any(|a| a.id == id) {
            return Err(AimError::UnknownProfile(id.to_string()));
        }
        let mut scratch = state.clone();
        scratch.active_id = id.to_string();
        self.persist(&scratch)?;
        *state = scratch;
        Ok(())
    }

    pub fn add(&self, profile: AccountProfile) -> Result<(), AimError> {
        let mut state = self.mu.lock().unwrap();
        if state.accounts.iter().any(|a| a.id == profile.id) {
            return Err(AimError::ProfileExists(profile.id));
        }
        let mut scratch = state.clone();
        scratch.accounts.push(profile);
        self.persist(&scratch)?;
        *state = scratch;
        Ok(())
    }

    /// Remove a profile. The `legacy` profile and the active profile cannot
    /// be removed.
    pub fn remove(&self, id: &str) -> Result<(), AimError> {
        if id == LEGACY_PROFILE_ID {
            return Err(AimError::InvalidArgument("cannot remove the legacy profile".into()));
        }
        let mut state = self.mu.lock().unwrap();
        if state.active_id == id {
            return Err(AimError::InvalidArgument("cannot remove the active profile".into()));
        }
        if !state.accounts.iter().any(|a| a.id == id) {
            return Ok(());
        }
        let mut scratch = state.clone();
        scratch.accounts.retain(|a| a.id != id);
        self.persist(&scratch)?;
        *state = scratch;
        Ok(())
    }

    /// Resolve a profile's data directory under the base data dir.
    pub fn resolve(&self, profile: &AccountProfile) -> PathBuf {
        if profile.rel_path == "." {
            self.base_dir.clone()
        } else {
            self.base_dir.join(&profile.rel_path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_profile_is_always_present() {
        let dir = tempfile::tempdir().unwrap();
        let reg = AccountRegistry::load_or_init(dir.path()).unwrap();
        let legacy = reg.get(LEGACY_PROFILE_ID).unwrap();
        assert_eq!(legacy.rel_path, ".");
        assert_eq!(reg.active_id(), LEGACY_PROFILE_ID);
        assert_eq!(reg.resolve(&legacy), dir.path());
    }

    #[test]
    fn add_switch_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let reg = AccountRegistry::load_or_init(dir.path()).unwrap();
            reg.add(AccountProfile {
                id: "acct_01".into(),
                rel_path: "profiles/acct_01".into(),
                created_at: 5,
            })
            .unwrap();
            reg.set_active("acct_01").unwrap();
        }
        let reg = AccountRegistry::load_or_init(dir.path()).unwrap();
        assert_eq!(reg.active_id(), "acct_01");
        let p = reg.get("acct_01").unwrap();
        assert_eq!(reg.resolve(&p), dir.path().join("profiles/acct_01"));
    }

    #[test]
    fn guarded_removals() {
        let dir = tempfile::tempdir().unwrap();
        let reg = AccountRegistry::load_or_init(dir.path()).unwrap();
        assert!(reg.remove(LEGACY_PROFILE_ID).is_err());

        reg.add(AccountProfile { id: "acct_x".into(), rel_path: "profiles/x".into(), created_at: 1 })
            .unwrap();
        reg.set_active("acct_x").unwrap();
        assert!(reg.remove("acct_x").is_err(), "active profile is protected");

        reg.set_active(LEGACY_PROFILE_ID).unwrap();
        reg.remove("acct_x").unwrap();
        assert!(reg.get("acct_x").is_none());
    }

    #[test]
    fn unknown_active_switch_fails() {
        let dir = tempfile::tempdir().unwrap();
        let reg = AccountRegistry::load_or_init(dir.path()).unwrap();
        assert!(matches!(reg.set_active("acct_nope"), Err(AimError::UnknownProfile(_))));
    }
}

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use aim_core::interfaces::{ContactRecord, DeviceAuth, IdentityManager};
use aim_core::types::{Fingerprint, IdentityId};
use aim_core::wire::DeviceRevocation;
use aim_core::AimError;
use serde::{Deserialize, Serialize};

use crate::keys::{KeyPair, KeyPairExport};
use crate::sign;

/// Reference identity manager: one long-term identity key, one active device
/// key, a contact book, and per-contact known-device sets. Session
/// establishment and contact-card exchange happen outside the daemon; peers
/// land here via `add_contact_by_identity_id` and `register_contact_device`.
pub struct LocalIdentityManager {
    inner: RwLock<IdentityState>,
}

struct IdentityState {
    identity: KeyPair,
    device_id: String,
    device: KeyPair,
    contacts: HashMap<IdentityId, ContactRecord>,
    /// Contact identity public keys, when known (required to verify
    /// revocations originating from that contact).
    contact_identity_keys: HashMap<IdentityId, Vec<u8>>,
    /// sender → device id → device public key.
    known_devices: HashMap<IdentityId, HashMap<String, Vec<u8>>>,
    revoked_devices: HashMap<IdentityId, HashSet<String>>,
}

#[derive(Serialize, Deserialize)]
struct IdentitySnapshot {
    identity: KeyPairExport,
    device_id: String,
    device: KeyPairExport,
    contacts: Vec<ContactRecord>,
}

impl LocalIdentityManager {
    pub fn generate() -> Self {
        let identity = KeyPair::generate();
        let device = KeyPair::generate();
        let device_id = format!("dev_{}", &hex::encode(blake3::hash(&device.public_key).as_bytes())[..12]);
        Self {
            inner: RwLock::new(IdentityState {
                identity,
                device_id,
                device,
                contacts: HashMap::new(),
                contact_identity_keys: HashMap::new(),
                known_devices: HashMap::new(),
                revoked_devices: HashMap::new(),
            }),
        }
    }

    pub fn from_snapshot(snapshot: serde_json::Value) -> Result<Self, AimError> {
        let snap: IdentitySnapshot = serde_json::from_value(snapshot)
            .map_err(|e| AimError::InvalidArgument(format!("identity snapshot: {e}")))?;
        let identity = KeyPair::import(&snap.identity)?;
        let device = KeyPair::import(&snap.device)?;
        let contacts = snap.contacts.into_iter().map(|c| (c.identity_id.clone(), c)).collect();
        Ok(Self {
            inner: RwLock::new(IdentityState {
                identity,
                device_id: snap.device_id,
                device,
                contacts,
                contact_identity_keys: HashMap::new(),
                known_devices: HashMap::new(),
                revoked_devices: HashMap::new(),
            }),
        })
    }

    pub fn device_id(&self) -> String {
        self.inner.read().unwrap().device_id.clone()
    }

    pub fn device_public_key(&self) -> Vec<u8> {
        self.inner.read().unwrap().device.public_key.clone()
    }


    /// Record a peer device key so inbound wires from it can be verified.
    pub fn register_contact_device(&self, identity: &str, device_id: &str, pubkey: Vec<u8>) {
        let mut st = self.inner.write().unwrap();
        st.known_devices
            .entry(identity.to_string())
            .or_default()
            .insert(device_id.to_string(), pubkey);
    }

    pub fn register_contact_identity_key(&self, identity: &str, pubkey: Vec<u8>) {
        let mut st = self.inner.write().unwrap();
        st.contact_identity_keys.insert(identity.to_string(), pubkey);
    }

    /// Pin a contact-card fingerprint and mark the contact verified.
    pub fn set_contact_fingerprint(&self, identity: &str, fingerprint: &str) {
        let mut st = self.inner.write().unwrap();
        if let Some(c) = st.contacts.get_mut(identity) {
            c.fingerprint = fingerprint.to_string();
            c.verified = true;
        }
    }

}

impl IdentityManager for LocalIdentityManager {
    fn identity(&self) -> IdentityId {
        self.inner.read().unwrap().identity.identity_id.clone()
    }

    fn identity_public_key_b64(&self) -> String {
        self.inner.read().unwrap().identity.public_key_b64()
    }

    fn own_fingerprint(&self) -> String {
        let st = self.inner.read().unwrap();
        Fingerprint::of(&st.identity.public_key).to_hex()
    }

    fn has_contact(&self, id: &str) -> bool {
        self.inner.read().unwrap().contacts.contains_key(id)
    }

    fn has_verified_contact(&self, id: &str) -> bool {
        self.inner.read().unwrap().contacts.get(id).map(|c| c.verified).unwrap_or(false)
    }

    fn contact(&self, id: &str) -> Option<ContactRecord> {
        self.inner.read().unwrap().contacts.get(id).cloned()
    }

    fn add_contact_by_identity_id(&self, id: &str) -> Result<(), AimError> {
        if !id.starts_with(aim_core::constants::IDENTITY_ID_PREFIX) {
            return Err(AimError::InvalidArgument(format!("not an identity id: {id}")));
        }
        let mut st = self.inner.write().unwrap();
        st.contacts.entry(id.to_string()).or_insert_with(|| ContactRecord {
            identity_id: id.to_string(),
            fingerprint: String::new(),
            verified: false,
        });
        Ok(())
    }

    fn active_device_auth(&self, payload: &[u8]) -> Result<DeviceAuth, AimError> {
        let st = self.inner.read().unwrap();
        Ok(DeviceAuth {
            device_id: st.device_id.clone(),
            signature: st.device.sign_b64(payload)?,
        })
    }

    fn verify_device(
        &self,
        sender: &str,
        device_id: &str,
        payload: &[u8],
        signature_b64: &str,
    ) -> Result<(), AimError> {
        let st = self.inner.read().unwrap();
        if st.revoked_devices.get(sender).map(|s| s.contains(device_id)).unwrap_or(false) {
            return Err(AimError::DeviceRevoked(device_id.to_string()));
        }
        match st.known_devices.get(sender) {
            // Nothing known about this sender's devices yet; there is no set
            // to check against, so the wire passes on to the policy gate.
            None => Ok(()),
            Some(devices) => {
                let pubkey = devices.get(device_id).ok_or_else(|| AimError::UnknownDevice {
                    sender: sender.to_string(),
                    device: device_id.to_string(),
                })?;
                sign::verify_detached_b64(pubkey, payload, signature_b64)
            }
        }
    }

    fn apply_device_revocation(
        &self,
        sender: &str,
        rev: &DeviceRevocation,
    ) -> Result<(), AimError> {
        let mut st = self.inner.write().unwrap();
        let payload = format!("revoke|{}|{}", rev.device_id, rev.issued_at);
        if let Some(pubkey) = st.contact_identity_keys.get(sender) {
            sign::verify_detached_b64(pubkey, payload.as_bytes(), &rev.sig)?;
        }
        st.revoked_devices.entry(sender.to_string()).or_default().insert(rev.device_id.clone());
        if let Some(devices) = st.known_devices.get_mut(sender) {
            devices.remove(&rev.device_id);
        }
        Ok(())
    }

    fn sign_with_identity(&self, payload: &[u8]) -> Result<String, AimError> {
        self.inner.read().unwrap().identity.sign_b64(payload)
    }

    fn snapshot_identity_keys(&self) -> Result<serde_json::Value, AimError> {
        let st = self.inner.read().unwrap();
        let snap = IdentitySnapshot {
            identity: st.identity.export(),
            device_id: st.device_id.clone(),
            device: st.device.export(),
            contacts: st.contacts.values().cloned().collect(),
        };
        serde_json::to_value(snap).map_err(|e| AimError::Storage(e.to_string()))
    }

    fn restore_identity_keys(&self, snapshot: serde_json::Value) -> Result<(), AimError> {
        let snap: IdentitySnapshot = serde_json::from_value(snapshot)
            .map_err(|e| AimError::InvalidArgument(format!("identity snapshot: {e}")))?;
        let identity = KeyPair::import(&snap.identity)?;
        let device = KeyPair::import(&snap.device)?;
        let mut st = self.inner.write().unwrap();
        st.identity = identity;
        st.device = device;
        st.device_id = snap.device_id;
        st.contacts = snap.contacts.into_iter().map(|c| (c.identity_id.clone(), c)).collect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_auth_round_trip() {
        let us = LocalIdentityManager::generate();
        let them = LocalIdentityManager::generate();
        let auth = them.active_device_auth(b"payload").unwrap();

        // Unknown sender devices: nothing to check against.
        assert!(us.verify_device(&them.identity(), &auth.device_id, b"payload", &auth.signature).is_ok());

        us.register_contact_device(&them.identity(), &auth.device_id, them.device_public_key());
        assert!(us.verify_device(&them.identity(), &auth.device_id, b"payload", &auth.signature).is_ok());
        assert!(us.verify_device(&them.identity(), &auth.device_id, b"other", &auth.signature).is_err());
        assert!(matches!(
            us.verify_device(&them.identity(), "dev_bogus", b"payload", &auth.signature),
            Err(AimError::UnknownDevice { .. })
        ));
    }

    #[test]
    fn revoked_device_is_rejected() {
        let us = LocalIdentityManager::generate();
        let them = LocalIdentityManager::generate();
        let auth = them.active_device_auth(b"x").unwrap();
        us.register_contact_device(&them.identity(), &auth.device_id, them.device_public_key());

        let rev = DeviceRevocation { device_id: auth.device_id.clone(), issued_at: 1, sig: String::new() };
        us.apply_device_revocation(&them.identity(), &rev).unwrap();
        assert!(matches!(
            us.verify_device(&them.identity(), &auth.device_id, b"x", &auth.signature),
            Err(AimError::DeviceRevoked(_))
        ));
    }

    #[test]
    fn snapshot_restores_identity() {
        let us = LocalIdentityManager::generate();
        us.add_contact_by_identity_id("aim1somebody").unwrap();
        let snap = us.snapshot_identity_keys().unwrap();
        let restored = LocalIdentityManager::from_snapshot(snap).unwrap();
        assert_eq!(us.identity(), restored.identity());
        assert!(restored.has_contact("aim1somebody"));
    }
}

//! The per-profile storage bundle and its swappable handle. Account
//! switching rebuilds the bundle under the new profile directory and swaps
//! the handle; capability closures capture the handle, never the service.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use aim_core::AimError;
use aim_store::{
    AttachmentStore, EnvelopeCodec, FileRedemptions, GroupStateStore, MessageStore,
    NodeBindingStore, RequestInboxStore,
};

use crate::config::ServiceConfig;

pub struct StorageBundle {
    pub dir: PathBuf,
    pub messages: MessageStore,
    pub attachments: AttachmentStore,
    pub inbox: RequestInboxStore,
    pub groups: GroupStateStore,
    pub bindings: NodeBindingStore,
    pub redemptions: FileRedemptions,
}

impl StorageBundle {
    /// Open (or create) every store under `dir`.
    pub fn open(dir: &Path, cfg: &ServiceConfig) -> Result<Self, AimError> {
        let codec = EnvelopeCodec::from_passphrase(cfg.storage_passphrase.as_deref());
        EnvelopeCodec::ensure_dir(dir)?;

        Ok(Self {
            dir: dir.to_path_buf(),
            messages: MessageStore::open(dir.join("messages.json"), codec.clone())?,
            attachments: AttachmentStore::open(
                dir.join("attachments"),
                codec.clone(),
                cfg.attachment_limits,
                cfg.hard_cap,
            )?,
            inbox: RequestInboxStore::open(dir.join("request_inbox.json"), codec.clone())?,
            groups: GroupStateStore::open(dir.join("groups.json"), codec.clone())?,
            bindings: NodeBindingStore::open(dir.join("node_bindings.json"), codec.clone())?,
            redemptions: FileRedemptions::open(dir.join("redeemed_tokens.json"), codec)?,
        })
    }

    /// Wipe all content state (messages, attachments, inbox, groups). Key
    /// material and bindings are not touched here.
    pub fn wipe_content(&self) -> Result<(), AimError> {
        self.messages.wipe()?;
        self.attachments.wipe()?;
        self.inbox.wipe()?;
        self.groups.wipe()?;
        Ok(())
    }
}

/// Swappable handle to the active bundle. Cheap to clone into closures.
#[derive(Clone)]
pub struct StoresHandle {
    inner: Arc<RwLock<Arc<StorageBundle>>>,
}

impl StoresHandle {
    pub fn new(bundle: StorageBundle) -> Self {
        Self { inner: Arc::new(RwLock::new(Arc::new(bundle))) }
    }

    pub fn current(&self) -> Arc<StorageBundle> {
        Arc::clone(&self.inner.read().unwrap())
    }

    pub fn swap(&self, bundle: StorageBundle) -> Arc<StorageBundle> {
        self.swap_arc(Arc::new(bundle))
    }

    pub fn swap_arc(&self, bundle: Arc<StorageBundle>) -> Arc<StorageBundle> {
        let mut guard = self.inner.write().unwrap();
        let previous = Arc::clone(&guard);
        *guard = bundle;
        previous
    }
}

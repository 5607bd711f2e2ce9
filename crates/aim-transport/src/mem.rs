use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use aim_core::interfaces::{
    AnnounceCallback, BlobAnnounce, BlobServeFn, FetchedBlob, InboundCallback, Transport,
    TransportState, TransportStatus,
};
use aim_core::types::{now_ms, IdentityId, Timestamp};
use aim_core::wire::PrivateEnvelope;
use aim_core::AimError;

// ── Hub ──────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct NodeSlot {
    online: bool,
    inbound: Option<InboundCallback>,
    announce_cb: Option<AnnounceCallback>,
    serve: Option<BlobServeFn>,
    /// Store-and-forward mailbox: everything ever published to this identity.
    mailbox: Vec<(Timestamp, PrivateEnvelope)>,
}

/// In-process gossip hub connecting any number of `MemTransport`s. Used by
/// tests and the diagnostics sandbox; it mirrors the store-and-forward
/// semantics of the real mesh, including a switch to sever the network.
#[derive(Default)]
pub struct MemHub {
    nodes: Mutex<HashMap<IdentityId, NodeSlot>>,
    partitioned: AtomicBool,
}

impl MemHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// While severed, every publish and fetch fails with a network error.
    pub fn sever(&self, severed: bool) {
        self.partitioned.store(severed, Ordering::SeqCst);
    }

    pub fn is_severed(&self) -> bool {
        self.partitioned.load(Ordering::SeqCst)
    }

    fn deliver(&self, env: PrivateEnvelope) -> Result<(), AimError> {
        if self.is_severed() {
            return Err(AimError::Transport("network severed".into()));
        }
        let cb = {
            let mut nodes = self.nodes.lock().unwrap();
            let slot = nodes.entry(env.recipient.clone()).or_default();
            slot.mailbox.push((now_ms(), env.clone()));
            if slot.online { slot.inbound.clone() } else { None }
        };
        if let Some(cb) = cb {
            cb(env);
        }
        Ok(())
    }

    fn broadcast_announce(&self, announce: BlobAnnounce) -> Result<(), AimError> {
        if self.is_severed() {
            return Err(AimError::Transport("network severed".into()));
        }
        let callbacks: Vec<AnnounceCallback> = {
            let nodes = self.nodes.lock().unwrap();
            nodes
                .iter()
                .filter(|(id, slot)| **id != announce.provider && slot.online)
                .filter_map(|(_, slot)| slot.announce_cb.clone())
                .collect()
        };
        for cb in callbacks {
            cb(announce.clone());
        }
        Ok(())
    }

    fn fetch_from(
        &self,
        provider: &str,
        requester: &str,
        blob_id: &str,
    ) -> Result<FetchedBlob, AimError> {
        if self.is_severed() {
            return Err(AimError::Transport("network severed".into()));
        }
        let serve = {
            let nodes = self.nodes.lock().unwrap();
            let slot = nodes
                .get(provider)
                .ok_or_else(|| AimError::Transport(format!("no such peer: {provider}")))?;
            if !slot.online {
                return Err(AimError::Transport(format!("peer offline: {provider}")));
            }
            slot.serve.clone()
        };
        match serve {
            Some(serve) => serve(requester, blob_id),
            None => Err(AimError::AttachmentTemporarilyUnavailable {
                reason: aim_core::error::UnavailableReason::ProvidersFailed,
            }),
        }
    }

    fn mailbox_since(
        &self,
        recipient: &str,
        since: Timestamp,
        max: usize,
    ) -> Vec<PrivateEnvelope> {
        let nodes = self.nodes.lock().unwrap();
        nodes
            .get(recipient)
            .map(|slot| {
                slot.mailbox
                    .iter()
                    .filter(|(at, _)| *at >= since)
                    .take(max)
                    .map(|(_, env)| env.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn online_count(&self) -> usize {
        self.nodes.lock().unwrap().values().filter(|s| s.online).count()
    }
}

// ── Transport ────────────────────────────────────────────────────────────────

/// One endpoint on a `MemHub`.
pub struct MemTransport {
    hub: Arc<MemHub>,
    identity: Mutex<Option<IdentityId>>,
    inbound: Mutex<Option<InboundCallback>>,
    announce_cb: Mutex<Option<AnnounceCallback>>,
    serve: Mutex<Option<BlobServeFn>>,
    running: AtomicBool,
}

impl MemTransport {
    pub fn new(hub: Arc<MemHub>) -> Self {
        Self {
            hub,
            identity: Mutex::new(None),
            inbound: Mutex::new(None),
            announce_cb: Mutex::new(None),
            serve: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    fn require_identity(&self) -> Result<IdentityId, AimError> {
        self.identity
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| AimError::State("no identity set".into()))
    }

    fn sync_slot(&self) {
        let Some(id) = self.identity.lock().unwrap().clone() else { return };
        let mut nodes = self.hub.nodes.lock().unwrap();
        let slot = nodes.entry(id).or_default();
        slot.online = self.running.load(Ordering::SeqCst);
        slot.inbound = self.inbound.lock().unwrap().clone();
        slot.announce_cb = self.announce_cb.lock().unwrap().clone();
        slot.serve = self.serve.lock().unwrap().clone();
    }
}

#[async_trait]
impl Transport for MemTransport {
    async fn start(&self) -> Result<(), AimError> {
        self.require_identity()?;
        self.running.store(true, Ordering::SeqCst);
        self.sync_slot();
        Ok(())
    }

    async fn stop(&self) -> Result<(), AimError> {
        self.running.store(false, Ordering::SeqCst);
        self.sync_slot();
        Ok(())
    }

    fn set_identity(&self, id: IdentityId) {
        *self.identity.lock().unwrap() = Some(id);
        self.sync_slot();
    }

    async fn listen_addresses(&self) -> Vec<String> {
        if !self.running.load(Ordering::SeqCst) {
            return Vec::new();
        }
        match self.identity.lock().unwrap().as_ref() {
            Some(id) => vec![format!("/mem/{id}")],
            None => Vec::new(),
        }
    }

    fn subscribe_private(&self, cb: InboundCallback) {
        *self.inbound.lock().unwrap() = Some(cb);
        self.sync_slot();
    }

    async fn publish_private(&self, env: PrivateEnvelope) -> Result<(), AimError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(AimError::NetworkInactive);
        }
        self.hub.deliver(env)
    }

    async fn fetch_private_since(
        &self,
        recipient: &str,
        since: Timestamp,
        max: usize,
    ) -> Result<Vec<PrivateEnvelope>, AimError> {
        Ok(self.hub.mailbox_since(recipient, since, max))
    }

    fn status(&self) -> TransportStatus {
        let running = self.running.load(Ordering::SeqCst);
        TransportStatus {
            state: if running { TransportState::Running } else { TransportState::Stopped },
            peer_count: self.hub.online_count().saturating_sub(usize::from(running)),
            last_sync: 0,
            bootstrap_peers: 0,
            bootstrap_connected: running,
        }
    }

    async fn announce_blob(&self, blob_id: &str, ttl_ms: i64) -> Result<(), AimError> {
        let provider = self.require_identity()?;
        if !self.running.load(Ordering::SeqCst) {
            return Err(AimError::NetworkInactive);
        }
        self.hub.broadcast_announce(BlobAnnounce {
            blob_id: blob_id.to_string(),
            provider,
            ttl_ms,
        })
    }

    fn subscribe_blob_announce(&self, cb: AnnounceCallback) {
        *self.announce_cb.lock().unwrap() = Some(cb);
        self.sync_slot();
    }

    fn set_blob_server(&self, serve: BlobServeFn) {
        *self.serve.lock().unwrap() = Some(serve);
        self.sync_slot();
    }

    async fn fetch_blob(&self, provider: &str, blob_id: &str) -> Result<FetchedBlob, AimError> {
        let requester = self.require_identity()?;
        self.hub.fetch_from(provider, &requester, blob_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(sender: &str, recipient: &str, body: &[u8]) -> PrivateEnvelope {
        PrivateEnvelope {
            id: format!("env-{}", hex::encode(&body[..body.len().min(4)])),
            sender_id: sender.into(),
            recipient: recipient.into(),
            payload: body.to_vec(),
        }
    }

    #[tokio::test]
    async fn publish_delivers_to_online_subscriber() {
        let hub = MemHub::new();
        let a = MemTransport::new(Arc::clone(&hub));
        let b = MemTransport::new(Arc::clone(&hub));
        a.set_identity("aim1a".into());
        b.set_identity("aim1b".into());

        let got: Arc<Mutex<Vec<PrivateEnvelope>>> = Arc::default();
        let sink = Arc::clone(&got);
        b.subscribe_private(Arc::new(move |e| sink.lock().unwrap().push(e)));

        assert!(b.listen_addresses().await.is_empty(), "no address while stopped");
        a.start().await.unwrap();
        b.start().await.unwrap();
        assert_eq!(b.listen_addresses().await, vec!["/mem/aim1b".to_string()]);

        a.publish_private(env("aim1a", "aim1b", b"hello")).await.unwrap();

        assert_eq!(got.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn offline_recipient_keeps_mail_for_fetch() {
        let hub = MemHub::new();
        let a = MemTransport::new(Arc::clone(&hub));
        let b = MemTransport::new(Arc::clone(&hub));
        a.set_identity("aim1a".into());
        b.set_identity("aim1b".into());
        a.start().await.unwrap();

        a.publish_private(env("aim1a", "aim1b", b"missed")).await.unwrap();

        let fetched = b.fetch_private_since("aim1b", 0, 10).await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].payload, b"missed");
    }

    #[tokio::test]
    async fn severed_hub_fails_publishes() {
        let hub = MemHub::new();
        let a = MemTransport::new(Arc::clone(&hub));
        a.set_identity("aim1a".into());
        a.start().await.unwrap();

        hub.sever(true);
        let err = a.publish_private(env("aim1a", "aim1b", b"x")).await.unwrap_err();
        assert!(err.is_retryable());

        hub.sever(false);
        a.publish_private(env("aim1a", "aim1b", b"x")).await.unwrap();
    }
}

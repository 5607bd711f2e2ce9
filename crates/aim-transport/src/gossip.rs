use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{
    gossipsub, identify, kad, noise, ping, tcp, yamux,
    swarm::SwarmEvent,
    Multiaddr, Swarm,
};
use rand::RngCore;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use aim_core::interfaces::{
    AnnounceCallback, BlobServeFn, FetchedBlob, InboundCallback, Transport, TransportState,
    TransportStatus,
};
use aim_core::types::{now_ms, IdentityId, Timestamp};
use aim_core::wire::PrivateEnvelope;
use aim_core::AimError;

use crate::config::TransportConfig;
use crate::payload::{private_topic, GossipPayload, ServeError, ANNOUNCE_TOPIC};

/// Largest gossip frame we will emit or accept: a blob response (attachment
/// bytes plus bincode framing). Chat wires stay within the 8 KiB padding
/// bucket; this ceiling exists for the blob exchange that shares the mesh.
const MAX_TRANSMIT_BYTES: usize = 8 * 1024 * 1024;

/// Kademlia protocol id for AIM's own DHT; keeps AIM nodes from routing
/// through unrelated libp2p networks that happen to share a bootstrap node.
const KAD_PROTOCOL: &str = "/aim/kad/1.0.0";

/// Combined libp2p network behaviour for AIM nodes.
///
/// The `#[derive(NetworkBehaviour)]` macro auto-generates an
/// `AimBehaviourEvent` enum with one variant per field.
#[derive(NetworkBehaviour)]
pub struct AimBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
}

// ── Swarm task commands ──────────────────────────────────────────────────────

enum Command {
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), String>>,
    },
    ListenAddrs {
        reply: oneshot::Sender<Vec<String>>,
    },
    Shutdown,
}

// ── Shared state ─────────────────────────────────────────────────────────────

struct Shared {
    identity: Mutex<Option<IdentityId>>,
    inbound: Mutex<Option<InboundCallback>>,
    announce_cb: Mutex<Option<AnnounceCallback>>,
    blob_server: Mutex<Option<BlobServeFn>>,
    pending_fetches: Mutex<HashMap<String, oneshot::Sender<Result<FetchedBlob, ServeError>>>>,
    /// recipient → recently seen envelopes, for `fetch_private_since`.
    retained: Mutex<HashMap<IdentityId, VecDeque<(Timestamp, PrivateEnvelope)>>>,
    retained_cap: usize,
    peer_count: AtomicUsize,
    last_sync: AtomicI64,
}

impl Shared {
    fn retain(&self, env: &PrivateEnvelope) {
        let mut retained = self.retained.lock().unwrap();
        let q = retained.entry(env.recipient.clone()).or_default();
        q.push_back((now_ms(), env.clone()));
        while q.len() > self.retained_cap {
            q.pop_front();
        }
    }
}

struct Running {
    cmd_tx: mpsc::Sender<Command>,
    join: tokio::task::JoinHandle<()>,
}

/// libp2p-backed transport. Private envelopes ride per-identity GossipSub
/// topics; we subscribe to our own topic plus the shared announce topic.
pub struct GossipTransport {
    config: TransportConfig,
    shared: Arc<Shared>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl GossipTransport {
    pub fn new(config: TransportConfig) -> Self {
        let retained_cap = config.retained_per_recipient;
        Self {
            config,
            shared: Arc::new(Shared {
                identity: Mutex::new(None),
                inbound: Mutex::new(None),
                announce_cb: Mutex::new(None),
                blob_server: Mutex::new(None),
                pending_fetches: Mutex::new(HashMap::new()),
                retained: Mutex::new(HashMap::new()),
                retained_cap,
                peer_count: AtomicUsize::new(0),
                last_sync: AtomicI64::new(0),
            }),
            running: tokio::sync::Mutex::new(None),
        }
    }

    fn build_swarm(
        &self,
    ) -> Result<Swarm<AimBehaviour>, Box<dyn std::error::Error + Send + Sync>> {
        let mut swarm = libp2p::SwarmBuilder::with_new_identity()
            .with_tokio()
            .with_tcp(
                // Receipts and revocations are latency-critical and tiny;
                // never let Nagle batch them behind a blob frame.
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )?
            .with_behaviour(|key: &libp2p::identity::Keypair| {
                // Wire ids and fetch req_ids are random per envelope, so
                // byte-identical frames on the mesh are true duplicates.
                // BLAKE3 of the frame is the message id, and the duplicate
                // cache holds ids for the replay window: a re-gossiped wire
                // dies at the mesh instead of reaching the replay guard.
                let message_id_fn = |msg: &gossipsub::Message| {
                    gossipsub::MessageId::from(blake3::hash(&msg.data).as_bytes().to_vec())
                };

                let gossipsub_config = gossipsub::ConfigBuilder::default()
                    // Per-identity topics carry sparse conversational
                    // traffic, not a firehose; a slow heartbeat keeps idle
                    // mesh chatter down.
                    .heartbeat_interval(Duration::from_secs(5))
                    .validation_mode(gossipsub::ValidationMode::Strict)
                    .message_id_fn(message_id_fn)
                    // Padded wires top out at the 8 KiB bucket; the ceiling
                    // is for blob responses riding the same mesh.
                    .max_transmit_size(MAX_TRANSMIT_BYTES)
                    .duplicate_cache_time(Duration::from_millis(
                        aim_core::constants::REPLAY_WINDOW_MS as u64,
                    ))
                    .build()
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

                let gossipsub = gossipsub::Behaviour::new(
                    gossipsub::MessageAuthenticity::Signed(key.clone()),
                    gossipsub_config,
                )
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

                let store = kad::store::MemoryStore::new(key.public().to_peer_id());
                let kademlia = kad::Behaviour::with_config(
                    key.public().to_peer_id(),
                    store,
                    kad::Config::new(libp2p::StreamProtocol::new(KAD_PROTOCOL)),
                );

                let identify = identify::Behaviour::new(
                    identify::Config::new(self.config.protocol_version.clone(), key.public())
                        .with_agent_version(format!("aim/{}", env!("CARGO_PKG_VERSION"))),
                );

                // Mostly-idle chat links; probe well under common NAT
                // mapping timeouts so dead peers fall out of the mesh.
                let ping = ping::Behaviour::new(
                    ping::Config::new().with_interval(Duration::from_secs(30)),
                );

                Ok(AimBehaviour { gossipsub, kademlia, identify, ping })
            })?
            .build();

        let listen_addr: Multiaddr = self.config.listen_addr.parse()?;
        swarm.listen_on(listen_addr)?;

        let mut bootstrap_added = false;
        for addr_str in &self.config.bootstrap_peers {
            let Ok(addr) = addr_str.parse::<Multiaddr>() else {
                warn!(addr = %addr_str, "skipping unparseable bootstrap address");
                continue;
            };
            match addr.iter().last() {
                Some(libp2p::multiaddr::Protocol::P2p(peer_id)) => {
                    swarm.behaviour_mut().kademlia.add_address(&peer_id, addr.clone());
                    bootstrap_added = true;
                    debug!(peer = %peer_id, "added bootstrap peer");
                }
                _ => warn!(addr = %addr_str, "bootstrap address lacks a /p2p peer id"),
            }
        }
        if bootstrap_added {
            if let Err(e) = swarm.behaviour_mut().kademlia.bootstrap() {
                warn!(error = %e, "kademlia bootstrap failed to start");
            }
        }

        Ok(swarm)
    }

    async fn send_command(&self, cmd: Command) -> Result<(), AimError> {
        let running = self.running.lock().await;
        let running = running.as_ref().ok_or(AimError::NetworkInactive)?;
        running
            .cmd_tx
            .send(cmd)
            .await
            .map_err(|_| AimError::Transport("transport task is gone".into()))
    }

    async fn publish_payload(&self, topic: String, payload: GossipPayload) -> Result<(), AimError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(Command::Publish { topic, data: payload.to_bytes(), reply: reply_tx })
            .await?;
        match reply_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(AimError::Transport(e)),
            Err(_) => Err(AimError::Transport("publish reply dropped".into())),
        }
    }

    /// Drive the swarm; runs as a dedicated tokio task until `Shutdown`.
    async fn run(
        mut swarm: Swarm<AimBehaviour>,
        mut cmd_rx: mpsc::Receiver<Command>,
        shared: Arc<Shared>,
    ) {
        loop {
            tokio::select! {
                Some(cmd) = cmd_rx.recv() => {
                    match cmd {
                        Command::Publish { topic, data, reply } => {
                            let topic = gossipsub::IdentTopic::new(topic);
                            let result = swarm
                                .behaviour_mut()
                                .gossipsub
                                .publish(topic, data)
                                .map(|_| ())
                                .map_err(|e| e.to_string());
                            let _ = reply.send(result);
                        }
                        Command::ListenAddrs { reply } => {
                            let addrs = swarm.listeners().map(|a| a.to_string()).collect();
                            let _ = reply.send(addrs);
                        }
                        Command::Shutdown => {
                            info!("transport task shutting down");
                            return;
                        }
                    }
                }

                event = swarm.select_next_some() => {
                    match event {
                        SwarmEvent::NewListenAddr { address, .. } => {
                            info!(addr = %address, "transport listening on");
                        }
                        SwarmEvent::Behaviour(AimBehaviourEvent::Gossipsub(
                            gossipsub::Event::Message { message, .. },
                        )) => {
                            match GossipPayload::from_bytes(&message.data) {
                                Ok(payload) => {
                                    Self::dispatch(&mut swarm, &shared, payload);
                                }
                                Err(e) => debug!(error = %e, "failed to decode gossip payload"),
                            }
                        }
                        SwarmEvent::Behaviour(AimBehaviourEvent::Identify(
                            identify::Event::Received { peer_id, info, .. },
                        )) => {
                            for addr in info.listen_addrs {
                                swarm
                                    .behaviour_mut()
                                    .kademlia
                                    .add_address(&peer_id, addr);
                            }
                        }
                        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                            shared.peer_count.fetch_add(1, Ordering::SeqCst);
                            debug!(peer = %peer_id, "connection established");
                        }
                        SwarmEvent::ConnectionClosed { peer_id, .. } => {
                            let _ = shared.peer_count.fetch_update(
                                Ordering::SeqCst,
                                Ordering::SeqCst,
                                |c| Some(c.saturating_sub(1)),
                            );
                            debug!(peer = %peer_id, "connection closed");
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    fn dispatch(swarm: &mut Swarm<AimBehaviour>, shared: &Arc<Shared>, payload: GossipPayload) {
        let our_id = shared.identity.lock().unwrap().clone();
        match payload {
            GossipPayload::Private(env) => {
                if our_id.as_deref() != Some(env.recipient.as_str()) {
                    return;
                }
                shared.retain(&env);
                shared.last_sync.store(now_ms(), Ordering::SeqCst);
                let cb = shared.inbound.lock().unwrap().clone();
                if let Some(cb) = cb {
                    cb(env);
                }
            }
            GossipPayload::Announce(a) => {
                if our_id.as_deref() == Some(a.provider.as_str()) {
                    return;
                }
                let cb = shared.announce_cb.lock().unwrap().clone();
                if let Some(cb) = cb {
                    cb(a);
                }
            }
            GossipPayload::BlobRequest { req_id, blob_id, requester } => {
                let serve = shared.blob_server.lock().unwrap().clone();
                let result = match serve {
                    Some(serve) => serve(&requester, &blob_id).map_err(|e| ServeError::from(&e)),
                    None => Err(ServeError::TemporarilyUnavailable),
                };
                let response = GossipPayload::BlobResponse { req_id, result };
                let topic = gossipsub::IdentTopic::new(private_topic(&requester));
                if let Err(e) = swarm.behaviour_mut().gossipsub.publish(topic, response.to_bytes())
                {
                    warn!(error = %e, "failed to publish blob response");
                }
            }
            GossipPayload::BlobResponse { req_id, result } => {
                let waiter = shared.pending_fetches.lock().unwrap().remove(&req_id);
                if let Some(tx) = waiter {
                    let _ = tx.send(result);
                }
            }
        }
    }
}

#[async_trait]
impl Transport for GossipTransport {
    async fn start(&self) -> Result<(), AimError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }
        let identity = self
            .shared
            .identity
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| AimError::State("transport started without an identity".into()))?;

        let mut swarm = self
            .build_swarm()
            .map_err(|e| AimError::Transport(format!("building swarm: {e}")))?;

        for topic in [private_topic(&identity), ANNOUNCE_TOPIC.to_string()] {
            swarm
                .behaviour_mut()
                .gossipsub
                .subscribe(&gossipsub::IdentTopic::new(topic))
                .map_err(|e| AimError::Transport(format!("subscribe: {e}")))?;
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let shared = Arc::clone(&self.shared);
        let join = tokio::spawn(Self::run(swarm, cmd_rx, shared));
        *running = Some(Running { cmd_tx, join });
        info!(identity = %identity, "gossip transport started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), AimError> {
        let mut running = self.running.lock().await;
        if let Some(r) = running.take() {
            let _ = r.cmd_tx.send(Command::Shutdown).await;
            if tokio::time::timeout(Duration::from_secs(5), r.join).await.is_err() {
                warn!("transport task did not stop in time");
            }
        }
        self.shared.peer_count.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn set_identity(&self, id: IdentityId) {
        *self.shared.identity.lock().unwrap() = Some(id);
    }

    async fn listen_addresses(&self) -> Vec<String> {
        // Queried through the command channel; empty while stopped.
        let (tx, rx) = oneshot::channel();
        if self.send_command(Command::ListenAddrs { reply: tx }).await.is_err() {
            return Vec::new();
        }
        match tokio::time::timeout(Duration::from_millis(500), rx).await {
            Ok(Ok(addrs)) => addrs,
            _ => Vec::new(),
        }
    }

    fn subscribe_private(&self, cb: InboundCallback) {
        *self.shared.inbound.lock().unwrap() = Some(cb);
    }

    async fn publish_private(&self, env: PrivateEnvelope) -> Result<(), AimError> {
        let topic = private_topic(&env.recipient);
        self.publish_payload(topic, GossipPayload::Private(env)).await
    }

    async fn fetch_private_since(
        &self,
        recipient: &str,
        since: Timestamp,
        max: usize,
    ) -> Result<Vec<PrivateEnvelope>, AimError> {
        let retained = self.shared.retained.lock().unwrap();
        Ok(retained
            .get(recipient)
            .map(|q| {
                q.iter()
                    .filter(|(seen_at, _)| *seen_at >= since)
                    .take(max)
                    .map(|(_, env)| env.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn status(&self) -> TransportStatus {
        let state = match self.running.try_lock() {
            Ok(guard) => {
                if guard.is_some() {
                    TransportState::Running
                } else {
                    TransportState::Stopped
                }
            }
            Err(_) => TransportState::Starting,
        };
        TransportStatus {
            state,
            peer_count: self.shared.peer_count.load(Ordering::SeqCst),
            last_sync: self.shared.last_sync.load(Ordering::SeqCst),
            bootstrap_peers: self.config.bootstrap_peers.len(),
            bootstrap_connected: self.shared.peer_count.load(Ordering::SeqCst) > 0,
        }
    }

    async fn announce_blob(&self, blob_id: &str, ttl_ms: i64) -> Result<(), AimError> {
        let provider = self
            .shared
            .identity
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| AimError::State("no identity set".into()))?;
        let announce = aim_core::interfaces::BlobAnnounce {
            blob_id: blob_id.to_string(),
            provider,
            ttl_ms,
        };
        self.publish_payload(ANNOUNCE_TOPIC.to_string(), GossipPayload::Announce(announce)).await
    }

    fn subscribe_blob_announce(&self, cb: AnnounceCallback) {
        *self.shared.announce_cb.lock().unwrap() = Some(cb);
    }

    fn set_blob_server(&self, serve: BlobServeFn) {
        *self.shared.blob_server.lock().unwrap() = Some(serve);
    }

    async fn fetch_blob(&self, provider: &str, blob_id: &str) -> Result<FetchedBlob, AimError> {
        let requester = self
            .shared
            .identity
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| AimError::State("no identity set".into()))?;

        let mut raw = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut raw);
        let req_id = hex::encode(raw);

        let (tx, rx) = oneshot::channel();
        self.shared.pending_fetches.lock().unwrap().insert(req_id.clone(), tx);

        let request = GossipPayload::BlobRequest {
            req_id: req_id.clone(),
            blob_id: blob_id.to_string(),
            requester,
        };
        if let Err(e) = self.publish_payload(private_topic(provider), request).await {
            self.shared.pending_fetches.lock().unwrap().remove(&req_id);
            return Err(e);
        }

        match tokio::time::timeout(Duration::from_secs(15), rx).await {
            Ok(Ok(result)) => result.map_err(AimError::from),
            Ok(Err(_)) => Err(AimError::Transport("blob response dropped".into())),
            Err(_) => {
                self.shared.pending_fetches.lock().unwrap().remove(&req_id);
                Err(AimError::PublishTimeout(15_000))
            }
        }
    }
}

//! aim-daemon — the AIM messaging daemon binary.
//!
//! Startup sequence:
//!   1. Freeze configuration from environment (AIM_* variables)
//!   2. Load or generate the local identity under the data dir
//!   3. Wire the service (stores, pipelines, blob subsystem)
//!   4. Start the libp2p gossip transport
//!   5. Start the JSON-RPC 2.0 server
//!   6. Run until SIGINT, then stop networking cleanly

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use aim_core::interfaces::{IdentityManager, SessionManager, Transport};
use aim_crypto::{LocalIdentityManager, LocalSessionManager};
use aim_rpc::{RpcServer, RpcServerState};
use aim_service::{Service, ServiceConfig};
use aim_store::EnvelopeCodec;
use aim_transport::{GossipTransport, TransportConfig};

#[derive(Parser, Debug)]
#[command(
    name = "aim-daemon",
    version,
    about = "AIM daemon — peer-to-peer end-to-end encrypted messaging"
)]
struct Args {
    /// Base data directory (profiles live underneath).
    #[arg(long, default_value = "~/.aim/data")]
    data_dir: PathBuf,

    /// P2P listen address.
    #[arg(long, default_value = "/ip4/0.0.0.0/tcp/7788")]
    p2p_listen: String,

    /// JSON-RPC listen address.
    #[arg(long, default_value = "127.0.0.1:8590")]
    rpc_addr: SocketAddr,

    /// Bootstrap peer multiaddresses (comma-separated).
    #[arg(long, value_delimiter = ',')]
    bootstrap: Vec<String>,

    /// Keep networking down at startup (bring it up over RPC).
    #[arg(long)]
    offline: bool,

    /// Show desktop notifications for incoming messages.
    #[arg(long)]
    notify: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,aim=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    info!("AIM daemon starting");

    // ── Frozen configuration ─────────────────────────────────────────────────
    let cfg = ServiceConfig::from_env();

    // ── Data dir & identity ──────────────────────────────────────────────────
    let data_dir = expand_tilde(&args.data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;

    let identity = Arc::new(
        load_or_generate_identity(&data_dir, cfg.storage_passphrase.as_deref())
            .context("loading identity")?,
    );
    let sessions = Arc::new(LocalSessionManager::new());

    // ── Transport ────────────────────────────────────────────────────────────
    let transport = Arc::new(GossipTransport::new(TransportConfig {
        listen_addr: args.p2p_listen.clone(),
        bootstrap_peers: args.bootstrap.clone(),
        ..TransportConfig::default()
    }));

    // ── Service ──────────────────────────────────────────────────────────────
    let service = Service::build(
        &data_dir,
        cfg,
        Arc::clone(&identity) as Arc<dyn IdentityManager>,
        Arc::clone(&sessions) as Arc<dyn SessionManager>,
        Arc::clone(&transport) as Arc<dyn Transport>,
    )
    .map_err(|e| anyhow::anyhow!("wiring service: {e}"))?;

    if args.notify {
        spawn_notifier(&service);
    }

    if !args.offline {
        service
            .start_networking()
            .await
            .map_err(|e| anyhow::anyhow!("starting networking: {e}"))?;
        for addr in transport.listen_addresses().await {
            info!(%addr, "listening");
        }
    } else {
        info!("started offline; use aim_startNetworking to go online");
    }

    // ── RPC server ───────────────────────────────────────────────────────────
    let rpc_state = Arc::new(RpcServerState { service: Arc::clone(&service) });
    let _rpc_handle = RpcServer::new(rpc_state)
        .start(args.rpc_addr)
        .await
        .context("starting RPC server")?;

    info!("daemon ready");
    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutting down");

    if let Err(e) = service.stop_networking().await {
        warn!(error = %e, "stop networking on shutdown failed");
    }
    Ok(())
}

/// Load the persisted identity snapshot, or generate and persist a new one.
fn load_or_generate_identity(
    data_dir: &Path,
    passphrase: Option<&str>,
) -> anyhow::Result<LocalIdentityManager> {
    let codec = EnvelopeCodec::from_passphrase(passphrase);
    let path = data_dir.join("identity.json");

    if let Some(bytes) = codec.read_file(&path).map_err(|e| anyhow::anyhow!("{e}"))? {
        let snapshot = serde_json::from_slice(&bytes).context("parsing identity snapshot")?;
        return LocalIdentityManager::from_snapshot(snapshot)
            .map_err(|e| anyhow::anyhow!("restoring identity: {e}"));
    }

    info!("no identity found; generating a new one");
    let manager = LocalIdentityManager::generate();
    let snapshot = manager
        .snapshot_identity_keys()
        .map_err(|e| anyhow::anyhow!("exporting identity: {e}"))?;
    let bytes = serde_json::to_vec(&snapshot)?;
    codec.write_file(&path, &bytes).map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(manager)
}

/// Surface incoming messages and security alerts as desktop notifications.
fn spawn_notifier(service: &Arc<Service>) {
    let mut events = service.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            let (summary, body) = match &event {
                aim_service::ServiceEvent::MessageReceived { message } => (
                    "New message".to_string(),
                    format!("{} bytes of {}", message.content.len(), message.content_type),
                ),
                aim_service::ServiceEvent::MessageRequestQueued { .. } => {
                    ("Message request".to_string(), "from an unknown sender".to_string())
                }
                aim_service::ServiceEvent::SecurityAlert { detail, .. } => {
                    ("Security alert".to_string(), detail.clone())
                }
                _ => continue,
            };
            if let Err(e) =
                notify_rust::Notification::new().summary(&summary).body(&body).show()
            {
                warn!(error = %e, "desktop notification failed");
            }
        }
    });
}

/// Expand a leading `~` to the user's home directory (`HOME` or `USERPROFILE`).
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}

//! aim — CLI client for a running AIM daemon.
//!
//! Talks JSON-RPC 2.0 to the daemon. Usage:
//!   aim status                 [--rpc <url>]
//!   aim send --to <id> --text <msg>
//!   aim messages --conversation <id> [--group] [--limit N]
//!   aim inbox [accept --sender <id> | decline --sender <id>]
//!   aim put-attachment --file <path> [--mime <type>]
//!   aim get-attachment --id <blob> [--out <path>]
//!   aim pin --id <blob> / aim unpin --id <blob>
//!   aim redeem-token --token <token>
//!   aim link-code [--ttl <secs>]
//!   aim unbind --node <id> --yes
//!   aim accounts / aim switch-account --id <id> / aim create-identity
//!   aim wipe --consent <token>
//!   aim export-backup --consent <token> --passphrase <pw> --out <path>
//!   aim restore-backup --consent <token> --passphrase <pw> --file <path>
//!   aim diagnostics [--window <minutes>] [--out <path>]

use std::path::PathBuf;

use anyhow::Context;
use base64::Engine as _;
use clap::{Parser, Subcommand};

mod rpc_client;
use rpc_client::DaemonRpcClient;

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "aim", version, about = "AIM CLI — talk to a running aim-daemon")]
struct Args {
    /// Daemon RPC endpoint.
    #[arg(long, global = true, default_value = "http://127.0.0.1:8590")]
    rpc: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show daemon status.
    Status,

    /// Show the daemon metrics snapshot.
    Metrics,

    /// Send a direct text message.
    Send {
        /// Recipient identity id (aim1…).
        #[arg(long)]
        to: String,
        /// Message text.
        #[arg(long)]
        text: String,
    },

    /// List messages in a conversation.
    Messages {
        #[arg(long)]
        conversation: String,
        /// Treat the conversation as a group.
        #[arg(long)]
        group: bool,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },

    /// Show queued message requests.
    Inbox,

    /// Accept a queued request thread.
    InboxAccept {
        #[arg(long)]
        sender: String,
    },

    /// Decline a queued request thread.
    InboxDecline {
        #[arg(long)]
        sender: String,
    },

    /// Add a contact by identity id.
    AddContact {
        #[arg(long)]
        id: String,
    },

    /// Store an attachment and print its blob id.
    PutAttachment {
        #[arg(long)]
        file: PathBuf,
        /// MIME type; defaults to application/octet-stream.
        #[arg(long, default_value = "application/octet-stream")]
        mime: String,
    },

    /// Fetch an attachment (local or from providers).
    GetAttachment {
        #[arg(long)]
        id: String,
        /// Write the payload here instead of stdout summary.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Pin a blob so eviction and pinned-only replication keep it.
    Pin {
        #[arg(long)]
        id: String,
    },

    /// Unpin a blob.
    Unpin {
        #[arg(long)]
        id: String,
    },

    /// Redeem a single-use enrollment token.
    RedeemToken {
        #[arg(long)]
        token: String,
    },

    /// Issue a node-binding link code.
    LinkCode {
        #[arg(long, default_value_t = 90)]
        ttl: i64,
    },

    /// Remove the active node binding.
    Unbind {
        #[arg(long)]
        node: Option<String>,
        /// Required confirmation flag.
        #[arg(long)]
        yes: bool,
    },

    /// List account profiles.
    Accounts,

    /// Switch the active account profile.
    SwitchAccount {
        #[arg(long)]
        id: String,
    },

    /// Create a fresh profile with a new identity.
    CreateIdentity,

    /// Wipe all content state (requires the consent token).
    Wipe {
        #[arg(long)]
        consent: String,
    },

    /// Export an encrypted backup bundle.
    ExportBackup {
        #[arg(long)]
        consent: String,
        #[arg(long)]
        passphrase: String,
        #[arg(long)]
        out: PathBuf,
    },

    /// Restore an encrypted backup bundle.
    RestoreBackup {
        #[arg(long)]
        consent: String,
        #[arg(long)]
        passphrase: String,
        #[arg(long)]
        file: PathBuf,
    },

    /// Export the redacted diagnostics bundle.
    Diagnostics {
        #[arg(long, default_value_t = 60)]
        window: i64,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let rpc = DaemonRpcClient::new(&args.rpc);
    let b64 = base64::engine::general_purpose::STANDARD;

    match args.command {
        Command::Status => {
            let result = rpc.call("aim_getStatus", serde_json::json!([])).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }

        Command::Metrics => {
            let result = rpc.call("aim_getMetrics", serde_json::json!([])).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }

        Command::Send { to, text } => {
            let content = b64.encode(text.as_bytes());
            let result = rpc
                .call("aim_sendMessage", serde_json::json!([to, content, "text/plain"]))
                .await?;
            println!(
                "sent {} (status: {})",
                result["id"].as_str().unwrap_or("?"),
                result["status"].as_str().unwrap_or("?")
            );
        }

        Command::Messages { conversation, group, limit, offset } => {
            let ctype = if group { "group" } else { "direct" };
            let result = rpc
                .call(
                    "aim_listMessages",
                    serde_json::json!([conversation, ctype, limit, offset]),
                )
                .await?;
            for msg in result.as_array().context("expected message list")? {
                let content = msg["content_b64"]
                    .as_str()
                    .and_then(|c| b64.decode(c).ok())
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                    .unwrap_or_default();
                println!(
                    "[{}] {} {}: {}",
                    msg["timestamp_ms"],
                    msg["direction"].as_str().unwrap_or("?"),
                    msg["status"].as_str().unwrap_or("?"),
                    content
                );
            }
        }

        Command::Inbox => {
            let result = rpc.call("aim_listInbox", serde_json::json!([])).await?;
            let threads = result.as_object().context("expected inbox map")?;
            if threads.is_empty() {
                println!("no queued requests");
            }
            for (sender, msgs) in threads {
                println!("{sender}: {} message(s)", msgs.as_array().map(|a| a.len()).unwrap_or(0));
            }
        }

        Command::InboxAccept { sender } => {
            let moved = rpc.call("aim_acceptInbox", serde_json::json!([sender])).await?;
            println!("accepted {moved} message(s)");
        }

        Command::InboxDecline { sender } => {
            rpc.call("aim_declineInbox", serde_json::json!([sender])).await?;
            println!("declined");
        }

        Command::AddContact { id } => {
            rpc.call("aim_addContact", serde_json::json!([id])).await?;
            println!("contact added");
        }

        Command::PutAttachment { file, mime } => {
            let data = std::fs::read(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "attachment".into());
            let result = rpc
                .call(
                    "aim_putAttachment",
                    serde_json::json!([name, mime, b64.encode(&data)]),
                )
                .await?;
            println!("{}", result["id"].as_str().unwrap_or("?"));
        }

        Command::GetAttachment { id, out } => {
            let result = rpc.call("aim_getAttachment", serde_json::json!([id])).await?;
            let data = result["data_b64"]
                .as_str()
                .and_then(|c| b64.decode(c).ok())
                .context("missing attachment data")?;
            match out {
                Some(path) => {
                    std::fs::write(&path, &data)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("wrote {} bytes to {}", data.len(), path.display());
                }
                None => println!(
                    "{} ({}; {} bytes)",
                    result["name"].as_str().unwrap_or("?"),
                    result["mime_type"].as_str().unwrap_or("?"),
                    data.len()
                ),
            }
        }

        Command::Pin { id } => {
            rpc.call("aim_pinBlob", serde_json::json!([id])).await?;
            println!("pinned");
        }

        Command::Unpin { id } => {
            rpc.call("aim_unpinBlob", serde_json::json!([id])).await?;
            println!("unpinned");
        }

        Command::RedeemToken { token } => {
            let result = rpc.call("aim_redeemEnrollmentToken", serde_json::json!([token])).await?;
            println!(
                "accepted into node group {}",
                result["subject_node_group"].as_str().unwrap_or("?")
            );
        }

        Command::LinkCode { ttl } => {
            let result =
                rpc.call("aim_createNodeBindingLinkCode", serde_json::json!([ttl])).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }

        Command::Unbind { node, yes } => {
            rpc.call("aim_unbindNode", serde_json::json!([node, yes])).await?;
            println!("unbound");
        }

        Command::Accounts => {
            let result = rpc.call("aim_listAccounts", serde_json::json!([])).await?;
            for acct in result.as_array().context("expected account list")? {
                let marker = if acct["active"].as_bool().unwrap_or(false) { "*" } else { " " };
                println!(
                    "{marker} {} ({})",
                    acct["id"].as_str().unwrap_or("?"),
                    acct["rel_path"].as_str().unwrap_or("?")
                );
            }
        }

        Command::SwitchAccount { id } => {
            rpc.call("aim_switchAccount", serde_json::json!([id])).await?;
            println!("switched to {id}");
        }

        Command::CreateIdentity => {
            let result = rpc.call("aim_createIdentity", serde_json::json!([])).await?;
            println!("created profile {}", result.as_str().unwrap_or("?"));
        }

        Command::Wipe { consent } => {
            rpc.call("aim_wipeData", serde_json::json!([consent])).await?;
            println!("wiped");
        }

        Command::ExportBackup { consent, passphrase, out } => {
            let result =
                rpc.call("aim_exportBackup", serde_json::json!([consent, passphrase])).await?;
            let bundle = result
                .as_str()
                .and_then(|c| b64.decode(c).ok())
                .context("missing backup bundle")?;
            std::fs::write(&out, &bundle)
                .with_context(|| format!("writing {}", out.display()))?;
            println!("wrote {} bytes to {}", bundle.len(), out.display());
        }

        Command::RestoreBackup { consent, passphrase, file } => {
            let bundle = std::fs::read(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            rpc.call(
                "aim_restoreBackup",
                serde_json::json!([consent, passphrase, b64.encode(&bundle)]),
            )
            .await?;
            println!("restored");
        }

        Command::Diagnostics { window, out } => {
            let result =
                rpc.call("aim_exportDiagnosticsBundle", serde_json::json!([window])).await?;
            let bundle = result.as_str().context("expected bundle string")?;
            match out {
                Some(path) => {
                    std::fs::write(&path, bundle)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("wrote diagnostics to {}", path.display());
                }
                None => println!("{bundle}"),
            }
        }
    }

    Ok(())
}

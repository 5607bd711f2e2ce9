//! aim-transport
//!
//! Transport implementations behind `aim_core::interfaces::Transport`.
//!
//! `GossipTransport` is the production path: libp2p GossipSub carries private
//! envelopes on per-identity topics, Kademlia handles discovery and
//! bootstrap, Identify and Ping maintain connection metadata and liveness.
//! Blob announces ride a shared topic; blob fetches are a request/response
//! exchange correlated over the per-identity topics.
//!
//! `MemHub`/`MemTransport` is the in-process variant used by tests and the
//! diagnostics sandbox: same interface, no sockets.

pub mod config;
pub mod gossip;
pub mod mem;
pub mod payload;

pub use config::TransportConfig;
pub use gossip::GossipTransport;
pub use mem::{MemHub, MemTransport};

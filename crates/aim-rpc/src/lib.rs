//! aim-rpc
//!
//! JSON-RPC 2.0 surface of the AIM daemon (jsonrpsee server). Thin
//! translation layer: every method delegates to `aim_service::Service` and
//! maps `AimError` categories onto RPC error codes.

pub mod api;
pub mod server;
pub mod types;

pub use server::{RpcServer, RpcServerState};

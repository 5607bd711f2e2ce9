//! aim-service
//!
//! The daemon core of AIM: the service orchestrator plus every subsystem it
//! composes. Durable-store wiring, rate limiters, the ephemeral public
//! cache, the blob provider registry and distribution pipeline, metadata
//! hardening, the retry scheduler, enrollment token verification, node
//! binding, public-serving autodegrade, the inbound and outbound message
//! pipelines, account profiles, metrics, and diagnostics all live here.
//!
//! The service consumes its collaborators (transport, session manager,
//! identity manager) strictly through the traits in
//! `aim_core::interfaces`; sub-systems receive narrow capability closures
//! or handles, never a reference back to the service.

pub mod acl;
pub mod backup;
pub mod binding;
pub mod blobs;
pub mod cache;
pub mod config;
pub mod degrade;
pub mod diagnostics;
pub mod enroll;
pub mod events;
pub mod harden;
pub mod inbound;
pub mod limits;
pub mod metrics;
pub mod outbound;
pub mod profiles;
pub mod providers;
pub mod replay;
pub mod sanitize;
pub mod service;
pub mod stores;

pub use config::{AclMode, PrivacyMode, ReplicationMode, RetentionMode, ServiceConfig, ServingLimits};
pub use enroll::EnrollmentClaims;
pub use events::{EventBus, ServiceEvent};
pub use metrics::MetricsSnapshot;
pub use service::Service;

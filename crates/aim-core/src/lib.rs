//! aim-core
//!
//! Shared vocabulary for the AIM daemon: identifiers, the message and
//! attachment data model, signed wire envelopes, the error taxonomy, and the
//! interface contracts consumed by the service (transport, session manager,
//! identity manager).

pub mod attachment;
pub mod cancel;
pub mod constants;
pub mod error;
pub mod interfaces;
pub mod message;
pub mod types;
pub mod wire;

pub use cancel::CancelToken;
pub use error::{AimError, ErrorCategory};
pub use types::{IdentityId, Timestamp};

//! aim-store
//!
//! Durable stores for the AIM daemon. Every store follows the same
//! discipline: mutations are staged against a scratch copy, persisted through
//! the at-rest envelope, and only then swapped into memory. A failed write
//! leaves no caller-visible change and no partial file on disk.

pub mod accounts;
pub mod attachments;
pub mod bindings;
pub mod envelope;
pub mod groups;
pub mod inbox;
pub mod messages;
pub mod redemption;

pub use accounts::{AccountProfile, AccountRegistry};
pub use attachments::AttachmentStore;
pub use bindings::{NodeBindingRecord, NodeBindingStore};
pub use envelope::EnvelopeCodec;
pub use groups::{GroupState, GroupStateStore};
pub use inbox::RequestInboxStore;
pub use messages::MessageStore;
pub use redemption::{FileRedemptions, InMemoryRedemptions, RedemptionStore};

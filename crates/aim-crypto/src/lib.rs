//! aim-crypto
//!
//! Signature and cipher primitives for the AIM daemon, plus compact reference
//! implementations of the identity and session managers behind the interface
//! contracts in `aim_core::interfaces`.
//!
//! Dilithium2 detached signatures cover identity keys, device auth, node
//! binding and enrollment tokens. ChaCha20-Poly1305 provides the at-rest
//! envelope cipher and session encryption. BLAKE3 derives keys and ids.

pub mod aead;
pub mod identity;
pub mod keys;
pub mod session;
pub mod sign;

pub use aead::StorageCipher;
pub use identity::LocalIdentityManager;
pub use keys::KeyPair;
pub use session::LocalSessionManager;
pub use sign::{sign_detached, verify_detached};

//! Cryptographic primitives and identity management.
//!
//! Signing identities (Ed25519) and the static key agreement (X25519) used to
//! derive per-pair envelope keys.

pub mod agreement;
pub mod identity;

pub use agreement::*;
pub use identity::*;

//! # Peer Courier
//!
//! A peer-to-peer messaging library: authenticated chat between two peers
//! over a pluggable transport, with signed messages, encrypted envelopes and
//! chunked file transfer.
//!
//! ## Features
//!
//! - **Connection lifecycle**: one logical connection per peer, resolving
//!   simultaneous dials and reconnecting to peers of interest
//! - **Signed messages**: Ed25519 signatures verified against handshake keys
//! - **Envelope encryption**: ChaCha20-Poly1305 with per-pair X25519 keys and
//!   an optional pre-shared compatibility key
//! - **File transfer**: ordered chunks reassembled with deadlines
//! - **Persistence**: contacts, histories and known identities in a key-value store
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use peer_courier::{MemoryNetwork, MemoryStore, MessengerConfig, Node, UserProfile};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let network = MemoryNetwork::new();
//!     let (transport, events) = network.endpoint();
//!     let profile = UserProfile::new("alice".to_string(), "Alice".to_string());
//!     let (node, handle) = Node::new(
//!         &MessengerConfig::default(),
//!         profile,
//!         transport,
//!         events,
//!         Box::new(MemoryStore::new()),
//!     )?;
//!     tokio::spawn(node.run());
//!     handle.connect("bob").await.ok();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`transport`]: routable channels between peer ids (in-memory and TCP)
//! - [`connection`]: per-peer connection state machine on top of a transport
//! - [`protocol`]: envelopes, wire frames and envelope encryption
//! - [`crypto`]: signing identities and key agreement
//! - [`transfer`]: chunking and reassembly of files
//! - [`storage`]: key-value store, identity directory and chat log
//! - [`app`]: the node actor tying everything together
//! - [`utils`]: configuration and errors

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::module_name_repetitions)]

pub mod app;
pub mod connection;
pub mod crypto;
pub mod protocol;
pub mod storage;
pub mod transfer;
pub mod transport;
pub mod utils;

// Re-export commonly used types for convenience
pub use app::{Node, NodeEvent, NodeHandle, NodeStats};
pub use connection::{ConnectionManager, ConnectionStatus};
pub use crypto::{IdentityKeyPair, UserProfile};
pub use protocol::{Envelope, EnvelopeCodec};
pub use storage::{FileStore, MemoryStore, Store};
pub use transport::{MemoryNetwork, TcpTransport, Transport, TransportEvent};
pub use utils::{MessengerConfig, MessengerError, Result};

/// Version of the envelope protocol
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Maximum frame size in bytes (1MB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Default configuration values
pub mod defaults {
    /// Default TCP listen port
    pub const DEFAULT_PORT: u16 = 4001;

    /// Default reconnect poll interval in seconds
    pub const DEFAULT_RECONNECT_INTERVAL: u64 = 5;

    /// Default backoff before retrying a taken identifier, in seconds
    pub const DEFAULT_IDENTIFIER_RETRY: u64 = 2;
}

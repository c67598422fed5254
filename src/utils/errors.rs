//! Error types and handling for the peer courier.
//!
//! Every component reports failures through [`MessengerError`]. None of them
//! is fatal to the process: callers either retry (`is_recoverable`), drop and
//! log the payload, or surface a status to the user.

use thiserror::Error;

/// Result type alias for the courier library
pub type Result<T> = std::result::Result<T, MessengerError>;

/// Comprehensive error type for all courier operations
#[derive(Error, Debug, Clone)]
pub enum MessengerError {
    /// Cryptographic operation errors
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Connection lifecycle and transport errors
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Wire protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// File transfer errors
    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// Configuration and I/O errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Persistent store errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Base64 encoding/decoding errors
    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The node actor is gone (shut down or crashed)
    #[error("Node is not running")]
    NodeStopped,

    /// Generic error for unexpected conditions
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

/// Cryptographic operation errors
#[derive(Error, Debug, Clone)]
pub enum CryptoError {
    /// Invalid key format or size
    #[error("Invalid key: {reason}")]
    InvalidKey { reason: String },

    /// Signature verification failure
    #[error("Signature verification failed")]
    SignatureVerification,

    /// Encryption operation failure
    #[error("Encryption failed: {reason}")]
    Encryption { reason: String },

    /// Payload could not be decrypted with the selected key
    #[error("Decryption failed: {reason}")]
    Decryption { reason: String },

    /// Key derivation failure
    #[error("Key derivation failed: {reason}")]
    KeyDerivation { reason: String },
}

/// Connection lifecycle and transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Send attempted without an open channel to the peer
    #[error("Not connected to {peer_id}")]
    NotConnected { peer_id: String },

    /// Dial target does not exist or is unreachable
    #[error("Peer {peer_id} is unavailable: {reason}")]
    PeerUnavailable { peer_id: String, reason: String },

    /// The local identifier is still claimed by a stale session
    #[error("Identifier {id} is already taken")]
    IdentifierTaken { id: String },

    /// Registration with the rendezvous layer failed for another reason
    #[error("Registration failed: {reason}")]
    Registration { reason: String },

    /// Channel-level transport failure
    #[error("Transport error: {reason}")]
    Transport { reason: String },

    /// Channel id is not known to the transport
    #[error("Unknown channel {channel}")]
    UnknownChannel { channel: u64 },
}

/// Wire protocol errors
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    /// Invalid frame or envelope format
    #[error("Invalid message format: {reason}")]
    InvalidMessage { reason: String },

    /// Frame too large
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Envelope cannot be carried by the requested frame type
    #[error("Unsupported frame: {reason}")]
    UnsupportedFrame { reason: String },
}

/// File transfer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// Chunk or end marker for a transfer that was never started
    #[error("Unknown transfer: {file_id}")]
    UnknownTransfer { file_id: String },

    /// End marker arrived before every chunk did
    #[error("Transfer {file_id} incomplete: received {received} of {total} chunks")]
    Incomplete {
        file_id: String,
        received: u32,
        total: u32,
    },

    /// Chunk index outside `0..total_chunks`
    #[error("Chunk {index} out of range for transfer {file_id} ({total} chunks)")]
    ChunkOutOfRange {
        file_id: String,
        index: u32,
        total: u32,
    },

    /// Transfer evicted after its deadline
    #[error("Transfer {file_id} expired")]
    Expired { file_id: String },

    /// File exceeds the configured maximum
    #[error("File too large: {size} bytes (max: {max})")]
    TooLarge { size: u64, max: u64 },

    /// Chunks carry more bytes than the announced file size
    #[error("Transfer {file_id} received {received} bytes, more than the announced {size}")]
    SizeExceeded {
        file_id: String,
        received: u64,
        size: u64,
    },

    /// Sender already has the maximum number of transfers in flight
    #[error("Too many transfers in flight from {peer_id} (limit {limit})")]
    TooManyTransfers { peer_id: String, limit: usize },
}

/// Configuration and setup errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Configuration parsing error
    #[error("Configuration parse error: {reason}")]
    ParseError { reason: String },

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Directory creation failure
    #[error("Failed to create directory: {path}")]
    DirectoryCreation { path: String },
}

/// Persistent store errors
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    /// Key contains characters the backend cannot represent
    #[error("Invalid storage key: {key}")]
    InvalidKey { key: String },

    /// Stored value could not be read back
    #[error("Corrupt value under {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// Contact cannot be added
    #[error("Invalid contact {id}: {reason}")]
    InvalidContact { id: String, reason: String },
}

impl MessengerError {
    /// Creates a new unexpected error with a custom message
    pub fn unexpected<S: Into<String>>(msg: S) -> Self {
        Self::Unexpected(msg.into())
    }

    /// Returns true if this error is recoverable by retrying later
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Connection(ConnectionError::NotConnected { .. })
                | Self::Connection(ConnectionError::IdentifierTaken { .. })
                | Self::Connection(ConnectionError::Transport { .. })
        )
    }

    /// Short explanation for the user, for connection failures
    pub fn user_hint(&self) -> Option<&'static str> {
        match self {
            Self::Connection(ConnectionError::PeerUnavailable { .. })
            | Self::Connection(ConnectionError::NotConnected { .. }) => {
                Some("The peer is offline or unreachable")
            }
            Self::Connection(ConnectionError::IdentifierTaken { .. }) => {
                Some("This id is still in use by another session")
            }
            Self::Connection(
                ConnectionError::Transport { .. }
                | ConnectionError::Registration { .. }
                | ConnectionError::UnknownChannel { .. },
            )
            | Self::Io(_) => Some("Network problem; try again"),
            _ => None,
        }
    }

    /// Returns true if this error indicates a forged or tampered payload
    pub fn is_security_violation(&self) -> bool {
        matches!(
            self,
            Self::Crypto(CryptoError::SignatureVerification)
                | Self::Crypto(CryptoError::Decryption { .. })
        )
    }
}

impl From<std::io::Error> for MessengerError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for MessengerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

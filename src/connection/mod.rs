//! Peer connection lifecycle.

pub mod manager;
pub mod status;

pub use manager::{ConnectionManager, EnvelopeObserver, Inbound, StatusObserver};
pub use status::{
    ConnectionInfo, ConnectionStats, ConnectionStatus, PeerConnection, RegistrationState,
};

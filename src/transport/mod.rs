//! Transport layer for peer-to-peer messaging.
//!
//! A [`Transport`] moves opaque string frames over channels between peer
//! ids. Calls never block: dialing, registration and delivery complete
//! asynchronously and are reported as [`TransportEvent`]s on the receiver
//! returned by each implementation's constructor.
//!
//! Channels are ordered and reliable, but nothing stops two channels to the
//! same peer from being open at once. Picking one is the connection
//! manager's job.

pub mod memory;
pub mod tcp;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::TcpTransport;

use crate::utils::{ConnectionError, Result};
use std::fmt;

/// Identifier of one transport channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// Something that happened on the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The local identifier is registered and reachable
    Registered {
        /// Registered identifier
        local_id: String,
    },
    /// Registration of the local identifier failed
    RegistrationFailed {
        /// Why
        error: ConnectionError,
    },
    /// A remote peer opened a channel to us
    Incoming {
        /// New channel
        channel: ChannelId,
        /// Remote peer id
        peer_id: String,
    },
    /// A channel is ready to carry data
    Open {
        /// Opened channel
        channel: ChannelId,
    },
    /// One frame arrived
    Data {
        /// Source channel
        channel: ChannelId,
        /// Raw frame
        payload: String,
    },
    /// A channel was closed by either side
    Closed {
        /// Closed channel
        channel: ChannelId,
    },
    /// A channel failed
    Error {
        /// Failed channel
        channel: ChannelId,
        /// Why
        error: ConnectionError,
    },
}

/// Channel-oriented transport
pub trait Transport: Send {
    /// Claim `local_id`. The outcome arrives as `Registered` or
    /// `RegistrationFailed`.
    fn register(&mut self, local_id: &str) -> Result<()>;

    /// Open a channel to `peer_id`. `Open` follows once it is usable.
    fn dial(&mut self, peer_id: &str) -> Result<ChannelId>;

    /// Queue one frame on `channel`
    fn send(&mut self, channel: ChannelId, payload: String) -> Result<()>;

    /// Close `channel`; both ends observe `Closed`
    fn close(&mut self, channel: ChannelId) -> Result<()>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn register(&mut self, local_id: &str) -> Result<()> {
        (**self).register(local_id)
    }

    fn dial(&mut self, peer_id: &str) -> Result<ChannelId> {
        (**self).dial(peer_id)
    }

    fn send(&mut self, channel: ChannelId, payload: String) -> Result<()> {
        (**self).send(channel, payload)
    }

    fn close(&mut self, channel: ChannelId) -> Result<()> {
        (**self).close(channel)
    }
}

//! Per-peer connection state.

use crate::transport::ChannelId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of the logical connection to one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// No channel
    Disconnected,
    /// A channel has been dialed or accepted but is not open yet
    Connecting,
    /// The table channel is open
    Connected,
    /// The table channel failed; the next reconnect poll retries
    Error,
}

impl ConnectionStatus {
    /// Whether a reconnect poll should dial this peer
    pub fn needs_dial(self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// The single table entry for a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConnection {
    /// Remote peer id
    pub peer_id: String,
    /// Channel that represents the connection
    pub channel: ChannelId,
    /// Current status
    pub status: ConnectionStatus,
    /// When the entry last changed status
    pub since: chrono::DateTime<chrono::Utc>,
}

impl PeerConnection {
    pub(crate) fn new(peer_id: &str, channel: ChannelId, status: ConnectionStatus) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            channel,
            status,
            since: chrono::Utc::now(),
        }
    }
}

/// Snapshot of one peer's connection for callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Remote peer id
    pub peer_id: String,
    /// Current status
    pub status: ConnectionStatus,
    /// Table channel
    pub channel: Option<u64>,
    /// Open channels to the same peer that are not the table channel
    pub standby: usize,
}

/// Progress of local identifier registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationState {
    /// `register` not called yet
    Unregistered,
    /// Waiting for the transport's answer
    Pending {
        /// Attempts made so far, including the pending one
        attempts: u32,
    },
    /// Identifier was taken; a retry is due
    RetryScheduled {
        /// Attempts made so far
        attempts: u32,
    },
    /// Registered and reachable
    Registered,
    /// Gave up
    Failed {
        /// Last failure
        reason: String,
    },
}

/// Connection manager statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStats {
    /// Table entries
    pub peers: usize,
    /// Entries with status `Connected`
    pub connected: usize,
    /// Entries with status `Connecting`
    pub connecting: usize,
    /// Entries with status `Error`
    pub errored: usize,
    /// Open channels that are not table channels
    pub standby_channels: usize,
    /// Peers the reconnect poll is watching
    pub interested: usize,
    /// Frames written to the transport
    pub frames_sent: u64,
    /// Frames decoded successfully
    pub frames_received: u64,
    /// Frames dropped because they failed to decode or decrypt
    pub frames_rejected: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_dial() {
        assert!(ConnectionStatus::Disconnected.needs_dial());
        assert!(ConnectionStatus::Error.needs_dial());
        assert!(!ConnectionStatus::Connecting.needs_dial());
        assert!(!ConnectionStatus::Connected.needs_dial());
    }

    #[test]
    fn test_display_matches_serde() {
        let json = serde_json::to_string(&ConnectionStatus::Connected).unwrap();
        assert_eq!(json, format!("\"{}\"", ConnectionStatus::Connected));
    }
}

//! Connection lifecycle management.
//!
//! The [`ConnectionManager`] keeps exactly one table entry per peer id, no
//! matter how many transport channels to that peer are being dialed,
//! accepted, opened or torn down at the same time.
//!
//! Races are resolved as follows:
//!
//! * an inbound channel from a peer that is already `Connected` is closed
//!   straight away;
//! * while a peer is `Connecting` or in `Error`, every channel proceeds and
//!   each `Open` takes over the table entry (last open wins);
//! * a displaced channel stays open as a standby. Its data is still
//!   accepted, and it is promoted when the table channel closes.
//!
//! Every channel that opens carries our handshake before anything else.

use crate::connection::status::{
    ConnectionInfo, ConnectionStats, ConnectionStatus, PeerConnection, RegistrationState,
};
use crate::protocol::{Envelope, EnvelopeCodec};
use crate::transport::{ChannelId, Transport, TransportEvent};
use crate::utils::{ConnectionError, MessengerError, Result};
use std::collections::{BTreeSet, HashMap};

/// Callback for status changes of one peer
pub type StatusObserver = Box<dyn FnMut(&str, ConnectionStatus) + Send>;

/// Callback for envelopes received from one peer
pub type EnvelopeObserver = Box<dyn FnMut(&str, &Envelope) + Send>;

/// What a transport event meant for the node
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A decoded envelope from a peer
    Envelope {
        /// Sender
        peer_id: String,
        /// Decoded envelope
        envelope: Envelope,
    },
    /// A peer's connection status changed
    StatusChanged {
        /// Peer
        peer_id: String,
        /// New status
        status: ConnectionStatus,
    },
    /// The local identifier is registered
    Registered {
        /// Registered identifier
        local_id: String,
    },
    /// Registration failed
    RegistrationFailed {
        /// Transport error
        error: ConnectionError,
        /// Whether a retry should be scheduled
        retry: bool,
    },
}

#[derive(Debug, Clone)]
struct ChannelState {
    peer_id: String,
    open: bool,
}

/// One logical connection per peer over a [`Transport`]
pub struct ConnectionManager<T: Transport> {
    transport: T,
    codec: EnvelopeCodec,
    handshake: Envelope,
    local_id: String,
    identifier_retry_limit: Option<u32>,
    registration: RegistrationState,
    table: HashMap<String, PeerConnection>,
    channels: HashMap<ChannelId, ChannelState>,
    interest: BTreeSet<String>,
    focus: Option<String>,
    status_observers: HashMap<String, Vec<StatusObserver>>,
    envelope_observers: HashMap<String, Vec<EnvelopeObserver>>,
    frames_sent: u64,
    frames_received: u64,
    frames_rejected: u64,
}

impl<T: Transport> std::fmt::Debug for ConnectionManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("local_id", &self.local_id)
            .field("registration", &self.registration)
            .field("table", &self.table)
            .field("channels", &self.channels.len())
            .field("interest", &self.interest)
            .field("focus", &self.focus)
            .finish()
    }
}

impl<T: Transport> ConnectionManager<T> {
    /// Create a manager.
    ///
    /// `handshake` is sent on every channel that opens.
    pub fn new(
        transport: T,
        codec: EnvelopeCodec,
        handshake: Envelope,
        local_id: &str,
        identifier_retry_limit: Option<u32>,
    ) -> Self {
        Self {
            transport,
            codec,
            handshake,
            local_id: local_id.to_string(),
            identifier_retry_limit,
            registration: RegistrationState::Unregistered,
            table: HashMap::new(),
            channels: HashMap::new(),
            interest: BTreeSet::new(),
            focus: None,
            status_observers: HashMap::new(),
            envelope_observers: HashMap::new(),
            frames_sent: 0,
            frames_received: 0,
            frames_rejected: 0,
        }
    }

    /// Local peer id
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Envelope codec
    pub fn codec(&self) -> &EnvelopeCodec {
        &self.codec
    }

    /// Registration progress
    pub fn registration(&self) -> &RegistrationState {
        &self.registration
    }

    /// Ask the transport to register the local id
    pub fn register(&mut self) -> Result<()> {
        let attempts = match self.registration {
            RegistrationState::Pending { attempts } | RegistrationState::RetryScheduled { attempts } => {
                attempts + 1
            }
            _ => 1,
        };

        log::info!("Registering as {} (attempt {})", self.local_id, attempts);
        self.registration = RegistrationState::Pending { attempts };
        self.transport.register(&self.local_id)
    }

    /// Re-register if a retry is due. Returns whether one was attempted.
    pub fn retry_registration(&mut self) -> Result<bool> {
        if matches!(self.registration, RegistrationState::RetryScheduled { .. }) {
            self.register()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Make sure a connection to `peer_id` exists or is being established.
    ///
    /// Marks the peer as of interest for reconnect polling. Returns the
    /// current status without dialing if a live entry exists.
    pub fn ensure_connected(&mut self, peer_id: &str) -> Result<ConnectionStatus> {
        if peer_id == self.local_id {
            return Err(ConnectionError::PeerUnavailable {
                peer_id: peer_id.to_string(),
                reason: "cannot connect to self".to_string(),
            }
            .into());
        }

        self.interest.insert(peer_id.to_string());

        if let Some(entry) = self.table.get(peer_id) {
            if !entry.status.needs_dial() {
                return Ok(entry.status);
            }
        }

        let channel = self.transport.dial(peer_id).map_err(|e| match e {
            MessengerError::Connection(ConnectionError::PeerUnavailable { .. }) => e,
            other => ConnectionError::PeerUnavailable {
                peer_id: peer_id.to_string(),
                reason: other.to_string(),
            }
            .into(),
        })?;

        log::debug!("Dialed {} on {}", peer_id, channel);
        self.channels.insert(
            channel,
            ChannelState {
                peer_id: peer_id.to_string(),
                open: false,
            },
        );
        self.set_entry(peer_id, channel, ConnectionStatus::Connecting);
        Ok(ConnectionStatus::Connecting)
    }

    /// Encode and send `envelope` to a connected peer
    pub fn send(&mut self, peer_id: &str, envelope: &Envelope) -> Result<()> {
        let channel = match self.table.get(peer_id) {
            Some(entry) if entry.status == ConnectionStatus::Connected => entry.channel,
            _ => {
                return Err(ConnectionError::NotConnected {
                    peer_id: peer_id.to_string(),
                }
                .into())
            }
        };

        let frame = self.codec.encode(peer_id, envelope)?;
        match self.transport.send(channel, frame.clone()) {
            Ok(()) => {
                self.frames_sent += 1;
                Ok(())
            }
            Err(e) => {
                let Some(standby) = self.standby_for(peer_id).first().copied() else {
                    return Err(e);
                };

                log::debug!(
                    "Send on {} to {} failed ({}), switching to standby {}",
                    channel,
                    peer_id,
                    e,
                    standby
                );
                self.channels.remove(&channel);
                self.set_entry(peer_id, standby, ConnectionStatus::Connected);
                self.transport.send(standby, frame)?;
                self.frames_sent += 1;
                Ok(())
            }
        }
    }

    /// Register a status observer for `peer_id`
    pub fn on_status_change(&mut self, peer_id: &str, observer: StatusObserver) {
        self.status_observers
            .entry(peer_id.to_string())
            .or_default()
            .push(observer);
    }

    /// Register an envelope observer for `peer_id`
    pub fn on_envelope(&mut self, peer_id: &str, observer: EnvelopeObserver) {
        self.envelope_observers
            .entry(peer_id.to_string())
            .or_default()
            .push(observer);
    }

    /// Change the focused peer. Existing connections stay open.
    pub fn set_focus(&mut self, peer_id: Option<&str>) {
        if let Some(previous) = self.focus.take() {
            if Some(previous.as_str()) != peer_id {
                self.interest.remove(&previous);
            }
        }
        if let Some(peer_id) = peer_id {
            self.interest.insert(peer_id.to_string());
        }
        self.focus = peer_id.map(str::to_string);
    }

    /// Currently focused peer
    pub fn focus(&self) -> Option<&str> {
        self.focus.as_deref()
    }

    /// Stop reconnect polling for `peer_id`
    pub fn cancel_interest(&mut self, peer_id: &str) {
        self.interest.remove(peer_id);
        if self.focus.as_deref() == Some(peer_id) {
            self.focus = None;
        }
    }

    /// Whether reconnect polling covers `peer_id`
    pub fn is_interested(&self, peer_id: &str) -> bool {
        self.interest.contains(peer_id)
    }

    /// One reconnect tick: dial every peer of interest without a live entry.
    ///
    /// Returns the peers that were dialed.
    pub fn poll_reconnect(&mut self) -> Vec<String> {
        let due: Vec<String> = self
            .interest
            .iter()
            .filter(|peer| self.status(peer).needs_dial())
            .cloned()
            .collect();

        let mut dialed = Vec::new();
        for peer_id in due {
            match self.ensure_connected(&peer_id) {
                Ok(_) => dialed.push(peer_id),
                Err(e) => log::debug!("Reconnect to {} failed: {}", peer_id, e),
            }
        }
        dialed
    }

    /// Feed one transport event through the state machine
    pub fn handle_event(&mut self, event: TransportEvent) -> Option<Inbound> {
        match event {
            TransportEvent::Registered { local_id } => {
                log::info!("Registered as {}", local_id);
                self.registration = RegistrationState::Registered;
                Some(Inbound::Registered { local_id })
            }
            TransportEvent::RegistrationFailed { error } => Some(self.on_registration_failed(error)),
            TransportEvent::Incoming { channel, peer_id } => self.on_incoming(channel, peer_id),
            TransportEvent::Open { channel } => self.on_open(channel),
            TransportEvent::Data { channel, payload } => self.on_data(channel, &payload),
            TransportEvent::Closed { channel } => self.on_closed(channel),
            TransportEvent::Error { channel, error } => self.on_error(channel, error),
        }
    }

    /// Status of `peer_id`; `Disconnected` when there is no entry
    pub fn status(&self, peer_id: &str) -> ConnectionStatus {
        self.table
            .get(peer_id)
            .map(|entry| entry.status)
            .unwrap_or(ConnectionStatus::Disconnected)
    }

    /// Snapshot of the connection to `peer_id`
    pub fn connection(&self, peer_id: &str) -> Option<ConnectionInfo> {
        self.table.get(peer_id).map(|entry| ConnectionInfo {
            peer_id: entry.peer_id.clone(),
            status: entry.status,
            channel: Some(entry.channel.0),
            standby: self.standby_for(peer_id).len(),
        })
    }

    /// Peers with status `Connected`, sorted
    pub fn connected_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .table
            .values()
            .filter(|entry| entry.status == ConnectionStatus::Connected)
            .map(|entry| entry.peer_id.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Close every channel to `peer_id` and stop polling for it
    pub fn close(&mut self, peer_id: &str) -> Result<()> {
        self.cancel_interest(peer_id);

        let channels: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|(_, state)| state.peer_id == peer_id)
            .map(|(channel, _)| *channel)
            .collect();
        for channel in channels {
            self.channels.remove(&channel);
            if let Err(e) = self.transport.close(channel) {
                log::debug!("Closing {} failed: {}", channel, e);
            }
        }

        self.remove_entry(peer_id);
        Ok(())
    }

    /// Close every connection
    pub fn close_all(&mut self) {
        let peers: Vec<String> = self.table.keys().cloned().collect();
        for peer_id in peers {
            if let Err(e) = self.close(&peer_id) {
                log::debug!("Closing {} failed: {}", peer_id, e);
            }
        }
    }

    /// Counters and table summary
    pub fn stats(&self) -> ConnectionStats {
        let count = |status| self.table.values().filter(|e| e.status == status).count();
        ConnectionStats {
            peers: self.table.len(),
            connected: count(ConnectionStatus::Connected),
            connecting: count(ConnectionStatus::Connecting),
            errored: count(ConnectionStatus::Error),
            standby_channels: self
                .channels
                .iter()
                .filter(|(channel, state)| {
                    state.open
                        && self
                            .table
                            .get(&state.peer_id)
                            .map(|entry| entry.channel != **channel)
                            .unwrap_or(true)
                })
                .count(),
            interested: self.interest.len(),
            frames_sent: self.frames_sent,
            frames_received: self.frames_received,
            frames_rejected: self.frames_rejected,
        }
    }

    fn on_registration_failed(&mut self, error: ConnectionError) -> Inbound {
        let retry = match &error {
            ConnectionError::IdentifierTaken { .. } => {
                let attempts = match self.registration {
                    RegistrationState::Pending { attempts }
                    | RegistrationState::RetryScheduled { attempts } => attempts,
                    _ => 1,
                };
                self.identifier_retry_limit
                    .map_or(true, |limit| attempts < limit)
                    .then_some(attempts)
            }
            _ => None,
        };

        match retry {
            Some(attempts) => {
                log::warn!("{}; retrying registration", error);
                self.registration = RegistrationState::RetryScheduled { attempts };
            }
            None => {
                log::error!("Registration failed: {}", error);
                self.registration = RegistrationState::Failed {
                    reason: error.to_string(),
                };
            }
        }

        Inbound::RegistrationFailed {
            error,
            retry: retry.is_some(),
        }
    }

    fn on_incoming(&mut self, channel: ChannelId, peer_id: String) -> Option<Inbound> {
        if self.status(&peer_id) == ConnectionStatus::Connected {
            log::debug!("Already connected to {}, closing inbound {}", peer_id, channel);
            if let Err(e) = self.transport.close(channel) {
                log::debug!("Closing {} failed: {}", channel, e);
            }
            return None;
        }

        log::debug!("Inbound {} from {}", channel, peer_id);
        self.channels.insert(
            channel,
            ChannelState {
                peer_id: peer_id.clone(),
                open: false,
            },
        );

        match self.status(&peer_id) {
            ConnectionStatus::Connecting => None,
            _ => self.set_entry(&peer_id, channel, ConnectionStatus::Connecting),
        }
    }

    fn on_open(&mut self, channel: ChannelId) -> Option<Inbound> {
        let Some(state) = self.channels.get_mut(&channel) else {
            log::debug!("Ignoring open on unknown {}", channel);
            return None;
        };
        state.open = true;
        let peer_id = state.peer_id.clone();

        self.send_handshake(channel, &peer_id);

        if let Some(entry) = self.table.get(&peer_id) {
            if entry.channel != channel && entry.status == ConnectionStatus::Connected {
                log::debug!(
                    "{} takes over {} from {}; keeping it as standby",
                    channel,
                    peer_id,
                    entry.channel
                );
            }
        }
        self.set_entry(&peer_id, channel, ConnectionStatus::Connected)
    }

    fn on_data(&mut self, channel: ChannelId, payload: &str) -> Option<Inbound> {
        let Some(peer_id) = self.channels.get(&channel).map(|s| s.peer_id.clone()) else {
            log::debug!("Dropping {} bytes on unknown {}", payload.len(), channel);
            return None;
        };

        let envelope = match self.codec.decode(&peer_id, payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.frames_rejected += 1;
                if e.is_security_violation() {
                    log::warn!("Dropping frame from {}: {}", peer_id, e);
                } else {
                    log::debug!("Dropping frame from {}: {}", peer_id, e);
                }
                return None;
            }
        };
        self.frames_received += 1;

        if let Envelope::Handshake(handshake) = &envelope {
            if let Some(key) = &handshake.agreement_key {
                if let Err(e) = self.codec.learn_agreement_key(&peer_id, key) {
                    log::warn!("Ignoring agreement key from {}: {}", peer_id, e);
                }
            }
        }

        if let Some(observers) = self.envelope_observers.get_mut(&peer_id) {
            for observer in observers.iter_mut() {
                observer(&peer_id, &envelope);
            }
        }

        Some(Inbound::Envelope { peer_id, envelope })
    }

    fn on_closed(&mut self, channel: ChannelId) -> Option<Inbound> {
        let state = self.channels.remove(&channel)?;
        log::debug!("{} to {} closed", channel, state.peer_id);
        self.replace_table_channel(&state.peer_id, channel, None)
    }

    fn on_error(&mut self, channel: ChannelId, error: ConnectionError) -> Option<Inbound> {
        let Some(state) = self.channels.remove(&channel) else {
            log::debug!("Ignoring error on unknown {}: {}", channel, error);
            return None;
        };
        log::warn!("{} to {} failed: {}", channel, state.peer_id, error);

        if let Err(e) = self.transport.close(channel) {
            log::debug!("Closing {} failed: {}", channel, e);
        }
        self.replace_table_channel(&state.peer_id, channel, Some(ConnectionStatus::Error))
    }

    /// `channel` has gone away. If it was the table channel, promote a
    /// standby, fall back to a pending channel, or settle on `fallback`
    /// (removing the entry when `fallback` is `None`).
    fn replace_table_channel(
        &mut self,
        peer_id: &str,
        channel: ChannelId,
        fallback: Option<ConnectionStatus>,
    ) -> Option<Inbound> {
        match self.table.get(peer_id) {
            Some(entry) if entry.channel == channel => {}
            _ => return None,
        }

        if let Some(standby) = self.standby_for(peer_id).first().copied() {
            log::debug!("Promoting standby {} for {}", standby, peer_id);
            return self.set_entry(peer_id, standby, ConnectionStatus::Connected);
        }

        if let Some(pending) = self.pending_for(peer_id).first().copied() {
            return self.set_entry(peer_id, pending, ConnectionStatus::Connecting);
        }

        match fallback {
            Some(status) => self.set_entry(peer_id, channel, status),
            None => self.remove_entry(peer_id),
        }
    }

    fn send_handshake(&mut self, channel: ChannelId, peer_id: &str) {
        let frame = match self.codec.encode(peer_id, &self.handshake) {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Cannot encode handshake: {}", e);
                return;
            }
        };
        match self.transport.send(channel, frame) {
            Ok(()) => self.frames_sent += 1,
            Err(e) => log::debug!("Handshake on {} to {} failed: {}", channel, peer_id, e),
        }
    }

    fn standby_for(&self, peer_id: &str) -> Vec<ChannelId> {
        self.other_channels(peer_id, true)
    }

    fn pending_for(&self, peer_id: &str) -> Vec<ChannelId> {
        self.other_channels(peer_id, false)
    }

    fn other_channels(&self, peer_id: &str, open: bool) -> Vec<ChannelId> {
        let table_channel = self.table.get(peer_id).map(|entry| entry.channel);
        let mut channels: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|(channel, state)| {
                state.peer_id == peer_id && state.open == open && Some(**channel) != table_channel
            })
            .map(|(channel, _)| *channel)
            .collect();
        channels.sort();
        channels
    }

    fn set_entry(
        &mut self,
        peer_id: &str,
        channel: ChannelId,
        status: ConnectionStatus,
    ) -> Option<Inbound> {
        let previous = self.table.get(peer_id).map(|entry| entry.status);
        match self.table.get_mut(peer_id) {
            Some(entry) => {
                entry.channel = channel;
                if entry.status != status {
                    entry.status = status;
                    entry.since = chrono::Utc::now();
                }
            }
            None => {
                self.table
                    .insert(peer_id.to_string(), PeerConnection::new(peer_id, channel, status));
            }
        }

        if previous == Some(status) {
            return None;
        }
        log::info!("{} is now {}", peer_id, status);
        self.notify_status(peer_id, status);
        Some(Inbound::StatusChanged {
            peer_id: peer_id.to_string(),
            status,
        })
    }

    fn remove_entry(&mut self, peer_id: &str) -> Option<Inbound> {
        self.table.remove(peer_id)?;
        log::info!("{} is now {}", peer_id, ConnectionStatus::Disconnected);
        self.notify_status(peer_id, ConnectionStatus::Disconnected);
        Some(Inbound::StatusChanged {
            peer_id: peer_id.to_string(),
            status: ConnectionStatus::Disconnected,
        })
    }

    fn notify_status(&mut self, peer_id: &str, status: ConnectionStatus) {
        if let Some(observers) = self.status_observers.get_mut(peer_id) {
            for observer in observers.iter_mut() {
                observer(peer_id, status);
            }
        }
    }

    #[cfg(test)]
    fn check_invariants(&self) -> std::result::Result<(), String> {
        for (peer_id, entry) in &self.table {
            if &entry.peer_id != peer_id {
                return Err(format!("entry for {peer_id} names {}", entry.peer_id));
            }
            match (entry.status, self.channels.get(&entry.channel)) {
                (ConnectionStatus::Connected, Some(state)) if state.open && &state.peer_id == peer_id => {}
                (ConnectionStatus::Connecting, Some(state)) if &state.peer_id == peer_id => {}
                (ConnectionStatus::Error, _) => {}
                (status, state) => {
                    return Err(format!("{peer_id} is {status} on {} ({state:?})", entry.channel))
                }
            }
        }

        let mut table_channels: Vec<ChannelId> = self.table.values().map(|e| e.channel).collect();
        table_channels.sort();
        let before = table_channels.len();
        table_channels.dedup();
        if before != table_channels.len() {
            return Err("channel shared by two table entries".to_string());
        }

        let connected = self.connected_peers();
        let mut unique = connected.clone();
        unique.dedup();
        if unique.len() != connected.len() {
            return Err("peer connected twice".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{AgreementKeyPair, IdentityKeyPair};
    use crate::protocol::EnvelopeCipher;
    use crate::transport::MemoryNetwork;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc::UnboundedReceiver;

    /// Records calls and hands out sequential channel ids
    #[derive(Debug, Default)]
    struct RecordingTransport {
        next: u64,
        unreachable: HashSet<String>,
        dialed: Vec<(String, ChannelId)>,
        sent: Vec<(ChannelId, String)>,
        closed: Vec<ChannelId>,
        broken: HashSet<ChannelId>,
    }

    impl Transport for RecordingTransport {
        fn register(&mut self, _local_id: &str) -> Result<()> {
            Ok(())
        }

        fn dial(&mut self, peer_id: &str) -> Result<ChannelId> {
            if self.unreachable.contains(peer_id) {
                return Err(ConnectionError::PeerUnavailable {
                    peer_id: peer_id.to_string(),
                    reason: "unreachable".to_string(),
                }
                .into());
            }
            self.next += 1;
            let channel = ChannelId(self.next);
            self.dialed.push((peer_id.to_string(), channel));
            Ok(channel)
        }

        fn send(&mut self, channel: ChannelId, payload: String) -> Result<()> {
            if self.broken.contains(&channel) {
                return Err(ConnectionError::Transport {
                    reason: "broken".to_string(),
                }
                .into());
            }
            self.sent.push((channel, payload));
            Ok(())
        }

        fn close(&mut self, channel: ChannelId) -> Result<()> {
            self.closed.push(channel);
            Ok(())
        }
    }

    fn codec() -> EnvelopeCodec {
        EnvelopeCodec::new(
            AgreementKeyPair::generate(),
            Some(EnvelopeCipher::from_passphrase("test-passphrase").unwrap()),
        )
    }

    fn manager_with<T: Transport>(transport: T, local_id: &str) -> ConnectionManager<T> {
        let signer = IdentityKeyPair::generate();
        let codec = codec();
        let handshake = Envelope::handshake(&signer, local_id, local_id, Some(codec.agreement_public_key()));
        ConnectionManager::new(transport, codec, handshake, local_id, Some(3))
    }

    fn manager() -> ConnectionManager<RecordingTransport> {
        manager_with(RecordingTransport::default(), "alice")
    }

    #[test]
    fn test_dial_open_close_lifecycle() {
        let mut m = manager();
        assert_eq!(m.ensure_connected("bob").unwrap(), ConnectionStatus::Connecting);
        assert_eq!(m.ensure_connected("bob").unwrap(), ConnectionStatus::Connecting);
        assert_eq!(m.transport().dialed.len(), 1);

        let channel = m.transport().dialed[0].1;
        assert_eq!(
            m.handle_event(TransportEvent::Open { channel }),
            Some(Inbound::StatusChanged {
                peer_id: "bob".to_string(),
                status: ConnectionStatus::Connected
            })
        );
        assert_eq!(m.connected_peers(), vec!["bob".to_string()]);

        // Handshake goes out first, in plaintext
        let (sent_on, frame) = &m.transport().sent[0];
        assert_eq!(*sent_on, channel);
        assert!(frame.contains("\"type\":\"handshake\""));

        assert_eq!(
            m.handle_event(TransportEvent::Closed { channel }),
            Some(Inbound::StatusChanged {
                peer_id: "bob".to_string(),
                status: ConnectionStatus::Disconnected
            })
        );
        assert!(m.connection("bob").is_none());
        m.check_invariants().unwrap();
    }

    #[test]
    fn test_send_requires_connected() {
        let mut m = manager();
        let envelope = Envelope::Delete {
            target_id: uuid::Uuid::new_v4(),
        };
        assert!(matches!(
            m.send("bob", &envelope),
            Err(MessengerError::Connection(ConnectionError::NotConnected { .. }))
        ));

        m.ensure_connected("bob").unwrap();
        assert!(m.send("bob", &envelope).is_err());

        let channel = m.transport().dialed[0].1;
        m.handle_event(TransportEvent::Open { channel });
        m.send("bob", &envelope).unwrap();
        assert_eq!(m.stats().frames_sent, 2);
    }

    #[test]
    fn test_inbound_while_connected_is_closed() {
        let mut m = manager();
        m.ensure_connected("bob").unwrap();
        let ours = m.transport().dialed[0].1;
        m.handle_event(TransportEvent::Open { channel: ours });

        let theirs = ChannelId(100);
        assert_eq!(
            m.handle_event(TransportEvent::Incoming {
                channel: theirs,
                peer_id: "bob".to_string()
            }),
            None
        );
        assert_eq!(m.transport().closed, vec![theirs]);
        assert_eq!(m.connection("bob").unwrap().channel, Some(ours.0));

        // Late events for the closed channel are ignored
        assert_eq!(m.handle_event(TransportEvent::Open { channel: theirs }), None);
        assert_eq!(m.handle_event(TransportEvent::Closed { channel: theirs }), None);
        assert_eq!(m.status("bob"), ConnectionStatus::Connected);
        m.check_invariants().unwrap();
    }

    #[test]
    fn test_last_open_wins_and_standby_promotion() {
        let mut m = manager();
        m.ensure_connected("bob").unwrap();
        let ours = m.transport().dialed[0].1;
        let theirs = ChannelId(100);

        m.handle_event(TransportEvent::Incoming {
            channel: theirs,
            peer_id: "bob".to_string(),
        });
        assert_eq!(m.status("bob"), ConnectionStatus::Connecting);

        m.handle_event(TransportEvent::Open { channel: ours });
        m.handle_event(TransportEvent::Open { channel: theirs });
        let info = m.connection("bob").unwrap();
        assert_eq!(info.channel, Some(theirs.0));
        assert_eq!(info.standby, 1);
        assert!(m.transport().closed.is_empty());

        // The remote closes the winner; the standby takes over silently
        assert_eq!(m.handle_event(TransportEvent::Closed { channel: theirs }), None);
        let info = m.connection("bob").unwrap();
        assert_eq!(info.status, ConnectionStatus::Connected);
        assert_eq!(info.channel, Some(ours.0));
        assert_eq!(info.standby, 0);
        m.check_invariants().unwrap();
    }

    #[test]
    fn test_standby_data_accepted() {
        let mut m = manager();
        m.ensure_connected("bob").unwrap();
        let ours = m.transport().dialed[0].1;
        let theirs = ChannelId(100);
        m.handle_event(TransportEvent::Incoming {
            channel: theirs,
            peer_id: "bob".to_string(),
        });
        m.handle_event(TransportEvent::Open { channel: theirs });
        m.handle_event(TransportEvent::Open { channel: ours });

        let envelope = Envelope::Delete {
            target_id: uuid::Uuid::new_v4(),
        };
        // Sealed with the shared key since alice has not seen bob's handshake
        let frame = codec().encode("alice", &envelope).unwrap();
        assert_eq!(
            m.handle_event(TransportEvent::Data {
                channel: theirs,
                payload: frame
            }),
            Some(Inbound::Envelope {
                peer_id: "bob".to_string(),
                envelope
            })
        );
    }

    #[test]
    fn test_send_falls_back_to_standby() {
        let mut m = manager();
        m.ensure_connected("bob").unwrap();
        let ours = m.transport().dialed[0].1;
        let theirs = ChannelId(100);
        m.handle_event(TransportEvent::Incoming {
            channel: theirs,
            peer_id: "bob".to_string(),
        });
        m.handle_event(TransportEvent::Open { channel: ours });
        m.handle_event(TransportEvent::Open { channel: theirs });

        m.transport.broken.insert(theirs);
        m.send("bob", &Envelope::FileEnd { file_id: uuid::Uuid::new_v4() })
            .unwrap();
        assert_eq!(m.connection("bob").unwrap().channel, Some(ours.0));
        assert_eq!(m.transport().sent.last().unwrap().0, ours);
    }

    #[test]
    fn test_error_keeps_entry_for_retry() {
        let mut m = manager();
        m.ensure_connected("bob").unwrap();
        let first = m.transport().dialed[0].1;

        m.handle_event(TransportEvent::Error {
            channel: first,
            error: ConnectionError::PeerUnavailable {
                peer_id: "bob".to_string(),
                reason: "refused".to_string(),
            },
        });
        assert_eq!(m.status("bob"), ConnectionStatus::Error);

        assert_eq!(m.poll_reconnect(), vec!["bob".to_string()]);
        assert_eq!(m.status("bob"), ConnectionStatus::Connecting);
        assert_eq!(m.transport().dialed.len(), 2);
        m.check_invariants().unwrap();
    }

    #[test]
    fn test_poll_only_covers_interest() {
        let mut m = manager();
        m.set_focus(Some("bob"));
        m.transport.unreachable.insert("bob".to_string());
        assert!(m.poll_reconnect().is_empty());
        assert!(m.ensure_connected("bob").is_err());

        m.transport.unreachable.clear();
        assert_eq!(m.poll_reconnect(), vec!["bob".to_string()]);
        assert!(m.poll_reconnect().is_empty());

        // Switching focus keeps the connection but stops polling for bob
        m.set_focus(Some("carol"));
        assert!(!m.is_interested("bob"));
        assert_eq!(m.status("bob"), ConnectionStatus::Connecting);
        assert_eq!(m.poll_reconnect(), vec!["carol".to_string()]);

        m.cancel_interest("carol");
        assert_eq!(m.focus(), None);
        assert_eq!(m.stats().interested, 0);
    }

    #[test]
    fn test_cannot_connect_to_self() {
        let mut m = manager();
        assert!(m.ensure_connected("alice").is_err());
        assert!(m.transport().dialed.is_empty());
    }

    #[test]
    fn test_close_removes_every_channel() {
        let mut m = manager();
        m.ensure_connected("bob").unwrap();
        let ours = m.transport().dialed[0].1;
        m.handle_event(TransportEvent::Incoming {
            channel: ChannelId(100),
            peer_id: "bob".to_string(),
        });
        m.handle_event(TransportEvent::Open { channel: ours });

        m.close("bob").unwrap();
        assert_eq!(m.status("bob"), ConnectionStatus::Disconnected);
        assert_eq!(m.transport().closed.len(), 2);
        assert!(!m.is_interested("bob"));
        assert!(m.poll_reconnect().is_empty());
    }

    #[test]
    fn test_observers_fire() {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let envelopes = Arc::new(Mutex::new(0usize));

        let mut m = manager();
        let seen = statuses.clone();
        m.on_status_change(
            "bob",
            Box::new(move |_: &str, status: ConnectionStatus| seen.lock().unwrap().push(status)),
        );
        let count = envelopes.clone();
        m.on_envelope(
            "bob",
            Box::new(move |_: &str, _: &Envelope| *count.lock().unwrap() += 1),
        );

        m.ensure_connected("bob").unwrap();
        let channel = m.transport().dialed[0].1;
        m.handle_event(TransportEvent::Open { channel });

        let signer = IdentityKeyPair::generate();
        let frame = codec()
            .encode("alice", &Envelope::handshake(&signer, "bob", "Bob", None))
            .unwrap();
        m.handle_event(TransportEvent::Data {
            channel,
            payload: frame,
        });
        m.handle_event(TransportEvent::Closed { channel });

        assert_eq!(
            *statuses.lock().unwrap(),
            vec![
                ConnectionStatus::Connecting,
                ConnectionStatus::Connected,
                ConnectionStatus::Disconnected
            ]
        );
        assert_eq!(*envelopes.lock().unwrap(), 1);
    }

    #[test]
    fn test_garbage_frames_are_counted_and_dropped() {
        let mut m = manager();
        m.ensure_connected("bob").unwrap();
        let channel = m.transport().dialed[0].1;
        m.handle_event(TransportEvent::Open { channel });

        assert_eq!(
            m.handle_event(TransportEvent::Data {
                channel,
                payload: "not a frame".to_string()
            }),
            None
        );
        assert_eq!(m.stats().frames_rejected, 1);
        assert_eq!(m.status("bob"), ConnectionStatus::Connected);
    }

    #[test]
    fn test_identifier_retry_is_bounded() {
        let mut m = manager();
        let taken = || TransportEvent::RegistrationFailed {
            error: ConnectionError::IdentifierTaken {
                id: "alice".to_string(),
            },
        };

        m.register().unwrap();
        assert!(matches!(
            m.handle_event(taken()),
            Some(Inbound::RegistrationFailed { retry: true, .. })
        ));
        assert!(m.retry_registration().unwrap());
        m.handle_event(taken());
        assert!(m.retry_registration().unwrap());
        assert!(matches!(
            m.handle_event(taken()),
            Some(Inbound::RegistrationFailed { retry: false, .. })
        ));
        assert!(matches!(m.registration(), RegistrationState::Failed { .. }));
        assert!(!m.retry_registration().unwrap());
    }

    #[test]
    fn test_other_registration_failures_not_retried() {
        let mut m = manager();
        m.register().unwrap();
        assert!(matches!(
            m.handle_event(TransportEvent::RegistrationFailed {
                error: ConnectionError::Registration {
                    reason: "network".to_string()
                }
            }),
            Some(Inbound::RegistrationFailed { retry: false, .. })
        ));
    }

    #[test]
    fn test_random_interleavings_keep_one_entry_per_peer() {
        let peers = ["bob", "carol", "dave"];

        for seed in 0..200u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut m = manager();
            let mut live: Vec<ChannelId> = Vec::new();
            let mut next_inbound = 1_000u64;

            for _ in 0..60 {
                let peer = peers[rng.gen_range(0..peers.len())];
                match rng.gen_range(0..6) {
                    0 => {
                        if m.ensure_connected(peer).is_ok() {
                            if let Some(info) = m.connection(peer) {
                                live.push(ChannelId(info.channel.unwrap_or_default()));
                            }
                        }
                    }
                    1 => {
                        next_inbound += 1;
                        let channel = ChannelId(next_inbound);
                        m.handle_event(TransportEvent::Incoming {
                            channel,
                            peer_id: peer.to_string(),
                        });
                        live.push(channel);
                    }
                    2 | 3 if !live.is_empty() => {
                        let channel = live[rng.gen_range(0..live.len())];
                        m.handle_event(TransportEvent::Open { channel });
                    }
                    4 if !live.is_empty() => {
                        let channel = live.swap_remove(rng.gen_range(0..live.len()));
                        m.handle_event(TransportEvent::Closed { channel });
                    }
                    5 if !live.is_empty() => {
                        let channel = live.swap_remove(rng.gen_range(0..live.len()));
                        m.handle_event(TransportEvent::Error {
                            channel,
                            error: ConnectionError::Transport {
                                reason: "reset".to_string(),
                            },
                        });
                    }
                    _ => {
                        m.poll_reconnect();
                    }
                }

                if let Err(violation) = m.check_invariants() {
                    panic!("seed {seed}: {violation}");
                }
            }
        }
    }

    fn pump<T: Transport>(
        manager: &mut ConnectionManager<T>,
        rx: &mut UnboundedReceiver<TransportEvent>,
    ) -> Vec<Inbound> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.extend(manager.handle_event(event));
        }
        out
    }

    #[test]
    fn test_simultaneous_dial_converges() {
        let network = MemoryNetwork::new();
        let (x_transport, mut x_rx) = network.endpoint();
        let (y_transport, mut y_rx) = network.endpoint();
        let mut x = manager_with(x_transport, "x");
        let mut y = manager_with(y_transport, "y");

        x.register().unwrap();
        y.register().unwrap();
        pump(&mut x, &mut x_rx);
        pump(&mut y, &mut y_rx);

        x.ensure_connected("y").unwrap();
        y.ensure_connected("x").unwrap();
        for _ in 0..5 {
            pump(&mut x, &mut x_rx);
            pump(&mut y, &mut y_rx);
        }

        let xi = x.connection("y").unwrap();
        let yi = y.connection("x").unwrap();
        assert_eq!(xi.status, ConnectionStatus::Connected);
        assert_eq!(yi.status, ConnectionStatus::Connected);
        assert_eq!(xi.channel, yi.channel);
        assert_eq!(network.open_channels(), 1);
        x.check_invariants().unwrap();
        y.check_invariants().unwrap();

        // Both sides learned each other's agreement key from the handshake
        assert!(x.codec().has_pair_key("y"));
        assert!(y.codec().has_pair_key("x"));

        let hello = Envelope::Delete {
            target_id: uuid::Uuid::new_v4(),
        };
        x.send("y", &hello).unwrap();
        y.send("x", &hello).unwrap();
        let at_y = pump(&mut y, &mut y_rx);
        let at_x = pump(&mut x, &mut x_rx);
        let expected = |from: &str| Inbound::Envelope {
            peer_id: from.to_string(),
            envelope: hello.clone(),
        };
        assert_eq!(at_y, vec![expected("x")]);
        assert_eq!(at_x, vec![expected("y")]);
    }
}

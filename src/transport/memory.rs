//! In-process transport.
//!
//! Every [`MemoryTransport`] created from the same [`MemoryNetwork`] can
//! reach every other one by its registered id. Events are pushed into each
//! endpoint's queue at the moment the triggering call is made, so the
//! ordering seen by the two ends of a channel is deterministic.

use crate::transport::{ChannelId, Transport, TransportEvent};
use crate::utils::{ConnectionError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Shared in-process network
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

#[derive(Debug, Default)]
struct NetworkState {
    next_endpoint: u64,
    next_channel: u64,
    endpoints: HashMap<u64, EventSender>,
    registry: HashMap<String, u64>,
    links: HashMap<ChannelId, [u64; 2]>,
}

impl NetworkState {
    fn emit(&self, endpoint: u64, event: TransportEvent) -> bool {
        self.endpoints
            .get(&endpoint)
            .map(|tx| tx.send(event).is_ok())
            .unwrap_or(false)
    }
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach a new endpoint. Returns its transport and event stream.
    pub fn endpoint(&self) -> (MemoryTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = {
            let mut state = self.lock();
            state.next_endpoint += 1;
            let token = state.next_endpoint;
            state.endpoints.insert(token, tx);
            token
        };

        (
            MemoryTransport {
                network: self.clone(),
                token,
                local_id: None,
            },
            rx,
        )
    }

    /// Whether `peer_id` is currently registered
    pub fn is_registered(&self, peer_id: &str) -> bool {
        self.lock().registry.contains_key(peer_id)
    }

    /// Number of open channels on the network
    pub fn open_channels(&self) -> usize {
        self.lock().links.len()
    }
}

/// One endpoint on a [`MemoryNetwork`]
#[derive(Debug)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    token: u64,
    local_id: Option<String>,
}

impl MemoryTransport {
    /// Registered identifier, if any
    pub fn local_id(&self) -> Option<&str> {
        self.local_id.as_deref()
    }
}

impl Transport for MemoryTransport {
    fn register(&mut self, local_id: &str) -> Result<()> {
        let mut state = self.network.lock();

        match state.registry.get(local_id) {
            Some(owner) if *owner != self.token => {
                log::debug!("Memory endpoint {} refused id {}", self.token, local_id);
                state.emit(
                    self.token,
                    TransportEvent::RegistrationFailed {
                        error: ConnectionError::IdentifierTaken {
                            id: local_id.to_string(),
                        },
                    },
                );
                return Ok(());
            }
            _ => {}
        }

        if let Some(previous) = self.local_id.take() {
            state.registry.remove(&previous);
        }
        state.registry.insert(local_id.to_string(), self.token);
        self.local_id = Some(local_id.to_string());
        state.emit(
            self.token,
            TransportEvent::Registered {
                local_id: local_id.to_string(),
            },
        );
        Ok(())
    }

    fn dial(&mut self, peer_id: &str) -> Result<ChannelId> {
        let local_id = self
            .local_id
            .clone()
            .ok_or_else(|| ConnectionError::Registration {
                reason: "Cannot dial before registering".to_string(),
            })?;

        let mut state = self.network.lock();
        let remote = match state.registry.get(peer_id) {
            Some(token) if *token != self.token => *token,
            Some(_) => {
                return Err(ConnectionError::PeerUnavailable {
                    peer_id: peer_id.to_string(),
                    reason: "cannot dial self".to_string(),
                }
                .into())
            }
            None => {
                return Err(ConnectionError::PeerUnavailable {
                    peer_id: peer_id.to_string(),
                    reason: "not registered on this network".to_string(),
                }
                .into())
            }
        };

        state.next_channel += 1;
        let channel = ChannelId(state.next_channel);
        state.links.insert(channel, [self.token, remote]);

        state.emit(
            remote,
            TransportEvent::Incoming {
                channel,
                peer_id: local_id,
            },
        );
        state.emit(remote, TransportEvent::Open { channel });
        state.emit(self.token, TransportEvent::Open { channel });

        log::debug!("Memory channel {} opened to {}", channel, peer_id);
        Ok(channel)
    }

    fn send(&mut self, channel: ChannelId, payload: String) -> Result<()> {
        let state = self.network.lock();
        let ends = state
            .links
            .get(&channel)
            .copied()
            .ok_or(ConnectionError::UnknownChannel { channel: channel.0 })?;

        let remote = match ends {
            [a, b] if a == self.token => b,
            [a, b] if b == self.token => a,
            _ => return Err(ConnectionError::UnknownChannel { channel: channel.0 }.into()),
        };

        if state.emit(remote, TransportEvent::Data { channel, payload }) {
            Ok(())
        } else {
            Err(ConnectionError::Transport {
                reason: format!("Remote end of {channel} is gone"),
            }
            .into())
        }
    }

    fn close(&mut self, channel: ChannelId) -> Result<()> {
        let mut state = self.network.lock();
        if let Some(ends) = state.links.remove(&channel) {
            for end in ends {
                state.emit(end, TransportEvent::Closed { channel });
            }
        }
        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        let mut state = self.network.lock();
        let token = self.token;

        state.endpoints.remove(&token);
        state.registry.retain(|_, owner| *owner != token);

        let orphaned: Vec<(ChannelId, [u64; 2])> = state
            .links
            .iter()
            .filter(|(_, ends)| ends.contains(&token))
            .map(|(channel, ends)| (*channel, *ends))
            .collect();
        for (channel, ends) in orphaned {
            state.links.remove(&channel);
            for end in ends {
                state.emit(end, TransportEvent::Closed { channel });
            }
        }
    }
}

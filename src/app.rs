//! Node lifecycle and coordination.
//!
//! A [`Node`] owns the connection manager, identity directory, chat log and
//! file assembler, and processes transport events, caller commands and
//! timers one at a time on a single task. Callers talk to it through a
//! cloneable [`NodeHandle`] and observe it through a broadcast stream of
//! [`NodeEvent`]s.

use crate::{
    connection::{ConnectionInfo, ConnectionManager, ConnectionStats, ConnectionStatus, Inbound},
    crypto::UserProfile,
    protocol::{Envelope, EnvelopeCipher, EnvelopeCodec},
    storage::{ChatLog, ChatMessage, Contact, IdentityDirectory, PeerIdentity, Sender, Store},
    transfer::{FileAssembler, OutboundFile},
    transport::{Transport, TransportEvent},
    utils::{MessengerConfig, MessengerError, Result, TransferError},
};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

/// Capacity of the event broadcast channel
const EVENT_CAPACITY: usize = 256;

/// Something the node reports to its subscribers
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// The local id is registered
    Registered {
        /// Id now routable to this node
        local_id: String,
    },
    /// Registration failed
    RegistrationFailed {
        /// Why the transport refused the id
        reason: String,
        /// Whether the node will try again after the backoff
        retrying: bool,
    },
    /// A peer's connection status changed
    StatusChanged {
        /// Remote peer id
        peer_id: String,
        /// Status after the change
        status: ConnectionStatus,
    },
    /// A peer introduced itself
    HandshakeReceived {
        /// Remote peer id
        peer_id: String,
        /// Name the peer asked to be shown as
        display_name: String,
    },
    /// A peer was added to the contact list
    ContactAdded {
        /// The new contact
        contact: Contact,
    },
    /// A chat message arrived
    MessageReceived {
        /// Sending peer id
        peer_id: String,
        /// The message as recorded in the history
        message: ChatMessage,
    },
    /// A peer deleted one of its messages
    MessageDeleted {
        /// Peer that deleted the message
        peer_id: String,
        /// Id of the deleted message
        message_id: Uuid,
    },
    /// A file transfer completed
    FileReceived {
        /// Sending peer id
        peer_id: String,
        /// File message; `file_url` is the store handle of the payload
        message: ChatMessage,
    },
    /// A file transfer failed or expired
    TransferFailed {
        /// Sending peer id
        peer_id: String,
        /// Transfer id, when the failing frame carried one
        file_id: Option<Uuid>,
        /// What went wrong
        reason: String,
    },
}

/// Node statistics
#[derive(Debug, Clone)]
pub struct NodeStats {
    /// Local peer id
    pub local_id: String,
    /// Connection manager counters
    pub connections: ConnectionStats,
    /// Contacts in the chat log
    pub contacts: usize,
    /// Entries in the identity directory
    pub known_identities: usize,
    /// Incoming transfers in progress
    pub transfers_in_flight: usize,
    /// Time since the node was created
    pub uptime: chrono::Duration,
}

enum NodeCommand {
    Connect {
        peer_id: String,
        reply: oneshot::Sender<Result<ConnectionStatus>>,
    },
    Focus {
        peer_id: Option<String>,
        reply: oneshot::Sender<Result<Option<ConnectionStatus>>>,
    },
    CancelInterest {
        peer_id: String,
        reply: oneshot::Sender<()>,
    },
    Disconnect {
        peer_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    SendMessage {
        peer_id: String,
        text: String,
        reply: oneshot::Sender<Result<ChatMessage>>,
    },
    SendFile {
        peer_id: String,
        file_name: String,
        file_type: String,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<Uuid>>,
    },
    DeleteMessage {
        peer_id: String,
        message_id: Uuid,
        reply: oneshot::Sender<Result<bool>>,
    },
    AddContact {
        input: String,
        name: Option<String>,
        reply: oneshot::Sender<Result<Option<Contact>>>,
    },
    History {
        peer_id: String,
        reply: oneshot::Sender<Vec<ChatMessage>>,
    },
    Contacts {
        reply: oneshot::Sender<Vec<Contact>>,
    },
    Connection {
        peer_id: String,
        reply: oneshot::Sender<Option<ConnectionInfo>>,
    },
    Identity {
        peer_id: String,
        reply: oneshot::Sender<Option<PeerIdentity>>,
    },
    Blob {
        handle: String,
        reply: oneshot::Sender<Result<Option<Vec<u8>>>>,
    },
    Stats {
        reply: oneshot::Sender<NodeStats>,
    },
    Shutdown,
}

/// A file being sent, one chunk per turn of the node loop
struct Upload {
    peer_id: String,
    file: OutboundFile,
    next_chunk: u32,
    reply: oneshot::Sender<Result<Uuid>>,
}

/// Cloneable handle to a running [`Node`]
#[derive(Clone, Debug)]
pub struct NodeHandle {
    commands: mpsc::UnboundedSender<NodeCommand>,
    events: broadcast::Sender<NodeEvent>,
}

impl std::fmt::Debug for NodeCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Connect { .. } => "Connect",
            Self::Focus { .. } => "Focus",
            Self::CancelInterest { .. } => "CancelInterest",
            Self::Disconnect { .. } => "Disconnect",
            Self::SendMessage { .. } => "SendMessage",
            Self::SendFile { .. } => "SendFile",
            Self::DeleteMessage { .. } => "DeleteMessage",
            Self::AddContact { .. } => "AddContact",
            Self::History { .. } => "History",
            Self::Contacts { .. } => "Contacts",
            Self::Connection { .. } => "Connection",
            Self::Identity { .. } => "Identity",
            Self::Blob { .. } => "Blob",
            Self::Stats { .. } => "Stats",
            Self::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

impl NodeHandle {
    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> NodeCommand) -> Result<R> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| MessengerError::NodeStopped)?;
        response.await.map_err(|_| MessengerError::NodeStopped)
    }

    /// Subscribe to node events
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Connect to `peer_id` (idempotent) and keep reconnecting while it is of interest
    pub async fn connect(&self, peer_id: &str) -> Result<ConnectionStatus> {
        let peer_id = peer_id.to_string();
        self.request(|reply| NodeCommand::Connect { peer_id, reply })
            .await?
    }

    /// Focus a chat; connects to the peer. `None` clears the focus.
    pub async fn focus(&self, peer_id: Option<&str>) -> Result<Option<ConnectionStatus>> {
        let peer_id = peer_id.map(str::to_string);
        self.request(|reply| NodeCommand::Focus { peer_id, reply })
            .await?
    }

    /// Stop reconnect polling for `peer_id`
    pub async fn cancel_interest(&self, peer_id: &str) -> Result<()> {
        let peer_id = peer_id.to_string();
        self.request(|reply| NodeCommand::CancelInterest { peer_id, reply })
            .await
    }

    /// Close every channel to `peer_id`
    pub async fn disconnect(&self, peer_id: &str) -> Result<()> {
        let peer_id = peer_id.to_string();
        self.request(|reply| NodeCommand::Disconnect { peer_id, reply })
            .await?
    }

    /// Sign and send a text message. Returns the locally recorded copy.
    pub async fn send_message(&self, peer_id: &str, text: &str) -> Result<ChatMessage> {
        let peer_id = peer_id.to_string();
        let text = text.to_string();
        self.request(|reply| NodeCommand::SendMessage {
            peer_id,
            text,
            reply,
        })
        .await?
    }

    /// Send a file in chunks. Returns the transfer id once the last chunk
    /// is on the wire.
    pub async fn send_file(
        &self,
        peer_id: &str,
        file_name: &str,
        file_type: &str,
        data: Vec<u8>,
    ) -> Result<Uuid> {
        let peer_id = peer_id.to_string();
        let file_name = file_name.to_string();
        let file_type = file_type.to_string();
        self.request(|reply| NodeCommand::SendFile {
            peer_id,
            file_name,
            file_type,
            data,
            reply,
        })
        .await?
    }

    /// Delete one of our own messages locally and at the peer
    pub async fn delete_message(&self, peer_id: &str, message_id: Uuid) -> Result<bool> {
        let peer_id = peer_id.to_string();
        self.request(|reply| NodeCommand::DeleteMessage {
            peer_id,
            message_id,
            reply,
        })
        .await?
    }

    /// Add a contact by id or phone number
    pub async fn add_contact(&self, input: &str, name: Option<&str>) -> Result<Option<Contact>> {
        let input = input.to_string();
        let name = name.map(str::to_string);
        self.request(|reply| NodeCommand::AddContact { input, name, reply })
            .await?
    }

    /// History with `peer_id`
    pub async fn history(&self, peer_id: &str) -> Result<Vec<ChatMessage>> {
        let peer_id = peer_id.to_string();
        self.request(|reply| NodeCommand::History { peer_id, reply })
            .await
    }

    /// Contact list
    pub async fn contacts(&self) -> Result<Vec<Contact>> {
        self.request(|reply| NodeCommand::Contacts { reply }).await
    }

    /// Connection snapshot for `peer_id`
    pub async fn connection(&self, peer_id: &str) -> Result<Option<ConnectionInfo>> {
        let peer_id = peer_id.to_string();
        self.request(|reply| NodeCommand::Connection { peer_id, reply })
            .await
    }

    /// Directory entry for `peer_id`
    pub async fn identity(&self, peer_id: &str) -> Result<Option<PeerIdentity>> {
        let peer_id = peer_id.to_string();
        self.request(|reply| NodeCommand::Identity { peer_id, reply })
            .await
    }

    /// Contents of a received file
    pub async fn file(&self, handle: &str) -> Result<Option<Vec<u8>>> {
        let handle = handle.to_string();
        self.request(|reply| NodeCommand::Blob { handle, reply })
            .await?
    }

    /// Node statistics
    pub async fn stats(&self) -> Result<NodeStats> {
        self.request(|reply| NodeCommand::Stats { reply }).await
    }

    /// Ask the node to close its connections and stop
    pub fn shutdown(&self) {
        let _ = self.commands.send(NodeCommand::Shutdown);
    }
}

/// The peer-to-peer messaging node
pub struct Node<T: Transport> {
    profile: UserProfile,
    manager: ConnectionManager<T>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    commands: mpsc::UnboundedReceiver<NodeCommand>,
    events: broadcast::Sender<NodeEvent>,
    store: Box<dyn Store>,
    directory: IdentityDirectory,
    chat_log: ChatLog,
    assembler: FileAssembler,
    uploads: VecDeque<Upload>,
    chunk_size: usize,
    max_file_size: u64,
    reconnect_interval: Duration,
    identifier_retry: Duration,
    sweep_interval: Duration,
    registration_retry_at: Option<Instant>,
    started_at: chrono::DateTime<chrono::Utc>,
}

impl<T: Transport + 'static> Node<T> {
    /// Create a node for `profile` on `transport`.
    ///
    /// Persisted contacts, histories and identities are loaded from `store`.
    pub fn new(
        config: &MessengerConfig,
        profile: UserProfile,
        transport: T,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        store: Box<dyn Store>,
    ) -> Result<(Self, NodeHandle)> {
        config.validate()?;

        let shared = if config.crypto.allow_shared_key {
            Some(EnvelopeCipher::from_passphrase(&config.crypto.shared_passphrase)?)
        } else {
            None
        };
        let codec = EnvelopeCodec::new(profile.agreement.clone(), shared);
        let handshake = Envelope::handshake(
            &profile.keypair,
            profile.username(),
            profile.display_name(),
            Some(codec.agreement_public_key()),
        );
        let manager = ConnectionManager::new(
            transport,
            codec,
            handshake,
            profile.username(),
            config.network.identifier_retry_limit,
        );

        let directory = IdentityDirectory::load(store.as_ref())?;
        let chat_log = ChatLog::load(store.as_ref(), profile.username())?;
        log::info!(
            "Loaded {} contacts and {} identities for {}",
            chat_log.contacts().len(),
            directory.len(),
            profile.username()
        );

        let (command_sender, commands) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let handle = NodeHandle {
            commands: command_sender,
            events: events.clone(),
        };

        let node = Self {
            profile,
            manager,
            transport_events,
            commands,
            events,
            store,
            directory,
            chat_log,
            assembler: FileAssembler::new(
                config.transfer.transfer_timeout(),
                config.transfer.max_file_size,
            )
            .with_peer_limit(config.transfer.max_transfers_per_peer),
            uploads: VecDeque::new(),
            chunk_size: config.transfer.chunk_size,
            max_file_size: config.transfer.max_file_size,
            reconnect_interval: config.network.reconnect_interval(),
            identifier_retry: config.network.identifier_retry(),
            sweep_interval: Duration::from_secs(config.transfer.sweep_interval_secs),
            registration_retry_at: None,
            started_at: chrono::Utc::now(),
        };
        Ok((node, handle))
    }

    /// Register and process events until shut down
    pub async fn run(mut self) -> Result<()> {
        log::info!("Starting node for {}", self.profile);
        self.manager.register()?;

        let mut reconnect = tokio::time::interval(self.reconnect_interval);
        reconnect.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let retry_at = self.registration_retry_at;
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(NodeCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                event = self.transport_events.recv() => match event {
                    Some(event) => self.handle_transport_event(event),
                    None => {
                        log::warn!("Transport event stream ended");
                        break;
                    }
                },
                _ = reconnect.tick() => {
                    let dialed = self.manager.poll_reconnect();
                    for peer_id in dialed {
                        self.emit_status(&peer_id);
                    }
                }
                _ = sweep.tick() => self.sweep_transfers(),
                _ = tokio::task::yield_now(), if !self.uploads.is_empty() => self.pump_upload(),
                _ = wait_until(retry_at) => {
                    self.registration_retry_at = None;
                    if let Err(e) = self.manager.retry_registration() {
                        log::error!("Registration retry failed: {}", e);
                    }
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    fn shutdown(&mut self) {
        log::info!("Shutting down node {}", self.profile.username());
        for upload in self.uploads.drain(..) {
            let _ = upload.reply.send(Err(MessengerError::NodeStopped));
        }
        self.manager.close_all();
        self.persist_chats();
        self.persist_directory();
    }

    fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }

    fn emit_status(&self, peer_id: &str) {
        self.emit(NodeEvent::StatusChanged {
            peer_id: peer_id.to_string(),
            status: self.manager.status(peer_id),
        });
    }

    fn persist_chats(&mut self) {
        if let Err(e) = self.chat_log.save(self.store.as_mut()) {
            log::error!("Failed to save chat data: {}", e);
        }
    }

    fn persist_directory(&mut self) {
        if let Err(e) = self.directory.save(self.store.as_mut()) {
            log::error!("Failed to save identity directory: {}", e);
        }
    }

    fn handle_command(&mut self, command: NodeCommand) {
        log::trace!("Command {:?}", command);
        match command {
            NodeCommand::Connect { peer_id, reply } => {
                let result = self.connect(&peer_id);
                let _ = reply.send(result);
            }
            NodeCommand::Focus { peer_id, reply } => {
                self.manager.set_focus(peer_id.as_deref());
                let result = match peer_id {
                    Some(peer_id) => self.connect(&peer_id).map(Some),
                    None => Ok(None),
                };
                let _ = reply.send(result);
            }
            NodeCommand::CancelInterest { peer_id, reply } => {
                self.manager.cancel_interest(&peer_id);
                let _ = reply.send(());
            }
            NodeCommand::Disconnect { peer_id, reply } => {
                let result = self.manager.close(&peer_id);
                self.emit_status(&peer_id);
                let _ = reply.send(result);
            }
            NodeCommand::SendMessage {
                peer_id,
                text,
                reply,
            } => {
                let _ = reply.send(self.send_message(&peer_id, &text));
            }
            NodeCommand::SendFile {
                peer_id,
                file_name,
                file_type,
                data,
                reply,
            } => {
                match self.start_upload(&peer_id, &file_name, &file_type, data) {
                    Ok(file) => self.uploads.push_back(Upload {
                        peer_id,
                        file,
                        next_chunk: 0,
                        reply,
                    }),
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            NodeCommand::DeleteMessage {
                peer_id,
                message_id,
                reply,
            } => {
                let _ = reply.send(self.delete_message(&peer_id, message_id));
            }
            NodeCommand::AddContact { input, name, reply } => {
                let result =
                    self.chat_log
                        .add_contact(&input, name.as_deref(), self.profile.username());
                if let Ok(Some(contact)) = &result {
                    self.directory.add_manual(&contact.id);
                    self.persist_chats();
                    self.persist_directory();
                    self.emit(NodeEvent::ContactAdded {
                        contact: contact.clone(),
                    });
                }
                let _ = reply.send(result);
            }
            NodeCommand::History { peer_id, reply } => {
                let _ = reply.send(self.chat_log.history(&peer_id).to_vec());
            }
            NodeCommand::Contacts { reply } => {
                let _ = reply.send(self.chat_log.contacts().to_vec());
            }
            NodeCommand::Connection { peer_id, reply } => {
                let _ = reply.send(self.manager.connection(&peer_id));
            }
            NodeCommand::Identity { peer_id, reply } => {
                let _ = reply.send(self.directory.get(&peer_id).cloned());
            }
            NodeCommand::Blob { handle, reply } => {
                let _ = reply.send(self.store.get_blob(&handle));
            }
            NodeCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            NodeCommand::Shutdown => {}
        }
    }

    fn connect(&mut self, peer_id: &str) -> Result<ConnectionStatus> {
        let before = self.manager.status(peer_id);
        let status = self.manager.ensure_connected(peer_id)?;
        if status != before {
            self.emit_status(peer_id);
        }
        Ok(status)
    }

    fn send_message(&mut self, peer_id: &str, text: &str) -> Result<ChatMessage> {
        let time = chrono::Local::now().format("%H:%M").to_string();
        let envelope = Envelope::signed_message(&self.profile.keypair, text, &time);
        let Envelope::Message { id, .. } = &envelope else {
            return Err(MessengerError::unexpected("signed_message built a non-message"));
        };
        let id = *id;

        self.manager.send(peer_id, &envelope)?;
        log::info!("Sent message {} to {}", id, peer_id);

        let message = ChatMessage::text(id, Sender::Me, text, &time, true);
        self.auto_add_contact(peer_id);
        self.chat_log.record(peer_id, message.clone());
        self.persist_chats();
        Ok(message)
    }

    /// Announce a file to `peer_id`; its chunks follow from [`Self::pump_upload`]
    fn start_upload(
        &mut self,
        peer_id: &str,
        file_name: &str,
        file_type: &str,
        data: Vec<u8>,
    ) -> Result<OutboundFile> {
        if self.manager.status(peer_id) != ConnectionStatus::Connected {
            return Err(crate::utils::ConnectionError::NotConnected {
                peer_id: peer_id.to_string(),
            }
            .into());
        }

        let file = OutboundFile::new(file_name, file_type, data, self.chunk_size, self.max_file_size)?;
        log::info!(
            "Sending '{}' to {} ({} bytes, {} chunks)",
            file_name,
            peer_id,
            file.metadata().file_size,
            file.metadata().total_chunks
        );
        self.manager.send(peer_id, &file.start_envelope())?;
        Ok(file)
    }

    /// Send the next frame of the oldest upload, then rotate it to the back
    fn pump_upload(&mut self) {
        let Some(mut upload) = self.uploads.pop_front() else {
            return;
        };

        match self.advance_upload(&mut upload) {
            Ok(false) => self.uploads.push_back(upload),
            Ok(true) => {
                let file_id = upload.file.file_id();
                let result = self.record_upload(&upload.peer_id, &upload.file);
                let _ = upload.reply.send(result.map(|()| file_id));
            }
            Err(e) => {
                log::warn!(
                    "Sending {} to {} failed after {} chunks: {}",
                    upload.file.file_id(),
                    upload.peer_id,
                    upload.next_chunk,
                    e
                );
                let _ = upload.reply.send(Err(e));
            }
        }
    }

    /// Returns `true` once `FileEnd` has been sent
    fn advance_upload(&mut self, upload: &mut Upload) -> Result<bool> {
        match upload.file.chunk_envelope(upload.next_chunk) {
            Some(chunk) => {
                self.manager.send(&upload.peer_id, &chunk)?;
                upload.next_chunk += 1;
                Ok(false)
            }
            None => {
                self.manager.send(&upload.peer_id, &upload.file.end_envelope())?;
                Ok(true)
            }
        }
    }

    fn record_upload(&mut self, peer_id: &str, file: &OutboundFile) -> Result<()> {
        let file_name = &file.metadata().file_name;
        let time = chrono::Local::now().format("%H:%M").to_string();
        let handle = self.store.put_blob(file_name, file.data())?;
        let mut message = ChatMessage::file(
            file.file_id(),
            Sender::Me,
            file_name,
            &file.metadata().file_type,
            &handle,
            &time,
        );
        message.is_verified = true;
        self.auto_add_contact(peer_id);
        self.chat_log.record(peer_id, message);
        self.persist_chats();
        Ok(())
    }

    fn delete_message(&mut self, peer_id: &str, message_id: Uuid) -> Result<bool> {
        if !self.chat_log.delete(peer_id, &message_id, &Sender::Me) {
            return Ok(false);
        }
        self.persist_chats();

        let envelope = Envelope::Delete {
            target_id: message_id,
        };
        match self.manager.send(peer_id, &envelope) {
            Ok(()) => {}
            Err(e) => log::warn!("Deleted {} locally but could not notify {}: {}", message_id, peer_id, e),
        }
        Ok(true)
    }

    fn stats(&self) -> NodeStats {
        NodeStats {
            local_id: self.manager.local_id().to_string(),
            connections: self.manager.stats(),
            contacts: self.chat_log.contacts().len(),
            known_identities: self.directory.len(),
            transfers_in_flight: self.assembler.in_flight(),
            uptime: chrono::Utc::now().signed_duration_since(self.started_at),
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        let Some(inbound) = self.manager.handle_event(event) else {
            return;
        };

        match inbound {
            Inbound::Registered { local_id } => {
                self.emit(NodeEvent::Registered { local_id });
            }
            Inbound::RegistrationFailed { error, retry } => {
                if retry {
                    self.registration_retry_at = Some(Instant::now() + self.identifier_retry);
                }
                self.emit(NodeEvent::RegistrationFailed {
                    reason: error.to_string(),
                    retrying: retry,
                });
            }
            Inbound::StatusChanged { peer_id, status } => {
                self.emit(NodeEvent::StatusChanged { peer_id, status });
            }
            Inbound::Envelope { peer_id, envelope } => self.process_envelope(&peer_id, envelope),
        }
    }

    fn process_envelope(&mut self, peer_id: &str, envelope: Envelope) {
        log::debug!("Received {} from {}", envelope.type_name(), peer_id);

        match envelope {
            Envelope::Handshake(handshake) => {
                if self.directory.upsert_handshake(peer_id, &handshake) {
                    self.persist_directory();
                }
                self.emit(NodeEvent::HandshakeReceived {
                    peer_id: peer_id.to_string(),
                    display_name: handshake.display_name,
                });
            }
            Envelope::Message { .. } => {
                let is_verified = envelope.verify_signature(self.directory.public_key(peer_id));
                let Envelope::Message { id, text, time, .. } = envelope else {
                    return;
                };
                if !is_verified {
                    log::warn!("Message {} from {} is not verified", id, peer_id);
                }

                self.auto_add_contact(peer_id);
                let message =
                    ChatMessage::text(id, Sender::Peer(peer_id.to_string()), &text, &time, is_verified);
                if self.chat_log.record(peer_id, message.clone()) {
                    self.persist_chats();
                    self.emit(NodeEvent::MessageReceived {
                        peer_id: peer_id.to_string(),
                        message,
                    });
                }
            }
            Envelope::Delete { target_id } => {
                let author = Sender::Peer(peer_id.to_string());
                if self.chat_log.delete(peer_id, &target_id, &author) {
                    self.persist_chats();
                    self.emit(NodeEvent::MessageDeleted {
                        peer_id: peer_id.to_string(),
                        message_id: target_id,
                    });
                }
            }
            Envelope::FileStart(metadata) => {
                let file_id = metadata.file_id;
                if let Err(e) = self.assembler.start(peer_id, metadata, std::time::Instant::now()) {
                    self.transfer_failed(peer_id, Some(file_id), &e);
                }
            }
            Envelope::FileChunk {
                file_id,
                chunk_index,
                data,
            } => {
                match self.assembler.chunk(peer_id, file_id, chunk_index, data) {
                    Ok(()) => {}
                    Err(e @ MessengerError::Transfer(TransferError::SizeExceeded { .. })) => {
                        self.transfer_failed(peer_id, Some(file_id), &e);
                    }
                    Err(e) => log::debug!("Dropping chunk {} of {}: {}", chunk_index, file_id, e),
                }
            }
            Envelope::FileEnd { file_id } => self.finish_transfer(peer_id, file_id),
        }
    }

    fn finish_transfer(&mut self, peer_id: &str, file_id: Uuid) {
        let file = match self.assembler.finish(peer_id, file_id) {
            Ok(file) => file,
            Err(e) => {
                self.transfer_failed(peer_id, Some(file_id), &e);
                return;
            }
        };

        if self.chat_log.contains(peer_id, &file_id) {
            log::debug!("Ignoring repeated transfer {} from {}", file_id, peer_id);
            return;
        }

        let handle = match self.store.put_blob(&file.metadata.file_name, &file.data) {
            Ok(handle) => handle,
            Err(e) => {
                self.transfer_failed(peer_id, Some(file_id), &e);
                return;
            }
        };

        let time = file
            .metadata
            .timestamp
            .with_timezone(&chrono::Local)
            .format("%H:%M")
            .to_string();
        let message = ChatMessage::file(
            file_id,
            Sender::Peer(peer_id.to_string()),
            &file.metadata.file_name,
            &file.metadata.file_type,
            &handle,
            &time,
        );
        log::info!(
            "Received '{}' from {} ({} bytes)",
            file.metadata.file_name,
            peer_id,
            file.data.len()
        );

        self.auto_add_contact(peer_id);
        if self.chat_log.record(peer_id, message.clone()) {
            self.persist_chats();
            self.emit(NodeEvent::FileReceived {
                peer_id: peer_id.to_string(),
                message,
            });
        }
    }

    fn transfer_failed(&self, peer_id: &str, file_id: Option<Uuid>, error: &MessengerError) {
        log::warn!("File transfer from {} failed: {}", peer_id, error);
        self.emit(NodeEvent::TransferFailed {
            peer_id: peer_id.to_string(),
            file_id,
            reason: error.to_string(),
        });
    }

    fn sweep_transfers(&mut self) {
        for (peer_id, metadata) in self.assembler.evict_expired(std::time::Instant::now()) {
            let error = TransferError::Expired {
                file_id: metadata.file_id.to_string(),
            };
            self.transfer_failed(&peer_id, Some(metadata.file_id), &error.into());
        }
    }

    fn auto_add_contact(&mut self, peer_id: &str) {
        if self.chat_log.contact(peer_id).is_some() {
            return;
        }
        let name = self
            .directory
            .username(peer_id)
            .map(str::to_string)
            .unwrap_or_else(|| peer_id.chars().take(6).collect());
        if self.chat_log.ensure_contact(peer_id, &name) {
            if let Some(contact) = self.chat_log.contact(peer_id) {
                self.emit(NodeEvent::ContactAdded {
                    contact: contact.clone(),
                });
            }
            self.persist_chats();
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

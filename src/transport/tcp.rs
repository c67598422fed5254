//! TCP transport with a static address book.
//!
//! Frames are newline-delimited. The dialing side writes its own peer id as
//! the first line so the acceptor can report `Incoming` with a routable id.
//! Registration binds the listen address; a bind refused with `AddrInUse`
//! is reported as `IdentifierTaken`, since that is how a stale instance of
//! the same identity shows up on this transport.

use crate::transport::{ChannelId, Transport, TransportEvent};
use crate::utils::{ConnectionError, Result};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};

type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Longest peer id accepted in the hello line
const MAX_HELLO_SIZE: usize = 256;

struct ChannelHandle {
    outbound: mpsc::UnboundedSender<String>,
    reader: AbortHandle,
}

#[derive(Clone, Default)]
struct ChannelTable {
    inner: Arc<Mutex<HashMap<ChannelId, ChannelHandle>>>,
}

impl ChannelTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<ChannelId, ChannelHandle>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove(&self, channel: ChannelId) -> Option<ChannelHandle> {
        self.lock().remove(&channel)
    }
}

/// Transport over plain TCP connections
pub struct TcpTransport {
    listen_address: SocketAddr,
    address_book: BTreeMap<String, SocketAddr>,
    connect_timeout: Duration,
    events: EventSender,
    local_id: Option<String>,
    next_channel: Arc<AtomicU64>,
    channels: ChannelTable,
    listener: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("listen_address", &self.listen_address)
            .field("address_book", &self.address_book)
            .field("local_id", &self.local_id)
            .field("channels", &self.channels.lock().len())
            .finish()
    }
}

impl TcpTransport {
    /// Create a transport listening on `listen_address` once registered
    pub fn new(
        listen_address: SocketAddr,
        address_book: BTreeMap<String, SocketAddr>,
        connect_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                listen_address,
                address_book,
                connect_timeout,
                events,
                local_id: None,
                next_channel: Arc::new(AtomicU64::new(0)),
                channels: ChannelTable::default(),
                listener: None,
            },
            rx,
        )
    }

    /// Add or replace an address book entry
    pub fn add_peer(&mut self, peer_id: &str, address: SocketAddr) {
        self.address_book.insert(peer_id.to_string(), address);
    }

    fn allocate_channel(&self) -> ChannelId {
        ChannelId(self.next_channel.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

impl Transport for TcpTransport {
    fn register(&mut self, local_id: &str) -> Result<()> {
        if let Some(previous) = self.listener.take() {
            previous.abort();
        }
        self.local_id = Some(local_id.to_string());

        let address = self.listen_address;
        let id = local_id.to_string();
        let events = self.events.clone();
        let channels = self.channels.clone();
        let next_channel = self.next_channel.clone();

        self.listener = Some(tokio::spawn(async move {
            let listener = match TcpListener::bind(address).await {
                Ok(listener) => listener,
                Err(e) => {
                    let error = if e.kind() == std::io::ErrorKind::AddrInUse {
                        ConnectionError::IdentifierTaken { id }
                    } else {
                        ConnectionError::Registration {
                            reason: format!("Cannot listen on {address}: {e}"),
                        }
                    };
                    let _ = events.send(TransportEvent::RegistrationFailed { error });
                    return;
                }
            };

            log::info!("Listening on {} as {}", address, id);
            let _ = events.send(TransportEvent::Registered { local_id: id });

            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        log::debug!("Accepted TCP connection from {}", remote);
                        let channel =
                            ChannelId(next_channel.fetch_add(1, Ordering::Relaxed) + 1);
                        tokio::spawn(accept_channel(
                            stream,
                            channel,
                            events.clone(),
                            channels.clone(),
                        ));
                    }
                    Err(e) => {
                        log::warn!("Accept failed: {}", e);
                    }
                }
            }
        }));

        Ok(())
    }

    fn dial(&mut self, peer_id: &str) -> Result<ChannelId> {
        let local_id = self
            .local_id
            .clone()
            .ok_or_else(|| ConnectionError::Registration {
                reason: "Cannot dial before registering".to_string(),
            })?;
        let address = *self.address_book.get(peer_id).ok_or_else(|| {
            ConnectionError::PeerUnavailable {
                peer_id: peer_id.to_string(),
                reason: "no address known".to_string(),
            }
        })?;

        let channel = self.allocate_channel();
        let events = self.events.clone();
        let channels = self.channels.clone();
        let connect_timeout = self.connect_timeout;
        let peer = peer_id.to_string();

        tokio::spawn(async move {
            let connected = tokio::time::timeout(connect_timeout, TcpStream::connect(address)).await;
            let mut stream = match connected {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    let _ = events.send(TransportEvent::Error {
                        channel,
                        error: ConnectionError::PeerUnavailable {
                            peer_id: peer,
                            reason: e.to_string(),
                        },
                    });
                    return;
                }
                Err(_) => {
                    let _ = events.send(TransportEvent::Error {
                        channel,
                        error: ConnectionError::PeerUnavailable {
                            peer_id: peer,
                            reason: format!("connect timed out after {connect_timeout:?}"),
                        },
                    });
                    return;
                }
            };

            if let Err(e) = stream.write_all(format!("{local_id}\n").as_bytes()).await {
                let _ = events.send(TransportEvent::Error {
                    channel,
                    error: ConnectionError::Transport {
                        reason: e.to_string(),
                    },
                });
                return;
            }

            let (read_half, write_half) = stream.into_split();
            run_channel(BufReader::new(read_half), write_half, channel, events, channels);
        });

        Ok(channel)
    }

    fn send(&mut self, channel: ChannelId, payload: String) -> Result<()> {
        let table = self.channels.lock();
        let handle = table
            .get(&channel)
            .ok_or(ConnectionError::UnknownChannel { channel: channel.0 })?;
        handle
            .outbound
            .send(payload)
            .map_err(|_| ConnectionError::Transport {
                reason: format!("Writer for {channel} has stopped"),
            })?;
        Ok(())
    }

    fn close(&mut self, channel: ChannelId) -> Result<()> {
        if let Some(handle) = self.channels.remove(channel) {
            handle.reader.abort();
            let _ = self.events.send(TransportEvent::Closed { channel });
        }
        Ok(())
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        for (_, handle) in self.channels.lock().drain() {
            handle.reader.abort();
        }
    }
}

async fn accept_channel(
    stream: TcpStream,
    channel: ChannelId,
    events: EventSender,
    channels: ChannelTable,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let hello = tokio::time::timeout(Duration::from_secs(10), read_frame(&mut reader, MAX_HELLO_SIZE)).await;
    let peer_id = match hello {
        Ok(Ok(ReadFrame::Line(line))) if !line.trim().is_empty() => line.trim().to_string(),
        _ => {
            log::debug!("Dropping TCP connection without a peer id");
            return;
        }
    };

    let _ = events.send(TransportEvent::Incoming { channel, peer_id });
    run_channel(reader, write_half, channel, events, channels);
}

/// Install the writer for `channel`, report `Open`, and pump incoming lines
fn run_channel(
    reader: BufReader<OwnedReadHalf>,
    mut write_half: OwnedWriteHalf,
    channel: ChannelId,
    events: EventSender,
    channels: ChannelTable,
) {
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if write_half.write_all(frame.as_bytes()).await.is_err()
                || write_half.write_all(b"\n").await.is_err()
            {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let reader_events = events.clone();
    let reader_channels = channels.clone();
    let reader = tokio::spawn(async move {
        let mut reader = reader;
        loop {
            match read_frame(&mut reader, crate::MAX_MESSAGE_SIZE).await {
                Ok(ReadFrame::Line(line)) => {
                    if line.is_empty() {
                        continue;
                    }
                    let _ = reader_events.send(TransportEvent::Data {
                        channel,
                        payload: line,
                    });
                }
                Ok(ReadFrame::Closed) => break,
                Ok(ReadFrame::TooLong) => {
                    log::warn!("Frame on {} exceeds {} bytes; closing", channel, crate::MAX_MESSAGE_SIZE);
                    // Dropping the handle stops the writer and the socket with it
                    if reader_channels.remove(channel).is_some() {
                        let _ = reader_events.send(TransportEvent::Error {
                            channel,
                            error: ConnectionError::Transport {
                                reason: format!("frame exceeds {} bytes", crate::MAX_MESSAGE_SIZE),
                            },
                        });
                    }
                    return;
                }
                Err(e) => {
                    log::debug!("Read on {} failed: {}", channel, e);
                    break;
                }
            }
        }

        if reader_channels.remove(channel).is_some() {
            let _ = reader_events.send(TransportEvent::Closed { channel });
        }
    });

    channels.lock().insert(
        channel,
        ChannelHandle {
            outbound,
            reader: reader.abort_handle(),
        },
    );
    let _ = events.send(TransportEvent::Open { channel });
}

#[derive(Debug, PartialEq, Eq)]
enum ReadFrame {
    Line(String),
    Closed,
    TooLong,
}

/// Read one newline-terminated frame of at most `max` bytes.
///
/// Stops buffering as soon as the limit is passed, so a peer that never
/// sends a newline cannot grow the buffer.
async fn read_frame<R: AsyncBufRead + Unpin>(reader: &mut R, max: usize) -> std::io::Result<ReadFrame> {
    let mut line = Vec::new();
    loop {
        let (used, done) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                // A final line without a newline still counts
                if line.is_empty() {
                    return Ok(ReadFrame::Closed);
                }
                break;
            }
            let (taken, done) = match available.iter().position(|&b| b == b'\n') {
                Some(end) => (end, true),
                None => (available.len(), false),
            };
            if line.len() + taken > max {
                return Ok(ReadFrame::TooLong);
            }
            line.extend_from_slice(&available[..taken]);
            (taken + usize::from(done), done)
        };
        reader.consume(used);
        if done {
            break;
        }
    }

    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line)
        .map(ReadFrame::Line)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

//! Receiver side of a chunked file transfer.
//!
//! Transfers are keyed by `(sender, file_id)`. A transfer is only assembled
//! once every chunk announced in its `FileStart` has arrived; anything else
//! fails the transfer. Transfers that never see their `FileEnd` are evicted
//! by [`FileAssembler::evict_expired`].
//!
//! Nothing is allocated up front from the announced metadata. Chunks are
//! kept as they arrive, and their combined size never exceeds the announced
//! `fileSize`.

use crate::protocol::FileStart;
use crate::transfer::{total_chunks, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
use crate::utils::{ProtocolError, Result, TransferError};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Default limit on concurrent incoming transfers from one peer
pub const DEFAULT_TRANSFERS_PER_PEER: usize = 4;

/// An in-flight incoming transfer
#[derive(Debug)]
struct FileTransfer {
    metadata: FileStart,
    chunks: BTreeMap<u32, Vec<u8>>,
    received_bytes: u64,
    started_at: Instant,
}

impl FileTransfer {
    fn received_count(&self) -> u32 {
        u32::try_from(self.chunks.len()).unwrap_or(u32::MAX)
    }
}

/// A fully received file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledFile {
    /// Metadata from `FileStart`
    pub metadata: FileStart,
    /// Concatenated chunk data
    pub data: Vec<u8>,
}

/// Buffers chunks per transfer and reassembles complete payloads
#[derive(Debug)]
pub struct FileAssembler {
    transfers: HashMap<(String, Uuid), FileTransfer>,
    timeout: Duration,
    max_file_size: u64,
    peer_limit: usize,
}

impl FileAssembler {
    /// Create an assembler that evicts transfers older than `timeout`
    pub fn new(timeout: Duration, max_file_size: u64) -> Self {
        Self {
            transfers: HashMap::new(),
            timeout,
            max_file_size,
            peer_limit: DEFAULT_TRANSFERS_PER_PEER,
        }
    }

    /// Limit the number of transfers one sender may have in flight
    #[must_use]
    pub fn with_peer_limit(mut self, limit: usize) -> Self {
        self.peer_limit = limit.max(1);
        self
    }

    /// Number of in-flight transfers
    pub fn in_flight(&self) -> usize {
        self.transfers.len()
    }

    /// Number of in-flight transfers from `sender`
    pub fn in_flight_from(&self, sender: &str) -> usize {
        self.transfers.keys().filter(|(from, _)| from == sender).count()
    }

    /// `(received, total)` chunk counts for a transfer
    pub fn progress(&self, sender: &str, file_id: &Uuid) -> Option<(u32, u32)> {
        self.transfers
            .get(&(sender.to_string(), *file_id))
            .map(|t| (t.received_count(), t.metadata.total_chunks))
    }

    /// Allocate a transfer for `metadata`.
    ///
    /// Returns `Ok(false)` if a transfer with this id is already in flight.
    pub fn start(&mut self, sender: &str, metadata: FileStart, now: Instant) -> Result<bool> {
        if metadata.file_size > self.max_file_size {
            return Err(TransferError::TooLarge {
                size: metadata.file_size,
                max: self.max_file_size,
            }
            .into());
        }

        // The chunk count must match some chunk size a sender may use.
        let fewest = total_chunks(metadata.file_size, MAX_CHUNK_SIZE);
        let most = total_chunks(metadata.file_size, MIN_CHUNK_SIZE);
        if !(fewest..=most).contains(&metadata.total_chunks) {
            return Err(ProtocolError::InvalidMessage {
                reason: format!(
                    "{} chunks announced for {} bytes (expected {}..={})",
                    metadata.total_chunks, metadata.file_size, fewest, most
                ),
            }
            .into());
        }

        let key = (sender.to_string(), metadata.file_id);
        if self.transfers.contains_key(&key) {
            log::debug!("Ignoring duplicate file-start for {}", metadata.file_id);
            return Ok(false);
        }

        if self.in_flight_from(sender) >= self.peer_limit {
            return Err(TransferError::TooManyTransfers {
                peer_id: sender.to_string(),
                limit: self.peer_limit,
            }
            .into());
        }

        log::info!(
            "Receiving '{}' from {} ({} bytes, {} chunks)",
            metadata.file_name,
            sender,
            metadata.file_size,
            metadata.total_chunks
        );
        self.transfers.insert(
            key,
            FileTransfer {
                metadata,
                chunks: BTreeMap::new(),
                received_bytes: 0,
                started_at: now,
            },
        );
        Ok(true)
    }

    /// Store one chunk. A repeated index replaces the data without being
    /// counted twice.
    ///
    /// A chunk that would take the transfer past its announced size fails
    /// and frees the whole transfer.
    pub fn chunk(&mut self, sender: &str, file_id: Uuid, index: u32, data: Vec<u8>) -> Result<()> {
        let key = (sender.to_string(), file_id);
        let transfer = self
            .transfers
            .get_mut(&key)
            .ok_or_else(|| TransferError::UnknownTransfer {
                file_id: file_id.to_string(),
            })?;

        let total = transfer.metadata.total_chunks;
        if index >= total {
            return Err(TransferError::ChunkOutOfRange {
                file_id: file_id.to_string(),
                index,
                total,
            }
            .into());
        }

        let replaced = transfer.chunks.get(&index).map_or(0, Vec::len) as u64;
        let received = transfer.received_bytes - replaced + data.len() as u64;
        if received > transfer.metadata.file_size {
            let size = transfer.metadata.file_size;
            self.transfers.remove(&key);
            return Err(TransferError::SizeExceeded {
                file_id: file_id.to_string(),
                received,
                size,
            }
            .into());
        }

        transfer.received_bytes = received;
        transfer.chunks.insert(index, data);
        Ok(())
    }

    /// Consume the transfer and return the reassembled payload.
    ///
    /// The transfer is freed whether or not assembly succeeds.
    pub fn finish(&mut self, sender: &str, file_id: Uuid) -> Result<AssembledFile> {
        let transfer = self
            .transfers
            .remove(&(sender.to_string(), file_id))
            .ok_or_else(|| TransferError::UnknownTransfer {
                file_id: file_id.to_string(),
            })?;

        let received = transfer.received_count();
        if received < transfer.metadata.total_chunks {
            return Err(TransferError::Incomplete {
                file_id: file_id.to_string(),
                received,
                total: transfer.metadata.total_chunks,
            }
            .into());
        }

        if transfer.received_bytes != transfer.metadata.file_size {
            return Err(ProtocolError::InvalidMessage {
                reason: format!(
                    "Transfer {} assembled {} bytes, expected {}",
                    file_id, transfer.received_bytes, transfer.metadata.file_size
                ),
            }
            .into());
        }

        let mut data = Vec::with_capacity(usize::try_from(transfer.received_bytes).unwrap_or(0));
        for chunk in transfer.chunks.into_values() {
            data.extend_from_slice(&chunk);
        }

        Ok(AssembledFile {
            metadata: transfer.metadata,
            data,
        })
    }

    /// Evict transfers started more than the timeout before `now`.
    ///
    /// Returns the sender and metadata of each evicted transfer.
    pub fn evict_expired(&mut self, now: Instant) -> Vec<(String, FileStart)> {
        let timeout = self.timeout;
        let expired: Vec<(String, Uuid)> = self
            .transfers
            .iter()
            .filter(|(_, t)| now.saturating_duration_since(t.started_at) >= timeout)
            .map(|(key, _)| key.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|key| {
                self.transfers.remove(&key).map(|t| {
                    log::warn!(
                        "File transfer {} from {} expired with {}/{} chunks",
                        key.1,
                        key.0,
                        t.received_count(),
                        t.metadata.total_chunks
                    );
                    (key.0, t.metadata)
                })
            })
            .collect()
    }
}

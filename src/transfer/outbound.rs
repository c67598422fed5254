//! Sender side of a chunked file transfer.

use crate::protocol::{Envelope, FileStart};
use crate::utils::{Result, TransferError};
use uuid::Uuid;

/// Default chunk size in bytes (16 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Smallest chunk size a sender may use
pub const MIN_CHUNK_SIZE: usize = 1024;

/// Largest chunk size a sender may use; a sealed chunk still fits one frame
pub const MAX_CHUNK_SIZE: usize = 512 * 1024;

/// Number of chunks needed for `size` bytes: `ceil(size / chunk_size)`
pub fn total_chunks(size: u64, chunk_size: usize) -> u32 {
    let chunk_size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    } as u64;
    u32::try_from(size.div_ceil(chunk_size)).unwrap_or(u32::MAX)
}

/// Best-effort MIME type from a file name's extension
pub fn guess_mime(file_name: &str) -> &'static str {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "txt" | "md" | "log" => "text/plain",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

/// A file prepared for sending: `FileStart`, chunks in index order, `FileEnd`
#[derive(Debug, Clone)]
pub struct OutboundFile {
    start: FileStart,
    data: Vec<u8>,
    chunk_size: usize,
}

impl OutboundFile {
    /// Prepare `data` for sending in `chunk_size` slices
    ///
    /// # Errors
    ///
    /// `TransferError::TooLarge` if `data` exceeds `max_file_size`
    pub fn new(
        file_name: &str,
        file_type: &str,
        data: Vec<u8>,
        chunk_size: usize,
        max_file_size: u64,
    ) -> Result<Self> {
        let size = data.len() as u64;
        if size > max_file_size {
            return Err(TransferError::TooLarge {
                size,
                max: max_file_size,
            }
            .into());
        }

        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };

        Ok(Self {
            start: FileStart {
                file_id: Uuid::new_v4(),
                file_name: file_name.to_string(),
                file_size: size,
                file_type: file_type.to_string(),
                total_chunks: total_chunks(size, chunk_size),
                timestamp: chrono::Utc::now(),
            },
            data,
            chunk_size,
        })
    }

    /// Transfer identifier
    pub fn file_id(&self) -> Uuid {
        self.start.file_id
    }

    /// Metadata announced in `FileStart`
    pub fn metadata(&self) -> &FileStart {
        &self.start
    }

    /// Whole payload
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The `FileStart` envelope
    pub fn start_envelope(&self) -> Envelope {
        Envelope::FileStart(self.start.clone())
    }

    /// `FileChunk` envelopes in strictly increasing index order
    pub fn chunk_envelopes(&self) -> impl Iterator<Item = Envelope> + '_ {
        (0..self.start.total_chunks).filter_map(|index| self.chunk_envelope(index))
    }

    /// The `FileChunk` envelope at `index`, if there is one
    pub fn chunk_envelope(&self, index: u32) -> Option<Envelope> {
        let begin = (index as usize).checked_mul(self.chunk_size)?;
        if begin >= self.data.len() {
            return None;
        }
        let end = (begin + self.chunk_size).min(self.data.len());
        Some(Envelope::FileChunk {
            file_id: self.start.file_id,
            chunk_index: index,
            data: self.data[begin..end].to_vec(),
        })
    }

    /// The `FileEnd` envelope
    pub fn end_envelope(&self) -> Envelope {
        Envelope::FileEnd {
            file_id: self.start.file_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_chunks() {
        assert_eq!(total_chunks(0, 16 * 1024), 0);
        assert_eq!(total_chunks(1, 16 * 1024), 1);
        assert_eq!(total_chunks(16 * 1024, 16 * 1024), 1);
        assert_eq!(total_chunks(16 * 1024 + 1, 16 * 1024), 2);
        assert_eq!(total_chunks(40 * 1024, 16 * 1024), 3);
    }

    #[test]
    fn test_chunks_cover_payload_in_order() {
        let data: Vec<u8> = (0..40 * 1024).map(|i| (i % 251) as u8).collect();
        let file = OutboundFile::new("a.bin", "application/octet-stream", data.clone(), 16 * 1024, u64::MAX)
            .unwrap();
        assert_eq!(file.metadata().total_chunks, 3);

        let mut rebuilt = Vec::new();
        for (expected_index, envelope) in file.chunk_envelopes().enumerate() {
            match envelope {
                Envelope::FileChunk {
                    file_id,
                    chunk_index,
                    data,
                } => {
                    assert_eq!(file_id, file.file_id());
                    assert_eq!(chunk_index as usize, expected_index);
                    rebuilt.extend_from_slice(&data);
                }
                other => panic!("unexpected envelope {other:?}"),
            }
        }
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn test_chunk_envelope_by_index() {
        let file = OutboundFile::new("a.bin", "application/octet-stream", vec![7u8; 2500], 1024, u64::MAX).unwrap();
        match file.chunk_envelope(2) {
            Some(Envelope::FileChunk { chunk_index, data, .. }) => {
                assert_eq!(chunk_index, 2);
                assert_eq!(data.len(), 452);
            }
            other => panic!("unexpected chunk {other:?}"),
        }
        assert!(file.chunk_envelope(3).is_none());
    }

    #[test]
    fn test_too_large_refused() {
        let result = OutboundFile::new("big.bin", "application/octet-stream", vec![0u8; 10], 4, 9);
        assert!(result.is_err());
    }

    #[test]
    fn test_guess_mime() {
        assert_eq!(guess_mime("photo.JPG"), "image/jpeg");
        assert_eq!(guess_mime("notes.txt"), "text/plain");
        assert_eq!(guess_mime("README"), "application/octet-stream");
    }
}

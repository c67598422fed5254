//! Chunked file transfer.
//!
//! The sender splits a payload into fixed-size chunks framed by `FileStart`
//! and `FileEnd`; the receiver buffers and reassembles them.

pub mod assembler;
pub mod outbound;

pub use assembler::{AssembledFile, FileAssembler, DEFAULT_TRANSFERS_PER_PEER};
pub use outbound::{
    guess_mime, total_chunks, OutboundFile, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE,
};

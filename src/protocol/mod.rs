//! Application protocol: envelopes, wire frames and their encryption.

pub mod cipher;
pub mod codec;
pub mod envelope;

pub use cipher::EnvelopeCipher;
pub use codec::{EnvelopeCodec, KeyScheme, WireFrame, MAX_FRAME_SIZE};
pub use envelope::{signing_payload, Envelope, FileStart, Handshake};

//! Application protocol envelopes.
//!
//! An [`Envelope`] is the decrypted unit exchanged between peers. The JSON
//! shape is tagged by `type` (`handshake`, `msg`, `delete`, `file-start`,
//! `file-chunk`, `file-end`) with camelCase fields; binary fields travel as
//! standard base64 strings.

use crate::crypto::{self, Signer};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity material announced on every channel open
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    /// Ed25519 public key of the sender
    #[serde(with = "b64")]
    pub public_key: Vec<u8>,
    /// Stable account identifier
    pub username: String,
    /// Human-readable name
    pub display_name: String,
    /// X25519 agreement key, absent for peers that only speak the shared key
    #[serde(default, with = "b64_opt", skip_serializing_if = "Option::is_none")]
    pub agreement_key: Option<Vec<u8>>,
}

/// File metadata sent before the first chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStart {
    /// Transfer identifier shared by every chunk
    pub file_id: Uuid,
    /// Original file name
    pub file_name: String,
    /// Size of the whole payload in bytes
    pub file_size: u64,
    /// MIME type
    pub file_type: String,
    /// Number of `FileChunk` envelopes that follow
    pub total_chunks: u32,
    /// When the sender started the transfer
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// One unit of the application protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    /// Identity exchange, always sent in plaintext
    #[serde(rename = "handshake")]
    Handshake(Handshake),

    /// Signed chat message
    #[serde(rename = "msg")]
    Message {
        /// Caller-generated id used for dedup and delete targeting
        id: Uuid,
        /// Message body
        text: String,
        /// Display time as rendered by the sender
        time: String,
        /// Signature over `id ‖ text ‖ time`
        #[serde(default, with = "b64_opt", skip_serializing_if = "Option::is_none")]
        signature: Option<Vec<u8>>,
    },

    /// Request to delete one of the sender's messages
    #[serde(rename = "delete", rename_all = "camelCase")]
    Delete {
        /// Id of the message to delete
        target_id: Uuid,
    },

    /// Start of a chunked file transfer
    #[serde(rename = "file-start")]
    FileStart(FileStart),

    /// One slice of a file
    #[serde(rename = "file-chunk", rename_all = "camelCase")]
    FileChunk {
        /// Transfer identifier
        file_id: Uuid,
        /// Zero-based position of this slice
        chunk_index: u32,
        /// Slice bytes
        #[serde(with = "b64")]
        data: Vec<u8>,
    },

    /// End of a chunked file transfer
    #[serde(rename = "file-end", rename_all = "camelCase")]
    FileEnd {
        /// Transfer identifier
        file_id: Uuid,
    },
}

/// Bytes covered by a message signature: `id ‖ text ‖ time`
pub fn signing_payload(id: &Uuid, text: &str, time: &str) -> Vec<u8> {
    format!("{id}{text}{time}").into_bytes()
}

impl Envelope {
    /// Build a handshake for the local account
    pub fn handshake(
        signer: &dyn Signer,
        username: &str,
        display_name: &str,
        agreement_key: Option<[u8; 32]>,
    ) -> Self {
        Self::Handshake(Handshake {
            public_key: signer.public_key(),
            username: username.to_string(),
            display_name: display_name.to_string(),
            agreement_key: agreement_key.map(|k| k.to_vec()),
        })
    }

    /// Build a signed chat message with a fresh id
    pub fn signed_message(signer: &dyn Signer, text: &str, time: &str) -> Self {
        let id = Uuid::new_v4();
        let signature = signer.sign(&signing_payload(&id, text, time));
        Self::Message {
            id,
            text: text.to_string(),
            time: time.to_string(),
            signature: Some(signature),
        }
    }

    /// Check a `Message` signature against the sender's public key.
    ///
    /// Returns `false` for other variants, unsigned messages, or an unknown
    /// key; verification is never attempted without a key.
    pub fn verify_signature(&self, sender_public_key: Option<&[u8]>) -> bool {
        match (self, sender_public_key) {
            (
                Self::Message {
                    id,
                    text,
                    time,
                    signature: Some(signature),
                },
                Some(public_key),
            ) => crypto::verify(public_key, &signing_payload(id, text, time), signature),
            _ => false,
        }
    }

    /// Wire tag of this envelope
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Handshake(_) => "handshake",
            Self::Message { .. } => "msg",
            Self::Delete { .. } => "delete",
            Self::FileStart(_) => "file-start",
            Self::FileChunk { .. } => "file-chunk",
            Self::FileEnd { .. } => "file-end",
        }
    }

    /// Whether this envelope belongs to a file transfer
    pub fn is_file_transfer(&self) -> bool {
        matches!(
            self,
            Self::FileStart(_) | Self::FileChunk { .. } | Self::FileEnd { .. }
        )
    }
}

/// Serde adapter: `Vec<u8>` as a base64 string
pub(crate) mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Serde adapter: `Option<Vec<u8>>` as an optional base64 string
pub(crate) mod b64_opt {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| {
                STANDARD
                    .decode(encoded.as_bytes())
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
    }
}

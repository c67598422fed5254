//! Wire framing and envelope encryption.
//!
//! Every transport payload is one JSON [`WireFrame`]. Handshakes travel in
//! the clear as their own frame type; every other envelope is serialised and
//! sealed, and the frame names which key sealed it.

use crate::crypto::{AgreementKeyPair, KEY_SIZE};
use crate::protocol::envelope::{b64, Handshake};
use crate::protocol::{Envelope, EnvelopeCipher};
use crate::utils::{CryptoError, ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Maximum encoded frame size (1 MiB)
pub const MAX_FRAME_SIZE: usize = crate::MAX_MESSAGE_SIZE;

/// Which key sealed a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyScheme {
    /// Application-wide pre-shared key
    Shared,
    /// Key derived from both peers' agreement keys
    Pair,
}

/// Outer frame as it appears on the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WireFrame {
    /// Plaintext identity exchange
    Handshake(Handshake),
    /// Encrypted envelope
    Sealed {
        /// Key used for `data`
        scheme: KeyScheme,
        /// `nonce ‖ ciphertext`
        #[serde(with = "b64")]
        data: Vec<u8>,
    },
}

/// Encodes envelopes for, and decodes frames from, individual peers
#[derive(Debug)]
pub struct EnvelopeCodec {
    agreement: AgreementKeyPair,
    shared: Option<EnvelopeCipher>,
    pair_keys: HashMap<String, EnvelopeCipher>,
}

impl EnvelopeCodec {
    /// Create a codec; `shared` is `None` when the pre-shared key is disabled
    pub fn new(agreement: AgreementKeyPair, shared: Option<EnvelopeCipher>) -> Self {
        Self {
            agreement,
            shared,
            pair_keys: HashMap::new(),
        }
    }

    /// Public agreement key to announce in handshakes
    pub fn agreement_public_key(&self) -> [u8; KEY_SIZE] {
        self.agreement.public_key_bytes()
    }

    /// Derive and remember the pair key for `peer_id` from its agreement key
    pub fn learn_agreement_key(&mut self, peer_id: &str, remote_public: &[u8]) -> Result<()> {
        let remote = <[u8; KEY_SIZE]>::try_from(remote_public).map_err(|_| {
            CryptoError::InvalidKey {
                reason: format!("Agreement key from {peer_id} has wrong length"),
            }
        })?;
        let key = self.agreement.derive_pair_key(&remote)?;
        self.pair_keys
            .insert(peer_id.to_string(), EnvelopeCipher::from_key(key));
        Ok(())
    }

    /// Whether a pair key is known for `peer_id`
    pub fn has_pair_key(&self, peer_id: &str) -> bool {
        self.pair_keys.contains_key(peer_id)
    }

    /// Scheme that [`EnvelopeCodec::encode`] would pick for `peer_id`
    pub fn outbound_scheme(&self, peer_id: &str) -> Option<KeyScheme> {
        if self.has_pair_key(peer_id) {
            Some(KeyScheme::Pair)
        } else if self.shared.is_some() {
            Some(KeyScheme::Shared)
        } else {
            None
        }
    }

    fn cipher_for(&self, peer_id: &str, scheme: KeyScheme) -> Option<&EnvelopeCipher> {
        match scheme {
            KeyScheme::Pair => self.pair_keys.get(peer_id),
            KeyScheme::Shared => self.shared.as_ref(),
        }
    }

    /// Encode `envelope` as a frame for `peer_id`
    pub fn encode(&self, peer_id: &str, envelope: &Envelope) -> Result<String> {
        let frame = match envelope {
            Envelope::Handshake(handshake) => WireFrame::Handshake(handshake.clone()),
            sealed => {
                let scheme = self.outbound_scheme(peer_id).ok_or_else(|| {
                    CryptoError::Encryption {
                        reason: format!("No envelope key available for {peer_id}"),
                    }
                })?;
                let cipher = self
                    .cipher_for(peer_id, scheme)
                    .ok_or_else(|| CryptoError::Encryption {
                        reason: format!("Missing {scheme:?} key for {peer_id}"),
                    })?;
                let plaintext = serde_json::to_vec(sealed)?;
                WireFrame::Sealed {
                    scheme,
                    data: cipher.encrypt(&plaintext)?,
                }
            }
        };

        let encoded = serde_json::to_string(&frame)?;
        if encoded.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: encoded.len(),
                max: MAX_FRAME_SIZE,
            }
            .into());
        }
        Ok(encoded)
    }

    /// Decode a frame received from `peer_id`
    pub fn decode(&self, peer_id: &str, payload: &str) -> Result<Envelope> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: payload.len(),
                max: MAX_FRAME_SIZE,
            }
            .into());
        }

        let frame: WireFrame =
            serde_json::from_str(payload).map_err(|e| ProtocolError::InvalidMessage {
                reason: e.to_string(),
            })?;

        match frame {
            WireFrame::Handshake(handshake) => Ok(Envelope::Handshake(handshake)),
            WireFrame::Sealed { scheme, data } => {
                let cipher =
                    self.cipher_for(peer_id, scheme)
                        .ok_or_else(|| CryptoError::Decryption {
                            reason: format!("No {scheme:?} key for {peer_id}"),
                        })?;
                let plaintext = cipher.decrypt(&data)?;
                let envelope: Envelope = serde_json::from_slice(&plaintext).map_err(|e| {
                    ProtocolError::InvalidMessage {
                        reason: e.to_string(),
                    }
                })?;

                if matches!(envelope, Envelope::Handshake(_)) {
                    return Err(ProtocolError::UnsupportedFrame {
                        reason: "handshake inside sealed frame".to_string(),
                    }
                    .into());
                }
                Ok(envelope)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::IdentityKeyPair;
    use crate::protocol::FileStart;
    use crate::utils::MessengerError;
    use uuid::Uuid;

    fn shared() -> Option<EnvelopeCipher> {
        Some(EnvelopeCipher::from_passphrase("test-passphrase").unwrap())
    }

    fn every_variant() -> Vec<Envelope> {
        let signer = IdentityKeyPair::generate();
        let file_id = Uuid::new_v4();
        vec![
            Envelope::handshake(&signer, "phone-1", "Alice", Some([9u8; 32])),
            Envelope::signed_message(&signer, "hi", "10:00"),
            Envelope::Delete {
                target_id: Uuid::new_v4(),
            },
            Envelope::FileStart(FileStart {
                file_id,
                file_name: "notes.txt".to_string(),
                file_size: 40 * 1024,
                file_type: "text/plain".to_string(),
                total_chunks: 3,
                timestamp: chrono::Utc::now(),
            }),
            Envelope::FileChunk {
                file_id,
                chunk_index: 1,
                data: vec![0, 1, 2, 255],
            },
            Envelope::FileEnd { file_id },
        ]
    }

    #[test]
    fn test_round_trip_shared_scheme() {
        let sender = EnvelopeCodec::new(AgreementKeyPair::generate(), shared());
        let receiver = EnvelopeCodec::new(AgreementKeyPair::generate(), shared());

        for envelope in every_variant() {
            let frame = sender.encode("bob", &envelope).unwrap();
            assert_eq!(receiver.decode("alice", &frame).unwrap(), envelope);
        }
    }

    #[test]
    fn test_round_trip_pair_scheme() {
        let mut alice = EnvelopeCodec::new(AgreementKeyPair::generate(), None);
        let mut bob = EnvelopeCodec::new(AgreementKeyPair::generate(), None);
        alice
            .learn_agreement_key("bob", &bob.agreement_public_key())
            .unwrap();
        bob.learn_agreement_key("alice", &alice.agreement_public_key())
            .unwrap();

        for envelope in every_variant() {
            let frame = alice.encode("bob", &envelope).unwrap();
            assert_eq!(bob.decode("alice", &frame).unwrap(), envelope);
        }
    }

    #[test]
    fn test_handshake_travels_in_plaintext() {
        let codec = EnvelopeCodec::new(AgreementKeyPair::generate(), shared());
        let signer = IdentityKeyPair::generate();
        let frame = codec
            .encode("bob", &Envelope::handshake(&signer, "phone-1", "Alice", None))
            .unwrap();

        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "handshake");
        assert_eq!(value["username"], "phone-1");
    }

    #[test]
    fn test_messages_are_sealed() {
        let codec = EnvelopeCodec::new(AgreementKeyPair::generate(), shared());
        let signer = IdentityKeyPair::generate();
        let frame = codec
            .encode("bob", &Envelope::signed_message(&signer, "top secret", "10:00"))
            .unwrap();

        assert!(!frame.contains("top secret"));
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "sealed");
        assert_eq!(value["scheme"], "shared");
    }

    #[test]
    fn test_pair_key_preferred_once_known() {
        let mut alice = EnvelopeCodec::new(AgreementKeyPair::generate(), shared());
        let bob = EnvelopeCodec::new(AgreementKeyPair::generate(), shared());
        assert_eq!(alice.outbound_scheme("bob"), Some(KeyScheme::Shared));

        alice
            .learn_agreement_key("bob", &bob.agreement_public_key())
            .unwrap();
        assert_eq!(alice.outbound_scheme("bob"), Some(KeyScheme::Pair));
    }

    #[test]
    fn test_no_key_available() {
        let codec = EnvelopeCodec::new(AgreementKeyPair::generate(), None);
        let result = codec.encode("bob", &Envelope::FileEnd { file_id: Uuid::new_v4() });
        assert!(matches!(
            result,
            Err(MessengerError::Crypto(CryptoError::Encryption { .. }))
        ));
    }

    #[test]
    fn test_wrong_shared_key_is_decryption_failure() {
        let sender = EnvelopeCodec::new(AgreementKeyPair::generate(), shared());
        let receiver = EnvelopeCodec::new(
            AgreementKeyPair::generate(),
            Some(EnvelopeCipher::from_passphrase("other").unwrap()),
        );
        let frame = sender
            .encode("bob", &Envelope::Delete { target_id: Uuid::new_v4() })
            .unwrap();

        let err = receiver.decode("alice", &frame).unwrap_err();
        assert!(err.is_security_violation());
    }

    #[test]
    fn test_sealed_handshake_rejected() {
        let cipher = EnvelopeCipher::from_passphrase("test-passphrase").unwrap();
        let signer = IdentityKeyPair::generate();
        let inner =
            serde_json::to_vec(&Envelope::handshake(&signer, "phone-1", "Alice", None)).unwrap();
        let frame = serde_json::to_string(&WireFrame::Sealed {
            scheme: KeyScheme::Shared,
            data: cipher.encrypt(&inner).unwrap(),
        })
        .unwrap();

        let codec = EnvelopeCodec::new(AgreementKeyPair::generate(), shared());
        assert!(matches!(
            codec.decode("alice", &frame),
            Err(MessengerError::Protocol(ProtocolError::UnsupportedFrame { .. }))
        ));
    }

    #[test]
    fn test_garbage_and_oversized_frames() {
        let codec = EnvelopeCodec::new(AgreementKeyPair::generate(), shared());
        assert!(codec.decode("alice", "U2FsdGVkX1+not-json").is_err());

        let oversized = "x".repeat(MAX_FRAME_SIZE + 1);
        assert!(matches!(
            codec.decode("alice", &oversized),
            Err(MessengerError::Protocol(ProtocolError::MessageTooLarge { .. }))
        ));
    }
}

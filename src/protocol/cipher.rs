//! Symmetric envelope encryption.
//!
//! ChaCha20-Poly1305 with a fresh random 12-byte nonce per call. Output is
//! `nonce ‖ ciphertext ‖ tag`.

use crate::crypto::KEY_SIZE;
use crate::utils::{CryptoError, Result};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use std::fmt;

/// Nonce length prepended to every ciphertext
const NONCE_SIZE: usize = 12;

/// HKDF info for the pre-shared application key
const SHARED_KEY_INFO: &[u8] = b"PeerCourier-SharedKey-v1";

/// A single symmetric envelope key
#[derive(Clone)]
pub struct EnvelopeCipher {
    key: [u8; KEY_SIZE],
}

impl fmt::Debug for EnvelopeCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvelopeCipher")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl EnvelopeCipher {
    /// Wrap an already-derived key
    pub fn from_key(key: [u8; KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Derive the application-wide key from a pre-shared passphrase.
    ///
    /// Every participant with the same passphrase can read every envelope;
    /// this only protects against passive observers.
    pub fn from_passphrase(passphrase: &str) -> Result<Self> {
        let hkdf = Hkdf::<Sha256>::new(None, passphrase.as_bytes());
        let mut key = [0u8; KEY_SIZE];
        hkdf.expand(SHARED_KEY_INFO, &mut key)
            .map_err(|_| CryptoError::KeyDerivation {
                reason: "Shared key derivation failed".to_string(),
            })?;
        Ok(Self { key })
    }

    /// Encrypt `plaintext` under a fresh nonce
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new(&self.key.into());
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);

        let mut ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::Encryption {
                reason: "Failed to encrypt envelope".to_string(),
            })?;

        let mut result = nonce.to_vec();
        result.append(&mut ciphertext);
        Ok(result)
    }

    /// Decrypt a `nonce ‖ ciphertext` blob produced by [`EnvelopeCipher::encrypt`]
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_SIZE {
            return Err(CryptoError::Decryption {
                reason: "Ciphertext too short".to_string(),
            }
            .into());
        }

        let cipher = ChaCha20Poly1305::new(&self.key.into());
        let nonce = Nonce::from_slice(&sealed[..NONCE_SIZE]);

        cipher.decrypt(nonce, &sealed[NONCE_SIZE..]).map_err(|_| {
            CryptoError::Decryption {
                reason: "Authentication tag mismatch".to_string(),
            }
            .into()
        })
    }
}

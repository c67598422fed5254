//! X25519 key agreement for per-pair envelope keys.
//!
//! Each profile owns a static agreement key announced in its handshake. Two
//! peers that know each other's agreement key derive the same 32-byte
//! envelope key without any further round trip.

use crate::utils::{CryptoError, Result};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};

/// Size of derived symmetric keys
pub const KEY_SIZE: usize = 32;

/// HKDF info for per-pair envelope keys
const PAIR_KEY_INFO: &[u8] = b"PeerCourier-PairKey-v1";

/// Static X25519 key pair
#[derive(Clone)]
pub struct AgreementKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl fmt::Debug for AgreementKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgreementKeyPair")
            .field("secret", &"[REDACTED]")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish()
    }
}

impl AgreementKeyPair {
    /// Generate a fresh agreement key pair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Restore a key pair from its 32 secret bytes
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes = <[u8; KEY_SIZE]>::try_from(bytes).map_err(|_| CryptoError::InvalidKey {
            reason: format!("Agreement key must be {} bytes, got {}", KEY_SIZE, bytes.len()),
        })?;
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    /// Public half, as announced in handshakes
    pub fn public_key_bytes(&self) -> [u8; KEY_SIZE] {
        self.public.to_bytes()
    }

    /// Secret half, for persistence
    pub fn secret_key_bytes(&self) -> [u8; KEY_SIZE] {
        self.secret.to_bytes()
    }

    /// Derive the envelope key shared with the owner of `remote_public`.
    ///
    /// The salt is both public keys in sorted order so both ends derive the
    /// same key regardless of who computes it.
    pub fn derive_pair_key(&self, remote_public: &[u8; KEY_SIZE]) -> Result<[u8; KEY_SIZE]> {
        let remote = PublicKey::from(*remote_public);
        let shared = self.secret.diffie_hellman(&remote);

        if !shared.was_contributory() {
            return Err(CryptoError::KeyDerivation {
                reason: "Low-order agreement key".to_string(),
            }
            .into());
        }

        let local = self.public.to_bytes();
        let (first, second) = if local <= *remote_public {
            (local, *remote_public)
        } else {
            (*remote_public, local)
        };
        let mut salt = [0u8; KEY_SIZE * 2];
        salt[..KEY_SIZE].copy_from_slice(&first);
        salt[KEY_SIZE..].copy_from_slice(&second);

        let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());
        let mut key = [0u8; KEY_SIZE];
        hkdf.expand(PAIR_KEY_INFO, &mut key)
            .map_err(|_| CryptoError::KeyDerivation {
                reason: "Pair key derivation failed".to_string(),
            })?;
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_sides_derive_same_key() {
        let alice = AgreementKeyPair::generate();
        let bob = AgreementKeyPair::generate();

        let from_alice = alice.derive_pair_key(&bob.public_key_bytes()).unwrap();
        let from_bob = bob.derive_pair_key(&alice.public_key_bytes()).unwrap();
        assert_eq!(from_alice, from_bob);
    }

    #[test]
    fn test_distinct_pairs_get_distinct_keys() {
        let alice = AgreementKeyPair::generate();
        let bob = AgreementKeyPair::generate();
        let carol = AgreementKeyPair::generate();

        let ab = alice.derive_pair_key(&bob.public_key_bytes()).unwrap();
        let ac = alice.derive_pair_key(&carol.public_key_bytes()).unwrap();
        assert_ne!(ab, ac);
    }

    #[test]
    fn test_low_order_point_rejected() {
        let alice = AgreementKeyPair::generate();
        assert!(alice.derive_pair_key(&[0u8; KEY_SIZE]).is_err());
    }

    #[test]
    fn test_secret_round_trip() {
        let original = AgreementKeyPair::generate();
        let restored = AgreementKeyPair::from_secret_bytes(&original.secret_key_bytes()).unwrap();
        assert_eq!(original.public_key_bytes(), restored.public_key_bytes());
    }
}

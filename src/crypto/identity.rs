//! Identity management and Ed25519 signing.
//!
//! The rest of the crate only needs two things from asymmetric crypto: a
//! [`Signer`] for the local account and the free [`verify`] function for
//! remote ones. [`IdentityKeyPair`] is the Ed25519 implementation of both.

use crate::crypto::AgreementKeyPair;
use crate::utils::{CryptoError, Result};
use ed25519_dalek::{
    Signature, Signer as _, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH,
    SECRET_KEY_LENGTH, SIGNATURE_LENGTH,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

const PROFILE_FILE: &str = "profile.json";
const PRIVATE_KEY_FILE: &str = "private_key";
const AGREEMENT_KEY_FILE: &str = "agreement_key";

/// Signing capability of the local account
pub trait Signer: Send {
    /// Sign `message`, returning the raw signature bytes
    fn sign(&self, message: &[u8]) -> Vec<u8>;

    /// Public half of the signing key, as announced in handshakes
    fn public_key(&self) -> Vec<u8>;
}

/// Verify `signature` over `message` with a peer's public key.
///
/// Malformed keys and signatures simply yield `false`.
pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key_bytes) = <[u8; PUBLIC_KEY_LENGTH]>::try_from(public_key) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; SIGNATURE_LENGTH]>::try_from(signature) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };

    verifying_key
        .verify(message, &Signature::from_bytes(&sig_bytes))
        .is_ok()
}

/// Ed25519 key pair for cryptographic identity operations
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("signing_key", &"[REDACTED]")
            .field("verifying_key", &hex::encode(self.verifying_key.to_bytes()))
            .finish()
    }
}

impl IdentityKeyPair {
    /// Generate a new random identity key pair
    ///
    /// # Example
    ///
    /// ```rust
    /// use peer_courier::crypto::IdentityKeyPair;
    ///
    /// let keypair = IdentityKeyPair::generate();
    /// ```
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Create an identity key pair from a 32-byte secret key
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKey` if the secret key has the wrong length
    pub fn from_secret_bytes(secret_bytes: &[u8]) -> Result<Self> {
        let bytes = <[u8; SECRET_KEY_LENGTH]>::try_from(secret_bytes).map_err(|_| {
            CryptoError::InvalidKey {
                reason: format!(
                    "Invalid secret key length: expected {}, got {}",
                    SECRET_KEY_LENGTH,
                    secret_bytes.len()
                ),
            }
        })?;

        let signing_key = SigningKey::from_bytes(&bytes);
        let verifying_key = signing_key.verifying_key();

        Ok(Self {
            signing_key,
            verifying_key,
        })
    }

    /// Get the public key as bytes
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.verifying_key.to_bytes()
    }

    /// Get the secret key as bytes
    pub fn secret_key_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.signing_key.to_bytes()
    }

    /// Verify a signature against this key pair's public key
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        if verify(&self.public_key_bytes(), message, signature) {
            Ok(())
        } else {
            Err(CryptoError::SignatureVerification.into())
        }
    }
}

impl Signer for IdentityKeyPair {
    fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }

    fn public_key(&self) -> Vec<u8> {
        self.public_key_bytes().to_vec()
    }
}

/// Public part of the local profile as written to `profile.json`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileRecord {
    /// Stable account identifier (also the peer id)
    pub username: String,
    /// Human-readable name
    pub display_name: String,
    /// Hex-encoded Ed25519 public key
    pub public_key: String,
    /// Creation timestamp
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Complete local account: public profile plus private key material
#[derive(Debug, Clone)]
pub struct UserProfile {
    /// Public profile information
    pub record: ProfileRecord,
    /// Signing key pair
    pub keypair: IdentityKeyPair,
    /// Key agreement pair used for per-peer envelope keys
    pub agreement: AgreementKeyPair,
}

impl UserProfile {
    /// Create a new profile with freshly generated keys
    pub fn new(username: String, display_name: String) -> Self {
        let keypair = IdentityKeyPair::generate();
        let record = ProfileRecord {
            username,
            display_name,
            public_key: hex::encode(keypair.public_key_bytes()),
            created_at: chrono::Utc::now(),
        };

        Self {
            record,
            keypair,
            agreement: AgreementKeyPair::generate(),
        }
    }

    /// Stable account identifier
    pub fn username(&self) -> &str {
        &self.record.username
    }

    /// Human-readable name
    pub fn display_name(&self) -> &str {
        &self.record.display_name
    }

    /// Whether profile files already exist in `keys_dir`
    pub fn exists_in(keys_dir: &Path) -> bool {
        keys_dir.join(PROFILE_FILE).exists() && keys_dir.join(PRIVATE_KEY_FILE).exists()
    }

    /// Load a profile previously written by [`UserProfile::save`]
    ///
    /// A missing agreement key is regenerated and written back; peers learn
    /// the new one from the next handshake.
    pub fn load(keys_dir: &Path) -> Result<Self> {
        let record: ProfileRecord =
            serde_json::from_str(&std::fs::read_to_string(keys_dir.join(PROFILE_FILE))?)?;
        let keypair = IdentityKeyPair::from_secret_bytes(&std::fs::read(
            keys_dir.join(PRIVATE_KEY_FILE),
        )?)?;

        if hex::encode(keypair.public_key_bytes()) != record.public_key {
            return Err(CryptoError::InvalidKey {
                reason: "Private key does not match profile public key".to_string(),
            }
            .into());
        }

        let agreement_path = keys_dir.join(AGREEMENT_KEY_FILE);
        let agreement = if agreement_path.exists() {
            AgreementKeyPair::from_secret_bytes(&std::fs::read(&agreement_path)?)?
        } else {
            let generated = AgreementKeyPair::generate();
            std::fs::write(&agreement_path, generated.secret_key_bytes())?;
            generated
        };

        Ok(Self {
            record,
            keypair,
            agreement,
        })
    }

    /// Write the profile and its key material into `keys_dir`
    pub fn save(&self, keys_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(keys_dir)?;
        std::fs::write(
            keys_dir.join(PROFILE_FILE),
            serde_json::to_string_pretty(&self.record)?,
        )?;
        std::fs::write(keys_dir.join(PRIVATE_KEY_FILE), self.keypair.secret_key_bytes())?;
        std::fs::write(
            keys_dir.join(AGREEMENT_KEY_FILE),
            self.agreement.secret_key_bytes(),
        )?;
        Ok(())
    }

    /// Load the profile from `keys_dir`, creating and saving one if absent
    pub fn load_or_create(keys_dir: &Path, username: &str, display_name: &str) -> Result<Self> {
        if Self::exists_in(keys_dir) {
            return Self::load(keys_dir);
        }

        log::info!("No identity found, generating one for '{}'", username);
        let profile = Self::new(username.to_string(), display_name.to_string());
        profile.save(keys_dir)?;
        Ok(profile)
    }
}

impl fmt::Display for UserProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.record.display_name, self.record.username)
    }
}

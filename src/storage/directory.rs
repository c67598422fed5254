//! Directory of known peer identities.
//!
//! Entries are created from the first handshake (or a manual contact add)
//! and patched by later handshakes. They are never removed automatically.

use crate::protocol::Handshake;
use crate::storage::Store;
use crate::utils::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Store key for the directory
pub const DIRECTORY_KEY: &str = "chat_users";

/// What we know about a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerIdentity {
    /// Transport-routable id
    pub peer_id: String,
    /// Stable account name from the handshake
    pub username: String,
    /// Display name from the handshake
    pub display_name: String,
    /// Ed25519 verifying key
    #[serde(
        default,
        with = "crate::protocol::envelope::b64_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub public_key: Option<Vec<u8>>,
    /// X25519 agreement key
    #[serde(
        default,
        with = "crate::protocol::envelope::b64_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub agreement_key: Option<Vec<u8>>,
}

impl PeerIdentity {
    fn placeholder(peer_id: &str) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            username: peer_id.to_string(),
            display_name: peer_id.to_string(),
            public_key: None,
            agreement_key: None,
        }
    }
}

/// Peer id → identity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityDirectory {
    peers: BTreeMap<String, PeerIdentity>,
}

impl IdentityDirectory {
    /// Empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `store`, or start empty
    pub fn load(store: &dyn Store) -> Result<Self> {
        let Some(value) = store.load(DIRECTORY_KEY)? else {
            return Ok(Self::new());
        };
        let peers = serde_json::from_value(value).map_err(|e| StorageError::Corrupt {
            key: DIRECTORY_KEY.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { peers })
    }

    /// Persist to `store`
    pub fn save(&self, store: &mut dyn Store) -> Result<()> {
        store.save(DIRECTORY_KEY, &serde_json::to_value(&self.peers)?)
    }

    /// Create or patch the entry for `peer_id` from a handshake.
    ///
    /// Returns whether anything changed.
    pub fn upsert_handshake(&mut self, peer_id: &str, handshake: &Handshake) -> bool {
        let entry = self
            .peers
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerIdentity::placeholder(peer_id));
        let before = entry.clone();

        entry.username = handshake.username.clone();
        entry.display_name = handshake.display_name.clone();
        entry.public_key = Some(handshake.public_key.clone());
        if handshake.agreement_key.is_some() {
            entry.agreement_key = handshake.agreement_key.clone();
        }

        let changed = *entry != before;
        if changed {
            log::info!("Directory updated for {} ({})", peer_id, entry.display_name);
        }
        changed
    }

    /// Create an entry with no key material if none exists
    pub fn add_manual(&mut self, peer_id: &str) -> bool {
        if self.peers.contains_key(peer_id) {
            return false;
        }
        self.peers
            .insert(peer_id.to_string(), PeerIdentity::placeholder(peer_id));
        true
    }

    /// Entry for `peer_id`
    pub fn get(&self, peer_id: &str) -> Option<&PeerIdentity> {
        self.peers.get(peer_id)
    }

    /// Verifying key for `peer_id`, if a handshake supplied one
    pub fn public_key(&self, peer_id: &str) -> Option<&[u8]> {
        self.peers.get(peer_id)?.public_key.as_deref()
    }

    /// Username for `peer_id`, if a handshake supplied one
    pub fn username(&self, peer_id: &str) -> Option<&str> {
        self.peers
            .get(peer_id)
            .filter(|p| p.public_key.is_some())
            .map(|p| p.username.as_str())
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether the directory is empty
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// All entries, ordered by peer id
    pub fn iter(&self) -> impl Iterator<Item = &PeerIdentity> {
        self.peers.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn handshake(username: &str, display_name: &str, key: u8) -> Handshake {
        Handshake {
            public_key: vec![key; 32],
            username: username.to_string(),
            display_name: display_name.to_string(),
            agreement_key: Some(vec![key; 32]),
        }
    }

    #[test]
    fn test_upsert_creates_then_patches() {
        let mut directory = IdentityDirectory::new();
        assert!(directory.upsert_handshake("bob", &handshake("bob", "Bob", 1)));
        assert!(!directory.upsert_handshake("bob", &handshake("bob", "Bob", 1)));
        assert_eq!(directory.public_key("bob"), Some(&[1u8; 32][..]));

        assert!(directory.upsert_handshake("bob", &handshake("bob", "Robert", 2)));
        let entry = directory.get("bob").unwrap();
        assert_eq!(entry.display_name, "Robert");
        assert_eq!(entry.public_key.as_deref(), Some(&[2u8; 32][..]));
        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn test_manual_entry_has_no_key() {
        let mut directory = IdentityDirectory::new();
        assert!(directory.add_manual("phone-123"));
        assert!(!directory.add_manual("phone-123"));
        assert_eq!(directory.public_key("phone-123"), None);
        assert_eq!(directory.username("phone-123"), None);

        directory.upsert_handshake("phone-123", &handshake("carol", "Carol", 3));
        assert_eq!(directory.username("phone-123"), Some("carol"));
    }

    #[test]
    fn test_persistence() {
        let mut store = MemoryStore::new();
        let mut directory = IdentityDirectory::new();
        directory.upsert_handshake("bob", &handshake("bob", "Bob", 1));
        directory.add_manual("carol");
        directory.save(&mut store).unwrap();

        let reloaded = IdentityDirectory::load(&store).unwrap();
        assert_eq!(reloaded, directory);
        assert!(IdentityDirectory::load(&MemoryStore::new()).unwrap().is_empty());
    }
}

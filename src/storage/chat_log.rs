//! Contacts and per-peer chat histories.

use crate::storage::Store;
use crate::utils::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Contact summary text for a deleted last message
pub const DELETED_PLACEHOLDER: &str = "This message was deleted";

/// Who wrote a message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    /// The local user
    Me,
    /// A remote peer
    Peer(String),
}

/// One entry in a chat history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Message id, unique within a chat
    pub id: Uuid,
    /// Author
    pub sender: Sender,
    /// Body, or the file name for file messages
    pub text: String,
    /// Display time as rendered by the sender
    pub time: String,
    /// Whether the signature checked out
    pub is_verified: bool,
    /// Whether the author deleted it
    #[serde(default)]
    pub deleted: bool,
    /// Blob handle for a received file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    /// MIME type of the file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    /// Original file name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

impl ChatMessage {
    /// A text message
    pub fn text(id: Uuid, sender: Sender, text: &str, time: &str, is_verified: bool) -> Self {
        Self {
            id,
            sender,
            text: text.to_string(),
            time: time.to_string(),
            is_verified,
            deleted: false,
            file_url: None,
            file_type: None,
            file_name: None,
        }
    }

    /// A file message pointing at a stored blob
    pub fn file(
        id: Uuid,
        sender: Sender,
        file_name: &str,
        file_type: &str,
        file_url: &str,
        time: &str,
    ) -> Self {
        Self {
            file_url: Some(file_url.to_string()),
            file_type: Some(file_type.to_string()),
            file_name: Some(file_name.to_string()),
            ..Self::text(id, sender, file_name, time, false)
        }
    }
}

/// Contact list row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    /// Peer id
    pub id: String,
    /// Display name
    pub name: String,
    /// Summary of the most recent message
    #[serde(default)]
    pub last_message: String,
    /// Time of the most recent message
    #[serde(default)]
    pub last_message_time: String,
}

/// Everything persisted for one local account
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatData {
    /// Contact list in insertion order
    #[serde(default)]
    pub contacts: Vec<Contact>,
    /// Peer id → history
    #[serde(default)]
    pub chats: BTreeMap<String, Vec<ChatMessage>>,
}

/// Turn user input into a contact id; all-digit input becomes `phone-<digits>`
pub fn normalize_contact_id(input: &str) -> String {
    let trimmed = input.trim();
    if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
        format!("phone-{trimmed}")
    } else {
        trimmed.to_string()
    }
}

/// Contacts and histories of the local account
#[derive(Debug, Clone)]
pub struct ChatLog {
    username: String,
    data: ChatData,
}

impl ChatLog {
    /// Empty log for `username`
    pub fn new(username: &str) -> Self {
        Self {
            username: username.to_string(),
            data: ChatData::default(),
        }
    }

    /// Store key for this account
    pub fn store_key(&self) -> String {
        format!("chat_data_{}", self.username)
    }

    /// Load the log for `username`, or start empty
    pub fn load(store: &dyn Store, username: &str) -> Result<Self> {
        let mut log = Self::new(username);
        let key = log.store_key();
        if let Some(value) = store.load(&key)? {
            log.data = serde_json::from_value(value).map_err(|e| StorageError::Corrupt {
                key,
                reason: e.to_string(),
            })?;
        }
        Ok(log)
    }

    /// Persist to `store`
    pub fn save(&self, store: &mut dyn Store) -> Result<()> {
        store.save(&self.store_key(), &serde_json::to_value(&self.data)?)
    }

    /// All persisted data
    pub fn data(&self) -> &ChatData {
        &self.data
    }

    /// Contact list
    pub fn contacts(&self) -> &[Contact] {
        &self.data.contacts
    }

    /// Contact row for `peer_id`
    pub fn contact(&self, peer_id: &str) -> Option<&Contact> {
        self.data.contacts.iter().find(|c| c.id == peer_id)
    }

    /// History with `peer_id`, oldest first
    pub fn history(&self, peer_id: &str) -> &[ChatMessage] {
        self.data
            .chats
            .get(peer_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Add a contact typed in by the user.
    ///
    /// Returns `None` if the contact already exists.
    pub fn add_contact(
        &mut self,
        input: &str,
        name: Option<&str>,
        local_id: &str,
    ) -> Result<Option<Contact>> {
        let id = normalize_contact_id(input);
        if id.is_empty() {
            return Err(StorageError::InvalidContact {
                id,
                reason: "empty id".to_string(),
            }
            .into());
        }
        if id == local_id {
            return Err(StorageError::InvalidContact {
                id,
                reason: "cannot add yourself".to_string(),
            }
            .into());
        }
        if self.contact(&id).is_some() {
            return Ok(None);
        }

        let contact = Contact {
            name: name.map(str::to_string).unwrap_or_else(|| id.clone()),
            id,
            last_message: String::new(),
            last_message_time: String::new(),
        };
        self.data.contacts.push(contact.clone());
        Ok(Some(contact))
    }

    /// Add `peer_id` as a contact if it is not one yet. Returns whether it was added.
    pub fn ensure_contact(&mut self, peer_id: &str, name: &str) -> bool {
        if self.contact(peer_id).is_some() {
            return false;
        }
        log::info!("Adding {} to contacts as {}", peer_id, name);
        self.data.contacts.push(Contact {
            id: peer_id.to_string(),
            name: name.to_string(),
            last_message: String::new(),
            last_message_time: String::new(),
        });
        true
    }

    /// Append `message` to the history with `peer_id`.
    ///
    /// Returns `false` if a message with the same id is already recorded.
    pub fn record(&mut self, peer_id: &str, message: ChatMessage) -> bool {
        let history = self.data.chats.entry(peer_id.to_string()).or_default();
        if history.iter().any(|m| m.id == message.id) {
            log::debug!("Ignoring duplicate message {} from {}", message.id, peer_id);
            return false;
        }

        let summary = message.text.clone();
        let time = message.time.clone();
        history.push(message);

        if let Some(contact) = self.data.contacts.iter_mut().find(|c| c.id == peer_id) {
            contact.last_message = summary;
            contact.last_message_time = time;
        }
        true
    }

    /// Whether the history with `peer_id` already holds message `id`
    pub fn contains(&self, peer_id: &str, id: &Uuid) -> bool {
        self.history(peer_id).iter().any(|m| &m.id == id)
    }

    /// Delete `target_id` from the history with `peer_id` on behalf of `author`.
    ///
    /// Only the message's own author may delete it. Returns whether a
    /// message was deleted.
    pub fn delete(&mut self, peer_id: &str, target_id: &Uuid, author: &Sender) -> bool {
        let Some(history) = self.data.chats.get_mut(peer_id) else {
            return false;
        };
        let Some(position) = history.iter().position(|m| m.id == *target_id) else {
            return false;
        };

        let message = &mut history[position];
        if &message.sender != author {
            log::warn!(
                "Refusing delete of {} in chat {}: not authored by {:?}",
                target_id,
                peer_id,
                author
            );
            return false;
        }
        if message.deleted {
            return false;
        }

        message.deleted = true;
        message.text.clear();
        message.file_url = None;

        if position + 1 == history.len() {
            if let Some(contact) = self.data.contacts.iter_mut().find(|c| c.id == peer_id) {
                contact.last_message = DELETED_PLACEHOLDER.to_string();
            }
        }
        true
    }
}

//! Persistence: key-value store, identity directory and chat log.

pub mod chat_log;
pub mod directory;
pub mod store;

pub use chat_log::{
    normalize_contact_id, ChatData, ChatLog, ChatMessage, Contact, Sender, DELETED_PLACEHOLDER,
};
pub use directory::{IdentityDirectory, PeerIdentity, DIRECTORY_KEY};
pub use store::{FileStore, MemoryStore, Store};

//! Key-value persistence.
//!
//! Values are JSON documents addressed by a flat string key. Binary blobs
//! (received files) are stored separately and addressed by an opaque
//! handle returned from [`Store::put_blob`].

use crate::utils::{MessengerError, Result, StorageError};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Persistent store contract
pub trait Store: Send {
    /// Load the document under `key`
    fn load(&self, key: &str) -> Result<Option<Value>>;

    /// Replace the document under `key`
    fn save(&mut self, key: &str, value: &Value) -> Result<()>;

    /// Store `bytes` and return a handle for [`Store::get_blob`]
    fn put_blob(&mut self, name: &str, bytes: &[u8]) -> Result<String>;

    /// Fetch a blob by handle
    fn get_blob(&self, handle: &str) -> Result<Option<Vec<u8>>>;
}

fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !key.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey {
            key: key.to_string(),
        }
        .into())
    }
}

/// Reduce a user-supplied file name to something safe to embed in a path
fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Volatile store for tests and demos
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    values: HashMap<String, Value>,
    blobs: HashMap<String, Vec<u8>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<Value>> {
        validate_key(key)?;
        Ok(self.values.get(key).cloned())
    }

    fn save(&mut self, key: &str, value: &Value) -> Result<()> {
        validate_key(key)?;
        self.values.insert(key.to_string(), value.clone());
        Ok(())
    }

    fn put_blob(&mut self, name: &str, bytes: &[u8]) -> Result<String> {
        let handle = format!("mem:{}-{}", Uuid::new_v4(), sanitize_name(name));
        self.blobs.insert(handle.clone(), bytes.to_vec());
        Ok(handle)
    }

    fn get_blob(&self, handle: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.get(handle).cloned())
    }
}

/// Directory-backed store.
///
/// Documents live in `<root>/<key>.json`, blobs in `<root>/blobs/`. Writes go
/// to a temporary file that is renamed over the target.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (and create) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("blobs"))?;
        Ok(Self { root })
    }

    /// Store root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }

    fn blob_path(&self, handle: &str) -> Option<PathBuf> {
        let file = handle.strip_prefix("blob:")?;
        validate_key(file).ok()?;
        Some(self.root.join("blobs").join(file))
    }

    fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            MessengerError::from(e)
        })
    }
}

impl Store for FileStore {
    fn load(&self, key: &str) -> Result<Option<Value>> {
        validate_key(key)?;
        let path = self.document_path(key);
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| {
                StorageError::Corrupt {
                    key: key.to_string(),
                    reason: e.to_string(),
                }
                .into()
            })
    }

    fn save(&mut self, key: &str, value: &Value) -> Result<()> {
        validate_key(key)?;
        let content = serde_json::to_vec_pretty(value)?;
        Self::write_atomically(&self.document_path(key), &content)
    }

    fn put_blob(&mut self, name: &str, bytes: &[u8]) -> Result<String> {
        let file = format!("{}-{}", Uuid::new_v4().simple(), sanitize_name(name));
        Self::write_atomically(&self.root.join("blobs").join(&file), bytes)?;
        log::debug!("Stored blob {} ({} bytes)", file, bytes.len());
        Ok(format!("blob:{file}"))
    }

    fn get_blob(&self, handle: &str) -> Result<Option<Vec<u8>>> {
        let Some(path) = self.blob_path(handle) else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(std::fs::read(path)?))
    }
}

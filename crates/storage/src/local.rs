//! Durable per-device local store
//!
//! This module provides the collection store that every other sync component
//! reads and writes through. It uses sled, with one tree per named
//! collection, and stores documents as JSON keyed by their id.
//!
//! Each call is atomic on its own: `put`, `get_all` and `delete` never
//! observe a half-written document. That per-call atomicity is the only
//! synchronization point the sync layer relies on.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sled::Db;
use std::sync::Arc;
use thiserror::Error;

use crate::record::Record;

/// Prefix reserved for local-only system collections
pub const SYSTEM_PREFIX: char = '_';

/// Local store error types
#[derive(Debug, Error)]
pub enum LocalStoreError {
    /// Sled database error
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid collection name
    #[error("Invalid collection: {0}")]
    InvalidCollection(String),

    /// Document without a usable id
    #[error("Invalid document id in collection {0}")]
    InvalidId(String),
}

/// Result type for local store operations
pub type Result<T> = std::result::Result<T, LocalStoreError>;

/// A document that can live in a collection
pub trait Document: Serialize + DeserializeOwned {
    /// Key under which the document is stored
    fn doc_id(&self) -> &str;
}

impl Document for Record {
    fn doc_id(&self) -> &str {
        &self.id
    }
}

/// Local store configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalStoreConfig {
    /// Database path
    pub path: String,
    /// Cache capacity in bytes
    pub cache_capacity: u64,
    /// Enable compression
    pub use_compression: bool,
    /// Flush interval in milliseconds (None for explicit flushes only)
    pub flush_every_ms: Option<u64>,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            path: "tillsync_local.db".to_string(),
            cache_capacity: 64 * 1024 * 1024, // 64MB
            use_compression: true,
            flush_every_ms: Some(500),
        }
    }
}

impl LocalStoreConfig {
    /// Create a new configuration with a custom path
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set cache capacity in bytes
    pub fn cache_capacity(mut self, bytes: u64) -> Self {
        self.cache_capacity = bytes;
        self
    }

    /// Enable or disable compression
    pub fn use_compression(mut self, enabled: bool) -> Self {
        self.use_compression = enabled;
        self
    }

    /// Set flush interval in milliseconds
    pub fn flush_every_ms(mut self, ms: Option<u64>) -> Self {
        self.flush_every_ms = ms;
        self
    }
}

/// Collection store backed by sled
///
/// Cloning is cheap and every clone shares the same database.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Db>,
}

impl LocalStore {
    /// Open (or create) the on-disk store
    pub fn open(config: LocalStoreConfig) -> Result<Self> {
        let mut db_config = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_capacity)
            .use_compression(config.use_compression);

        if let Some(ms) = config.flush_every_ms {
            db_config = db_config.flush_every_ms(Some(ms));
        }

        let db = db_config.open()?;
        tracing::debug!(path = %config.path, "opened local store");

        Ok(Self { db: Arc::new(db) })
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db: Arc::new(db) })
    }

    fn tree(&self, collection: &str) -> Result<sled::Tree> {
        if collection.is_empty() {
            return Err(LocalStoreError::InvalidCollection(collection.to_string()));
        }
        Ok(self.db.open_tree(collection.as_bytes())?)
    }

    /// Insert or replace a document, keyed by its id
    pub fn put<T: Document>(&self, collection: &str, doc: &T) -> Result<()> {
        let id = doc.doc_id();
        if id.is_empty() {
            return Err(LocalStoreError::InvalidId(collection.to_string()));
        }
        let bytes = serde_json::to_vec(doc)?;
        self.tree(collection)?.insert(id.as_bytes(), bytes)?;
        Ok(())
    }

    /// Get a single document by id
    pub fn get<T: Document>(&self, collection: &str, id: &str) -> Result<Option<T>> {
        match self.tree(collection)?.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Get every document in a collection
    ///
    /// Callers must not rely on the returned order.
    pub fn get_all<T: Document>(&self, collection: &str) -> Result<Vec<T>> {
        let mut docs = Vec::new();
        for item in self.tree(collection)?.iter() {
            let (_, bytes) = item?;
            docs.push(serde_json::from_slice(&bytes)?);
        }
        Ok(docs)
    }

    /// Remove a document; a missing id is a no-op
    ///
    /// Returns whether a document was removed.
    pub fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        Ok(self.tree(collection)?.remove(id.as_bytes())?.is_some())
    }

    /// Check if a document exists
    pub fn contains(&self, collection: &str, id: &str) -> Result<bool> {
        Ok(self.tree(collection)?.contains_key(id.as_bytes())?)
    }

    /// Number of documents in a collection
    pub fn len(&self, collection: &str) -> Result<usize> {
        Ok(self.tree(collection)?.len())
    }

    /// Whether a collection holds no documents
    pub fn is_empty(&self, collection: &str) -> Result<bool> {
        Ok(self.tree(collection)?.is_empty())
    }

    /// Names of all user collections (system collections excluded)
    pub fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .db
            .tree_names()
            .into_iter()
            .filter_map(|name| String::from_utf8(name.to_vec()).ok())
            .filter(|name| !name.starts_with(SYSTEM_PREFIX) && !name.starts_with("__sled"))
            .collect();
        names.sort();
        names
    }

    /// Remove every document in a collection
    pub fn clear_collection(&self, collection: &str) -> Result<()> {
        self.tree(collection)?.clear()?;
        Ok(())
    }

    /// Draw a fresh, strictly increasing sequence number
    pub fn next_sequence(&self) -> Result<u64> {
        Ok(self.db.generate_id()?)
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

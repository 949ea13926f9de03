//! Error taxonomy of the sync engine
//!
//! Only [`SyncError::LocalStore`] is fatal to a caller. Remote failures are
//! absorbed by the queue and surface through `SyncStatus::last_error`; they
//! reach a caller only from explicit sync operations.

use networking::RemoteError;
use std::sync::Arc;
use storage::LocalStoreError;

/// Errors that can occur in the sync engine
///
/// `Clone` so a single in-flight reconciliation can hand the same outcome to
/// every caller waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    /// Storage or serialization fault in the local store
    #[error("Local store error: {0}")]
    LocalStore(Arc<LocalStoreError>),

    /// Record absent locally (or owned by another tenant)
    #[error("Record not found: {collection}/{id}")]
    NotFound {
        /// Collection searched
        collection: String,
        /// Missing id
        id: String,
    },

    /// Pull phase failed; the pass was aborted and the local store left untouched
    #[error("Remote read failed for table {table}: {source}")]
    RemoteRead {
        /// Remote table
        table: String,
        /// Backend error
        source: RemoteError,
    },

    /// Push failed; the mutation stays queued
    #[error("Remote write failed for table {table}: {source}")]
    RemoteWrite {
        /// Remote table
        table: String,
        /// Backend error
        source: RemoteError,
    },

    /// Id already taken by a record of another owner on this device
    #[error("Record {collection}/{id} belongs to another owner")]
    ForeignRecord {
        /// Collection written to
        collection: String,
        /// Conflicting id
        id: String,
    },

    /// Collection has no remote table
    #[error("Collection {0} is local-only")]
    Unmapped(String),

    /// Collection mapping is not one-to-one
    #[error("Invalid collection mapping: {0}")]
    InvalidMapping(String),

    /// Write payload is not a JSON object
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

impl From<LocalStoreError> for SyncError {
    fn from(err: LocalStoreError) -> Self {
        SyncError::LocalStore(Arc::new(err))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::LocalStore(Arc::new(LocalStoreError::Serialization(err)))
    }
}

impl SyncError {
    /// Whether this error is a genuine local storage fault
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::LocalStore(_))
    }
}

/// Result type for sync engine operations
pub type Result<T> = std::result::Result<T, SyncError>;

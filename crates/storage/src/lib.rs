//! Storage layer for TillSync
//!
//! This crate provides the durable per-device collection store, the record
//! envelope, the replay queue for pending remote writes and sync metadata.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod local;
pub mod meta;
pub mod queue;
pub mod record;

pub use local::{Document, LocalStore, LocalStoreConfig, LocalStoreError, Result};
pub use meta::{MetaStore, SyncMeta, META_COLLECTION};
pub use queue::{
    Operation, QueueEntry, ReplayOutcome, SyncQueue, QUEUE_COLLECTION, QUEUE_INDEX_COLLECTION,
};
pub use record::Record;

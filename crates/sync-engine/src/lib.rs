//! Offline-first sync engine for TillSync
//!
//! This crate keeps a per-device local store in step with the multi-tenant
//! remote backend: local writes first, a durable replay queue, two-phase
//! table reconciliation, realtime change channels and per-owner partitioning
//! of everything stored on the device.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use networking::{RemoteConfig, RestBackend};
//! use serde_json::json;
//! use storage::LocalStore;
//! use sync_engine::{
//!     CollectionMap, ManualNetworkStatus, NetworkState, Session, SyncConfig, SyncEngine,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let remote = RestBackend::new(RemoteConfig::new("https://pos.example.com"))?;
//! let network = Arc::new(ManualNetworkStatus::new(NetworkState::Offline));
//! let engine = SyncEngine::new(
//!     LocalStore::in_memory()?,
//!     Arc::new(remote),
//!     network,
//!     CollectionMap::new([("products", "products"), ("sales", "orders")])?,
//!     SyncConfig::default(),
//! )?;
//!
//! let session = Session::new("store-42");
//! engine.save_data(&session, "products", json!({"name": "Widget", "price": 10})).await?;
//! assert_eq!(engine.status().pending_changes, 1);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod conflict;
pub mod engine;
pub mod error;
pub mod mapping;
pub mod network;
pub mod realtime;
pub mod session;
pub mod status;
pub mod tenant;

#[cfg(test)]
mod testing;

pub use config::{ConflictStrategy, SyncConfig};
pub use conflict::{resolve, Winner};
pub use engine::SyncEngine;
pub use error::{Result, SyncError};
pub use mapping::CollectionMap;
pub use network::{
    ManualNetworkStatus, NetworkMonitor, NetworkState, NetworkStatus, ProbeNetworkStatus,
};
pub use realtime::{ChangeCallback, RealtimeSubscriber};
pub use session::Session;
pub use status::{SyncEvent, SyncReport, SyncStatus};
pub use tenant::{filter_by_owner, ClearReport, TenantPartition};

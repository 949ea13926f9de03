//! Networking layer for TillSync
//!
//! This crate provides the remote backend client (REST upsert, delete and
//! tenant-scoped select), the realtime change channel over WebSocket, and a
//! connectivity probe.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod probe;
pub mod realtime;
pub mod remote;

pub use probe::ConnectivityProbe;
pub use realtime::{
    ChangeEvent, ChangeKind, ChangeStream, RealtimeTransport, SubscriptionError, WebSocketTransport,
};
pub use remote::{RemoteBackend, RemoteConfig, RemoteError, RestBackend};

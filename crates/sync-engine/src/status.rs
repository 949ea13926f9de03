//! Sync status snapshot and event broadcast

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::conflict::Winner;
use crate::network::NetworkState;

/// Observable state of the engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    /// A reconciliation pass is running
    pub is_syncing: bool,
    /// Start of the most recent successful pass
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Queue entries awaiting remote delivery
    pub pending_changes: usize,
    /// Most recent remote failure, cleared by a clean pass
    pub last_error: Option<String>,
}

/// Counters from one `sync_table` pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Remote records written into the local store
    pub pulled: usize,
    /// Local records removed (tombstones or remote deletions)
    pub removed: usize,
    /// Queue entries acknowledged by the remote
    pub pushed: usize,
    /// Queue entries that failed and stay queued
    pub failed: usize,
}

/// Events broadcast by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Status snapshot changed
    StatusChanged(SyncStatus),

    /// Network connectivity changed
    NetworkChanged {
        /// New state
        state: NetworkState,
    },

    /// A table finished a reconciliation pass
    TableSynced {
        /// Remote table
        table: String,
        /// Pass counters
        report: SyncReport,
    },

    /// A conflicting record was merged
    ConflictResolved {
        /// Remote table
        table: String,
        /// Record id
        id: String,
        /// Surviving copy
        winner: Winner,
    },

    /// A realtime event was applied to the local store
    RemoteChange {
        /// Remote table
        table: String,
        /// Record id
        id: String,
        /// The change removed the record
        deleted: bool,
    },

    /// Reconnect handling (drain, reconcile, resubscribe) finished
    Reconnected {
        /// Queue entries delivered by the drain
        drained: usize,
    },
}

struct StatusState {
    status: SyncStatus,
    active_passes: usize,
}

/// Shared status with change notification
pub(crate) struct StatusTracker {
    state: RwLock<StatusState>,
    events: broadcast::Sender<SyncEvent>,
}

impl StatusTracker {
    pub(crate) fn new(buffer: usize) -> Self {
        let (events, _) = broadcast::channel(buffer.max(1));
        Self {
            state: RwLock::new(StatusState {
                status: SyncStatus::default(),
                active_passes: 0,
            }),
            events,
        }
    }

    pub(crate) fn snapshot(&self) -> SyncStatus {
        self.state.read().status.clone()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    fn update(&self, f: impl FnOnce(&mut StatusState)) {
        let changed = {
            let mut state = self.state.write();
            let before = state.status.clone();
            f(&mut state);
            state.status.is_syncing = state.active_passes > 0;
            (state.status != before).then(|| state.status.clone())
        };
        if let Some(status) = changed {
            self.emit(SyncEvent::StatusChanged(status));
        }
    }

    pub(crate) fn begin_pass(&self) {
        self.update(|s| s.active_passes += 1);
    }

    /// Finish a pass that reached the remote; `error` carries push failures
    pub(crate) fn end_pass(&self, started: DateTime<Utc>, error: Option<String>) {
        self.update(|s| {
            s.active_passes = s.active_passes.saturating_sub(1);
            s.status.last_sync_time =
                Some(s.status.last_sync_time.map_or(started, |t| t.max(started)));
            s.status.last_error = error;
        });
    }

    /// Finish a pass that was aborted
    pub(crate) fn abort_pass(&self, error: String) {
        self.update(|s| {
            s.active_passes = s.active_passes.saturating_sub(1);
            s.status.last_error = Some(error);
        });
    }

    pub(crate) fn set_pending(&self, pending: usize) {
        self.update(|s| s.status.pending_changes = pending);
    }

    pub(crate) fn record_error(&self, error: String) {
        self.update(|s| s.status.last_error = Some(error));
    }
}

//! Engine configuration

use serde::Deserialize;
use std::time::Duration;

/// Conflict resolution strategy used by pull and realtime merges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Newer `updated_at` wins, remote wins ties
    ///
    /// Clock skew between devices can invert the intended order.
    #[default]
    LastWriteWins,

    /// Higher per-record `version` wins, then `updated_at`, remote wins full ties
    HighestVersion,
}

/// Configuration for the sync engine
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Conflict resolution strategy
    pub conflict_strategy: ConflictStrategy,

    /// Capacity of the sync event broadcast channel
    pub event_buffer: usize,

    /// How often a probing network status polls the backend
    pub probe_interval: Duration,

    /// Timeout for a single connectivity probe
    pub probe_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            conflict_strategy: ConflictStrategy::LastWriteWins,
            event_buffer: 100,
            probe_interval: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

impl SyncConfig {
    /// Set the conflict strategy
    pub fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = strategy;
        self
    }

    /// Set the event channel capacity
    pub fn with_event_buffer(mut self, size: usize) -> Self {
        self.event_buffer = size;
        self
    }

    /// Set the probe interval
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Set the timeout of a single probe
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }
}

//! Connectivity tracking and reconnect handling
//!
//! The platform connectivity signal is injected through [`NetworkStatus`].
//! [`NetworkMonitor`] watches it and, on every offline to online transition,
//! drains the sync queue, reconciles every mapped collection and reopens
//! realtime channels. Going offline tears the channels down.

use networking::{ConnectivityProbe, RemoteConfig, RemoteError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::engine::SyncEngine;
use crate::realtime::RealtimeSubscriber;
use crate::session::Session;
use crate::status::SyncEvent;

/// Network connectivity state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NetworkState {
    /// Connected to network
    Online,

    /// Disconnected from network
    Offline,

    /// Network state unknown
    Unknown,
}

impl fmt::Display for NetworkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkState::Online => write!(f, "online"),
            NetworkState::Offline => write!(f, "offline"),
            NetworkState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Source of connectivity information
///
/// Implementations notify subscribers only when the state actually changes.
#[cfg_attr(test, mockall::automock)]
pub trait NetworkStatus: Send + Sync {
    /// Current state
    fn current(&self) -> NetworkState;

    /// Receiver that observes every state change
    fn subscribe(&self) -> watch::Receiver<NetworkState>;
}

/// Connectivity driven by the host platform (or a test)
pub struct ManualNetworkStatus {
    tx: watch::Sender<NetworkState>,
}

impl ManualNetworkStatus {
    /// Create with an initial state
    pub fn new(initial: NetworkState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Publish a new state; repeated states are not re-broadcast
    pub fn set(&self, state: NetworkState) {
        self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    /// Shorthand for `set(NetworkState::Online)`
    pub fn go_online(&self) {
        self.set(NetworkState::Online);
    }

    /// Shorthand for `set(NetworkState::Offline)`
    pub fn go_offline(&self) {
        self.set(NetworkState::Offline);
    }
}

impl Default for ManualNetworkStatus {
    fn default() -> Self {
        Self::new(NetworkState::Unknown)
    }
}

impl NetworkStatus for ManualNetworkStatus {
    fn current(&self) -> NetworkState {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.tx.subscribe()
    }
}

/// Connectivity derived from periodically probing the backend
///
/// The probe task stops when this value is dropped.
pub struct ProbeNetworkStatus {
    tx: Arc<watch::Sender<NetworkState>>,
    task: JoinHandle<()>,
}

impl ProbeNetworkStatus {
    /// Start probing every `interval`; must be called inside a tokio runtime
    pub fn spawn(probe: ConnectivityProbe, interval: Duration) -> Self {
        let (tx, _) = watch::channel(NetworkState::Unknown);
        let tx = Arc::new(tx);
        let sender = Arc::clone(&tx);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let state = if probe.check().await {
                    NetworkState::Online
                } else {
                    NetworkState::Offline
                };
                let changed = sender.send_if_modified(|current| {
                    if *current == state {
                        false
                    } else {
                        *current = state;
                        true
                    }
                });
                if changed {
                    tracing::info!(url = probe.url(), %state, "connectivity changed");
                }
            }
        });

        Self { tx, task }
    }

    /// Probe the backend of `remote` with the interval and timeout of `config`
    pub fn from_config(remote: &RemoteConfig, config: &SyncConfig) -> Result<Self, RemoteError> {
        let probe = ConnectivityProbe::new(remote, config.probe_timeout)?;
        Ok(Self::spawn(probe, config.probe_interval))
    }
}

impl NetworkStatus for ProbeNetworkStatus {
    fn current(&self) -> NetworkState {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.tx.subscribe()
    }
}

impl Drop for ProbeNetworkStatus {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct MonitorInner {
    engine: SyncEngine,
    realtime: Option<RealtimeSubscriber>,
    session: RwLock<Option<Session>>,
}

impl MonitorInner {
    async fn on_transition(&self, from: NetworkState, to: NetworkState) {
        tracing::info!(%from, %to, "network transition");
        self.engine.tracker().emit(SyncEvent::NetworkChanged { state: to });

        if to == NetworkState::Online && from != NetworkState::Online {
            self.on_reconnect().await;
        } else if from == NetworkState::Online && to != NetworkState::Online {
            if let Some(realtime) = &self.realtime {
                realtime.suspend();
            }
        }
    }

    async fn on_reconnect(&self) {
        let Some(session) = self.session.read().clone() else {
            tracing::debug!("reconnected without an active session");
            return;
        };

        let drained = match self.engine.drain_queue(&session).await {
            Ok(outcome) => outcome.replayed,
            Err(err) => {
                tracing::error!(owner_id = session.owner_id(), error = %err, "queue drain failed");
                0
            }
        };

        for (table, result) in self.engine.sync_all(&session).await {
            if let Err(err) = result {
                tracing::warn!(
                    table = %table,
                    owner_id = session.owner_id(),
                    error = %err,
                    "reconnect sync failed"
                );
            }
        }

        if let Some(realtime) = &self.realtime {
            realtime.resume(&session).await;
        }

        self.engine.tracker().emit(SyncEvent::Reconnected { drained });
    }
}

/// Reacts to connectivity transitions on behalf of the active session
///
/// The watcher task stops when the monitor is dropped.
pub struct NetworkMonitor {
    inner: Arc<MonitorInner>,
    task: JoinHandle<()>,
}

impl NetworkMonitor {
    /// Start watching `status`; must be called inside a tokio runtime
    pub fn spawn(
        status: Arc<dyn NetworkStatus>,
        engine: SyncEngine,
        realtime: Option<RealtimeSubscriber>,
    ) -> Self {
        let inner = Arc::new(MonitorInner {
            engine,
            realtime,
            session: RwLock::new(None),
        });
        let mut rx = status.subscribe();
        let mut last = *rx.borrow_and_update();
        let watcher = Arc::clone(&inner);

        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = *rx.borrow_and_update();
                if state != last {
                    watcher.on_transition(last, state).await;
                    last = state;
                } else if state == NetworkState::Online {
                    // Every notification is a real change, so landing on the
                    // same state means a drop and recovery were coalesced
                    tracing::debug!("missed a brief disconnect");
                    watcher.on_transition(NetworkState::Online, NetworkState::Offline).await;
                    watcher.on_transition(NetworkState::Offline, NetworkState::Online).await;
                }
            }
            tracing::debug!("network status source closed");
        });

        Self { inner, task }
    }

    /// Set or clear the session reconnect handling acts for
    pub fn set_session(&self, session: Option<Session>) {
        *self.inner.session.write() = session;
    }

    /// Run transition handling directly, without waiting for the watcher
    pub async fn handle_transition(&self, from: NetworkState, to: NetworkState) {
        self.inner.on_transition(from, to).await;
    }
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{engine_with, MemoryRemote};
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use tokio::sync::broadcast::error::RecvError;

    async fn wait_for_reconnect(rx: &mut tokio::sync::broadcast::Receiver<SyncEvent>) -> usize {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Ok(SyncEvent::Reconnected { drained })) => return drained,
                Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => continue,
                other => panic!("no reconnect event: {:?}", other),
            }
        }
    }

    #[test]
    fn test_manual_status_deduplicates() {
        let status = ManualNetworkStatus::default();
        let mut rx = status.subscribe();
        assert_eq!(status.current(), NetworkState::Unknown);

        status.go_online();
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        status.go_online();
        assert!(!rx.has_changed().unwrap());
        assert_eq!(status.current(), NetworkState::Online);
    }

    #[test]
    fn test_network_state_display() {
        assert_eq!(NetworkState::Online.to_string(), "online");
        assert_eq!(NetworkState::Unknown.to_string(), "unknown");
    }

    #[tokio::test]
    async fn test_reconnect_drains_queue_for_session() {
        let remote = Arc::new(MemoryRemote::default());
        let status = Arc::new(ManualNetworkStatus::new(NetworkState::Offline));
        let engine = engine_with(remote.clone(), status.clone());
        let session = Session::new("alice");

        engine
            .save_data(&session, "products", json!({"id": "p1", "name": "Widget"}))
            .await
            .unwrap();
        assert_eq!(engine.queue().len().unwrap(), 1);

        let monitor = NetworkMonitor::spawn(status.clone(), engine.clone(), None);
        monitor.set_session(Some(session));
        let mut events = engine.subscribe_events();

        status.go_online();
        assert_eq!(wait_for_reconnect(&mut events).await, 1);

        assert!(engine.queue().is_empty().unwrap());
        assert!(remote.get("products", "p1").is_some());
    }

    #[tokio::test]
    async fn test_brief_disconnect_still_drains() {
        let remote = Arc::new(MemoryRemote::default());
        let status = Arc::new(ManualNetworkStatus::new(NetworkState::Offline));
        let engine = engine_with(remote.clone(), status.clone());
        let session = Session::new("alice");

        let monitor = NetworkMonitor::spawn(status.clone(), engine.clone(), None);
        monitor.set_session(Some(session.clone()));
        let mut events = engine.subscribe_events();

        status.go_online();
        assert_eq!(wait_for_reconnect(&mut events).await, 0);

        // offline and back before the watcher gets to run
        status.go_offline();
        engine.delete_data(&session, "products", "p1").await.unwrap();
        status.go_online();

        assert_eq!(wait_for_reconnect(&mut events).await, 1);
        assert!(engine.queue().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_reconnect_without_session_is_noop() {
        let remote = Arc::new(MemoryRemote::default());
        let status = Arc::new(ManualNetworkStatus::new(NetworkState::Offline));
        let engine = engine_with(remote.clone(), status.clone());

        let monitor = NetworkMonitor::spawn(status.clone(), engine, None);
        monitor.handle_transition(NetworkState::Offline, NetworkState::Online).await;

        assert_eq!(remote.selects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_monitor_over_mocked_status() {
        let (tx, rx) = watch::channel(NetworkState::Offline);
        let mut mock = MockNetworkStatus::new();
        mock.expect_subscribe().times(1).return_once(move || rx);
        mock.expect_current().return_const(NetworkState::Offline);

        let remote = Arc::new(MemoryRemote::default());
        let engine = engine_with(remote.clone(), Arc::new(ManualNetworkStatus::default()));
        let monitor = NetworkMonitor::spawn(Arc::new(mock), engine.clone(), None);
        monitor.set_session(Some(Session::new("alice")));
        let mut events = engine.subscribe_events();

        tx.send(NetworkState::Online).unwrap();
        assert_eq!(wait_for_reconnect(&mut events).await, 0);
        // one pull per mapped collection
        assert_eq!(remote.selects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_probe_status_reports_offline_for_unreachable_backend() {
        let config = SyncConfig::default()
            .with_probe_interval(Duration::from_millis(50))
            .with_probe_timeout(Duration::from_millis(500));
        let status =
            ProbeNetworkStatus::from_config(&RemoteConfig::new("http://127.0.0.1:9"), &config)
                .unwrap();
        let mut rx = status.subscribe();

        tokio::time::timeout(Duration::from_secs(5), rx.changed()).await.unwrap().unwrap();
        assert_eq!(status.current(), NetworkState::Offline);
    }
}

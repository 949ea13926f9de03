//! Shared fixtures for the integration tests
//!
//! `FakeCloud` plays the multi-tenant backend: a REST-like table store and a
//! realtime feed that broadcasts every write, including writes made by
//! "another device" through the `external_*` helpers.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use networking::remote::Result as RemoteResult;
use networking::{
    ChangeEvent, ChangeKind, ChangeStream, RealtimeTransport, RemoteBackend, RemoteError,
    SubscriptionError,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use storage::{LocalStore, Record};
use sync_engine::{
    ChangeCallback, CollectionMap, ManualNetworkStatus, NetworkMonitor, NetworkState,
    RealtimeSubscriber, Session, SyncConfig, SyncEngine, SyncEvent,
};
use tokio::sync::broadcast;

type FeedSender = mpsc::UnboundedSender<Result<ChangeEvent, SubscriptionError>>;

struct Feed {
    table: String,
    owner_id: String,
    tx: FeedSender,
}

/// In-memory remote backend with a realtime feed
pub struct FakeCloud {
    tables: Mutex<HashMap<String, BTreeMap<String, Record>>>,
    feeds: Mutex<Vec<Feed>>,
    reachable: AtomicBool,
    pub writes: AtomicUsize,
}

impl FakeCloud {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tables: Mutex::new(HashMap::new()),
            feeds: Mutex::new(Vec::new()),
            reachable: AtomicBool::new(true),
            writes: AtomicUsize::new(0),
        })
    }

    /// Make every remote call fail as if the network were down
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
        if !reachable {
            self.drop_channels();
        }
    }

    pub fn row(&self, table: &str, id: &str) -> Option<Record> {
        self.tables.lock().get(table).and_then(|rows| rows.get(id).cloned())
    }

    /// Rows of one owner, sorted by id
    pub fn rows(&self, table: &str, owner_id: &str) -> Vec<Record> {
        self.tables
            .lock()
            .get(table)
            .map(|rows| rows.values().filter(|r| r.owner_id == owner_id).cloned().collect())
            .unwrap_or_default()
    }

    /// A write made by another device
    pub fn external_upsert(&self, table: &str, record: Record) {
        let owner = record.owner_id.clone();
        self.tables
            .lock()
            .entry(table.to_string())
            .or_default()
            .insert(record.id.clone(), record.clone());
        self.broadcast(table, &owner, ChangeEvent::upsert(ChangeKind::Update, table, record));
    }

    /// A delete made by another device
    pub fn external_delete(&self, table: &str, owner_id: &str, id: &str) {
        if let Some(rows) = self.tables.lock().get_mut(table) {
            rows.remove(id);
        }
        self.broadcast(table, owner_id, ChangeEvent::delete(table, id));
    }

    /// Force-close every realtime channel from the server side
    pub fn drop_channels(&self) {
        for feed in self.feeds.lock().drain(..) {
            let _ = feed
                .tx
                .unbounded_send(Err(SubscriptionError::Dropped("server restart".into())));
        }
    }

    pub fn open_channels(&self) -> usize {
        self.feeds.lock().iter().filter(|f| !f.tx.is_closed()).count()
    }

    fn broadcast(&self, table: &str, owner_id: &str, event: ChangeEvent) {
        self.feeds.lock().retain(|feed| {
            if feed.tx.is_closed() {
                return false;
            }
            if feed.table == table && feed.owner_id == owner_id {
                let _ = feed.tx.unbounded_send(Ok(event.clone()));
            }
            true
        });
    }

    fn check_reachable(&self) -> RemoteResult<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::network("network unreachable"))
        }
    }
}

#[async_trait]
impl RemoteBackend for FakeCloud {
    async fn upsert(&self, table: &str, record: &Record) -> RemoteResult<()> {
        self.check_reachable()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.tables
            .lock()
            .entry(table.to_string())
            .or_default()
            .insert(record.id.clone(), record.clone());
        self.broadcast(
            table,
            &record.owner_id,
            ChangeEvent::upsert(ChangeKind::Update, table, record.clone()),
        );
        Ok(())
    }

    async fn delete(&self, table: &str, owner_id: &str, id: &str) -> RemoteResult<()> {
        self.check_reachable()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        let removed = {
            let mut tables = self.tables.lock();
            match tables.get_mut(table) {
                Some(rows) if rows.get(id).is_some_and(|r| r.owner_id == owner_id) => {
                    rows.remove(id).is_some()
                }
                _ => false,
            }
        };
        if removed {
            self.broadcast(table, owner_id, ChangeEvent::delete(table, id));
        }
        Ok(())
    }

    async fn select_all(&self, table: &str, owner_id: &str) -> RemoteResult<Vec<Record>> {
        self.check_reachable()?;
        Ok(self.rows(table, owner_id))
    }
}

#[async_trait]
impl RealtimeTransport for FakeCloud {
    async fn subscribe(
        &self,
        table: &str,
        owner_id: &str,
    ) -> Result<ChangeStream, SubscriptionError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(SubscriptionError::Connect("network unreachable".into()));
        }
        let (tx, rx) = mpsc::unbounded();
        self.feeds.lock().push(Feed {
            table: table.to_string(),
            owner_id: owner_id.to_string(),
            tx,
        });
        Ok(rx.boxed())
    }
}

/// Install a test subscriber honouring `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Products, sales (stored remotely as orders) and customers
pub fn pos_collections() -> CollectionMap {
    CollectionMap::new([("products", "products"), ("sales", "orders"), ("customers", "customers")])
        .unwrap()
}

/// A device wired to a fake cloud
pub struct Device {
    pub cloud: Arc<FakeCloud>,
    pub network: Arc<ManualNetworkStatus>,
    pub engine: SyncEngine,
    pub realtime: RealtimeSubscriber,
    pub monitor: NetworkMonitor,
    pub events: broadcast::Receiver<SyncEvent>,
}

impl Device {
    /// Start a device over `store`, initially offline; must run inside a tokio runtime
    pub fn start(cloud: Arc<FakeCloud>, store: LocalStore) -> Self {
        init_tracing();
        let network = Arc::new(ManualNetworkStatus::new(NetworkState::Offline));
        let engine = SyncEngine::new(
            store,
            cloud.clone(),
            network.clone(),
            pos_collections(),
            SyncConfig::default(),
        )
        .unwrap();
        let realtime = RealtimeSubscriber::new(engine.clone(), cloud.clone());
        let monitor =
            NetworkMonitor::spawn(network.clone(), engine.clone(), Some(realtime.clone()));
        let events = engine.subscribe_events();
        Self {
            cloud,
            network,
            engine,
            realtime,
            monitor,
            events,
        }
    }

    pub fn in_memory(cloud: Arc<FakeCloud>) -> Self {
        Self::start(cloud, LocalStore::in_memory().unwrap())
    }

    pub fn login(&self, owner_id: &str) -> Session {
        let session = Session::new(owner_id);
        self.monitor.set_session(Some(session.clone()));
        session
    }

    /// Lose connectivity (the cloud becomes unreachable too)
    pub fn go_offline(&self) {
        self.cloud.set_reachable(false);
        self.network.go_offline();
    }

    /// Regain connectivity and wait until reconnect handling finished
    pub async fn go_online(&mut self) -> usize {
        self.cloud.set_reachable(true);
        self.network.go_online();
        self.wait_for(|event| matches!(event, SyncEvent::Reconnected { .. }))
            .await
            .map(|event| match event {
                SyncEvent::Reconnected { drained } => drained,
                _ => 0,
            })
            .unwrap_or(0)
    }

    /// Next event matching `predicate`, or `None` after five seconds
    pub async fn wait_for(&mut self, predicate: impl Fn(&SyncEvent) -> bool) -> Option<SyncEvent> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Ok(event)) if predicate(&event) => return Some(event),
                Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                _ => return None,
            }
        }
    }
}

/// Callback that forwards every change into a channel
pub fn change_channel() -> (ChangeCallback, tokio::sync::mpsc::UnboundedReceiver<Option<Record>>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let callback: ChangeCallback = Arc::new(move |record| {
        let _ = tx.send(record);
    });
    (callback, rx)
}

/// Sort records by id for set comparison
pub fn sorted(mut records: Vec<Record>) -> Vec<Record> {
    records.sort_by(|a, b| a.id.cmp(&b.id));
    records
}

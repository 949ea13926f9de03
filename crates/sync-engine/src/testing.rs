//! In-memory remote and realtime feed for unit tests

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use networking::{
    ChangeEvent, ChangeStream, RealtimeTransport, RemoteBackend, RemoteError, SubscriptionError,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use storage::{LocalStore, Record};

use crate::config::SyncConfig;
use crate::engine::SyncEngine;
use crate::mapping::CollectionMap;
use crate::network::NetworkStatus;

/// Remote store keyed by table then id
#[derive(Default)]
pub(crate) struct MemoryRemote {
    tables: Mutex<HashMap<String, BTreeMap<String, Record>>>,
    pub fail_reads: AtomicBool,
    pub fail_writes: AtomicBool,
    pub selects: AtomicUsize,
    pub writes: AtomicUsize,
    pub select_delay: Mutex<Option<Duration>>,
}

impl MemoryRemote {
    pub fn insert(&self, table: &str, record: Record) {
        self.tables.lock().entry(table.to_string()).or_default().insert(record.id.clone(), record);
    }

    pub fn get(&self, table: &str, id: &str) -> Option<Record> {
        self.tables.lock().get(table).and_then(|t| t.get(id).cloned())
    }

    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.tables.lock().get(table).map(|t| t.values().cloned().collect()).unwrap_or_default()
    }
}

#[async_trait]
impl RemoteBackend for MemoryRemote {
    async fn upsert(&self, table: &str, record: &Record) -> networking::remote::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RemoteError::network("connection reset"));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.insert(table, record.clone());
        Ok(())
    }

    async fn delete(
        &self,
        table: &str,
        owner_id: &str,
        id: &str,
    ) -> networking::remote::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RemoteError::network("connection reset"));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut tables = self.tables.lock();
        if let Some(rows) = tables.get_mut(table) {
            if rows.get(id).is_some_and(|r| r.owner_id == owner_id) {
                rows.remove(id);
            }
        }
        Ok(())
    }

    async fn select_all(
        &self,
        table: &str,
        owner_id: &str,
    ) -> networking::remote::Result<Vec<Record>> {
        self.selects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.select_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(RemoteError::network("connection reset"));
        }
        Ok(self.rows(table).into_iter().filter(|r| r.owner_id == owner_id).collect())
    }
}

type FeedSender = mpsc::UnboundedSender<Result<ChangeEvent, SubscriptionError>>;

/// Realtime transport fed by the test
#[derive(Default)]
pub(crate) struct MemoryFeed {
    channels: Mutex<Vec<(String, FeedSender)>>,
    pub refuse: AtomicBool,
    pub opened: AtomicUsize,
}

impl MemoryFeed {
    /// Deliver an event to every open channel of its table
    pub fn push(&self, event: ChangeEvent) -> usize {
        let channels = self.channels.lock();
        channels
            .iter()
            .filter(|(table, tx)| *table == event.table && !tx.is_closed())
            .filter(|(_, tx)| tx.unbounded_send(Ok(event.clone())).is_ok())
            .count()
    }

    /// Close every channel from the server side
    pub fn drop_all(&self) {
        for (_, tx) in self.channels.lock().drain(..) {
            let _ = tx.unbounded_send(Err(SubscriptionError::Dropped("server closed".into())));
        }
    }

    pub fn open_channels(&self) -> usize {
        self.channels.lock().iter().filter(|(_, tx)| !tx.is_closed()).count()
    }
}

#[async_trait]
impl RealtimeTransport for MemoryFeed {
    async fn subscribe(
        &self,
        table: &str,
        _owner_id: &str,
    ) -> Result<ChangeStream, SubscriptionError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(SubscriptionError::Connect("refused".into()));
        }
        let (tx, rx) = mpsc::unbounded();
        self.channels.lock().push((table.to_string(), tx));
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(rx.boxed())
    }
}

/// Engine over an in-memory store mapping `products` and `sales -> orders`
pub(crate) fn engine_with(
    remote: Arc<MemoryRemote>,
    network: Arc<dyn NetworkStatus>,
) -> SyncEngine {
    engine_with_config(remote, network, SyncConfig::default())
}

pub(crate) fn engine_with_config(
    remote: Arc<MemoryRemote>,
    network: Arc<dyn NetworkStatus>,
    config: SyncConfig,
) -> SyncEngine {
    let collections =
        CollectionMap::new([("products", "products"), ("sales", "orders")]).unwrap();
    SyncEngine::new(LocalStore::in_memory().unwrap(), remote, network, collections, config).unwrap()
}

//! Realtime change subscriptions
//!
//! One channel per table feeds remote inserts, updates and deletes into the
//! local store while online. Channels are torn down when connectivity drops
//! and reopened on reconnect; events missed in between are picked up by the
//! next reconciliation, never replayed. A channel that fails or drops
//! disables itself silently until the next reconnect.

use futures::StreamExt;
use networking::{ChangeKind, ChangeStream, RealtimeTransport};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use storage::Record;
use tokio::task::JoinHandle;

use crate::engine::SyncEngine;
use crate::error::{Result, SyncError};
use crate::session::Session;

/// Callback invoked with the merged record, or `None` after a remote delete
pub type ChangeCallback = Arc<dyn Fn(Option<Record>) + Send + Sync>;

struct Channel {
    collection: String,
    on_change: ChangeCallback,
    task: Option<JoinHandle<()>>,
}

impl Channel {
    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

struct RealtimeInner {
    engine: SyncEngine,
    transport: Arc<dyn RealtimeTransport>,
    channels: Mutex<HashMap<String, Channel>>,
}

/// Keeps per-table realtime channels in step with connectivity
#[derive(Clone)]
pub struct RealtimeSubscriber {
    inner: Arc<RealtimeInner>,
}

impl RealtimeSubscriber {
    /// Create a subscriber that merges events through `engine`
    pub fn new(engine: SyncEngine, transport: Arc<dyn RealtimeTransport>) -> Self {
        Self {
            inner: Arc::new(RealtimeInner {
                engine,
                transport,
                channels: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register a channel for `table` and open it if online
    ///
    /// `collection` must be the collection mapped to `table`. Registering a
    /// table again replaces its callback. A channel that cannot be opened is
    /// logged and left inactive until [`resume`](Self::resume).
    pub async fn subscribe_to_table(
        &self,
        session: &Session,
        table: &str,
        collection: &str,
        on_change: ChangeCallback,
    ) -> Result<()> {
        if self.inner.engine.collections().table_for(collection) != Some(table) {
            return Err(SyncError::Unmapped(collection.to_string()));
        }

        let channel = Channel {
            collection: collection.to_string(),
            on_change,
            task: None,
        };
        if let Some(mut previous) = self.inner.channels.lock().insert(table.to_string(), channel) {
            previous.stop();
        }

        if self.inner.engine.is_online() {
            self.open(session, table).await;
        } else {
            tracing::debug!(table, "offline, realtime channel deferred");
        }
        Ok(())
    }

    /// Close and forget a channel; returns whether it was registered
    pub fn unsubscribe(&self, table: &str) -> bool {
        match self.inner.channels.lock().remove(table) {
            Some(mut channel) => {
                channel.stop();
                true
            }
            None => false,
        }
    }

    /// Close every channel but keep the registrations
    pub fn suspend(&self) {
        let mut channels = self.inner.channels.lock();
        for channel in channels.values_mut() {
            channel.stop();
        }
        tracing::info!(channels = channels.len(), "realtime channels suspended");
    }

    /// Reopen every registered channel for `session`
    pub async fn resume(&self, session: &Session) {
        let tables: Vec<String> = self.inner.channels.lock().keys().cloned().collect();
        for table in tables {
            self.open(session, &table).await;
        }
    }

    /// Close and forget every channel
    pub fn teardown(&self) {
        for (_, mut channel) in self.inner.channels.lock().drain() {
            channel.stop();
        }
    }

    /// Tables whose channel is currently delivering
    pub fn active_channels(&self) -> Vec<String> {
        let mut tables: Vec<String> = self
            .inner
            .channels
            .lock()
            .iter()
            .filter(|(_, channel)| channel.is_active())
            .map(|(table, _)| table.clone())
            .collect();
        tables.sort();
        tables
    }

    async fn open(&self, session: &Session, table: &str) -> bool {
        let (collection, on_change) = {
            let mut channels = self.inner.channels.lock();
            match channels.get_mut(table) {
                Some(channel) => {
                    channel.stop();
                    (channel.collection.clone(), Arc::clone(&channel.on_change))
                }
                None => return false,
            }
        };

        let stream = match self.inner.transport.subscribe(table, session.owner_id()).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(table, error = %err, "realtime subscription failed");
                return false;
            }
        };

        let task = tokio::spawn(pump(
            self.inner.engine.clone(),
            session.clone(),
            table.to_string(),
            collection,
            on_change,
            stream,
        ));

        match self.inner.channels.lock().get_mut(table) {
            Some(channel) => {
                channel.stop();
                channel.task = Some(task);
                tracing::info!(table, owner_id = session.owner_id(), "realtime channel open");
                true
            }
            None => {
                // unsubscribed while connecting
                task.abort();
                false
            }
        }
    }
}

async fn pump(
    engine: SyncEngine,
    session: Session,
    table: String,
    collection: String,
    on_change: ChangeCallback,
    mut stream: ChangeStream,
) {
    while let Some(item) = stream.next().await {
        let event = match item {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(table = %table, error = %err, "realtime channel dropped");
                return;
            }
        };

        let deleted_id = match (&event.kind, &event.record) {
            (ChangeKind::Delete, _) => event.old_id.clone(),
            (_, Some(record)) if record.is_tombstone() => Some(record.id.clone()),
            _ => None,
        };

        if let Some(id) = deleted_id {
            match engine.apply_remote_delete(&session, &table, &collection, &id) {
                Ok(true) => on_change(None),
                Ok(false) => {}
                Err(err) => {
                    tracing::error!(
                        table = %table,
                        id = %id,
                        error = %err,
                        "failed to apply remote delete"
                    )
                }
            }
        } else if let Some(record) = event.record {
            let id = record.id.clone();
            match engine.apply_remote_upsert(&session, &table, &collection, record) {
                Ok(Some(record)) => on_change(Some(record)),
                Ok(None) => tracing::debug!(table = %table, id = %id, "remote change not applied"),
                Err(err) => {
                    tracing::error!(
                        table = %table,
                        id = %id,
                        error = %err,
                        "failed to apply remote change"
                    )
                }
            }
        }
    }
    tracing::debug!(table = %table, "realtime channel closed");
}

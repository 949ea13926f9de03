//! Offline-first sync engine
//!
//! Writes land in the local store first and are visible immediately. Every
//! write to a mapped collection is queued durably in the same call; when
//! online, a background task replays the queue and removes entries as the
//! remote acknowledges them. [`SyncEngine::sync_table`] reconciles a table
//! in two phases:
//!
//! 1. **Pull**: fetch the owner's remote rows and merge them using the
//!    configured [`ConflictStrategy`](crate::config::ConflictStrategy).
//! 2. **Push**: queue local records that won a conflict or were never
//!    pushed, then replay the table's queue entries.
//!
//! A delete always wins over a concurrent update: a record with a pending
//! local delete is never resurrected by a pull, and a pulled tombstone
//! discards pending local upserts.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use networking::RemoteBackend;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use storage::{LocalStore, MetaStore, Operation, QueueEntry, Record, ReplayOutcome, SyncQueue};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::conflict::{resolve, Winner};
use crate::error::{Result, SyncError};
use crate::mapping::CollectionMap;
use crate::network::{NetworkState, NetworkStatus};
use crate::session::Session;
use crate::status::{StatusTracker, SyncEvent, SyncReport, SyncStatus};
use crate::tenant::{filter_by_owner, TenantPartition};

type SharedPass = Shared<BoxFuture<'static, Result<SyncReport>>>;

/// Result of merging one remote record into the local store
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Merge {
    /// Remote record written locally
    Applied(Record),
    /// Local record removed by a tombstone
    Removed,
    /// Local copy already equal to the remote one
    Unchanged,
    /// Local copy is newer and will be pushed
    KeptLocal,
    /// Nothing to do (pending local delete, tombstone for an unknown id, or
    /// an id held by another owner)
    Skipped,
}

struct EngineInner {
    store: LocalStore,
    queue: SyncQueue,
    meta: MetaStore,
    remote: Arc<dyn RemoteBackend>,
    network: Arc<dyn NetworkStatus>,
    collections: CollectionMap,
    config: SyncConfig,
    status: StatusTracker,
    in_flight: Mutex<HashMap<(String, String), SharedPass>>,
    background: Mutex<JoinSet<()>>,
    drain_lock: tokio::sync::Mutex<()>,
}

/// Offline-first sync engine
///
/// Clones share the same state.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Create an engine
    ///
    /// # Arguments
    ///
    /// * `store` - Local store holding collections, the queue and sync metadata
    /// * `remote` - Remote backend
    /// * `network` - Connectivity source
    /// * `collections` - Which collections sync, and to which tables
    /// * `config` - Engine configuration
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteBackend>,
        network: Arc<dyn NetworkStatus>,
        collections: CollectionMap,
        config: SyncConfig,
    ) -> Result<Self> {
        let queue = SyncQueue::new(store.clone());
        let status = StatusTracker::new(config.event_buffer);
        status.set_pending(queue.len()?);

        Ok(Self {
            inner: Arc::new(EngineInner {
                meta: MetaStore::new(store.clone()),
                queue,
                store,
                remote,
                network,
                collections,
                config,
                status,
                in_flight: Mutex::new(HashMap::new()),
                background: Mutex::new(JoinSet::new()),
                drain_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// The underlying local store
    pub fn store(&self) -> &LocalStore {
        &self.inner.store
    }

    /// The sync queue
    pub fn queue(&self) -> &SyncQueue {
        &self.inner.queue
    }

    /// Collection to table mapping
    pub fn collections(&self) -> &CollectionMap {
        &self.inner.collections
    }

    /// Owner-level maintenance over the same store
    pub fn tenant(&self) -> TenantPartition {
        TenantPartition::new(self.inner.store.clone())
    }

    /// Whether the connectivity source reports online
    pub fn is_online(&self) -> bool {
        self.inner.network.current() == NetworkState::Online
    }

    /// Current status snapshot
    pub fn status(&self) -> SyncStatus {
        self.inner.status.snapshot()
    }

    /// Subscribe to engine events
    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.status.subscribe()
    }

    pub(crate) fn tracker(&self) -> &StatusTracker {
        &self.inner.status
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// One record of the session's owner
    pub fn get(&self, session: &Session, collection: &str, id: &str) -> Result<Option<Record>> {
        let record: Option<Record> = self.inner.store.get(collection, id)?;
        Ok(record.filter(|r| r.owner_id == session.owner_id()))
    }

    /// Every record of the session's owner in a collection
    pub fn get_all(&self, session: &Session, collection: &str) -> Result<Vec<Record>> {
        Ok(filter_by_owner(self.inner.store.get_all(collection)?, session.owner_id()))
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Save a record
    ///
    /// `item` must be a JSON object; a missing `id` gets a fresh UUID. The
    /// envelope is stamped here: `owner_id` from the session, `updated_at`
    /// now, `created_at` kept from an existing record. The returned record is
    /// already visible to reads. Remote delivery never blocks this call.
    ///
    /// Fails with [`SyncError::ForeignRecord`] if the id is held by a record
    /// of another owner on this device.
    pub async fn save_data(
        &self,
        session: &Session,
        collection: &str,
        item: Value,
    ) -> Result<Record> {
        let fields = into_object(item)?;
        let id = fields
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let now = Utc::now();
        let stored: Option<Record> = self.inner.store.get(collection, &id)?;
        let mut record = match stored {
            Some(existing) if existing.owner_id != session.owner_id() => {
                tracing::warn!(
                    collection,
                    id = %id,
                    "refusing to overwrite a record of another owner"
                );
                return Err(SyncError::ForeignRecord {
                    collection: collection.to_string(),
                    id,
                });
            }
            Some(existing) => Record {
                updated_at: now,
                version: existing.version + 1,
                fields: Map::new(),
                ..existing
            },
            None => {
                let mut record = Record::new(id, session.owner_id(), now);
                record.version = 1;
                record
            }
        };
        record.merge_fields(fields);

        self.inner.store.put(collection, &record)?;
        tracing::debug!(
            collection,
            id = %record.id,
            owner_id = session.owner_id(),
            version = record.version,
            "saved locally"
        );

        if let Some(table) = self.inner.collections.table_for(collection) {
            self.inner.queue.enqueue(table, Operation::Upsert, record.to_value()?)?;
            self.after_enqueue(session);
        }
        Ok(record)
    }

    /// Merge `patch` into an existing record and save it
    ///
    /// Fails with [`SyncError::NotFound`] if the record is absent or belongs
    /// to another owner.
    pub async fn update_data(
        &self,
        session: &Session,
        collection: &str,
        id: &str,
        patch: Value,
    ) -> Result<Record> {
        let existing = self.get(session, collection, id)?.ok_or_else(|| SyncError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        })?;

        let mut item = existing.fields;
        item.extend(into_object(patch)?);
        item.insert("id".to_string(), Value::String(id.to_string()));
        self.save_data(session, collection, Value::Object(item)).await
    }

    /// Delete a record locally and queue the remote delete
    ///
    /// Returns whether a local record was removed. Deleting an id that is
    /// absent locally still queues the remote delete; a record owned by
    /// another session is left alone.
    pub async fn delete_data(&self, session: &Session, collection: &str, id: &str) -> Result<bool> {
        let existing: Option<Record> = self.inner.store.get(collection, id)?;
        let removed = match existing {
            Some(record) if record.owner_id != session.owner_id() => {
                tracing::warn!(collection, id, "refusing to delete a record of another owner");
                return Ok(false);
            }
            Some(_) => self.inner.store.delete(collection, id)?,
            None => false,
        };
        tracing::debug!(collection, id, owner_id = session.owner_id(), removed, "deleted locally");

        if let Some(table) = self.inner.collections.table_for(collection) {
            let payload = json!({ "id": id, "owner_id": session.owner_id() });
            self.inner.queue.enqueue(table, Operation::Delete, payload)?;
            self.after_enqueue(session);
        }
        Ok(removed)
    }

    fn after_enqueue(&self, session: &Session) {
        self.inner.refresh_pending();
        if self.is_online() {
            self.schedule_drain(session);
        }
    }

    fn schedule_drain(&self, session: &Session) {
        let inner = Arc::clone(&self.inner);
        let session = session.clone();

        let mut background = self.inner.background.lock();
        while background.try_join_next().is_some() {}
        background.spawn(async move {
            if let Err(err) = inner.replay(&session, None).await {
                tracing::error!(
                    owner_id = session.owner_id(),
                    error = %err,
                    "background push failed"
                );
            }
        });
    }

    /// Wait for every background push started so far
    pub async fn settle(&self) {
        loop {
            let mut pending = std::mem::take(&mut *self.inner.background.lock());
            if pending.is_empty() {
                break;
            }
            while pending.join_next().await.is_some() {}
        }
    }

    // =========================================================================
    // Sync
    // =========================================================================

    /// Replay every queued mutation of the session's owner
    ///
    /// Remote failures leave entries queued and are reported in the outcome
    /// and in `SyncStatus::last_error`.
    pub async fn drain_queue(&self, session: &Session) -> Result<ReplayOutcome> {
        self.inner.replay(session, None).await
    }

    /// Reconcile one table with the remote
    ///
    /// At most one pass runs per owner and table; a caller arriving while a
    /// pass is in flight awaits that pass and receives its result.
    pub async fn sync_table(
        &self,
        session: &Session,
        table: &str,
        collection: &str,
    ) -> Result<SyncReport> {
        if self.inner.collections.table_for(collection) != Some(table) {
            return Err(SyncError::Unmapped(collection.to_string()));
        }

        let key = (session.owner_id().to_string(), table.to_string());
        let (pass, leader) = {
            let mut in_flight = self.inner.in_flight.lock();
            match in_flight.get(&key) {
                Some(pass) if pass.peek().is_none() => (pass.clone(), false),
                _ => {
                    let inner = Arc::clone(&self.inner);
                    let session = session.clone();
                    let table = table.to_string();
                    let collection = collection.to_string();
                    let pass = async move { inner.run_pass(&session, &table, &collection).await }
                        .boxed()
                        .shared();
                    in_flight.insert(key.clone(), pass.clone());
                    (pass, true)
                }
            }
        };

        if !leader {
            tracing::debug!(table, owner_id = session.owner_id(), "joining in-flight sync");
        }
        let result = pass.clone().await;

        if leader {
            let mut in_flight = self.inner.in_flight.lock();
            if in_flight.get(&key).is_some_and(|current| current.ptr_eq(&pass)) {
                in_flight.remove(&key);
            }
        }
        result
    }

    /// Reconcile every mapped collection, one table at a time
    pub async fn sync_all(&self, session: &Session) -> Vec<(String, Result<SyncReport>)> {
        let pairs: Vec<(String, String)> = self
            .inner
            .collections
            .iter()
            .map(|(collection, table)| (collection.to_string(), table.to_string()))
            .collect();

        let mut results = Vec::with_capacity(pairs.len());
        for (collection, table) in pairs {
            let result = self.sync_table(session, &table, &collection).await;
            results.push((table, result));
        }
        results
    }

    // =========================================================================
    // Realtime hooks
    // =========================================================================

    /// Merge a remote upsert event; returns the record if it was applied
    ///
    /// Tombstones must go through [`Self::apply_remote_delete`].
    pub(crate) fn apply_remote_upsert(
        &self,
        session: &Session,
        table: &str,
        collection: &str,
        record: Record,
    ) -> Result<Option<Record>> {
        if record.owner_id != session.owner_id() {
            tracing::debug!(table, id = %record.id, "ignoring change of another owner");
            return Ok(None);
        }
        match self.inner.merge_remote(session, table, collection, record)? {
            Merge::Applied(record) => {
                self.emit_remote_change(table, &record.id, false);
                self.inner.refresh_pending();
                Ok(Some(record))
            }
            _ => Ok(None),
        }
    }

    /// Apply a remote delete event; returns whether a local record was removed
    pub(crate) fn apply_remote_delete(
        &self,
        session: &Session,
        table: &str,
        collection: &str,
        id: &str,
    ) -> Result<bool> {
        if self.get(session, collection, id)?.is_none() {
            return Ok(false);
        }
        self.inner.queue.discard_upserts(table, session.owner_id(), id)?;
        let removed = self.inner.store.delete(collection, id)?;
        self.inner.refresh_pending();
        if removed {
            self.emit_remote_change(table, id, true);
        }
        Ok(removed)
    }

    fn emit_remote_change(&self, table: &str, id: &str, deleted: bool) {
        self.inner.status.emit(SyncEvent::RemoteChange {
            table: table.to_string(),
            id: id.to_string(),
            deleted,
        });
    }
}

impl EngineInner {
    fn refresh_pending(&self) {
        match self.queue.len() {
            Ok(pending) => self.status.set_pending(pending),
            Err(err) => tracing::warn!(error = %err, "could not count queued mutations"),
        }
    }

    /// Replay the owner's queue entries, optionally for one table only
    async fn replay(&self, session: &Session, table: Option<&str>) -> Result<ReplayOutcome> {
        let _guard = self.drain_lock.lock().await;
        self.replay_locked(session, table).await
    }

    /// Replay with `drain_lock` already held
    async fn replay_locked(&self, session: &Session, table: Option<&str>) -> Result<ReplayOutcome> {
        let entries: Vec<QueueEntry> = self
            .queue
            .entries_for_owner(session.owner_id())?
            .into_iter()
            .filter(|e| table.map_or(true, |t| e.table == t))
            .collect();
        if entries.is_empty() {
            return Ok(ReplayOutcome::default());
        }

        let remote = Arc::clone(&self.remote);
        let outcome =
            self.queue.replay(entries, |entry| push_entry(Arc::clone(&remote), entry)).await?;

        tracing::info!(
            owner_id = session.owner_id(),
            table = table.unwrap_or("*"),
            replayed = outcome.replayed,
            failed = outcome.failed,
            deferred = outcome.deferred,
            "queue replayed"
        );
        self.refresh_pending();
        if let Some(error) = &outcome.last_error {
            self.status.record_error(error.clone());
        }
        Ok(outcome)
    }

    async fn run_pass(
        &self,
        session: &Session,
        table: &str,
        collection: &str,
    ) -> Result<SyncReport> {
        let started = Utc::now();
        self.status.begin_pass();

        match self.reconcile(session, table, collection, started).await {
            Ok((report, push_error)) => {
                tracing::info!(
                    table,
                    owner_id = session.owner_id(),
                    pulled = report.pulled,
                    removed = report.removed,
                    pushed = report.pushed,
                    failed = report.failed,
                    "table synced"
                );
                self.status.end_pass(started, push_error);
                self.status.emit(SyncEvent::TableSynced {
                    table: table.to_string(),
                    report: report.clone(),
                });
                Ok(report)
            }
            Err(err) => {
                tracing::warn!(table, owner_id = session.owner_id(), error = %err, "sync aborted");
                self.status.abort_pass(err.to_string());
                Err(err)
            }
        }
    }

    /// Pull then push one table
    ///
    /// Holds `drain_lock` for the whole pass so no background push can
    /// acknowledge an entry between the pull snapshot and the push. A record
    /// counts as locally modified exactly while it has a queue entry.
    async fn reconcile(
        &self,
        session: &Session,
        table: &str,
        collection: &str,
        started: DateTime<Utc>,
    ) -> Result<(SyncReport, Option<String>)> {
        let _guard = self.drain_lock.lock().await;
        let owner = session.owner_id();
        let last_sync = self.meta.last_sync(owner, table)?;

        // Pull
        let remote_records = self
            .remote
            .select_all(table, owner)
            .await
            .map_err(|source| SyncError::RemoteRead {
                table: table.to_string(),
                source,
            })?;

        let mut report = SyncReport::default();
        let mut seen_remote = HashSet::new();
        let mut kept_local = Vec::new();

        for remote in remote_records {
            if remote.owner_id != owner {
                tracing::warn!(table, id = %remote.id, "remote returned a row of another owner");
                continue;
            }
            let id = remote.id.clone();
            seen_remote.insert(id.clone());
            match self.merge_remote(session, table, collection, remote)? {
                Merge::Applied(_) => report.pulled += 1,
                Merge::Removed => report.removed += 1,
                Merge::KeptLocal => kept_local.push(id),
                Merge::Unchanged | Merge::Skipped => {}
            }
        }

        let pending: HashSet<String> = self
            .queue
            .entries_for_owner(owner)?
            .into_iter()
            .filter(|e| e.table == table)
            .map(|e| e.record_id)
            .collect();

        // Local records the remote does not know about: deleted remotely if
        // this table synced before, never pushed otherwise
        for record in filter_by_owner(self.store.get_all(collection)?, owner) {
            if seen_remote.contains(&record.id)
                || pending.contains(&record.id)
                || record.updated_at >= started
            {
                continue;
            }
            if last_sync.is_some() {
                if self.store.delete(collection, &record.id)? {
                    tracing::debug!(table, id = %record.id, "removed record deleted remotely");
                    report.removed += 1;
                }
            } else {
                self.queue.enqueue(table, Operation::Upsert, record.to_value()?)?;
            }
        }

        // Push
        for id in kept_local.into_iter().filter(|id| !pending.contains(id)) {
            if let Some(record) = self.store.get::<Record>(collection, &id)? {
                self.queue.enqueue(table, Operation::Upsert, record.to_value()?)?;
            }
        }

        let outcome = self.replay_locked(session, Some(table)).await?;
        report.pushed = outcome.replayed;
        report.failed = outcome.failed;

        self.meta.set_last_sync(owner, table, started)?;
        Ok((report, outcome.last_error))
    }

    /// Merge one remote record of the session's owner into the local store
    fn merge_remote(
        &self,
        session: &Session,
        table: &str,
        collection: &str,
        remote: Record,
    ) -> Result<Merge> {
        let owner = session.owner_id();
        let local: Option<Record> = self.store.get(collection, &remote.id)?;
        if local.as_ref().is_some_and(|r| r.owner_id != owner) {
            tracing::warn!(
                table,
                id = %remote.id,
                "remote row collides with a record of another owner"
            );
            return Ok(Merge::Skipped);
        }

        if remote.is_tombstone() {
            self.queue.discard_upserts(table, owner, &remote.id)?;
            return match local {
                Some(_) => {
                    self.store.delete(collection, &remote.id)?;
                    tracing::debug!(table, id = %remote.id, "tombstone removed local record");
                    Ok(Merge::Removed)
                }
                None => Ok(Merge::Skipped),
            };
        }

        match local {
            None => {
                if self.queue.has_pending_delete(table, owner, &remote.id)? {
                    tracing::debug!(
                        table,
                        id = %remote.id,
                        "pending local delete wins over remote row"
                    );
                    return Ok(Merge::Skipped);
                }
                self.store.put(collection, &remote)?;
                Ok(Merge::Applied(remote))
            }
            Some(local) if local == remote => Ok(Merge::Unchanged),
            Some(local) => {
                let winner = resolve(self.config.conflict_strategy, &local, &remote);
                tracing::debug!(table, id = %remote.id, ?winner, "conflict resolved");
                self.status.emit(SyncEvent::ConflictResolved {
                    table: table.to_string(),
                    id: remote.id.clone(),
                    winner,
                });
                match winner {
                    Winner::Remote => {
                        let dropped = self.queue.discard_upserts(table, owner, &remote.id)?;
                        if dropped > 0 {
                            tracing::debug!(
                                table,
                                id = %remote.id,
                                dropped,
                                "discarded stale local upserts"
                            );
                        }
                        self.store.put(collection, &remote)?;
                        Ok(Merge::Applied(remote))
                    }
                    Winner::Local => Ok(Merge::KeptLocal),
                }
            }
        }
    }
}

async fn push_entry(remote: Arc<dyn RemoteBackend>, entry: QueueEntry) -> Result<()> {
    let result = match entry.operation {
        Operation::Upsert => {
            let record = Record::from_value(entry.payload)?;
            remote.upsert(&entry.table, &record).await
        }
        Operation::Delete => remote.delete(&entry.table, &entry.owner_id, &entry.record_id).await,
    };
    result.map_err(|source| SyncError::RemoteWrite {
        table: entry.table,
        source,
    })
}

fn into_object(value: Value) -> Result<Map<String, Value>> {
    match value {
        Value::Object(fields) => Ok(fields),
        other => Err(SyncError::InvalidPayload(format!("expected a JSON object, got {}", other))),
    }
}

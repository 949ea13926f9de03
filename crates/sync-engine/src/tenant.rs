//! Per-owner partitioning of the local store
//!
//! Every record carries the `owner_id` of the session that wrote it. Records
//! of a previous session stay physically present but invisible until an
//! explicit clear runs.

use std::collections::BTreeSet;
use storage::{LocalStore, MetaStore, Record, SyncQueue};

use crate::error::Result;

/// Keep only the records written under `owner_id`
///
/// Applied on every read path handed to callers.
pub fn filter_by_owner(records: Vec<Record>, owner_id: &str) -> Vec<Record> {
    records.into_iter().filter(|r| r.owner_id == owner_id).collect()
}

/// What a clear removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClearReport {
    /// Records removed across all collections
    pub records: usize,
    /// Queue entries dropped
    pub queued: usize,
    /// Sync metadata entries dropped
    pub meta: usize,
}

impl ClearReport {
    fn absorb(&mut self, other: ClearReport) {
        self.records += other.records;
        self.queued += other.queued;
        self.meta += other.meta;
    }
}

/// Owner-level maintenance over the local store
#[derive(Clone)]
pub struct TenantPartition {
    store: LocalStore,
    queue: SyncQueue,
    meta: MetaStore,
}

impl TenantPartition {
    /// Create a partition view over the given store
    pub fn new(store: LocalStore) -> Self {
        Self {
            queue: SyncQueue::new(store.clone()),
            meta: MetaStore::new(store.clone()),
            store,
        }
    }

    /// Records of one owner in a collection
    pub fn visible(&self, collection: &str, owner_id: &str) -> Result<Vec<Record>> {
        Ok(filter_by_owner(self.store.get_all(collection)?, owner_id))
    }

    /// Remove everything an owner left on this device
    ///
    /// # Arguments
    ///
    /// * `owner_id` - The owner whose records, queued mutations and sync
    ///   metadata should be removed
    ///
    /// Unsynced mutations of that owner are lost; callers typically drain
    /// the queue first.
    pub fn clear_owner(&self, owner_id: &str) -> Result<ClearReport> {
        let mut report = ClearReport::default();

        for collection in self.store.collections() {
            for record in self.visible(&collection, owner_id)? {
                if self.store.delete(&collection, &record.id)? {
                    report.records += 1;
                }
            }
        }
        report.queued = self.queue.remove_owner(owner_id)?;
        report.meta = self.meta.remove_owner(owner_id)?;

        tracing::info!(
            owner_id,
            records = report.records,
            queued = report.queued,
            "cleared owner data"
        );
        Ok(report)
    }

    /// Every owner with records or pending mutations on this device
    pub fn list_owners(&self) -> Result<Vec<String>> {
        let mut owners = BTreeSet::new();
        for collection in self.store.collections() {
            let records: Vec<Record> = self.store.get_all(&collection)?;
            owners.extend(records.into_iter().map(|r| r.owner_id));
        }
        owners.extend(self.queue.entries()?.into_iter().map(|e| e.owner_id));
        Ok(owners.into_iter().collect())
    }

    /// Clear every owner not in `valid_owners`
    ///
    /// Used after account removal to drop data nobody can see anymore.
    pub fn cleanup_orphaned(&self, valid_owners: &[&str]) -> Result<ClearReport> {
        let mut report = ClearReport::default();
        for owner in self.list_owners()? {
            if !valid_owners.contains(&owner.as_str()) {
                report.absorb(self.clear_owner(&owner)?);
            }
        }
        Ok(report)
    }

    /// Number of records an owner holds across all collections
    pub fn owner_record_count(&self, owner_id: &str) -> Result<usize> {
        let mut count = 0;
        for collection in self.store.collections() {
            count += self.visible(&collection, owner_id)?.len();
        }
        Ok(count)
    }
}

//! Per-owner, per-table sync bookkeeping
//!
//! Remembers when each table was last reconciled for each owner, so "modified
//! since the last sync" survives restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::local::{Document, LocalStore, Result};

/// Collection holding sync metadata
pub const META_COLLECTION: &str = "_sync_meta";

/// Sync bookkeeping for one `(owner, table)` pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMeta {
    /// Storage key, `owner:table`
    pub key: String,
    /// Owner the table was synced for
    pub owner_id: String,
    /// Remote table name
    pub table: String,
    /// Start of the last successful reconciliation
    pub last_sync_time: DateTime<Utc>,
}

impl Document for SyncMeta {
    fn doc_id(&self) -> &str {
        &self.key
    }
}

/// Accessor for the metadata collection
#[derive(Clone)]
pub struct MetaStore {
    store: LocalStore,
}

impl MetaStore {
    /// Create a metadata accessor over the given store
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    fn key(owner_id: &str, table: &str) -> String {
        format!("{}:{}", owner_id, table)
    }

    /// Last successful sync of a table for an owner
    pub fn last_sync(&self, owner_id: &str, table: &str) -> Result<Option<DateTime<Utc>>> {
        let meta: Option<SyncMeta> = self.store.get(META_COLLECTION, &Self::key(owner_id, table))?;
        Ok(meta.map(|m| m.last_sync_time))
    }

    /// Record a successful sync
    pub fn set_last_sync(&self, owner_id: &str, table: &str, at: DateTime<Utc>) -> Result<()> {
        let meta = SyncMeta {
            key: Self::key(owner_id, table),
            owner_id: owner_id.to_string(),
            table: table.to_string(),
            last_sync_time: at,
        };
        self.store.put(META_COLLECTION, &meta)
    }

    /// Most recent sync across every table of an owner
    pub fn latest_for_owner(&self, owner_id: &str) -> Result<Option<DateTime<Utc>>> {
        let all: Vec<SyncMeta> = self.store.get_all(META_COLLECTION)?;
        Ok(all.into_iter().filter(|m| m.owner_id == owner_id).map(|m| m.last_sync_time).max())
    }

    /// Forget every table of an owner
    pub fn remove_owner(&self, owner_id: &str) -> Result<usize> {
        let all: Vec<SyncMeta> = self.store.get_all(META_COLLECTION)?;
        let mut count = 0;
        for meta in all.into_iter().filter(|m| m.owner_id == owner_id) {
            if self.store.delete(META_COLLECTION, &meta.key)? {
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn test_last_sync_roundtrip() {
        let meta = MetaStore::new(LocalStore::in_memory().unwrap());
        assert_eq!(meta.last_sync("a", "orders").unwrap(), None);

        meta.set_last_sync("a", "orders", ts("2024-01-01T00:00:00Z")).unwrap();
        meta.set_last_sync("a", "orders", ts("2024-01-02T00:00:00Z")).unwrap();

        assert_eq!(meta.last_sync("a", "orders").unwrap(), Some(ts("2024-01-02T00:00:00Z")));
        assert_eq!(meta.last_sync("b", "orders").unwrap(), None);
    }

    #[test]
    fn test_latest_and_remove_owner() {
        let meta = MetaStore::new(LocalStore::in_memory().unwrap());
        meta.set_last_sync("a", "orders", ts("2024-01-01T00:00:00Z")).unwrap();
        meta.set_last_sync("a", "vessels", ts("2024-01-05T00:00:00Z")).unwrap();
        meta.set_last_sync("b", "orders", ts("2024-02-01T00:00:00Z")).unwrap();

        assert_eq!(meta.latest_for_owner("a").unwrap(), Some(ts("2024-01-05T00:00:00Z")));
        assert_eq!(meta.remove_owner("a").unwrap(), 2);
        assert_eq!(meta.latest_for_owner("a").unwrap(), None);
        assert!(meta.last_sync("b", "orders").unwrap().is_some());
    }
}

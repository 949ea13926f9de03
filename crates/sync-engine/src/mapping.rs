//! Local collection to remote table mapping

use std::collections::HashMap;

use crate::error::{Result, SyncError};

/// One-to-one mapping between local collections and remote tables
///
/// Collections without an entry are local-only and never sync.
#[derive(Debug, Clone, Default)]
pub struct CollectionMap {
    pairs: Vec<(String, String)>,
    by_collection: HashMap<String, String>,
    by_table: HashMap<String, String>,
}

impl CollectionMap {
    /// Build a mapping from `(collection, table)` pairs
    ///
    /// Fails if a collection or table appears twice, or if a collection name
    /// uses the reserved system prefix.
    pub fn new<C, T>(pairs: impl IntoIterator<Item = (C, T)>) -> Result<Self>
    where
        C: Into<String>,
        T: Into<String>,
    {
        let mut map = Self::default();
        for (collection, table) in pairs {
            let collection = collection.into();
            let table = table.into();

            if collection.is_empty() || table.is_empty() {
                return Err(SyncError::InvalidMapping("empty name".to_string()));
            }
            if collection.starts_with(storage::local::SYSTEM_PREFIX) {
                return Err(SyncError::InvalidMapping(format!(
                    "{} is a reserved collection",
                    collection
                )));
            }
            if map.by_collection.contains_key(&collection) {
                return Err(SyncError::InvalidMapping(format!(
                    "collection {} mapped twice",
                    collection
                )));
            }
            if map.by_table.contains_key(&table) {
                return Err(SyncError::InvalidMapping(format!("table {} mapped twice", table)));
            }

            map.by_collection.insert(collection.clone(), table.clone());
            map.by_table.insert(table.clone(), collection.clone());
            map.pairs.push((collection, table));
        }
        Ok(map)
    }

    /// Remote table of a collection
    pub fn table_for(&self, collection: &str) -> Option<&str> {
        self.by_collection.get(collection).map(String::as_str)
    }

    /// Local collection of a table
    pub fn collection_for(&self, table: &str) -> Option<&str> {
        self.by_table.get(table).map(String::as_str)
    }

    /// `(collection, table)` pairs in declaration order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(c, t)| (c.as_str(), t.as_str()))
    }

    /// Number of synced collections
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether nothing syncs
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

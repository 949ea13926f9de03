//! Record envelope shared by the local store, the queue and the remote
//!
//! Every record is a schema-less bag of domain fields wrapped in a fixed
//! envelope: `id`, `created_at`, `updated_at` and `owner_id`. Two optional
//! envelope fields support sync: `deleted_at` marks a remote tombstone and
//! `version` is a per-record counter bumped on each local write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Envelope keys that domain fields may not override
pub const ENVELOPE_KEYS: [&str; 6] =
    ["id", "created_at", "updated_at", "owner_id", "deleted_at", "version"];

/// A single synced record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Identifier, unique within a collection
    pub id: String,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Last modification time
    pub updated_at: DateTime<Utc>,

    /// Tenant that owns this record
    pub owner_id: String,

    /// Set on remote tombstones
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,

    /// Monotonic per-record write counter
    #[serde(default)]
    pub version: u64,

    /// Domain fields
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    /// Create a fresh record stamped with `now` for both timestamps
    pub fn new(id: impl Into<String>, owner_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            created_at: now,
            updated_at: now,
            owner_id: owner_id.into(),
            deleted_at: None,
            version: 0,
            fields: Map::new(),
        }
    }

    /// Builder-style field setter
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Get a domain field
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Set a domain field, ignoring envelope keys
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        if !ENVELOPE_KEYS.contains(&key.as_str()) {
            self.fields.insert(key, value.into());
        }
    }

    /// Merge a patch of domain fields into this record
    ///
    /// Envelope keys in the patch are dropped; the envelope is only ever
    /// changed by the sync layer.
    pub fn merge_fields(&mut self, patch: Map<String, Value>) {
        for (key, value) in patch {
            self.set(key, value);
        }
    }

    /// Whether this record is a tombstone
    pub fn is_tombstone(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Serialize to a JSON value
    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    /// Parse from a JSON value
    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }
}

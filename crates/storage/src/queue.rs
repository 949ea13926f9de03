//! Durable replay queue for remote writes
//!
//! Mutations that have not yet been acknowledged by the remote backend are
//! kept here, in the local-only `_sync_queue` collection of the
//! [`LocalStore`]. Entries carry a strictly increasing sequence number, so
//! the queue is a single ordered sequence spanning every table and survives
//! process restarts.
//!
//! Entries are logically keyed by `(table, operation, owner, record id)`. A
//! later enqueue for the same key removes the older entry and appends the new
//! one at the tail; a delete additionally supersedes pending upserts of the
//! same record.
//!
//! Per-record lookups go through a secondary index in `_sync_queue_index`
//! that maps `(table, owner, record id)` to the sequence numbers queued for
//! that record. The index is written after the entry and trimmed after the
//! entry is removed, so a stale sequence number in the index is skipped on
//! lookup and an entry is never hidden from replay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;

use crate::local::{Document, LocalStore, LocalStoreError, Result};

/// Collection holding the queue
pub const QUEUE_COLLECTION: &str = "_sync_queue";

/// Collection holding the per-record index of the queue
pub const QUEUE_INDEX_COLLECTION: &str = "_sync_queue_index";

/// Remote operation to replay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Idempotent upsert by id
    Upsert,
    /// Delete by id
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Upsert => write!(f, "upsert"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

/// A mutation waiting for remote delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Position in the queue
    pub seq: u64,
    /// Remote table name
    pub table: String,
    /// Operation to replay
    pub operation: Operation,
    /// Id of the affected record
    pub record_id: String,
    /// Owner the mutation was written under
    pub owner_id: String,
    /// Full record for upserts, `{id, owner_id}` for deletes
    pub payload: Value,
    /// When the entry was queued
    pub enqueued_at: DateTime<Utc>,
    /// Failed delivery attempts so far
    #[serde(default)]
    pub attempts: u32,
    #[serde(skip)]
    doc_key: String,
}

impl QueueEntry {
    fn key_for(seq: u64) -> String {
        // Zero padding keeps sled's byte order equal to sequence order
        format!("{:020}", seq)
    }

    fn slot_key(&self) -> String {
        slot_key(&self.table, &self.owner_id, &self.record_id)
    }
}

impl Document for QueueEntry {
    fn doc_id(&self) -> &str {
        &self.doc_key
    }
}

/// Sequence numbers queued for one record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RecordSlot {
    key: String,
    seqs: Vec<u64>,
}

impl Document for RecordSlot {
    fn doc_id(&self) -> &str {
        &self.key
    }
}

fn slot_key(table: &str, owner_id: &str, record_id: &str) -> String {
    format!("{}\u{1f}{}\u{1f}{}", table, owner_id, record_id)
}

/// Outcome of a replay pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayOutcome {
    /// Entries acknowledged and removed
    pub replayed: usize,
    /// Entries that failed and stay queued
    pub failed: usize,
    /// Entries skipped because an earlier entry for the same record failed
    pub deferred: usize,
    /// Message of the last failure, if any
    pub last_error: Option<String>,
}

/// Sync queue stored inside the local store
#[derive(Clone)]
pub struct SyncQueue {
    store: LocalStore,
}

impl SyncQueue {
    /// Create a queue over the given store
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    /// Append a mutation
    ///
    /// The record id and owner are read from the payload's `id` and
    /// `owner_id` fields. The entry is persisted before this returns. Only
    /// entries of the same owner are superseded.
    pub fn enqueue(&self, table: &str, operation: Operation, payload: Value) -> Result<QueueEntry> {
        let record_id = payload
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| LocalStoreError::InvalidId(QUEUE_COLLECTION.to_string()))?
            .to_string();
        let owner_id = payload
            .get("owner_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut slot = self.slot(&slot_key(table, &owner_id, &record_id))?;
        let mut kept = Vec::with_capacity(slot.seqs.len() + 1);
        let mut superseded = 0;
        for entry in self.load_all(&slot.seqs)? {
            let obsolete = entry.operation == operation
                || (operation == Operation::Delete && entry.operation == Operation::Upsert);
            if !obsolete {
                kept.push(entry.seq);
            } else if self.store.delete(QUEUE_COLLECTION, &entry.doc_key)? {
                superseded += 1;
            }
        }

        let seq = self.store.next_sequence()?;
        let entry = QueueEntry {
            seq,
            table: table.to_string(),
            operation,
            record_id,
            owner_id,
            payload,
            enqueued_at: Utc::now(),
            attempts: 0,
            doc_key: QueueEntry::key_for(seq),
        };
        self.store.put(QUEUE_COLLECTION, &entry)?;

        kept.push(seq);
        slot.seqs = kept;
        self.save_slot(&slot)?;

        tracing::debug!(
            table,
            %operation,
            record_id = %entry.record_id,
            seq,
            superseded,
            "queued mutation"
        );
        Ok(entry)
    }

    /// All entries in queue order
    pub fn entries(&self) -> Result<Vec<QueueEntry>> {
        let mut entries: Vec<QueueEntry> = self.store.get_all(QUEUE_COLLECTION)?;
        for entry in &mut entries {
            entry.doc_key = QueueEntry::key_for(entry.seq);
        }
        entries.sort_by_key(|e| e.seq);
        Ok(entries)
    }

    /// Entries for one table, in queue order
    pub fn entries_for(&self, table: &str) -> Result<Vec<QueueEntry>> {
        Ok(self.entries()?.into_iter().filter(|e| e.table == table).collect())
    }

    /// Entries written under one owner, in queue order
    pub fn entries_for_owner(&self, owner_id: &str) -> Result<Vec<QueueEntry>> {
        Ok(self.entries()?.into_iter().filter(|e| e.owner_id == owner_id).collect())
    }

    /// Pending entries for a single record of one owner, in queue order
    pub fn pending_for(
        &self,
        table: &str,
        owner_id: &str,
        record_id: &str,
    ) -> Result<Vec<QueueEntry>> {
        let slot = self.slot(&slot_key(table, owner_id, record_id))?;
        self.load_all(&slot.seqs)
    }

    /// Whether a delete is waiting for this record
    pub fn has_pending_delete(&self, table: &str, owner_id: &str, record_id: &str) -> Result<bool> {
        Ok(self
            .pending_for(table, owner_id, record_id)?
            .iter()
            .any(|e| e.operation == Operation::Delete))
    }

    /// Drop pending upserts of a record; returns how many were dropped
    pub fn discard_upserts(&self, table: &str, owner_id: &str, record_id: &str) -> Result<usize> {
        let mut count = 0;
        for entry in self.pending_for(table, owner_id, record_id)? {
            if entry.operation == Operation::Upsert && self.remove(entry.seq)? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Remove one entry after acknowledgement
    pub fn remove(&self, seq: u64) -> Result<bool> {
        let Some(entry) = self.load(seq)? else {
            return Ok(false);
        };
        let removed = self.store.delete(QUEUE_COLLECTION, &entry.doc_key)?;

        let mut slot = self.slot(&entry.slot_key())?;
        slot.seqs.retain(|s| *s != seq);
        self.save_slot(&slot)?;
        Ok(removed)
    }

    /// Bump the attempt counter of an entry still in the queue
    pub fn record_failure(&self, seq: u64) -> Result<()> {
        if let Some(mut entry) = self.load(seq)? {
            entry.attempts += 1;
            self.store.put(QUEUE_COLLECTION, &entry)?;
        }
        Ok(())
    }

    /// Remove every entry written under an owner
    pub fn remove_owner(&self, owner_id: &str) -> Result<usize> {
        let mut count = 0;
        for entry in self.entries_for_owner(owner_id)? {
            if self.remove(entry.seq)? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Total number of pending entries
    pub fn len(&self) -> Result<usize> {
        self.store.len(QUEUE_COLLECTION)
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> Result<bool> {
        self.store.is_empty(QUEUE_COLLECTION)
    }

    /// Replay entries in order through `apply`
    ///
    /// Acknowledged entries are removed one by one. A failed entry stays in
    /// place with its attempt counter bumped, and later entries for the same
    /// record are deferred so per-record order is never inverted. Entries for
    /// other records keep replaying.
    pub async fn replay<F, Fut, E>(
        &self,
        entries: Vec<QueueEntry>,
        mut apply: F,
    ) -> Result<ReplayOutcome>
    where
        F: FnMut(QueueEntry) -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: fmt::Display,
    {
        let mut outcome = ReplayOutcome::default();
        let mut blocked: HashSet<String> = HashSet::new();

        for entry in entries {
            let key = entry.slot_key();
            if blocked.contains(&key) {
                outcome.deferred += 1;
                continue;
            }

            let seq = entry.seq;
            let table = entry.table.clone();
            let record_id = entry.record_id.clone();
            match apply(entry).await {
                Ok(()) => {
                    self.remove(seq)?;
                    outcome.replayed += 1;
                }
                Err(err) => {
                    tracing::warn!(
                        seq,
                        table = %table,
                        record_id = %record_id,
                        error = %err,
                        "replay failed"
                    );
                    self.record_failure(seq)?;
                    outcome.failed += 1;
                    outcome.last_error = Some(err.to_string());
                    blocked.insert(key);
                }
            }
        }

        Ok(outcome)
    }

    fn load(&self, seq: u64) -> Result<Option<QueueEntry>> {
        let key = QueueEntry::key_for(seq);
        let entry: Option<QueueEntry> = self.store.get(QUEUE_COLLECTION, &key)?;
        Ok(entry.map(|mut entry| {
            entry.doc_key = key;
            entry
        }))
    }

    fn load_all(&self, seqs: &[u64]) -> Result<Vec<QueueEntry>> {
        let mut entries = Vec::with_capacity(seqs.len());
        for seq in seqs {
            if let Some(entry) = self.load(*seq)? {
                entries.push(entry);
            }
        }
        entries.sort_by_key(|e| e.seq);
        Ok(entries)
    }

    fn slot(&self, key: &str) -> Result<RecordSlot> {
        let slot: Option<RecordSlot> = self.store.get(QUEUE_INDEX_COLLECTION, key)?;
        Ok(slot.unwrap_or_else(|| RecordSlot {
            key: key.to_string(),
            seqs: Vec::new(),
        }))
    }

    fn save_slot(&self, slot: &RecordSlot) -> Result<()> {
        if slot.seqs.is_empty() {
            self.store.delete(QUEUE_INDEX_COLLECTION, &slot.key)?;
        } else {
            self.store.put(QUEUE_INDEX_COLLECTION, slot)?;
        }
        Ok(())
    }
}

//! # Record Store
//!
//! Ordered, deduplicated in-memory holder of the synchronized collection.
//!
//! ## Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         RecordStore                                     │
//! │                                                                         │
//! │   by_id: HashMap<RecordId, SortKey>        ordered: BTreeMap<SortKey,…> │
//! │   ────────────────────────────────         ──────────────────────────── │
//! │   "7"  → (t=30, "7")                       (t=30, "7")  → Record 7      │
//! │   "2"  → (t=20, "2")           ───────►    (t=20, "2")  → Record 2      │
//! │   "1"  → (t=10, "1")                       (t=10, "1")  → Record 1      │
//! │                                                                         │
//! │   SortKey = (Reverse(created_at), id)                                  │
//! │   Iterating `ordered` yields newest first; ties break by id.           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The order is a pure function of each record's key, so replacing a record
//! always moves it to the right slot. There is no separate sort step that
//! could drift.

use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use crate::error::{CoreError, CoreResult};
use crate::types::{Record, RecordId};

type SortKey = (Reverse<DateTime<Utc>>, RecordId);

fn sort_key(record: &Record) -> SortKey {
    (Reverse(record.created_at), record.id.clone())
}

/// In-memory ordered record collection. Performs no I/O.
#[derive(Debug, Clone, Default)]
pub struct RecordStore {
    by_id: HashMap<RecordId, SortKey>,
    ordered: BTreeMap<SortKey, Record>,
}

impl RecordStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a record by id.
    ///
    /// Returns the record previously stored under the same id.
    pub fn upsert(&mut self, record: Record) -> Option<Record> {
        let previous = self.take(&record.id);
        let key = sort_key(&record);
        self.by_id.insert(record.id.clone(), key.clone());
        self.ordered.insert(key, record);
        previous
    }

    /// Removes a record. Removing an absent id is a successful no-op.
    pub fn remove(&mut self, id: &RecordId) -> Option<Record> {
        self.take(id)
    }

    /// Atomically replaces the whole collection.
    ///
    /// Duplicate ids in `records` collapse to the highest version.
    pub fn snapshot_replace(&mut self, records: impl IntoIterator<Item = Record>) {
        let mut latest: HashMap<RecordId, Record> = HashMap::new();
        for record in records {
            match latest.get(&record.id) {
                Some(existing) if existing.version >= record.version => {}
                _ => {
                    latest.insert(record.id.clone(), record);
                }
            }
        }

        self.by_id.clear();
        self.ordered.clear();
        for (id, record) in latest {
            let key = sort_key(&record);
            self.by_id.insert(id, key.clone());
            self.ordered.insert(key, record);
        }
    }

    /// Returns the current ordered sequence (newest first).
    pub fn view(&self) -> Vec<Record> {
        self.ordered.values().cloned().collect()
    }

    /// Iterates records in view order without cloning.
    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.ordered.values()
    }

    /// Looks up a record by id.
    pub fn get(&self, id: &RecordId) -> Option<&Record> {
        self.by_id.get(id).and_then(|key| self.ordered.get(key))
    }

    /// Like [`Self::get`], but a missing id is an error.
    pub fn require(&self, id: &RecordId) -> CoreResult<&Record> {
        self.get(id)
            .ok_or_else(|| CoreError::RecordNotFound(id.clone()))
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Drops every record.
    pub fn clear(&mut self) {
        self.by_id.clear();
        self.ordered.clear();
    }

    fn take(&mut self, id: &RecordId) -> Option<Record> {
        let key = self.by_id.remove(id)?;
        self.ordered.remove(&key)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

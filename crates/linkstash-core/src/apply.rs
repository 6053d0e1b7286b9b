//! # Version-Checked Apply
//!
//! The single path through which authoritative data enters a [`RecordStore`]:
//! drained buffer events, live events and mutation confirmations.
//!
//! ## Conflict Resolution
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Version Gate Rules                                   │
//! │                                                                         │
//! │  INSERT / UPDATE (record r):                                           │
//! │  if r.id was deleted:              skip (deletes are final)            │
//! │  elif stored.version >= r.version: skip (already have it or newer)     │
//! │  else:                             upsert r                            │
//! │                                                                         │
//! │  DELETE (id):                                                          │
//! │  remove id (absent is fine), remember id as deleted                    │
//! │                                                                         │
//! │  Applying the same event twice is therefore a no-op the second time.   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Ids are assigned by the remote store and never reused, so a tombstone
//! outlives any stale insert that may still be in flight.

use std::collections::HashSet;

use crate::store::RecordStore;
use crate::types::{ChangeEvent, Record, RecordId};

/// Result of offering one change to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Record was new.
    Inserted,
    /// Record replaced an older version.
    Replaced,
    /// Record was deleted.
    Removed,
    /// Event was older than (or equal to) what is stored.
    Stale,
    /// Delete for a record that is not stored.
    Missing,
}

impl ApplyOutcome {
    /// Returns true if the store changed.
    pub fn changed(&self) -> bool {
        matches!(
            self,
            ApplyOutcome::Inserted | ApplyOutcome::Replaced | ApplyOutcome::Removed
        )
    }
}

/// Applies authoritative changes with version and tombstone checks.
#[derive(Debug, Clone, Default)]
pub struct VersionGate {
    tombstones: HashSet<RecordId>,
}

impl VersionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one change event.
    pub fn apply(&mut self, store: &mut RecordStore, event: &ChangeEvent) -> ApplyOutcome {
        match event {
            ChangeEvent::Insert { record, .. } | ChangeEvent::Update { record, .. } => {
                self.apply_record(store, record.clone())
            }
            ChangeEvent::Delete { record_id, .. } => self.apply_delete(store, record_id),
        }
    }

    /// Upserts an authoritative record if it is newer than what is stored.
    pub fn apply_record(&mut self, store: &mut RecordStore, record: Record) -> ApplyOutcome {
        if self.tombstones.contains(&record.id) {
            return ApplyOutcome::Stale;
        }

        match store.get(&record.id) {
            Some(stored) if stored.version >= record.version => ApplyOutcome::Stale,
            Some(_) => {
                store.upsert(record);
                ApplyOutcome::Replaced
            }
            None => {
                store.upsert(record);
                ApplyOutcome::Inserted
            }
        }
    }

    /// Removes a record and remembers it as deleted.
    pub fn apply_delete(&mut self, store: &mut RecordStore, id: &RecordId) -> ApplyOutcome {
        self.tombstones.insert(id.clone());
        match store.remove(id) {
            Some(_) => ApplyOutcome::Removed,
            None => ApplyOutcome::Missing,
        }
    }

    /// Records a delete that was confirmed outside the event stream.
    pub fn tombstone(&mut self, id: RecordId) {
        self.tombstones.insert(id);
    }

    pub fn is_tombstoned(&self, id: &RecordId) -> bool {
        self.tombstones.contains(id)
    }

    /// Forgets all deletes.
    pub fn clear(&mut self) {
        self.tombstones.clear();
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Fields, Version, FIELD_TITLE};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn record(id: &str, created: i64, version: u64, title: &str) -> Record {
        let mut fields = Fields::new();
        fields.insert(FIELD_TITLE.into(), json!(title));
        Record::new(
            id,
            fields,
            Utc.timestamp_opt(created, 0).unwrap(),
            Version::new(version),
        )
    }

    #[test]
    fn test_same_event_twice_is_idempotent() {
        let mut store = RecordStore::new();
        let mut gate = VersionGate::new();
        let event = ChangeEvent::update(record("1", 10, 5, "A"));

        assert_eq!(gate.apply(&mut store, &event), ApplyOutcome::Inserted);
        let once = store.view();

        assert_eq!(gate.apply(&mut store, &event), ApplyOutcome::Stale);
        assert_eq!(store.view(), once);
    }

    #[test]
    fn test_highest_version_wins_in_any_order() {
        let versions = [3u64, 1, 4, 2];
        let orders: [[usize; 4]; 3] = [[0, 1, 2, 3], [3, 2, 1, 0], [1, 3, 0, 2]];

        for order in orders {
            let mut store = RecordStore::new();
            let mut gate = VersionGate::new();
            for i in order {
                let v = versions[i];
                gate.apply(
                    &mut store,
                    &ChangeEvent::update(record("1", 10, v, &format!("v{v}"))),
                );
            }
            let stored = store.get(&"1".into()).unwrap();
            assert_eq!(stored.version, Version::new(4));
            assert_eq!(stored.title(), Some("v4"));
        }
    }

    #[test]
    fn test_delete_is_final() {
        let mut store = RecordStore::new();
        let mut gate = VersionGate::new();

        gate.apply(&mut store, &ChangeEvent::insert(record("1", 10, 1, "A")));
        assert_eq!(
            gate.apply(&mut store, &ChangeEvent::delete("1", None)),
            ApplyOutcome::Removed
        );

        // A late update must not resurrect it
        assert_eq!(
            gate.apply(&mut store, &ChangeEvent::update(record("1", 10, 9, "A"))),
            ApplyOutcome::Stale
        );
        assert!(store.is_empty());

        // Deleting again is harmless
        assert_eq!(
            gate.apply(&mut store, &ChangeEvent::delete("1", None)),
            ApplyOutcome::Missing
        );
    }

    #[test]
    fn test_confirmed_delete_blocks_stale_insert() {
        let mut store = RecordStore::new();
        let mut gate = VersionGate::new();
        gate.tombstone("9".into());

        let outcome = gate.apply_record(&mut store, record("9", 10, 1, "late"));
        assert_eq!(outcome, ApplyOutcome::Stale);
        assert!(!outcome.changed());
    }
}

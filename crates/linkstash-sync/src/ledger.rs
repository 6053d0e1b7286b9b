//! # Mutation Ledger
//!
//! Speculative local execution of user writes, reconciled against the
//! authoritative response.
//!
//! ## Mutation Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Optimistic Mutation Flow                             │
//! │                                                                         │
//! │  submit_create(fields)                                                 │
//! │  ├── placeholder id "local-<uuid>", created_at = now, version 0        │
//! │  ├── upsert placeholder (visible immediately)                          │
//! │  └── Dispatch ──► remote                                               │
//! │         ├── Ok(server record)  remove placeholder, apply via gate      │
//! │         │                      (no-op if the Insert event came first)  │
//! │         └── Err                remove placeholder                      │
//! │                                                                         │
//! │  submit_update(id, changes)                                            │
//! │  ├── previous = stored, optimistic = previous + changes                │
//! │  └── Dispatch ──► Ok: authoritative replaces optimistic                │
//! │                   Err: previous restored (if optimistic still shown)   │
//! │                                                                         │
//! │  submit_delete(id)                                                     │
//! │  ├── previous = removed record                                         │
//! │  └── Dispatch ──► Ok: id tombstoned                                    │
//! │                   Err: previous re-inserted (unless deleted remotely)  │
//! │                                                                         │
//! │  ONE PENDING MUTATION PER ID:                                          │
//! │  later writes to the same id queue and start when the prior one is     │
//! │  Confirmed or Failed.                                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The ledger performs no I/O. It returns [`Dispatch`]es for the session to
//! send and [`Resolution`]s for the session to report.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

use linkstash_core::{
    CorrelationId, Fields, MutationKind, MutationStatus, Record, RecordId, RecordStore, Version,
    VersionGate,
};

use crate::error::{SyncError, SyncResult};
use crate::remote::MutationRequest;

// =============================================================================
// Ledger Types
// =============================================================================

/// A locally issued, not yet confirmed write.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation {
    /// Client-generated id reported back in the outcome.
    pub correlation_id: CorrelationId,

    /// Kind of write.
    pub kind: MutationKind,

    /// Record the write applies to. A placeholder for creates.
    pub target_id: RecordId,

    /// Validated field changes (empty for deletes).
    pub fields: Fields,

    /// Record shown while pending. `None` for deletes.
    pub optimistic: Option<Record>,

    /// Authoritative record the optimistic one was derived from.
    pub previous: Option<Record>,

    /// Current lifecycle state.
    pub status: MutationStatus,

    /// When the write started.
    pub submitted_at: DateTime<Utc>,
}

/// A remote request the session must issue.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub correlation_id: CorrelationId,
    pub request: MutationRequest,
}

/// Terminal outcome of one mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub correlation_id: CorrelationId,
    pub kind: MutationKind,
    pub target_id: RecordId,
    pub status: MutationStatus,
    pub result: SyncResult<Record>,
}

/// Work produced by one ledger operation.
#[derive(Debug, Default, PartialEq)]
pub struct LedgerStep {
    /// Requests to send, in order.
    pub dispatch: Vec<Dispatch>,

    /// Outcomes to report.
    pub resolved: Vec<Resolution>,
}

impl LedgerStep {
    fn merge(&mut self, other: LedgerStep) {
        self.dispatch.extend(other.dispatch);
        self.resolved.extend(other.resolved);
    }
}

/// A write waiting for an earlier one on the same id.
#[derive(Debug, Clone)]
struct QueuedMutation {
    correlation_id: CorrelationId,
    kind: MutationKind,
    fields: Fields,
}

// =============================================================================
// Mutation Ledger
// =============================================================================

/// Tracks in-flight optimistic mutations.
#[derive(Debug, Default)]
pub struct MutationLedger {
    /// In-flight mutations by correlation id.
    pending: HashMap<CorrelationId, PendingMutation>,

    /// The single in-flight mutation per record id.
    active: HashMap<RecordId, CorrelationId>,

    /// Writes waiting for the active one, per record id.
    queued: HashMap<RecordId, VecDeque<QueuedMutation>>,

    /// Placeholder id → server id for confirmed creates.
    aliases: HashMap<RecordId, RecordId>,
}

impl MutationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps a confirmed placeholder id to its server id.
    pub fn resolve_alias(&self, id: &RecordId) -> RecordId {
        self.aliases.get(id).cloned().unwrap_or_else(|| id.clone())
    }

    /// Number of in-flight mutations.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Number of writes waiting behind an in-flight one.
    pub fn queued_count(&self) -> usize {
        self.queued.values().map(VecDeque::len).sum()
    }

    /// Discards all state. Outstanding results are then ignored.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.active.clear();
        self.queued.clear();
        self.aliases.clear();
    }

    // =========================================================================
    // Submit
    // =========================================================================

    /// Starts an optimistic create. `fields` must already be validated.
    pub fn submit_create(
        &mut self,
        store: &mut RecordStore,
        correlation_id: CorrelationId,
        fields: Fields,
        now: DateTime<Utc>,
    ) -> LedgerStep {
        let placeholder = RecordId::placeholder();
        let optimistic = Record::new(placeholder.clone(), fields.clone(), now, Version::ZERO);
        store.upsert(optimistic.clone());

        debug!(
            correlation_id = %correlation_id,
            placeholder = %placeholder,
            "Optimistic create applied"
        );

        self.register(PendingMutation {
            correlation_id,
            kind: MutationKind::Create,
            target_id: placeholder,
            fields: fields.clone(),
            optimistic: Some(optimistic),
            previous: None,
            status: MutationStatus::Pending,
            submitted_at: now,
        });

        LedgerStep {
            dispatch: vec![Dispatch {
                correlation_id,
                request: MutationRequest::create(fields),
            }],
            resolved: Vec::new(),
        }
    }

    /// Starts, or queues, an optimistic update. `changes` must be validated.
    pub fn submit_update(
        &mut self,
        store: &mut RecordStore,
        correlation_id: CorrelationId,
        id: &RecordId,
        changes: Fields,
        now: DateTime<Utc>,
    ) -> SyncResult<LedgerStep> {
        self.submit(store, correlation_id, MutationKind::Update, id, changes, now)
    }

    /// Starts, or queues, an optimistic delete.
    pub fn submit_delete(
        &mut self,
        store: &mut RecordStore,
        correlation_id: CorrelationId,
        id: &RecordId,
        now: DateTime<Utc>,
    ) -> SyncResult<LedgerStep> {
        self.submit(
            store,
            correlation_id,
            MutationKind::Delete,
            id,
            Fields::new(),
            now,
        )
    }

    fn submit(
        &mut self,
        store: &mut RecordStore,
        correlation_id: CorrelationId,
        kind: MutationKind,
        id: &RecordId,
        fields: Fields,
        now: DateTime<Utc>,
    ) -> SyncResult<LedgerStep> {
        let target = self.resolve_alias(id);

        if self.active.contains_key(&target) {
            debug!(
                correlation_id = %correlation_id,
                record_id = %target,
                kind = %kind,
                "Mutation queued behind in-flight write"
            );
            self.queued
                .entry(target)
                .or_default()
                .push_back(QueuedMutation {
                    correlation_id,
                    kind,
                    fields,
                });
            return Ok(LedgerStep::default());
        }

        store.require(&target)?;
        let dispatch = self.start(store, correlation_id, kind, target, fields, now);
        Ok(LedgerStep {
            dispatch: dispatch.into_iter().collect(),
            resolved: Vec::new(),
        })
    }

    /// Applies an update/delete optimistically. `None` if the target is gone.
    fn start(
        &mut self,
        store: &mut RecordStore,
        correlation_id: CorrelationId,
        kind: MutationKind,
        target: RecordId,
        fields: Fields,
        now: DateTime<Utc>,
    ) -> Option<Dispatch> {
        let current = store.get(&target)?.clone();

        let (optimistic, request) = match kind {
            MutationKind::Update => {
                let optimistic = current.with_fields(&fields);
                store.upsert(optimistic.clone());
                (
                    Some(optimistic),
                    MutationRequest::update(target.clone(), fields.clone()),
                )
            }
            MutationKind::Delete => {
                store.remove(&target);
                (None, MutationRequest::delete(target.clone()))
            }
            MutationKind::Create => return None,
        };

        debug!(
            correlation_id = %correlation_id,
            record_id = %target,
            kind = %kind,
            "Optimistic mutation applied"
        );

        self.register(PendingMutation {
            correlation_id,
            kind,
            target_id: target,
            fields,
            optimistic,
            previous: Some(current),
            status: MutationStatus::Pending,
            submitted_at: now,
        });

        Some(Dispatch {
            correlation_id,
            request,
        })
    }

    fn register(&mut self, mutation: PendingMutation) {
        self.active
            .insert(mutation.target_id.clone(), mutation.correlation_id);
        self.pending.insert(mutation.correlation_id, mutation);
    }

    // =========================================================================
    // Reconcile
    // =========================================================================

    /// Reconciles a successful remote write.
    ///
    /// Unknown correlation ids (e.g. after [`Self::clear`]) are ignored.
    pub fn confirm(
        &mut self,
        store: &mut RecordStore,
        gate: &mut VersionGate,
        correlation_id: &CorrelationId,
        record: Record,
        now: DateTime<Utc>,
    ) -> LedgerStep {
        let Some(mut mutation) = self.pending.remove(correlation_id) else {
            debug!(correlation_id = %correlation_id, "Ignoring confirmation for unknown mutation");
            return LedgerStep::default();
        };
        self.active.remove(&mutation.target_id);
        mutation.status = MutationStatus::Confirmed;

        let target = mutation.target_id.clone();
        let mut release_id = target.clone();

        let result = match mutation.kind {
            MutationKind::Create => {
                store.remove(&target);
                let outcome = gate.apply_record(store, record.clone());
                debug!(
                    placeholder = %target,
                    record_id = %record.id,
                    ?outcome,
                    "Create confirmed"
                );

                self.aliases.insert(target.clone(), record.id.clone());
                if let Some(waiting) = self.queued.remove(&target) {
                    self.queued
                        .entry(record.id.clone())
                        .or_default()
                        .extend(waiting);
                }
                release_id = record.id.clone();
                Ok(record)
            }
            MutationKind::Update => self.confirm_update(store, gate, &mutation, record),
            MutationKind::Delete => {
                gate.tombstone(target.clone());
                store.remove(&target);
                Ok(record)
            }
        };

        info!(
            correlation_id = %correlation_id,
            record_id = %release_id,
            kind = %mutation.kind,
            ok = result.is_ok(),
            "Mutation confirmed"
        );

        let mut step = LedgerStep {
            dispatch: Vec::new(),
            resolved: vec![Resolution {
                correlation_id: *correlation_id,
                kind: mutation.kind,
                target_id: release_id.clone(),
                status: mutation.status,
                result,
            }],
        };
        step.merge(self.promote(store, &release_id, now));
        step
    }

    fn confirm_update(
        &mut self,
        store: &mut RecordStore,
        gate: &mut VersionGate,
        mutation: &PendingMutation,
        record: Record,
    ) -> SyncResult<Record> {
        let target = &mutation.target_id;

        if gate.is_tombstoned(target) || !store.contains(target) {
            debug!(record_id = %target, "Update confirmed for a deleted record, dropping");
            return Err(SyncError::Conflict(target.clone()));
        }

        let still_optimistic = store.get(target) == mutation.optimistic.as_ref();
        if still_optimistic {
            // Never regress below the newest authoritative base we have seen
            let replacement = match &mutation.previous {
                Some(base) if base.version > record.version => base.clone(),
                _ => record.clone(),
            };
            store.upsert(replacement);
        } else {
            gate.apply_record(store, record.clone());
        }

        Ok(record)
    }

    /// Reconciles a failed remote write.
    pub fn fail(
        &mut self,
        store: &mut RecordStore,
        gate: &VersionGate,
        correlation_id: &CorrelationId,
        error: SyncError,
        now: DateTime<Utc>,
    ) -> LedgerStep {
        let Some(mut mutation) = self.pending.remove(correlation_id) else {
            debug!(correlation_id = %correlation_id, "Ignoring failure for unknown mutation");
            return LedgerStep::default();
        };
        self.active.remove(&mutation.target_id);
        mutation.status = MutationStatus::Failed;
        let target = mutation.target_id.clone();

        match mutation.kind {
            MutationKind::Create => {
                store.remove(&target);
            }
            MutationKind::Update => {
                if store.get(&target) == mutation.optimistic.as_ref() {
                    if let Some(previous) = mutation.previous.clone() {
                        store.upsert(previous);
                    }
                }
            }
            MutationKind::Delete => {
                if !gate.is_tombstoned(&target) && !store.contains(&target) {
                    if let Some(previous) = mutation.previous.clone() {
                        store.upsert(previous);
                    }
                }
            }
        }

        warn!(
            correlation_id = %correlation_id,
            record_id = %target,
            kind = %mutation.kind,
            error = %error,
            "Mutation failed, optimistic effect rolled back"
        );

        let mut step = LedgerStep {
            dispatch: Vec::new(),
            resolved: vec![Resolution {
                correlation_id: *correlation_id,
                kind: mutation.kind,
                target_id: target.clone(),
                status: mutation.status,
                result: Err(error),
            }],
        };

        if mutation.kind == MutationKind::Create {
            // Nothing can follow a create that never existed remotely
            step.merge(self.abandon_queue(&target));
        } else {
            step.merge(self.promote(store, &target, now));
        }
        step
    }

    /// Starts the next queued write for `id`, failing any whose target vanished.
    fn promote(&mut self, store: &mut RecordStore, id: &RecordId, now: DateTime<Utc>) -> LedgerStep {
        let mut step = LedgerStep::default();

        while let Some(next) = self.queued.get_mut(id).and_then(VecDeque::pop_front) {
            match self.start(
                store,
                next.correlation_id,
                next.kind,
                id.clone(),
                next.fields,
                now,
            ) {
                Some(dispatch) => {
                    step.dispatch.push(dispatch);
                    break;
                }
                None => step.resolved.push(Resolution {
                    correlation_id: next.correlation_id,
                    kind: next.kind,
                    target_id: id.clone(),
                    status: MutationStatus::Failed,
                    result: Err(SyncError::Conflict(id.clone())),
                }),
            }
        }

        if self.queued.get(id).is_some_and(VecDeque::is_empty) {
            self.queued.remove(id);
        }
        step
    }

    fn abandon_queue(&mut self, id: &RecordId) -> LedgerStep {
        let resolved = self
            .queued
            .remove(id)
            .unwrap_or_default()
            .into_iter()
            .map(|q| Resolution {
                correlation_id: q.correlation_id,
                kind: q.kind,
                target_id: id.clone(),
                status: MutationStatus::Failed,
                result: Err(SyncError::Conflict(id.clone())),
            })
            .collect();

        LedgerStep {
            dispatch: Vec::new(),
            resolved,
        }
    }

    // =========================================================================
    // Overlay
    // =========================================================================

    /// Re-applies every pending optimistic effect after a snapshot replace.
    pub fn reapply_overlay(&mut self, store: &mut RecordStore) {
        let ids: Vec<CorrelationId> = self.pending.keys().copied().collect();
        for correlation_id in ids {
            self.overlay(store, &correlation_id);
        }
    }

    /// Re-applies the pending effect on `id` after an authoritative change.
    pub fn overlay_record(&mut self, store: &mut RecordStore, id: &RecordId) {
        if let Some(correlation_id) = self.active.get(id).copied() {
            self.overlay(store, &correlation_id);
        }
    }

    fn overlay(&mut self, store: &mut RecordStore, correlation_id: &CorrelationId) {
        let Some(mutation) = self.pending.get_mut(correlation_id) else {
            return;
        };
        let target = mutation.target_id.clone();

        match mutation.kind {
            MutationKind::Create => {
                if let Some(optimistic) = &mutation.optimistic {
                    if !store.contains(&target) {
                        store.upsert(optimistic.clone());
                    }
                }
            }
            MutationKind::Update => {
                let Some(current) = store.get(&target).cloned() else {
                    return;
                };
                if mutation.optimistic.as_ref() != Some(&current) {
                    let optimistic = current.with_fields(&mutation.fields);
                    store.upsert(optimistic.clone());
                    mutation.previous = Some(current);
                    mutation.optimistic = Some(optimistic);
                }
            }
            MutationKind::Delete => {
                if let Some(current) = store.remove(&target) {
                    mutation.previous = Some(current);
                }
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use linkstash_core::{ChangeEvent, FIELD_TITLE, FIELD_URL};
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn fields(title: &str, url: &str) -> Fields {
        let mut f = Fields::new();
        f.insert(FIELD_TITLE.into(), json!(title));
        f.insert(FIELD_URL.into(), json!(url));
        f
    }

    fn title(t: &str) -> Fields {
        let mut f = Fields::new();
        f.insert(FIELD_TITLE.into(), json!(t));
        f
    }

    fn record(id: &str, created: i64, version: u64, t: &str) -> Record {
        Record::new(id, fields(t, "https://x.dev"), at(created), Version::new(version))
    }

    struct Fixture {
        store: RecordStore,
        gate: VersionGate,
        ledger: MutationLedger,
    }

    impl Fixture {
        fn with(records: Vec<Record>) -> Self {
            let mut store = RecordStore::new();
            store.snapshot_replace(records);
            Fixture {
                store,
                gate: VersionGate::new(),
                ledger: MutationLedger::new(),
            }
        }
    }

    #[test]
    fn test_create_shows_placeholder_then_server_record() {
        let mut fx = Fixture::with(vec![]);
        let cid = CorrelationId::new();

        let step = fx
            .ledger
            .submit_create(&mut fx.store, cid, fields("X", "https://y.com"), at(100));
        assert_eq!(step.dispatch.len(), 1);
        assert_eq!(step.dispatch[0].request.kind, MutationKind::Create);

        let view = fx.store.view();
        assert_eq!(view.len(), 1);
        assert!(view[0].id.is_placeholder());
        assert_eq!(view[0].title(), Some("X"));

        let server = Record::new("99", fields("X", "https://y.com"), at(101), Version::new(1));
        let step = fx
            .ledger
            .confirm(&mut fx.store, &mut fx.gate, &cid, server.clone(), at(102));

        assert_eq!(step.resolved.len(), 1);
        assert_eq!(step.resolved[0].status, MutationStatus::Confirmed);
        assert_eq!(step.resolved[0].result, Ok(server));
        let view = fx.store.view();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].id, RecordId::new("99"));
        assert_eq!(fx.ledger.pending_count(), 0);
    }

    #[test]
    fn test_create_confirmed_after_insert_event_keeps_one_record() {
        let mut fx = Fixture::with(vec![]);
        let cid = CorrelationId::new();
        fx.ledger
            .submit_create(&mut fx.store, cid, fields("X", "https://y.com"), at(100));

        // Live insert for the same write arrives before the response
        let server = Record::new("99", fields("X", "https://y.com"), at(101), Version::new(1));
        fx.gate
            .apply(&mut fx.store, &ChangeEvent::insert(server.clone()));
        assert_eq!(fx.store.len(), 2);

        fx.ledger
            .confirm(&mut fx.store, &mut fx.gate, &cid, server, at(102));
        let view = fx.store.view();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].id, RecordId::new("99"));
    }

    #[test]
    fn test_failed_create_removes_placeholder() {
        let mut fx = Fixture::with(vec![record("1", 10, 1, "A")]);
        let cid = CorrelationId::new();
        fx.ledger
            .submit_create(&mut fx.store, cid, fields("X", "https://y.com"), at(100));
        assert_eq!(fx.store.len(), 2);

        let step = fx.ledger.fail(
            &mut fx.store,
            &fx.gate,
            &cid,
            SyncError::TransientIo("down".into()),
            at(101),
        );

        assert_eq!(fx.store.len(), 1);
        assert_eq!(step.resolved[0].status, MutationStatus::Failed);
        assert!(step.resolved[0].result.is_err());
    }

    #[test]
    fn test_failed_update_restores_exact_record() {
        let original = record("1", 10, 3, "Before");
        let mut fx = Fixture::with(vec![original.clone()]);
        let cid = CorrelationId::new();

        fx.ledger
            .submit_update(&mut fx.store, cid, &"1".into(), title("After"), at(100))
            .unwrap();
        assert_eq!(fx.store.get(&"1".into()).unwrap().title(), Some("After"));

        fx.ledger.fail(
            &mut fx.store,
            &fx.gate,
            &cid,
            SyncError::Rejected("no".into()),
            at(101),
        );
        assert_eq!(fx.store.get(&"1".into()), Some(&original));
    }

    #[test]
    fn test_confirmed_update_replaces_optimistic_with_authoritative() {
        let mut fx = Fixture::with(vec![record("1", 10, 3, "Before")]);
        let cid = CorrelationId::new();
        fx.ledger
            .submit_update(&mut fx.store, cid, &"1".into(), title("After"), at(100))
            .unwrap();

        let server = record("1", 10, 4, "After");
        fx.ledger
            .confirm(&mut fx.store, &mut fx.gate, &cid, server.clone(), at(101));
        assert_eq!(fx.store.get(&"1".into()), Some(&server));
    }

    #[test]
    fn test_update_confirmed_after_concurrent_delete_is_conflict() {
        let mut fx = Fixture::with(vec![record("1", 10, 3, "Before")]);
        let cid = CorrelationId::new();
        fx.ledger
            .submit_update(&mut fx.store, cid, &"1".into(), title("After"), at(100))
            .unwrap();

        fx.gate
            .apply(&mut fx.store, &ChangeEvent::delete("1", Some(Version::new(4))));

        let step = fx.ledger.confirm(
            &mut fx.store,
            &mut fx.gate,
            &cid,
            record("1", 10, 5, "After"),
            at(101),
        );
        assert_eq!(step.resolved[0].result, Err(SyncError::Conflict("1".into())));
        assert!(fx.store.is_empty());
    }

    #[test]
    fn test_failed_delete_reinserts_record() {
        let original = record("7", 10, 2, "Seven");
        let mut fx = Fixture::with(vec![original.clone()]);
        let cid = CorrelationId::new();

        fx.ledger
            .submit_delete(&mut fx.store, cid, &"7".into(), at(100))
            .unwrap();
        assert!(fx.store.is_empty());

        fx.ledger.fail(
            &mut fx.store,
            &fx.gate,
            &cid,
            SyncError::TransientIo("down".into()),
            at(101),
        );
        assert_eq!(fx.store.get(&"7".into()), Some(&original));
    }

    #[test]
    fn test_failed_delete_stays_deleted_if_removed_remotely() {
        let mut fx = Fixture::with(vec![record("7", 10, 2, "Seven")]);
        let cid = CorrelationId::new();
        fx.ledger
            .submit_delete(&mut fx.store, cid, &"7".into(), at(100))
            .unwrap();

        fx.gate
            .apply(&mut fx.store, &ChangeEvent::delete("7", None));
        fx.ledger.fail(
            &mut fx.store,
            &fx.gate,
            &cid,
            SyncError::TransientIo("down".into()),
            at(101),
        );
        assert!(fx.store.is_empty());
    }

    #[test]
    fn test_update_missing_record_is_rejected_without_effect() {
        let mut fx = Fixture::with(vec![]);
        let result =
            fx.ledger
                .submit_update(&mut fx.store, CorrelationId::new(), &"nope".into(), title("x"), at(1));
        assert_eq!(result, Err(SyncError::RecordNotFound("nope".into())));
        assert_eq!(fx.ledger.pending_count(), 0);
    }

    #[test]
    fn test_second_write_to_same_id_waits_for_first() {
        let mut fx = Fixture::with(vec![record("1", 10, 1, "A")]);
        let first = CorrelationId::new();
        let second = CorrelationId::new();

        let step = fx
            .ledger
            .submit_update(&mut fx.store, first, &"1".into(), title("B"), at(100))
            .unwrap();
        assert_eq!(step.dispatch.len(), 1);

        let step = fx
            .ledger
            .submit_update(&mut fx.store, second, &"1".into(), title("C"), at(100))
            .unwrap();
        assert!(step.dispatch.is_empty());
        assert_eq!(fx.ledger.queued_count(), 1);
        // Second write is not visible yet
        assert_eq!(fx.store.get(&"1".into()).unwrap().title(), Some("B"));

        let step = fx.ledger.confirm(
            &mut fx.store,
            &mut fx.gate,
            &first,
            record("1", 10, 2, "B"),
            at(101),
        );
        assert_eq!(step.dispatch.len(), 1);
        assert_eq!(step.dispatch[0].correlation_id, second);
        assert_eq!(fx.store.get(&"1".into()).unwrap().title(), Some("C"));
        assert_eq!(fx.store.get(&"1".into()).unwrap().version, Version::new(2));
    }

    #[test]
    fn test_queued_write_on_placeholder_follows_server_id() {
        let mut fx = Fixture::with(vec![]);
        let create = CorrelationId::new();
        fx.ledger
            .submit_create(&mut fx.store, create, fields("X", "https://y.com"), at(100));
        let placeholder = fx.store.view()[0].id.clone();

        let edit = CorrelationId::new();
        let step = fx
            .ledger
            .submit_update(&mut fx.store, edit, &placeholder, title("Y"), at(100))
            .unwrap();
        assert!(step.dispatch.is_empty());

        let server = Record::new("99", fields("X", "https://y.com"), at(101), Version::new(1));
        let step = fx
            .ledger
            .confirm(&mut fx.store, &mut fx.gate, &create, server, at(102));

        assert_eq!(step.dispatch.len(), 1);
        assert_eq!(
            step.dispatch[0].request.target_id,
            Some(RecordId::new("99"))
        );
        assert_eq!(fx.ledger.resolve_alias(&placeholder), RecordId::new("99"));
        assert_eq!(fx.store.get(&"99".into()).unwrap().title(), Some("Y"));
    }

    #[test]
    fn test_queued_writes_fail_when_create_fails() {
        let mut fx = Fixture::with(vec![]);
        let create = CorrelationId::new();
        fx.ledger
            .submit_create(&mut fx.store, create, fields("X", "https://y.com"), at(100));
        let placeholder = fx.store.view()[0].id.clone();

        let delete = CorrelationId::new();
        fx.ledger
            .submit_delete(&mut fx.store, delete, &placeholder, at(100))
            .unwrap();

        let step = fx.ledger.fail(
            &mut fx.store,
            &fx.gate,
            &create,
            SyncError::Rejected("quota".into()),
            at(101),
        );
        assert_eq!(step.resolved.len(), 2);
        assert_eq!(step.resolved[1].correlation_id, delete);
        assert_eq!(
            step.resolved[1].result,
            Err(SyncError::Conflict(placeholder))
        );
        assert_eq!(fx.ledger.queued_count(), 0);
    }

    #[test]
    fn test_overlay_survives_snapshot_replace() {
        let mut fx = Fixture::with(vec![record("1", 10, 1, "A"), record("2", 20, 1, "B")]);
        fx.ledger
            .submit_update(&mut fx.store, CorrelationId::new(), &"1".into(), title("A*"), at(100))
            .unwrap();
        fx.ledger
            .submit_delete(&mut fx.store, CorrelationId::new(), &"2".into(), at(100))
            .unwrap();
        fx.ledger.submit_create(
            &mut fx.store,
            CorrelationId::new(),
            fields("New", "https://n.dev"),
            at(100),
        );

        // Refresh returns a newer version of record 1
        fx.store
            .snapshot_replace(vec![record("1", 10, 2, "A2"), record("2", 20, 1, "B")]);
        fx.ledger.reapply_overlay(&mut fx.store);

        assert_eq!(fx.store.get(&"1".into()).unwrap().title(), Some("A*"));
        assert_eq!(fx.store.get(&"1".into()).unwrap().version, Version::new(2));
        assert!(!fx.store.contains(&"2".into()));
        assert_eq!(fx.store.len(), 2);
    }

    #[test]
    fn test_confirm_after_clear_is_ignored() {
        let mut fx = Fixture::with(vec![]);
        let cid = CorrelationId::new();
        fx.ledger
            .submit_create(&mut fx.store, cid, fields("X", "https://y.com"), at(100));
        fx.ledger.clear();
        fx.store.clear();

        let step = fx.ledger.confirm(
            &mut fx.store,
            &mut fx.gate,
            &cid,
            record("99", 1, 1, "X"),
            at(101),
        );
        assert!(step.resolved.is_empty());
        assert!(fx.store.is_empty());
    }
}

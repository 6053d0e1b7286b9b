//! # In-Memory Remote Store
//!
//! An authoritative store that lives in the process. Assigns ids, versions
//! and timestamps, broadcasts change events per identity, and can inject the
//! faults a real backend produces.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         MemoryRemote                                    │
//! │                                                                         │
//! │  collections: user_id → { RecordId → Record }                          │
//! │  subscribers: user_id → [mpsc::Sender<ChangeEvent>]                    │
//! │                                                                         │
//! │  every commit:  version += 1, sequence += 1, broadcast before reply    │
//! │                                                                         │
//! │  FAULTS:                                                               │
//! │  fail_next_snapshots(n)      snapshot returns TransientIo n times      │
//! │  fail_next_mutations(n, e)   next n submits return e                   │
//! │  hold_snapshots()            snapshot data captured, reply held        │
//! │  hold_mutations()            submit held before commit                 │
//! │  disconnect_all()            every subscription ends                   │
//! │  emit(identity, event)       raw event, no state change                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use linkstash_core::{ChangeEvent, Identity, MutationKind, Record, RecordId, Version};

use crate::error::{SyncError, SyncResult};
use crate::remote::{ChangeSubscription, MutationRequest, RemoteStore};

/// Capacity of each subscriber channel.
const SUBSCRIBER_CHANNEL_SIZE: usize = 1024;

// =============================================================================
// State
// =============================================================================

#[derive(Default)]
struct RemoteState {
    collections: HashMap<String, HashMap<RecordId, Record>>,
    subscribers: HashMap<String, Vec<mpsc::Sender<ChangeEvent>>>,
    next_id: u64,
    sequence: u64,
    last_created: Option<DateTime<Utc>>,
    snapshot_failures: u32,
    subscribe_failures: u32,
    mutation_failures: VecDeque<SyncError>,
    snapshot_calls: u32,
    mutation_calls: u32,
}

impl RemoteState {
    /// Strictly increasing creation timestamps.
    fn next_created_at(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let created = match self.last_created {
            Some(last) if now <= last => last + Duration::milliseconds(1),
            _ => now,
        };
        self.last_created = Some(created);
        created
    }

    fn next_id(&mut self) -> RecordId {
        self.next_id += 1;
        RecordId::from(self.next_id)
    }

    fn broadcast(&mut self, user_id: &str, event: ChangeEvent) {
        self.sequence += 1;
        let event = event.with_sequence(self.sequence);

        if let Some(senders) = self.subscribers.get_mut(user_id) {
            senders.retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(user_id, "Subscriber channel full, dropping event");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
    }

    fn collection(&mut self, user_id: &str) -> &mut HashMap<RecordId, Record> {
        self.collections.entry(user_id.to_string()).or_default()
    }

    fn commit(&mut self, user_id: &str, request: &MutationRequest) -> SyncResult<Record> {
        match request.kind {
            MutationKind::Create => {
                let id = self.next_id();
                let created_at = self.next_created_at();
                let record = Record::new(id, request.fields.clone(), created_at, Version::new(1));
                self.collection(user_id)
                    .insert(record.id.clone(), record.clone());
                self.broadcast(user_id, ChangeEvent::insert(record.clone()));
                Ok(record)
            }
            MutationKind::Update => {
                let id = target(request)?;
                let collection = self.collection(user_id);
                let current = collection
                    .get(&id)
                    .ok_or_else(|| SyncError::RecordNotFound(id.clone()))?;
                let mut updated = current.with_fields(&request.fields);
                updated.version = current.version.next();
                collection.insert(id, updated.clone());
                self.broadcast(user_id, ChangeEvent::update(updated.clone()));
                Ok(updated)
            }
            MutationKind::Delete => {
                let id = target(request)?;
                let removed = self
                    .collection(user_id)
                    .remove(&id)
                    .ok_or_else(|| SyncError::RecordNotFound(id.clone()))?;
                self.broadcast(
                    user_id,
                    ChangeEvent::delete(id, Some(removed.version.next())),
                );
                Ok(removed)
            }
        }
    }
}

fn target(request: &MutationRequest) -> SyncResult<RecordId> {
    request
        .target_id
        .clone()
        .ok_or_else(|| SyncError::Rejected(format!("{} requires a record id", request.kind)))
}

// =============================================================================
// Memory Remote
// =============================================================================

/// In-process implementation of [`RemoteStore`].
pub struct MemoryRemote {
    state: Mutex<RemoteState>,
    hold_snapshots: watch::Sender<bool>,
    hold_mutations: watch::Sender<bool>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        MemoryRemote {
            state: Mutex::new(RemoteState::default()),
            hold_snapshots: watch::Sender::new(false),
            hold_mutations: watch::Sender::new(false),
        }
    }

    fn lock(&self) -> SyncResult<MutexGuard<'_, RemoteState>> {
        self.state
            .lock()
            .map_err(|_| SyncError::Internal("memory remote state poisoned".into()))
    }

    /// Stores records directly, without events.
    pub fn seed(&self, identity: &Identity, records: impl IntoIterator<Item = Record>) -> SyncResult<()> {
        let mut state = self.lock()?;
        for record in records {
            if let Ok(n) = record.id.as_str().parse::<u64>() {
                state.next_id = state.next_id.max(n);
            }
            state
                .collection(&identity.user_id)
                .insert(record.id.clone(), record);
        }
        Ok(())
    }

    /// Applies a write from another device and broadcasts it.
    pub fn commit(&self, identity: &Identity, request: MutationRequest) -> SyncResult<Record> {
        self.lock()?.commit(&identity.user_id, &request)
    }

    /// Sends a raw event to the identity's subscribers.
    pub fn emit(&self, identity: &Identity, event: ChangeEvent) -> SyncResult<()> {
        self.lock()?.broadcast(&identity.user_id, event);
        Ok(())
    }

    /// Authoritative records for the identity, newest first.
    pub fn records(&self, identity: &Identity) -> SyncResult<Vec<Record>> {
        let mut records: Vec<Record> = self
            .lock()?
            .collection(&identity.user_id)
            .values()
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    // =========================================================================
    // Fault Injection
    // =========================================================================

    pub fn fail_next_snapshots(&self, count: u32) -> SyncResult<()> {
        self.lock()?.snapshot_failures = count;
        Ok(())
    }

    pub fn fail_next_subscribes(&self, count: u32) -> SyncResult<()> {
        self.lock()?.subscribe_failures = count;
        Ok(())
    }

    pub fn fail_next_mutations(&self, count: u32, error: SyncError) -> SyncResult<()> {
        let mut state = self.lock()?;
        state.mutation_failures = (0..count).map(|_| error.clone()).collect();
        Ok(())
    }

    /// Snapshots read their data, then wait until released.
    pub fn hold_snapshots(&self) {
        self.hold_snapshots.send_replace(true);
    }

    pub fn release_snapshots(&self) {
        self.hold_snapshots.send_replace(false);
    }

    /// Mutations wait before committing until released.
    pub fn hold_mutations(&self) {
        self.hold_mutations.send_replace(true);
    }

    pub fn release_mutations(&self) {
        self.hold_mutations.send_replace(false);
    }

    /// Ends every open subscription.
    pub fn disconnect_all(&self) -> SyncResult<()> {
        self.lock()?.subscribers.clear();
        Ok(())
    }

    pub fn subscriber_count(&self, identity: &Identity) -> usize {
        self.lock()
            .map(|s| {
                s.subscribers
                    .get(&identity.user_id)
                    .map(|v| v.iter().filter(|tx| !tx.is_closed()).count())
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    pub fn snapshot_calls(&self) -> u32 {
        self.lock().map(|s| s.snapshot_calls).unwrap_or(0)
    }

    pub fn mutation_calls(&self) -> u32 {
        self.lock().map(|s| s.mutation_calls).unwrap_or(0)
    }
}

async fn wait_released(hold: &watch::Sender<bool>) {
    let mut rx = hold.subscribe();
    // Sender lives as long as self, so an error cannot occur here
    let _ = rx.wait_for(|held| !*held).await;
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn fetch_snapshot(&self, identity: &Identity) -> SyncResult<Vec<Record>> {
        let records = {
            let mut state = self.lock()?;
            state.snapshot_calls += 1;
            if state.snapshot_failures > 0 {
                state.snapshot_failures -= 1;
                return Err(SyncError::TransientIo("snapshot unavailable".into()));
            }
            state
                .collection(&identity.user_id)
                .values()
                .cloned()
                .collect::<Vec<_>>()
        };

        wait_released(&self.hold_snapshots).await;
        debug!(user_id = %identity.user_id, count = records.len(), "Served snapshot");
        Ok(records)
    }

    async fn subscribe_changes(&self, identity: &Identity) -> SyncResult<ChangeSubscription> {
        let mut state = self.lock()?;
        if state.subscribe_failures > 0 {
            state.subscribe_failures -= 1;
            return Err(SyncError::TransientIo("subscribe failed".into()));
        }

        let (tx, subscription) = ChangeSubscription::channel(SUBSCRIBER_CHANNEL_SIZE);
        state
            .subscribers
            .entry(identity.user_id.clone())
            .or_default()
            .push(tx);
        debug!(user_id = %identity.user_id, "Subscriber registered");
        Ok(subscription)
    }

    async fn submit_mutation(
        &self,
        identity: &Identity,
        request: MutationRequest,
    ) -> SyncResult<Record> {
        wait_released(&self.hold_mutations).await;

        let mut state = self.lock()?;
        state.mutation_calls += 1;
        if let Some(error) = state.mutation_failures.pop_front() {
            return Err(error);
        }
        state.commit(&identity.user_id, &request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkstash_core::{Fields, FIELD_TITLE};
    use serde_json::json;

    fn title(t: &str) -> Fields {
        let mut f = Fields::new();
        f.insert(FIELD_TITLE.into(), json!(t));
        f
    }

    #[tokio::test]
    async fn test_commit_assigns_ids_and_versions() {
        let remote = MemoryRemote::new();
        let me = Identity::new("u1");

        let created = remote.commit(&me, MutationRequest::create(title("A"))).unwrap();
        assert_eq!(created.id, RecordId::new("1"));
        assert_eq!(created.version, Version::new(1));

        let updated = remote
            .commit(&me, MutationRequest::update(created.id.clone(), title("B")))
            .unwrap();
        assert_eq!(updated.version, Version::new(2));
        assert_eq!(updated.created_at, created.created_at);
    }

    #[tokio::test]
    async fn test_subscribers_see_only_their_identity() {
        let remote = MemoryRemote::new();
        let me = Identity::new("u1");
        let other = Identity::new("u2");

        let mut mine = remote.subscribe_changes(&me).await.unwrap();
        let mut theirs = remote.subscribe_changes(&other).await.unwrap();

        remote.commit(&me, MutationRequest::create(title("A"))).unwrap();
        let event = mine.next().await.unwrap();
        assert_eq!(event.sequence(), Some(1));

        remote.disconnect_all().unwrap();
        assert!(theirs.next().await.is_none());
        assert!(mine.next().await.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_failures_then_success() {
        let remote = MemoryRemote::new();
        let me = Identity::new("u1");
        remote.fail_next_snapshots(1).unwrap();

        assert!(remote.fetch_snapshot(&me).await.unwrap_err().is_retryable());
        assert!(remote.fetch_snapshot(&me).await.unwrap().is_empty());
        assert_eq!(remote.snapshot_calls(), 2);
    }

    #[tokio::test]
    async fn test_update_missing_record() {
        let remote = MemoryRemote::new();
        let me = Identity::new("u1");
        let result = remote
            .submit_mutation(&me, MutationRequest::update("9".into(), title("x")))
            .await;
        assert_eq!(result, Err(SyncError::RecordNotFound("9".into())));
    }

    #[tokio::test]
    async fn test_seed_advances_id_counter() {
        let remote = MemoryRemote::new();
        let me = Identity::new("u1");
        remote
            .seed(&me, vec![Record::new("41", title("seed"), Utc::now(), Version::new(1))])
            .unwrap();

        let created = remote.commit(&me, MutationRequest::create(title("A"))).unwrap();
        assert_eq!(created.id, RecordId::new("42"));
        assert_eq!(remote.records(&me).unwrap().len(), 2);
    }
}

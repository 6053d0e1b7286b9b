//! # Remote Collaborators
//!
//! Capabilities the engine consumes from its environment. The engine never
//! talks to a network directly; an application plugs its data layer in
//! through these traits.
//!
//! ## Collaborator Contract
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      External Collaborators                             │
//! │                                                                         │
//! │  AuthProvider                                                          │
//! │  └── current_identity()          → Option<Identity>                    │
//! │                                                                         │
//! │  RemoteStore                                                           │
//! │  ├── fetch_snapshot(identity)    → Vec<Record>          (one-shot)     │
//! │  ├── subscribe_changes(identity) → ChangeSubscription   (long-lived)   │
//! │  │       may emit before fetch_snapshot resolves                       │
//! │  │       channel end = transport disconnect                            │
//! │  └── submit_mutation(identity, request) → Record        (one-shot)     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use tokio::sync::mpsc;

use linkstash_core::{ChangeEvent, Fields, Identity, MutationKind, Record, RecordId};

use crate::error::SyncResult;

// =============================================================================
// Mutation Request
// =============================================================================

/// Payload of one remote write.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationRequest {
    /// Kind of write.
    pub kind: MutationKind,

    /// Existing record id for Update/Delete. `None` for Create.
    pub target_id: Option<RecordId>,

    /// Validated fields for Create/Update. Empty for Delete.
    pub fields: Fields,
}

impl MutationRequest {
    pub fn create(fields: Fields) -> Self {
        MutationRequest {
            kind: MutationKind::Create,
            target_id: None,
            fields,
        }
    }

    pub fn update(id: RecordId, fields: Fields) -> Self {
        MutationRequest {
            kind: MutationKind::Update,
            target_id: Some(id),
            fields,
        }
    }

    pub fn delete(id: RecordId) -> Self {
        MutationRequest {
            kind: MutationKind::Delete,
            target_id: Some(id),
            fields: Fields::new(),
        }
    }
}

// =============================================================================
// Change Subscription
// =============================================================================

/// A live change-event stream.
///
/// Dropping the subscription, or calling [`ChangeSubscription::unsubscribe`],
/// releases it. The stream ending (`next` returning `None`) means the
/// transport disconnected.
#[derive(Debug)]
pub struct ChangeSubscription {
    events: mpsc::Receiver<ChangeEvent>,
}

impl ChangeSubscription {
    /// Wraps the receiving half of an event channel.
    pub fn new(events: mpsc::Receiver<ChangeEvent>) -> Self {
        ChangeSubscription { events }
    }

    /// Creates a subscription together with the sender that feeds it.
    pub fn channel(capacity: usize) -> (mpsc::Sender<ChangeEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, ChangeSubscription::new(rx))
    }

    /// Waits for the next event. `None` means disconnected.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    /// Releases the subscription. Senders observe the channel as closed.
    pub fn unsubscribe(mut self) {
        self.events.close();
    }
}

// =============================================================================
// Traits
// =============================================================================

/// Supplies the authenticated identity.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Returns the signed-in identity, or `None` when signed out.
    async fn current_identity(&self) -> SyncResult<Option<Identity>>;
}

/// Data access to the authoritative store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Full point-in-time read of the identity's collection.
    async fn fetch_snapshot(&self, identity: &Identity) -> SyncResult<Vec<Record>>;

    /// Opens the change stream scoped to the identity.
    async fn subscribe_changes(&self, identity: &Identity) -> SyncResult<ChangeSubscription>;

    /// Submits one write and returns the authoritative record.
    ///
    /// For deletes the returned record is the row that was removed.
    async fn submit_mutation(
        &self,
        identity: &Identity,
        request: MutationRequest,
    ) -> SyncResult<Record>;
}

/// Auth provider with a fixed answer.
#[derive(Debug, Clone, Default)]
pub struct StaticAuth {
    identity: Option<Identity>,
}

impl StaticAuth {
    pub fn signed_in(identity: Identity) -> Self {
        StaticAuth {
            identity: Some(identity),
        }
    }

    pub fn signed_out() -> Self {
        StaticAuth { identity: None }
    }
}

#[async_trait]
impl AuthProvider for StaticAuth {
    async fn current_identity(&self) -> SyncResult<Option<Identity>> {
        Ok(self.identity.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkstash_core::Version;

    #[tokio::test]
    async fn test_subscription_end_means_disconnect() {
        let (tx, mut sub) = ChangeSubscription::channel(4);
        tx.send(ChangeEvent::delete("1", Some(Version::new(1))))
            .await
            .unwrap();
        drop(tx);

        assert!(sub.next().await.is_some());
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_sender_side() {
        let (tx, sub) = ChangeSubscription::channel(4);
        sub.unsubscribe();
        assert!(tx.is_closed());
        assert!(tx.send(ChangeEvent::delete("1", None)).await.is_err());
    }

    #[tokio::test]
    async fn test_static_auth() {
        let auth = StaticAuth::signed_in(Identity::new("u1"));
        assert_eq!(
            auth.current_identity().await.unwrap(),
            Some(Identity::new("u1"))
        );
        assert_eq!(StaticAuth::signed_out().current_identity().await.unwrap(), None);
    }

    #[test]
    fn test_mutation_request_constructors() {
        let req = MutationRequest::delete("9".into());
        assert_eq!(req.kind, MutationKind::Delete);
        assert_eq!(req.target_id, Some(RecordId::new("9")));
        assert!(req.fields.is_empty());
    }
}

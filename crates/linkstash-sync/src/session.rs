//! # Sync Session
//!
//! Owns the local collection for one signed-in identity and keeps it
//! consistent with the remote store.
//!
//! ## Session Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncSession Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                    SyncSession (single task)                     │  │
//! │  │                                                                  │  │
//! │  │  owns: RecordStore, VersionGate, ChangeStreamBuffer,             │  │
//! │  │        MutationLedger                                            │  │
//! │  │                                                                  │  │
//! │  │  tokio::select! {                                                │  │
//! │  │      commands     ◄── SyncSessionHandle (submit, retry, sign_out)│  │
//! │  │      completions  ◄── spawned snapshot / mutation / subscribe    │  │
//! │  │      change events◄── ChangeSubscription                         │  │
//! │  │  }                                                               │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  watch<Arc<Vec<Record>>>  watch<SessionState>  SessionEventEmitter      │
//! │  (current view)           (lifecycle)          (outcomes, errors)       │
//! │                                                                         │
//! │  LOAD SEQUENCE:                                                        │
//! │  ──────────────                                                        │
//! │  1. subscribe + fetch_snapshot   side by side, each retried with       │
//! │                                  backoff; events start buffering       │
//! │  2. snapshot_replace + reapply pending overlay                         │
//! │  3. drain buffer through the version gate                              │
//! │  4. Live once the stream is also up. A stream that lands after the     │
//! │     snapshot was applied triggers one refresh snapshot first           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Network calls never touch the store. They post their result back to the
//! session task, which applies it. Results that arrive after close are
//! dropped with the channel.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use linkstash_core::validation::{prepare_update, validate_create_fields};
use linkstash_core::{
    ChangeEvent, CorrelationId, Fields, Identity, Record, RecordId, RecordStore, VersionGate,
};

use crate::buffer::ChangeStreamBuffer;
use crate::config::SessionSettings;
use crate::error::{SyncError, SyncResult};
use crate::events::{NoOpEmitter, SessionEventEmitter, SessionState, SuspendReason};
use crate::ledger::{LedgerStep, MutationLedger};
use crate::remote::{AuthProvider, ChangeSubscription, RemoteStore};

/// The published, ordered view.
pub type RecordView = Arc<Vec<Record>>;

// =============================================================================
// Commands and Completions
// =============================================================================

/// Requests from a [`SyncSessionHandle`].
enum Command {
    Create {
        correlation_id: CorrelationId,
        fields: Fields,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Update {
        correlation_id: CorrelationId,
        id: RecordId,
        changes: Fields,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Delete {
        correlation_id: CorrelationId,
        id: RecordId,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Retry {
        reply: oneshot::Sender<SyncResult<()>>,
    },
    SignOut {
        reply: oneshot::Sender<()>,
    },
}

/// Results posted back by spawned I/O tasks.
enum Completion {
    Subscribed {
        epoch: u64,
        result: SyncResult<ChangeSubscription>,
    },
    Snapshot {
        epoch: u64,
        result: SyncResult<Vec<Record>>,
    },
    Mutation {
        correlation_id: CorrelationId,
        result: SyncResult<Record>,
    },
}

// =============================================================================
// Sync Session
// =============================================================================

/// The session actor. Spawn [`SyncSession::run`] as a task.
pub struct SyncSession {
    settings: SessionSettings,
    auth: Arc<dyn AuthProvider>,
    remote: Arc<dyn RemoteStore>,
    emitter: Arc<dyn SessionEventEmitter>,

    commands: mpsc::Receiver<Command>,
    completions_tx: mpsc::Sender<Completion>,
    completions_rx: mpsc::Receiver<Completion>,
    view_tx: watch::Sender<RecordView>,
    state_tx: watch::Sender<SessionState>,

    state: SessionState,
    identity: Option<Identity>,
    store: RecordStore,
    gate: VersionGate,
    buffer: ChangeStreamBuffer,
    ledger: MutationLedger,
    subscription: Option<ChangeSubscription>,

    /// Bumped on every subscribe launch; stale completions are ignored.
    subscribe_epoch: u64,
    /// Bumped on every snapshot launch or cancel.
    snapshot_epoch: u64,
    /// First snapshot has been applied.
    loaded: bool,

    snapshot_task: Option<JoinHandle<()>>,
    subscribe_task: Option<JoinHandle<()>>,
    mutation_tasks: HashMap<CorrelationId, JoinHandle<()>>,
}

impl SyncSession {
    /// Creates a session and the handle that controls it.
    pub fn new(
        settings: SessionSettings,
        auth: Arc<dyn AuthProvider>,
        remote: Arc<dyn RemoteStore>,
        emitter: Arc<dyn SessionEventEmitter>,
    ) -> (Self, SyncSessionHandle) {
        let (commands_tx, commands) = mpsc::channel(settings.command_buffer.max(1));
        let (completions_tx, completions_rx) = mpsc::channel(settings.command_buffer.max(1));
        let (view_tx, view_rx) = watch::channel(RecordView::default());
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);

        let buffer = ChangeStreamBuffer::new(settings.buffer_capacity);

        let session = SyncSession {
            settings,
            auth,
            remote,
            emitter,
            commands,
            completions_tx,
            completions_rx,
            view_tx,
            state_tx,
            state: SessionState::Idle,
            identity: None,
            store: RecordStore::new(),
            gate: VersionGate::new(),
            buffer,
            ledger: MutationLedger::new(),
            subscription: None,
            subscribe_epoch: 0,
            snapshot_epoch: 0,
            loaded: false,
            snapshot_task: None,
            subscribe_task: None,
            mutation_tasks: HashMap::new(),
        };

        let handle = SyncSessionHandle {
            commands: commands_tx,
            view: view_rx,
            state: state_rx,
        };

        (session, handle)
    }

    /// Runs the session until it is closed.
    pub async fn run(mut self) {
        info!("Sync session starting");

        if self.authenticate().await {
            self.transition(SessionState::LoadingSnapshot);
            self.spawn_subscribe();
            self.spawn_snapshot();
        }

        while !self.state.is_closed() {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All session handles dropped");
                        self.close();
                    }
                },

                Some(completion) = self.completions_rx.recv() => {
                    self.handle_completion(completion);
                }

                event = next_event(&mut self.subscription), if self.subscription.is_some() => {
                    self.handle_stream(event);
                }
            }
        }

        info!("Sync session stopped");
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    async fn authenticate(&mut self) -> bool {
        self.transition(SessionState::Authenticating);

        let lookup = tokio::time::timeout(
            self.settings.request_timeout(),
            self.auth.current_identity(),
        )
        .await
        .unwrap_or_else(|_| Err(SyncError::Timeout(self.settings.request_timeout_ms)));

        match lookup {
            Ok(Some(identity)) => {
                info!(user_id = %identity.user_id, "Identity resolved");
                self.identity = Some(identity);
                true
            }
            Ok(None) => {
                self.fail_auth(SyncError::AuthRequired);
                false
            }
            Err(e) => {
                error!(error = %e, "Identity lookup failed");
                self.emitter.emit_error(&e.to_string(), e.is_retryable());
                self.close();
                false
            }
        }
    }

    fn fail_auth(&mut self, error: SyncError) {
        warn!(error = %error, "Sign-in required");
        self.emitter.emit_sign_in_required();
        self.close();
    }

    fn transition(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        info!(from = %self.state, state = %state, "Session state changed");
        self.state = state;
        self.state_tx.send_replace(state);
        self.emitter.emit_state(state);
    }

    fn publish_view(&self) {
        self.view_tx.send_replace(Arc::new(self.store.view()));
    }

    /// Terminal. Releases the subscription and aborts outstanding requests.
    fn close(&mut self) {
        if self.state.is_closed() {
            return;
        }

        self.cancel_snapshot();
        if let Some(task) = self.subscribe_task.take() {
            task.abort();
        }
        self.subscribe_epoch += 1;
        for (_, task) in self.mutation_tasks.drain() {
            task.abort();
        }
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }

        let abandoned = self.ledger.pending_count() + self.ledger.queued_count();
        if abandoned > 0 {
            info!(abandoned, "Discarding unconfirmed mutations");
        }

        self.ledger.clear();
        self.store.clear();
        self.gate.clear();
        self.buffer.clear();
        self.identity = None;
        self.loaded = false;

        self.publish_view();
        self.transition(SessionState::Closed);
    }

    // =========================================================================
    // I/O Tasks
    // =========================================================================

    fn spawn_subscribe(&mut self) {
        let Some(identity) = self.identity.clone() else {
            return;
        };
        self.subscribe_epoch += 1;
        let epoch = self.subscribe_epoch;
        let policy = self.settings.resubscribe_policy();
        let remote = self.remote.clone();
        let tx = self.completions_tx.clone();

        if let Some(task) = self.subscribe_task.take() {
            task.abort();
        }
        self.subscribe_task = Some(tokio::spawn(async move {
            let result = policy
                .run("subscribe_changes", |attempt| {
                    let remote = remote.clone();
                    let identity = identity.clone();
                    async move {
                        debug!(attempt, "Subscribing to changes");
                        remote.subscribe_changes(&identity).await
                    }
                })
                .await;
            let _ = tx.send(Completion::Subscribed { epoch, result }).await;
        }));
    }

    fn spawn_snapshot(&mut self) {
        let Some(identity) = self.identity.clone() else {
            return;
        };
        self.snapshot_epoch += 1;
        let epoch = self.snapshot_epoch;
        let policy = self.settings.snapshot_policy();
        let remote = self.remote.clone();
        let tx = self.completions_tx.clone();

        if let Some(task) = self.snapshot_task.take() {
            task.abort();
        }
        self.snapshot_task = Some(tokio::spawn(async move {
            let result = policy
                .run("fetch_snapshot", |attempt| {
                    let remote = remote.clone();
                    let identity = identity.clone();
                    async move {
                        debug!(attempt, "Fetching snapshot");
                        remote.fetch_snapshot(&identity).await
                    }
                })
                .await;
            let _ = tx.send(Completion::Snapshot { epoch, result }).await;
        }));
    }

    /// Aborts an in-flight snapshot and invalidates any result already posted.
    fn cancel_snapshot(&mut self) {
        if let Some(task) = self.snapshot_task.take() {
            task.abort();
        }
        self.snapshot_epoch += 1;
    }

    fn snapshot_in_flight(&self) -> bool {
        self.snapshot_task.is_some()
    }

    fn subscribe_in_flight(&self) -> bool {
        self.subscribe_task.is_some()
    }

    /// Starts the step's requests and reports its outcomes.
    fn spawn_mutations(&mut self, step: LedgerStep) {
        for resolution in &step.resolved {
            self.emitter
                .emit_mutation_outcome(resolution.correlation_id, &resolution.result);
        }

        let Some(identity) = self.identity.clone() else {
            return;
        };

        for dispatch in step.dispatch {
            let correlation_id = dispatch.correlation_id;
            let request = dispatch.request;
            let policy = self.settings.mutation_policy();
            let remote = self.remote.clone();
            let identity = identity.clone();
            let tx = self.completions_tx.clone();

            let task = tokio::spawn(async move {
                let result = policy
                    .run("submit_mutation", |attempt| {
                        let remote = remote.clone();
                        let identity = identity.clone();
                        let request = request.clone();
                        async move {
                            debug!(
                                attempt,
                                correlation_id = %correlation_id,
                                kind = %request.kind,
                                "Submitting mutation"
                            );
                            remote.submit_mutation(&identity, request).await
                        }
                    })
                    .await;
                let _ = tx
                    .send(Completion::Mutation {
                        correlation_id,
                        result,
                    })
                    .await;
            });
            self.mutation_tasks.insert(correlation_id, task);
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Create {
                correlation_id,
                fields,
                reply,
            } => {
                let result = self.ensure_writable().map(|()| {
                    let step =
                        self.ledger
                            .submit_create(&mut self.store, correlation_id, fields, Utc::now());
                    self.spawn_mutations(step);
                    self.publish_view();
                });
                let _ = reply.send(result);
            }

            Command::Update {
                correlation_id,
                id,
                changes,
                reply,
            } => {
                let result = self.ensure_writable().and_then(|()| {
                    let step = self.ledger.submit_update(
                        &mut self.store,
                        correlation_id,
                        &id,
                        changes,
                        Utc::now(),
                    )?;
                    self.spawn_mutations(step);
                    self.publish_view();
                    Ok(())
                });
                let _ = reply.send(result);
            }

            Command::Delete {
                correlation_id,
                id,
                reply,
            } => {
                let result = self.ensure_writable().and_then(|()| {
                    let step = self.ledger.submit_delete(
                        &mut self.store,
                        correlation_id,
                        &id,
                        Utc::now(),
                    )?;
                    self.spawn_mutations(step);
                    self.publish_view();
                    Ok(())
                });
                let _ = reply.send(result);
            }

            Command::Retry { reply } => {
                let _ = reply.send(self.retry());
            }

            Command::SignOut { reply } => {
                info!("Sign-out requested");
                self.close();
                let _ = reply.send(());
            }
        }
    }

    fn ensure_writable(&self) -> SyncResult<()> {
        if self.state.is_closed() {
            return Err(SyncError::SessionClosed);
        }
        if !self.loaded {
            return Err(SyncError::NotReady(format!(
                "initial snapshot not loaded ({})",
                self.state
            )));
        }
        Ok(())
    }

    fn retry(&mut self) -> SyncResult<()> {
        match self.state {
            SessionState::Closed => Err(SyncError::SessionClosed),
            SessionState::Suspended(SuspendReason::SnapshotUnavailable) => {
                info!("Retrying snapshot");
                self.transition(SessionState::LoadingSnapshot);
                if self.subscription.is_none() && !self.subscribe_in_flight() {
                    self.spawn_subscribe();
                }
                if self.buffer.is_ready() {
                    self.buffer.rearm();
                }
                self.spawn_snapshot();
                Ok(())
            }
            SessionState::Suspended(SuspendReason::StreamDisconnected)
                if !self.subscribe_in_flight() =>
            {
                info!("Retrying subscription");
                self.spawn_subscribe();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    // =========================================================================
    // Completions
    // =========================================================================

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Subscribed { epoch, result } => {
                if epoch != self.subscribe_epoch {
                    debug!(epoch, current = self.subscribe_epoch, "Dropping stale subscribe result");
                    return;
                }
                self.subscribe_task = None;
                self.on_subscribed(result);
            }
            Completion::Snapshot { epoch, result } => {
                if epoch != self.snapshot_epoch {
                    debug!(epoch, current = self.snapshot_epoch, "Dropping stale snapshot result");
                    return;
                }
                self.snapshot_task = None;
                self.on_snapshot(result);
            }
            Completion::Mutation {
                correlation_id,
                result,
            } => {
                self.mutation_tasks.remove(&correlation_id);
                self.on_mutation(correlation_id, result);
            }
        }
    }

    /// The snapshot and the subscription load side by side. Whichever lands
    /// second decides whether the session can go Live.
    fn on_subscribed(&mut self, result: SyncResult<ChangeSubscription>) {
        match result {
            Ok(subscription) => {
                info!("Change stream subscribed");
                self.subscription = Some(subscription);

                if self.snapshot_in_flight() {
                    // The pending snapshot's drain covers this stream
                    if self.buffer.is_ready() {
                        self.buffer.rearm();
                    }
                } else if self.state == SessionState::Suspended(SuspendReason::SnapshotUnavailable) {
                    if self.buffer.is_ready() {
                        self.buffer.rearm();
                    }
                    debug!("Buffering until the snapshot is retried");
                } else {
                    // Events between the last snapshot and now were missed
                    self.buffer.rearm();
                    self.transition(SessionState::LoadingSnapshot);
                    self.spawn_snapshot();
                }
            }
            Err(e) if e.requires_sign_in() => self.fail_auth(e),
            Err(e) => {
                error!(error = %e, "Subscribe failed");
                self.emitter.emit_error(&e.to_string(), e.is_retryable());
                if !self.snapshot_in_flight()
                    && self.state != SessionState::Suspended(SuspendReason::SnapshotUnavailable)
                {
                    self.transition(SessionState::Suspended(SuspendReason::StreamDisconnected));
                }
            }
        }
    }

    fn on_snapshot(&mut self, result: SyncResult<Vec<Record>>) {
        match result {
            Ok(records) => {
                info!(count = records.len(), "Snapshot loaded");
                self.store.snapshot_replace(records);
                self.ledger.reapply_overlay(&mut self.store);

                let dropped = self.buffer.dropped();
                let buffered = self.buffer.drain_in_order();
                debug!(count = buffered.len(), "Replaying buffered events");
                for event in buffered {
                    self.apply_event(&event);
                }

                self.loaded = true;
                self.publish_view();

                if self.subscription.is_none() {
                    if self.subscribe_in_flight() {
                        debug!("Snapshot applied, waiting for the change stream");
                    } else {
                        self.transition(SessionState::Suspended(SuspendReason::StreamDisconnected));
                    }
                } else if dropped > 0 {
                    warn!(dropped, "Change buffer overflowed, refreshing snapshot");
                    self.buffer.rearm();
                    self.spawn_snapshot();
                } else {
                    self.transition(SessionState::Live);
                }
            }
            Err(e) if e.requires_sign_in() => self.fail_auth(e),
            Err(e) => {
                error!(error = %e, "Snapshot retries exhausted");
                self.emitter.emit_error(&e.to_string(), e.is_retryable());
                self.transition(SessionState::Suspended(SuspendReason::SnapshotUnavailable));
            }
        }
    }

    fn on_mutation(&mut self, correlation_id: CorrelationId, result: SyncResult<Record>) {
        let now = Utc::now();
        let sign_in = matches!(&result, Err(e) if e.requires_sign_in());

        let step = match result {
            Ok(record) => self.ledger.confirm(
                &mut self.store,
                &mut self.gate,
                &correlation_id,
                record,
                now,
            ),
            Err(e) => self
                .ledger
                .fail(&mut self.store, &self.gate, &correlation_id, e, now),
        };

        self.spawn_mutations(step);
        self.publish_view();

        if sign_in {
            self.fail_auth(SyncError::AuthRequired);
        }
    }

    // =========================================================================
    // Change Stream
    // =========================================================================

    fn handle_stream(&mut self, event: Option<ChangeEvent>) {
        match event {
            Some(event) => {
                if let Some(event) = self.buffer.offer(event) {
                    if self.apply_event(&event) {
                        self.publish_view();
                    }
                }
            }
            None => self.on_disconnect(),
        }
    }

    /// Applies one authoritative event. Returns true if the store changed.
    fn apply_event(&mut self, event: &ChangeEvent) -> bool {
        let outcome = self.gate.apply(&mut self.store, event);
        debug!(
            record_id = %event.record_id(),
            kind = %event.kind(),
            sequence = ?event.sequence(),
            ?outcome,
            "Applied change event"
        );

        if outcome.changed() {
            self.ledger.overlay_record(&mut self.store, event.record_id());
        }
        outcome.changed()
    }

    fn on_disconnect(&mut self) {
        warn!(state = %self.state, "Change stream disconnected");
        self.subscription = None;
        self.cancel_snapshot();

        self.emitter
            .emit_error(&SyncError::Disconnected.to_string(), true);
        self.transition(SessionState::Suspended(SuspendReason::StreamDisconnected));
        self.spawn_subscribe();
    }
}

async fn next_event(subscription: &mut Option<ChangeSubscription>) -> Option<ChangeEvent> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}

// =============================================================================
// Session Handle (for external control)
// =============================================================================

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct SyncSessionHandle {
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<RecordView>,
    state: watch::Receiver<SessionState>,
}

impl SyncSessionHandle {
    /// The ordered view, newest first.
    pub fn current_view(&self) -> RecordView {
        self.view.borrow().clone()
    }

    /// Receiver notified on every view change.
    pub fn watch_view(&self) -> watch::Receiver<RecordView> {
        self.view.clone()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Receiver notified on every state transition.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Adds a record. Fails at once if `fields` do not validate.
    pub async fn submit_create(&self, fields: Fields) -> SyncResult<CorrelationId> {
        let fields = validate_create_fields(&fields)?;
        let correlation_id = CorrelationId::new();
        self.request(|reply| Command::Create {
            correlation_id,
            fields,
            reply,
        })
        .await?;
        Ok(correlation_id)
    }

    /// Edits a record's fields.
    pub async fn submit_update(
        &self,
        id: impl Into<RecordId>,
        changes: Fields,
    ) -> SyncResult<CorrelationId> {
        let changes = prepare_update(&changes)?;
        let correlation_id = CorrelationId::new();
        let id = id.into();
        self.request(|reply| Command::Update {
            correlation_id,
            id,
            changes,
            reply,
        })
        .await?;
        Ok(correlation_id)
    }

    /// Deletes a record.
    pub async fn submit_delete(&self, id: impl Into<RecordId>) -> SyncResult<CorrelationId> {
        let correlation_id = CorrelationId::new();
        let id = id.into();
        self.request(|reply| Command::Delete {
            correlation_id,
            id,
            reply,
        })
        .await?;
        Ok(correlation_id)
    }

    /// Restarts a suspended load.
    pub async fn retry(&self) -> SyncResult<()> {
        self.request(|reply| Command::Retry { reply }).await
    }

    /// Closes the session. Already closed is not an error.
    pub async fn sign_out(&self) -> SyncResult<()> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::SignOut { reply }).await.is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    async fn request<F>(&self, build: F) -> SyncResult<()>
    where
        F: FnOnce(oneshot::Sender<SyncResult<()>>) -> Command,
    {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| SyncError::SessionClosed)?;
        rx.await.map_err(|_| SyncError::SessionClosed)?
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for creating a SyncSession with options.
pub struct SyncSessionBuilder {
    settings: SessionSettings,
    auth: Option<Arc<dyn AuthProvider>>,
    remote: Option<Arc<dyn RemoteStore>>,
    emitter: Option<Arc<dyn SessionEventEmitter>>,
}

impl SyncSessionBuilder {
    pub fn new(settings: SessionSettings) -> Self {
        SyncSessionBuilder {
            settings,
            auth: None,
            remote: None,
            emitter: None,
        }
    }

    pub fn with_auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn SessionEventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Builds the session without starting it.
    pub fn build(self) -> SyncResult<(SyncSession, SyncSessionHandle)> {
        let auth = self
            .auth
            .ok_or_else(|| SyncError::InvalidConfig("Auth provider required".into()))?;
        let remote = self
            .remote
            .ok_or_else(|| SyncError::InvalidConfig("Remote store required".into()))?;
        let emitter = self.emitter.unwrap_or_else(|| Arc::new(NoOpEmitter));

        Ok(SyncSession::new(self.settings, auth, remote, emitter))
    }

    /// Builds the session and spawns it on the current runtime.
    pub fn spawn(self) -> SyncResult<SyncSessionHandle> {
        let (session, handle) = self.build()?;
        tokio::spawn(session.run());
        Ok(handle)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingEmitter;
    use crate::memory::MemoryRemote;
    use crate::remote::{MutationRequest, StaticAuth};
    use chrono::TimeZone;
    use linkstash_core::{Version, FIELD_TITLE, FIELD_URL};
    use serde_json::json;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn fast_settings() -> SessionSettings {
        SessionSettings {
            snapshot_max_attempts: 2,
            mutation_max_attempts: 1,
            resubscribe_max_attempts: 0,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            request_timeout_ms: 2_000,
            ..SessionSettings::default()
        }
    }

    fn me() -> Identity {
        Identity::new("user-1")
    }

    fn at(secs: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn bookmark(title: &str, url: &str) -> Fields {
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
        Record::new(
            id,
            bookmark(t, "https://example.com/"),
            at(created),
            Version::new(version),
        )
    }

    struct Harness {
        emitter: Arc<RecordingEmitter>,
        handle: SyncSessionHandle,
    }

    fn launch(remote: Arc<MemoryRemote>, auth: StaticAuth, settings: SessionSettings) -> Harness {
        let emitter = Arc::new(RecordingEmitter::new());
        let handle = SyncSessionBuilder::new(settings)
            .with_auth(Arc::new(auth))
            .with_remote(remote)
            .with_emitter(emitter.clone())
            .spawn()
            .unwrap();
        Harness { emitter, handle }
    }

    fn start_with(remote: Arc<MemoryRemote>, auth: StaticAuth) -> Harness {
        launch(remote, auth, fast_settings())
    }

    fn start(remote: Arc<MemoryRemote>) -> Harness {
        start_with(remote, StaticAuth::signed_in(me()))
    }

    async fn wait_state(handle: &SyncSessionHandle, wanted: SessionState) {
        let mut rx = handle.watch_state();
        tokio::time::timeout(WAIT, rx.wait_for(|s| *s == wanted))
            .await
            .expect("timed out waiting for state")
            .expect("session dropped");
    }

    async fn wait_view<F>(handle: &SyncSessionHandle, predicate: F) -> RecordView
    where
        F: Fn(&[Record]) -> bool,
    {
        let mut rx = handle.watch_view();
        let view = tokio::time::timeout(WAIT, rx.wait_for(|v| predicate(v)))
            .await
            .expect("timed out waiting for view")
            .expect("session dropped");
        view.clone()
    }

    async fn wait_outcome(
        emitter: &RecordingEmitter,
        correlation_id: CorrelationId,
    ) -> Result<Record, SyncError> {
        tokio::time::timeout(WAIT, async {
            loop {
                if let Some(outcome) = emitter.outcomes_for(correlation_id).pop() {
                    return outcome;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for outcome")
    }

    fn ids(view: &[Record]) -> Vec<String> {
        view.iter().map(|r| r.id.to_string()).collect()
    }

    #[tokio::test]
    async fn test_initial_load_orders_newest_first() {
        let remote = Arc::new(MemoryRemote::new());
        remote
            .seed(
                &me(),
                vec![record("1", 100, 1, "A"), record("2", 200, 1, "B")],
            )
            .unwrap();

        let h = start(remote);
        wait_state(&h.handle, SessionState::Live).await;

        assert_eq!(ids(&h.handle.current_view()), vec!["2", "1"]);
        assert_eq!(
            h.emitter.states(),
            vec![
                SessionState::Authenticating,
                SessionState::LoadingSnapshot,
                SessionState::Live
            ]
        );
    }

    #[tokio::test]
    async fn test_event_during_snapshot_is_not_lost() {
        let remote = Arc::new(MemoryRemote::new());
        remote.seed(&me(), vec![record("1", 100, 1, "A")]).unwrap();
        remote.hold_snapshots();

        let h = start(remote.clone());
        wait_state(&h.handle, SessionState::LoadingSnapshot).await;
        wait_until(|| remote.snapshot_calls() == 1 && remote.subscriber_count(&me()) == 1).await;

        // Committed after the snapshot read, so only the stream carries it
        let created = remote
            .commit(&me(), MutationRequest::create(bookmark("C", "https://c.dev/")))
            .unwrap();
        remote.release_snapshots();

        wait_state(&h.handle, SessionState::Live).await;
        let view = h.handle.current_view();
        assert_eq!(view.len(), 2);
        assert_eq!(view[0].id, created.id);
    }

    #[tokio::test]
    async fn test_scenario_delete_during_snapshot() {
        // Snapshot holds 1 and 2; Delete(2) arrives before the snapshot resolves
        let remote = Arc::new(MemoryRemote::new());
        remote
            .seed(
                &me(),
                vec![record("1", 100, 1, "A"), record("2", 200, 1, "B")],
            )
            .unwrap();
        remote.hold_snapshots();

        let h = start(remote.clone());
        wait_until(|| remote.snapshot_calls() == 1 && remote.subscriber_count(&me()) == 1).await;
        remote
            .commit(&me(), MutationRequest::delete("2".into()))
            .unwrap();
        remote.release_snapshots();

        wait_state(&h.handle, SessionState::Live).await;
        assert_eq!(ids(&h.handle.current_view()), vec!["1"]);
    }

    #[tokio::test]
    async fn test_scenario_stale_update_ignored() {
        let remote = Arc::new(MemoryRemote::new());
        remote.seed(&me(), vec![record("5", 100, 3, "v3")]).unwrap();

        let h = start(remote.clone());
        wait_state(&h.handle, SessionState::Live).await;

        remote
            .emit(&me(), ChangeEvent::update(record("5", 100, 2, "v2")))
            .unwrap();
        remote
            .emit(&me(), ChangeEvent::update(record("5", 100, 4, "v4")))
            .unwrap();

        let view = wait_view(&h.handle, |v| v.first().and_then(|r| r.title()) == Some("v4")).await;
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].version, Version::new(4));
    }

    #[tokio::test]
    async fn test_duplicate_events_are_idempotent() {
        let remote = Arc::new(MemoryRemote::new());
        let h = start(remote.clone());
        wait_state(&h.handle, SessionState::Live).await;

        let event = ChangeEvent::insert(record("9", 100, 1, "dup"));
        remote.emit(&me(), event.clone()).unwrap();
        remote.emit(&me(), event).unwrap();
        remote
            .emit(&me(), ChangeEvent::insert(record("10", 50, 1, "marker")))
            .unwrap();

        let view = wait_view(&h.handle, |v| v.len() == 2).await;
        assert_eq!(ids(&view), vec!["9", "10"]);
    }

    #[tokio::test]
    async fn test_scenario_optimistic_create_replaced_by_server_record() {
        let remote = Arc::new(MemoryRemote::new());
        remote.seed(&me(), vec![record("98", 100, 1, "old")]).unwrap();
        remote.hold_mutations();

        let h = start(remote.clone());
        wait_state(&h.handle, SessionState::Live).await;

        let cid = h
            .handle
            .submit_create(bookmark("X", "https://y.com"))
            .await
            .unwrap();

        let view = h.handle.current_view();
        assert_eq!(view.len(), 2);
        assert!(view[0].id.is_placeholder());
        assert_eq!(view[0].title(), Some("X"));

        remote.release_mutations();
        let outcome = wait_outcome(&h.emitter, cid).await.unwrap();
        assert_eq!(outcome.id, RecordId::new("99"));

        let view = wait_view(&h.handle, |v| v.iter().all(|r| !r.id.is_placeholder())).await;
        // The Insert event and the response describe the same write
        tokio::time::sleep(Duration::from_millis(50)).await;
        let view_after = h.handle.current_view();
        assert_eq!(view.len(), 2);
        assert_eq!(ids(&view_after), vec!["99", "98"]);
        assert_eq!(h.emitter.outcomes_for(cid).len(), 1);
    }

    #[tokio::test]
    async fn test_scenario_failed_update_rolls_back() {
        let remote = Arc::new(MemoryRemote::new());
        let original = record("7", 100, 2, "Before");
        remote.seed(&me(), vec![original.clone()]).unwrap();

        let h = start(remote.clone());
        wait_state(&h.handle, SessionState::Live).await;

        remote.hold_mutations();
        remote
            .fail_next_mutations(1, SyncError::Rejected("denied".into()))
            .unwrap();

        let cid = h
            .handle
            .submit_update("7", title("After"))
            .await
            .unwrap();
        assert_eq!(h.handle.current_view()[0].title(), Some("After"));

        remote.release_mutations();
        let outcome = wait_outcome(&h.emitter, cid).await;
        assert_eq!(outcome, Err(SyncError::Rejected("denied".into())));

        let view = wait_view(&h.handle, |v| v.first().and_then(|r| r.title()) == Some("Before")).await;
        assert_eq!(view[0], original);
    }

    #[tokio::test]
    async fn test_failed_delete_reappears() {
        let remote = Arc::new(MemoryRemote::new());
        remote.seed(&me(), vec![record("3", 100, 1, "keep")]).unwrap();

        let h = start(remote.clone());
        wait_state(&h.handle, SessionState::Live).await;

        remote
            .fail_next_mutations(1, SyncError::TransientIo("offline".into()))
            .unwrap();
        let cid = h.handle.submit_delete("3").await.unwrap();

        assert_eq!(
            wait_outcome(&h.emitter, cid).await,
            Err(SyncError::TransientIo("offline".into()))
        );
        let view = wait_view(&h.handle, |v| v.len() == 1).await;
        assert_eq!(view[0].id, RecordId::new("3"));
    }

    #[tokio::test]
    async fn test_validation_failure_is_immediate_and_never_applied() {
        let remote = Arc::new(MemoryRemote::new());
        let h = start(remote.clone());
        wait_state(&h.handle, SessionState::Live).await;

        let result = h.handle.submit_create(bookmark("no url", "")).await;
        assert!(matches!(result, Err(SyncError::Validation(_))));
        assert!(h.handle.current_view().is_empty());
        assert_eq!(remote.mutation_calls(), 0);
    }

    #[tokio::test]
    async fn test_update_unknown_record_fails_fast() {
        let remote = Arc::new(MemoryRemote::new());
        let h = start(remote);
        wait_state(&h.handle, SessionState::Live).await;

        let result = h.handle.submit_update("404", title("x")).await;
        assert_eq!(result, Err(SyncError::RecordNotFound("404".into())));
    }

    #[tokio::test]
    async fn test_mutation_before_snapshot_is_not_ready() {
        let remote = Arc::new(MemoryRemote::new());
        remote.hold_snapshots();
        let h = start(remote.clone());
        wait_state(&h.handle, SessionState::LoadingSnapshot).await;

        let result = h.handle.submit_create(bookmark("X", "https://y.com")).await;
        assert!(matches!(result, Err(SyncError::NotReady(_))));
        remote.release_snapshots();
    }

    #[tokio::test]
    async fn test_snapshot_exhaustion_suspends_and_retry_recovers() {
        let remote = Arc::new(MemoryRemote::new());
        remote.seed(&me(), vec![record("1", 100, 1, "A")]).unwrap();
        remote.fail_next_snapshots(2).unwrap();

        let h = start(remote.clone());
        wait_state(
            &h.handle,
            SessionState::Suspended(SuspendReason::SnapshotUnavailable),
        )
        .await;
        assert!(h.handle.current_view().is_empty());

        // Buffered while suspended
        remote
            .commit(&me(), MutationRequest::create(bookmark("B", "https://b.dev/")))
            .unwrap();

        h.handle.retry().await.unwrap();
        wait_state(&h.handle, SessionState::Live).await;
        assert_eq!(h.handle.current_view().len(), 2);
        assert!(h
            .emitter
            .events()
            .iter()
            .any(|e| matches!(e, crate::events::SessionEvent::Error { retryable: true, .. })));
    }

    #[tokio::test]
    async fn test_disconnect_resubscribes_and_refreshes() {
        let remote = Arc::new(MemoryRemote::new());
        remote.seed(&me(), vec![record("1", 100, 1, "A")]).unwrap();

        let h = start(remote.clone());
        wait_state(&h.handle, SessionState::Live).await;
        assert_eq!(remote.snapshot_calls(), 1);

        remote.disconnect_all().unwrap();
        let suspended = SessionState::Suspended(SuspendReason::StreamDisconnected);
        wait_until(|| h.emitter.states().contains(&suspended)).await;

        // Either the new stream or the refresh snapshot carries it
        remote
            .commit(&me(), MutationRequest::create(bookmark("B", "https://b.dev/")))
            .unwrap();

        wait_view(&h.handle, |v| v.len() == 2).await;
        wait_until(|| remote.snapshot_calls() >= 2).await;
        wait_state(&h.handle, SessionState::Live).await;
    }

    #[tokio::test]
    async fn test_snapshot_loads_while_subscribe_fails() {
        let remote = Arc::new(MemoryRemote::new());
        remote.seed(&me(), vec![record("1", 100, 1, "A")]).unwrap();
        remote.fail_next_subscribes(2).unwrap();

        let settings = SessionSettings {
            resubscribe_max_attempts: 2,
            ..fast_settings()
        };
        let h = launch(remote.clone(), StaticAuth::signed_in(me()), settings);

        let suspended = SessionState::Suspended(SuspendReason::StreamDisconnected);
        wait_state(&h.handle, suspended).await;
        assert_eq!(ids(&h.handle.current_view()), vec!["1"]);
        assert_eq!(remote.snapshot_calls(), 1);
        assert_eq!(remote.subscriber_count(&me()), 0);

        // Loaded, so writes are accepted while the stream is down
        h.handle.submit_update("1", title("A2")).await.unwrap();

        h.handle.retry().await.unwrap();
        wait_state(&h.handle, SessionState::Live).await;
        assert_eq!(remote.subscriber_count(&me()), 1);
        // The late stream forces a refresh to cover the gap
        assert_eq!(remote.snapshot_calls(), 2);
        let view = wait_view(&h.handle, |v| v.first().and_then(|r| r.title()) == Some("A2")).await;
        assert_eq!(view.len(), 1);
    }

    #[tokio::test]
    async fn test_buffer_overflow_refreshes_snapshot() {
        let remote = Arc::new(MemoryRemote::new());
        remote.seed(&me(), vec![record("1", 100, 1, "A")]).unwrap();
        remote.hold_snapshots();

        let settings = SessionSettings {
            buffer_capacity: 2,
            ..fast_settings()
        };
        let h = launch(remote.clone(), StaticAuth::signed_in(me()), settings);
        wait_until(|| remote.snapshot_calls() == 1 && remote.subscriber_count(&me()) == 1).await;

        for n in 0..4 {
            let url = format!("https://site{n}.dev/");
            remote
                .commit(&me(), MutationRequest::create(bookmark("N", &url)))
                .unwrap();
        }
        // Let the session pull every event into the buffer
        tokio::time::sleep(Duration::from_millis(50)).await;
        remote.release_snapshots();

        wait_state(&h.handle, SessionState::Live).await;
        assert_eq!(remote.snapshot_calls(), 2);
        assert_eq!(h.handle.current_view().len(), 5);
    }

    #[tokio::test]
    async fn test_event_in_snapshot_and_stream_appears_once() {
        let remote = Arc::new(MemoryRemote::new());
        remote.seed(&me(), vec![record("1", 100, 1, "A")]).unwrap();
        remote.fail_next_snapshots(2).unwrap();

        let h = start(remote.clone());
        wait_state(
            &h.handle,
            SessionState::Suspended(SuspendReason::SnapshotUnavailable),
        )
        .await;
        wait_until(|| remote.subscriber_count(&me()) == 1).await;

        // Streamed into the buffer now, and read by the next snapshot
        let created = remote
            .commit(&me(), MutationRequest::create(bookmark("C", "https://c.dev/")))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        h.handle.retry().await.unwrap();
        wait_state(&h.handle, SessionState::Live).await;

        let view = h.handle.current_view();
        assert_eq!(ids(&view), vec![created.id.to_string(), "1".to_string()]);
        assert_eq!(view[0], created);
    }

    #[tokio::test]
    async fn test_signed_out_requires_sign_in() {
        let remote = Arc::new(MemoryRemote::new());
        let h = start_with(remote.clone(), StaticAuth::signed_out());

        wait_state(&h.handle, SessionState::Closed).await;
        assert_eq!(h.emitter.sign_in_requests(), 1);
        assert_eq!(remote.snapshot_calls(), 0);

        let result = h.handle.submit_delete("1").await;
        assert_eq!(result, Err(SyncError::SessionClosed));
    }

    #[tokio::test]
    async fn test_sign_out_drops_late_results() {
        let remote = Arc::new(MemoryRemote::new());
        remote.seed(&me(), vec![record("1", 100, 1, "A")]).unwrap();

        let h = start(remote.clone());
        wait_state(&h.handle, SessionState::Live).await;

        remote.hold_mutations();
        let cid = h.handle.submit_update("1", title("B")).await.unwrap();
        h.handle.sign_out().await.unwrap();
        remote.release_mutations();

        assert_eq!(h.handle.state(), SessionState::Closed);
        assert!(h.handle.current_view().is_empty());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.emitter.outcomes_for(cid).is_empty());
        assert_eq!(remote.subscriber_count(&me()), 0);

        // Signing out twice is fine
        h.handle.sign_out().await.unwrap();
    }

    #[tokio::test]
    async fn test_builder_requires_remote() {
        let result = SyncSessionBuilder::new(SessionSettings::default())
            .with_auth(Arc::new(StaticAuth::signed_in(me())))
            .build();
        assert!(matches!(result, Err(SyncError::InvalidConfig(_))));
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(WAIT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("timed out waiting for condition");
    }
}

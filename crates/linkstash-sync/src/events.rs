//! # Session Events
//!
//! Lifecycle states and the notification contract toward the UI layer.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Session State Machine                            │
//! │                                                                         │
//! │  Idle ──► Authenticating ──► LoadingSnapshot ──► Live                  │
//! │                 │                  │   ▲           │                    │
//! │        no identity           retries │ │ retry()   │ stream ends        │
//! │                 │          exhausted ▼ │           ▼                    │
//! │                 │        Suspended(snapshot-   Suspended(stream-        │
//! │                 │          unavailable)          disconnected)          │
//! │                 ▼                                  │ resubscribed       │
//! │              Closed ◄──── sign_out() from any      └──► LoadingSnapshot │
//! │                                                                         │
//! │  EVENTS (to the dashboard):                                            │
//! │  "session://state"    - every transition                               │
//! │  "session://outcome"  - once per mutation, terminal                    │
//! │  "session://error"    - { message, retryable }                         │
//! │  "session://sign-in"  - no identity available                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use ts_rs::TS;

use linkstash_core::{CorrelationId, Record};

use crate::error::SyncError;

// =============================================================================
// Session State
// =============================================================================

/// Why a session stopped making progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "kebab-case")]
#[ts(export)]
pub enum SuspendReason {
    /// Snapshot retries were exhausted.
    SnapshotUnavailable,

    /// The change stream ended and is being re-established.
    StreamDisconnected,
}

impl fmt::Display for SuspendReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuspendReason::SnapshotUnavailable => write!(f, "snapshot-unavailable"),
            SuspendReason::StreamDisconnected => write!(f, "stream-disconnected"),
        }
    }
}

/// Lifecycle state of a sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
#[ts(export)]
pub enum SessionState {
    #[default]
    Idle,
    Authenticating,
    LoadingSnapshot,
    Live,
    Suspended(SuspendReason),
    Closed,
}

impl SessionState {
    /// Returns true once the session can no longer make progress.
    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Authenticating => write!(f, "authenticating"),
            SessionState::LoadingSnapshot => write!(f, "loading_snapshot"),
            SessionState::Live => write!(f, "live"),
            SessionState::Suspended(reason) => write!(f, "suspended({})", reason),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

// =============================================================================
// Event Emitter Trait
// =============================================================================

/// Receives session notifications (implemented by the UI integration).
///
/// Called from the session task. Implementations must not block.
pub trait SessionEventEmitter: Send + Sync {
    /// Emits a lifecycle transition.
    fn emit_state(&self, state: SessionState);

    /// Emits the terminal outcome of one mutation. Called once per id.
    fn emit_mutation_outcome(&self, correlation_id: CorrelationId, outcome: &Result<Record, SyncError>);

    /// Emits a session-level error.
    fn emit_error(&self, message: &str, retryable: bool);

    /// Emits a request to authenticate.
    fn emit_sign_in_required(&self);
}

/// No-op event emitter.
pub struct NoOpEmitter;

impl SessionEventEmitter for NoOpEmitter {
    fn emit_state(&self, _state: SessionState) {}
    fn emit_mutation_outcome(&self, _correlation_id: CorrelationId, _outcome: &Result<Record, SyncError>) {}
    fn emit_error(&self, _message: &str, _retryable: bool) {}
    fn emit_sign_in_required(&self) {}
}

// =============================================================================
// Recording Emitter
// =============================================================================

/// One captured notification.
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    State(SessionState),
    Outcome(CorrelationId, Result<Record, SyncError>),
    Error { message: String, retryable: bool },
    SignInRequired,
}

/// Emitter that keeps every notification in memory.
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Default)]
pub struct RecordingEmitter {
    events: std::sync::Mutex<Vec<SessionEvent>>,
}

#[cfg(any(test, feature = "test-util"))]
impl RecordingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything emitted so far, in order.
    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn states(&self) -> Vec<SessionState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::State(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    /// Outcomes reported for `correlation_id`.
    pub fn outcomes_for(&self, correlation_id: CorrelationId) -> Vec<Result<Record, SyncError>> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Outcome(id, outcome) if id == correlation_id => Some(outcome),
                _ => None,
            })
            .collect()
    }

    pub fn sign_in_requests(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, SessionEvent::SignInRequired))
            .count()
    }

    fn push(&self, event: SessionEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
impl SessionEventEmitter for RecordingEmitter {
    fn emit_state(&self, state: SessionState) {
        self.push(SessionEvent::State(state));
    }

    fn emit_mutation_outcome(&self, correlation_id: CorrelationId, outcome: &Result<Record, SyncError>) {
        self.push(SessionEvent::Outcome(correlation_id, outcome.clone()));
    }

    fn emit_error(&self, message: &str, retryable: bool) {
        self.push(SessionEvent::Error {
            message: message.to_string(),
            retryable,
        });
    }

    fn emit_sign_in_required(&self) {
        self.push(SessionEvent::SignInRequired);
    }
}

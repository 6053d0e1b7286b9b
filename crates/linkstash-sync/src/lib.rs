//! # linkstash-sync: Synchronized Collection Engine for linkstash
//!
//! This crate keeps a local, ordered copy of a user's bookmark collection
//! consistent with an authoritative remote store, and applies the user's own
//! writes optimistically.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Session Architecture                        │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                  SyncSession (single-owner actor)                │  │
//! │  │                                                                  │  │
//! │  │  Spawned as a Tokio task per signed-in identity                 │  │
//! │  │  Serializes every writer to the RecordStore                     │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ ChangeStream   │  │ VersionGate    │  │  MutationLedger        │    │
//! │  │ Buffer         │  │ (core)         │  │                        │    │
//! │  │                │  │                │  │ Optimistic writes,     │    │
//! │  │ Holds events   │  │ Drops stale &  │  │ rollback, per-id       │    │
//! │  │ until snapshot │  │ duplicate      │  │ queueing               │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ RemoteStore /  │  │ RetryPolicy    │  │  MemoryRemote          │    │
//! │  │ AuthProvider   │  │ (backoff)      │  │  (in-process store)    │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  STATUS EVENTS (to the dashboard via SessionEventEmitter):             │
//! │  • state transitions                                                   │
//! │  • one terminal outcome per mutation                                   │
//! │  • errors and sign-in requests                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`session`] - `SyncSession` actor, handle and builder
//! - [`events`] - Session states and the emitter contract
//! - [`buffer`] - Change-event buffer in front of the apply path
//! - [`ledger`] - Optimistic mutation ledger
//! - [`remote`] - Collaborator traits (auth, remote store)
//! - [`memory`] - In-memory remote store with fault injection
//! - [`retry`] - Bounded exponential backoff
//! - [`config`] - Engine configuration (TOML + env)
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use linkstash_sync::{EngineConfig, MemoryRemote, StaticAuth, SyncSessionBuilder};
//!
//! let config = EngineConfig::load_or_default(None);
//! let handle = SyncSessionBuilder::new(config.session)
//!     .with_auth(Arc::new(StaticAuth::signed_in(identity)))
//!     .with_remote(Arc::new(MemoryRemote::new()))
//!     .spawn()?;
//!
//! let id = handle.submit_create(fields).await?;
//! println!("{} records", handle.current_view().len());
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod buffer;
pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod memory;
pub mod remote;
pub mod retry;
pub mod session;

// =============================================================================
// Re-exports
// =============================================================================

pub use buffer::ChangeStreamBuffer;
pub use config::{EngineConfig, SessionSettings};
pub use error::{SyncError, SyncResult};
pub use events::{NoOpEmitter, SessionEventEmitter, SessionState, SuspendReason};
#[cfg(any(test, feature = "test-util"))]
pub use events::{RecordingEmitter, SessionEvent};
pub use ledger::{Dispatch, LedgerStep, MutationLedger, PendingMutation, Resolution};
pub use memory::MemoryRemote;
pub use remote::{AuthProvider, ChangeSubscription, MutationRequest, RemoteStore, StaticAuth};
pub use retry::RetryPolicy;
pub use session::{RecordView, SyncSession, SyncSessionBuilder, SyncSessionHandle};

//! # linkstash-core: Pure Collection Logic for linkstash
//!
//! This crate holds the synchronized bookmark collection as pure data
//! structures with zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        linkstash Architecture                           │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    Dashboard (TypeScript)                       │   │
//! │  │        Bookmark list ──► Add form ──► Edit card ──► Delete     │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ view + outcomes                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               linkstash-sync (SyncSession actor)                │   │
//! │  │    snapshot, change stream, optimistic mutations                │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │             ★ linkstash-core (THIS CRATE) ★                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │   store   │  │   apply   │  │ validation│  │   │
//! │  │   │  Record   │  │  ordered  │  │  version  │  │  url,     │  │   │
//! │  │   │  Event    │  │  by id    │  │  gate     │  │  title    │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO ASYNC • NO NETWORK • PURE FUNCTIONS              │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (Record, ChangeEvent, Identity, etc.)
//! - [`store`] - Ordered, deduplicated RecordStore
//! - [`apply`] - Version-checked apply path (VersionGate)
//! - [`error`] - Domain error types
//! - [`validation`] - Mutation payload validation
//!
//! ## Example Usage
//!
//! ```rust
//! use chrono::Utc;
//! use linkstash_core::{ChangeEvent, Record, RecordStore, Version, VersionGate};
//! use linkstash_core::validation::prepare_create;
//!
//! let mut store = RecordStore::new();
//! let mut gate = VersionGate::new();
//!
//! let fields = prepare_create(Some("Docs"), "docs.rs").unwrap();
//! let event = ChangeEvent::insert(Record::new("1", fields, Utc::now(), Version::new(1)));
//!
//! gate.apply(&mut store, &event);
//! gate.apply(&mut store, &event); // duplicate delivery is a no-op
//! assert_eq!(store.len(), 1);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod apply;
pub mod error;
pub mod store;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use apply::{ApplyOutcome, VersionGate};
pub use error::{CoreError, CoreResult, ValidationError};
pub use store::RecordStore;
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Maximum title length accepted from the dashboard.
pub const MAX_TITLE_LEN: usize = 500;

/// Maximum URL length accepted from the dashboard.
pub const MAX_URL_LEN: usize = 2048;

//! # Domain Types
//!
//! Core domain types used throughout linkstash.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │     Record      │   │   ChangeEvent   │   │  MutationKind   │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id (RecordId)  │   │  Insert(record) │   │  Create         │       │
//! │  │  fields (JSON)  │   │  Update(record) │   │  Update         │       │
//! │  │  created_at     │   │  Delete(id)     │   │  Delete         │       │
//! │  │  version        │   │  sequence hint  │   └─────────────────┘       │
//! │  └─────────────────┘   └─────────────────┘                              │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    RecordId     │   │     Version     │   │    Identity     │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  server id  or  │   │  u64, monotonic │   │  user_id        │       │
//! │  │  local-<uuid>   │   │  per record     │   │  email          │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Immutability
//! A [`Record`] is never edited in place. Every change produces a new
//! `Record` that replaces the old one under the same id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use ts_rs::TS;
use uuid::Uuid;

/// Field holding the human-readable title of a bookmark.
pub const FIELD_TITLE: &str = "title";

/// Field holding the bookmark URL.
pub const FIELD_URL: &str = "url";

/// Prefix of locally generated placeholder ids.
pub const PLACEHOLDER_PREFIX: &str = "local-";

/// Field name → value mapping carried by a record.
pub type Fields = BTreeMap<String, Value>;

// =============================================================================
// Record Id
// =============================================================================

/// Identity of a record.
///
/// Real ids are assigned by the remote store and are opaque. Records created
/// locally carry a placeholder id until the server confirms them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[serde(transparent)]
#[ts(export)]
pub struct RecordId(String);

impl RecordId {
    /// Wraps a server-assigned id.
    pub fn new(id: impl Into<String>) -> Self {
        RecordId(id.into())
    }

    /// Generates a fresh placeholder id for an unconfirmed create.
    pub fn placeholder() -> Self {
        RecordId(format!("{}{}", PLACEHOLDER_PREFIX, Uuid::new_v4()))
    }

    /// Returns true if this id was generated locally.
    pub fn is_placeholder(&self) -> bool {
        self.0.starts_with(PLACEHOLDER_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        RecordId::new(id)
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        RecordId(id)
    }
}

impl From<u64> for RecordId {
    fn from(id: u64) -> Self {
        RecordId(id.to_string())
    }
}

// =============================================================================
// Version
// =============================================================================

/// Per-record monotonic marker used to discard stale events.
///
/// Optimistic records carry the version of the record they were derived
/// from (or [`Version::ZERO`] for creates) so any authoritative write wins.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize, TS,
)]
#[serde(transparent)]
#[ts(export)]
pub struct Version(u64);

impl Version {
    /// Version of records that have never been confirmed.
    pub const ZERO: Version = Version(0);

    #[inline]
    pub const fn new(value: u64) -> Self {
        Version(value)
    }

    #[inline]
    pub const fn get(&self) -> u64 {
        self.0
    }

    /// Returns the next version. Saturates at `u64::MAX`.
    #[inline]
    pub const fn next(&self) -> Self {
        Version(self.0.saturating_add(1))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

// =============================================================================
// Record
// =============================================================================

/// A single synchronized item (one bookmark).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Record {
    /// Unique identifier assigned by the remote store.
    pub id: RecordId,

    /// Schema-defined payload (title, url, ...).
    #[ts(type = "Record<string, unknown>")]
    pub fields: Fields,

    /// Ordering key. The view is sorted newest first.
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,

    /// Conflict-resolution marker.
    pub version: Version,
}

impl Record {
    /// Creates a record.
    pub fn new(
        id: impl Into<RecordId>,
        fields: Fields,
        created_at: DateTime<Utc>,
        version: Version,
    ) -> Self {
        Record {
            id: id.into(),
            fields,
            created_at,
            version,
        }
    }

    /// Returns a field value if present.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Returns a string field, if present and a string.
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(Value::as_str)
    }

    /// Bookmark title.
    pub fn title(&self) -> Option<&str> {
        self.str_field(FIELD_TITLE)
    }

    /// Bookmark URL.
    pub fn url(&self) -> Option<&str> {
        self.str_field(FIELD_URL)
    }

    /// Returns a new record with `changes` merged over the current fields.
    ///
    /// Identity, ordering key and version are preserved.
    pub fn with_fields(&self, changes: &Fields) -> Record {
        let mut fields = self.fields.clone();
        for (name, value) in changes {
            fields.insert(name.clone(), value.clone());
        }

        Record {
            id: self.id.clone(),
            fields,
            created_at: self.created_at,
            version: self.version,
        }
    }
}

// =============================================================================
// Change Event
// =============================================================================

/// Kind of remote change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Insert => write!(f, "insert"),
            ChangeKind::Update => write!(f, "update"),
            ChangeKind::Delete => write!(f, "delete"),
        }
    }
}

/// A remote-originated notification of a create/update/delete.
///
/// `sequence` is the transport's ordering hint, when it provides one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    Insert {
        record: Record,
        #[serde(default)]
        sequence: Option<u64>,
    },
    Update {
        record: Record,
        #[serde(default)]
        sequence: Option<u64>,
    },
    Delete {
        record_id: RecordId,
        /// Version of the deleted row, if the transport reports it.
        #[serde(default)]
        version: Option<Version>,
        #[serde(default)]
        sequence: Option<u64>,
    },
}

impl ChangeEvent {
    pub fn insert(record: Record) -> Self {
        ChangeEvent::Insert {
            record,
            sequence: None,
        }
    }

    pub fn update(record: Record) -> Self {
        ChangeEvent::Update {
            record,
            sequence: None,
        }
    }

    pub fn delete(record_id: impl Into<RecordId>, version: Option<Version>) -> Self {
        ChangeEvent::Delete {
            record_id: record_id.into(),
            version,
            sequence: None,
        }
    }

    /// Attaches a transport sequence hint.
    pub fn with_sequence(mut self, seq: u64) -> Self {
        match &mut self {
            ChangeEvent::Insert { sequence, .. }
            | ChangeEvent::Update { sequence, .. }
            | ChangeEvent::Delete { sequence, .. } => *sequence = Some(seq),
        }
        self
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeEvent::Insert { .. } => ChangeKind::Insert,
            ChangeEvent::Update { .. } => ChangeKind::Update,
            ChangeEvent::Delete { .. } => ChangeKind::Delete,
        }
    }

    pub fn record_id(&self) -> &RecordId {
        match self {
            ChangeEvent::Insert { record, .. } | ChangeEvent::Update { record, .. } => &record.id,
            ChangeEvent::Delete { record_id, .. } => record_id,
        }
    }

    /// Version carried by the event, if any.
    pub fn version(&self) -> Option<Version> {
        match self {
            ChangeEvent::Insert { record, .. } | ChangeEvent::Update { record, .. } => {
                Some(record.version)
            }
            ChangeEvent::Delete { version, .. } => *version,
        }
    }

    pub fn sequence(&self) -> Option<u64> {
        match self {
            ChangeEvent::Insert { sequence, .. }
            | ChangeEvent::Update { sequence, .. }
            | ChangeEvent::Delete { sequence, .. } => *sequence,
        }
    }

    /// Payload for Insert/Update.
    pub fn record(&self) -> Option<&Record> {
        match self {
            ChangeEvent::Insert { record, .. } | ChangeEvent::Update { record, .. } => Some(record),
            ChangeEvent::Delete { .. } => None,
        }
    }
}

// =============================================================================
// Mutations
// =============================================================================

/// Kind of locally issued write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationKind::Create => write!(f, "create"),
            MutationKind::Update => write!(f, "update"),
            MutationKind::Delete => write!(f, "delete"),
        }
    }
}

/// Lifecycle of a pending mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum MutationStatus {
    /// Applied optimistically, awaiting the server.
    #[default]
    Pending,
    /// Server accepted the write.
    Confirmed,
    /// Server rejected the write or retries ran out.
    Failed,
}

impl MutationStatus {
    /// Returns true for Confirmed and Failed.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, MutationStatus::Pending)
    }
}

/// Client-generated id linking a submitted mutation to its outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        CorrelationId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Identity
// =============================================================================

/// The authenticated principal a session is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Identity {
    /// Stable user id from the auth provider.
    pub user_id: String,

    /// Account email, when the provider exposes it.
    #[serde(default)]
    pub email: Option<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Identity {
            user_id: user_id.into(),
            email: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

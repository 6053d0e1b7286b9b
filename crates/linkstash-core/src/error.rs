//! # Error Types
//!
//! Domain-specific error types for linkstash-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  linkstash-core errors (this file)                                     │
//! │  ├── CoreError        - General domain errors                          │
//! │  └── ValidationError  - Mutation payload failures                      │
//! │                                                                         │
//! │  linkstash-sync errors (separate crate)                                │
//! │  └── SyncError        - Session, remote and config failures            │
//! │                                                                         │
//! │  Flow: ValidationError → SyncError::Validation → mutation outcome      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Principles
//! 1. Use `thiserror` for derive macros (not manual impl)
//! 2. Include context in error messages (field, id, etc.)
//! 3. Errors are enum variants, never String
//! 4. Errors are `Clone` so one failure can be both logged and delivered

use thiserror::Error;

use crate::types::RecordId;

// =============================================================================
// Core Error
// =============================================================================

/// Core collection errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Record is not in the store.
    ///
    /// ## When This Occurs
    /// - Editing or deleting an id the view no longer holds
    /// - A concurrent remote delete won the race
    #[error("Record not found: {0}")]
    RecordNotFound(RecordId),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Mutation payload validation errors.
///
/// These are raised before any optimistic apply, so an invalid payload never
/// reaches the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Invalid format (e.g., unparsable URL).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Field is not part of the record schema.
    #[error("unknown field: {field}")]
    UnknownField { field: String },

    /// An update carried no field changes.
    #[error("update contains no changes")]
    NoChanges,
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

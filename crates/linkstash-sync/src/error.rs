//! # Sync Error Types
//!
//! Error types for session, remote and configuration failures.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Session        │  │   Remote I/O    │  │     Mutation            │ │
//! │  │                 │  │   (retried)     │  │     (not retried)       │ │
//! │  │  AuthRequired   │  │  TransientIo    │  │  Validation             │ │
//! │  │  NotReady       │  │  Timeout        │  │  Conflict               │ │
//! │  │  SessionClosed  │  │  Disconnected   │  │  RecordNotFound         │ │
//! │  │                 │  │                 │  │  Rejected               │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐                              │
//! │  │  Configuration  │  │    Internal     │                              │
//! │  │                 │  │                 │                              │
//! │  │  InvalidConfig  │  │  Internal       │                              │
//! │  │  ConfigLoad/Save│  │                 │                              │
//! │  └─────────────────┘  └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use linkstash_core::{CoreError, RecordId, ValidationError};

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible engine failures.
///
/// ## Design Principles
/// - Each variant includes enough context for debugging
/// - Errors are categorized for different handling strategies
/// - `Clone` so an outcome can be emitted and logged at once
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    // =========================================================================
    // Session Errors
    // =========================================================================
    /// No valid identity. Fatal to the session, never retried.
    #[error("Authentication required")]
    AuthRequired,

    /// The session has not loaded its first snapshot yet.
    #[error("Session is not ready: {0}")]
    NotReady(String),

    /// The session was closed.
    #[error("Session is closed")]
    SessionClosed,

    // =========================================================================
    // Remote I/O Errors
    // =========================================================================
    /// Network or server failure. Retried with backoff.
    #[error("Transient I/O failure: {0}")]
    TransientIo(String),

    /// Request did not finish in time.
    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    /// Change subscription ended unexpectedly.
    #[error("Change stream disconnected")]
    Disconnected,

    // =========================================================================
    // Mutation Errors
    // =========================================================================
    /// Malformed mutation payload. Never applied optimistically.
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The mutation's target no longer exists.
    #[error("Conflict: record {0} no longer exists")]
    Conflict(RecordId),

    /// Target id is not in the collection.
    #[error("Record not found: {0}")]
    RecordNotFound(RecordId),

    /// Server refused the write permanently.
    #[error("Rejected by remote store: {0}")]
    Rejected(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid engine configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal engine error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::RecordNotFound(id) => SyncError::RecordNotFound(id),
            CoreError::Validation(v) => SyncError::Validation(v),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Rejected(format!("malformed payload: {err}"))
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the operation can be retried.
    ///
    /// ## Retryable Errors
    /// - Transient network/server failures
    /// - Timeouts
    /// - Stream disconnections
    ///
    /// ## Non-Retryable Errors
    /// - Authentication, validation, conflicts, rejections
    /// - Configuration errors
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::TransientIo(_) | SyncError::Timeout(_) | SyncError::Disconnected
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Returns true if the caller should be redirected to sign-in.
    pub fn requires_sign_in(&self) -> bool {
        matches!(self, SyncError::AuthRequired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::TransientIo("reset by peer".into()).is_retryable());
        assert!(SyncError::Timeout(5000).is_retryable());
        assert!(SyncError::Disconnected.is_retryable());

        assert!(!SyncError::AuthRequired.is_retryable());
        assert!(!SyncError::Conflict("1".into()).is_retryable());
        assert!(!SyncError::Rejected("duplicate".into()).is_retryable());
        assert!(!SyncError::Validation(ValidationError::NoChanges).is_retryable());
    }

    #[test]
    fn test_core_error_conversion() {
        let err: SyncError = CoreError::RecordNotFound("7".into()).into();
        assert_eq!(err, SyncError::RecordNotFound("7".into()));

        let err: SyncError = CoreError::Validation(ValidationError::NoChanges).into();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            SyncError::Conflict("abc-123".into()).to_string(),
            "Conflict: record abc-123 no longer exists"
        );
        assert!(SyncError::InvalidConfig("x".into()).is_config_error());
        assert!(SyncError::AuthRequired.requires_sign_in());
    }
}

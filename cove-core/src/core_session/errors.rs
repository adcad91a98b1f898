//! Error types for session orchestration

use thiserror::Error;

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors that can occur in session orchestration
#[derive(Debug, Error)]
pub enum SessionError {
    /// Malformed welcome/commit/proposal bytes. Rejected with no state change.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation referenced a nonexistent group
    #[error("Unknown group: {0}")]
    UnknownGroup(String),

    /// Operation referenced a nonexistent or already-terminal staged welcome
    #[error("Unknown staging: {0}")]
    UnknownStaging(String),

    /// Stale commit/proposal. Never retried automatically; surfaced so the
    /// caller can decide on fork recovery.
    #[error("Epoch mismatch: expected {expected}, got {actual}")]
    EpochMismatch { expected: u64, actual: u64 },

    /// A second local commit was attempted before the first was merged
    /// or discarded
    #[error("Pending commit conflict: {0}")]
    PendingCommitConflict(String),

    /// Crypto engine failure. Engine errors are never silently swallowed.
    #[error("Engine error: {0}")]
    Engine(String),

    /// Persistence I/O failure. Callers retry with backoff; in-memory
    /// state remains authoritative until persisted.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Service is shutting down
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Network-bound step exceeded its budget
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Internal error (bug)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<crate::storage::StorageError> for SessionError {
    fn from(e: crate::storage::StorageError) -> Self {
        SessionError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        SessionError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for SessionError {
    fn from(e: bincode::Error) -> Self {
        SessionError::Serialization(e.to_string())
    }
}

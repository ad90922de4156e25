//! Error types for Commlink

use thiserror::Error;

/// Main error type for Commlink operations
#[derive(Error, Debug)]
pub enum CommError {
    /// Malformed input (e.g. a credential missing required fields).
    /// Never retried; surfaced immediately to the caller.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Operation referenced an unknown pending contact, channel, or person
    #[error("Not found: {0}")]
    NotFound(String),

    /// Concurrent creation raced with this process.
    /// Recovered locally by the join-or-retry loop; only surfaced when
    /// retries exhaust.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A bounded per-item operation exceeded its budget
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Peer notification failed. Non-fatal for acceptance/rejection flows;
    /// the local state change is already committed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The underlying object store is unreachable. Fatal; propagated
    /// without retry.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CommError {
    /// Whether the error represents a duplicate of already-applied state.
    ///
    /// Grants are cumulative, so re-issuing an existing grant surfaces as
    /// a conflict from the store and is harmless.
    pub fn is_conflict(&self) -> bool {
        matches!(self, CommError::Conflict(_))
    }
}

/// Result type alias using CommError
pub type CommResult<T> = Result<T, CommError>;

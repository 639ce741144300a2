//! # Error Handling
//!
//! Error types for the postbox storage engine and the account
//! synchronization layer.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                     │
//! │  │                                                                      │
//! │  ├── Lifecycle Errors                                                  │
//! │  │   ├── ShutdownInProgress    - Manager actor has stopped             │
//! │  │   └── OperationCancelled    - Queued work dropped by a reset        │
//! │  │                                                                      │
//! │  ├── Storage Errors                                                    │
//! │  │   ├── DatabaseError         - SQLite engine failure                 │
//! │  │   └── StorageWriteError     - Failed to write a table entry         │
//! │  │                                                                      │
//! │  ├── Transaction Errors                                                │
//! │  │   ├── TransactionAborted    - Body failed or panicked               │
//! │  │   └── InvariantViolation    - Caller broke a table contract         │
//! │  │                                                                      │
//! │  ├── Sync Errors                                                       │
//! │  │   └── NetworkError          - Collaborator request failed           │
//! │  │                                                                      │
//! │  └── Internal Errors                                                   │
//! │      ├── Internal              - Should not happen                     │
//! │      └── SerializationError    - bincode failure                       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A "hole" (possibly stale unread counters) is deliberately absent from
//! this enum. Holes are ordinary return values of the read-state table and
//! travel up to the synchronization layer inside transaction summaries.

use thiserror::Error;

/// Result type alias for postbox operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the postbox core
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Lifecycle Errors (100-199)
    // ========================================================================

    /// The account state manager has stopped
    #[error("Account state manager is shutting down.")]
    ShutdownInProgress,

    /// A queued operation was dropped before it ran
    #[error("Operation cancelled: {0}")]
    OperationCancelled(String),

    // ========================================================================
    // Storage Errors (400-499)
    // ========================================================================

    /// Failed to write to storage
    #[error("Failed to write to storage: {0}")]
    StorageWriteError(String),

    /// Database error
    #[error("Database error: {0}")]
    DatabaseError(String),

    // ========================================================================
    // Transaction Errors (450-499)
    // ========================================================================

    /// The transaction body requested a rollback
    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    /// A table was used in a way its contract forbids
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    // ========================================================================
    // Sync Errors (500-599)
    // ========================================================================

    /// A network collaborator request failed
    #[error("Network request failed: {0}")]
    NetworkError(String),

    // ========================================================================
    // Internal Errors (900-999)
    // ========================================================================

    /// Internal error (should not happen in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl Error {
    /// Numeric error code
    ///
    /// - 100-199: Lifecycle
    /// - 400-499: Storage and transactions
    /// - 500-599: Synchronization
    /// - 900-999: Internal
    pub fn code(&self) -> i32 {
        match self {
            Error::ShutdownInProgress => 102,
            Error::OperationCancelled(_) => 103,

            Error::StorageWriteError(_) => 402,
            Error::DatabaseError(_) => 405,
            Error::TransactionAborted(_) => 450,
            Error::InvariantViolation(_) => 451,

            Error::NetworkError(_) => 501,

            Error::Internal(_) => 900,
            Error::SerializationError(_) => 902,
        }
    }

    /// Check if this error is recoverable
    ///
    /// Recoverable errors go away by retrying the request or by falling
    /// back to a full difference poll.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::NetworkError(_))
    }
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::DatabaseError(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::ShutdownInProgress.code(), 102);
        assert_eq!(Error::DatabaseError("test".into()).code(), 405);
        assert_eq!(Error::TransactionAborted("test".into()).code(), 450);
        assert_eq!(Error::NetworkError("test".into()).code(), 501);
        assert_eq!(Error::Internal("test".into()).code(), 900);
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(Error::NetworkError("test".into()).is_recoverable());
        assert!(!Error::InvariantViolation("test".into()).is_recoverable());
        assert!(!Error::OperationCancelled("test".into()).is_recoverable());
    }

    #[test]
    fn test_sqlite_error_conversion() {
        let err: Error = rusqlite::Error::QueryReturnedNoRows.into();
        assert_eq!(err.code(), 405);
        assert!(err.to_string().starts_with("Database error"));
    }
}

//! Error types for CircleSync

use thiserror::Error;

/// Main error type for CircleSync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Hash absent locally or remotely. Non-fatal, retry later.
    #[error("Not found: {0}")]
    NotFound(String),

    /// No candidate key produced a plaintext that passed validation
    #[error("Decryption failed after {attempts} candidate(s): {context}")]
    DecryptionFailure {
        /// What was being decrypted (manifest, action, post, ...)
        context: String,
        /// Number of candidate keys tried
        attempts: usize,
    },

    /// A resolve/store/publish/get exceeded its deadline
    #[error("Network timeout: {0}")]
    NetworkTimeout(String),

    /// Manifest or root at or below the accepted watermark
    #[error("Stale version {received} (watermark {watermark})")]
    VersionStale {
        /// Version that was offered
        received: u64,
        /// Last accepted version for that publisher
        watermark: u64,
    },

    /// Signature mismatch or malformed record
    #[error("Validation failed: {0}")]
    ValidationFailure(String),

    /// Entity (circle, post, peer) not present in local storage
    #[error("Unknown {kind}: {id}")]
    UnknownEntity {
        /// Entity kind
        kind: &'static str,
        /// Entity identifier
        id: String,
    },

    /// A publish cycle for this identity is already running
    #[error("Publish already in progress")]
    PublishInProgress,

    /// The operation was cancelled between pipeline steps
    #[error("Cancelled")]
    Cancelled,

    /// Error during storage operations (redb)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cryptographic operation failed (encryption, key material)
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Network-related error other than a timeout
    #[error("Network error: {0}")]
    Network(String),

    /// Invalid configuration value
    #[error("Config error: {0}")]
    Config(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl SyncError {
    /// Whether the failure is transient and the same work should be retried
    /// on a later cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::NotFound(_) | SyncError::NetworkTimeout(_) | SyncError::Network(_)
        )
    }

    pub(crate) fn serialization(e: impl std::fmt::Display) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::VersionStale {
            received: 3,
            watermark: 5,
        };
        assert_eq!(format!("{}", err), "Stale version 3 (watermark 5)");

        let err = SyncError::DecryptionFailure {
            context: "user manifest".to_string(),
            attempts: 2,
        };
        assert!(err.to_string().contains("2 candidate(s)"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let sync_err: SyncError = io_err.into();
        assert!(matches!(sync_err, SyncError::Io(_)));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(SyncError::NotFound("x".into()).is_retryable());
        assert!(SyncError::NetworkTimeout("x".into()).is_retryable());
        assert!(!SyncError::ValidationFailure("x".into()).is_retryable());
        assert!(!SyncError::DecryptionFailure {
            context: "x".into(),
            attempts: 1
        }
        .is_retryable());
    }
}

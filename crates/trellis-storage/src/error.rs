//! Error types for the storage drivers

use thiserror::Error;
use trellis_node::NodeError;

/// Result type alias for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur in the storage drivers
///
/// Only `Busy`, `LockTimeout`, and `UniqueViolation` are retried inside the
/// driver; everything else propagates.
#[derive(Error, Debug)]
pub enum StorageError {
    // === Database ===
    /// Unclassified database failure
    #[error("Database error: {0}")]
    Db(String),

    /// The back-end reported busy (embedded write contention)
    #[error("Database busy")]
    Busy,

    /// Lock wait exceeded the back-end's lock timeout
    #[error("Database lock timeout")]
    LockTimeout,

    /// A UNIQUE constraint was violated
    #[error("Unique constraint violation")]
    UniqueViolation,

    /// Bounded retries exhausted on a retryable failure
    #[error("Temporary database failure, retries exhausted")]
    Temporary,

    /// The per-call deadline elapsed; the transaction was rolled back
    #[error("Operation timed out")]
    Timeout,

    // === Blob ===
    /// The finalization hash or length did not match the stored fragments;
    /// the intermediate fragments have been purged
    #[error("Blob hash mismatch, fragments purged")]
    BlobHashMismatch,

    /// A fragment exceeds the fragment size
    #[error("Blob fragment length {0} exceeds fragment size")]
    FragmentTooLarge(usize),

    // === Access ===
    /// The permission matrix denied the read
    #[error("Permission denied")]
    PermissionDenied,

    // === Domain ===
    /// Node decode or validation failure
    #[error("Node error: {0}")]
    Node(#[from] NodeError),
}

impl StorageError {
    /// Whether the driver may retry after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::Busy | StorageError::LockTimeout | StorageError::UniqueViolation
        )
    }
}

impl From<sqlx::Error> for StorageError {
    /// Classify back-end failures into the retryable taxonomy
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            let message = db.message().to_string();
            // sqlite: SQLITE_BUSY (5) and SQLITE_BUSY_SNAPSHOT (517)
            if code == "5" || code == "517" || message.contains("database is locked") {
                return StorageError::Busy;
            }
            // postgres: lock_not_available
            if code == "55P03" {
                return StorageError::LockTimeout;
            }
            // postgres: serialization_failure / deadlock_detected
            if code == "40001" || code == "40P01" {
                return StorageError::Busy;
            }
            // sqlite: SQLITE_CONSTRAINT_UNIQUE / SQLITE_CONSTRAINT_PRIMARYKEY
            // postgres: unique_violation
            if code == "2067"
                || code == "1555"
                || code == "23505"
                || message.contains("UNIQUE constraint failed")
            {
                return StorageError::UniqueViolation;
            }
        }
        StorageError::Db(err.to_string())
    }
}

//! Error types for the resource governor.

use thiserror::Error;

/// Errors surfaced by an [`AtomicStorage`](crate::ratelimit::AtomicStorage) backend.
///
/// These are opaque to the governor: they are handed back to the caller
/// exactly as the backend produced them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The backend could not be reached
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// The backend rejected or failed the operation
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// A stored value could not be interpreted as a 64-bit integer
    #[error("Corrupt value under key {key}: {value:?}")]
    Corrupt { key: String, value: String },
}

/// Main error type for governor operations.
#[derive(Error, Debug)]
pub enum GovernorError {
    /// Storage errors, propagated unmodified
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The caller's context was cancelled between attempts
    #[error("Operation cancelled")]
    Cancelled,

    /// The caller's context deadline elapsed between attempts
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// A bounded retry policy gave up under CAS contention
    #[error("Gave up after {attempts} contended attempts")]
    Contention { attempts: u32 },

    /// Refill rate or burst capacity cannot drive a GCRA schedule
    #[error("Invalid rate limit parameters: {0}")]
    InvalidParameters(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for governor operations.
pub type Result<T> = std::result::Result<T, GovernorError>;

//! Failure taxonomy of the document store.
//!
//! Every raw failure the engine can observe at the facade boundary is
//! one of these variants. The transaction layer maps them onto its own
//! error classes; nothing above the facade sees transport-level detail.

use thiserror::Error;

/// Result alias for store operations.
pub type KvResult<T> = Result<T, KvError>;

/// Errors surfaced by a [`crate::KvStore`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KvError {
    /// The document does not exist (or is a tombstone and the caller
    /// did not ask for deleted access).
    #[error("document not found")]
    DocumentNotFound,

    /// An insert hit an existing document.
    #[error("document already exists")]
    DocumentExists,

    /// The CAS supplied with a guarded write no longer matches.
    #[error("CAS mismatch")]
    CasMismatch,

    /// A sub-document path does not exist.
    #[error("path not found: {0}")]
    PathNotFound(String),

    /// A sub-document insert hit an existing path.
    #[error("path already exists: {0}")]
    PathExists(String),

    /// The resulting document would exceed the store's size limit.
    #[error("value too large")]
    ValueTooLarge,

    /// The operation did not complete in time; it may or may not have
    /// been applied.
    #[error("operation timed out")]
    Timeout,

    /// Transient server-side failure; safe to retry.
    #[error("temporary failure")]
    Temporary,

    /// The outcome of the operation is unknown.
    #[error("ambiguous result")]
    Ambiguous,

    /// The requested durability level cannot currently be satisfied.
    #[error("durability requirement impossible")]
    DurabilityImpossible,

    /// Authentication or authorization failure.
    #[error("access error: {0}")]
    Access(String),

    /// Malformed request or unsupported operation.
    #[error("invalid operation: {0}")]
    Invalid(String),
}

impl KvError {
    /// Whether the operation may have been applied despite the error.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, KvError::Timeout | KvError::Ambiguous)
    }
}

//! Error types for cairn.

use thiserror::Error;

/// Errors that can occur during index construction, search, or persistence.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Invalid parameter value.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Dimension mismatch between a query/batch and the index.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// An internal postcondition failed. Not recoverable; indicates a bug.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Insert would grow the index beyond its planned capacity.
    #[error("capacity exceeded: capacity {capacity}, requested id {requested}")]
    CapacityExceeded { capacity: u64, requested: u64 },

    /// Persisted stream is truncated, corrupt, or of an unknown version.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// Underlying I/O failure while reading or writing a stream.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for cairn operations.
pub type Result<T> = std::result::Result<T, IndexError>;

//! Error taxonomy for the indexing and search core.
//!
//! Library operations return [`IndexError`]. The variants separate errors
//! that are isolated to a single file (extraction, embedding) from errors
//! that must abort a whole batch (storage), and errors that are rejected
//! before any I/O happens (validation, query).
//!
//! The CLI and configuration layers use `anyhow` on top of these.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Top-level error for index, pipeline and search operations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Path rejected by the directory policy or by path sanitization.
    #[error("access denied for {path}: {reason}")]
    Validation { path: PathBuf, reason: String },

    /// The file could not be turned into text. Recoverable per file.
    #[error("extraction failed for {path}: {reason}")]
    Extraction { path: PathBuf, reason: String },

    /// Embedding backend failure after retries. Recoverable per file.
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    /// Transaction or connection failure. Fatal for a running batch.
    #[error("storage error: {0}")]
    Storage(String),

    /// Malformed query or filters, rejected before touching the store.
    #[error("invalid query: {0}")]
    Query(String),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The operation was cancelled before it committed anything.
    #[error("operation cancelled")]
    Cancelled,
}

impl IndexError {
    pub fn validation(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        IndexError::Validation {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn extraction(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        IndexError::Extraction {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Fatal errors abort the remainder of a directory scan.
    pub fn is_fatal(&self) -> bool {
        matches!(self, IndexError::Storage(_))
    }
}

impl From<sqlx::Error> for IndexError {
    fn from(e: sqlx::Error) -> Self {
        IndexError::Storage(e.to_string())
    }
}

/// Per-item embedding failure.
///
/// Cloneable so one failed backend call can be reported against every
/// text in the batch.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EmbeddingError {
    /// Backend call did not finish within the configured timeout.
    #[error("embedding timed out after {0:?}")]
    Timeout(Duration),
    /// Backend unreachable or returned a transient error (429, 5xx).
    #[error("embedding backend unavailable: {0}")]
    Unavailable(String),
    /// Backend refused the request (4xx other than 429). Not retried.
    #[error("embedding request rejected: {0}")]
    Rejected(String),
    /// Backend returned a malformed response (wrong count, bad JSON).
    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),
    /// Returned vector length differs from the model's dimension.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl EmbeddingError {
    /// Timeouts and transient backend errors are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EmbeddingError::Timeout(_) | EmbeddingError::Unavailable(_))
    }
}

pub type Result<T, E = IndexError> = std::result::Result<T, E>;

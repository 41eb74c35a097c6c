//! Cache Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction.

use derive_more::{Display, Error};
use std::io::Error as IoError;
use std::path::PathBuf;

/// A cache error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// No committed entry exists under this key (a cache miss).
    #[display("cache entry not found: {_0}")]
    NotFound(#[error(not(source))] String),
    /// Key contains characters that can't be stored safely.
    #[display("invalid cache key: {_0:?}")]
    InvalidKey(#[error(not(source))] String),
    /// Cache root must be an absolute path to an existing or creatable directory.
    #[display("invalid cache root: {}", _0.display())]
    InvalidRoot(#[error(not(source))] PathBuf),
    /// Access denied to the cache directory.
    #[display("permission denied: {}", _0.display())]
    PermissionDenied(#[error(not(source))] PathBuf),
    /// Cache has been closed; no further operations are valid.
    #[display("cache is closed")]
    Closed,
    /// Underlying I/O error
    #[display("I/O error: {_0}")]
    Io(IoError),
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    /// Returns `true` if this error is an ordinary cache miss.
    pub fn is_miss(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

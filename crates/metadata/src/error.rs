//! Metadata Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction.

use derive_more::{Display, Error};
use lazyblob_compress::error::{Error as CompressionError, ErrorKind as CompressionErrorKind};
use std::io::Error as IoError;

/// A metadata error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for metadata operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// No entry exists with this inode ID.
    #[display("inode not found: {_0}")]
    NotFound(#[error(not(source))] u32),
    /// Directory has no child with this name.
    #[display("no entry named {name:?} in directory {parent}")]
    ChildNotFound {
        parent: u32,
        #[error(not(source))]
        name: String,
    },
    /// Operation needs a directory.
    #[display("inode {_0} is not a directory")]
    NotADirectory(#[error(not(source))] u32),
    /// Operation needs a regular file.
    #[display("inode {_0} is not a regular file")]
    NotAFile(#[error(not(source))] u32),
    /// Blob does not end with a recognisable footer.
    #[display("missing or corrupt blob footer")]
    InvalidFooter,
    /// TOC could not be decoded or describes an impossible layout.
    #[display("invalid TOC: {_0}")]
    InvalidToc(#[error(not(source))] String),
    /// Entry name escapes the archive root or is otherwise unusable.
    #[display("invalid entry name: {_0:?}")]
    InvalidName(#[error(not(source))] String),
    /// Chunk frame compression/decompression error.
    #[display("compression error: {_0}")]
    Compression(CompressionErrorKind),
    /// Underlying blob read failed.
    #[display("I/O error: {_0}")]
    Io(IoError),
    /// Metadata store has been closed.
    #[display("metadata store is closed")]
    Closed,
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}
impl ErrorKind {
    /// Convert a compression error into a metadata error, keeping the
    /// compress crate's `Exn` frame as a child in the error tree.
    #[track_caller]
    pub fn compression(err: CompressionError) -> Error {
        let inner = (*err).clone();
        err.raise(ErrorKind::Compression(inner))
    }

    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    /// Returns `true` for lookups of IDs or names that don't exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::ChildNotFound { .. })
    }
}

//! Reader Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction. Errors from the metadata store and the chunk cache are
//! kept as children of a [`Metadata`](ErrorKind::Metadata) or
//! [`Cache`](ErrorKind::Cache) frame.

use derive_more::{Display, Error};

/// A reader error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for reader operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
/// Every variant is plain data so the first verification failure can be
/// latched and handed to later callers.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The archive's TOC is not the one the caller expected. The handle can
    /// no longer serve verified reads.
    #[display("TOC digest mismatch: expected {expected}, got {actual}")]
    TocDigestMismatch { expected: String, actual: String },
    /// Chunk verification failed while caching ran ahead of TOC verification.
    #[display("content verification failed before the TOC was verified")]
    ContentVerification,
    /// A chunk's bytes don't match the digest recorded for it.
    #[display("chunk at offset {offset} of inode {id} does not match digest {digest}")]
    ChunkDigestMismatch { id: u32, offset: u64, digest: String },
    /// No verifier can check this digest (unknown algorithm or malformed).
    #[display("cannot verify digest {_0:?}")]
    VerifierUnavailable(#[error(not(source))] String),
    /// The underlying chunk source failed.
    #[display("failed to read inode {id} at offset {offset}")]
    UnderlyingRead { id: u32, offset: u64 },
    /// The underlying chunk source returned fewer bytes than the chunk holds.
    #[display("short read of chunk at offset {offset}: expected {expected} bytes, got {actual}")]
    ShortRead { offset: u64, expected: u64, actual: u64 },
    /// No inode exists with this ID.
    #[display("unknown inode {_0}")]
    UnknownInode(#[error(not(source))] u32),
    /// Part of a prefetch buffer was never written.
    #[display("hole of {size} bytes at buffer offset {offset}")]
    Hole { offset: u64, size: u64 },
    /// Two prefetch writes landed on the same part of the buffer.
    #[display("region at buffer offset {offset} overlaps a region ending at {end}")]
    Overlap { offset: u64, end: u64 },
    /// Prefetch writes don't add up to the buffer's size.
    #[display("prefetch covered {actual} bytes of a {expected} byte buffer")]
    SizeMismatch { expected: u64, actual: u64 },
    /// The metadata store failed.
    #[display("metadata error")]
    Metadata,
    /// The chunk cache failed.
    #[display("cache error")]
    Cache,
    /// Background caching finished but some chunks could not be cached.
    #[display("{_0} chunk(s) could not be cached")]
    CacheIncomplete(#[error(not(source))] usize),
    /// Directory nesting exceeds the configured walk depth.
    #[display("directory tree deeper than {_0} levels")]
    TreeTooDeep(#[error(not(source))] usize),
    /// The reader has been closed.
    #[display("reader is closed")]
    Closed,
    /// TOC verification failed earlier; no content can be served.
    #[display("archive failed verification")]
    VerifyFailed,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    ///
    /// Nothing in this crate retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UnderlyingRead { .. } | Self::ShortRead { .. } | Self::Cache)
    }

    /// Returns `true` for failures caused by content not matching its digest.
    pub fn is_verification_failure(&self) -> bool {
        matches!(
            self,
            Self::TocDigestMismatch { .. }
                | Self::ContentVerification
                | Self::ChunkDigestMismatch { .. }
                | Self::VerifierUnavailable(_)
                | Self::VerifyFailed
        )
    }
}

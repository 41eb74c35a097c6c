//! Content-addressable chunk cache.
//!
//! The reader memoizes verified chunk contents here, keyed by an opaque
//! string derived from the chunk's identity. A cache never interprets its
//! keys or contents.
//!
//! # Write protocol
//! [`BlobCache::add`] hands out a [`CacheWriter`]. Bytes written to it are
//! invisible to [`BlobCache::get`] until [`CacheWriter::commit`] succeeds.
//! Dropping a writer without committing abandons everything written to it,
//! so an aborted or failed fill can never leave a partial entry behind.
//!
//! Once an entry is committed it is immutable: if two writers race on the
//! same key, the first commit wins and later commits are silently dropped.

mod directory;
pub mod error;
mod memory;

pub use crate::directory::DirectoryCache;
pub use crate::memory::MemoryCache;
use crate::error::{ErrorKind, Result};
pub use positioned_io::ReadAt;
use std::io::Write;
use std::sync::Arc;

pub type CacheHandle = Arc<dyn BlobCache>;

/// Unified interface for chunk cache backends.
///
/// # Examples
///
/// ```
/// use lazyblob_cache::{BlobCache, MemoryCache, ReadAt};
/// use std::io::Write;
///
/// let cache = MemoryCache::default();
/// let mut writer = cache.add("abcdef").unwrap();
/// writer.write_all(b"chunk bytes").unwrap();
/// // Not visible until committed.
/// assert!(cache.get("abcdef").is_err());
/// writer.commit().unwrap();
///
/// let reader = cache.get("abcdef").unwrap();
/// let mut buf = [0u8; 5];
/// reader.read_exact_at(6, &mut buf).unwrap();
/// assert_eq!(&buf, b"bytes");
/// ```
pub trait BlobCache: Send + Sync {
    /// Name of the configured cache (used for logging only).
    fn name(&self) -> &str;

    /// Start writing a new entry.
    ///
    /// Fails with [`Closed`](ErrorKind::Closed) after [`close()`](Self::close)
    /// and [`InvalidKey`](ErrorKind::InvalidKey) for keys that aren't
    /// path-safe.
    fn add(&self, key: &str) -> Result<Box<dyn CacheWriter>>;

    /// Open a committed entry for random-access reads.
    ///
    /// A miss is reported as [`NotFound`](ErrorKind::NotFound).
    fn get(&self, key: &str) -> Result<Box<dyn CacheReader>>;

    /// Check whether a committed entry exists.
    ///
    /// Default implementation opens (and immediately drops) a reader.
    fn contains(&self, key: &str) -> Result<bool> {
        match self.get(key) {
            Ok(_) => Ok(true),
            Err(e) if e.is_miss() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Release the cache. Every later operation fails with
    /// [`Closed`](ErrorKind::Closed).
    fn close(&self) -> Result<()>;
}

/// Pending cache entry.
///
/// Implements [`Write`]; the entry only becomes visible on
/// [`commit()`](Self::commit). Drop without committing to abandon it.
pub trait CacheWriter: Write + Send {
    /// Publish everything written so far under the writer's key.
    fn commit(self: Box<Self>) -> Result<()>;
}

/// Committed cache entry.
pub trait CacheReader: ReadAt + Send + Sync {
    /// Total length of the entry in bytes.
    fn size(&self) -> u64;
}

/// Validates a cache key before it is used as a map key or file name.
///
/// Keys are produced by the reader (hex digests), so anything outside
/// `[A-Za-z0-9_-]` is a bug in the caller rather than data to escape.
pub(crate) fn validate_key(key: &str) -> Result<&str> {
    let valid = !key.is_empty() && key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if !valid {
        exn::bail!(ErrorKind::InvalidKey(key.to_string()));
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("abcdef0123")]
    #[case("a")]
    #[case("chunk-1_2")]
    fn test_valid_keys(#[case] key: &str) {
        assert_eq!(validate_key(key).unwrap(), key);
    }

    #[rstest]
    #[case("")]
    #[case("../escape")]
    #[case("a/b")]
    #[case("with space")]
    #[case(".hidden")]
    fn test_invalid_keys(#[case] key: &str) {
        let err = validate_key(key).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidKey(_)));
    }
}

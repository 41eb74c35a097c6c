//! On-disk chunk cache.
//!
//! Entries are stored as plain files sharded by the first two characters of
//! their key: `<root>/<key[..2]>/<key>`. Writers stage into `<root>/tmp` and
//! are hard-linked into place on commit, so a partially written entry never
//! appears under its final name.

use crate::error::{ErrorKind, Result};
use crate::{BlobCache, CacheReader, CacheWriter, validate_key};
use positioned_io::ReadAt;
use std::fs::{File, create_dir_all};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::NamedTempFile;

const STAGING_DIR: &str = "tmp";

/// Filesystem-backed chunk cache.
///
/// # Examples
///
/// ```no_run
/// use lazyblob_cache::DirectoryCache;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let cache = DirectoryCache::new("disk", "/var/cache/lazyblob")?;
/// # Ok(())
/// # }
/// ```
pub struct DirectoryCache {
    name: String,
    root: PathBuf,
    closed: AtomicBool,
}

impl DirectoryCache {
    /// Open (creating if needed) a cache directory.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidRoot`](ErrorKind::InvalidRoot) if the path is relative
    /// or exists but is not a directory.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidRoot(root));
        }
        if root.exists() && !root.is_dir() {
            exn::bail!(ErrorKind::InvalidRoot(root));
        }
        let staging = root.join(STAGING_DIR);
        create_dir_all(&staging).map_err(|e| Self::map_io_error(e, &staging))?;

        Ok(Self {
            name: name.into(),
            root,
            closed: AtomicBool::new(false),
        })
    }

    /// Directory holding every committed entry.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        // Keys are validated non-empty ASCII, so slicing on a byte index is safe.
        let shard = &key[..key.len().min(2)];
        self.root.join(shard).join(key)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            exn::bail!(ErrorKind::Closed);
        }
        Ok(())
    }

    fn map_io_error(e: io::Error, path: &Path) -> ErrorKind {
        match e.kind() {
            io::ErrorKind::NotFound => ErrorKind::NotFound(path.display().to_string()),
            io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied(path.to_path_buf()),
            _ => ErrorKind::Io(e),
        }
    }
}

impl BlobCache for DirectoryCache {
    fn name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(level = "trace", skip(self), fields(cache = %self.name))]
    fn add(&self, key: &str) -> Result<Box<dyn CacheWriter>> {
        self.ensure_open()?;
        let key = validate_key(key)?;
        let staging = self.root.join(STAGING_DIR);
        let file = NamedTempFile::new_in(&staging).map_err(|e| Self::map_io_error(e, &staging))?;
        Ok(Box::new(DirectoryWriter {
            key: key.to_string(),
            destination: self.entry_path(key),
            file,
        }))
    }

    fn get(&self, key: &str) -> Result<Box<dyn CacheReader>> {
        self.ensure_open()?;
        let key = validate_key(key)?;
        let path = self.entry_path(key);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => exn::bail!(ErrorKind::NotFound(key.to_string())),
            Err(e) => exn::bail!(Self::map_io_error(e, &path)),
        };
        let size = file.metadata().map_err(|e| Self::map_io_error(e, &path))?.len();
        Ok(Box::new(DirectoryReader { file, size }))
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct DirectoryWriter {
    key: String,
    destination: PathBuf,
    file: NamedTempFile,
}

impl Write for DirectoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl CacheWriter for DirectoryWriter {
    fn commit(self: Box<Self>) -> Result<()> {
        let DirectoryWriter { key, destination, mut file } = *self;
        file.flush().map_err(ErrorKind::Io)?;
        if let Some(shard) = destination.parent() {
            create_dir_all(shard).map_err(|e| DirectoryCache::map_io_error(e, shard))?;
        }
        match file.persist_noclobber(&destination) {
            Ok(_) => Ok(()),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                // Dropping the returned temp file removes the staged copy.
                tracing::trace!(key = %key, "Entry already committed; dropping duplicate");
                Ok(())
            },
            Err(e) => exn::bail!(DirectoryCache::map_io_error(e.error, &destination)),
        }
    }
}

struct DirectoryReader {
    file: File,
    size: u64,
}

impl ReadAt for DirectoryReader {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read_at(pos, buf)
    }
}

impl CacheReader for DirectoryReader {
    fn size(&self) -> u64 {
        self.size
    }
}

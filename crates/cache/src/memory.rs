//! In-memory chunk cache.

use crate::error::{ErrorKind, Result};
use crate::{BlobCache, CacheReader, CacheWriter, validate_key};
use positioned_io::ReadAt;
use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

type Entries = RwLock<HashMap<String, Arc<[u8]>>>;

/// In-memory chunk cache.
///
/// Entries live in a `HashMap` behind a [`RwLock`], so all trait methods can
/// operate on `&self` from any number of threads. Committed entries are
/// shared `Arc<[u8]>` slices; readers never copy more than they're asked for.
///
/// # Examples
///
/// ```
/// use lazyblob_cache::{BlobCache, MemoryCache};
///
/// let cache = MemoryCache::with_entries([("deadbeef", b"0123")]);
/// assert!(cache.contains("deadbeef").unwrap());
/// assert_eq!(cache.len(), 1);
/// ```
pub struct MemoryCache {
    name: String,
    entries: Arc<Entries>,
    closed: AtomicBool,
}

impl MemoryCache {
    /// Create a memory cache pre-populated with committed entries.
    ///
    /// Panics if any key fails validation. Intended for test setup.
    pub fn with_entries(entries: impl IntoIterator<Item = (impl Into<String>, impl AsRef<[u8]>)>) -> Self {
        let mut map = HashMap::new();
        for (key, data) in entries {
            let key = key.into();
            if validate_key(&key).is_err() {
                panic!("MemoryCache::with_entries: invalid key {key:?}");
            }
            map.insert(key, Arc::from(data.as_ref()));
        }
        Self {
            name: "memory".to_string(),
            entries: Arc::new(RwLock::new(map)),
            closed: AtomicBool::new(false),
        }
    }

    /// Change the name of the memory cache.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Number of committed entries.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every committed entry.
    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            exn::bail!(ErrorKind::Closed);
        }
        Ok(())
    }
}
impl Default for MemoryCache {
    fn default() -> Self {
        let entries: [(&str, &[u8]); 0] = [];
        Self::with_entries(entries)
    }
}

impl BlobCache for MemoryCache {
    fn name(&self) -> &str {
        &self.name
    }

    fn add(&self, key: &str) -> Result<Box<dyn CacheWriter>> {
        self.ensure_open()?;
        let key = validate_key(key)?.to_string();
        Ok(Box::new(MemoryWriter {
            key,
            buffer: Vec::new(),
            entries: Arc::clone(&self.entries),
        }))
    }

    fn get(&self, key: &str) -> Result<Box<dyn CacheReader>> {
        self.ensure_open()?;
        let key = validate_key(key)?;
        let data = self.entries.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned();
        match data {
            Some(data) => Ok(Box::new(MemoryReader { data })),
            None => exn::bail!(ErrorKind::NotFound(key.to_string())),
        }
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.clear();
        Ok(())
    }
}

struct MemoryWriter {
    key: String,
    buffer: Vec<u8>,
    entries: Arc<Entries>,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl CacheWriter for MemoryWriter {
    fn commit(self: Box<Self>) -> Result<()> {
        let MemoryWriter { key, buffer, entries } = *self;
        let mut guard = entries.write().unwrap_or_else(PoisonError::into_inner);
        if guard.contains_key(&key) {
            tracing::trace!(key = %key, "Entry already committed; dropping duplicate");
            return Ok(());
        }
        guard.insert(key, Arc::from(buffer));
        Ok(())
    }
}

struct MemoryReader {
    data: Arc<[u8]>,
}

impl ReadAt for MemoryReader {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        let Ok(start) = usize::try_from(pos) else {
            return Ok(0);
        };
        if start >= self.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }
}

impl CacheReader for MemoryReader {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

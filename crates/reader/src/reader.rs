//! Archive handles and whole-archive caching.

use crate::error::{Error, ErrorKind, Result};
use crate::file::File;
use crate::state::{LastVerifyError, VerifyState};
use crate::verify::{DigestVerifierFactory, VerifierHandle, cache_key};
use exn::ResultExt;
use lazyblob_cache::{BlobCache, CacheHandle};
use lazyblob_config::ReaderConfig;
use lazyblob_metadata::{ChunkEntry, ChunkedFile, EntryKind, MetadataHandle, MetadataReader};
use positioned_io::ReadAt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;
use std::time::Duration;
use tracing::instrument;

/// State every handle to one archive shares.
pub(crate) struct Shared {
    pub(crate) metadata: MetadataHandle,
    pub(crate) cache: CacheHandle,
    pub(crate) verifier: VerifierHandle,
    pub(crate) config: ReaderConfig,
    layer_digest: String,
    state: RwLock<VerifyState>,
    last_verify_error: LastVerifyError,
    closed: AtomicBool,
}

/// How a chunk that fails verification while the trust decision is still
/// open is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EarlyFailure {
    /// Latch it for `verify_toc` and keep going.
    Record,
    /// Fail the operation.
    Return,
}

impl Shared {
    pub(crate) fn state(&self) -> VerifyState {
        self.state.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            exn::bail!(ErrorKind::Closed);
        }
        Ok(())
    }

    /// Check `data` against its chunk digest under the current trust regime.
    ///
    /// Returns whether `data` may be cached. A latched failure leaves the
    /// chunk uncached: the cache outlives this handle, and a later handle
    /// would trust whatever it finds there.
    ///
    /// The state lock is held until the failure has either been latched or
    /// returned, so `verify_toc` can't miss a failure that raced with it.
    pub(crate) fn verify_chunk(&self, id: u32, chunk: &ChunkEntry, data: &[u8], early: EarlyFailure) -> Result<bool> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let checked = match &*state {
            VerifyState::SkipVerify => return Ok(true),
            VerifyState::VerifyFailed(_) => exn::bail!(ErrorKind::VerifyFailed),
            VerifyState::Verified | VerifyState::Unverified => self.check_digest(id, chunk, data),
        };
        match checked {
            Ok(()) => Ok(true),
            Err(err) if *state == VerifyState::Unverified && early == EarlyFailure::Record => {
                tracing::warn!(id, offset = chunk.offset, error = ?err, "Chunk failed verification before TOC was verified");
                self.last_verify_error.store((*err).clone());
                Ok(false)
            },
            Err(err) => Err(err),
        }
    }

    fn check_digest(&self, id: u32, chunk: &ChunkEntry, data: &[u8]) -> Result<()> {
        let mut verifier = self.verifier.verifier(id, &chunk.digest)?;
        verifier.write(data);
        if !verifier.verified() {
            exn::bail!(ErrorKind::ChunkDigestMismatch {
                id,
                offset: chunk.offset,
                digest: chunk.digest.clone(),
            });
        }
        Ok(())
    }

    /// Cache key of a chunk of this archive.
    pub(crate) fn chunk_key(&self, id: u32, chunk: &ChunkEntry) -> String {
        cache_key(self.metadata.toc_digest(), id, chunk.offset, chunk.size)
    }

    /// Write one committed cache entry.
    pub(crate) fn store_chunk(&self, key: &str, data: &[u8]) -> Result<()> {
        let mut writer = self.cache.add(key).or_raise(|| ErrorKind::Cache)?;
        writer.write_all(data).or_raise(|| ErrorKind::Cache)?;
        writer.commit().or_raise(|| ErrorKind::Cache)
    }

    /// [`store_chunk`](Self::store_chunk), but a failure only costs a
    /// future cache miss.
    pub(crate) fn store_chunk_best_effort(&self, key: &str, data: &[u8]) {
        if let Err(err) = self.store_chunk(key, data) {
            tracing::debug!(key, error = ?err, "Failed to cache chunk");
        }
    }

    /// Fetch, verify and cache one chunk unless it is already cached.
    fn cache_chunk(&self, job: &CacheJob) -> Result<()> {
        let chunk = &job.chunk;
        let key = self.chunk_key(job.id, chunk);
        match self.cache.contains(&key) {
            Ok(true) => return Ok(()),
            Ok(false) => {},
            Err(err) => tracing::debug!(key = %key, error = ?err, "Failed to query cache, fetching chunk"),
        }
        let mut data = vec![0u8; chunk.size as usize];
        let n = job
            .file
            .read_at(chunk.offset, &mut data)
            .or_raise(|| ErrorKind::UnderlyingRead {
                id: job.id,
                offset: chunk.offset,
            })?;
        if n as u64 != chunk.size {
            exn::bail!(ErrorKind::ShortRead {
                offset: chunk.offset,
                expected: chunk.size,
                actual: n as u64,
            });
        }
        if !self.verify_chunk(job.id, chunk, &data, EarlyFailure::Record)? {
            return Ok(());
        }
        self.store_chunk(&key, &data)
    }
}

struct CacheJob {
    id: u32,
    file: Arc<dyn ChunkedFile>,
    chunk: ChunkEntry,
}

type Filter<'f> = Box<dyn Fn(u64) -> bool + 'f>;

/// Options for [`VerifiableReader::cache`].
#[derive(Default)]
pub struct CacheOptions<'f> {
    filter: Option<Filter<'f>>,
    workers: Option<usize>,
}

impl<'f> CacheOptions<'f> {
    /// Only cache regular files whose blob offset satisfies `filter`.
    ///
    /// The filter runs on the calling thread, once per regular file, and may
    /// block; chunks of files already accepted keep being fetched meanwhile.
    pub fn with_filter(mut self, filter: impl Fn(u64) -> bool + 'f) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    /// Override the configured number of caching workers.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }
}

/// An open archive whose trust decision may still be pending.
///
/// Content can only be read through a [`Reader`], which is handed out once
/// the caller either verifies the TOC ([`verify_toc`](Self::verify_toc)) or
/// explicitly opts out ([`skip_verify`](Self::skip_verify)).
/// [`cache`](Self::cache) may run before, during and after that decision.
///
/// # Examples
///
/// ```
/// use lazyblob_cache::MemoryCache;
/// use lazyblob_metadata::{Builder, MetadataReader};
/// use lazyblob_reader::{CacheOptions, VerifiableReader};
/// use std::sync::Arc;
///
/// let built = Builder::new().with_chunk_size(4).add_file("hello.txt", b"hello world").build().unwrap();
/// let digest = built.toc_digest.clone();
/// let metadata = Arc::new(built.open().unwrap());
///
/// let vr = VerifiableReader::open(metadata, Arc::new(MemoryCache::default()), "layer").unwrap();
/// let reader = vr.verify_toc(&digest).unwrap();
/// vr.cache(CacheOptions::default()).unwrap();
///
/// let (id, _) = reader.metadata().get_child(reader.metadata().root_id(), "hello.txt").unwrap();
/// let file = reader.open_file(id).unwrap();
/// let mut buf = [0u8; 5];
/// assert_eq!(file.read_at(6, &mut buf).unwrap(), 5);
/// assert_eq!(&buf, b"world");
/// ```
pub struct VerifiableReader {
    shared: Arc<Shared>,
}

impl VerifiableReader {
    /// Wrap a metadata store and a chunk cache with the default verifier and
    /// tuning. Nothing is verified yet.
    ///
    /// `layer_digest` identifies the archive in logs. Cache entries are
    /// keyed by the archive's TOC digest, so archives can share a cache.
    pub fn open(metadata: MetadataHandle, cache: CacheHandle, layer_digest: impl Into<String>) -> Result<Self> {
        Self::open_with(metadata, cache, layer_digest, Arc::new(DigestVerifierFactory), ReaderConfig::default())
    }

    /// [`open`](Self::open) with an explicit chunk verifier and tuning.
    pub fn open_with(
        metadata: MetadataHandle,
        cache: CacheHandle,
        layer_digest: impl Into<String>,
        verifier: VerifierHandle,
        config: ReaderConfig,
    ) -> Result<Self> {
        metadata.get_attr(metadata.root_id()).or_raise(|| ErrorKind::Metadata)?;
        let layer_digest = layer_digest.into();
        tracing::debug!(layer = %layer_digest, cache = cache.name(), "Opened archive");
        Ok(Self {
            shared: Arc::new(Shared {
                metadata,
                cache,
                verifier,
                config,
                layer_digest,
                state: RwLock::new(VerifyState::Unverified),
                last_verify_error: LastVerifyError::default(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn metadata(&self) -> &dyn MetadataReader {
        &*self.shared.metadata
    }

    pub fn layer_digest(&self) -> &str {
        &self.shared.layer_digest
    }

    pub fn state(&self) -> VerifyState {
        self.shared.state()
    }

    /// The first chunk verification failure seen before the trust decision.
    pub fn last_verify_error(&self) -> Option<ErrorKind> {
        self.shared.last_verify_error.load()
    }

    /// Like [`last_verify_error`](Self::last_verify_error), but waits up to
    /// `timeout` for one to be recorded.
    pub fn wait_last_verify_error(&self, timeout: Duration) -> Option<ErrorKind> {
        self.shared.last_verify_error.wait(timeout)
    }

    /// Compare the archive's TOC digest with `expected` and, on a match,
    /// enable per-chunk verification for every read.
    ///
    /// Fails with [`ContentVerification`](ErrorKind::ContentVerification) if
    /// background caching already saw a bad chunk, and with
    /// [`TocDigestMismatch`](ErrorKind::TocDigestMismatch) if the TOC
    /// differs. Either failure is permanent for this handle. Once resolved,
    /// later calls report the same outcome.
    #[instrument(skip(self), fields(layer = %self.shared.layer_digest))]
    pub fn verify_toc(&self, expected: &str) -> Result<Reader> {
        self.shared.ensure_open()?;
        let actual = self.shared.metadata.toc_digest();
        let mut state = self.shared.state.write().unwrap_or_else(PoisonError::into_inner);
        match &*state {
            VerifyState::Unverified => {},
            VerifyState::VerifyFailed(kind) => exn::bail!(kind.clone()),
            VerifyState::SkipVerify => return Ok(self.reader()),
            VerifyState::Verified if actual == expected => return Ok(self.reader()),
            VerifyState::Verified => exn::bail!(ErrorKind::TocDigestMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            }),
        }

        if let Some(early) = self.shared.last_verify_error.load() {
            *state = VerifyState::VerifyFailed(ErrorKind::ContentVerification);
            tracing::warn!(error = %early, "Rejecting archive: content failed verification during caching");
            return Err(Error::from(early).raise(ErrorKind::ContentVerification));
        }
        if actual != expected {
            let kind = ErrorKind::TocDigestMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            };
            *state = VerifyState::VerifyFailed(kind.clone());
            tracing::warn!(expected, actual, "TOC digest mismatch");
            exn::bail!(kind);
        }
        *state = VerifyState::Verified;
        tracing::info!("TOC verified");
        Ok(self.reader())
    }

    /// Disable verification entirely. Chunks are served as stored.
    ///
    /// Only an unresolved handle changes state; a handle that already failed
    /// verification stays failed, and its reader can't serve content.
    #[instrument(skip(self), fields(layer = %self.shared.layer_digest))]
    pub fn skip_verify(&self) -> Reader {
        let mut state = self.shared.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state == VerifyState::Unverified {
            *state = VerifyState::SkipVerify;
            tracing::info!("Skipping verification");
        }
        self.reader()
    }

    /// Ensure every chunk of every (selected) regular file is cached.
    ///
    /// Directories are walked on the calling thread while a pool of worker
    /// threads fetches, verifies and caches chunks. Chunks already cached
    /// are skipped, so repeated calls only redo what failed.
    ///
    /// Verification failures seen before the trust decision are latched for
    /// [`verify_toc`](Self::verify_toc) and don't fail this call; once the
    /// decision is made they do. A chunk that failed is never cached.
    #[instrument(skip_all, fields(layer = %self.shared.layer_digest))]
    pub fn cache(&self, options: CacheOptions<'_>) -> Result<()> {
        self.shared.ensure_open()?;
        let workers = options.workers.unwrap_or(self.shared.config.cache_workers).max(1);
        let (jobs, queue) = mpsc::sync_channel::<CacheJob>(workers);
        let queue = Mutex::new(queue);
        let failures = Mutex::new(Vec::<Error>::new());

        let walked = thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let job = queue.lock().unwrap_or_else(PoisonError::into_inner).recv();
                        let Ok(job) = job else {
                            break;
                        };
                        if let Err(err) = self.shared.cache_chunk(&job) {
                            tracing::debug!(id = job.id, offset = job.chunk.offset, error = ?err, "Failed to cache chunk");
                            failures.lock().unwrap_or_else(PoisonError::into_inner).push(err);
                        }
                    }
                });
            }
            let walked = self.walk(self.shared.metadata.root_id(), 0, &options, &jobs);
            drop(jobs);
            walked
        });

        let failures = failures.into_inner().unwrap_or_else(PoisonError::into_inner);
        let failed = failures.len();
        walked?;
        match failures.into_iter().next() {
            None => Ok(()),
            Some(first) => Err(first.raise(ErrorKind::CacheIncomplete(failed))),
        }
    }

    fn walk(&self, dir: u32, depth: usize, options: &CacheOptions<'_>, jobs: &SyncSender<CacheJob>) -> Result<()> {
        let max_depth = self.shared.config.max_walk_depth;
        if depth > max_depth {
            exn::bail!(ErrorKind::TreeTooDeep(max_depth));
        }
        let metadata = &self.shared.metadata;
        let mut children = Vec::new();
        metadata
            .foreach_child(dir, &mut |_, id, kind| {
                children.push((id, kind));
                true
            })
            .or_raise(|| ErrorKind::Metadata)?;

        for (id, kind) in children {
            match kind {
                EntryKind::Directory => self.walk(id, depth + 1, options, jobs)?,
                EntryKind::Regular => self.enqueue_file(id, options, jobs)?,
                EntryKind::Symlink => {},
            }
        }
        Ok(())
    }

    fn enqueue_file(&self, id: u32, options: &CacheOptions<'_>, jobs: &SyncSender<CacheJob>) -> Result<()> {
        let metadata = &self.shared.metadata;
        if let Some(filter) = &options.filter {
            let offset = metadata.get_offset(id).or_raise(|| ErrorKind::Metadata)?;
            if !filter(offset) {
                return Ok(());
            }
        }
        let size = metadata.get_attr(id).or_raise(|| ErrorKind::Metadata)?.size;
        let file: Arc<dyn ChunkedFile> = Arc::from(metadata.open_file(id).or_raise(|| ErrorKind::Metadata)?);
        let mut offset = 0;
        while offset < size {
            let Some(chunk) = file.chunk_entry_for_offset(offset) else {
                break;
            };
            offset = chunk.offset + chunk.size;
            let job = CacheJob {
                id,
                file: Arc::clone(&file),
                chunk,
            };
            if jobs.send(job).is_err() {
                break;
            }
        }
        Ok(())
    }

    /// Release the metadata store and the cache.
    pub fn close(&self) -> Result<()> {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.metadata.close().or_raise(|| ErrorKind::Metadata)?;
        self.shared.cache.close().or_raise(|| ErrorKind::Cache)
    }

    fn reader(&self) -> Reader {
        Reader {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Read access to an archive whose trust decision has been made.
#[derive(Clone)]
pub struct Reader {
    pub(crate) shared: Arc<Shared>,
}

impl Reader {
    pub fn metadata(&self) -> &dyn MetadataReader {
        &*self.shared.metadata
    }

    /// Open a regular file for random-access reads.
    ///
    /// Fails with [`UnknownInode`](ErrorKind::UnknownInode) if no entry has
    /// this ID, and [`Metadata`](ErrorKind::Metadata) for anything else the
    /// metadata store rejects.
    pub fn open_file(&self, id: u32) -> Result<File> {
        self.shared.ensure_open()?;
        let metadata = &self.shared.metadata;
        if let Err(err) = metadata.get_attr(id) {
            let kind = match err.is_not_found() {
                true => ErrorKind::UnknownInode(id),
                false => ErrorKind::Metadata,
            };
            return Err(err.raise(kind));
        }
        let source = metadata.open_file(id).or_raise(|| ErrorKind::Metadata)?;
        Ok(File::new(id, source, Arc::clone(&self.shared)))
    }
}

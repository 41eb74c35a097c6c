//! Sources, caches and verifiers for exercising the reader in tests.

use crate::file::File;
use crate::reader::{Reader, VerifiableReader};
use crate::verify::{ChunkVerifier, DigestVerifierFactory, VerifierFactory, VerifierHandle};
use lazyblob_cache::error::{ErrorKind as CacheErrorKind, Result as CacheResult};
use lazyblob_cache::{BlobCache, CacheHandle, CacheReader, CacheWriter, MemoryCache};
use lazyblob_config::ReaderConfig;
use lazyblob_compress::Compression;
use lazyblob_metadata::{BuiltBlob, Builder, ChunkEntry, ChunkedFile, MemoryMetadata};
use positioned_io::ReadAt;
use std::collections::HashSet;
use std::io;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

pub(crate) const SAMPLE_DATA: &[u8] = b"0123456789";
pub(crate) const SAMPLE_CHUNK_SIZE: usize = 3;

/// Deterministic pseudo-random bytes.
pub(crate) fn pseudo_random(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    blake3::Hasher::new().update(b"lazyblob").finalize_xof().fill(&mut bytes);
    bytes
}

/// Open `built` over its own bytes with an empty memory cache.
pub(crate) fn open_reader(built: BuiltBlob, verifier: VerifierHandle) -> (VerifiableReader, Arc<MemoryCache>) {
    open_configured(built, verifier, ReaderConfig::default())
}

/// [`open_reader`] with explicit tuning.
pub(crate) fn open_configured(
    built: BuiltBlob,
    verifier: VerifierHandle,
    config: ReaderConfig,
) -> (VerifiableReader, Arc<MemoryCache>) {
    let cache = Arc::new(MemoryCache::default());
    let vr = reader_from_source(built, cache.clone(), verifier, config, |blob| blob);
    (vr, cache)
}

/// Open `built` with its bytes wrapped by `wrap`.
pub(crate) fn reader_from_source<S>(
    built: BuiltBlob,
    cache: CacheHandle,
    verifier: VerifierHandle,
    config: ReaderConfig,
    wrap: impl FnOnce(Vec<u8>) -> S,
) -> VerifiableReader
where
    S: ReadAt + Send + Sync + 'static,
{
    let size = built.len();
    let metadata = MemoryMetadata::open(wrap(built.bytes), size).unwrap();
    VerifiableReader::open_with(Arc::new(metadata), cache, "sha256:test", verifier, config).unwrap()
}

/// Open `built` over its own bytes on an existing cache.
pub(crate) fn reader_on_cache(built: BuiltBlob, cache: CacheHandle) -> VerifiableReader {
    reader_from_source(built, cache, Arc::new(DigestVerifierFactory), ReaderConfig::default(), |blob| blob)
}

/// A verified reader over a single file called `file`.
pub(crate) fn make_file(contents: &[u8], chunk_size: usize, compression: Compression) -> (Reader, Arc<MemoryCache>, u32) {
    let built = Builder::new()
        .with_chunk_size(chunk_size)
        .with_compression(compression)
        .add_file("file", contents)
        .build()
        .unwrap();
    let digest = built.toc_digest.clone();
    let (vr, cache) = open_reader(built, Arc::new(DigestVerifierFactory));
    let reader = vr.verify_toc(&digest).unwrap();
    let id = lookup(&reader, "file");
    (reader, cache, id)
}

/// A file over `source` that skips verification and caches nothing.
pub(crate) fn mock_file(source: MockChunkedFile) -> File {
    let metadata = Builder::new().add_file("mock", b"").build().unwrap().open().unwrap();
    let vr = VerifiableReader::open(Arc::new(metadata), Arc::new(NullCache), "sha256:mock").unwrap();
    let reader = vr.skip_verify();
    File::new(1, Box::new(source), Arc::clone(&reader.shared))
}

/// Resolve a `/`-separated path from the root.
pub(crate) fn lookup(reader: &Reader, path: &str) -> u32 {
    let metadata = reader.metadata();
    path.split('/')
        .fold(metadata.root_id(), |id, name| metadata.get_child(id, name).unwrap().0)
}

/// Panics if any byte of a prohibited range is read.
pub(crate) struct ExceptFile {
    inner: Box<dyn ChunkedFile>,
    prohibited: Vec<Range<u64>>,
}

impl ExceptFile {
    pub(crate) fn new(inner: Box<dyn ChunkedFile>, prohibited: Vec<Range<u64>>) -> Self {
        Self { inner, prohibited }
    }
}

impl ReadAt for ExceptFile {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        let end = pos + buf.len() as u64;
        if let Some(range) = self.prohibited.iter().find(|r| r.start < end && pos < r.end) {
            panic!("read {pos}..{end} touches prohibited range {range:?}");
        }
        self.inner.read_at(pos, buf)
    }
}

impl ChunkedFile for ExceptFile {
    fn chunk_entry_for_offset(&self, offset: u64) -> Option<ChunkEntry> {
        self.inner.chunk_entry_for_offset(offset)
    }
}

/// Fails every read while the switch is on.
pub(crate) struct BreakSource {
    inner: Vec<u8>,
    broken: Arc<AtomicBool>,
}

impl BreakSource {
    pub(crate) fn new(inner: Vec<u8>, broken: Arc<AtomicBool>) -> Self {
        Self { inner, broken }
    }
}

impl ReadAt for BreakSource {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(io::Error::other("broken"));
        }
        self.inner.read_at(pos, buf)
    }
}

/// Records the position of every read.
pub(crate) struct CalledSource {
    inner: Vec<u8>,
    log: Arc<Mutex<Vec<u64>>>,
}

impl CalledSource {
    pub(crate) fn new(inner: Vec<u8>) -> Self {
        Self {
            inner,
            log: Arc::default(),
        }
    }

    pub(crate) fn log(&self) -> Arc<Mutex<Vec<u64>>> {
        Arc::clone(&self.log)
    }
}

impl ReadAt for CalledSource {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.log.lock().unwrap().push(pos);
        self.inner.read_at(pos, buf)
    }
}

/// Claims to read `read_size` bytes without writing any.
pub(crate) struct MockChunkedFile {
    read_size: usize,
}

impl MockChunkedFile {
    pub(crate) fn new(read_size: usize) -> Self {
        Self { read_size }
    }
}

impl ReadAt for MockChunkedFile {
    fn read_at(&self, _pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_size.min(buf.len()))
    }
}

impl ChunkedFile for MockChunkedFile {
    fn chunk_entry_for_offset(&self, _offset: u64) -> Option<ChunkEntry> {
        None
    }
}

/// Never holds anything.
pub(crate) struct NullCache;

struct NullWriter;

impl io::Write for NullWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl CacheWriter for NullWriter {
    fn commit(self: Box<Self>) -> CacheResult<()> {
        Ok(())
    }
}

impl BlobCache for NullCache {
    fn name(&self) -> &str {
        "null"
    }

    fn add(&self, _key: &str) -> CacheResult<Box<dyn CacheWriter>> {
        Ok(Box::new(NullWriter))
    }

    fn get(&self, key: &str) -> CacheResult<Box<dyn CacheReader>> {
        exn::bail!(CacheErrorKind::NotFound(key.to_string()))
    }

    fn close(&self) -> CacheResult<()> {
        Ok(())
    }
}

/// A memory cache that can't answer whether it holds an entry.
pub(crate) struct UnqueryableCache(pub(crate) Arc<MemoryCache>);

impl BlobCache for UnqueryableCache {
    fn name(&self) -> &str {
        "unqueryable"
    }

    fn add(&self, key: &str) -> CacheResult<Box<dyn CacheWriter>> {
        self.0.add(key)
    }

    fn get(&self, key: &str) -> CacheResult<Box<dyn CacheReader>> {
        self.0.get(key)
    }

    fn contains(&self, _key: &str) -> CacheResult<bool> {
        exn::bail!(CacheErrorKind::PermissionDenied("unqueryable".into()))
    }

    fn close(&self) -> CacheResult<()> {
        self.0.close()
    }
}

/// Passes or fails without hashing anything.
struct TestChunkVerifier {
    success: bool,
}

impl ChunkVerifier for TestChunkVerifier {
    fn write(&mut self, _data: &[u8]) {}

    fn verified(&self) -> bool {
        self.success
    }
}

/// Fails every chunk of the registered inodes.
#[derive(Default)]
pub(crate) struct FailIdVerifier {
    fails: Mutex<HashSet<u32>>,
}

impl FailIdVerifier {
    pub(crate) fn register_fails(&self, ids: impl IntoIterator<Item = u32>) {
        self.fails.lock().unwrap().extend(ids);
    }
}

impl VerifierFactory for FailIdVerifier {
    fn verifier(&self, id: u32, _digest: &str) -> crate::Result<Box<dyn ChunkVerifier>> {
        let success = !self.fails.lock().unwrap().contains(&id);
        Ok(Box::new(TestChunkVerifier { success }))
    }
}

/// Passes or fails every chunk, switchable at runtime.
pub(crate) struct StubVerifier {
    success: AtomicBool,
}

impl StubVerifier {
    pub(crate) fn new(success: bool) -> Self {
        Self {
            success: AtomicBool::new(success),
        }
    }

    pub(crate) fn set_success(&self, success: bool) {
        self.success.store(success, Ordering::SeqCst);
    }
}

impl VerifierFactory for StubVerifier {
    fn verifier(&self, _id: u32, _digest: &str) -> crate::Result<Box<dyn ChunkVerifier>> {
        Ok(Box::new(TestChunkVerifier {
            success: self.success.load(Ordering::SeqCst),
        }))
    }
}

/// A one-shot latch: `wait` blocks until `open` is called.
#[derive(Default)]
pub(crate) struct Gate {
    open: Mutex<bool>,
    opened: Condvar,
}

impl Gate {
    pub(crate) fn wait(&self) {
        let open = self.open.lock().unwrap();
        drop(self.opened.wait_while(open, |open| !*open).unwrap());
    }

    pub(crate) fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.opened.notify_all();
    }
}

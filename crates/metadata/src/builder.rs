//! Blob construction.

use crate::MemoryMetadata;
use crate::error::{ErrorKind, Result};
use crate::path::components;
use crate::toc::{self, EntryKind, TOC_VERSION, Toc, TocChunk, TocEntry};
use exn::ResultExt;
use lazyblob_compress::Compression;

/// Chunk size used unless [`Builder::with_chunk_size`] says otherwise.
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;
const DEFAULT_FILE_MODE: u32 = 0o644;
const DEFAULT_DIR_MODE: u32 = 0o755;

enum Pending {
    Dir { name: String },
    File { name: String, contents: Vec<u8> },
    Symlink { name: String, target: String },
}

/// Assembles a lazyblob archive in memory.
///
/// Entries are written in the order they're added. Each regular file is cut
/// into `chunk_size` pieces, every piece is compressed into its own frame,
/// and the TOC records the `sha256` digest of each uncompressed piece.
///
/// # Examples
///
/// ```
/// use lazyblob_compress::Compression;
/// use lazyblob_metadata::Builder;
///
/// let built = Builder::new()
///     .with_chunk_size(3)
///     .with_compression(Compression::Gzip)
///     .add_dir("docs/")
///     .add_file("docs/readme.txt", b"0123456789")
///     .build()
///     .unwrap();
/// assert!(built.toc_digest.starts_with("sha256:"));
/// ```
pub struct Builder {
    chunk_size: usize,
    compression: Compression,
    entries: Vec<Pending>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            compression: Compression::default(),
            entries: Vec::new(),
        }
    }

    /// Change the chunk size. Zero is treated as one.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn add_dir(mut self, name: impl Into<String>) -> Self {
        self.entries.push(Pending::Dir { name: name.into() });
        self
    }

    pub fn add_file(mut self, name: impl Into<String>, contents: impl AsRef<[u8]>) -> Self {
        self.entries.push(Pending::File {
            name: name.into(),
            contents: contents.as_ref().to_vec(),
        });
        self
    }

    pub fn add_symlink(mut self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.entries.push(Pending::Symlink {
            name: name.into(),
            target: target.into(),
        });
        self
    }

    /// Compress every chunk and append the TOC and footer.
    pub fn build(self) -> Result<BuiltBlob> {
        let mut blob = Vec::new();
        let mut entries = Vec::with_capacity(self.entries.len());
        for pending in self.entries {
            let entry = match pending {
                Pending::Dir { name } => TocEntry {
                    name,
                    kind: EntryKind::Directory,
                    size: 0,
                    mode: DEFAULT_DIR_MODE,
                    link_name: None,
                    chunks: Vec::new(),
                },
                Pending::Symlink { name, target } => TocEntry {
                    name,
                    kind: EntryKind::Symlink,
                    size: 0,
                    mode: DEFAULT_FILE_MODE,
                    link_name: Some(target),
                    chunks: Vec::new(),
                },
                Pending::File { name, contents } => {
                    let mut chunks = Vec::new();
                    let mut offset = 0u64;
                    for piece in contents.chunks(self.chunk_size) {
                        let frame = self.compression.compress(piece).map_err(ErrorKind::compression)?;
                        chunks.push(TocChunk {
                            offset,
                            size: piece.len() as u64,
                            blob_offset: blob.len() as u64,
                            blob_size: frame.len() as u64,
                            digest: toc::sha256_digest(piece),
                        });
                        blob.extend_from_slice(&frame);
                        offset += piece.len() as u64;
                    }
                    TocEntry {
                        name,
                        kind: EntryKind::Regular,
                        size: contents.len() as u64,
                        mode: DEFAULT_FILE_MODE,
                        link_name: None,
                        chunks,
                    }
                },
            };
            components(&entry.name)?;
            entries.push(entry);
        }

        let toc = Toc {
            version: TOC_VERSION,
            compression: self.compression.to_string(),
            entries,
        };
        finish(blob, &toc)
    }
}

/// Append an encoded TOC and footer to already written chunk frames.
pub(crate) fn finish(mut blob: Vec<u8>, toc: &Toc) -> Result<BuiltBlob> {
    let toc_offset = blob.len() as u64;
    let raw = serde_json::to_vec(toc).or_raise(|| ErrorKind::InvalidToc("failed to encode TOC".to_string()))?;
    let toc_digest = toc::sha256_digest(&raw);
    blob.extend_from_slice(&raw);
    blob.extend_from_slice(&toc::encode_footer(toc_offset));
    tracing::debug!(entries = toc.entries.len(), bytes = blob.len(), "Built blob");
    Ok(BuiltBlob { bytes: blob, toc_digest })
}

/// A finished blob and the digest of its TOC.
#[derive(Debug, Clone)]
pub struct BuiltBlob {
    pub bytes: Vec<u8>,
    pub toc_digest: String,
}

impl BuiltBlob {
    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Open the blob with an in-memory metadata store.
    pub fn open(self) -> Result<MemoryMetadata> {
        let size = self.len();
        MemoryMetadata::open(self.bytes, size)
    }
}

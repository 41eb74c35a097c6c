//! Archive metadata for lazyblob.
//!
//! A lazyblob archive is a single blob laid out as:
//!
//! ```text
//! [chunk frame]...[chunk frame][TOC JSON][footer]
//! ```
//!
//! Every regular file is split into fixed-size chunks at build time and each
//! chunk is compressed into its own frame, so any chunk can be fetched and
//! decompressed on its own. The TOC records, per chunk, where its frame sits
//! in the blob and the digest of its uncompressed bytes. The 16-byte footer
//! points at the TOC.
//!
//! This crate provides:
//! - the serde model of the TOC and footer ([`toc`])
//! - the [`MetadataReader`] and [`ChunkedFile`] interfaces the reader engine
//!   is written against
//! - [`MemoryMetadata`], an in-memory inode tree built from a blob's TOC
//! - [`Builder`], which produces blobs (used by tests and tooling)

mod builder;
pub mod error;
mod memory;
mod path;
pub mod toc;

pub use crate::builder::{BuiltBlob, Builder};
use crate::error::Result;
pub use crate::memory::MemoryMetadata;
pub use crate::toc::EntryKind;
use positioned_io::ReadAt;
use std::sync::Arc;

pub type MetadataHandle = Arc<dyn MetadataReader>;

/// Attributes of a single inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    pub kind: EntryKind,
    /// Uncompressed size in bytes (zero for anything but regular files).
    pub size: u64,
    /// Permission bits.
    pub mode: u32,
    /// Symlink target.
    pub link_name: Option<String>,
}
impl Attr {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_regular(&self) -> bool {
        self.kind == EntryKind::Regular
    }
}

/// Location of one chunk within a file's uncompressed contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkEntry {
    /// Offset of the first byte of the chunk within the file.
    pub offset: u64,
    pub size: u64,
    /// Digest of the chunk's uncompressed bytes (`algorithm:hex`).
    pub digest: String,
}

/// Read access to the inode tree described by an archive's TOC.
///
/// Inode IDs are stable for the lifetime of the reader. Lookups of unknown
/// IDs fail with [`NotFound`](crate::error::ErrorKind::NotFound), which
/// callers can tell apart from I/O failures via
/// [`is_not_found()`](crate::error::ErrorKind::is_not_found).
pub trait MetadataReader: Send + Sync {
    /// ID of the root directory.
    fn root_id(&self) -> u32;

    /// Digest of the TOC as stored in the blob (`sha256:hex`).
    fn toc_digest(&self) -> &str;

    fn get_attr(&self, id: u32) -> Result<Attr>;

    /// Look up `name` inside the directory `parent`.
    fn get_child(&self, parent: u32, name: &str) -> Result<(u32, Attr)>;

    /// Call `f` with `(name, id, kind)` for each child of `id`, in name
    /// order, until it returns `false`.
    fn foreach_child(&self, id: u32, f: &mut dyn FnMut(&str, u32, EntryKind) -> bool) -> Result<()>;

    /// Offset of a regular file's data within the blob.
    fn get_offset(&self, id: u32) -> Result<u64>;

    /// Open a regular file for random-access reads of its uncompressed bytes.
    fn open_file(&self, id: u32) -> Result<Box<dyn ChunkedFile>>;

    /// Release the reader. Every later operation fails with
    /// [`Closed`](crate::error::ErrorKind::Closed).
    fn close(&self) -> Result<()>;
}

/// One regular file's uncompressed contents, addressable by chunk.
pub trait ChunkedFile: ReadAt + Send + Sync {
    /// The chunk containing `offset`, or `None` past the end of the file.
    fn chunk_entry_for_offset(&self, offset: u64) -> Option<ChunkEntry>;
}

//! In-memory metadata store.

use crate::error::{ErrorKind, Result};
use crate::path::components;
use crate::toc::{self, EntryKind, FOOTER_SIZE, TOC_VERSION, Toc, TocChunk, TocEntry};
use crate::{Attr, ChunkEntry, ChunkedFile, MetadataReader};
use exn::{OptionExt, ResultExt};
use lazyblob_compress::Compression;
use lazyblob_compress::error::ErrorKind as CompressionErrorKind;
use positioned_io::ReadAt;
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

type Blob = Arc<dyn ReadAt + Send + Sync>;

const ROOT_ID: u32 = 0;
const SYNTHESIZED_DIR_MODE: u32 = 0o755;

struct Node {
    attr: Attr,
    children: BTreeMap<String, u32>,
    chunks: Arc<[TocChunk]>,
}
impl Node {
    fn directory(mode: u32) -> Self {
        Self {
            attr: Attr {
                kind: EntryKind::Directory,
                size: 0,
                mode,
                link_name: None,
            },
            children: BTreeMap::new(),
            chunks: Arc::from([]),
        }
    }
}

/// Metadata store that parses a blob's TOC once and keeps the whole inode
/// tree in memory.
///
/// The blob itself is only touched again when a file's chunks are read, so
/// any [`ReadAt`] (a local file, a byte buffer, a ranged remote fetcher) can
/// back it.
///
/// Inode IDs are assigned in TOC order, starting with the root at `0`.
/// Directories that are only implied by a deeper entry's name are
/// synthesized with mode `0o755`.
///
/// # Examples
///
/// ```
/// use lazyblob_metadata::{Builder, MetadataReader};
///
/// let built = Builder::new().with_chunk_size(4).add_file("hello.txt", b"hello world").build().unwrap();
/// let metadata = built.open().unwrap();
/// let (id, attr) = metadata.get_child(metadata.root_id(), "hello.txt").unwrap();
/// assert_eq!(attr.size, 11);
///
/// let file = metadata.open_file(id).unwrap();
/// let mut buf = [0u8; 5];
/// file.read_exact_at(6, &mut buf).unwrap();
/// assert_eq!(&buf, b"world");
/// ```
pub struct MemoryMetadata {
    blob: Blob,
    compression: Compression,
    nodes: Vec<Node>,
    toc_digest: String,
    toc_offset: u64,
    closed: AtomicBool,
}

impl MemoryMetadata {
    /// Parse the footer and TOC of a blob that is `size` bytes long.
    #[tracing::instrument(level = "debug", skip(blob))]
    pub fn open(blob: impl ReadAt + Send + Sync + 'static, size: u64) -> Result<Self> {
        let footer_size = FOOTER_SIZE as u64;
        if size < footer_size {
            exn::bail!(ErrorKind::InvalidFooter);
        }
        let toc_end = size - footer_size;
        let mut footer = [0u8; FOOTER_SIZE];
        blob.read_exact_at(toc_end, &mut footer).map_err(ErrorKind::Io)?;
        let toc_offset = toc::parse_footer(&footer)?;
        if toc_offset > toc_end {
            exn::bail!(ErrorKind::InvalidToc(format!("TOC offset {toc_offset} is past the end of the blob")));
        }

        let toc_len = usize::try_from(toc_end - toc_offset).or_raise(|| ErrorKind::InvalidToc("TOC too large".to_string()))?;
        let mut raw = vec![0u8; toc_len];
        blob.read_exact_at(toc_offset, &mut raw).map_err(ErrorKind::Io)?;
        let toc: Toc = serde_json::from_slice(&raw).or_raise(|| ErrorKind::InvalidToc("malformed TOC JSON".to_string()))?;
        if toc.version != TOC_VERSION {
            exn::bail!(ErrorKind::InvalidToc(format!("unsupported TOC version {}", toc.version)));
        }
        let compression: Compression = toc.compression.parse().map_err(ErrorKind::compression)?;
        let nodes = build_tree(toc.entries, toc_offset)?;
        tracing::debug!(inodes = nodes.len(), %compression, "Loaded TOC");

        Ok(Self {
            blob: Arc::new(blob),
            compression,
            nodes,
            toc_digest: toc::sha256_digest(&raw),
            toc_offset,
            closed: AtomicBool::new(false),
        })
    }

    /// Frame compression recorded in the TOC.
    pub fn compression(&self) -> Compression {
        self.compression
    }

    fn node(&self, id: u32) -> Result<&Node> {
        if self.closed.load(Ordering::Acquire) {
            exn::bail!(ErrorKind::Closed);
        }
        self.nodes.get(id as usize).ok_or_raise(|| ErrorKind::NotFound(id))
    }

    fn regular(&self, id: u32) -> Result<&Node> {
        let node = self.node(id)?;
        if !node.attr.is_regular() {
            exn::bail!(ErrorKind::NotAFile(id));
        }
        Ok(node)
    }
}

impl MetadataReader for MemoryMetadata {
    fn root_id(&self) -> u32 {
        ROOT_ID
    }

    fn toc_digest(&self) -> &str {
        &self.toc_digest
    }

    fn get_attr(&self, id: u32) -> Result<Attr> {
        Ok(self.node(id)?.attr.clone())
    }

    fn get_child(&self, parent: u32, name: &str) -> Result<(u32, Attr)> {
        let node = self.node(parent)?;
        if !node.attr.is_dir() {
            exn::bail!(ErrorKind::NotADirectory(parent));
        }
        let id = node.children.get(name).copied().ok_or_raise(|| ErrorKind::ChildNotFound {
            parent,
            name: name.to_string(),
        })?;
        Ok((id, self.node(id)?.attr.clone()))
    }

    fn foreach_child(&self, id: u32, f: &mut dyn FnMut(&str, u32, EntryKind) -> bool) -> Result<()> {
        let node = self.node(id)?;
        if !node.attr.is_dir() {
            exn::bail!(ErrorKind::NotADirectory(id));
        }
        for (name, &child) in &node.children {
            if !f(name, child, self.node(child)?.attr.kind) {
                break;
            }
        }
        Ok(())
    }

    fn get_offset(&self, id: u32) -> Result<u64> {
        let node = self.regular(id)?;
        // Empty files have no frames; they sit where the TOC starts.
        Ok(node.chunks.first().map_or(self.toc_offset, |chunk| chunk.blob_offset))
    }

    fn open_file(&self, id: u32) -> Result<Box<dyn ChunkedFile>> {
        let node = self.regular(id)?;
        Ok(Box::new(MemoryFile {
            blob: Arc::clone(&self.blob),
            compression: self.compression,
            chunks: Arc::clone(&node.chunks),
        }))
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

fn build_tree(entries: Vec<TocEntry>, toc_offset: u64) -> Result<Vec<Node>> {
    let mut nodes = vec![Node::directory(SYNTHESIZED_DIR_MODE)];
    for entry in entries {
        let parts = components(&entry.name)?;
        let Some((leaf, parents)) = parts.split_last() else {
            if entry.kind != EntryKind::Directory {
                exn::bail!(ErrorKind::InvalidToc(format!("{:?} names the root but is not a directory", entry.name)));
            }
            nodes[ROOT_ID as usize].attr.mode = entry.mode;
            continue;
        };

        let mut parent = ROOT_ID;
        for part in parents {
            parent = ensure_dir(&mut nodes, parent, part, &entry.name)?;
        }
        validate_chunks(&entry, toc_offset)?;

        let existing = nodes[parent as usize].children.get(*leaf).copied();
        match existing {
            Some(id) if entry.kind == EntryKind::Directory && nodes[id as usize].attr.is_dir() => {
                // Explicit entry for a directory that was already synthesized.
                nodes[id as usize].attr.mode = entry.mode;
            },
            Some(_) => exn::bail!(ErrorKind::InvalidToc(format!("duplicate entry {:?}", entry.name))),
            None => {
                let node = Node {
                    attr: Attr {
                        kind: entry.kind,
                        size: if entry.kind == EntryKind::Regular { entry.size } else { 0 },
                        mode: entry.mode,
                        link_name: entry.link_name,
                    },
                    children: BTreeMap::new(),
                    chunks: Arc::from(entry.chunks),
                };
                let id = push_node(&mut nodes, node)?;
                nodes[parent as usize].children.insert(leaf.to_string(), id);
            },
        }
    }
    Ok(nodes)
}

fn ensure_dir(nodes: &mut Vec<Node>, parent: u32, name: &str, full: &str) -> Result<u32> {
    if let Some(&id) = nodes[parent as usize].children.get(name) {
        if !nodes[id as usize].attr.is_dir() {
            exn::bail!(ErrorKind::InvalidToc(format!("{full:?}: parent {name:?} is not a directory")));
        }
        return Ok(id);
    }
    let id = push_node(nodes, Node::directory(SYNTHESIZED_DIR_MODE))?;
    nodes[parent as usize].children.insert(name.to_string(), id);
    Ok(id)
}

fn push_node(nodes: &mut Vec<Node>, node: Node) -> Result<u32> {
    let id = u32::try_from(nodes.len()).or_raise(|| ErrorKind::InvalidToc("too many entries".to_string()))?;
    nodes.push(node);
    Ok(id)
}

/// Chunks of a regular file must tile `0..size` in order, and every frame
/// must sit before the TOC.
fn validate_chunks(entry: &TocEntry, toc_offset: u64) -> Result<()> {
    if entry.kind != EntryKind::Regular {
        if !entry.chunks.is_empty() {
            exn::bail!(ErrorKind::InvalidToc(format!("{:?}: only regular files have chunks", entry.name)));
        }
        return Ok(());
    }
    let mut expected = 0u64;
    for chunk in &entry.chunks {
        if chunk.offset != expected || chunk.size == 0 {
            exn::bail!(ErrorKind::InvalidToc(format!(
                "{:?}: chunk at offset {} does not follow the previous chunk",
                entry.name, chunk.offset
            )));
        }
        let frame_end = chunk.blob_offset.checked_add(chunk.blob_size);
        if frame_end.is_none_or(|end| end > toc_offset) {
            exn::bail!(ErrorKind::InvalidToc(format!(
                "{:?}: frame at {} overruns the TOC",
                entry.name, chunk.blob_offset
            )));
        }
        expected += chunk.size;
    }
    if expected != entry.size {
        exn::bail!(ErrorKind::InvalidToc(format!(
            "{:?}: chunks cover {expected} of {} bytes",
            entry.name, entry.size
        )));
    }
    Ok(())
}

struct MemoryFile {
    blob: Blob,
    compression: Compression,
    chunks: Arc<[TocChunk]>,
}

impl MemoryFile {
    fn chunk_index(&self, offset: u64) -> Option<usize> {
        let index = self.chunks.partition_point(|chunk| chunk.offset + chunk.size <= offset);
        (index < self.chunks.len()).then_some(index)
    }

    /// Fetch and decompress one whole chunk into `out`.
    fn read_chunk(&self, chunk: &TocChunk, out: &mut [u8]) -> io::Result<()> {
        let mut frame = vec![0u8; usize::try_from(chunk.blob_size).map_err(io::Error::other)?];
        self.blob.read_exact_at(chunk.blob_offset, &mut frame)?;
        if !self.compression.check_magic_bytes(&frame) {
            return Err(io::Error::new(io::ErrorKind::InvalidData, CompressionErrorKind::InvalidData));
        }
        self.compression
            .decompress_exact(&frame, out)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, (*err).clone()))
    }
}

impl ReadAt for MemoryFile {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut read = 0;
        while read < buf.len() {
            let offset = pos + read as u64;
            let Some(index) = self.chunk_index(offset) else {
                break;
            };
            let chunk = &self.chunks[index];
            let chunk_size = chunk.size as usize;
            let skip = (offset - chunk.offset) as usize;
            let take = (chunk_size - skip).min(buf.len() - read);
            if skip == 0 && take == chunk_size {
                self.read_chunk(chunk, &mut buf[read..read + take])?;
            } else {
                let mut scratch = vec![0u8; chunk_size];
                self.read_chunk(chunk, &mut scratch)?;
                buf[read..read + take].copy_from_slice(&scratch[skip..skip + take]);
            }
            read += take;
        }
        Ok(read)
    }
}

impl ChunkedFile for MemoryFile {
    fn chunk_entry_for_offset(&self, offset: u64) -> Option<ChunkEntry> {
        let chunk = &self.chunks[self.chunk_index(offset)?];
        Some(ChunkEntry {
            offset: chunk.offset,
            size: chunk.size,
            digest: chunk.digest.clone(),
        })
    }
}

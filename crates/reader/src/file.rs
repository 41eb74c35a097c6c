//! Random-access reads of one regular file.

use crate::batch::ChunkData;
use crate::error::{ErrorKind, Result};
use crate::reader::{EarlyFailure, Shared};
use crate::state::VerifyState;
use exn::ResultExt;
use lazyblob_metadata::{ChunkEntry, ChunkedFile};
use positioned_io::ReadAt;
use std::io;
use std::ops::Range;
use std::sync::Arc;
use tracing::instrument;

/// A chunk that missed the cache, and where its bytes go.
struct Miss {
    chunk: ChunkEntry,
    /// Part of the chunk the caller asked for.
    within: Range<usize>,
    /// Where that part lands in the caller's buffer.
    dest: Range<usize>,
}

/// An open regular file.
///
/// Every chunk is served from the cache when possible. Otherwise the whole
/// chunk is read from the archive, checked against its digest (unless
/// verification was skipped), cached and then copied out.
pub struct File {
    pub(crate) id: u32,
    pub(crate) source: Box<dyn ChunkedFile>,
    pub(crate) shared: Arc<Shared>,
}

impl File {
    pub(crate) fn new(id: u32, source: Box<dyn ChunkedFile>, shared: Arc<Shared>) -> Self {
        Self { id, source, shared }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// The chunk holding `offset`, or `None` past the end of the file.
    pub fn chunk_entry_for_offset(&self, offset: u64) -> Option<ChunkEntry> {
        self.source.chunk_entry_for_offset(offset)
    }

    /// Read into `buf` from `offset`.
    ///
    /// Returns fewer bytes than requested only at the end of the file, and
    /// `0` at or past it. Either every chunk the range touches is resolved
    /// and verified, or the read fails and `buf` should be ignored.
    #[instrument(skip(self, buf), fields(id = self.id, len = buf.len()))]
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.shared.ensure_open()?;
        if matches!(self.shared.state(), VerifyState::VerifyFailed(_)) {
            exn::bail!(ErrorKind::VerifyFailed);
        }

        let end = offset.saturating_add(buf.len() as u64);
        let mut pos = offset;
        let mut misses = Vec::new();
        while pos < end {
            let Some(chunk) = self.source.chunk_entry_for_offset(pos) else {
                break;
            };
            let lower = (pos - chunk.offset) as usize;
            let upper = (end.min(chunk.offset + chunk.size) - chunk.offset) as usize;
            let start = (pos - offset) as usize;
            let dest = start..start + (upper - lower);
            pos = chunk.offset + upper as u64;

            if self.read_cached(&chunk, lower, &mut buf[dest.clone()]) {
                tracing::trace!(offset = chunk.offset, "Cache hit");
                continue;
            }
            tracing::debug!(offset = chunk.offset, size = chunk.size, "Cache miss");
            misses.push(Miss {
                chunk,
                within: lower..upper,
                dest,
            });
        }

        let workers = self.shared.config.prefetch_workers;
        if misses.len() > 1 && workers > 1 {
            self.fetch_batched(&misses, buf, workers)?;
        } else {
            for miss in &misses {
                let data = self.fetch_chunk(&miss.chunk)?;
                buf[miss.dest.clone()].copy_from_slice(&data[miss.within.clone()]);
            }
        }
        Ok((pos - offset) as usize)
    }

    /// Copy part of a cached chunk into `dest`. Any failure is a miss.
    fn read_cached(&self, chunk: &ChunkEntry, lower: usize, dest: &mut [u8]) -> bool {
        let key = self.shared.chunk_key(self.id, chunk);
        let Ok(cached) = self.shared.cache.get(&key) else {
            return false;
        };
        cached.read_exact_at(lower as u64, dest).is_ok()
    }

    /// Read, verify and cache one whole chunk.
    fn fetch_chunk(&self, chunk: &ChunkEntry) -> Result<Vec<u8>> {
        let mut data = vec![0u8; chunk.size as usize];
        let n = self.source.read_at(chunk.offset, &mut data).or_raise(|| ErrorKind::UnderlyingRead {
            id: self.id,
            offset: chunk.offset,
        })?;
        if n as u64 != chunk.size {
            exn::bail!(ErrorKind::ShortRead {
                offset: chunk.offset,
                expected: chunk.size,
                actual: n as u64,
            });
        }
        if self.shared.verify_chunk(self.id, chunk, &data, EarlyFailure::Return)? {
            self.shared.store_chunk_best_effort(&self.shared.chunk_key(self.id, chunk), &data);
        }
        Ok(data)
    }

    /// Fetch every missed chunk in parallel into a staging buffer, then copy
    /// the requested parts out.
    fn fetch_batched(&self, misses: &[Miss], buf: &mut [u8], workers: usize) -> Result<()> {
        let mut buffer_pos = 0;
        let chunks: Vec<ChunkData> = misses
            .iter()
            .map(|miss| {
                let data = ChunkData {
                    offset: miss.chunk.offset,
                    size: miss.chunk.size,
                    digest: miss.chunk.digest.clone(),
                    buffer_pos,
                };
                buffer_pos += miss.chunk.size;
                data
            })
            .collect();
        let mut staging = vec![0u8; buffer_pos as usize];
        self.prefetch(&chunks, &mut staging, workers)?;

        for (miss, chunk) in misses.iter().zip(&chunks) {
            let base = chunk.buffer_pos as usize;
            let within = base + miss.within.start..base + miss.within.end;
            buf[miss.dest.clone()].copy_from_slice(&staging[within]);
        }
        Ok(())
    }
}

impl ReadAt for File {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        File::read_at(self, pos, buf).map_err(|err| io::Error::other((*err).clone()))
    }
}

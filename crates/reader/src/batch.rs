//! Parallel prefetch of many chunks into one buffer.
//!
//! Each worker owns a fixed, disjoint subset of the chunk list, reads its
//! chunks into private scratch space and copies them into the shared buffer.
//! Afterwards the positions every worker reported writing are audited with
//! [`check_holes`], independently of how the chunks were assigned, so a bad
//! assignment shows up just like a short read does.

use crate::error::{ErrorKind, Result};
use crate::file::File;
use crate::reader::EarlyFailure;
use exn::ResultExt;
use lazyblob_metadata::ChunkEntry;
use positioned_io::ReadAt;
use std::sync::{Mutex, PoisonError};
use std::thread;

/// A chunk to prefetch, and where it goes in the shared buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkData {
    /// Offset of the chunk in the file.
    pub offset: u64,
    pub size: u64,
    pub digest: String,
    pub buffer_pos: u64,
}

/// A region of the shared buffer that a worker wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChunkReadInfo {
    /// Position in the shared buffer.
    pub offset: u64,
    pub size: u64,
}

/// One worker's view of a prefetch.
#[derive(Debug, Clone, Copy)]
pub struct BatchWorker<'a> {
    pub worker_id: usize,
    pub worker_count: usize,
    pub chunks: &'a [ChunkData],
}

impl<'a> BatchWorker<'a> {
    /// The chunks this worker is responsible for: every `worker_count`th
    /// chunk, starting at index `worker_id`.
    pub fn assigned(&self) -> impl Iterator<Item = &'a ChunkData> + use<'a> {
        self.chunks.iter().skip(self.worker_id).step_by(self.worker_count.max(1))
    }
}

impl File {
    /// Fetch this worker's chunks into `buffer`.
    ///
    /// Cached chunks are copied straight from the cache. Everything else is
    /// read from the archive, verified and cached. A short read is not an
    /// error here: it is reported as a short region and caught by the audit.
    /// Any other failure fails the worker's whole batch.
    pub fn process_batch_chunks(&self, worker: &BatchWorker<'_>, buffer: &Mutex<&mut [u8]>) -> Result<Vec<ChunkReadInfo>> {
        let mut records = Vec::new();
        let mut scratch = Vec::new();
        for chunk in worker.assigned() {
            let entry = ChunkEntry {
                offset: chunk.offset,
                size: chunk.size,
                digest: chunk.digest.clone(),
            };
            let key = self.shared.chunk_key(self.id, &entry);
            scratch.clear();
            scratch.resize(chunk.size as usize, 0);

            let cached = self
                .shared
                .cache
                .get(&key)
                .ok()
                .is_some_and(|cached| cached.read_exact_at(0, &mut scratch).is_ok());
            let n = if cached {
                scratch.len()
            } else {
                let n = self.source.read_at(chunk.offset, &mut scratch).or_raise(|| ErrorKind::UnderlyingRead {
                    id: self.id,
                    offset: chunk.offset,
                })?;
                if n == scratch.len() {
                    if self.shared.verify_chunk(self.id, &entry, &scratch, EarlyFailure::Return)? {
                        self.shared.store_chunk_best_effort(&key, &scratch);
                    }
                } else {
                    tracing::debug!(offset = chunk.offset, expected = chunk.size, actual = n, "Short chunk read");
                }
                n
            };

            copy_into(buffer, chunk.buffer_pos, &scratch[..n])?;
            records.push(ChunkReadInfo {
                offset: chunk.buffer_pos,
                size: n as u64,
            });
        }
        Ok(records)
    }

    /// Fetch `chunks` into `buffer` with `workers` threads and check that
    /// together they filled it exactly.
    #[tracing::instrument(skip_all, fields(id = self.id, chunks = chunks.len(), workers = workers))]
    pub fn prefetch(&self, chunks: &[ChunkData], buffer: &mut [u8], workers: usize) -> Result<()> {
        let buffer_size = buffer.len() as u64;
        let worker_count = workers.clamp(1, chunks.len().max(1));
        let buffer = Mutex::new(buffer);
        let buffer = &buffer;

        let results: Vec<Result<Vec<ChunkReadInfo>>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..worker_count)
                .map(|worker_id| {
                    let worker = BatchWorker {
                        worker_id,
                        worker_count,
                        chunks,
                    };
                    scope.spawn(move || self.process_batch_chunks(&worker, buffer))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        });

        let mut records = Vec::with_capacity(chunks.len());
        for result in results {
            records.extend(result?);
        }
        check_holes(&records, buffer_size)
    }
}

fn copy_into(buffer: &Mutex<&mut [u8]>, pos: u64, data: &[u8]) -> Result<()> {
    let mut buffer = buffer.lock().unwrap_or_else(PoisonError::into_inner);
    let end = pos + data.len() as u64;
    if end > buffer.len() as u64 {
        exn::bail!(ErrorKind::SizeMismatch {
            expected: buffer.len() as u64,
            actual: end,
        });
    }
    buffer[pos as usize..end as usize].copy_from_slice(data);
    Ok(())
}

/// Check that `records` tile `0..buffer_size` exactly.
///
/// Fails with [`Overlap`](ErrorKind::Overlap) if two records share bytes,
/// [`Hole`](ErrorKind::Hole) if some bytes were never written, and
/// [`SizeMismatch`](ErrorKind::SizeMismatch) if the records run past the end.
pub fn check_holes(records: &[ChunkReadInfo], buffer_size: u64) -> Result<()> {
    let mut sorted = records.to_vec();
    sorted.sort_unstable();

    let mut covered = 0u64;
    for record in &sorted {
        if record.offset < covered {
            exn::bail!(ErrorKind::Overlap {
                offset: record.offset,
                end: covered,
            });
        }
        if record.offset > covered {
            exn::bail!(ErrorKind::Hole {
                offset: covered,
                size: record.offset - covered,
            });
        }
        covered = record.offset + record.size;
    }
    if covered < buffer_size {
        exn::bail!(ErrorKind::Hole {
            offset: covered,
            size: buffer_size - covered,
        });
    }
    if covered > buffer_size {
        exn::bail!(ErrorKind::SizeMismatch {
            expected: buffer_size,
            actual: covered,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockChunkedFile, make_file, mock_file, pseudo_random};
    use crate::verify::cache_key;
    use lazyblob_cache::BlobCache;
    use lazyblob_compress::Compression;
    use rstest::rstest;
    use std::sync::Arc;

    fn info(offset: u64, size: u64) -> ChunkReadInfo {
        ChunkReadInfo { offset, size }
    }

    #[rstest]
    #[case::empty(vec![], 0)]
    #[case::exact(vec![info(0, 4), info(4, 4)], 8)]
    #[case::unsorted(vec![info(8, 2), info(0, 4), info(4, 4)], 10)]
    fn test_check_holes_ok(#[case] records: Vec<ChunkReadInfo>, #[case] size: u64) {
        check_holes(&records, size).unwrap();
    }

    #[rstest]
    #[case::leading(vec![info(2, 2)], 4, ErrorKind::Hole { offset: 0, size: 2 })]
    #[case::middle(vec![info(0, 2), info(4, 2)], 6, ErrorKind::Hole { offset: 2, size: 2 })]
    #[case::trailing(vec![info(0, 2)], 4, ErrorKind::Hole { offset: 2, size: 2 })]
    #[case::nothing(vec![], 4, ErrorKind::Hole { offset: 0, size: 4 })]
    #[case::overlap(vec![info(0, 4), info(2, 4)], 6, ErrorKind::Overlap { offset: 2, end: 4 })]
    #[case::duplicate(vec![info(0, 4), info(0, 4)], 4, ErrorKind::Overlap { offset: 0, end: 4 })]
    #[case::overrun(vec![info(0, 6)], 4, ErrorKind::SizeMismatch { expected: 4, actual: 6 })]
    fn test_check_holes_fails(#[case] records: Vec<ChunkReadInfo>, #[case] size: u64, #[case] want: ErrorKind) {
        let err = check_holes(&records, size).unwrap_err();
        assert_eq!(*err, want);
    }

    #[rstest]
    #[case(10, 3)]
    #[case(3, 10)]
    #[case(100, 10)]
    #[case(7, 1)]
    fn test_every_chunk_assigned_once(#[case] chunk_count: usize, #[case] worker_count: usize) {
        let chunks: Vec<ChunkData> = (0..chunk_count as u64)
            .map(|i| ChunkData {
                offset: i,
                size: 1,
                digest: String::new(),
                buffer_pos: i,
            })
            .collect();
        let mut seen: Vec<u64> = (0..worker_count)
            .flat_map(|worker_id| {
                let worker = BatchWorker {
                    worker_id,
                    worker_count,
                    chunks: &chunks,
                };
                worker.assigned().map(|chunk| chunk.offset).collect::<Vec<_>>()
            })
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..chunk_count as u64).collect::<Vec<_>>());
    }

    const BUFFER_SIZE: u64 = 400 * 1024 * 1024;
    const CHUNK_SIZE: u64 = 4 * 1024 * 1024;
    const WORKER_COUNT: usize = 10;
    const TOTAL_CHUNKS: u64 = 100;

    fn normal_chunks() -> Vec<ChunkData> {
        (0..TOTAL_CHUNKS)
            .map(|i| ChunkData {
                offset: i * CHUNK_SIZE,
                size: CHUNK_SIZE,
                digest: format!("sha256:{i}"),
                buffer_pos: i * CHUNK_SIZE,
            })
            .collect()
    }

    /// Every tenth chunk gets a twin written over it, and a neighbour
    /// written two slots along.
    fn overlapping_chunks() -> Vec<ChunkData> {
        let mut chunks = normal_chunks();
        for i in (10..TOTAL_CHUNKS).step_by(10) {
            chunks.push(ChunkData {
                offset: i * CHUNK_SIZE - CHUNK_SIZE / 2,
                size: CHUNK_SIZE,
                digest: format!("sha256:overlap-{i}"),
                buffer_pos: i * CHUNK_SIZE,
            });
            if i < TOTAL_CHUNKS - 1 {
                chunks.push(ChunkData {
                    offset: (i + 1) * CHUNK_SIZE + CHUNK_SIZE / 2,
                    size: CHUNK_SIZE,
                    digest: format!("sha256:gap-{i}"),
                    buffer_pos: (i + 2) * CHUNK_SIZE,
                });
            }
        }
        chunks
    }

    /// Run the workers by hand, the way `prefetch` does, and audit the result.
    fn process_and_audit(file: &File, chunks: &[ChunkData], buffer: &mut [u8]) -> Result<()> {
        let buffer_size = buffer.len() as u64;
        let buffer = Mutex::new(buffer);
        let results: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = (0..WORKER_COUNT.min(chunks.len()))
                .map(|worker_id| {
                    let buffer = &buffer;
                    scope.spawn(move || {
                        let worker = BatchWorker {
                            worker_id,
                            worker_count: WORKER_COUNT,
                            chunks,
                        };
                        file.process_batch_chunks(&worker, buffer)
                    })
                })
                .collect();
            handles.into_iter().map(|handle| handle.join().unwrap()).collect()
        });
        let mut merged = Vec::new();
        for result in results {
            merged.extend(result.expect("processing batch chunks"));
        }
        check_holes(&merged, buffer_size)
    }

    /// The three scenarios share one 400 MiB buffer, so they run in sequence.
    #[test]
    fn test_process_batch_chunks_and_check_holes() {
        let mut buffer = vec![0u8; BUFFER_SIZE as usize];

        let file = mock_file(MockChunkedFile::new(CHUNK_SIZE as usize));
        process_and_audit(&file, &normal_chunks(), &mut buffer).unwrap();

        let file = mock_file(MockChunkedFile::new(CHUNK_SIZE as usize / 2));
        let err = process_and_audit(&file, &normal_chunks(), &mut buffer).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Hole { .. }), "{err:?}");

        let file = mock_file(MockChunkedFile::new(CHUNK_SIZE as usize));
        let err = process_and_audit(&file, &overlapping_chunks(), &mut buffer).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Overlap { .. }), "{err:?}");
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    #[case(16)]
    fn test_prefetch_real_chunks(#[case] workers: usize) {
        let contents = pseudo_random(100);
        let (reader, cache, id) = make_file(&contents, 7, Compression::Gzip);
        let file = reader.open_file(id).unwrap();

        // Fetch every other chunk, packed back to back.
        let mut chunks = Vec::new();
        let mut buffer_pos = 0;
        for offset in (0..100).step_by(14) {
            let entry = file.chunk_entry_for_offset(offset).unwrap();
            chunks.push(ChunkData {
                offset: entry.offset,
                size: entry.size,
                digest: entry.digest,
                buffer_pos,
            });
            buffer_pos += entry.size;
        }
        let mut buffer = vec![0u8; buffer_pos as usize];
        file.prefetch(&chunks, &mut buffer, workers).unwrap();

        for chunk in &chunks {
            let got = &buffer[chunk.buffer_pos as usize..(chunk.buffer_pos + chunk.size) as usize];
            assert_eq!(got, &contents[chunk.offset as usize..(chunk.offset + chunk.size) as usize]);
        }
        assert_eq!(cache.len(), chunks.len());

        // A second pass is served from the cache.
        let mut again = vec![0u8; buffer.len()];
        let source_free = File::new(id, Box::new(MockChunkedFile::new(0)), Arc::clone(&reader.shared));
        source_free.prefetch(&chunks, &mut again, workers).unwrap();
        assert_eq!(again, buffer);
    }

    #[test]
    fn test_prefetch_fails_on_bad_chunk() {
        let (reader, cache, id) = make_file(b"0123456789", 2, Compression::None);
        let file = reader.open_file(id).unwrap();
        let chunks: Vec<ChunkData> = (0..5)
            .map(|i| ChunkData {
                offset: i * 2,
                size: 2,
                digest: match i {
                    3 => format!("sha256:{}", "0".repeat(64)),
                    _ => file.chunk_entry_for_offset(i * 2).unwrap().digest,
                },
                buffer_pos: i * 2,
            })
            .collect();
        let mut buffer = [0u8; 10];
        let err = file.prefetch(&chunks, &mut buffer, 2).unwrap_err();
        assert!(matches!(&*err, ErrorKind::ChunkDigestMismatch { offset: 6, .. }), "{err:?}");
        assert!(!cache.contains(&cache_key(reader.metadata().toc_digest(), id, 6, 2)).unwrap());
    }
}

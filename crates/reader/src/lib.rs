//! Verifying, chunk-caching random-access reads of lazyblob archives.
//!
//! # Architecture
//! - [`VerifiableReader`] owns an archive's metadata store and chunk cache.
//!   It makes the trust decision ([`verify_toc`](VerifiableReader::verify_toc)
//!   or [`skip_verify`](VerifiableReader::skip_verify)) and can warm the
//!   cache for the whole archive in the background
//!   ([`cache`](VerifiableReader::cache)), even before that decision.
//! - [`Reader`] is handed out by the trust decision and opens [`File`]s.
//! - [`File::read_at`] maps a byte range onto chunks, serves what it can from
//!   the cache and fetches, verifies and caches the rest. Several missing
//!   chunks are fetched in parallel through the [`batch`] prefetcher.
//!
//! Verification only ever goes through the [`VerifierFactory`] interface, so
//! the digest algorithm (or a test stub) is chosen by whoever builds the
//! reader.
//!
//! Chunk verification failures seen by background caching *before* the
//! trust decision can't be reported by `cache` itself; the first one is
//! latched and makes the next `verify_toc` fail instead.

pub mod batch;
pub mod error;
mod file;
mod reader;
mod state;
#[cfg(test)]
mod testutil;
mod verify;

pub use crate::batch::{BatchWorker, ChunkData, ChunkReadInfo, check_holes};
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::file::File;
pub use crate::reader::{CacheOptions, Reader, VerifiableReader};
pub use crate::state::VerifyState;
pub use crate::verify::{ChunkVerifier, DigestVerifierFactory, VerifierFactory, VerifierHandle, cache_key};

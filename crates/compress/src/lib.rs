//! Chunk frame compression.
//!
//! Every chunk of a lazyblob archive is stored as an independent compressed
//! frame so that any single chunk can be decompressed without touching its
//! neighbours. This crate wraps the supported codecs behind a unified
//! [`Compression`] enum, providing:
//!
//! - **Name parsing** for the TOC's `compression` field ([`Compression::as_str`]
//!   and its [`FromStr`](std::str::FromStr) counterpart)
//! - **Frame sniffing** from magic bytes ([`Compression::from_magic_bytes`],
//!   [`Compression::check_magic_bytes`])
//! - **Whole-frame** compression/decompression ([`Compression::compress`],
//!   [`Compression::decompress`], [`Compression::decompress_exact`])
//! - **Streaming** via a wrapped reader ([`Compression::wrap_reader`])
//!
//! Gzip is always available. Zstd is behind the (default) `zstd` feature.
//!
//! Frames are decompressed on the read path, so the fastest level of each
//! codec is used when compressing.

pub mod error;
mod format;
mod ops;

/// A supported chunk frame compression format.
///
/// Defaults to [`None`](Self::None) (frames stored verbatim).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Compression {
    /// Uncompressed
    #[default]
    None,
    /// Gzip compression
    Gzip,
    /// Zstd compression
    #[cfg(feature = "zstd")]
    Zstd,
}

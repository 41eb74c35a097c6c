//! Format names and frame sniffing.

use crate::Compression;
use crate::error::{Error, ErrorKind};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

/// Leading bytes of a frame in each compressed format.
const MAGIC: &[(Compression, &[u8])] = &[
    (Compression::Gzip, &[0x1F, 0x8B]),
    #[cfg(feature = "zstd")]
    (Compression::Zstd, &[0x28, 0xB5, 0x2F, 0xFD]),
];

impl Compression {
    /// The name recorded in a TOC's `compression` field.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            #[cfg(feature = "zstd")]
            Compression::Zstd => "zstd",
        }
    }

    /// Guess a frame's format from its leading bytes.
    ///
    /// Anything unrecognised, including input too short to tell, is
    /// [`None`](Self::None).
    #[must_use]
    pub fn from_magic_bytes(frame: &[u8]) -> Self {
        MAGIC
            .iter()
            .find(|(_, magic)| frame.starts_with(magic))
            .map_or(Compression::None, |(format, _)| *format)
    }

    /// Whether `frame` could be a frame of this format.
    ///
    /// Uncompressed frames can start with any bytes at all, so they always pass.
    #[must_use]
    pub fn check_magic_bytes(&self, frame: &[u8]) -> bool {
        match self {
            Compression::None => true,
            format => Self::from_magic_bytes(frame) == *format,
        }
    }
}

impl FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "none" | "" => Compression::None,
            "gzip" | "gz" => Compression::Gzip,
            #[cfg(feature = "zstd")]
            "zstd" | "zst" => Compression::Zstd,
            #[cfg(not(feature = "zstd"))]
            "zstd" | "zst" => exn::bail!(ErrorKind::DisabledFormat(s.to_string())),
            _ => exn::bail!(ErrorKind::UnsupportedFormat(s.to_string())),
        })
    }
}

impl Display for Compression {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

//! TOC and footer encoding.

use crate::error::{ErrorKind, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Only supported TOC version.
pub const TOC_VERSION: u32 = 1;
pub const FOOTER_MAGIC: &[u8; 8] = b"LZBTOC01";
pub const FOOTER_SIZE: usize = 16;

/// Table of contents stored near the end of every blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toc {
    pub version: u32,
    /// Name of the frame compression (see [`lazyblob_compress::Compression`]).
    pub compression: String,
    pub entries: Vec<TocEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TocEntry {
    /// Slash-separated path relative to the archive root.
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub mode: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<TocChunk>,
}

/// One chunk of a regular file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TocChunk {
    /// Offset within the file's uncompressed contents.
    pub offset: u64,
    /// Uncompressed size.
    pub size: u64,
    /// Offset of the compressed frame within the blob.
    pub blob_offset: u64,
    /// Size of the compressed frame.
    pub blob_size: u64,
    /// Digest of the uncompressed chunk (`algorithm:hex`).
    pub digest: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    #[serde(rename = "dir")]
    Directory,
    #[serde(rename = "reg")]
    Regular,
    #[serde(rename = "symlink")]
    Symlink,
}

/// Encode the footer pointing at a TOC starting at `toc_offset`.
pub fn encode_footer(toc_offset: u64) -> [u8; FOOTER_SIZE] {
    let mut footer = [0u8; FOOTER_SIZE];
    footer[..8].copy_from_slice(FOOTER_MAGIC);
    footer[8..].copy_from_slice(&toc_offset.to_le_bytes());
    footer
}

/// Decode a footer, returning the TOC offset it points at.
pub fn parse_footer(footer: &[u8]) -> Result<u64> {
    if footer.len() != FOOTER_SIZE || &footer[..8] != FOOTER_MAGIC {
        exn::bail!(ErrorKind::InvalidFooter);
    }
    let mut offset = [0u8; 8];
    offset.copy_from_slice(&footer[8..]);
    Ok(u64::from_le_bytes(offset))
}

/// `sha256:` digest of arbitrary bytes, formatted the way the TOC records it.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0)]
    #[case(16)]
    #[case(u64::MAX)]
    fn test_footer(#[case] offset: u64) {
        let footer = encode_footer(offset);
        assert_eq!(&footer[..8], FOOTER_MAGIC);
        assert_eq!(parse_footer(&footer).unwrap(), offset);
    }

    #[rstest]
    #[case(b"LZBTOC0".as_slice())]
    #[case(b"NOTATOC1\0\0\0\0\0\0\0\0".as_slice())]
    #[case(b"".as_slice())]
    fn test_bad_footer(#[case] footer: &[u8]) {
        let err = parse_footer(footer).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidFooter));
    }

    #[test]
    fn test_sha256_digest() {
        assert_eq!(
            sha256_digest(b""),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_entry_json_shape() {
        let entry = TocEntry {
            name: "foo/bar".to_string(),
            kind: EntryKind::Regular,
            size: 3,
            mode: 0o644,
            link_name: None,
            chunks: vec![TocChunk {
                offset: 0,
                size: 3,
                blob_offset: 0,
                blob_size: 3,
                digest: sha256_digest(b"abc"),
            }],
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["type"], "reg");
        assert!(value.get("link_name").is_none());
        assert_eq!(value["chunks"][0]["blob_size"], 3);

        let dir: TocEntry = serde_json::from_str(r#"{"name":"foo/","type":"dir"}"#).unwrap();
        assert_eq!(dir.kind, EntryKind::Directory);
        assert!(dir.chunks.is_empty());
    }
}

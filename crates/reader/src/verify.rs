//! Chunk verification.
//!
//! The reader only ever talks to a [`VerifierFactory`]: it asks for a
//! [`ChunkVerifier`] per chunk, streams the chunk's bytes into it and asks
//! whether they matched. Which algorithm is used, or whether anything is
//! hashed at all, is the factory's business.

use crate::error::{ErrorKind, Result};
use sha2::{Digest, Sha256};
use std::sync::Arc;

pub type VerifierHandle = Arc<dyn VerifierFactory>;

/// Write-through digest check for one chunk.
pub trait ChunkVerifier: Send {
    /// Feed the next run of chunk bytes.
    fn write(&mut self, data: &[u8]);

    /// Whether everything written so far matches the expected digest.
    fn verified(&self) -> bool;
}

/// Creates a [`ChunkVerifier`] for a chunk of inode `id` recorded with
/// `digest`.
pub trait VerifierFactory: Send + Sync {
    /// # Errors
    ///
    /// [`VerifierUnavailable`](ErrorKind::VerifierUnavailable) when the digest
    /// can't be checked.
    fn verifier(&self, id: u32, digest: &str) -> Result<Box<dyn ChunkVerifier>>;
}

/// Verifies `algorithm:hex` digests. Supports `sha256` and `blake3`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DigestVerifierFactory;

impl VerifierFactory for DigestVerifierFactory {
    fn verifier(&self, _id: u32, digest: &str) -> Result<Box<dyn ChunkVerifier>> {
        let unavailable = || ErrorKind::VerifierUnavailable(digest.to_string());
        let Some((algorithm, hex)) = digest.split_once(':') else {
            exn::bail!(unavailable());
        };
        let hasher = match algorithm {
            "sha256" => Hasher::Sha256(Sha256::new()),
            "blake3" => Hasher::Blake3(Box::new(blake3::Hasher::new())),
            _ => exn::bail!(unavailable()),
        };
        // Both algorithms produce 32-byte digests.
        if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            exn::bail!(unavailable());
        }
        Ok(Box::new(DigestVerifier {
            hasher,
            expected: hex.to_ascii_lowercase(),
        }))
    }
}

enum Hasher {
    Sha256(Sha256),
    Blake3(Box<blake3::Hasher>),
}

struct DigestVerifier {
    hasher: Hasher,
    expected: String,
}

impl ChunkVerifier for DigestVerifier {
    fn write(&mut self, data: &[u8]) {
        match &mut self.hasher {
            Hasher::Sha256(hasher) => hasher.update(data),
            Hasher::Blake3(hasher) => {
                hasher.update(data);
            },
        }
    }

    fn verified(&self) -> bool {
        let actual = match &self.hasher {
            Hasher::Sha256(hasher) => format!("{:x}", hasher.clone().finalize()),
            Hasher::Blake3(hasher) => hasher.finalize().to_hex().to_string(),
        };
        actual == self.expected
    }
}

/// Cache key for a chunk of the archive whose TOC digest is `toc_digest`.
///
/// A pure function of the chunk's identity, so every reader of the same
/// archive agrees on where a chunk lives in a shared cache, and readers of
/// different archives never collide.
pub fn cache_key(toc_digest: &str, id: u32, offset: u64, size: u64) -> String {
    blake3::hash(format!("{toc_digest}-{id}-{offset}-{size}").as_bytes()).to_hex().to_string()
}

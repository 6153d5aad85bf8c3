//! Fingerprint functions: short digest, full digest and byte-exact comparison.
//!
//! # Overview
//!
//! - [`Fingerprinter::short_digest`]: BLAKE3 over at most the first
//!   [`SHORT_DIGEST_BYTES`] bytes, tagged with [`SHORT_DIGEST_PREFIX`]
//! - [`Fingerprinter::full_digest`]: SHA-256 over the entire file, streamed in
//!   fixed-size chunks
//! - [`bytes_equal`]: chunked byte comparison of two files
//!
//! A file that cannot be opened or read produces [`Digest::NotFound`]
//! instead of an error. The sentinel never matches any digest.

use std::fmt;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest as _, Sha256};

use super::HashError;
use crate::store::FileStore;

/// Number of leading bytes covered by the short digest.
pub const SHORT_DIGEST_BYTES: usize = 1024;

/// Prefix of every short digest.
pub const SHORT_DIGEST_PREFIX: &str = "s-";

/// Stored representation of [`Digest::NotFound`].
pub const NOT_FOUND: &str = "not_found";

/// Chunk size for streaming reads (64 KiB).
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Result of fingerprinting a file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Digest {
    /// Hex digest, possibly carrying the short-digest prefix.
    Value(String),
    /// The file vanished or could not be read.
    NotFound,
}

impl Digest {
    /// Decode a stored digest column. The empty string means "no digest".
    #[must_use]
    pub fn from_stored(value: &str) -> Option<Self> {
        match value {
            "" => None,
            NOT_FOUND => Some(Self::NotFound),
            other => Some(Self::Value(other.to_string())),
        }
    }

    /// String form written to the index.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Value(v) => v,
            Self::NotFound => NOT_FOUND,
        }
    }

    /// Whether this is the vanished-file sentinel.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    /// Whether this is a short digest.
    #[must_use]
    pub fn is_short(&self) -> bool {
        matches!(self, Self::Value(v) if v.starts_with(SHORT_DIGEST_PREFIX))
    }

    /// Grouping equality. `NotFound` matches nothing, not even itself.
    #[must_use]
    pub fn matches(&self, other: &Digest) -> bool {
        match (self, other) {
            (Self::Value(a), Self::Value(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of short and full digests.
///
/// [`Hasher`] is the production implementation. Tests substitute their own to
/// simulate collisions.
pub trait Fingerprinter: Send + Sync {
    /// Digest of the first [`SHORT_DIGEST_BYTES`] bytes.
    fn short_digest(&self, store: &dyn FileStore, path: &Path) -> Digest;

    /// Digest of the whole file.
    fn full_digest(&self, store: &dyn FileStore, path: &Path) -> Digest;
}

/// BLAKE3 short digests and SHA-256 full digests.
#[derive(Debug, Clone)]
pub struct Hasher {
    chunk_size: usize,
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher {
    /// Create a hasher with the default chunk size.
    #[must_use]
    pub fn new() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
        }
    }

    /// Override the streaming chunk size (minimum 1 byte).
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Short digest, surfacing the I/O error instead of the sentinel.
    ///
    /// # Errors
    ///
    /// Returns [`HashError`] if the file cannot be opened or read.
    pub fn try_short_digest(&self, store: &dyn FileStore, path: &Path) -> Result<String, HashError> {
        let mut reader = store.open(path).map_err(|e| HashError::from_io(path, e))?;
        let mut buf = [0u8; SHORT_DIGEST_BYTES];
        let n = read_full(&mut reader, &mut buf).map_err(|e| HashError::from_io(path, e))?;
        let hash = blake3::hash(&buf[..n]);
        Ok(format!("{SHORT_DIGEST_PREFIX}{}", hash.to_hex()))
    }

    /// Full digest, surfacing the I/O error instead of the sentinel.
    ///
    /// # Errors
    ///
    /// Returns [`HashError`] if the file cannot be opened or read.
    pub fn try_full_digest(&self, store: &dyn FileStore, path: &Path) -> Result<String, HashError> {
        let mut reader = store.open(path).map_err(|e| HashError::from_io(path, e))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(HashError::from_io(path, e)),
            };
            hasher.update(&buf[..n]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }
}

impl Fingerprinter for Hasher {
    fn short_digest(&self, store: &dyn FileStore, path: &Path) -> Digest {
        sentinel(self.try_short_digest(store, path))
    }

    fn full_digest(&self, store: &dyn FileStore, path: &Path) -> Digest {
        sentinel(self.try_full_digest(store, path))
    }
}

fn sentinel(result: Result<String, HashError>) -> Digest {
    match result {
        Ok(hex) => Digest::Value(hex),
        Err(e @ HashError::NotFound(_)) => {
            log::debug!("{e}");
            Digest::NotFound
        }
        Err(e) => {
            log::warn!("{e}");
            Digest::NotFound
        }
    }
}

/// Byte-exact comparison of two files.
///
/// Sizes are compared first; then both files are streamed in
/// [`CHUNK_SIZE`] chunks. Any I/O failure counts as "not equal".
#[must_use]
pub fn bytes_equal(store: &dyn FileStore, a: &Path, b: &Path) -> bool {
    match try_bytes_equal(store, a, b) {
        Ok(equal) => equal,
        Err(e) => {
            log::debug!(
                "Byte comparison of {} and {} failed: {}",
                a.display(),
                b.display(),
                e
            );
            false
        }
    }
}

fn try_bytes_equal(store: &dyn FileStore, a: &Path, b: &Path) -> io::Result<bool> {
    if store.stat(a)? != store.stat(b)? {
        return Ok(false);
    }

    let mut left = store.open(a)?;
    let mut right = store.open(b)?;
    let mut left_buf = vec![0u8; CHUNK_SIZE];
    let mut right_buf = vec![0u8; CHUNK_SIZE];

    loop {
        let n = read_full(&mut left, &mut left_buf)?;
        let m = read_full(&mut right, &mut right_buf)?;
        if n != m || left_buf[..n] != right_buf[..m] {
            return Ok(false);
        }
        if n < CHUNK_SIZE {
            return Ok(true);
        }
    }
}

/// Fill `buf` as far as the reader allows, returning the byte count.
fn read_full(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

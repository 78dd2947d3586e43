//! BLAKE2b-256 hashing utilities for Trellis
//!
//! All hashing in Trellis uses BLAKE2b with 256-bit output. Hashes are
//! computed over a vector of parts where each part is raw bytes or a 64-bit
//! big-endian primitive; an absent part contributes zero bytes. Callers are
//! responsible for delimiting parts (Trellis callers delimit by field
//! index), so distinct part vectors must never concatenate identically.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};

type Blake2b256 = Blake2b<U32>;

/// One input part of a hash computation
#[derive(Clone, Copy, Debug)]
pub enum HashPart<'a> {
    /// Raw bytes, appended verbatim
    Bytes(&'a [u8]),
    /// 64-bit unsigned primitive, appended big-endian
    U64(u64),
    /// Absent value, contributes zero bytes
    None,
}

/// Hash a part vector with BLAKE2b-256
pub fn hash_parts(parts: &[HashPart<'_>]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    for part in parts {
        match part {
            HashPart::Bytes(bytes) => hasher.update(bytes),
            HashPart::U64(value) => hasher.update(value.to_be_bytes()),
            HashPart::None => {}
        }
    }
    hasher.finalize().into()
}

/// Hash a single byte slice with BLAKE2b-256
pub fn hash_bytes(data: &[u8]) -> [u8; 32] {
    hash_parts(&[HashPart::Bytes(data)])
}

/// Incremental hasher for large data (blob finalization)
pub struct Hasher {
    inner: Blake2b256,
}

impl Hasher {
    /// Create a new incremental hasher
    pub fn new() -> Self {
        Self {
            inner: Blake2b256::new(),
        }
    }

    /// Update with data
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Finalize and get the 256-bit digest
    pub fn finalize(self) -> [u8; 32] {
        self.inner.finalize().into()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

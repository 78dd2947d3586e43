//! # Trellis Crypto
//!
//! Cryptographic primitives for the Trellis node graph:
//! - BLAKE2b-256 hashing over delimited part vectors
//! - Proof-of-work nonce solving with the consensus hex-threshold rule
//! - Ed25519 keypairs, detached signatures, multi-signature packing
//!
//! All digests in Trellis are BLAKE2b with 256-bit output. The digest and
//! the proof-of-work comparison are consensus-critical: two implementations
//! must produce identical bytes for identical semantic inputs.

pub mod error;
pub mod hash;
pub mod keys;
pub mod sig;
pub mod work;

pub use error::{CryptoError, Result};
pub use hash::{hash_bytes, hash_parts, HashPart, Hasher};
pub use keys::{verify as verify_signature, KeyPair};
pub use sig::{pack_entry, unpack_entries, SignatureEntry, SIGNATURE_ENTRY_SIZE};
pub use work::{make_threshold, solve, verify as verify_work, NONCE_SIZE};

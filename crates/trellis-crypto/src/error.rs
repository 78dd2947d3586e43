//! Error types for Trellis crypto operations

use thiserror::Error;

/// Result type alias for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Errors that can occur in Trellis crypto operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    // === Key Handling ===
    /// Public key bytes do not decode to a valid curve point
    #[error("Invalid ed25519 public key")]
    InvalidPublicKey,

    // === Signature Packing ===
    /// Packed signature buffer is not a multiple of the entry size
    #[error("Signature buffer length {0} is not a multiple of 65")]
    MalformedSignatureBuffer(usize),
}

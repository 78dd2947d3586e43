//! Error types for node construction, signing, and validation

use thiserror::Error;
use trellis_crypto::CryptoError;
use trellis_model::ModelError;

/// Result type alias for node operations
pub type Result<T> = std::result::Result<T, NodeError>;

/// A validation refusal: the reason is user-facing text
///
/// `validate()` is a pure predicate - it never panics, and the reason string
/// is surfaced verbatim to callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Errors that can occur in node operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    // === Codec ===
    /// Underlying model codec error
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    /// Image header does not name a known node or certificate type
    #[error("Unknown model type: {0}")]
    UnknownModelType(String),

    // === Crypto ===
    /// Underlying crypto error
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Signer public key is not in the eligible-signer set at the index
    #[error("Signer at index {0} is not eligible")]
    SignerNotEligible(u8),

    // === Lifecycle ===
    /// Operation requires a field that is not set
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    /// Validation refusal
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// License extension refused (exhausted, cycle, or missing target)
    #[error("License cannot be extended: {0}")]
    ExtensionRefused(&'static str),

    /// Friend certificate pairing failed
    #[error("Friend cert mismatch: {0}")]
    FriendCertMismatch(&'static str),

    /// Proof-of-work search failed to find a valid nonce at the given difficulty
    #[error("No valid nonce found at difficulty {0}")]
    NoNonceFound(u8),
}

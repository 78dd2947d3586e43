//! Error types for the model codec

use thiserror::Error;

/// Result type alias for model operations
pub type Result<T> = std::result::Result<T, ModelError>;

/// Errors that can occur encoding, decoding, or mutating a Model
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    // === Schema ===
    /// Two field definitions share a numeric index
    #[error("Duplicate field index {index} ({existing} vs {incoming})")]
    DuplicateFieldIndex {
        index: u8,
        existing: &'static str,
        incoming: &'static str,
    },

    /// Field name not present in the schema
    #[error("No such field: {0}")]
    NoSuchField(String),

    // === Write Path ===
    /// Value exceeds the field's maximum size
    #[error("Field {name} exceeds max size: {len} > {max}")]
    ExceedsMaxSize { name: String, max: usize, len: usize },

    /// Field is disabled in this schema
    #[error("Field {0} is disabled")]
    DisabledField(String),

    /// Value kind or width does not match the field type
    #[error("Type mismatch for field {0}")]
    TypeMismatch(String),

    // === Decode Path ===
    /// Image ended before the declared value
    #[error("Short read at byte {0}")]
    ShortRead(usize),

    /// Field indices not strictly ascending
    #[error("Field index {0} out of order")]
    FieldOutOfOrder(u8),

    /// Field index not present in the schema
    #[error("Unknown field index {0}")]
    UnknownField(u8),

    /// Image header does not match the schema's model type
    #[error("Header mismatch: expected {expected}, got {got}")]
    HeaderMismatch { expected: String, got: String },
}

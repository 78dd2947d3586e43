//! # Trellis Model
//!
//! Tagged binary serialization of fixed-schema records.
//!
//! Every on-wire artifact in Trellis (node, certificate) is a Model: a
//! 6-byte type header followed by a sparse, index-addressed list of fields
//! in strictly ascending index order. The encoding is consensus-critical -
//! a digest computed by any implementation must match on identical semantic
//! inputs - so the codec is hand-rolled rather than derived.
//!
//! Header bytes: `[0, primary-interface, 0, secondary-interface, class,
//! class-major-version]`. Minor/patch versions are code-level only.

pub mod error;
pub mod filter;
pub mod model;
pub mod schema;

pub use error::{ModelError, Result};
pub use filter::{Cmp, Filter, FilterValue};
pub use model::{Model, Value};
pub use schema::{FieldDef, FieldType, ModelType, Schema};

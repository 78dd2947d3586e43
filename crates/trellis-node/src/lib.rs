//! # Trellis Node
//!
//! The node family of the Trellis graph: the shared node base, the concrete
//! Data and License kinds, and the certificate family that can sign them.
//!
//! A node is an immutable signed record. Its identity is derived from its
//! content:
//!
//! ```text
//! hash0 = H(hashable fields)          // signature, nonce, id1, id2 exempt
//! hash1 = H(hash0, nonce)
//! hash  = H(hash1, id2)
//! id1   = H(hash, signature)
//! id2   = H(hash1, owner, network)    // online-validated nodes only
//! id    = id2 if set, else id1
//! ```
//!
//! Nodes are built in memory, optionally work-solved, signed (which pins
//! `id1`), then persisted. After persistence only the transient bits may
//! change.

pub mod base;
pub mod cert;
pub mod data;
pub mod error;
pub mod license;
pub mod node;
pub mod schema;

pub use base::{NodeBase, ValidateLevel};
pub use cert::{FriendCert, SignCert, TargetParams};
pub use data::DataNode;
pub use error::{NodeError, Result, ValidationError};
pub use license::LicenseNode;
pub use node::Node;
pub use schema::{config_bits, license_config_bits, transient_bits, MAX_LICENSE_DISTANCE};

//! The tagged node variant
//!
//! Dispatch over the concrete node kinds. The wire image's secondary
//! interface byte selects the kind; unknown headers are rejected at the
//! load boundary.

use crate::base::{NodeBase, ValidateLevel};
use crate::data::DataNode;
use crate::error::{NodeError, Result, ValidationError};
use crate::license::LicenseNode;
use crate::schema::{PRIMARY_NODE, SECONDARY_DATA, SECONDARY_LICENSE};

/// A node of any kind
#[derive(Clone, Debug)]
pub enum Node {
    Data(DataNode),
    License(LicenseNode),
}

impl Node {
    /// Load a node from a wire image, dispatching on the header
    pub fn load(image: &[u8], preserve_transient: bool) -> Result<Self> {
        if image.len() < 6 {
            return Err(NodeError::UnknownModelType(hex::encode(image)));
        }
        if image[0] != 0 || image[1] != PRIMARY_NODE {
            return Err(NodeError::UnknownModelType(hex::encode(&image[..6])));
        }
        match image[3] {
            SECONDARY_DATA => Ok(Node::Data(DataNode::load(image, preserve_transient)?)),
            SECONDARY_LICENSE => Ok(Node::License(LicenseNode::load(
                image,
                preserve_transient,
            )?)),
            _ => Err(NodeError::UnknownModelType(hex::encode(&image[..6]))),
        }
    }

    pub fn base(&self) -> &NodeBase {
        match self {
            Node::Data(node) => node.base(),
            Node::License(node) => node.base(),
        }
    }

    pub fn base_mut(&mut self) -> &mut NodeBase {
        match self {
            Node::Data(node) => node.base_mut(),
            Node::License(node) => node.base_mut(),
        }
    }

    pub fn as_data(&self) -> Option<&DataNode> {
        match self {
            Node::Data(node) => Some(node),
            _ => None,
        }
    }

    pub fn as_license(&self) -> Option<&LicenseNode> {
        match self {
            Node::License(node) => Some(node),
            _ => None,
        }
    }

    /// Export the wire image
    pub fn export(&self, include_transient: bool) -> Result<Vec<u8>> {
        self.base().export(include_transient)
    }

    /// Validate at the requested depth; pure predicate
    pub fn validate(
        &self,
        level: ValidateLevel,
        at_time: Option<u64>,
    ) -> std::result::Result<(), ValidationError> {
        match self {
            Node::Data(node) => node.validate(level, at_time),
            Node::License(node) => node.validate(level, at_time),
        }
    }

    /// Achilles hashes this node emits
    pub fn achilles_hashes(&self) -> Vec<[u8; 32]> {
        match self {
            Node::Data(node) => node.base().achilles_hashes(),
            Node::License(node) => node.achilles_hashes(),
        }
    }

    /// Destroy hashes this node emits (destruction markers only)
    pub fn destroy_hashes(&self) -> Vec<[u8; 32]> {
        match self {
            Node::Data(node) => node.destroy_hashes(),
            Node::License(_) => Vec::new(),
        }
    }

    pub fn is_destroyer(&self) -> bool {
        match self {
            Node::Data(node) => node.is_destroyer(),
            Node::License(_) => false,
        }
    }

    /// Stored licensee hashes (licenses only)
    pub fn licensee_hashes(&self) -> Vec<[u8; 32]> {
        match self {
            Node::Data(_) => Vec::new(),
            Node::License(node) => node.licensee_hashes(),
        }
    }
}

impl From<DataNode> for Node {
    fn from(node: DataNode) -> Self {
        Node::Data(node)
    }
}

impl From<LicenseNode> for Node {
    fn from(node: LicenseNode) -> Self {
        Node::License(node)
    }
}

//! Data nodes - the graph's content carriers
//!
//! A Data node carries a content type, an optional inline payload, and
//! optionally references a blob by hash and length. Destruction markers are
//! Data nodes with the destroy content type and `refId` naming the target.

use std::sync::Arc;

use trellis_crypto::{hash_parts, HashPart};
use trellis_model::Model;

use crate::base::{NodeBase, ValidateLevel};
use crate::error::{Result, ValidationError};
use crate::node::Node;
use crate::schema::{self, field, tags, DESTROY_ALL_CONTENT_TYPE, DESTROY_CONTENT_TYPE};

/// A Data node
#[derive(Clone, Debug)]
pub struct DataNode {
    base: NodeBase,
}

impl DataNode {
    /// Create an empty Data node
    pub fn new() -> Result<Self> {
        let schema = Arc::new(schema::data_schema()?);
        Ok(Self {
            base: NodeBase::new(Model::new(schema))?,
        })
    }

    /// Load from a wire image
    pub fn load(image: &[u8], preserve_transient: bool) -> Result<Self> {
        let schema = Arc::new(schema::data_schema()?);
        Ok(Self {
            base: NodeBase::from_loaded(Model::load(schema, image, preserve_transient)?)?,
        })
    }

    pub fn base(&self) -> &NodeBase {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut NodeBase {
        &mut self.base
    }

    pub fn content_type(&self) -> Option<&str> {
        self.base.model().get_text(field::CONTENT_TYPE)
    }

    pub fn set_content_type(&mut self, content_type: &str) -> Result<()> {
        Ok(self
            .base
            .model_mut()
            .set_text(field::CONTENT_TYPE, content_type)?)
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.base.model().get_bytes(field::DATA)
    }

    pub fn set_data(&mut self, data: &[u8]) -> Result<()> {
        Ok(self.base.model_mut().set_bytes(field::DATA, data)?)
    }

    // === Destruction markers ===

    /// Whether this node is a destruction marker
    pub fn is_destroyer(&self) -> bool {
        match self.content_type() {
            Some(DESTROY_CONTENT_TYPE) => self.base.ref_id().is_some(),
            Some(DESTROY_ALL_CONTENT_TYPE) => true,
            _ => false,
        }
    }

    /// Destroy hashes this marker emits
    ///
    /// Computed from the marker's own owner, so only the owner's key can
    /// mint a pair matching a target's achilles hashes.
    pub fn destroy_hashes(&self) -> Vec<[u8; 32]> {
        let owner = match self.base.owner() {
            Some(owner) => owner,
            None => return Vec::new(),
        };
        match self.content_type() {
            Some(DESTROY_CONTENT_TYPE) => match self.base.ref_id() {
                Some(target) => vec![hash_parts(&[
                    HashPart::Bytes(tags::ACHILLES_ID),
                    HashPart::Bytes(&owner),
                    HashPart::Bytes(&target),
                ])],
                None => Vec::new(),
            },
            Some(DESTROY_ALL_CONTENT_TYPE) => vec![hash_parts(&[
                HashPart::Bytes(tags::ACHILLES_OWNER),
                HashPart::Bytes(&owner),
            ])],
            _ => Vec::new(),
        }
    }

    /// Validate this node
    ///
    /// Runs the common sequence, then recursively validates the embedded
    /// model when a deep level is requested.
    pub fn validate(
        &self,
        level: ValidateLevel,
        at_time: Option<u64>,
    ) -> std::result::Result<(), ValidationError> {
        self.base.validate_common(level, at_time)?;

        if level != ValidateLevel::Structural {
            if let Some(image) = self.base.embedded_image() {
                let embedded = Node::load(image, false).map_err(|err| {
                    ValidationError::new(format!("Embedded model does not decode: {err}"))
                })?;
                self.base.validate_embedding(embedded.base())?;
                embedded.validate(level, at_time)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::config_bits;
    use trellis_crypto::KeyPair;

    fn signed_node(keypair: &KeyPair) -> DataNode {
        let mut node = DataNode::new().unwrap();
        node.base_mut().set_parent_id(&[0x0B; 32]).unwrap();
        node.base_mut().set_owner(&keypair.public_key()).unwrap();
        node.base_mut().set_creation_time(1_000_000).unwrap();
        node.base_mut().set_expire_time(1_010_000).unwrap();
        node.set_content_type("app/message").unwrap();
        node.set_data(b"hello graph").unwrap();
        node.base_mut().sign(keypair).unwrap();
        node
    }

    #[test]
    fn test_sign_solve_verify_lifecycle() {
        let keypair = KeyPair::generate();
        let mut node = DataNode::new().unwrap();
        node.base_mut().set_parent_id(&[0x0B; 32]).unwrap();
        node.base_mut().set_owner(&keypair.public_key()).unwrap();
        node.base_mut().set_creation_time(1_000_000).unwrap();
        node.base_mut().set_expire_time(1_010_000).unwrap();
        node.base_mut().set_difficulty(3).unwrap();
        node.base_mut().solve_work().unwrap();
        node.base_mut().sign(&keypair).unwrap();

        assert!(node.base().id1().is_some());
        assert!(node.base().verify());
        assert!(node.base().verify_work());
        assert!(node.validate(ValidateLevel::Full, Some(1_005_000)).is_ok());
    }

    #[test]
    fn test_roundtrip_preserves_identity() {
        let keypair = KeyPair::generate();
        let node = signed_node(&keypair);

        let image = node.base().export(false).unwrap();
        let loaded = DataNode::load(&image, false).unwrap();
        assert_eq!(loaded.base().id1(), node.base().id1());
        assert_eq!(loaded.content_type(), Some("app/message"));
        assert!(loaded.base().verify());
    }

    #[test]
    fn test_destroyer_hashes_match_target_achilles() {
        let keypair = KeyPair::generate();
        let target = signed_node(&keypair);
        let target_id1 = target.base().id1().unwrap();

        let mut destroyer = DataNode::new().unwrap();
        destroyer.base_mut().set_parent_id(&[0x0B; 32]).unwrap();
        destroyer
            .base_mut()
            .set_owner(&keypair.public_key())
            .unwrap();
        destroyer.base_mut().set_creation_time(1_000_100).unwrap();
        destroyer.set_content_type(DESTROY_CONTENT_TYPE).unwrap();
        destroyer.base_mut().set_ref_id(&target_id1).unwrap();
        destroyer.base_mut().sign(&keypair).unwrap();

        assert!(destroyer.is_destroyer());
        let destroy = destroyer.destroy_hashes();
        let achilles = target.base().achilles_hashes();
        assert!(destroy.iter().any(|hash| achilles.contains(hash)));
    }

    #[test]
    fn test_foreign_destroyer_does_not_match() {
        let keypair = KeyPair::generate();
        let attacker = KeyPair::generate();
        let target = signed_node(&keypair);
        let target_id1 = target.base().id1().unwrap();

        let mut destroyer = DataNode::new().unwrap();
        destroyer.base_mut().set_parent_id(&[0x0B; 32]).unwrap();
        destroyer
            .base_mut()
            .set_owner(&attacker.public_key())
            .unwrap();
        destroyer.base_mut().set_creation_time(1_000_100).unwrap();
        destroyer.set_content_type(DESTROY_CONTENT_TYPE).unwrap();
        destroyer.base_mut().set_ref_id(&target_id1).unwrap();
        destroyer.base_mut().sign(&attacker).unwrap();

        let destroy = destroyer.destroy_hashes();
        let achilles = target.base().achilles_hashes();
        assert!(!destroy.iter().any(|hash| achilles.contains(hash)));
    }

    #[test]
    fn test_embedding_requires_allow_embed() {
        let keypair = KeyPair::generate();
        let inner = signed_node(&keypair);

        let mut outer = DataNode::new().unwrap();
        outer.base_mut().set_parent_id(&[0x0B; 32]).unwrap();
        outer.base_mut().set_owner(&keypair.public_key()).unwrap();
        outer.base_mut().set_creation_time(1_000_000).unwrap();
        outer
            .base_mut()
            .set_embedded_image(&inner.base().export(false).unwrap())
            .unwrap();
        outer.base_mut().sign(&keypair).unwrap();

        let err = outer.validate(ValidateLevel::Full, None).unwrap_err();
        assert_eq!(err.0, "Embedded node does not allow embedding");

        // Same shape of inner node, flagged embeddable before signing, passes.
        let mut inner_ok = DataNode::new().unwrap();
        inner_ok.base_mut().set_parent_id(&[0x0B; 32]).unwrap();
        inner_ok.base_mut().set_owner(&keypair.public_key()).unwrap();
        inner_ok.base_mut().set_creation_time(1_000_000).unwrap();
        inner_ok
            .base_mut()
            .set_config_bit(config_bits::ALLOW_EMBED, true)
            .unwrap();
        inner_ok.base_mut().sign(&keypair).unwrap();
        let mut outer_ok = DataNode::new().unwrap();
        outer_ok.base_mut().set_parent_id(&[0x0B; 32]).unwrap();
        outer_ok.base_mut().set_owner(&keypair.public_key()).unwrap();
        outer_ok.base_mut().set_creation_time(1_000_000).unwrap();
        outer_ok
            .base_mut()
            .set_embedded_image(&inner_ok.base().export(false).unwrap())
            .unwrap();
        outer_ok.base_mut().sign(&keypair).unwrap();
        assert!(outer_ok.validate(ValidateLevel::Full, None).is_ok());
    }
}

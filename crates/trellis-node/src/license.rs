//! License nodes - grants of fetch/hold/relay rights over a target node
//!
//! A License names a target public key and the node it licenses (`refId`).
//! Licenses are always leaf and unique, never public, never themselves
//! licensed, and must expire. A License can embed another License to
//! "extend" it: the embedder must be the former target, and each extension
//! strictly decrements the remaining extension budget.

use std::sync::Arc;

use trellis_crypto::{hash_parts, HashPart};
use trellis_model::Model;

use crate::base::{NodeBase, ValidateLevel};
use crate::cert::FriendCert;
use crate::error::{NodeError, Result, ValidationError};
use crate::schema::{
    self, config_bits, field, license_config_bits, tags, MAX_LICENSE_DISTANCE,
    MAX_LICENSE_EXTENSIONS, PRIMARY_NODE, SECONDARY_DATA,
};

/// A License node
#[derive(Clone, Debug)]
pub struct LicenseNode {
    base: NodeBase,
}

impl LicenseNode {
    /// Create an empty License; leaf and unique bits are pre-set
    pub fn new() -> Result<Self> {
        let schema = Arc::new(schema::license_schema()?);
        let mut base = NodeBase::new(Model::new(schema))?;
        base.set_config_bit(config_bits::IS_LEAF, true)?;
        base.set_config_bit(config_bits::IS_UNIQUE, true)?;
        Ok(Self { base })
    }

    /// Load from a wire image
    pub fn load(image: &[u8], preserve_transient: bool) -> Result<Self> {
        let schema = Arc::new(schema::license_schema()?);
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

    // === License fields ===

    pub fn target_public_key(&self) -> Option<[u8; 32]> {
        self.base.get32(field::TARGET_PUBLIC_KEY)
    }

    pub fn set_target_public_key(&mut self, target: &[u8; 32]) -> Result<()> {
        Ok(self
            .base
            .model_mut()
            .set_bytes(field::TARGET_PUBLIC_KEY, target)?)
    }

    /// The licensed node's id1 (carried as `refId`)
    pub fn node_id1(&self) -> Option<[u8; 32]> {
        self.base.ref_id()
    }

    pub fn set_node_id1(&mut self, node_id1: &[u8; 32]) -> Result<()> {
        self.base.set_ref_id(node_id1)
    }

    pub fn terms(&self) -> Option<&str> {
        self.base.model().get_text(field::TERMS)
    }

    pub fn set_terms(&mut self, terms: &str) -> Result<()> {
        Ok(self.base.model_mut().set_text(field::TERMS, terms)?)
    }

    /// Parsed terms tree; the grant's current terms survive extension
    pub fn current_terms(&self) -> Option<serde_json::Value> {
        self.terms().and_then(|text| serde_json::from_str(text).ok())
    }

    /// Remaining embeddings allowed
    pub fn extensions(&self) -> u64 {
        self.base.model().get_uint(field::EXTENSIONS).unwrap_or(0)
    }

    pub fn set_extensions(&mut self, extensions: u8) -> Result<()> {
        Ok(self
            .base
            .model_mut()
            .set_uint(field::EXTENSIONS, extensions as u64)?)
    }

    pub fn friend_level(&self) -> Option<u64> {
        self.base.model().get_uint(field::FRIEND_LEVEL)
    }

    pub fn set_friend_level(&mut self, level: u8) -> Result<()> {
        Ok(self
            .base
            .model_mut()
            .set_uint(field::FRIEND_LEVEL, level as u64)?)
    }

    pub fn jump_peer_public_key(&self) -> Option<[u8; 32]> {
        self.base.get32(field::JUMP_PEER_PUBLIC_KEY)
    }

    pub fn set_jump_peer_public_key(&mut self, key: &[u8; 32]) -> Result<()> {
        Ok(self
            .base
            .model_mut()
            .set_bytes(field::JUMP_PEER_PUBLIC_KEY, key)?)
    }

    pub fn parent_path_hash(&self) -> Option<[u8; 32]> {
        self.base.get32(field::PARENT_PATH_HASH)
    }

    pub fn set_parent_path_hash(&mut self, hash: &[u8; 32]) -> Result<()> {
        Ok(self
            .base
            .model_mut()
            .set_bytes(field::PARENT_PATH_HASH, hash)?)
    }

    pub fn max_distance(&self) -> Option<u64> {
        self.base.model().get_uint(field::MAX_DISTANCE)
    }

    pub fn set_max_distance(&mut self, distance: u8) -> Result<()> {
        Ok(self
            .base
            .model_mut()
            .set_uint(field::MAX_DISTANCE, distance as u64)?)
    }

    // === License config bits ===

    pub fn license_config(&self) -> u64 {
        self.base.model().get_uint(field::LICENSE_CONFIG).unwrap_or(0)
    }

    pub fn license_config_bit(&self, bit: u8) -> bool {
        self.license_config() & (1u64 << bit) != 0
    }

    pub fn set_license_config_bit(&mut self, bit: u8, on: bool) -> Result<()> {
        let mut config = self.license_config();
        if on {
            config |= 1u64 << bit;
        } else {
            config &= !(1u64 << bit);
        }
        Ok(self
            .base
            .model_mut()
            .set_uint(field::LICENSE_CONFIG, config)?)
    }

    pub fn disallows_retro_licensing(&self) -> bool {
        self.license_config_bit(license_config_bits::DISALLOW_RETRO_LICENSING)
    }

    pub fn is_restrictive_writer(&self) -> bool {
        self.license_config_bit(license_config_bits::RESTRICTIVEMODE_WRITER)
    }

    pub fn is_restrictive_manager(&self) -> bool {
        self.license_config_bit(license_config_bits::RESTRICTIVEMODE_MANAGER)
    }

    // === Friend certificates ===

    pub fn set_friend_certs(&mut self, cert_a: &FriendCert, cert_b: &FriendCert) -> Result<()> {
        let image_a = cert_a.export()?;
        let image_b = cert_b.export()?;
        self.base.model_mut().set_bytes(field::FRIEND_CERT_A, &image_a)?;
        self.base.model_mut().set_bytes(field::FRIEND_CERT_B, &image_b)?;
        Ok(())
    }

    pub fn friend_cert_a(&self) -> Result<Option<FriendCert>> {
        match self.base.model().get_bytes(field::FRIEND_CERT_A) {
            Some(image) => Ok(Some(FriendCert::load(image)?)),
            None => Ok(None),
        }
    }

    pub fn friend_cert_b(&self) -> Result<Option<FriendCert>> {
        match self.base.model().get_bytes(field::FRIEND_CERT_B) {
            Some(image) => Ok(Some(FriendCert::load(image)?)),
            None => Ok(None),
        }
    }

    // === Extension chain ===

    /// Produce the unsigned extension of this license toward a new target
    ///
    /// Refused with `ExtensionRefused` when the extension budget is
    /// exhausted or the new target already appears in the chain (cycle).
    /// The caller signs the result with the former target's key.
    pub fn embed(&self, new_target: &[u8; 32]) -> Result<LicenseNode> {
        let remaining = self.extensions();
        if remaining == 0 {
            return Err(NodeError::ExtensionRefused("extensions exhausted"));
        }
        if self.chain_keys()?.contains(new_target) {
            return Err(NodeError::ExtensionRefused(
                "target already appears in the extension chain",
            ));
        }
        let former_target = match self.target_public_key() {
            Some(target) => target,
            None => return Err(NodeError::ExtensionRefused("license has no target")),
        };

        let mut extension = LicenseNode::new()?;
        if let Some(parent) = self.base.parent_id() {
            extension.base_mut().set_parent_id(&parent)?;
        }
        if let Some(node_id1) = self.node_id1() {
            extension.set_node_id1(&node_id1)?;
        }
        if let Some(creation) = self.base.creation_time() {
            extension.base_mut().set_creation_time(creation)?;
        }
        if let Some(expire) = self.base.expire_time() {
            extension.base_mut().set_expire_time(expire)?;
        }
        if let Some(terms) = self.terms() {
            extension.set_terms(terms)?;
        }
        if let Some(level) = self.friend_level() {
            extension.set_friend_level(level as u8)?;
        }
        if let Some(hash) = self.parent_path_hash() {
            extension.set_parent_path_hash(&hash)?;
        }
        if let Some(distance) = self.max_distance() {
            extension.set_max_distance(distance as u8)?;
        }
        extension
            .base
            .model_mut()
            .set_uint(field::LICENSE_CONFIG, self.license_config())?;
        extension.base_mut().set_owner(&former_target)?;
        extension.set_target_public_key(new_target)?;
        extension.set_extensions((remaining - 1) as u8)?;
        extension
            .base
            .model_mut()
            .set_bytes(field::EMBEDDED, &self.base.export(false)?)?;
        Ok(extension)
    }

    /// Every owner and target key along the extension chain
    fn chain_keys(&self) -> Result<Vec<[u8; 32]>> {
        let mut keys = Vec::new();
        let mut current = self.clone();
        loop {
            if let Some(owner) = current.base.owner() {
                keys.push(owner);
            }
            if let Some(target) = current.target_public_key() {
                keys.push(target);
            }
            let next_image = match current.base.embedded_image() {
                Some(image) => image.to_vec(),
                None => return Ok(keys),
            };
            current = LicenseNode::load(&next_image, false)?;
        }
    }

    // === Hash enumeration ===

    /// Stored licensee hashes: the cross-product this license answers to
    /// (see the storage driver's licensing index)
    ///
    /// The recipient position carries the target key (and, when set, the
    /// jump peer as an alternative recipient); the owner position is
    /// emitted both wildcarded and bound to the issuer, covering
    /// self-owned and delegated issuance. Up to four variants.
    pub fn licensee_hashes(&self) -> Vec<[u8; 32]> {
        let (parent, issuer, node_id1) = match (
            self.base.parent_id(),
            self.base.owner(),
            self.node_id1(),
        ) {
            (Some(parent), Some(issuer), Some(node_id1)) => (parent, issuer, node_id1),
            _ => return Vec::new(),
        };
        // Licenses grant rights over content carriers.
        let prefix = [0u8, PRIMARY_NODE, 0, SECONDARY_DATA];
        let base = [
            HashPart::Bytes(tags::LICENSEE),
            HashPart::Bytes(&prefix),
            HashPart::Bytes(&parent),
            HashPart::Bytes(&issuer),
            HashPart::Bytes(&node_id1),
        ];

        let mut recipients: Vec<[u8; 32]> = Vec::with_capacity(2);
        if let Some(target) = self.target_public_key() {
            recipients.push(target);
        }
        if let Some(jump) = self.jump_peer_public_key() {
            recipients.push(jump);
        }

        let mut hashes = Vec::with_capacity(recipients.len() * 2);
        for recipient in recipients {
            let mut wildcard_owner = base.to_vec();
            wildcard_owner.push(HashPart::Bytes(&recipient));
            hashes.push(hash_parts(&wildcard_owner));

            let mut bound_owner = base.to_vec();
            bound_owner.push(HashPart::Bytes(&issuer));
            bound_owner.push(HashPart::Bytes(&recipient));
            hashes.push(hash_parts(&bound_owner));
        }
        hashes
    }

    /// Achilles hashes: the base pair plus the license-group variant
    pub fn achilles_hashes(&self) -> Vec<[u8; 32]> {
        let mut hashes = self.base.achilles_hashes();
        if hashes.is_empty() {
            return hashes;
        }
        if let (Some(owner), Some(target), Some(node_id1)) = (
            self.base.owner(),
            self.target_public_key(),
            self.node_id1(),
        ) {
            hashes.push(hash_parts(&[
                HashPart::Bytes(tags::ACHILLES_LICENSE),
                HashPart::Bytes(&owner),
                HashPart::Bytes(&target),
                HashPart::Bytes(&node_id1),
            ]));
        }
        hashes
    }

    // === Validation ===

    /// Validate this license: common sequence plus license rules
    pub fn validate(
        &self,
        level: ValidateLevel,
        at_time: Option<u64>,
    ) -> std::result::Result<(), ValidationError> {
        self.base.validate_common(level, at_time)?;

        if self.base.expire_time().is_none() {
            return Err(ValidationError::new("License must have expireTime set"));
        }
        if self.base.id2().is_some() {
            return Err(ValidationError::new("License cannot have id2 set"));
        }
        if self.base.config_bit(config_bits::HAS_DYNAMIC_SELF) {
            return Err(ValidationError::new("License cannot use hasDynamicSelf"));
        }
        if self.target_public_key().is_none() {
            return Err(ValidationError::new(
                "License must have targetPublicKey set",
            ));
        }
        if self.node_id1().is_none() {
            return Err(ValidationError::new("License must have refId set"));
        }
        if !self.base.is_leaf() {
            return Err(ValidationError::new("License must be leaf"));
        }
        if !self.base.is_unique() {
            return Err(ValidationError::new("License must be unique"));
        }
        if self.base.is_public() {
            return Err(ValidationError::new("License cannot be public"));
        }
        if self.base.is_licensed() {
            return Err(ValidationError::new("License cannot be licensed"));
        }
        if self.extensions() > MAX_LICENSE_EXTENSIONS {
            return Err(ValidationError::new("License extensions exceed maximum"));
        }
        if let Some(distance) = self.max_distance() {
            if distance > MAX_LICENSE_DISTANCE as u64 {
                return Err(ValidationError::new("License maxDistance exceeds maximum"));
            }
        }
        if let Some(terms) = self.terms() {
            match serde_json::from_str::<serde_json::Value>(terms) {
                Ok(serde_json::Value::Object(_)) | Ok(serde_json::Value::Number(_)) => {}
                _ => {
                    return Err(ValidationError::new(
                        "License terms must parse as a JSON map or number",
                    ))
                }
            }
        }

        let has_a = self.base.model().is_set(field::FRIEND_CERT_A);
        let has_b = self.base.model().is_set(field::FRIEND_CERT_B);
        if has_a != has_b {
            return Err(ValidationError::new(
                "Both friend certs must be set together",
            ));
        }

        if level != ValidateLevel::Structural {
            self.validate_friend_certs(at_time)?;
            self.validate_extension_chain(level, at_time)?;
        }
        Ok(())
    }

    fn validate_friend_certs(
        &self,
        _at_time: Option<u64>,
    ) -> std::result::Result<(), ValidationError> {
        let cert_a = self
            .friend_cert_a()
            .map_err(|err| ValidationError::new(format!("Friend cert does not decode: {err}")))?;
        let cert_b = self
            .friend_cert_b()
            .map_err(|err| ValidationError::new(format!("Friend cert does not decode: {err}")))?;

        let dynamic = match (&cert_a, &cert_b) {
            (Some(a), Some(b)) => a.is_dynamic() || b.is_dynamic(),
            _ => false,
        };
        if self.license_config_bit(license_config_bits::HAS_DYNAMIC_FRIENDCERT) != dynamic {
            return Err(ValidationError::new(
                "hasDynamicFriendCert mismatches friend cert dynamic flags",
            ));
        }

        if let (Some(cert_a), Some(cert_b)) = (cert_a, cert_b) {
            let creation = self.base.creation_time().unwrap_or(0);
            let expire = self.base.expire_time().unwrap_or(0);
            FriendCert::validate_pair(
                &cert_a,
                &cert_b,
                &self.base.model_type(),
                creation,
                expire,
            )
            .map_err(|err| ValidationError::new(err.to_string()))?;
        }
        Ok(())
    }

    fn validate_extension_chain(
        &self,
        level: ValidateLevel,
        at_time: Option<u64>,
    ) -> std::result::Result<(), ValidationError> {
        let image = match self.base.embedded_image() {
            Some(image) => image,
            None => return Ok(()),
        };
        let embedded = LicenseNode::load(image, false)
            .map_err(|err| ValidationError::new(format!("Embedded license does not decode: {err}")))?;

        if embedded.target_public_key() != self.base.owner() {
            return Err(ValidationError::new(
                "License extension must be embedded by its target",
            ));
        }
        if embedded.extensions() != self.extensions() + 1 {
            return Err(ValidationError::new(
                "License extension must strictly decrement extensions",
            ));
        }
        if embedded.node_id1() != self.node_id1() {
            return Err(ValidationError::new(
                "License extension must target the same node",
            ));
        }
        if embedded.terms() != self.terms() {
            return Err(ValidationError::new(
                "License extension must preserve terms",
            ));
        }
        let policy_bits = (1u64 << license_config_bits::DISALLOW_RETRO_LICENSING)
            | (1u64 << license_config_bits::RESTRICTIVEMODE_WRITER)
            | (1u64 << license_config_bits::RESTRICTIVEMODE_MANAGER);
        if embedded.license_config() & policy_bits != self.license_config() & policy_bits {
            return Err(ValidationError::new(
                "License extension must propagate licensing policy flags",
            ));
        }
        embedded.validate(level, at_time)
    }
}

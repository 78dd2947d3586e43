//! Shared node base: fields, identity derivation, signing, work, and the
//! common validation sequence
//!
//! `NodeBase` wraps a Model carrying the shared node field table. The
//! concrete kinds (Data, License) own a base and layer their own fields and
//! rules on top.

use trellis_crypto::{hash_parts, work, HashPart, KeyPair, NONCE_SIZE};
use trellis_model::{Model, Value};

use crate::cert::SignCert;
use crate::error::{NodeError, Result, ValidationError};
use crate::schema::{config_bits, field, tags, transient_bits, MAX_LICENSE_DISTANCE, PRIMARY_NODE};

/// Validation depth
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidateLevel {
    /// Structural checks only
    Structural,
    /// Full recursive validation including signature counts and certs
    Full,
    /// Full validation minus signature-count checks (pre-signing)
    PreSign,
}

/// The shared node base
#[derive(Clone, Debug)]
pub struct NodeBase {
    model: Model,
    // Decoded cert, kept per-instance for reuse. The model bytes are always
    // authoritative; setters write through before caching.
    cert_cache: Option<SignCert>,
}

impl NodeBase {
    /// Wrap a model whose schema carries the node field table
    ///
    /// The header must have byte 0 zero and name the node primary
    /// interface. A default `config` of 0 is written.
    pub fn new(model: Model) -> Result<Self> {
        let header = *model.schema().model_type().as_bytes();
        if header[0] != 0 || header[1] != PRIMARY_NODE {
            return Err(NodeError::UnknownModelType(hex::encode(header)));
        }
        let mut base = Self {
            model,
            cert_cache: None,
        };
        if base.model.get_uint(field::CONFIG).is_none() {
            base.model.set_uint(field::CONFIG, 0)?;
        }
        Ok(base)
    }

    /// Wrap a model loaded from a wire image (no default writes)
    pub fn from_loaded(model: Model) -> Result<Self> {
        let header = *model.schema().model_type().as_bytes();
        if header[0] != 0 || header[1] != PRIMARY_NODE {
            return Err(NodeError::UnknownModelType(hex::encode(header)));
        }
        Ok(Self {
            model,
            cert_cache: None,
        })
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut Model {
        // Any mutation may invalidate the decoded cert.
        self.cert_cache = None;
        &mut self.model
    }

    /// The 6-byte model type header
    pub fn model_type(&self) -> [u8; 6] {
        *self.model.schema().model_type().as_bytes()
    }

    /// First 4 header bytes, the interface prefix used in hash tuples
    pub fn type_prefix(&self) -> [u8; 4] {
        self.model.schema().model_type().interface_prefix()
    }

    /// Export the wire image
    pub fn export(&self, include_transient: bool) -> Result<Vec<u8>> {
        Ok(self.model.export(include_transient)?)
    }

    // === Field accessors ===

    pub fn get32(&self, name: &str) -> Option<[u8; 32]> {
        self.model.get_bytes(name).and_then(|b| b.try_into().ok())
    }

    pub fn id1(&self) -> Option<[u8; 32]> {
        self.get32(field::ID1)
    }

    pub fn id2(&self) -> Option<[u8; 32]> {
        self.get32(field::ID2)
    }

    /// The node's effective id: `id2` when set, else `id1`
    pub fn id(&self) -> Option<[u8; 32]> {
        self.id2().or_else(|| self.id1())
    }

    pub fn parent_id(&self) -> Option<[u8; 32]> {
        self.get32(field::PARENT_ID)
    }

    pub fn set_parent_id(&mut self, parent: &[u8; 32]) -> Result<()> {
        Ok(self.model_mut().set_bytes(field::PARENT_ID, parent)?)
    }

    pub fn owner(&self) -> Option<[u8; 32]> {
        self.get32(field::OWNER)
    }

    pub fn set_owner(&mut self, owner: &[u8; 32]) -> Result<()> {
        Ok(self.model_mut().set_bytes(field::OWNER, owner)?)
    }

    pub fn ref_id(&self) -> Option<[u8; 32]> {
        self.get32(field::REF_ID)
    }

    pub fn set_ref_id(&mut self, ref_id: &[u8; 32]) -> Result<()> {
        Ok(self.model_mut().set_bytes(field::REF_ID, ref_id)?)
    }

    pub fn creation_time(&self) -> Option<u64> {
        self.model.get_uint(field::CREATION_TIME)
    }

    pub fn set_creation_time(&mut self, time: u64) -> Result<()> {
        Ok(self.model_mut().set_uint(field::CREATION_TIME, time)?)
    }

    pub fn expire_time(&self) -> Option<u64> {
        self.model.get_uint(field::EXPIRE_TIME)
    }

    pub fn set_expire_time(&mut self, time: u64) -> Result<()> {
        Ok(self.model_mut().set_uint(field::EXPIRE_TIME, time)?)
    }

    pub fn difficulty(&self) -> u8 {
        self.model.get_uint(field::DIFFICULTY).unwrap_or(0) as u8
    }

    pub fn set_difficulty(&mut self, difficulty: u8) -> Result<()> {
        Ok(self
            .model_mut()
            .set_uint(field::DIFFICULTY, difficulty as u64)?)
    }

    pub fn nonce(&self) -> Option<[u8; NONCE_SIZE]> {
        self.model
            .get_bytes(field::NONCE)
            .and_then(|b| b.try_into().ok())
    }

    pub fn signature(&self) -> Option<&[u8]> {
        self.model.get_bytes(field::SIGNATURE)
    }

    pub fn region(&self) -> Option<&str> {
        self.model.get_text(field::REGION)
    }

    pub fn set_region(&mut self, region: &str) -> Result<()> {
        Ok(self.model_mut().set_text(field::REGION, region)?)
    }

    pub fn jurisdiction(&self) -> Option<&str> {
        self.model.get_text(field::JURISDICTION)
    }

    pub fn set_jurisdiction(&mut self, jurisdiction: &str) -> Result<()> {
        Ok(self.model_mut().set_text(field::JURISDICTION, jurisdiction)?)
    }

    pub fn blob_hash(&self) -> Option<[u8; 32]> {
        self.get32(field::BLOB_HASH)
    }

    pub fn blob_length(&self) -> Option<u64> {
        self.model.get_uint(field::BLOB_LENGTH)
    }

    pub fn set_blob(&mut self, hash: &[u8; 32], length: u64) -> Result<()> {
        self.model_mut().set_bytes(field::BLOB_HASH, hash)?;
        self.model.set_uint(field::BLOB_LENGTH, length)?;
        Ok(())
    }

    pub fn network(&self) -> Option<&str> {
        self.model.get_text(field::NETWORK)
    }

    pub fn set_network(&mut self, network: &str) -> Result<()> {
        Ok(self.model_mut().set_text(field::NETWORK, network)?)
    }

    pub fn license_min_distance(&self) -> Option<u64> {
        self.model.get_uint(field::LICENSE_MIN_DISTANCE)
    }

    pub fn license_max_distance(&self) -> Option<u64> {
        self.model.get_uint(field::LICENSE_MAX_DISTANCE)
    }

    pub fn set_license_distances(&mut self, min: u8, max: u8) -> Result<()> {
        self.model_mut()
            .set_uint(field::LICENSE_MIN_DISTANCE, min as u64)?;
        self.model.set_uint(field::LICENSE_MAX_DISTANCE, max as u64)?;
        Ok(())
    }

    pub fn child_min_difficulty(&self) -> Option<u64> {
        self.model.get_uint(field::CHILD_MIN_DIFFICULTY)
    }

    pub fn embedded_image(&self) -> Option<&[u8]> {
        self.model.get_bytes(field::EMBEDDED)
    }

    pub fn set_embedded_image(&mut self, image: &[u8]) -> Result<()> {
        Ok(self.model_mut().set_bytes(field::EMBEDDED, image)?)
    }

    // === Config bits ===

    pub fn config(&self) -> u64 {
        self.model.get_uint(field::CONFIG).unwrap_or(0)
    }

    pub fn config_bit(&self, bit: u8) -> bool {
        self.config() & (1u64 << bit) != 0
    }

    pub fn set_config_bit(&mut self, bit: u8, on: bool) -> Result<()> {
        let mut config = self.config();
        if on {
            config |= 1u64 << bit;
        } else {
            config &= !(1u64 << bit);
        }
        Ok(self.model_mut().set_uint(field::CONFIG, config)?)
    }

    pub fn is_leaf(&self) -> bool {
        self.config_bit(config_bits::IS_LEAF)
    }

    pub fn is_public(&self) -> bool {
        self.config_bit(config_bits::IS_PUBLIC)
    }

    pub fn is_licensed(&self) -> bool {
        self.config_bit(config_bits::IS_LICENSED)
    }

    /// Private means neither public nor licensed
    pub fn is_private(&self) -> bool {
        !self.is_public() && !self.is_licensed()
    }

    pub fn is_unique(&self) -> bool {
        self.config_bit(config_bits::IS_UNIQUE)
    }

    pub fn is_indestructible(&self) -> bool {
        self.config_bit(config_bits::IS_INDESTRUCTIBLE)
    }

    pub fn has_rights_by_association(&self) -> bool {
        self.config_bit(config_bits::HAS_RIGHTS_BY_ASSOCIATION)
    }

    pub fn allows_embed(&self) -> bool {
        self.config_bit(config_bits::ALLOW_EMBED)
    }

    pub fn allows_embed_move(&self) -> bool {
        self.config_bit(config_bits::ALLOW_EMBED_MOVE)
    }

    pub fn begins_restrictive_write(&self) -> bool {
        self.config_bit(config_bits::IS_BEGIN_RESTRICTIVEWRITE_MODE)
    }

    pub fn ends_restrictive_write(&self) -> bool {
        self.config_bit(config_bits::IS_END_RESTRICTIVEWRITE_MODE)
    }

    // === Transient bits ===

    pub fn transient_config(&self) -> u64 {
        self.model.get_uint(field::TRANSIENT_CONFIG).unwrap_or(0)
    }

    pub fn transient_bit(&self, bit: u8) -> bool {
        self.transient_config() & (1u64 << bit) != 0
    }

    pub fn set_transient_bit(&mut self, bit: u8, on: bool) -> Result<()> {
        let mut config = self.transient_config();
        if on {
            config |= 1u64 << bit;
        } else {
            config &= !(1u64 << bit);
        }
        Ok(self.model_mut().set_uint(field::TRANSIENT_CONFIG, config)?)
    }

    pub fn is_destroyed(&self) -> bool {
        self.transient_bit(transient_bits::DYNAMIC_DESTROYED)
    }

    // === Identity derivation ===

    /// Digest of the hashable fields (signature, nonce, id1, id2 exempt)
    pub fn hash0(&self) -> [u8; 32] {
        self.model.hash(&[])
    }

    /// `H(hash0, nonce)`
    pub fn hash1(&self) -> [u8; 32] {
        let hash0 = self.hash0();
        let nonce = self.nonce();
        hash_parts(&[
            HashPart::Bytes(&hash0),
            match &nonce {
                Some(nonce) => HashPart::Bytes(nonce),
                None => HashPart::None,
            },
        ])
    }

    /// `H(hash1, id2)`
    pub fn final_hash(&self) -> [u8; 32] {
        let hash1 = self.hash1();
        let id2 = self.id2();
        hash_parts(&[
            HashPart::Bytes(&hash1),
            match &id2 {
                Some(id2) => HashPart::Bytes(id2),
                None => HashPart::None,
            },
        ])
    }

    /// `H(hash, signature)` - the intrinsic cryptographic id
    pub fn calc_id1(&self) -> Option<[u8; 32]> {
        let signature = self.signature()?;
        let digest = self.final_hash();
        Some(hash_parts(&[
            HashPart::Bytes(&digest),
            HashPart::Bytes(signature),
        ]))
    }

    /// `H(hash1, owner, network)` - the online-validated secondary id
    pub fn calc_id2(&self) -> Option<[u8; 32]> {
        let owner = self.owner()?;
        let network = self.network()?;
        let hash1 = self.hash1();
        Some(hash_parts(&[
            HashPart::Bytes(&hash1),
            HashPart::Bytes(&owner),
            HashPart::Bytes(network.as_bytes()),
        ]))
    }

    /// Digest over the transient fields, for stored-image comparison
    pub fn transient_hash(&self) -> [u8; 32] {
        self.model.hash_transient()
    }

    // === Proof of work ===

    /// Solve the nonce for the configured difficulty
    pub fn solve_work(&mut self) -> Result<()> {
        let difficulty = self.difficulty();
        if difficulty == 0 {
            return Ok(());
        }
        let hash0 = self.hash0();
        let nonce =
            work::solve(&hash0, difficulty).ok_or(NodeError::NoNonceFound(difficulty))?;
        self.model_mut().set_bytes(field::NONCE, &nonce)?;
        Ok(())
    }

    /// Verify the nonce against the configured difficulty
    pub fn verify_work(&self) -> bool {
        let difficulty = self.difficulty();
        if difficulty == 0 {
            return true;
        }
        match self.nonce() {
            Some(nonce) => work::verify(&self.hash0(), &nonce, difficulty),
            None => false,
        }
    }

    // === Certificates ===

    /// Install a signing certificate; writes the image through to the model
    pub fn set_cert(&mut self, cert: &SignCert) -> Result<()> {
        let image = cert.export()?;
        self.model.set_bytes(field::CERT, &image)?;
        self.cert_cache = Some(cert.clone());
        Ok(())
    }

    pub fn cert_image(&self) -> Option<&[u8]> {
        self.model.get_bytes(field::CERT)
    }

    /// Decode the signing certificate, reusing the per-instance cache
    pub fn cert(&mut self) -> Result<Option<SignCert>> {
        if let Some(cert) = &self.cert_cache {
            return Ok(Some(cert.clone()));
        }
        match self.model.get_bytes(field::CERT) {
            Some(image) => {
                let cert = SignCert::load(image)?;
                self.cert_cache = Some(cert.clone());
                Ok(Some(cert))
            }
            None => Ok(None),
        }
    }

    /// Decode the signing certificate without touching the cache
    pub fn peek_cert(&self) -> Result<Option<SignCert>> {
        match self.model.get_bytes(field::CERT) {
            Some(image) => Ok(Some(SignCert::load(image)?)),
            None => Ok(None),
        }
    }

    // === Signing ===

    /// The eligible-signer set: the cert's target keys, or the owner alone
    pub fn eligible_signers(&self) -> Result<Vec<[u8; 32]>> {
        if let Some(cert) = self.peek_cert()? {
            return Ok(cert.target_public_keys());
        }
        match self.owner() {
            Some(owner) => Ok(vec![owner]),
            None => Err(NodeError::MissingField(field::OWNER)),
        }
    }

    /// Sign the node, appending one packed signature entry and pinning id1
    ///
    /// The keypair's public key must appear in the eligible-signer set; its
    /// position becomes the entry's signer index.
    pub fn sign(&mut self, keypair: &KeyPair) -> Result<()> {
        let signers = self.eligible_signers()?;
        let public = keypair.public_key();
        let index = signers
            .iter()
            .position(|key| *key == public)
            .ok_or(NodeError::SignerNotEligible(0))? as u8;

        let digest = self.final_hash();
        let entry = trellis_crypto::pack_entry(index, &keypair.sign(&digest));

        let mut buffer = self.signature().map(|s| s.to_vec()).unwrap_or_default();
        buffer.extend_from_slice(&entry);
        self.model.set_bytes(field::SIGNATURE, &buffer)?;

        let id1 = hash_parts(&[HashPart::Bytes(&digest), HashPart::Bytes(&buffer)]);
        self.model.set_bytes(field::ID1, &id1)?;
        Ok(())
    }

    /// Verify id1 and every signature entry against the eligible-signer set
    pub fn verify(&self) -> bool {
        let id1 = match self.id1() {
            Some(id1) => id1,
            None => return false,
        };
        if self.calc_id1() != Some(id1) {
            return false;
        }
        let buffer = match self.signature() {
            Some(buffer) => buffer,
            None => return false,
        };
        let entries = match trellis_crypto::unpack_entries(buffer) {
            Ok(entries) => entries,
            Err(_) => return false,
        };
        let signers = match self.eligible_signers() {
            Ok(signers) => signers,
            Err(_) => return false,
        };
        let digest = self.final_hash();
        entries.iter().all(|entry| {
            signers
                .get(entry.signer_index as usize)
                .map(|key| {
                    trellis_crypto::verify_signature(key, &digest, &entry.signature)
                        .unwrap_or(false)
                })
                .unwrap_or(false)
        })
    }

    /// Number of packed signature entries
    pub fn signature_count(&self) -> usize {
        self.signature()
            .map(|buffer| buffer.len() / trellis_crypto::SIGNATURE_ENTRY_SIZE)
            .unwrap_or(0)
    }

    // === Copy semantics ===

    /// Produce an unsigned copy, optionally re-parented
    ///
    /// The copy stores the original's signature, parent (when moved), and
    /// id1 (when the original carries id2); its own id2 becomes the
    /// original's effective id.
    pub fn copy(&self, new_parent_id: Option<[u8; 32]>) -> Result<Self> {
        let orig_id = self.id().ok_or(NodeError::MissingField(field::ID1))?;
        let signature = self
            .signature()
            .ok_or(NodeError::MissingField(field::SIGNATURE))?
            .to_vec();

        let mut copy = self.clone();
        copy.model.set_bytes(field::COPIED_SIGNATURE, &signature)?;
        copy.model.clear(field::SIGNATURE)?;
        copy.model.clear(field::ID1)?;

        if let Some(new_parent) = new_parent_id {
            if Some(new_parent) != self.parent_id() {
                let orig_parent = self.parent_id().ok_or(NodeError::MissingField(field::PARENT_ID))?;
                copy.model.set_bytes(field::COPIED_PARENT_ID, &orig_parent)?;
                copy.model.set_bytes(field::PARENT_ID, &new_parent)?;
            }
        }
        if self.id2().is_some() {
            let orig_id1 = self.id1().ok_or(NodeError::MissingField(field::ID1))?;
            copy.model.set_bytes(field::COPIED_ID1, &orig_id1)?;
        }
        copy.model.set_bytes(field::ID2, &orig_id)?;
        Ok(copy)
    }

    /// Whether this node is a copy (carries a copied signature)
    pub fn is_copy(&self) -> bool {
        self.model.is_set(field::COPIED_SIGNATURE)
    }

    /// Recover the original node from a copy
    ///
    /// Restores the copied signature, parent, and id, then requires the
    /// restored id1 to recompute.
    pub fn copied_node(&self) -> Result<Self> {
        let copied_signature = self
            .model
            .get_bytes(field::COPIED_SIGNATURE)
            .ok_or(NodeError::MissingField(field::COPIED_SIGNATURE))?
            .to_vec();

        let mut orig = self.clone();
        orig.model.set_bytes(field::SIGNATURE, &copied_signature)?;
        orig.model.clear(field::COPIED_SIGNATURE)?;

        if let Some(orig_parent) = self.get32(field::COPIED_PARENT_ID) {
            orig.model.set_bytes(field::PARENT_ID, &orig_parent)?;
            orig.model.clear(field::COPIED_PARENT_ID)?;
        }
        match self.get32(field::COPIED_ID1) {
            Some(orig_id1) => {
                // Original carried id2: the copy's id2 is that id2.
                let orig_id2 = self.id2().ok_or(NodeError::MissingField(field::ID2))?;
                orig.model.set_bytes(field::ID1, &orig_id1)?;
                orig.model.set_bytes(field::ID2, &orig_id2)?;
                orig.model.clear(field::COPIED_ID1)?;
            }
            None => {
                let orig_id1 = self.id2().ok_or(NodeError::MissingField(field::ID2))?;
                orig.model.set_bytes(field::ID1, &orig_id1)?;
                orig.model.clear(field::ID2)?;
            }
        }

        let restored_id1 = orig.id1();
        if orig.calc_id1() != restored_id1 {
            return Err(NodeError::Validation(ValidationError::new(
                "Calculated id1 on signed node mismatches set id1",
            )));
        }
        Ok(orig)
    }

    // === Derived hash families ===

    /// Achilles hashes this node emits; empty for indestructible nodes
    pub fn achilles_hashes(&self) -> Vec<[u8; 32]> {
        if self.is_indestructible() {
            return Vec::new();
        }
        let (owner, id1) = match (self.owner(), self.id1()) {
            (Some(owner), Some(id1)) => (owner, id1),
            _ => return Vec::new(),
        };
        vec![
            hash_parts(&[
                HashPart::Bytes(tags::ACHILLES_ID),
                HashPart::Bytes(&owner),
                HashPart::Bytes(&id1),
            ]),
            hash_parts(&[HashPart::Bytes(tags::ACHILLES_OWNER), HashPart::Bytes(&owner)]),
        ]
    }

    /// The freshness digest rows are bumped by
    pub fn bump_hash(&self) -> Option<[u8; 32]> {
        let parent = self.parent_id()?;
        let id1 = self.id1()?;
        Some(hash_parts(&[
            HashPart::Bytes(tags::BUMP),
            HashPart::Bytes(&parent),
            HashPart::Bytes(&id1),
        ]))
    }

    /// Query-side licensee match hashes for a `(source, target)` pair
    ///
    /// The recipient position is always bound to `target`; the owner
    /// position is emitted both bound and wildcarded, so a license issued
    /// without knowledge of the node's owner still answers. A stored
    /// license row must intersect one of the variants.
    pub fn licensee_match_hashes(
        &self,
        source: &[u8; 32],
        target: &[u8; 32],
    ) -> Vec<[u8; 32]> {
        let (parent, id1, owner) = match (self.parent_id(), self.id1(), self.owner()) {
            (Some(parent), Some(id1), Some(owner)) => (parent, id1, owner),
            _ => return Vec::new(),
        };
        let prefix = self.type_prefix();
        let base = [
            HashPart::Bytes(tags::LICENSEE),
            HashPart::Bytes(&prefix),
            HashPart::Bytes(&parent),
            HashPart::Bytes(source),
            HashPart::Bytes(&id1),
        ];
        let mut with_target = base.to_vec();
        with_target.push(HashPart::Bytes(target));
        let mut with_owner_target = base.to_vec();
        with_owner_target.push(HashPart::Bytes(&owner));
        with_owner_target.push(HashPart::Bytes(target));
        vec![hash_parts(&with_target), hash_parts(&with_owner_target)]
    }

    /// The uniqueness digest: type-specific subset for unique nodes,
    /// `H(id1)` otherwise
    pub fn shared_hash(&self) -> [u8; 32] {
        if self.is_unique() {
            self.model.hash(&[field::CREATION_TIME])
        } else {
            let id1 = self.id1().unwrap_or([0u8; 32]);
            hash_parts(&[HashPart::Bytes(&id1)])
        }
    }

    // === Validation ===

    /// The common validation sequence (steps shared by every node kind)
    ///
    /// Pure predicate: returns the refusal reason, never panics. The deep
    /// steps (embedded models, certs) belong to the concrete kinds.
    pub fn validate_common(
        &self,
        level: ValidateLevel,
        at_time: Option<u64>,
    ) -> std::result::Result<(), ValidationError> {
        // 1. The image must export.
        if let Err(err) = self.model.export(true) {
            return Err(ValidationError::new(format!("Node image export failed: {err}")));
        }

        // 2. A signed node's id1 must recompute.
        if self.signature().is_some() {
            if self.id1().is_none() {
                return Err(ValidationError::new("Signed node must have id1 set"));
            }
            if self.calc_id1() != self.id1() {
                return Err(ValidationError::new(
                    "Calculated id1 on signed node mismatches set id1",
                ));
            }
        }

        // 3. Mandatory fields and time ordering.
        if self.parent_id().is_none() {
            return Err(ValidationError::new("Node must have parentId set"));
        }
        if self.owner().is_none() {
            return Err(ValidationError::new("Node must have owner set"));
        }
        if !self.model.is_set(field::CONFIG) {
            return Err(ValidationError::new("Node must have config set"));
        }
        let creation = match self.creation_time() {
            Some(creation) => creation,
            None => return Err(ValidationError::new("Node must have creationTime set")),
        };
        if let Some(expire) = self.expire_time() {
            if creation >= expire {
                return Err(ValidationError::new(
                    "Node creationTime must precede expireTime",
                ));
            }
        }

        // 4. Liveness at the supplied time.
        if let Some(now) = at_time {
            if let Some(expire) = self.expire_time() {
                if now >= expire {
                    return Err(ValidationError::new("Node is expired"));
                }
            }
            if creation > now {
                return Err(ValidationError::new("Node is not yet valid"));
            }
        }

        // 5. Licensing distances.
        let min_distance = self.license_min_distance();
        let max_distance = self.license_max_distance();
        if !self.is_licensed() && (min_distance.is_some() || max_distance.is_some()) {
            return Err(ValidationError::new(
                "Licensing distances set on non-licensed node",
            ));
        }
        if let (Some(min), Some(max)) = (min_distance, max_distance) {
            if min > max {
                return Err(ValidationError::new(
                    "licenseMinDistance must not exceed licenseMaxDistance",
                ));
            }
            if max > MAX_LICENSE_DISTANCE as u64 {
                return Err(ValidationError::new("licenseMaxDistance exceeds maximum"));
            }
        }

        // 6. Embed-move prerequisites.
        if self.allows_embed_move() {
            if !self.allows_embed() {
                return Err(ValidationError::new("allowEmbedMove requires allowEmbed"));
            }
            if min_distance.unwrap_or(0) != 0 {
                return Err(ValidationError::new(
                    "allowEmbedMove requires licenseMinDistance 0",
                ));
            }
        }

        // 7. Blob fields travel together.
        if self.blob_hash().is_some() != self.blob_length().is_some() {
            return Err(ValidationError::new(
                "blobHash and blobLength must be set together",
            ));
        }

        // 8. Mutual exclusions.
        if self.is_public() && self.is_licensed() {
            return Err(ValidationError::new(
                "Node cannot be both public and licensed",
            ));
        }
        if self.is_indestructible() && !self.is_private() {
            return Err(ValidationError::new("Indestructible node must be private"));
        }
        if self.has_rights_by_association() {
            if !self.is_private() {
                return Err(ValidationError::new(
                    "hasRightsByAssociation requires a private node",
                ));
            }
            if self.ref_id().is_none() {
                return Err(ValidationError::new(
                    "hasRightsByAssociation requires refId set",
                ));
            }
            if self.allows_embed() {
                return Err(ValidationError::new(
                    "hasRightsByAssociation conflicts with allowEmbed",
                ));
            }
        }

        // 9. Dynamic flags require their backing fields.
        if self.config_bit(config_bits::HAS_DYNAMIC_CERT) && self.cert_image().is_none() {
            return Err(ValidationError::new("hasDynamicCert requires cert set"));
        }
        if self.config_bit(config_bits::HAS_DYNAMIC_EMBEDDING) && self.embedded_image().is_none() {
            return Err(ValidationError::new(
                "hasDynamicEmbedding requires embedded set",
            ));
        }
        if self.config_bit(config_bits::HAS_DYNAMIC_SELF)
            && (self.id2().is_none() || self.network().is_none())
        {
            return Err(ValidationError::new(
                "hasDynamicSelf requires id2 and network set",
            ));
        }

        // 10. id2 implies copy or dynamic-self.
        if self.id2().is_some()
            && !self.is_copy()
            && !self.config_bit(config_bits::HAS_DYNAMIC_SELF)
        {
            return Err(ValidationError::new(
                "id2 set on node that is neither a copy nor dynamic-self",
            ));
        }

        // 11. Leaf restrictions.
        if self.is_leaf() {
            if self.config_bit(config_bits::ONLY_OWN_CHILDREN) {
                return Err(ValidationError::new("Leaf node cannot use onlyOwnChildren"));
            }
            if self.config_bit(config_bits::DISALLOW_PUBLIC_CHILDREN) {
                return Err(ValidationError::new(
                    "Leaf node cannot use disallowPublicChildren",
                ));
            }
            if self.child_min_difficulty().is_some() {
                return Err(ValidationError::new(
                    "Leaf node cannot set childMinDifficulty",
                ));
            }
            if self.begins_restrictive_write() || self.ends_restrictive_write() {
                return Err(ValidationError::new(
                    "Leaf node cannot use restrictive writer mode",
                ));
            }
        }

        // 12. Proof of work.
        if !self.verify_work() {
            return Err(ValidationError::new("Proof of work does not verify"));
        }

        // 13 (cert half). Deep validation of the signing cert.
        if level != ValidateLevel::Structural {
            self.validate_cert_deep(level, at_time)?;
        }
        Ok(())
    }

    fn validate_cert_deep(
        &self,
        level: ValidateLevel,
        at_time: Option<u64>,
    ) -> std::result::Result<(), ValidationError> {
        let cert = match self.peek_cert() {
            Ok(cert) => cert,
            Err(err) => {
                return Err(ValidationError::new(format!("Cert does not decode: {err}")))
            }
        };
        let cert = match cert {
            Some(cert) => cert,
            None => return Ok(()),
        };

        cert.validate(at_time)?;

        let owner = self.owner().unwrap_or([0u8; 32]);
        if cert.issuer_public_key() != Some(owner) {
            return Err(ValidationError::new("Node owner mismatches cert issuer"));
        }

        if level == ValidateLevel::Full {
            if let Some(threshold) = cert.multisig_threshold() {
                if (self.signature_count() as u64) < threshold {
                    return Err(ValidationError::new(
                        "Signature count below cert multisig threshold",
                    ));
                }
            }
        }

        if self.config_bit(config_bits::HAS_DYNAMIC_CERT) != cert.is_dynamic() {
            return Err(ValidationError::new(
                "hasDynamicCert mismatches cert dynamic flag",
            ));
        }

        let params = crate::cert::TargetParams {
            model_type: self.model_type(),
            creation_time: self.creation_time().unwrap_or(0),
            expire_time: self.expire_time(),
            owner,
        };
        cert.validate_against_target(&params)?;
        Ok(())
    }

    /// Embedding rules between this embedder and a decoded embedded node
    pub(crate) fn validate_embedding(
        &self,
        embedded: &NodeBase,
    ) -> std::result::Result<(), ValidationError> {
        if !embedded.allows_embed() {
            return Err(ValidationError::new("Embedded node does not allow embedding"));
        }
        if embedded.parent_id() != self.parent_id() && !embedded.allows_embed_move() {
            return Err(ValidationError::new(
                "Embedded node moved parents without allowEmbedMove",
            ));
        }
        if embedded.is_private() && !self.is_private() {
            return Err(ValidationError::new(
                "Private embedded node forbids a public or licensed embedder",
            ));
        }
        Ok(())
    }

    /// Raw field value access, used by the storage driver's filters
    pub fn field_value(&self, name: &str) -> Option<&Value> {
        self.model.get_value(name)
    }
}

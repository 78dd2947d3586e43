//! Certificate family
//!
//! A certificate binds a set of constraints: a validity window, the model
//! type it may sign for, the eligible signer keys, an optional multi-sig
//! threshold, and the issuer key. `SignCert` authorizes a set of keys to
//! sign nodes owned by the issuer. `FriendCert` binds two counterparties
//! inside a License and validates mutually.

use std::sync::Arc;

use trellis_crypto::{hash_parts, HashPart, KeyPair};
use trellis_model::{Model, Schema};

use crate::error::{NodeError, Result, ValidationError};
use crate::schema::{self, cert_dynamic_bits, field};

/// Parameters of the model a certificate is validated against
#[derive(Clone, Copy, Debug)]
pub struct TargetParams {
    /// 6-byte model type header of the target
    pub model_type: [u8; 6],
    /// Target creation time, ms
    pub creation_time: u64,
    /// Target expire time, ms
    pub expire_time: Option<u64>,
    /// Target owner public key
    pub owner: [u8; 32],
}

fn get32(model: &Model, name: &str) -> Option<[u8; 32]> {
    model.get_bytes(name).and_then(|b| b.try_into().ok())
}

/// Detached signature over a certificate's canonical hash
fn cert_sign(model: &mut Model, keypair: &KeyPair) -> Result<()> {
    let digest = model.hash(&[]);
    let signature = keypair.sign(&digest);
    let entry = trellis_crypto::pack_entry(0, &signature);
    model.set_bytes(field::SIGNATURE, &entry)?;

    let id1 = hash_parts(&[HashPart::Bytes(&digest), HashPart::Bytes(&entry)]);
    model.set_bytes(field::ID1, &id1)?;
    Ok(())
}

fn cert_verify(model: &Model) -> bool {
    let issuer = match get32(model, field::ISSUER) {
        Some(key) => key,
        None => return false,
    };
    let buffer = match model.get_bytes(field::SIGNATURE) {
        Some(bytes) => bytes,
        None => return false,
    };
    let entries = match trellis_crypto::unpack_entries(buffer) {
        Ok(entries) => entries,
        Err(_) => return false,
    };
    let digest = model.hash(&[]);
    entries.iter().all(|entry| {
        trellis_crypto::verify_signature(&issuer, &digest, &entry.signature).unwrap_or(false)
    })
}

/// Shared window/type/signature checks for both certificate kinds
fn cert_validate(model: &Model, at_time: Option<u64>) -> std::result::Result<(), ValidationError> {
    let creation = model
        .get_uint(field::CREATION_TIME)
        .ok_or_else(|| ValidationError::new("Cert must have creationTime set"))?;
    let expire = model
        .get_uint(field::EXPIRE_TIME)
        .ok_or_else(|| ValidationError::new("Cert must have expireTime set"))?;
    if creation >= expire {
        return Err(ValidationError::new(
            "Cert creationTime must precede expireTime",
        ));
    }
    if let Some(now) = at_time {
        if now >= expire {
            return Err(ValidationError::new("Cert is expired"));
        }
        if now < creation {
            return Err(ValidationError::new("Cert is not yet valid"));
        }
    }
    if model.get_bytes(field::ISSUER).is_none() {
        return Err(ValidationError::new("Cert must have issuer set"));
    }
    if !cert_verify(model) {
        return Err(ValidationError::new("Cert signature does not verify"));
    }
    Ok(())
}

/// Window and target-type coverage common to both certificate kinds
fn cert_covers_target(
    model: &Model,
    target_type: &[u8; 6],
    from_time: u64,
    to_time: Option<u64>,
) -> std::result::Result<(), ValidationError> {
    let creation = model.get_uint(field::CREATION_TIME).unwrap_or(0);
    let expire = model.get_uint(field::EXPIRE_TIME).unwrap_or(0);
    if from_time < creation {
        return Err(ValidationError::new(
            "Target creationTime precedes cert validity window",
        ));
    }
    if from_time >= expire || to_time.map(|t| t > expire).unwrap_or(false) {
        return Err(ValidationError::new(
            "Target lifetime exceeds cert validity window",
        ));
    }
    if let Some(accepted) = model.get_bytes(field::TARGET_TYPE) {
        if !target_type.starts_with(accepted) {
            return Err(ValidationError::new(
                "Cert does not accept the target model type",
            ));
        }
    }
    Ok(())
}

/// A node-signing certificate
#[derive(Clone, Debug)]
pub struct SignCert {
    model: Model,
}

impl SignCert {
    pub fn new() -> Result<Self> {
        let schema = Arc::new(schema::sign_cert_schema()?);
        Ok(Self {
            model: Model::new(schema),
        })
    }

    /// Load from a wire image
    pub fn load(image: &[u8]) -> Result<Self> {
        let schema = Arc::new(schema::sign_cert_schema()?);
        Ok(Self {
            model: Model::load(schema, image, false)?,
        })
    }

    /// Export the wire image
    pub fn export(&self) -> Result<Vec<u8>> {
        Ok(self.model.export(false)?)
    }

    pub fn model_type(&self) -> [u8; 6] {
        *self.model.schema().model_type().as_bytes()
    }

    // === Constraint fields ===

    pub fn set_issuer(&mut self, issuer: &[u8; 32]) -> Result<()> {
        Ok(self.model.set_bytes(field::ISSUER, issuer)?)
    }

    pub fn issuer_public_key(&self) -> Option<[u8; 32]> {
        get32(&self.model, field::ISSUER)
    }

    /// Set the eligible signer keys, packed as concatenated 32-byte keys
    pub fn set_target_public_keys(&mut self, keys: &[[u8; 32]]) -> Result<()> {
        let mut packed = Vec::with_capacity(keys.len() * 32);
        for key in keys {
            packed.extend_from_slice(key);
        }
        Ok(self.model.set_bytes(field::TARGET_PUBLIC_KEYS, &packed)?)
    }

    /// Eligible signer keys in declaration order
    pub fn target_public_keys(&self) -> Vec<[u8; 32]> {
        self.model
            .get_bytes(field::TARGET_PUBLIC_KEYS)
            .map(|packed| {
                packed
                    .chunks_exact(32)
                    .map(|chunk| chunk.try_into().unwrap_or([0u8; 32]))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_multisig_threshold(&mut self, threshold: u8) -> Result<()> {
        Ok(self
            .model
            .set_uint(field::MULTISIG_THRESHOLD, threshold as u64)?)
    }

    pub fn multisig_threshold(&self) -> Option<u64> {
        self.model.get_uint(field::MULTISIG_THRESHOLD)
    }

    /// Restrict the model types this cert may sign (prefix match)
    pub fn set_target_type(&mut self, prefix: &[u8]) -> Result<()> {
        Ok(self.model.set_bytes(field::TARGET_TYPE, prefix)?)
    }

    pub fn set_validity(&mut self, creation_time: u64, expire_time: u64) -> Result<()> {
        self.model.set_uint(field::CREATION_TIME, creation_time)?;
        self.model.set_uint(field::EXPIRE_TIME, expire_time)?;
        Ok(())
    }

    pub fn set_constraints(&mut self, constraints: &[u8; 32]) -> Result<()> {
        Ok(self.model.set_bytes(field::CONSTRAINTS, constraints)?)
    }

    pub fn set_online_validated(&mut self, online: bool) -> Result<()> {
        let flags = if online {
            1u64 << cert_dynamic_bits::ONLINE_VALIDATED
        } else {
            0
        };
        Ok(self.model.set_uint(field::DYNAMIC_FLAGS, flags)?)
    }

    /// Whether this cert is online-validated ("dynamic")
    pub fn is_dynamic(&self) -> bool {
        self.model
            .get_uint(field::DYNAMIC_FLAGS)
            .map(|flags| flags & (1 << cert_dynamic_bits::ONLINE_VALIDATED) != 0)
            .unwrap_or(false)
    }

    // === Lifecycle ===

    pub fn sign(&mut self, keypair: &KeyPair) -> Result<()> {
        cert_sign(&mut self.model, keypair)
    }

    pub fn verify(&self) -> bool {
        cert_verify(&self.model)
    }

    /// Structural and signature validation
    pub fn validate(&self, at_time: Option<u64>) -> std::result::Result<(), ValidationError> {
        cert_validate(&self.model, at_time)?;
        if self.target_public_keys().is_empty() {
            return Err(ValidationError::new("Cert must name at least one signer"));
        }
        if let Some(threshold) = self.multisig_threshold() {
            if threshold as usize > self.target_public_keys().len() {
                return Err(ValidationError::new(
                    "Cert multisig threshold exceeds signer count",
                ));
            }
        }
        Ok(())
    }

    /// Validate this cert against the node it signs
    pub fn validate_against_target(
        &self,
        params: &TargetParams,
    ) -> std::result::Result<(), ValidationError> {
        cert_covers_target(
            &self.model,
            &params.model_type,
            params.creation_time,
            params.expire_time,
        )?;
        let issuer = self
            .issuer_public_key()
            .ok_or_else(|| ValidationError::new("Cert must have issuer set"))?;
        if issuer != params.owner {
            return Err(ValidationError::new("Node owner mismatches cert issuer"));
        }
        Ok(())
    }
}

/// A friend certificate binding two counterparties inside a License
#[derive(Clone, Debug)]
pub struct FriendCert {
    model: Model,
}

impl FriendCert {
    pub fn new() -> Result<Self> {
        let schema: Arc<Schema> = Arc::new(schema::friend_cert_schema()?);
        Ok(Self {
            model: Model::new(schema),
        })
    }

    pub fn load(image: &[u8]) -> Result<Self> {
        let schema = Arc::new(schema::friend_cert_schema()?);
        Ok(Self {
            model: Model::load(schema, image, false)?,
        })
    }

    pub fn export(&self) -> Result<Vec<u8>> {
        Ok(self.model.export(false)?)
    }

    // === Constraint fields ===

    pub fn set_issuer(&mut self, issuer: &[u8; 32]) -> Result<()> {
        Ok(self.model.set_bytes(field::ISSUER, issuer)?)
    }

    pub fn issuer_public_key(&self) -> Option<[u8; 32]> {
        get32(&self.model, field::ISSUER)
    }

    pub fn set_keys(&mut self, key_a: &[u8; 32], key_b: &[u8; 32]) -> Result<()> {
        self.model.set_bytes(field::KEY_A, key_a)?;
        self.model.set_bytes(field::KEY_B, key_b)?;
        Ok(())
    }

    pub fn key_a(&self) -> Option<[u8; 32]> {
        get32(&self.model, field::KEY_A)
    }

    pub fn key_b(&self) -> Option<[u8; 32]> {
        get32(&self.model, field::KEY_B)
    }

    pub fn set_friend_level(&mut self, level: u8) -> Result<()> {
        Ok(self.model.set_uint(field::FRIEND_LEVEL, level as u64)?)
    }

    pub fn friend_level(&self) -> Option<u64> {
        self.model.get_uint(field::FRIEND_LEVEL)
    }

    pub fn set_intermediary(&mut self, key: &[u8; 32]) -> Result<()> {
        Ok(self.model.set_bytes(field::INTERMEDIARY_PUBLIC_KEY, key)?)
    }

    pub fn intermediary(&self) -> Option<[u8; 32]> {
        get32(&self.model, field::INTERMEDIARY_PUBLIC_KEY)
    }

    pub fn set_constraints(&mut self, constraints: &[u8; 32]) -> Result<()> {
        Ok(self.model.set_bytes(field::CONSTRAINTS, constraints)?)
    }

    pub fn constraints(&self) -> Option<[u8; 32]> {
        get32(&self.model, field::CONSTRAINTS)
    }

    pub fn set_validity(&mut self, creation_time: u64, expire_time: u64) -> Result<()> {
        self.model.set_uint(field::CREATION_TIME, creation_time)?;
        self.model.set_uint(field::EXPIRE_TIME, expire_time)?;
        Ok(())
    }

    pub fn set_target_type(&mut self, prefix: &[u8]) -> Result<()> {
        Ok(self.model.set_bytes(field::TARGET_TYPE, prefix)?)
    }

    pub fn set_online_validated(&mut self, online: bool) -> Result<()> {
        let flags = if online {
            1u64 << cert_dynamic_bits::ONLINE_VALIDATED
        } else {
            0
        };
        Ok(self.model.set_uint(field::DYNAMIC_FLAGS, flags)?)
    }

    pub fn is_dynamic(&self) -> bool {
        self.model
            .get_uint(field::DYNAMIC_FLAGS)
            .map(|flags| flags & (1 << cert_dynamic_bits::ONLINE_VALIDATED) != 0)
            .unwrap_or(false)
    }

    // === Lifecycle ===

    pub fn sign(&mut self, keypair: &KeyPair) -> Result<()> {
        cert_sign(&mut self.model, keypair)
    }

    pub fn verify(&self) -> bool {
        cert_verify(&self.model)
    }

    pub fn validate(&self, at_time: Option<u64>) -> std::result::Result<(), ValidationError> {
        cert_validate(&self.model, at_time)?;
        if self.key_a().is_none() || self.key_b().is_none() {
            return Err(ValidationError::new("Friend cert must bind two keys"));
        }
        Ok(())
    }

    /// Mutual pairing validation of two friend certs inside a License
    ///
    /// A's cert must name B's key and vice versa; constraints, friendLevel,
    /// and intermediary must agree; both must cover the License's lifetime
    /// and model type.
    pub fn validate_pair(
        cert_a: &FriendCert,
        cert_b: &FriendCert,
        license_type: &[u8; 6],
        license_creation: u64,
        license_expire: u64,
    ) -> Result<()> {
        let mismatch = |reason: &'static str| NodeError::FriendCertMismatch(reason);

        let (a_a, a_b) = (cert_a.key_a(), cert_a.key_b());
        let (b_a, b_b) = (cert_b.key_a(), cert_b.key_b());
        if a_a.is_none() || a_b.is_none() || b_a.is_none() || b_b.is_none() {
            return Err(mismatch("friend cert missing a counterparty key"));
        }
        if a_b != b_a || b_b != a_a {
            return Err(mismatch("counterparty keys do not cross-reference"));
        }
        if cert_a.constraints() != cert_b.constraints() {
            return Err(mismatch("constraints do not agree"));
        }
        if cert_a.friend_level() != cert_b.friend_level() {
            return Err(mismatch("friend levels do not agree"));
        }
        if cert_a.intermediary() != cert_b.intermediary() {
            return Err(mismatch("intermediary keys do not agree"));
        }
        for cert in [cert_a, cert_b] {
            cert_covers_target(
                &cert.model,
                license_type,
                license_creation,
                Some(license_expire),
            )
            .map_err(|_| mismatch("cert does not cover the license lifetime or type"))?;
            if !cert.verify() {
                return Err(mismatch("cert signature does not verify"));
            }
        }
        Ok(())
    }
}

//! Field tables, interface ids, and configuration bits for the node family
//!
//! Field indices are stable wire tags. The base table is shared by every
//! node kind; Data and License add their own fields above index 31.
//! Certificates use a separate primary interface with their own tables.

use trellis_model::{FieldDef, FieldType, ModelType, Schema};

use crate::error::Result;

/// Primary interface id for nodes
pub const PRIMARY_NODE: u8 = 4;
/// Primary interface id for certificates
pub const PRIMARY_CERT: u8 = 3;

/// Secondary interface id for Data nodes
pub const SECONDARY_DATA: u8 = 1;
/// Secondary interface id for License nodes
pub const SECONDARY_LICENSE: u8 = 2;
/// Secondary interface id for node-signing certificates
pub const SECONDARY_SIGN_CERT: u8 = 1;
/// Secondary interface id for friend certificates
pub const SECONDARY_FRIEND_CERT: u8 = 2;

/// Upper bound on licensing distances
pub const MAX_LICENSE_DISTANCE: u8 = 2;

/// Upper bound on license extensions
pub const MAX_LICENSE_EXTENSIONS: u64 = 6;

/// Content type carried by destruction-marker Data nodes
pub const DESTROY_CONTENT_TYPE: &str = "trellis/destroy";
/// Content type carried by whole-owner destruction markers
pub const DESTROY_ALL_CONTENT_TYPE: &str = "trellis/destroy-all";

/// Node `config` bitset values
pub mod config_bits {
    pub const IS_LEAF: u8 = 0;
    pub const HAS_DYNAMIC_SELF: u8 = 1;
    pub const HAS_DYNAMIC_CERT: u8 = 2;
    pub const HAS_DYNAMIC_EMBEDDING: u8 = 3;
    pub const IS_PUBLIC: u8 = 4;
    pub const IS_LICENSED: u8 = 5;
    pub const ALLOW_EMBED: u8 = 6;
    pub const ALLOW_EMBED_MOVE: u8 = 7;
    pub const IS_UNIQUE: u8 = 8;
    pub const IS_BEGIN_RESTRICTIVEWRITE_MODE: u8 = 9;
    pub const IS_END_RESTRICTIVEWRITE_MODE: u8 = 10;
    pub const IS_INDESTRUCTIBLE: u8 = 11;
    pub const HAS_RIGHTS_BY_ASSOCIATION: u8 = 12;
    pub const DISALLOW_PARENT_LICENSING: u8 = 13;
    pub const ONLY_OWN_CHILDREN: u8 = 14;
    pub const DISALLOW_PUBLIC_CHILDREN: u8 = 15;
}

/// Node `transientConfig` bitset values
///
/// Transient bits are environment-maintained. They are not part of `hash()`
/// but are part of `hash_transient()`.
pub mod transient_bits {
    pub const DYNAMIC_SELF_ACTIVE: u8 = 0;
    pub const DYNAMIC_CERT_ACTIVE: u8 = 1;
    pub const DYNAMIC_EMBEDDING_ACTIVE: u8 = 2;
    pub const DYNAMIC_DESTROYED: u8 = 3;
}

/// License `licenseConfig` bitset values
pub mod license_config_bits {
    pub const ALLOW_TARGET_SEND_PRIVATELY: u8 = 0;
    pub const DISALLOW_RETRO_LICENSING: u8 = 1;
    pub const RESTRICTIVEMODE_WRITER: u8 = 2;
    pub const RESTRICTIVEMODE_MANAGER: u8 = 3;
    pub const HAS_DYNAMIC_FRIENDCERT: u8 = 4;
}

/// Certificate `dynamicFlags` bitset values
pub mod cert_dynamic_bits {
    pub const ONLINE_VALIDATED: u8 = 0;
}

// Field names, shared with getters/setters.
pub mod field {
    pub const ID1: &str = "id1";
    pub const ID2: &str = "id2";
    pub const PARENT_ID: &str = "parentId";
    pub const CONFIG: &str = "config";
    pub const OWNER: &str = "owner";
    pub const SIGNATURE: &str = "signature";
    pub const CREATION_TIME: &str = "creationTime";
    pub const EXPIRE_TIME: &str = "expireTime";
    pub const DIFFICULTY: &str = "difficulty";
    pub const NONCE: &str = "nonce";
    pub const REF_ID: &str = "refId";
    pub const CERT: &str = "cert";
    pub const EMBEDDED: &str = "embedded";
    pub const BLOB_HASH: &str = "blobHash";
    pub const BLOB_LENGTH: &str = "blobLength";
    pub const LICENSE_MIN_DISTANCE: &str = "licenseMinDistance";
    pub const LICENSE_MAX_DISTANCE: &str = "licenseMaxDistance";
    pub const REGION: &str = "region";
    pub const JURISDICTION: &str = "jurisdiction";
    pub const CHILD_MIN_DIFFICULTY: &str = "childMinDifficulty";
    pub const COPIED_SIGNATURE: &str = "copiedSignature";
    pub const COPIED_PARENT_ID: &str = "copiedParentId";
    pub const COPIED_ID1: &str = "copiedId1";
    pub const NETWORK: &str = "network";
    pub const TRANSIENT_CONFIG: &str = "transientConfig";

    pub const CONTENT_TYPE: &str = "contentType";
    pub const DATA: &str = "data";

    pub const TARGET_PUBLIC_KEY: &str = "targetPublicKey";
    pub const TERMS: &str = "terms";
    pub const EXTENSIONS: &str = "extensions";
    pub const FRIEND_LEVEL: &str = "friendLevel";
    pub const FRIEND_CERT_A: &str = "friendCertA";
    pub const FRIEND_CERT_B: &str = "friendCertB";
    pub const JUMP_PEER_PUBLIC_KEY: &str = "jumpPeerPublicKey";
    pub const PARENT_PATH_HASH: &str = "parentPathHash";
    pub const MAX_DISTANCE: &str = "maxDistance";
    pub const LICENSE_CONFIG: &str = "licenseConfig";

    pub const ISSUER: &str = "issuer";
    pub const TARGET_PUBLIC_KEYS: &str = "targetPublicKeys";
    pub const MULTISIG_THRESHOLD: &str = "multisigThreshold";
    pub const TARGET_TYPE: &str = "targetType";
    pub const MAX_CHAIN_LENGTH: &str = "maxChainLength";
    pub const CONSTRAINTS: &str = "constraints";
    pub const DYNAMIC_FLAGS: &str = "dynamicFlags";
    pub const KEY_A: &str = "keyA";
    pub const KEY_B: &str = "keyB";
    pub const INTERMEDIARY_PUBLIC_KEY: &str = "intermediaryPublicKey";
}

use field::*;

/// Maximum packed signature entries on a node
const MAX_SIGNATURES: usize = 16;

fn node_base_fields() -> Vec<FieldDef> {
    vec![
        FieldDef::new(0, ID1, FieldType::Bytes32).unhashed(),
        FieldDef::new(1, ID2, FieldType::Bytes32).unhashed(),
        FieldDef::new(2, PARENT_ID, FieldType::Bytes32),
        FieldDef::new(3, CONFIG, FieldType::UInt16),
        FieldDef::new(4, OWNER, FieldType::Bytes32),
        FieldDef::new(5, SIGNATURE, FieldType::Bytes { max: 65 * MAX_SIGNATURES }).unhashed(),
        FieldDef::new(6, CREATION_TIME, FieldType::UInt48),
        FieldDef::new(7, EXPIRE_TIME, FieldType::UInt48),
        FieldDef::new(8, DIFFICULTY, FieldType::UInt8),
        FieldDef::new(9, NONCE, FieldType::Bytes8).unhashed(),
        FieldDef::new(10, REF_ID, FieldType::Bytes32),
        FieldDef::new(11, CERT, FieldType::Bytes { max: 4096 }),
        FieldDef::new(12, EMBEDDED, FieldType::Bytes { max: 8192 }),
        FieldDef::new(13, BLOB_HASH, FieldType::Bytes32),
        FieldDef::new(14, BLOB_LENGTH, FieldType::UInt64),
        FieldDef::new(15, LICENSE_MIN_DISTANCE, FieldType::UInt8),
        FieldDef::new(16, LICENSE_MAX_DISTANCE, FieldType::UInt8),
        FieldDef::new(17, REGION, FieldType::Utf8 { max: 2 }),
        FieldDef::new(18, JURISDICTION, FieldType::Utf8 { max: 2 }),
        FieldDef::new(19, CHILD_MIN_DIFFICULTY, FieldType::UInt8),
        FieldDef::new(20, COPIED_SIGNATURE, FieldType::Bytes { max: 65 * MAX_SIGNATURES }),
        FieldDef::new(21, COPIED_PARENT_ID, FieldType::Bytes32),
        FieldDef::new(22, COPIED_ID1, FieldType::Bytes32),
        FieldDef::new(23, NETWORK, FieldType::Utf8 { max: 32 }),
        FieldDef::new(24, TRANSIENT_CONFIG, FieldType::UInt8).transient(),
    ]
}

/// Schema for Data nodes
pub fn data_schema() -> Result<Schema> {
    let extra = [
        FieldDef::new(32, CONTENT_TYPE, FieldType::Utf8 { max: 64 }),
        FieldDef::new(33, DATA, FieldType::Bytes { max: 1024 }),
    ];
    let ty = ModelType::new(PRIMARY_NODE, SECONDARY_DATA, 1, 0);
    Ok(Schema::merge(ty, &node_base_fields(), &extra)?)
}

/// Schema for License nodes
///
/// Licenses are always leaf and carry no blob, so the blob fields and the
/// child-difficulty knob are disabled rather than merely unused.
pub fn license_schema() -> Result<Schema> {
    let extra = [
        FieldDef::new(13, BLOB_HASH, FieldType::Disabled),
        FieldDef::new(14, BLOB_LENGTH, FieldType::Disabled),
        FieldDef::new(19, CHILD_MIN_DIFFICULTY, FieldType::Disabled),
        FieldDef::new(32, TARGET_PUBLIC_KEY, FieldType::Bytes32),
        FieldDef::new(33, TERMS, FieldType::Utf8 { max: 2048 }),
        FieldDef::new(34, EXTENSIONS, FieldType::UInt8),
        FieldDef::new(35, FRIEND_LEVEL, FieldType::UInt8),
        FieldDef::new(36, FRIEND_CERT_A, FieldType::Bytes { max: 2048 }),
        FieldDef::new(37, FRIEND_CERT_B, FieldType::Bytes { max: 2048 }),
        FieldDef::new(38, JUMP_PEER_PUBLIC_KEY, FieldType::Bytes32),
        FieldDef::new(39, PARENT_PATH_HASH, FieldType::Bytes32),
        FieldDef::new(40, MAX_DISTANCE, FieldType::UInt8),
        FieldDef::new(41, LICENSE_CONFIG, FieldType::UInt8),
    ];
    let ty = ModelType::new(PRIMARY_NODE, SECONDARY_LICENSE, 2, 0);
    Ok(Schema::merge(ty, &node_base_fields(), &extra)?)
}

/// Schema for node-signing certificates
pub fn sign_cert_schema() -> Result<Schema> {
    let fields = [
        FieldDef::new(0, ID1, FieldType::Bytes32).unhashed(),
        FieldDef::new(1, ISSUER, FieldType::Bytes32),
        FieldDef::new(2, TARGET_PUBLIC_KEYS, FieldType::Bytes { max: 32 * MAX_SIGNATURES }),
        FieldDef::new(3, MULTISIG_THRESHOLD, FieldType::UInt8),
        FieldDef::new(4, TARGET_TYPE, FieldType::Bytes { max: 6 }),
        FieldDef::new(5, CREATION_TIME, FieldType::UInt48),
        FieldDef::new(6, EXPIRE_TIME, FieldType::UInt48),
        FieldDef::new(7, MAX_CHAIN_LENGTH, FieldType::UInt8),
        FieldDef::new(8, CONSTRAINTS, FieldType::Bytes32),
        FieldDef::new(9, DYNAMIC_FLAGS, FieldType::UInt8),
        FieldDef::new(10, SIGNATURE, FieldType::Bytes { max: 65 * MAX_SIGNATURES }).unhashed(),
    ];
    let ty = ModelType::new(PRIMARY_CERT, SECONDARY_SIGN_CERT, 1, 0);
    Ok(Schema::merge(ty, &fields, &[])?)
}

/// Schema for friend certificates
pub fn friend_cert_schema() -> Result<Schema> {
    let fields = [
        FieldDef::new(0, ID1, FieldType::Bytes32).unhashed(),
        FieldDef::new(1, ISSUER, FieldType::Bytes32),
        FieldDef::new(2, KEY_A, FieldType::Bytes32),
        FieldDef::new(3, KEY_B, FieldType::Bytes32),
        FieldDef::new(4, FRIEND_LEVEL, FieldType::UInt8),
        FieldDef::new(5, INTERMEDIARY_PUBLIC_KEY, FieldType::Bytes32),
        FieldDef::new(6, CONSTRAINTS, FieldType::Bytes32),
        FieldDef::new(7, CREATION_TIME, FieldType::UInt48),
        FieldDef::new(8, EXPIRE_TIME, FieldType::UInt48),
        FieldDef::new(9, TARGET_TYPE, FieldType::Bytes { max: 6 }),
        FieldDef::new(10, DYNAMIC_FLAGS, FieldType::UInt8),
        FieldDef::new(11, SIGNATURE, FieldType::Bytes { max: 65 * 2 }).unhashed(),
    ];
    let ty = ModelType::new(PRIMARY_CERT, SECONDARY_FRIEND_CERT, 2, 0);
    Ok(Schema::merge(ty, &fields, &[])?)
}

// Domain-separation tags for derived hash families.
pub mod tags {
    pub const ACHILLES_ID: &[u8] = b"trellis:achilles:id";
    pub const ACHILLES_OWNER: &[u8] = b"trellis:achilles:owner";
    pub const ACHILLES_LICENSE: &[u8] = b"trellis:achilles:license";
    pub const BUMP: &[u8] = b"trellis:bump";
    pub const LICENSEE: &[u8] = b"trellis:licensee";
}

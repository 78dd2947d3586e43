//! Model schemas - the 6-byte type header plus the field table
//!
//! A schema is assembled by merging a base field table with subclass
//! additions. A duplicate index is a hard error, with one exception: a
//! subclass may disable an inherited field by re-declaring it (same index,
//! same name) with the `Disabled` type.

use crate::error::{ModelError, Result};

/// The 6-byte model type header
///
/// `[0, primary-interface, 0, secondary-interface, class, major-version]`
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelType(pub [u8; 6]);

impl ModelType {
    pub fn new(primary: u8, secondary: u8, class: u8, major: u8) -> Self {
        Self([0, primary, 0, secondary, class, major])
    }

    pub fn primary(&self) -> u8 {
        self.0[1]
    }

    pub fn secondary(&self) -> u8 {
        self.0[3]
    }

    pub fn class(&self) -> u8 {
        self.0[4]
    }

    pub fn major(&self) -> u8 {
        self.0[5]
    }

    /// First four header bytes - the interface prefix without class/version
    pub fn interface_prefix(&self) -> [u8; 4] {
        [self.0[0], self.0[1], self.0[2], self.0[3]]
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl std::fmt::Debug for ModelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ModelType({})", hex::encode(self.0))
    }
}

/// Field value type
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldType {
    /// Unsigned big-endian integer, 8 bits
    UInt8,
    /// Unsigned big-endian integer, 16 bits
    UInt16,
    /// Unsigned big-endian integer, 32 bits
    UInt32,
    /// Unsigned big-endian integer, 48 bits
    UInt48,
    /// Unsigned big-endian integer, 64 bits
    UInt64,
    /// Fixed 8-byte buffer
    Bytes8,
    /// Fixed 32-byte buffer
    Bytes32,
    /// Variable-length buffer
    Bytes { max: usize },
    /// UTF-8 string, not NUL-terminated
    Utf8 { max: usize },
    /// Sentinel: field rejects writes and reads as absent
    Disabled,
}

impl FieldType {
    /// Width in bytes for fixed-size types
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            FieldType::UInt8 => Some(1),
            FieldType::UInt16 => Some(2),
            FieldType::UInt32 => Some(4),
            FieldType::UInt48 => Some(6),
            FieldType::UInt64 => Some(8),
            FieldType::Bytes8 => Some(8),
            FieldType::Bytes32 => Some(32),
            _ => None,
        }
    }

    /// Integer bit width, when this is an integer type
    pub fn int_bits(&self) -> Option<u32> {
        match self {
            FieldType::UInt8 => Some(8),
            FieldType::UInt16 => Some(16),
            FieldType::UInt32 => Some(32),
            FieldType::UInt48 => Some(48),
            FieldType::UInt64 => Some(64),
            _ => None,
        }
    }
}

/// One field definition
#[derive(Clone, Copy, Debug)]
pub struct FieldDef {
    /// Stable numeric index, the wire tag
    pub index: u8,
    /// Name used by typed getters/setters
    pub name: &'static str,
    /// Value type
    pub ty: FieldType,
    /// Participates in the canonical digest
    pub hashed: bool,
    /// Excluded from persistence and hashing unless explicitly opted in
    pub transient: bool,
}

impl FieldDef {
    pub const fn new(index: u8, name: &'static str, ty: FieldType) -> Self {
        Self {
            index,
            name,
            ty,
            hashed: true,
            transient: false,
        }
    }

    /// Exempt this field from the canonical digest
    pub const fn unhashed(mut self) -> Self {
        self.hashed = false;
        self
    }

    /// Mark this field transient
    pub const fn transient(mut self) -> Self {
        self.transient = true;
        self.hashed = false;
        self
    }
}

/// A complete model schema: header plus field table sorted by index
#[derive(Clone, Debug)]
pub struct Schema {
    model_type: ModelType,
    fields: Vec<FieldDef>,
}

impl Schema {
    /// Build a schema by merging a base field table with subclass additions
    ///
    /// Duplicate indices are a hard error unless the extra entry disables
    /// the base field (same index, same name, `Disabled` type).
    pub fn merge(model_type: ModelType, base: &[FieldDef], extra: &[FieldDef]) -> Result<Self> {
        let mut fields: Vec<FieldDef> = base.to_vec();

        for def in extra {
            match fields.iter_mut().find(|f| f.index == def.index) {
                Some(existing) => {
                    if def.ty == FieldType::Disabled && existing.name == def.name {
                        existing.ty = FieldType::Disabled;
                    } else {
                        return Err(ModelError::DuplicateFieldIndex {
                            index: def.index,
                            existing: existing.name,
                            incoming: def.name,
                        });
                    }
                }
                None => fields.push(*def),
            }
        }

        fields.sort_by_key(|f| f.index);
        Ok(Self { model_type, fields })
    }

    pub fn model_type(&self) -> ModelType {
        self.model_type
    }

    /// Fields in ascending index order
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn field_by_name(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_by_index(&self, index: u8) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.index == index)
    }
}

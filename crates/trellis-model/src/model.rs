//! The Model record: sparse, index-addressed fields behind a schema
//!
//! Wire format: the 6-byte header, then for each set field in strictly
//! ascending index order the triple `(index:1B, length:varint, value)`.
//! Integers are big-endian, strings are UTF-8 without terminator, lengths
//! are unsigned LEB128.

use std::collections::BTreeMap;
use std::sync::Arc;

use trellis_crypto::hash::Hasher;

use crate::error::{ModelError, Result};
use crate::filter::Filter;
use crate::schema::{FieldDef, FieldType, Schema};

/// A concrete field value
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    /// Integer of any declared width
    Uint(u64),
    /// Fixed or variable buffer
    Bytes(Vec<u8>),
    /// UTF-8 string
    Text(String),
}

/// A model record: schema plus sparse field values
#[derive(Clone, Debug)]
pub struct Model {
    schema: Arc<Schema>,
    values: BTreeMap<u8, Value>,
}

impl Model {
    /// Create an empty model for a schema
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            values: BTreeMap::new(),
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    // === Typed accessors ===

    /// Set an integer field
    pub fn set_uint(&mut self, name: &str, value: u64) -> Result<()> {
        let def = self.writable_field(name)?;
        let bits = def
            .ty
            .int_bits()
            .ok_or_else(|| ModelError::TypeMismatch(name.to_string()))?;
        if bits < 64 && value >= (1u64 << bits) {
            return Err(ModelError::TypeMismatch(name.to_string()));
        }
        self.values.insert(def.index, Value::Uint(value));
        Ok(())
    }

    /// Set a buffer field
    pub fn set_bytes(&mut self, name: &str, value: &[u8]) -> Result<()> {
        let def = self.writable_field(name)?;
        match def.ty {
            FieldType::Bytes8 | FieldType::Bytes32 => {
                let width = def.ty.fixed_width().unwrap_or(0);
                if value.len() != width {
                    return Err(ModelError::TypeMismatch(name.to_string()));
                }
            }
            FieldType::Bytes { max } => {
                if value.len() > max {
                    return Err(ModelError::ExceedsMaxSize {
                        name: name.to_string(),
                        max,
                        len: value.len(),
                    });
                }
            }
            _ => return Err(ModelError::TypeMismatch(name.to_string())),
        }
        self.values.insert(def.index, Value::Bytes(value.to_vec()));
        Ok(())
    }

    /// Set a string field
    pub fn set_text(&mut self, name: &str, value: &str) -> Result<()> {
        let def = self.writable_field(name)?;
        match def.ty {
            FieldType::Utf8 { max } => {
                if value.len() > max {
                    return Err(ModelError::ExceedsMaxSize {
                        name: name.to_string(),
                        max,
                        len: value.len(),
                    });
                }
            }
            _ => return Err(ModelError::TypeMismatch(name.to_string())),
        }
        self.values.insert(def.index, Value::Text(value.to_string()));
        Ok(())
    }

    /// Get an integer field; disabled or unset fields read as absent
    pub fn get_uint(&self, name: &str) -> Option<u64> {
        match self.readable_value(name)? {
            Value::Uint(v) => Some(*v),
            _ => None,
        }
    }

    /// Get a buffer field; disabled or unset fields read as absent
    pub fn get_bytes(&self, name: &str) -> Option<&[u8]> {
        match self.readable_value(name)? {
            Value::Bytes(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    /// Get a string field; disabled or unset fields read as absent
    pub fn get_text(&self, name: &str) -> Option<&str> {
        match self.readable_value(name)? {
            Value::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Raw value access by field name (absent for disabled fields)
    pub fn get_value(&self, name: &str) -> Option<&Value> {
        self.readable_value(name)
    }

    /// Remove a field value
    pub fn clear(&mut self, name: &str) -> Result<()> {
        let def = self
            .schema
            .field_by_name(name)
            .ok_or_else(|| ModelError::NoSuchField(name.to_string()))?;
        self.values.remove(&def.index);
        Ok(())
    }

    /// Whether the field currently holds a value (disabled fields are absent)
    pub fn is_set(&self, name: &str) -> bool {
        self.readable_value(name).is_some()
    }

    // === Wire codec ===

    /// Export to the canonical wire image
    ///
    /// Transient fields are skipped unless `include_transient` is set.
    pub fn export(&self, include_transient: bool) -> Result<Vec<u8>> {
        let mut image = Vec::with_capacity(64);
        image.extend_from_slice(self.schema.model_type().as_bytes());

        for (&index, value) in &self.values {
            let def = self
                .schema
                .field_by_index(index)
                .ok_or(ModelError::UnknownField(index))?;
            if def.transient && !include_transient {
                continue;
            }
            let bytes = encode_value(def, value);
            image.push(index);
            encode_varint(bytes.len(), &mut image);
            image.extend_from_slice(&bytes);
        }
        Ok(image)
    }

    /// Load a model from a wire image
    ///
    /// Transient bytes are discarded unless `preserve_transient` is set.
    pub fn load(schema: Arc<Schema>, image: &[u8], preserve_transient: bool) -> Result<Self> {
        if image.len() < 6 {
            return Err(ModelError::ShortRead(image.len()));
        }
        if image[..6] != schema.model_type().as_bytes()[..] {
            return Err(ModelError::HeaderMismatch {
                expected: hex::encode(schema.model_type().as_bytes()),
                got: hex::encode(&image[..6]),
            });
        }

        let mut model = Self::new(schema.clone());
        let mut pos = 6usize;
        let mut last_index: Option<u8> = None;

        while pos < image.len() {
            let index = image[pos];
            pos += 1;
            if let Some(last) = last_index {
                if index <= last {
                    return Err(ModelError::FieldOutOfOrder(index));
                }
            }
            last_index = Some(index);

            let def = *schema
                .field_by_index(index)
                .ok_or(ModelError::UnknownField(index))?;
            let len = decode_varint(image, &mut pos)?;
            if pos + len > image.len() {
                return Err(ModelError::ShortRead(pos));
            }
            let raw = &image[pos..pos + len];
            pos += len;

            if def.transient && !preserve_transient {
                continue;
            }
            let value = decode_value(&def, raw)?;
            model.values.insert(index, value);
        }
        Ok(model)
    }

    // === Hashing ===

    /// Canonical digest over hashable fields
    ///
    /// Concatenates `(index:1B || value-bytes)` for every set, non-transient
    /// field with the hash flag, in strict index order, and applies
    /// BLAKE2b-256 once. Fields named in `exclude` are skipped.
    pub fn hash(&self, exclude: &[&str]) -> [u8; 32] {
        let mut hasher = Hasher::new();
        for (&index, value) in &self.values {
            let def = match self.schema.field_by_index(index) {
                Some(def) => def,
                None => continue,
            };
            if def.transient || !def.hashed || exclude.contains(&def.name) {
                continue;
            }
            hasher.update(&[index]);
            hasher.update(&encode_value(def, value));
        }
        hasher.finalize()
    }

    /// Digest over the transient fields only
    ///
    /// Returns the digest of the empty string when no transient field is set.
    pub fn hash_transient(&self) -> [u8; 32] {
        let mut hasher = Hasher::new();
        for (&index, value) in &self.values {
            let def = match self.schema.field_by_index(index) {
                Some(def) => def,
                None => continue,
            };
            if !def.transient {
                continue;
            }
            hasher.update(&[index]);
            hasher.update(&encode_value(def, value));
        }
        hasher.finalize()
    }

    /// Wire bytes of one field's value, for hash-eq filters
    pub fn field_wire_bytes(&self, name: &str) -> Option<Vec<u8>> {
        let def = self.schema.field_by_name(name)?;
        if def.ty == FieldType::Disabled {
            return None;
        }
        self.values.get(&def.index).map(|v| encode_value(def, v))
    }

    // === Filters ===

    /// Evaluate an ordered list of predicates; all must hold
    pub fn cmp(&self, filters: &[Filter]) -> bool {
        filters.iter().all(|f| f.matches(self))
    }

    fn writable_field(&self, name: &str) -> Result<FieldDef> {
        let def = self
            .schema
            .field_by_name(name)
            .ok_or_else(|| ModelError::NoSuchField(name.to_string()))?;
        if def.ty == FieldType::Disabled {
            return Err(ModelError::DisabledField(name.to_string()));
        }
        Ok(*def)
    }

    fn readable_value(&self, name: &str) -> Option<&Value> {
        let def = self.schema.field_by_name(name)?;
        if def.ty == FieldType::Disabled {
            return None;
        }
        self.values.get(&def.index)
    }
}

fn encode_value(def: &FieldDef, value: &Value) -> Vec<u8> {
    match (def.ty, value) {
        (ty, Value::Uint(v)) => {
            let width = ty.fixed_width().unwrap_or(8);
            let be = v.to_be_bytes();
            be[8 - width..].to_vec()
        }
        (_, Value::Bytes(bytes)) => bytes.clone(),
        (_, Value::Text(text)) => text.as_bytes().to_vec(),
    }
}

fn decode_value(def: &FieldDef, raw: &[u8]) -> Result<Value> {
    match def.ty {
        FieldType::UInt8
        | FieldType::UInt16
        | FieldType::UInt32
        | FieldType::UInt48
        | FieldType::UInt64 => {
            let width = def.ty.fixed_width().unwrap_or(8);
            if raw.len() != width {
                return Err(ModelError::TypeMismatch(def.name.to_string()));
            }
            let mut be = [0u8; 8];
            be[8 - width..].copy_from_slice(raw);
            Ok(Value::Uint(u64::from_be_bytes(be)))
        }
        FieldType::Bytes8 | FieldType::Bytes32 => {
            let width = def.ty.fixed_width().unwrap_or(0);
            if raw.len() != width {
                return Err(ModelError::TypeMismatch(def.name.to_string()));
            }
            Ok(Value::Bytes(raw.to_vec()))
        }
        FieldType::Bytes { max } => {
            if raw.len() > max {
                return Err(ModelError::ExceedsMaxSize {
                    name: def.name.to_string(),
                    max,
                    len: raw.len(),
                });
            }
            Ok(Value::Bytes(raw.to_vec()))
        }
        FieldType::Utf8 { max } => {
            if raw.len() > max {
                return Err(ModelError::ExceedsMaxSize {
                    name: def.name.to_string(),
                    max,
                    len: raw.len(),
                });
            }
            let text = std::str::from_utf8(raw)
                .map_err(|_| ModelError::TypeMismatch(def.name.to_string()))?;
            Ok(Value::Text(text.to_string()))
        }
        FieldType::Disabled => Err(ModelError::DisabledField(def.name.to_string())),
    }
}

/// Unsigned LEB128
fn encode_varint(mut value: usize, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn decode_varint(image: &[u8], pos: &mut usize) -> Result<usize> {
    let mut value = 0usize;
    let mut shift = 0u32;
    loop {
        let byte = *image.get(*pos).ok_or(ModelError::ShortRead(*pos))?;
        *pos += 1;
        value |= ((byte & 0x7f) as usize) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 28 {
            return Err(ModelError::ShortRead(*pos));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ModelType;
    use proptest::prelude::*;

    fn test_schema() -> Arc<Schema> {
        let base = [
            FieldDef::new(0, "id", FieldType::Bytes32).unhashed(),
            FieldDef::new(1, "kind", FieldType::UInt8),
            FieldDef::new(2, "created", FieldType::UInt48),
            FieldDef::new(3, "payload", FieldType::Bytes { max: 64 }),
            FieldDef::new(4, "label", FieldType::Utf8 { max: 16 }),
            FieldDef::new(5, "nonce", FieldType::Bytes8).unhashed(),
            FieldDef::new(6, "flags", FieldType::UInt8).transient(),
            FieldDef::new(7, "off", FieldType::Disabled),
        ];
        Arc::new(Schema::merge(ModelType::new(4, 1, 1, 0), &base, &[]).unwrap())
    }

    fn populated() -> Model {
        let mut m = Model::new(test_schema());
        m.set_bytes("id", &[0xAA; 32]).unwrap();
        m.set_uint("kind", 3).unwrap();
        m.set_uint("created", 1_000_000).unwrap();
        m.set_bytes("payload", b"graph").unwrap();
        m.set_text("label", "trellis").unwrap();
        m.set_bytes("nonce", &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        m.set_uint("flags", 0b101).unwrap();
        m
    }

    #[test]
    fn test_roundtrip_with_transient() {
        let m = populated();
        let image = m.export(true).unwrap();
        let loaded = Model::load(test_schema(), &image, true).unwrap();

        assert_eq!(loaded.get_uint("kind"), Some(3));
        assert_eq!(loaded.get_bytes("payload"), Some(&b"graph"[..]));
        assert_eq!(loaded.get_text("label"), Some("trellis"));
        assert_eq!(loaded.get_uint("flags"), Some(0b101));
        assert_eq!(loaded.hash(&[]), m.hash(&[]));
        assert_eq!(loaded.hash_transient(), m.hash_transient());
    }

    #[test]
    fn test_transient_dropped_without_opt_in() {
        let m = populated();
        let image = m.export(false).unwrap();
        let loaded = Model::load(test_schema(), &image, true).unwrap();

        assert_eq!(loaded.get_uint("flags"), None);
        assert_eq!(loaded.hash_transient(), Hasher::new().finalize());
    }

    #[test]
    fn test_hash_ignores_unhashed_fields() {
        let mut m = populated();
        let before = m.hash(&[]);
        m.set_bytes("id", &[0xBB; 32]).unwrap();
        m.set_bytes("nonce", &[9, 9, 9, 9, 9, 9, 9, 9]).unwrap();
        assert_eq!(m.hash(&[]), before);

        m.set_uint("kind", 4).unwrap();
        assert_ne!(m.hash(&[]), before);
    }

    #[test]
    fn test_hash_exclude_by_name() {
        let m = populated();
        let with_created = m.hash(&[]);
        let without = m.hash(&["created"]);
        assert_ne!(with_created, without);
    }

    #[test]
    fn test_disabled_field_rejects_and_reads_absent() {
        let mut m = Model::new(test_schema());
        assert!(matches!(
            m.set_uint("off", 1),
            Err(ModelError::DisabledField(_))
        ));
        assert_eq!(m.get_uint("off"), None);
        assert!(!m.is_set("off"));
    }

    #[test]
    fn test_int_width_enforced() {
        let mut m = Model::new(test_schema());
        assert!(m.set_uint("kind", 255).is_ok());
        assert!(matches!(
            m.set_uint("kind", 256),
            Err(ModelError::TypeMismatch(_))
        ));
    }

    #[test]
    fn test_max_size_enforced() {
        let mut m = Model::new(test_schema());
        assert!(matches!(
            m.set_bytes("payload", &[0u8; 65]),
            Err(ModelError::ExceedsMaxSize { .. })
        ));
        assert!(matches!(
            m.set_text("label", "seventeen chars!!"),
            Err(ModelError::ExceedsMaxSize { .. })
        ));
    }

    #[test]
    fn test_out_of_order_image_rejected() {
        let m = populated();
        let mut image = m.export(false).unwrap();
        // Append a duplicate of field 1 after the higher-indexed fields.
        image.push(1);
        image.push(1);
        image.push(7);
        let err = Model::load(test_schema(), &image, false).unwrap_err();
        assert!(matches!(err, ModelError::FieldOutOfOrder(1)));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let schema = test_schema();
        let mut image = schema.model_type().as_bytes().to_vec();
        image.extend_from_slice(&[200, 1, 0]);
        let err = Model::load(schema, &image, false).unwrap_err();
        assert!(matches!(err, ModelError::UnknownField(200)));
    }

    #[test]
    fn test_short_read_rejected() {
        let schema = test_schema();
        let mut image = schema.model_type().as_bytes().to_vec();
        image.extend_from_slice(&[3, 10, 1, 2]); // declares 10 bytes, has 2
        let err = Model::load(schema, &image, false).unwrap_err();
        assert!(matches!(err, ModelError::ShortRead(_)));
    }

    #[test]
    fn test_header_mismatch_rejected() {
        let m = populated();
        let mut image = m.export(false).unwrap();
        image[1] = 9;
        let err = Model::load(test_schema(), &image, false).unwrap_err();
        assert!(matches!(err, ModelError::HeaderMismatch { .. }));
    }

    proptest! {
        #[test]
        fn prop_payload_roundtrip(payload in proptest::collection::vec(any::<u8>(), 0..64)) {
            let mut m = Model::new(test_schema());
            m.set_bytes("payload", &payload).unwrap();
            m.set_uint("created", 42).unwrap();

            let image = m.export(true).unwrap();
            let loaded = Model::load(test_schema(), &image, true).unwrap();
            prop_assert_eq!(loaded.get_bytes("payload").unwrap(), payload.as_slice());
            prop_assert_eq!(loaded.hash(&[]), m.hash(&[]));
        }
    }
}

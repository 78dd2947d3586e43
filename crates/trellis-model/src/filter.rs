//! Comparison filters over model fields
//!
//! A filter is an ordered list of predicates; all must hold. Semantics are
//! total and deterministic: an absent field is never equal to any concrete
//! value, so `Eq` fails, `Ne` holds, and every ordering, bit, and hash
//! predicate fails.

use trellis_crypto::hash_bytes;

use crate::model::{Model, Value};

/// Filter comparison value
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FilterValue {
    Uint(u64),
    Bytes(Vec<u8>),
    Text(String),
}

/// One comparison
#[derive(Clone, Debug)]
pub enum Cmp {
    Eq(FilterValue),
    Ne(FilterValue),
    Lt(FilterValue),
    Le(FilterValue),
    Gt(FilterValue),
    Ge(FilterValue),
    /// Integer field has the given bit set
    BitSet(u8),
    /// Integer field has the given bit clear
    BitClear(u8),
    /// BLAKE2b-256 of the field's wire bytes equals the digest
    HashEq([u8; 32]),
}

/// A predicate naming a field and a comparison
#[derive(Clone, Debug)]
pub struct Filter {
    pub field: String,
    pub cmp: Cmp,
}

impl Filter {
    pub fn new(field: impl Into<String>, cmp: Cmp) -> Self {
        Self {
            field: field.into(),
            cmp,
        }
    }

    /// Evaluate against a model
    pub fn matches(&self, model: &Model) -> bool {
        let value = model.get_value(&self.field);
        match (&self.cmp, value) {
            (Cmp::Ne(_), None) => true,
            (_, None) => false,
            (Cmp::Eq(want), Some(have)) => ordering(have, want) == Some(std::cmp::Ordering::Equal),
            (Cmp::Ne(want), Some(have)) => ordering(have, want) != Some(std::cmp::Ordering::Equal),
            (Cmp::Lt(want), Some(have)) => ordering(have, want) == Some(std::cmp::Ordering::Less),
            (Cmp::Le(want), Some(have)) => {
                matches!(
                    ordering(have, want),
                    Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
                )
            }
            (Cmp::Gt(want), Some(have)) => {
                ordering(have, want) == Some(std::cmp::Ordering::Greater)
            }
            (Cmp::Ge(want), Some(have)) => {
                matches!(
                    ordering(have, want),
                    Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
                )
            }
            (Cmp::BitSet(bit), Some(Value::Uint(v))) => *bit < 64 && v & (1u64 << bit) != 0,
            (Cmp::BitClear(bit), Some(Value::Uint(v))) => *bit < 64 && v & (1u64 << bit) == 0,
            (Cmp::BitSet(_) | Cmp::BitClear(_), Some(_)) => false,
            (Cmp::HashEq(digest), Some(_)) => model
                .field_wire_bytes(&self.field)
                .map(|bytes| hash_bytes(&bytes) == *digest)
                .unwrap_or(false),
        }
    }
}

/// Total ordering between a field value and a filter value of the same kind;
/// mismatched kinds do not compare.
fn ordering(have: &Value, want: &FilterValue) -> Option<std::cmp::Ordering> {
    match (have, want) {
        (Value::Uint(a), FilterValue::Uint(b)) => Some(a.cmp(b)),
        (Value::Bytes(a), FilterValue::Bytes(b)) => Some(a.as_slice().cmp(b.as_slice())),
        (Value::Text(a), FilterValue::Text(b)) => Some(a.as_str().cmp(b.as_str())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, FieldType, ModelType, Schema};
    use std::sync::Arc;

    fn model() -> Model {
        let base = [
            FieldDef::new(0, "count", FieldType::UInt16),
            FieldDef::new(1, "tag", FieldType::Bytes { max: 8 }),
            FieldDef::new(2, "name", FieldType::Utf8 { max: 8 }),
        ];
        let schema = Arc::new(Schema::merge(ModelType::new(4, 1, 1, 0), &base, &[]).unwrap());
        let mut m = Model::new(schema);
        m.set_uint("count", 0b1010).unwrap();
        m.set_bytes("tag", b"abc").unwrap();
        m
    }

    #[test]
    fn test_orderings() {
        let m = model();
        assert!(m.cmp(&[Filter::new("count", Cmp::Eq(FilterValue::Uint(10)))]));
        assert!(m.cmp(&[Filter::new("count", Cmp::Lt(FilterValue::Uint(11)))]));
        assert!(m.cmp(&[Filter::new("count", Cmp::Ge(FilterValue::Uint(10)))]));
        assert!(!m.cmp(&[Filter::new("count", Cmp::Gt(FilterValue::Uint(10)))]));
        assert!(m.cmp(&[Filter::new("tag", Cmp::Gt(FilterValue::Bytes(b"abb".to_vec())))]));
    }

    #[test]
    fn test_bit_predicates() {
        let m = model();
        assert!(m.cmp(&[Filter::new("count", Cmp::BitSet(1))]));
        assert!(m.cmp(&[Filter::new("count", Cmp::BitClear(0))]));
        assert!(!m.cmp(&[Filter::new("count", Cmp::BitSet(0))]));
    }

    #[test]
    fn test_absent_field_semantics() {
        let m = model();
        assert!(!m.cmp(&[Filter::new("name", Cmp::Eq(FilterValue::Text("x".into())))]));
        assert!(m.cmp(&[Filter::new("name", Cmp::Ne(FilterValue::Text("x".into())))]));
        assert!(!m.cmp(&[Filter::new("name", Cmp::Lt(FilterValue::Text("x".into())))]));
        assert!(!m.cmp(&[Filter::new("name", Cmp::BitSet(0))]));
    }

    #[test]
    fn test_hash_eq() {
        let m = model();
        let digest = hash_bytes(b"abc");
        assert!(m.cmp(&[Filter::new("tag", Cmp::HashEq(digest))]));
        assert!(!m.cmp(&[Filter::new("tag", Cmp::HashEq([0u8; 32]))]));
    }

    #[test]
    fn test_all_must_hold() {
        let m = model();
        assert!(!m.cmp(&[
            Filter::new("count", Cmp::Eq(FilterValue::Uint(10))),
            Filter::new("count", Cmp::Eq(FilterValue::Uint(11))),
        ]));
    }

    #[test]
    fn test_kind_mismatch_never_compares() {
        let m = model();
        assert!(!m.cmp(&[Filter::new("count", Cmp::Eq(FilterValue::Text("10".into())))]));
        assert!(m.cmp(&[Filter::new("count", Cmp::Ne(FilterValue::Text("10".into())))]));
    }
}

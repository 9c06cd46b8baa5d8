//! Structural key values.
//!
//! Key comparison is by content: byte arrays compare byte-wise and floats
//! compare by bit pattern, so hashing and equality always agree.

use crate::value::Value;
use std::fmt;
use std::hash::{Hash, Hasher};

/// The values of a (possibly composite) key, in key-property order.
#[derive(Debug, Clone)]
pub struct KeyValue(Vec<Value>);

impl KeyValue {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn single(value: Value) -> Self {
        Self(vec![value])
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn into_values(self) -> Vec<Value> {
        self.0
    }

    /// A key with any NULL component identifies nothing.
    pub fn has_null(&self) -> bool {
        self.0.iter().any(Value::is_null)
    }
}

impl PartialEq for KeyValue {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(&other.0)
                .all(|(a, b)| structural_eq(a, b))
    }
}

impl Eq for KeyValue {}

impl Hash for KeyValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.len().hash(state);
        for v in &self.0 {
            hash_value(v, state);
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, ")")
    }
}

/// Content-based equality used for key and foreign-key comparison.
pub fn structural_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Float(x), Value::Float(y)) => x.to_bits() == y.to_bits(),
        (Value::Double(x), Value::Double(y)) => x.to_bits() == y.to_bits(),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| structural_eq(a, b))
        }
        _ => a == b,
    }
}

fn hash_value<H: Hasher>(v: &Value, hasher: &mut H) {
    match v {
        Value::Null => 0u8.hash(hasher),
        Value::Bool(b) => {
            1u8.hash(hasher);
            b.hash(hasher);
        }
        Value::TinyInt(i) => {
            2u8.hash(hasher);
            i.hash(hasher);
        }
        Value::SmallInt(i) => {
            3u8.hash(hasher);
            i.hash(hasher);
        }
        Value::Int(i) => {
            4u8.hash(hasher);
            i.hash(hasher);
        }
        Value::BigInt(i) => {
            5u8.hash(hasher);
            i.hash(hasher);
        }
        Value::Float(f) => {
            6u8.hash(hasher);
            f.to_bits().hash(hasher);
        }
        Value::Double(f) => {
            7u8.hash(hasher);
            f.to_bits().hash(hasher);
        }
        Value::Decimal(s) => {
            8u8.hash(hasher);
            s.hash(hasher);
        }
        Value::Text(s) => {
            9u8.hash(hasher);
            s.hash(hasher);
        }
        Value::Bytes(b) => {
            10u8.hash(hasher);
            b.hash(hasher);
        }
        Value::Date(d) => {
            11u8.hash(hasher);
            d.hash(hasher);
        }
        Value::Time(t) => {
            12u8.hash(hasher);
            t.hash(hasher);
        }
        Value::Timestamp(ts) => {
            13u8.hash(hasher);
            ts.hash(hasher);
        }
        Value::TimestampTz(ts) => {
            14u8.hash(hasher);
            ts.hash(hasher);
        }
        Value::Uuid(u) => {
            15u8.hash(hasher);
            u.hash(hasher);
        }
        Value::Json(j) => {
            16u8.hash(hasher);
            j.to_string().hash(hasher);
        }
        Value::Array(items) => {
            17u8.hash(hasher);
            items.len().hash(hasher);
            for item in items {
                hash_value(item, hasher);
            }
        }
        Value::Default => 18u8.hash(hasher),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn byte_keys_resolve_by_content() {
        let mut map = HashMap::new();
        map.insert(KeyValue::single(Value::Bytes(vec![0xde, 0xad])), "row");

        let probe = KeyValue::single(Value::Bytes(vec![0xde, 0xad]));
        assert_eq!(map.get(&probe), Some(&"row"));
        assert_eq!(map.get(&KeyValue::single(Value::Bytes(vec![0xde]))), None);
    }

    #[test]
    fn composite_order_matters() {
        let a = KeyValue::new(vec![Value::Int(1), Value::Int(2)]);
        let b = KeyValue::new(vec![Value::Int(2), Value::Int(1)]);
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "(1, 2)");
    }

    #[test]
    fn integer_widths_are_distinct() {
        assert_ne!(
            KeyValue::single(Value::Int(1)),
            KeyValue::single(Value::BigInt(1))
        );
    }

    #[test]
    fn float_zero_signs_are_distinct_and_consistent() {
        assert!(!structural_eq(&Value::Double(0.0), &Value::Double(-0.0)));
        assert!(structural_eq(&Value::Double(f64::NAN), &Value::Double(f64::NAN)));
    }

    #[test]
    fn null_components_are_detected() {
        assert!(KeyValue::new(vec![Value::Int(1), Value::Null]).has_null());
        assert!(!KeyValue::single(Value::Int(1)).has_null());
    }
}

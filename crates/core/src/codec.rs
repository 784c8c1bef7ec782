//! Comparator & key codec (spec.md §2, §4.6).
//!
//! A `PrimaryKey` is either a single value or an ordered tuple. `encode_key`
//! produces a canonical byte string such that two equal keys always encode
//! identically and two unequal keys never collide — used both as the
//! `Ord`/`Eq` key for the ordered map (§4.1) and as the hashable entry in a
//! change-log frame (§4.6).

use std::cmp::Ordering;
use std::fmt;

use crate::value::{Collation, Value};

/// Either a single value or an ordered tuple of values uniquely identifying a
/// row in a table.
#[derive(Debug, Clone)]
pub struct PrimaryKey(pub Vec<Value>);

impl PrimaryKey {
    pub fn single(v: Value) -> Self {
        PrimaryKey(vec![v])
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Compares two keys component-wise using the supplied per-column
    /// collations (default collation is used for non-text columns).
    pub fn compare(&self, other: &PrimaryKey, collations: &[Collation]) -> Ordering {
        for (i, (a, b)) in self.0.iter().zip(other.0.iter()).enumerate() {
            let c = collations.get(i).copied().unwrap_or(Collation::Default);
            match a.compare(b, c) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

/// A canonical byte encoding of a [`PrimaryKey`], usable as a `BTreeMap`/
/// `HashSet` key. Distinct from `PrimaryKey` itself because the ordered map
/// (§4.1) wants a type with plain `Ord`, and the change log (§4.6) wants a
/// type that is cheaply `Hash + Eq` and comparable across differently-typed
/// keys safely (no partial-order surprises from floats).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EncodedKey(Vec<u8>);

impl EncodedKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for EncodedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Tag bytes identifying a value's type in the encoding, ordered so that
/// byte-wise comparison of tags matches spec.md §3's null-sorts-below-all-
/// non-null rule without needing to decode.
mod tag {
    pub const NULL: u8 = 0;
    pub const INTEGER: u8 = 1;
    pub const REAL: u8 = 2;
    pub const BOOLEAN: u8 = 3;
    pub const TEXT: u8 = 4;
    pub const BYTES: u8 = 5;
}

/// Encodes a single value. Integers are encoded with a sign-flipped,
/// big-endian representation so that byte-wise order matches numeric order.
/// Reals use the same trick over the IEEE-754 bit pattern. Text is
/// length-prefixed so that no value can be a byte-wise prefix of another
/// after the tag+length header, which is what prevents key collisions
/// between e.g. `("ab", "c")` and `("a", "bc")` in composite keys.
fn encode_value(v: &Value, out: &mut Vec<u8>) {
    match v {
        Value::Null => out.push(tag::NULL),
        Value::Integer(i) => {
            out.push(tag::INTEGER);
            out.extend_from_slice(&(*i as u64 ^ (1u64 << 63)).to_be_bytes());
        }
        Value::Real(r) => {
            out.push(tag::REAL);
            let bits = r.to_bits();
            let flipped = if *r >= 0.0 { bits | (1u64 << 63) } else { !bits };
            out.extend_from_slice(&flipped.to_be_bytes());
        }
        Value::Boolean(b) => {
            out.push(tag::BOOLEAN);
            out.push(*b as u8);
        }
        Value::Text(s) => {
            out.push(tag::TEXT);
            out.extend_from_slice(&(s.len() as u64).to_be_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            out.push(tag::BYTES);
            out.extend_from_slice(&(b.len() as u64).to_be_bytes());
            out.extend_from_slice(b);
        }
    }
}

/// Encodes a primary key (single value or tuple) into a canonical byte
/// string. Two `PrimaryKey`s compare equal under [`PrimaryKey::compare`] with
/// the default collation iff their encodings are byte-identical. Encoding is
/// collation-agnostic (it encodes raw text bytes): callers that need
/// case-insensitive or right-trimmed key equality should normalize `Value`s
/// with [`Collation::compare`] before building the key, since the change log
/// (§4.6) only needs encoding stability, not collation awareness.
pub fn encode_key(key: &PrimaryKey) -> EncodedKey {
    let mut out = Vec::with_capacity(key.0.len() * 9);
    out.extend_from_slice(&(key.0.len() as u32).to_be_bytes());
    for v in &key.0 {
        encode_value(v, &mut out);
    }
    EncodedKey(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_keys_encode_identically() {
        let a = PrimaryKey(vec![Value::Integer(1), Value::Text("x".into())]);
        let b = PrimaryKey(vec![Value::Integer(1), Value::Text("x".into())]);
        assert_eq!(encode_key(&a), encode_key(&b));
    }

    #[test]
    fn unequal_keys_never_collide_across_tuple_boundaries() {
        let a = PrimaryKey(vec![Value::Text("ab".into()), Value::Text("c".into())]);
        let b = PrimaryKey(vec![Value::Text("a".into()), Value::Text("bc".into())]);
        assert_ne!(encode_key(&a), encode_key(&b));
    }

    #[test]
    fn integer_ordering_preserved_in_bytes() {
        let neg = encode_key(&PrimaryKey::single(Value::Integer(-5)));
        let zero = encode_key(&PrimaryKey::single(Value::Integer(0)));
        let pos = encode_key(&PrimaryKey::single(Value::Integer(5)));
        assert!(neg < zero);
        assert!(zero < pos);
    }

    #[test]
    fn real_ordering_preserved_in_bytes() {
        let neg = encode_key(&PrimaryKey::single(Value::Real(-1.5)));
        let zero = encode_key(&PrimaryKey::single(Value::Real(0.0)));
        let pos = encode_key(&PrimaryKey::single(Value::Real(1.5)));
        assert!(neg < zero);
        assert!(zero < pos);
    }

    #[test]
    fn null_sorts_below_non_null_in_bytes() {
        let null = encode_key(&PrimaryKey::single(Value::Null));
        let int = encode_key(&PrimaryKey::single(Value::Integer(i64::MIN)));
        assert!(null < int);
    }
}

//! Scalar values and collations.
//!
//! Grounded in the teacher's `AlgebraicValue` (total order over a closed set
//! of scalar kinds, §db/relational_db.rs usages) but narrowed to the kinds
//! spec.md §3 actually names: null, integer, real, text, bytes, boolean.

use std::cmp::Ordering;
use std::fmt;

/// A named collation controlling equality/ordering of `Text` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collation {
    /// Byte-wise ordering.
    Default,
    /// Case-insensitive ordering (ASCII case folding).
    NoCase,
    /// Ordering after stripping trailing whitespace from both operands.
    RTrim,
}

impl Default for Collation {
    fn default() -> Self {
        Collation::Default
    }
}

impl Collation {
    fn normalize<'a>(&self, s: &'a str) -> std::borrow::Cow<'a, str> {
        match self {
            Collation::Default => std::borrow::Cow::Borrowed(s),
            Collation::NoCase => std::borrow::Cow::Owned(s.to_ascii_lowercase()),
            Collation::RTrim => std::borrow::Cow::Borrowed(s.trim_end()),
        }
    }

    pub fn compare(&self, a: &str, b: &str) -> Ordering {
        self.normalize(a).cmp(&self.normalize(b))
    }

    pub fn eq(&self, a: &str, b: &str) -> bool {
        self.compare(a, b) == Ordering::Equal
    }
}

/// A scalar value. Structural `PartialEq` (used by tests and by the storage
/// layer's tombstone/key-equality checks) is collation-agnostic and treats
/// null as equal to null; collation- and predicate-sensitive comparisons go
/// through [`Value::compare`]/[`Value::eq_for_predicate`]/[`Value::eq_for_key`]
/// instead.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Bytes(Vec<u8>),
    Boolean(bool),
}

impl Value {
    /// Type-rank used to order values of different kinds: null sorts below
    /// every non-null value, per spec.md §3.
    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Integer(_) => 1,
            Value::Real(_) => 1,
            Value::Boolean(_) => 2,
            Value::Text(_) => 3,
            Value::Bytes(_) => 4,
        }
    }

    /// Collation-aware ordering. Numeric kinds compare across `Integer`/`Real`
    /// by numeric value so `1 = 1.0` orders as equal.
    pub fn compare(&self, other: &Value, collation: Collation) -> Ordering {
        use Value::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Integer(a), Integer(b)) => a.cmp(b),
            (Real(a), Real(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Integer(a), Real(b)) => (*a as f64).partial_cmp(b).unwrap_or(Ordering::Equal),
            (Real(a), Integer(b)) => a.partial_cmp(&(*b as f64)).unwrap_or(Ordering::Equal),
            (Boolean(a), Boolean(b)) => a.cmp(b),
            (Text(a), Text(b)) => collation.compare(a, b),
            (Bytes(a), Bytes(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }

    /// Equality per spec.md §3: null≠null for equality, but null is
    /// comparable (and equal to null) for key-lookup purposes.
    pub fn eq_for_predicate(&self, other: &Value, collation: Collation) -> bool {
        if matches!(self, Value::Null) || matches!(other, Value::Null) {
            return false;
        }
        self.compare(other, collation) == Ordering::Equal
    }

    /// Equality used for primary-key lookup/comparison, where null orders
    /// and compares like any other value (two nulls are the same key).
    pub fn eq_for_key(&self, other: &Value, collation: Collation) -> bool {
        self.compare(other, collation) == Ordering::Equal
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Real(r) => write!(f, "{r}"),
            Value::Text(s) => write!(f, "'{s}'"),
            Value::Bytes(b) => write!(f, "x'{}'", hex_encode(b)),
            Value::Boolean(b) => write!(f, "{b}"),
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// An ordered row of values, arity equal to its table's column count.
pub type Row = Vec<Value>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_orders_below_everything() {
        assert_eq!(Value::Null.compare(&Value::Integer(-1), Collation::Default), Ordering::Less);
    }

    #[test]
    fn null_not_equal_to_null_for_predicate() {
        assert!(!Value::Null.eq_for_predicate(&Value::Null, Collation::Default));
    }

    #[test]
    fn null_equal_to_null_for_key() {
        assert!(Value::Null.eq_for_key(&Value::Null, Collation::Default));
    }

    #[test]
    fn nocase_collation() {
        assert!(Collation::NoCase.eq("ABC", "abc"));
        assert!(!Collation::Default.eq("ABC", "abc"));
    }

    #[test]
    fn rtrim_collation() {
        assert!(Collation::RTrim.eq("abc   ", "abc"));
    }

    #[test]
    fn integer_real_cross_compare() {
        assert_eq!(
            Value::Integer(2).compare(&Value::Real(2.0), Collation::Default),
            Ordering::Equal
        );
    }
}

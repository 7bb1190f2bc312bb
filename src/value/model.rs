//! Typed configuration values.
//!
//! Every attribute the engine handles is a [`Value`]: a scalar, an ordered
//! list, an unordered set identified by content, or a block of named fields.
//! Untyped input is converted into this model once, at the loading boundary.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::hash::ContentHash;

/// A block of named fields. Keys are unique and iterate in sorted order.
pub type Block = BTreeMap<String, Value>;

/// A configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// A single string, number or boolean.
    Scalar(Scalar),
    /// An ordered sequence. Position is significant.
    List(Vec<Value>),
    /// An unordered collection whose members are identified by content.
    Set(ValueSet),
    /// A mapping from field name to value.
    Block(Block),
}

/// Scalar payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scalar {
    /// UTF-8 string.
    String(String),
    /// Integer or floating point number.
    Number(Number),
    /// Boolean.
    Bool(bool),
}

/// A number as it appeared in configuration.
///
/// Integers and floats are kept apart: `1` and `1.0` are different values.
/// Floats compare by their canonical bit pattern so that equality agrees
/// with the content hash (`NaN == NaN`, `-0.0 == 0.0`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Number {
    /// Signed 64-bit integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
}

/// A set of values keyed by their content hash.
///
/// Inserting a value that is structurally identical to an existing member
/// is a no-op. Iteration order is the order of the member hashes, which is
/// stable across runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Value>", into = "Vec<Value>")]
pub struct ValueSet {
    members: BTreeMap<ContentHash, Value>,
}

impl Number {
    /// Returns the bit pattern used for equality and hashing.
    #[must_use]
    pub fn canonical_bits(self) -> u64 {
        match self {
            Self::Int(i) => u64::from_be_bytes(i.to_be_bytes()),
            Self::Float(f) if f.is_nan() => f64::NAN.to_bits(),
            Self::Float(f) if f == 0.0 => 0.0_f64.to_bits(),
            Self::Float(f) => f.to_bits(),
        }
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(_), Self::Float(_)) => self.canonical_bits() == other.canonical_bits(),
            _ => false,
        }
    }
}

impl Eq for Number {}

impl std::fmt::Display for Number {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
        }
    }
}

impl ValueSet {
    /// Creates an empty set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            members: BTreeMap::new(),
        }
    }

    /// Inserts a member. Returns false if an identical member was present.
    pub fn insert(&mut self, value: Value) -> bool {
        let identity = ContentHash::of(&value);
        if self.members.contains_key(&identity) {
            return false;
        }
        self.members.insert(identity, value);
        true
    }

    /// Removes the member with the given identity.
    pub fn remove(&mut self, identity: &ContentHash) -> Option<Value> {
        self.members.remove(identity)
    }

    /// Returns true if a structurally identical member is present.
    #[must_use]
    pub fn contains(&self, value: &Value) -> bool {
        self.members.contains_key(&ContentHash::of(value))
    }

    /// Looks up a member by identity.
    #[must_use]
    pub fn get(&self, identity: &ContentHash) -> Option<&Value> {
        self.members.get(identity)
    }

    /// Number of distinct members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns true if the set has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Iterates over members in identity order.
    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.members.values()
    }

    /// Iterates over `(identity, member)` pairs.
    pub fn entries(&self) -> impl Iterator<Item = (&ContentHash, &Value)> {
        self.members.iter()
    }

    /// Returns the member identities in order.
    pub fn identities(&self) -> impl Iterator<Item = &ContentHash> {
        self.members.keys()
    }
}

impl FromIterator<Value> for ValueSet {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        let mut set = Self::new();
        for value in iter {
            set.insert(value);
        }
        set
    }
}

impl From<Vec<Value>> for ValueSet {
    fn from(values: Vec<Value>) -> Self {
        values.into_iter().collect()
    }
}

impl From<ValueSet> for Vec<Value> {
    fn from(set: ValueSet) -> Self {
        set.members.into_values().collect()
    }
}

impl Value {
    /// Builds a string scalar.
    #[must_use]
    pub fn string(s: impl Into<String>) -> Self {
        Self::Scalar(Scalar::String(s.into()))
    }

    /// Builds an integer scalar.
    #[must_use]
    pub const fn int(i: i64) -> Self {
        Self::Scalar(Scalar::Number(Number::Int(i)))
    }

    /// Builds a float scalar.
    #[must_use]
    pub const fn float(f: f64) -> Self {
        Self::Scalar(Scalar::Number(Number::Float(f)))
    }

    /// Builds a boolean scalar.
    #[must_use]
    pub const fn bool(b: bool) -> Self {
        Self::Scalar(Scalar::Bool(b))
    }

    /// Builds a set from an iterator of members.
    pub fn set(members: impl IntoIterator<Item = Self>) -> Self {
        Self::Set(members.into_iter().collect())
    }

    /// Builds a block from `(name, value)` pairs.
    pub fn block<K: Into<String>>(fields: impl IntoIterator<Item = (K, Self)>) -> Self {
        Self::Block(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Returns the string payload, if this is a string scalar.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Scalar(Scalar::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Returns the block payload, if this is a block.
    #[must_use]
    pub const fn as_block(&self) -> Option<&Block> {
        match self {
            Self::Block(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the set payload, if this is a set.
    #[must_use]
    pub const fn as_set(&self) -> Option<&ValueSet> {
        match self {
            Self::Set(s) => Some(s),
            _ => None,
        }
    }

    /// Short name of the variant, used in error messages.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Scalar(Scalar::String(_)) => "string",
            Self::Scalar(Scalar::Number(_)) => "number",
            Self::Scalar(Scalar::Bool(_)) => "bool",
            Self::List(_) => "list",
            Self::Set(_) => "set",
            Self::Block(_) => "block",
        }
    }

    /// Content hash of this value. See [`ContentHash::of`].
    #[must_use]
    pub fn content_hash(&self) -> ContentHash {
        ContentHash::of(self)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scalar(Scalar::String(s)) => write!(f, "{s:?}"),
            Self::Scalar(Scalar::Number(n)) => write!(f, "{n}"),
            Self::Scalar(Scalar::Bool(b)) => write!(f, "{b}"),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Set(set) => {
                write!(f, "{{")?;
                for (i, item) in set.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "}}")
            }
            Self::Block(block) => {
                write!(f, "{{")?;
                for (i, (key, value)) in block.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key} = {value}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_collapses_identical_members() {
        let mut set = ValueSet::new();
        assert!(set.insert(Value::string("nic-1")));
        assert!(!set.insert(Value::string("nic-1")));
        assert!(set.insert(Value::string("nic-2")));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_set_equality_ignores_insertion_order() {
        let a = Value::set([Value::string("a"), Value::string("b"), Value::string("c")]);
        let b = Value::set([Value::string("c"), Value::string("a"), Value::string("b")]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_list_equality_is_positional() {
        let a = Value::List(vec![Value::int(1), Value::int(2)]);
        let b = Value::List(vec![Value::int(2), Value::int(1)]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_empty_set_differs_from_absent_field() {
        let with_empty = Block::from([(String::from("disks"), Value::set([]))]);
        let without = Block::new();
        assert_ne!(with_empty, without);
        assert_eq!(with_empty.get("disks"), Some(&Value::Set(ValueSet::new())));
    }

    #[test]
    fn test_number_kinds_are_distinct() {
        assert_ne!(Value::int(1), Value::float(1.0));
        assert_eq!(Value::float(-0.0), Value::float(0.0));
        assert_eq!(Value::float(f64::NAN), Value::float(f64::NAN));
    }

    #[test]
    fn test_serde_round_trip_rebuilds_set_identity() {
        let value = Value::block([
            ("name", Value::string("vm1")),
            ("nics", Value::set([Value::string("b"), Value::string("a")])),
        ]);
        let json = serde_json::to_string(&value).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
        assert_eq!(back.content_hash(), value.content_hash());
    }

    #[test]
    fn test_display() {
        let value = Value::block([
            ("size", Value::string("Standard_A1")),
            ("count", Value::int(2)),
        ]);
        assert_eq!(value.to_string(), r#"{count = 2, size = "Standard_A1"}"#);
    }
}

//! Content hashing for values.
//!
//! The hash is a pure function of a value's content: no pointers, no
//! insertion order for sets, no process-specific seeds. It is what gives set
//! members their identity and must therefore be stable across runs.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use super::model::{Number, Scalar, Value};

/// SHA-256 digest of a value's canonical encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Computes the content hash of a value.
    ///
    /// Lists are hashed in order. Set members are hashed individually and
    /// combined in sorted order, so member order never matters. Blocks are
    /// hashed in key order. Every node is prefixed with a type tag and a
    /// length so that different shapes cannot collide by concatenation.
    #[must_use]
    pub fn of(value: &Value) -> Self {
        let mut hasher = Sha256::new();
        feed(&mut hasher, value);
        Self(hasher.finalize().into())
    }

    /// Builds a hash from raw digest bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full lowercase hex encoding.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 8 hex characters, for display.
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Parses a full hex encoding.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not 64 hex characters.
    pub fn from_hex(s: &str) -> std::result::Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

fn feed(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Scalar(Scalar::String(s)) => {
            hasher.update(b"s");
            feed_len(hasher, s.len());
            hasher.update(s.as_bytes());
        }
        Value::Scalar(Scalar::Number(n)) => {
            hasher.update(match n {
                Number::Int(_) => b"i",
                Number::Float(_) => b"f",
            });
            hasher.update(n.canonical_bits().to_be_bytes());
        }
        Value::Scalar(Scalar::Bool(b)) => {
            hasher.update(b"b");
            hasher.update([u8::from(*b)]);
        }
        Value::List(items) => {
            hasher.update(b"l");
            feed_len(hasher, items.len());
            for item in items {
                feed(hasher, item);
            }
        }
        Value::Set(set) => {
            hasher.update(b"S");
            feed_len(hasher, set.len());
            // Identities iterate sorted, which makes the combination commutative.
            for identity in set.identities() {
                hasher.update(identity.as_bytes());
            }
        }
        Value::Block(block) => {
            hasher.update(b"B");
            feed_len(hasher, block.len());
            for (key, field) in block {
                feed_len(hasher, key.len());
                hasher.update(key.as_bytes());
                feed(hasher, field);
            }
        }
    }
}

fn feed_len(hasher: &mut Sha256, len: usize) {
    hasher.update((len as u64).to_be_bytes());
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn disk(name: &str, lun: i64) -> Value {
        Value::block([("name", Value::string(name)), ("lun", Value::int(lun))])
    }

    #[test]
    fn test_hash_deterministic() {
        let value = disk("data-0", 0);
        assert_eq!(ContentHash::of(&value), ContentHash::of(&value.clone()));
    }

    #[test]
    fn test_hash_known_vector_is_stable() {
        // Pinned so that an accidental change to the encoding is caught:
        // persisted set identities depend on it.
        let hash = ContentHash::of(&Value::string(""));
        let mut hasher = Sha256::new();
        hasher.update(b"s");
        hasher.update(0u64.to_be_bytes());
        let expected: [u8; 32] = hasher.finalize().into();
        assert_eq!(hash, ContentHash::from_bytes(expected));
    }

    #[test]
    fn test_set_hash_order_insensitive() {
        let a = Value::set([disk("a", 0), disk("b", 1)]);
        let b = Value::set([disk("b", 1), disk("a", 0)]);
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_list_hash_order_sensitive() {
        let a = Value::List(vec![disk("a", 0), disk("b", 1)]);
        let b = Value::List(vec![disk("b", 1), disk("a", 0)]);
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_shape_tags_prevent_collisions() {
        assert_ne!(Value::string("1").content_hash(), Value::int(1).content_hash());
        assert_ne!(
            Value::List(vec![]).content_hash(),
            Value::set([]).content_hash()
        );
        assert_ne!(
            Value::block([("ab", Value::string("c"))]).content_hash(),
            Value::block([("a", Value::string("bc"))]).content_hash()
        );
    }

    #[test]
    fn test_hex_round_trip() {
        let hash = disk("x", 3).content_hash();
        assert_eq!(ContentHash::from_hex(&hash.to_hex()).unwrap(), hash);
        assert_eq!(hash.short().len(), 8);
        assert!(ContentHash::from_hex("zz").is_err());
    }

    proptest! {
        #[test]
        fn prop_set_identity_ignores_member_order(names in proptest::collection::vec("[a-z]{1,6}", 0..8)) {
            let forward = Value::set(names.iter().map(Value::string));
            let backward = Value::set(names.iter().rev().map(Value::string));
            prop_assert_eq!(forward.content_hash(), backward.content_hash());
            prop_assert_eq!(forward, backward);
        }

        #[test]
        fn prop_equal_values_hash_equal(a in any::<i64>(), s in "\\PC{0,12}") {
            let x = Value::block([("n", Value::int(a)), ("s", Value::string(s.clone()))]);
            let y = Value::block([("s", Value::string(s)), ("n", Value::int(a))]);
            prop_assert_eq!(x.content_hash(), y.content_hash());
        }
    }
}

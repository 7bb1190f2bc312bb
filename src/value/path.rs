//! Field paths into nested values.

use serde::{Deserialize, Serialize};

use super::hash::ContentHash;

/// One step of a [`FieldPath`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathSegment {
    /// A named field of a block.
    Field(String),
    /// A set member, addressed by its identity.
    Member(ContentHash),
}

/// Path from a resource's root block to a field or set member.
///
/// Renders as `os_profile.admin_username` or `storage_data_disk[#1a2b3c4d]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldPath(Vec<PathSegment>);

impl FieldPath {
    /// The empty (root) path.
    #[must_use]
    pub const fn root() -> Self {
        Self(Vec::new())
    }

    /// Path to a top-level field.
    #[must_use]
    pub fn field(name: impl Into<String>) -> Self {
        Self(vec![PathSegment::Field(name.into())])
    }

    /// Returns this path extended with a field name.
    #[must_use]
    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Field(name.into()));
        Self(segments)
    }

    /// Returns this path extended with a set member identity.
    #[must_use]
    pub fn member(&self, identity: ContentHash) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Member(identity));
        Self(segments)
    }

    /// The segments of this path.
    #[must_use]
    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    /// Name of the top-level field this path starts at.
    #[must_use]
    pub fn root_field(&self) -> Option<&str> {
        match self.0.first() {
            Some(PathSegment::Field(name)) => Some(name),
            _ => None,
        }
    }

    /// Returns true for the root path.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            match segment {
                PathSegment::Field(name) if i == 0 => write!(f, "{name}")?,
                PathSegment::Field(name) => write!(f, ".{name}")?,
                PathSegment::Member(identity) => write!(f, "[#{}]", identity.short())?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn test_display_nested_path() {
        let path = FieldPath::field("os_profile").child("admin_username");
        assert_eq!(path.to_string(), "os_profile.admin_username");
        assert_eq!(path.root_field(), Some("os_profile"));
    }

    #[test]
    fn test_display_member_path() {
        let identity = Value::string("nic-1").content_hash();
        let path = FieldPath::field("network_interface_ids").member(identity);
        assert_eq!(
            path.to_string(),
            format!("network_interface_ids[#{}]", identity.short())
        );
    }

    #[test]
    fn test_root() {
        assert!(FieldPath::root().is_root());
        assert_eq!(FieldPath::root().child("name"), FieldPath::field("name"));
    }
}

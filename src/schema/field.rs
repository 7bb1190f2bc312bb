//! Field specifications.
//!
//! A [`FieldSpec`] tells the engine what shape a field has, whether
//! configuration must, may, or must not supply it, and what it takes to change
//! it on a live resource.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a change to a field can be applied.
///
/// Ordered by severity: combining a parent and a child class keeps the
/// stronger one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mutability {
    /// Changed in place with an update call.
    #[default]
    Mutable,
    /// Changing it requires destroying and recreating the resource.
    ForcesReplacement,
    /// Owned by the remote system; never supplied by configuration.
    ComputedOnly,
}

/// Shape of a field's value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValueKind {
    /// String scalar.
    String,
    /// Numeric scalar.
    Number,
    /// Boolean scalar.
    Bool,
    /// Ordered list of elements.
    List {
        /// Element shape.
        element: Box<ValueKind>,
    },
    /// Unordered set of elements, identified by content.
    Set {
        /// Element shape.
        element: Box<ValueKind>,
    },
    /// Free-form string-keyed map, stored as a block.
    Map {
        /// Shape of the map values.
        element: Box<ValueKind>,
    },
    /// Exactly one nested block with a fixed set of fields.
    ///
    /// Configuration supplying a list here is rejected rather than coerced.
    Block {
        /// Nested field specifications.
        fields: BTreeMap<String, FieldSpec>,
    },
}

/// Canonicalization applied to string values when they are loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalizer {
    /// Lowercase the value.
    Lowercase,
    /// Region names: lowercase with all spaces removed (`West US` → `westus`).
    Location,
}

/// Specification of a single field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Field name. Filled from the schema key when loaded from a document.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Shape of the value.
    #[serde(flatten)]
    pub kind: ValueKind,
    /// Desired state must supply the field.
    #[serde(default)]
    pub required: bool,
    /// Desired state may omit the field.
    #[serde(default)]
    pub optional: bool,
    /// The remote system may fill the field in.
    #[serde(default)]
    pub computed: bool,
    /// How changes are applied.
    #[serde(default)]
    pub mutability: Mutability,
    /// Canonicalization for string values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalize: Option<Normalizer>,
}

impl Mutability {
    /// Combines an enclosing field's class with a nested field's class.
    #[must_use]
    pub fn combine(self, nested: Self) -> Self {
        self.max(nested)
    }
}

impl ValueKind {
    /// Name used in error messages.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Bool => "bool",
            Self::List { .. } => "list",
            Self::Set { .. } => "set",
            Self::Map { .. } => "map",
            Self::Block { .. } => "block",
        }
    }
}

impl Normalizer {
    /// Applies the normalization.
    #[must_use]
    pub fn apply(self, input: &str) -> String {
        match self {
            Self::Lowercase => input.to_lowercase(),
            Self::Location => input.to_lowercase().replace(' ', ""),
        }
    }
}

impl FieldSpec {
    fn with_kind(kind: ValueKind) -> Self {
        Self {
            name: String::new(),
            kind,
            required: false,
            optional: true,
            computed: false,
            mutability: Mutability::Mutable,
            normalize: None,
        }
    }

    /// Optional, mutable string field.
    #[must_use]
    pub fn string() -> Self {
        Self::with_kind(ValueKind::String)
    }

    /// Optional, mutable number field.
    #[must_use]
    pub fn number() -> Self {
        Self::with_kind(ValueKind::Number)
    }

    /// Optional, mutable boolean field.
    #[must_use]
    pub fn bool() -> Self {
        Self::with_kind(ValueKind::Bool)
    }

    /// Optional list field.
    #[must_use]
    pub fn list(element: ValueKind) -> Self {
        Self::with_kind(ValueKind::List {
            element: Box::new(element),
        })
    }

    /// Optional set field.
    #[must_use]
    pub fn set(element: ValueKind) -> Self {
        Self::with_kind(ValueKind::Set {
            element: Box::new(element),
        })
    }

    /// Optional map field.
    #[must_use]
    pub fn map(element: ValueKind) -> Self {
        Self::with_kind(ValueKind::Map {
            element: Box::new(element),
        })
    }

    /// Optional nested block.
    #[must_use]
    pub fn block<K: Into<String>>(fields: impl IntoIterator<Item = (K, Self)>) -> Self {
        let fields = fields
            .into_iter()
            .map(|(name, spec)| {
                let name = name.into();
                (name.clone(), spec.named(name))
            })
            .collect();
        Self::with_kind(ValueKind::Block { fields })
    }

    /// Marks the field as required.
    #[must_use]
    pub const fn required(mut self) -> Self {
        self.required = true;
        self.optional = false;
        self
    }

    /// Marks the field as optional with a remote-chosen default.
    #[must_use]
    pub const fn optional_computed(mut self) -> Self {
        self.required = false;
        self.optional = true;
        self.computed = true;
        self
    }

    /// Marks the field as owned by the remote system.
    #[must_use]
    pub const fn computed_only(mut self) -> Self {
        self.required = false;
        self.optional = false;
        self.computed = true;
        self.mutability = Mutability::ComputedOnly;
        self
    }

    /// Marks the field as forcing replacement when changed.
    #[must_use]
    pub const fn forces_replacement(mut self) -> Self {
        self.mutability = Mutability::ForcesReplacement;
        self
    }

    /// Sets the string normalizer.
    #[must_use]
    pub const fn normalized(mut self, normalizer: Normalizer) -> Self {
        self.normalize = Some(normalizer);
        self
    }

    /// Sets the field name.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Returns true if configuration may never supply this field.
    #[must_use]
    pub fn is_computed_only(&self) -> bool {
        self.mutability == Mutability::ComputedOnly
    }

    /// Returns true if an absent desired value defers to the remote system.
    #[must_use]
    pub fn defers_to_remote(&self) -> bool {
        self.optional && self.computed
    }

    /// Returns true if the field takes part in set-member identity.
    ///
    /// Fields the remote system may fill in are left out, so a member whose
    /// only difference is a remote-chosen value keeps its identity.
    #[must_use]
    pub const fn is_identifying(&self) -> bool {
        !self.computed
    }

    /// Checks the flag combination and fills in nested names.
    ///
    /// # Errors
    ///
    /// Returns a description of the first inconsistency found.
    pub fn normalize_spec(&mut self, name: &str) -> std::result::Result<(), String> {
        self.name = name.to_string();
        if self.required && self.optional {
            return Err(format!("field '{name}' cannot be both required and optional"));
        }
        if self.is_computed_only() && self.required {
            return Err(format!("computed-only field '{name}' cannot be required"));
        }
        if self.is_computed_only() {
            self.computed = true;
            self.optional = false;
        }
        if !self.required && !self.is_computed_only() {
            self.optional = true;
        }
        self.kind.normalize_fields(name)
    }
}

impl ValueKind {
    fn normalize_fields(&mut self, path: &str) -> std::result::Result<(), String> {
        match self {
            Self::Block { fields } => {
                for (nested_name, nested) in fields.iter_mut() {
                    nested.normalize_spec(&format!("{path}.{nested_name}"))?;
                    nested.name.clone_from(nested_name);
                }
                Ok(())
            }
            Self::List { element } | Self::Set { element } | Self::Map { element } => {
                element.normalize_fields(path)
            }
            Self::String | Self::Number | Self::Bool => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders() {
        let spec = FieldSpec::string().required().forces_replacement();
        assert!(spec.required);
        assert!(!spec.optional);
        assert_eq!(spec.mutability, Mutability::ForcesReplacement);

        let spec = FieldSpec::string().computed_only();
        assert!(spec.is_computed_only());
        assert!(!spec.is_identifying());

        let spec = FieldSpec::string().optional_computed();
        assert!(spec.defers_to_remote());
        assert!(!spec.is_computed_only());
    }

    #[test]
    fn test_mutability_combine_keeps_stronger() {
        assert_eq!(
            Mutability::Mutable.combine(Mutability::ForcesReplacement),
            Mutability::ForcesReplacement
        );
        assert_eq!(
            Mutability::ForcesReplacement.combine(Mutability::Mutable),
            Mutability::ForcesReplacement
        );
    }

    #[test]
    fn test_location_normalizer() {
        assert_eq!(Normalizer::Location.apply("West US 2"), "westus2");
        assert_eq!(Normalizer::Lowercase.apply("Standard_A1"), "standard_a1");
    }

    #[test]
    fn test_deserialize_nested_spec() {
        let yaml = r"
kind: block
required: true
mutability: forces_replacement
fields:
  name:
    kind: string
    required: true
  caching:
    kind: string
    optional: true
    computed: true
";
        let mut spec: FieldSpec = serde_yaml::from_str(yaml).unwrap();
        spec.normalize_spec("storage_os_disk").unwrap();
        let ValueKind::Block { fields } = &spec.kind else {
            panic!("expected block kind");
        };
        assert_eq!(fields["name"].name, "name");
        assert!(fields["caching"].defers_to_remote());
        assert_eq!(spec.mutability, Mutability::ForcesReplacement);
    }

    #[test]
    fn test_normalize_reaches_set_member_blocks() {
        let yaml = r"
kind: set
element:
  kind: block
  fields:
    lun: { kind: number, required: true }
    caching: { kind: string, computed: true }
";
        let mut spec: FieldSpec = serde_yaml::from_str(yaml).unwrap();
        spec.normalize_spec("storage_data_disk").unwrap();
        let ValueKind::Set { element } = &spec.kind else {
            panic!("expected set kind");
        };
        let ValueKind::Block { fields } = element.as_ref() else {
            panic!("expected block element");
        };
        assert_eq!(fields["caching"].name, "caching");
        assert!(fields["caching"].defers_to_remote());
        assert!(!fields["lun"].optional);
    }

    #[test]
    fn test_normalize_rejects_required_computed_only() {
        let mut spec = FieldSpec::string().computed_only();
        spec.required = true;
        assert!(spec.normalize_spec("id").is_err());
    }
}

//! Resource schemas and the registry that maps resource types to them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{ConfigError, Result};

use super::builtin;
use super::field::FieldSpec;

/// The full set of fields a resource type accepts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSchema {
    /// Field specifications by name.
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
}

/// Registry of resource schemas keyed by resource type.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, ResourceSchema>,
}

impl ResourceSchema {
    /// Creates an empty schema.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            fields: BTreeMap::new(),
        }
    }

    /// Adds a field.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        let name = name.into();
        self.fields.insert(name.clone(), spec.named(name));
        self
    }

    /// Looks up a field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.get(name)
    }

    /// Names of the required top-level fields.
    pub fn required_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|(_, spec)| spec.required)
            .map(|(name, _)| name.as_str())
    }

    /// Checks flag combinations and fills in field names.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the inconsistent field.
    pub fn normalize(&mut self, resource_type: &str) -> Result<()> {
        for (name, spec) in &mut self.fields {
            spec.normalize_spec(name).map_err(|message| {
                ConfigError::validation(format!("schema '{resource_type}'"), name.clone(), message)
            })?;
        }
        Ok(())
    }
}

impl SchemaRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            schemas: BTreeMap::new(),
        }
    }

    /// Creates a registry holding the builtin schemas.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .schemas
            .insert(String::from(builtin::VIRTUAL_MACHINE), builtin::virtual_machine());
        registry
    }

    /// Registers a schema, replacing any previous schema for the type.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema's flags are inconsistent.
    pub fn register(&mut self, resource_type: impl Into<String>, mut schema: ResourceSchema) -> Result<()> {
        let resource_type = resource_type.into();
        schema.normalize(&resource_type)?;
        debug!("Registered schema for resource type: {resource_type}");
        self.schemas.insert(resource_type, schema);
        Ok(())
    }

    /// Looks up the schema for a resource type.
    #[must_use]
    pub fn get(&self, resource_type: &str) -> Option<&ResourceSchema> {
        self.schemas.get(resource_type)
    }

    /// Registered resource types.
    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Mutability;

    #[test]
    fn test_registry_builtins() {
        let registry = SchemaRegistry::with_builtins();
        let schema = registry.get("virtual_machine").unwrap();
        assert_eq!(
            schema.field("name").unwrap().mutability,
            Mutability::ForcesReplacement
        );
        assert!(registry.get("load_balancer").is_none());
    }

    #[test]
    fn test_register_normalizes_names() {
        let mut registry = SchemaRegistry::new();
        let schema: ResourceSchema = serde_yaml::from_str(
            r"
fields:
  name: { kind: string, required: true, mutability: forces_replacement }
  subnet_id: { kind: string }
",
        )
        .unwrap();
        registry.register("network_interface", schema).unwrap();
        let schema = registry.get("network_interface").unwrap();
        assert_eq!(schema.field("subnet_id").unwrap().name, "subnet_id");
        assert!(schema.field("subnet_id").unwrap().optional);
        assert_eq!(schema.required_fields().collect::<Vec<_>>(), vec!["name"]);
    }

    #[test]
    fn test_register_rejects_inconsistent_flags() {
        let mut registry = SchemaRegistry::new();
        let schema = ResourceSchema::new().with_field("id", {
            let mut spec = FieldSpec::string().computed_only();
            spec.required = true;
            spec
        });
        assert!(registry.register("broken", schema).is_err());
    }
}

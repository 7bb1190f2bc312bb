//! Conversion of untyped configuration into typed values.
//!
//! This is the only place where configuration shape is checked. Everything
//! after it works with blocks that are known to match their schema.

use std::collections::BTreeMap;
use tracing::debug;

use crate::error::ConfigError;
use crate::value::{Block, Number, Scalar, Value, ValueSet};

use super::field::{FieldSpec, ValueKind};
use super::resource::ResourceSchema;

type ValidationResult<T> = std::result::Result<T, ConfigError>;

/// Validates resource attributes against a schema.
#[derive(Debug)]
pub struct SchemaValidator<'a> {
    /// Name of the resource being validated, for error messages.
    resource: &'a str,
    /// Schema of the resource type.
    schema: &'a ResourceSchema,
}

impl<'a> SchemaValidator<'a> {
    /// Creates a validator for one resource.
    #[must_use]
    pub const fn new(resource: &'a str, schema: &'a ResourceSchema) -> Self {
        Self { resource, schema }
    }

    /// Converts a YAML mapping of attributes into a typed block.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown or computed-only fields, type
    /// mismatches, and lists given where a single block is expected, and a
    /// missing-field error when a required field is absent.
    pub fn from_yaml(&self, attributes: &serde_yaml::Value) -> ValidationResult<Block> {
        let untyped = match attributes {
            serde_yaml::Value::Null => Block::new(),
            serde_yaml::Value::Mapping(_) => match self.untyped(attributes, "")? {
                Some(Value::Block(block)) => block,
                _ => Block::new(),
            },
            other => {
                return Err(ConfigError::validation(
                    self.resource,
                    "attributes",
                    format!("expected a mapping, got {}", yaml_type(other)),
                ));
            }
        };
        self.validate(untyped)
    }

    /// Checks a typed block against the schema and applies normalizers.
    ///
    /// Lists given for set-typed fields are converted into sets.
    ///
    /// # Errors
    ///
    /// See [`SchemaValidator::from_yaml`].
    pub fn validate(&self, block: Block) -> ValidationResult<Block> {
        let conformed = self.conform_block(&self.schema.fields, block, "")?;
        debug!("Validated {} fields for resource {}", conformed.len(), self.resource);
        Ok(conformed)
    }

    fn conform_block(
        &self,
        fields: &BTreeMap<String, FieldSpec>,
        block: Block,
        base: &str,
    ) -> ValidationResult<Block> {
        let mut conformed = Block::new();

        for (name, value) in block {
            let path = join(base, &name);
            let Some(spec) = fields.get(&name) else {
                return Err(ConfigError::validation(self.resource, path, "unknown field"));
            };
            if spec.is_computed_only() {
                return Err(ConfigError::validation(
                    self.resource,
                    path,
                    "field is computed by the remote system and cannot be set",
                ));
            }
            let value = self.conform(spec, &spec.kind, value, &path)?;
            conformed.insert(name, value);
        }

        for (name, spec) in fields {
            if spec.required && !conformed.contains_key(name) {
                return Err(ConfigError::MissingRequiredField {
                    resource: self.resource.to_string(),
                    field: join(base, name),
                });
            }
        }

        Ok(conformed)
    }

    fn conform(
        &self,
        spec: &FieldSpec,
        kind: &ValueKind,
        value: Value,
        path: &str,
    ) -> ValidationResult<Value> {
        match (kind, value) {
            (ValueKind::String, Value::Scalar(Scalar::String(s))) => {
                let s = match spec.normalize {
                    Some(normalizer) => normalizer.apply(&s),
                    None => s,
                };
                Ok(Value::string(s))
            }
            (ValueKind::Number, v @ Value::Scalar(Scalar::Number(_)))
            | (ValueKind::Bool, v @ Value::Scalar(Scalar::Bool(_))) => Ok(v),
            (ValueKind::List { element }, Value::List(items)) => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| self.conform(spec, element, item, &format!("{path}[{i}]")))
                .collect::<ValidationResult<Vec<_>>>()
                .map(Value::List),
            (ValueKind::Set { element }, Value::List(items)) => {
                let count = items.len();
                let set = self.conform_members(spec, element, items, path)?;
                if set.len() < count {
                    debug!("Collapsed duplicate members of {}.{path}", self.resource);
                }
                Ok(Value::Set(set))
            }
            (ValueKind::Set { element }, Value::Set(set)) => {
                let members: Vec<Value> = set.into();
                Ok(Value::Set(self.conform_members(spec, element, members, path)?))
            }
            (ValueKind::Map { element }, Value::Block(map)) => map
                .into_iter()
                .map(|(key, item)| {
                    let item_path = join(path, &key);
                    self.conform(spec, element, item, &item_path).map(|v| (key, v))
                })
                .collect::<ValidationResult<Block>>()
                .map(Value::Block),
            (ValueKind::Block { fields }, Value::Block(nested)) => {
                self.conform_block(fields, nested, path).map(Value::Block)
            }
            (ValueKind::Block { .. }, Value::List(items)) => Err(ConfigError::validation(
                self.resource,
                path,
                format!("expected a single block, got a list of {}", items.len()),
            )),
            (kind, other) => Err(ConfigError::validation(
                self.resource,
                path,
                format!("expected {}, got {}", kind.name(), other.type_name()),
            )),
        }
    }

    fn conform_members(
        &self,
        spec: &FieldSpec,
        element: &ValueKind,
        members: Vec<Value>,
        path: &str,
    ) -> ValidationResult<ValueSet> {
        members
            .into_iter()
            .map(|member| self.conform(spec, element, member, path))
            .collect()
    }

    /// Converts YAML into values by shape alone. Nulls become absent.
    fn untyped(&self, yaml: &serde_yaml::Value, path: &str) -> ValidationResult<Option<Value>> {
        let value = match yaml {
            serde_yaml::Value::Null => return Ok(None),
            serde_yaml::Value::Bool(b) => Value::bool(*b),
            serde_yaml::Value::Number(n) => Value::Scalar(Scalar::Number(
                n.as_i64().map_or_else(|| Number::Float(n.as_f64().unwrap_or(f64::NAN)), Number::Int),
            )),
            serde_yaml::Value::String(s) => Value::string(s.clone()),
            serde_yaml::Value::Sequence(items) => {
                let mut values = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    if let Some(v) = self.untyped(item, &format!("{path}[{i}]"))? {
                        values.push(v);
                    }
                }
                Value::List(values)
            }
            serde_yaml::Value::Mapping(mapping) => {
                let mut block = Block::new();
                for (key, item) in mapping {
                    let Some(key) = key.as_str() else {
                        return Err(ConfigError::validation(
                            self.resource,
                            path,
                            format!("mapping keys must be strings, got {}", yaml_type(key)),
                        ));
                    };
                    if let Some(v) = self.untyped(item, &join(path, key))? {
                        block.insert(key.to_string(), v);
                    }
                }
                Value::Block(block)
            }
            serde_yaml::Value::Tagged(tagged) => {
                return Err(ConfigError::validation(
                    self.resource,
                    path,
                    format!("YAML tags are not supported ({})", tagged.tag),
                ));
            }
        };
        Ok(Some(value))
    }
}

fn join(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{base}.{name}")
    }
}

const fn yaml_type(value: &serde_yaml::Value) -> &'static str {
    match value {
        serde_yaml::Value::Null => "null",
        serde_yaml::Value::Bool(_) => "bool",
        serde_yaml::Value::Number(_) => "number",
        serde_yaml::Value::String(_) => "string",
        serde_yaml::Value::Sequence(_) => "list",
        serde_yaml::Value::Mapping(_) => "mapping",
        serde_yaml::Value::Tagged(_) => "tagged value",
    }
}

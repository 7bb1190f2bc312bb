//! Configuration validation.
//!
//! Registers user schemas, checks resource declarations and converts their
//! attributes into typed blocks. Every problem is collected before the
//! first one is returned, so `converge validate` can list them all.

use crate::error::{ConfigError, ConvergeError, Result};
use crate::schema::{SchemaRegistry, SchemaValidator};
use crate::state::StateStore;
use crate::value::Block;
use std::collections::HashSet;
use tracing::debug;

use super::spec::{ConfigDocument, EngineSettings};

/// Validator for configuration documents.
#[derive(Debug)]
pub struct ConfigValidator {
    /// Schemas available before the document's own are registered.
    base: SchemaRegistry,
}

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationReport {
    /// Validation errors.
    pub errors: Vec<ConfigError>,
    /// Non-fatal issues.
    pub warnings: Vec<String>,
}

/// A resource whose attributes passed schema validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredResource {
    /// Resource name.
    pub name: String,
    /// Resource type.
    pub resource_type: String,
    /// Typed desired state.
    pub desired: Block,
}

/// A validated configuration, ready to feed a state store.
#[derive(Debug)]
pub struct LoadedConfig {
    /// Engine settings.
    pub settings: EngineSettings,
    /// Builtin and user-defined schemas.
    pub registry: SchemaRegistry,
    /// Declared resources in document order.
    pub resources: Vec<DesiredResource>,
    /// Non-fatal issues found while validating.
    pub warnings: Vec<String>,
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigValidator {
    /// Creates a validator that knows the builtin schemas.
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: SchemaRegistry::with_builtins(),
        }
    }

    /// Creates a validator on top of a custom registry.
    #[must_use]
    pub const fn with_registry(base: SchemaRegistry) -> Self {
        Self { base }
    }

    /// Validates a document and returns the typed configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation error found.
    pub fn validate(&self, document: &ConfigDocument) -> Result<LoadedConfig> {
        let (loaded, report) = self.check(document);
        match report.errors.into_iter().next() {
            Some(first) => Err(ConvergeError::Config(first)),
            None => {
                debug!("Configuration validation passed");
                Ok(loaded)
            }
        }
    }

    /// Validates a document, collecting every error and warning.
    ///
    /// The returned configuration only holds the resources that passed.
    #[must_use]
    pub fn check(&self, document: &ConfigDocument) -> (LoadedConfig, ValidationReport) {
        let mut report = ValidationReport::default();

        Self::validate_settings(&document.settings, &mut report);
        let registry = self.register_schemas(document, &mut report);
        let resources = Self::validate_resources(document, &registry, &mut report);

        let loaded = LoadedConfig {
            settings: document.settings.clone(),
            registry,
            resources,
            warnings: report.warnings.clone(),
        };
        (loaded, report)
    }

    fn validate_settings(settings: &EngineSettings, report: &mut ValidationReport) {
        if settings.parallelism == 0 {
            report.errors.push(settings_error(
                "parallelism",
                "must be at least 1",
            ));
        } else if settings.parallelism > 64 {
            report.warnings.push(format!(
                "settings.parallelism is {}; remote APIs usually throttle well below that",
                settings.parallelism
            ));
        }

        let retry = &settings.retry;
        if retry.max_attempts == 0 {
            report
                .errors
                .push(settings_error("retry.max_attempts", "must be at least 1"));
        }
        if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
            report.errors.push(settings_error(
                "retry.multiplier",
                &format!("must be a number of at least 1.0, got {}", retry.multiplier),
            ));
        }
        if retry.initial_delay_ms > retry.max_delay_ms {
            report.errors.push(settings_error(
                "retry.initial_delay_ms",
                "must not exceed retry.max_delay_ms",
            ));
        }

        if settings.state.path.as_deref().is_some_and(|p| p.trim().is_empty()) {
            report
                .errors
                .push(settings_error("state.path", "cannot be empty"));
        }
    }

    fn register_schemas(
        &self,
        document: &ConfigDocument,
        report: &mut ValidationReport,
    ) -> SchemaRegistry {
        let mut registry = self.base.clone();
        for (resource_type, schema) in &document.schemas {
            if registry.get(resource_type).is_some() {
                report.warnings.push(format!(
                    "schema '{resource_type}' overrides the builtin schema of that name"
                ));
            }
            if let Err(e) = registry.register(resource_type.clone(), schema.clone()) {
                report.errors.push(match e {
                    ConvergeError::Config(config) => config,
                    other => ConfigError::validation(
                        format!("schema '{resource_type}'"),
                        "fields",
                        other.to_string(),
                    ),
                });
            }
        }
        registry
    }

    fn validate_resources(
        document: &ConfigDocument,
        registry: &SchemaRegistry,
        report: &mut ValidationReport,
    ) -> Vec<DesiredResource> {
        let mut seen = HashSet::new();
        let mut resources = Vec::with_capacity(document.resources.len());

        for decl in &document.resources {
            if decl.name.is_empty() {
                report.errors.push(ConfigError::ValidationError {
                    resource: None,
                    field: Some(String::from("name")),
                    message: String::from("Resource name cannot be empty"),
                });
                continue;
            }
            if !is_valid_name(&decl.name) {
                report.errors.push(ConfigError::validation(
                    decl.name.clone(),
                    "name",
                    "must contain only letters, digits, hyphens and underscores",
                ));
                continue;
            }
            if !seen.insert(decl.name.as_str()) {
                report.errors.push(ConfigError::DuplicateName {
                    name: decl.name.clone(),
                });
                continue;
            }

            let Some(schema) = registry.get(&decl.resource_type) else {
                report.errors.push(ConfigError::UnknownResourceType {
                    resource: decl.name.clone(),
                    resource_type: decl.resource_type.clone(),
                });
                continue;
            };

            match SchemaValidator::new(&decl.name, schema).from_yaml(&decl.attributes) {
                Ok(desired) => resources.push(DesiredResource {
                    name: decl.name.clone(),
                    resource_type: decl.resource_type.clone(),
                    desired,
                }),
                Err(e) => report.errors.push(e),
            }
        }

        if resources.is_empty() && report.errors.is_empty() {
            report
                .warnings
                .push(String::from("No resources declared; every tracked resource will be destroyed"));
        }
        resources
    }
}

impl ValidationReport {
    /// Returns true when no errors were found.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

impl LoadedConfig {
    /// Declares every resource's desired state in the store.
    ///
    /// Tracked resources that are no longer declared keep their prior state
    /// with no desired state, so the next plan destroys them.
    ///
    /// # Errors
    ///
    /// Returns an error if a resource is currently checked out.
    pub fn declare_in(&self, store: &mut StateStore) -> Result<()> {
        let declared: HashSet<&str> = self.resources.iter().map(|r| r.name.as_str()).collect();
        let undeclared: Vec<String> = store
            .resources()
            .filter(|state| state.desired.is_some() && !declared.contains(state.name.as_str()))
            .map(|state| state.name.clone())
            .collect();
        for name in undeclared {
            store.get_mut(&name)?.desired = None;
        }

        for resource in &self.resources {
            store.set_desired(&resource.name, &resource.resource_type, resource.desired.clone())?;
        }
        Ok(())
    }
}

fn settings_error(field: &str, message: &str) -> ConfigError {
    ConfigError::ValidationError {
        resource: None,
        field: Some(format!("settings.{field}")),
        message: message.to_string(),
    }
}

/// Checks if a resource name is valid.
fn is_valid_name(name: &str) -> bool {
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::value::Value;

    const VM_ATTRIBUTES: &str = r"
      name: vm1
      location: West Europe
      resource_group_name: rg1
      vm_size: Standard_A1
      network_interface_ids: [/nics/a]
      storage_os_disk:
        name: osdisk
        vhd_uri: https://disks/osdisk.vhd
        create_option: FromImage
      os_profile:
        computer_name: host1
        admin_username: admin
        admin_password: secret
";

    fn document(resources: &str) -> ConfigDocument {
        ConfigParser::parse_yaml(resources, None).unwrap()
    }

    fn vm_document() -> ConfigDocument {
        document(&format!(
            "resources:\n  - name: vm1\n    type: virtual_machine\n    attributes:{VM_ATTRIBUTES}"
        ))
    }

    #[test]
    fn test_valid_config() {
        let loaded = ConfigValidator::new().validate(&vm_document()).unwrap();
        assert_eq!(loaded.resources.len(), 1);
        let vm = &loaded.resources[0];
        assert_eq!(vm.resource_type, "virtual_machine");
        // Normalized at load time.
        assert_eq!(vm.desired.get("location"), Some(&Value::string("westeurope")));
    }

    #[test]
    fn test_duplicate_names() {
        let mut doc = vm_document();
        doc.resources.push(doc.resources[0].clone());
        let (_, report) = ConfigValidator::new().check(&doc);
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, ConfigError::DuplicateName { name } if name == "vm1")));
    }

    #[test]
    fn test_unknown_type_and_bad_name() {
        let doc = document(
            r"
resources:
  - name: lb1
    type: load_balancer
  - name: bad name
    type: virtual_machine
",
        );
        let (loaded, report) = ConfigValidator::new().check(&doc);
        assert!(loaded.resources.is_empty());
        assert_eq!(report.errors.len(), 2);
        assert!(matches!(report.errors[0], ConfigError::UnknownResourceType { .. }));
        assert!(matches!(report.errors[1], ConfigError::ValidationError { .. }));
    }

    #[test]
    fn test_schema_errors_are_collected() {
        let doc = document(
            r"
resources:
  - name: vm1
    type: virtual_machine
    attributes:
      name: vm1
",
        );
        let err = ConfigValidator::new().validate(&doc).unwrap_err();
        assert!(matches!(
            err,
            ConvergeError::Config(ConfigError::MissingRequiredField { .. })
        ));
    }

    #[test]
    fn test_user_schema_registered() {
        let doc = document(
            r"
schemas:
  network_interface:
    fields:
      name: { kind: string, required: true, mutability: forces_replacement }
resources:
  - name: nic1
    type: network_interface
    attributes:
      name: nic1
",
        );
        let loaded = ConfigValidator::new().validate(&doc).unwrap();
        assert!(loaded.registry.get("network_interface").is_some());
        assert!(loaded.registry.get("virtual_machine").is_some());
        assert!(loaded.warnings.is_empty());
    }

    #[test]
    fn test_settings_sanity() {
        let mut doc = vm_document();
        doc.settings.parallelism = 0;
        doc.settings.retry.multiplier = 0.5;
        let (_, report) = ConfigValidator::new().check(&doc);
        assert!(!report.is_valid());
        assert_eq!(report.errors.len(), 2);
    }

    #[test]
    fn test_declare_in_marks_undeclared_for_destroy() {
        let loaded = ConfigValidator::new().validate(&vm_document()).unwrap();
        let mut store = StateStore::in_memory();
        store.set_desired("old", "virtual_machine", Block::new()).unwrap();

        loaded.declare_in(&mut store).unwrap();
        assert!(store.get("vm1").and_then(|s| s.desired.as_ref()).is_some());
        assert!(store.get("old").is_some_and(|s| s.desired.is_none()));
    }

    #[test]
    fn test_valid_names() {
        assert!(is_valid_name("vm-1_a"));
        assert!(!is_valid_name("vm 1"));
        assert!(!is_valid_name("vm.1"));
    }
}

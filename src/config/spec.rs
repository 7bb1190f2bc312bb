//! Configuration document types.
//!
//! These structs map to `converge.yaml`. Resource attributes stay untyped
//! here; the [`ConfigValidator`](super::ConfigValidator) turns them into
//! typed blocks.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::reconciler::{ReconcilerSettings, RetryPolicy, DEFAULT_MAX_ATTEMPTS, DEFAULT_PARALLELISM};
use crate::schema::ResourceSchema;
use crate::state::STATE_DIR;

/// The root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigDocument {
    /// Engine settings.
    #[serde(default)]
    pub settings: EngineSettings,
    /// User-defined resource schemas by resource type.
    #[serde(default)]
    pub schemas: BTreeMap<String, ResourceSchema>,
    /// Declared resources.
    #[serde(default)]
    pub resources: Vec<ResourceDecl>,
}

/// Engine settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineSettings {
    /// Maximum number of concurrent remote operations.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Retry behavior for transient remote failures.
    #[serde(default)]
    pub retry: RetrySettings,
    /// State persistence.
    #[serde(default)]
    pub state: StateSettings,
}

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySettings {
    /// Attempts per remote call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay after the first failure, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound for delays, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth factor between attempts.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

/// State persistence configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateSettings {
    /// State file path. Relative paths resolve against the configuration
    /// file's directory.
    #[serde(default)]
    pub path: Option<String>,
}

/// A declared resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceDecl {
    /// Unique resource name.
    pub name: String,
    /// Resource type, selecting the schema.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Untyped attributes, checked against the schema on load.
    #[serde(default)]
    pub attributes: serde_yaml::Value,
}

const fn default_parallelism() -> usize {
    DEFAULT_PARALLELISM
}

const fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

const fn default_initial_delay_ms() -> u64 {
    500
}

const fn default_max_delay_ms() -> u64 {
    30_000
}

const fn default_multiplier() -> f64 {
    2.0
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            retry: RetrySettings::default(),
            state: StateSettings::default(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetrySettings {
    /// Builds the retry policy these settings describe.
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts)
            .with_initial_delay(Duration::from_millis(self.initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_multiplier(self.multiplier)
    }
}

impl EngineSettings {
    /// Builds reconciler settings.
    #[must_use]
    pub fn reconciler(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            parallelism: self.parallelism,
            retry: self.retry.policy(),
        }
    }
}

impl StateSettings {
    /// Resolves the state file path against a base directory.
    #[must_use]
    pub fn resolve(&self, base_dir: &std::path::Path) -> PathBuf {
        self.path.as_ref().map_or_else(
            || base_dir.join(STATE_DIR).join("state.json"),
            |path| base_dir.join(path),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_defaults() {
        let settings = EngineSettings::default();
        assert_eq!(settings.parallelism, DEFAULT_PARALLELISM);
        assert_eq!(settings.retry.policy(), RetryPolicy::default());
        assert_eq!(settings.reconciler(), ReconcilerSettings::default());
    }

    #[test]
    fn test_state_path_resolution() {
        let base = Path::new("/work");
        assert_eq!(
            StateSettings::default().resolve(base),
            Path::new("/work/.converge/state.json")
        );
        let custom = StateSettings {
            path: Some(String::from("state/prod.json")),
        };
        assert_eq!(custom.resolve(base), Path::new("/work/state/prod.json"));
    }
}

//! Configuration parser for loading configuration files.
//!
//! This module handles loading configuration from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, ConvergeError, Result};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

use super::spec::ConfigDocument;

/// Overrides `settings.parallelism`.
pub const ENV_PARALLELISM: &str = "CONVERGE_PARALLELISM";

/// Overrides `settings.retry.max_attempts`.
pub const ENV_MAX_ATTEMPTS: &str = "CONVERGE_MAX_ATTEMPTS";

/// Overrides `settings.state.path`.
pub const ENV_STATE_PATH: &str = "CONVERGE_STATE_PATH";

/// Configuration parser.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Directory relative paths resolve against.
    #[must_use]
    pub fn base_path(&self) -> &Path {
        self.base_path.as_deref().unwrap_or_else(|| Path::new("."))
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<ConfigDocument> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConvergeError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        Self::parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(content: &str, source: Option<&Path>) -> Result<ConfigDocument> {
        debug!("Parsing YAML configuration");

        let document: ConfigDocument = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string()).or_else(|| {
                e.location()
                    .map(|l| format!("line {}, column {}", l.line(), l.column()))
            });
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed {} resources and {} schemas",
            document.resources.len(),
            document.schemas.len()
        );
        Ok(document)
    }

    /// Loads `.env`, then the configuration file, then applies environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be read or parsed, or an override
    /// is not a valid number.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<ConfigDocument> {
        self.load_dotenv()?;
        let mut document = self.load_file(path)?;
        Self::apply_env_overrides(&mut document, |name| std::env::var(name).ok())?;
        Ok(document)
    }

    /// Applies environment overrides, reading variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns a validation error if a numeric override does not parse.
    pub fn apply_env_overrides(
        document: &mut ConfigDocument,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<()> {
        if let Some(value) = lookup(ENV_PARALLELISM) {
            debug!("Overriding settings.parallelism from environment");
            document.settings.parallelism = parse_override(ENV_PARALLELISM, &value)?;
        }

        if let Some(value) = lookup(ENV_MAX_ATTEMPTS) {
            debug!("Overriding settings.retry.max_attempts from environment");
            document.settings.retry.max_attempts = parse_override(ENV_MAX_ATTEMPTS, &value)?;
        }

        if let Some(path) = lookup(ENV_STATE_PATH) {
            debug!("Overriding settings.state.path from environment");
            document.settings.state.path = Some(path);
        }

        Ok(())
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self.base_path().join(".env");

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                ConvergeError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

fn parse_override<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        ConvergeError::Config(ConfigError::ValidationError {
            resource: None,
            field: Some(name.to_string()),
            message: format!("'{value}' is not a valid number"),
        })
    })
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["converge.yaml", "converge.yml"];

/// Finds the configuration file in the current directory or parent directories.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(ConvergeError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

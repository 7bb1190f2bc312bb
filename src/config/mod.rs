//! Configuration module.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `converge.yaml`
//! - Environment overrides and `.env` loading
//! - Validation of settings, schemas and resource declarations

mod parser;
mod spec;
mod validator;

pub use parser::{
    find_config_file, ConfigParser, DEFAULT_CONFIG_FILES, ENV_MAX_ATTEMPTS, ENV_PARALLELISM,
    ENV_STATE_PATH,
};
pub use spec::{ConfigDocument, EngineSettings, ResourceDecl, RetrySettings, StateSettings};
pub use validator::{ConfigValidator, DesiredResource, LoadedConfig, ValidationReport};

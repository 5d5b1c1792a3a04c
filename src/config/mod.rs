//! Configuration module for the Stratum engine.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `stratum.stack.yaml`
//! - Validation of field values and cross-field rules
//! - Computing configuration hashes for change detection

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::ConfigHasher;
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, PROVIDER_TOKEN_VAR, find_config_file};
pub use spec::{
    ExecutionConfig, ProviderConfig, ProviderKind, ResourceConfig, StackConfig, StackMeta,
    StateBackend, StateConfig,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};

/// Starter stack written by `stratum init`.
pub const STACK_TEMPLATE: &str = include_str!("../../templates/stratum.stack.yaml");

/// Starter `.env` written by `stratum init`.
pub const ENV_TEMPLATE: &str = include_str!("../../templates/.env.example");

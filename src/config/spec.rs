//! Stack file types.
//!
//! This module defines all the structs that map to the `stratum.stack.yaml` file.
//! These types are declarative: they describe the desired resources, never
//! the steps to reach them.

use crate::graph::Properties;
use crate::provider::TypeSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::Validate;

/// The root structure of a stack file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct StackConfig {
    /// Stack identity.
    #[validate(nested)]
    pub stack: StackMeta,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Control-plane configuration.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Executor tuning.
    #[serde(default)]
    #[validate(nested)]
    pub execution: ExecutionConfig,
    /// Type metadata overriding what the provider reports.
    #[serde(default)]
    pub types: BTreeMap<String, TypeSchema>,
    /// Declared resources.
    #[serde(default)]
    #[validate(nested)]
    pub resources: Vec<ResourceConfig>,
}

/// Stack identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct StackMeta {
    /// Unique name for the stack.
    #[validate(length(min = 1, max = 63, message = "stack name must be 1-63 characters"))]
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    #[validate(length(min = 1, max = 32, message = "environment must be 1-32 characters"))]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Control-plane configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Provider implementation.
    #[serde(default)]
    pub kind: ProviderKind,
    /// Base URL of the control plane (http provider).
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::default(),
            endpoint: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Provider implementations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// REST control plane.
    #[default]
    Http,
    /// In-process control plane; nothing leaves the machine.
    Memory,
}

/// Executor tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ExecutionConfig {
    /// Maximum number of actions in flight.
    #[serde(default = "default_parallelism")]
    #[validate(range(min = 1, max = 64, message = "parallelism must be between 1 and 64"))]
    pub parallelism: usize,
    /// Attempts per provider call, including the first.
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 20, message = "max_attempts must be between 1 and 20"))]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for a single retry delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    #[validate(range(min = 1, message = "max_delay_ms must be positive"))]
    pub max_delay_ms: u64,
    /// Initial interval between status polls, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    #[validate(range(min = 1, message = "poll_interval_ms must be positive"))]
    pub poll_interval_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// A declared resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct ResourceConfig {
    /// Logical name, unique within the stack.
    #[validate(length(min = 1, max = 63, message = "resource name must be 1-63 characters"))]
    pub name: String,
    /// Resource type (e.g., `storage.bucket`).
    #[serde(rename = "type")]
    #[validate(length(min = 1, message = "resource type cannot be empty"))]
    pub resource_type: String,
    /// Properties; string values may embed `${resource.attribute}` references.
    #[serde(default)]
    pub properties: Properties,
    /// Explicit dependencies, in addition to the ones implied by references.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_parallelism() -> usize {
    4
}

const fn default_max_attempts() -> u32 {
    crate::provider::DEFAULT_MAX_ATTEMPTS
}

const fn default_base_delay_ms() -> u64 {
    crate::provider::DEFAULT_BASE_DELAY_MS
}

const fn default_max_delay_ms() -> u64 {
    crate::provider::DEFAULT_MAX_DELAY_MS
}

const fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_environment() -> String {
    String::from("dev")
}

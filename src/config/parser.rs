//! Stack file parser.
//!
//! This module handles loading the stack file from YAML and applying
//! environment variable overrides, with proper precedence and error handling.

use crate::error::{ConfigError, Result, StratumError};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::StackConfig;

/// Environment variable holding the control-plane token.
pub const PROVIDER_TOKEN_VAR: &str = "STRATUM_PROVIDER_TOKEN";

/// Default stack file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "stratum.stack.yaml",
    "stratum.stack.yml",
    "stack.yaml",
    "stack.yml",
];

/// Parser for stack files.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving `.env`.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path used to find `.env`.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a stack file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let path = path.as_ref();
        info!("Loading stack from: {}", path.display());

        if !path.exists() {
            return Err(StratumError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            StratumError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses a stack from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<StackConfig> {
        debug!("Parsing stack YAML");

        let config: StackConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = match (source, e.location()) {
                (Some(p), Some(loc)) => Some(format!("{}:{}:{}", p.display(), loc.line(), loc.column())),
                (Some(p), None) => Some(p.display().to_string()),
                (None, Some(loc)) => Some(format!("line {}, column {}", loc.line(), loc.column())),
                (None, None) => None,
            };
            StratumError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed stack '{}' with {} resources",
            config.stack.name,
            config.resources.len()
        );
        Ok(config)
    }

    /// Loads a stack file, then applies environment overrides.
    ///
    /// Overrides use the format `STRATUM_<SECTION>_<KEY>`
    /// (e.g., `STRATUM_STACK_ENVIRONMENT`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_env_overrides(&mut config);
        Ok(config)
    }

    fn apply_env_overrides(config: &mut StackConfig) {
        if let Ok(name) = std::env::var("STRATUM_STACK_NAME") {
            debug!("Overriding stack.name from environment");
            config.stack.name = name;
        }

        if let Ok(env) = std::env::var("STRATUM_STACK_ENVIRONMENT") {
            debug!("Overriding stack.environment from environment");
            config.stack.environment = env;
        }

        if let Ok(bucket) = std::env::var("STRATUM_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            config.state.bucket = Some(bucket);
        }

        if let Ok(prefix) = std::env::var("STRATUM_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            config.state.prefix = Some(prefix);
        }

        if let Ok(endpoint) = std::env::var("STRATUM_PROVIDER_ENDPOINT") {
            debug!("Overriding provider.endpoint from environment");
            config.provider.endpoint = Some(endpoint);
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                StratumError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Gets the control-plane token from the environment, if set.
    #[must_use]
    pub fn provider_token() -> Option<String> {
        std::env::var(PROVIDER_TOKEN_VAR)
            .ok()
            .filter(|t| !t.trim().is_empty())
    }
}

/// Finds the stack file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no stack file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found stack file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(StratumError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderKind, STACK_TEMPLATE, StateBackend};
    use crate::provider::ReplacePolicy;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r"
stack:
  name: test-stack
";
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        assert_eq!(config.stack.name, "test-stack");
        assert_eq!(config.stack.environment, "dev");
        assert_eq!(config.state.backend, StateBackend::Local);
        assert_eq!(config.provider.kind, ProviderKind::Http);
        assert_eq!(config.execution.parallelism, 4);
        assert!(config.resources.is_empty());
    }

    #[test]
    fn test_parse_template() {
        let config = ConfigParser::new().parse_yaml(STACK_TEMPLATE, None).unwrap();

        assert_eq!(config.stack.name, "image-analysis");
        assert_eq!(config.resources.len(), 7);

        let handler = config
            .resources
            .iter()
            .find(|r| r.name == "analyzer")
            .unwrap();
        assert_eq!(handler.resource_type, "compute.function");
        assert_eq!(
            handler.properties["environment"]["TABLE_NAME"],
            serde_json::json!("${results.name}")
        );

        let table = &config.types["nosql.table"];
        assert!(table.is_immutable("partition_key"));
        assert_eq!(table.replace, ReplacePolicy::DeleteBeforeCreate);
    }

    #[test]
    fn test_parse_error_has_location() {
        let yaml = "stack:\n  name: [unclosed\n";
        let err = ConfigParser::new().parse_yaml(yaml, None).unwrap_err();
        assert!(matches!(
            err,
            StratumError::Config(ConfigError::ParseError {
                location: Some(_),
                ..
            })
        ));
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("stratum.stack.yaml"), "stack: { name: x }\n").unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, dir.path().join("stratum.stack.yaml"));
    }

    #[test]
    fn test_find_config_file_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = find_config_file(dir.path());
        // A stack file further up the real filesystem would be found instead.
        if let Err(e) = err {
            assert!(matches!(e, StratumError::Config(ConfigError::FileNotFound { .. })));
        }
    }
}

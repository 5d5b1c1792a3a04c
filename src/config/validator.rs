//! Stack validation.
//!
//! Field-level rules (lengths, ranges) come from the `validator` derives on
//! the stack types; this module adds the cross-field rules and collects
//! everything into one report before any graph is built.

use crate::error::{ConfigError, Result, StratumError};
use std::collections::HashSet;
use tracing::debug;
use validator::{Validate, ValidationErrors, ValidationErrorsKind};

use super::spec::{ProviderKind, ResourceConfig, StackConfig, StateBackend};

/// Validator for stack files.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a stack.
    ///
    /// # Errors
    ///
    /// Returns the first error if validation fails.
    pub fn validate(&self, config: &StackConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if result.errors.is_empty() {
            debug!("Stack validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(StratumError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    /// Runs every check and returns the full report.
    #[must_use]
    pub fn check(&self, config: &StackConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        if let Err(errors) = config.validate() {
            flatten_field_errors("", &errors, &mut result);
        }

        Self::validate_stack(config, &mut result);
        Self::validate_state(config, &mut result);
        Self::validate_provider(config, &mut result);
        Self::validate_resources(&config.resources, &mut result);
        Self::validate_types(config, &mut result);

        result
    }

    fn validate_stack(config: &StackConfig, result: &mut ValidationResult) {
        if !config.stack.name.is_empty() && !is_valid_name(&config.stack.name) {
            result.errors.push(ValidationError {
                field: String::from("stack.name"),
                message: format!(
                    "Stack name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    config.stack.name
                ),
            });
        }
    }

    fn validate_state(config: &StackConfig, result: &mut ValidationResult) {
        let state = &config.state;
        if state.backend == StateBackend::S3 && state.bucket.as_deref().is_none_or(str::is_empty) {
            result.errors.push(ValidationError {
                field: String::from("state.bucket"),
                message: String::from("S3 backend requires a bucket name"),
            });
        }

        if state.backend == StateBackend::Local && state.bucket.is_some() {
            result
                .warnings
                .push(String::from("state.bucket is ignored by the local backend"));
        }
    }

    fn validate_provider(config: &StackConfig, result: &mut ValidationResult) {
        let provider = &config.provider;
        match provider.kind {
            ProviderKind::Http => match provider.endpoint.as_deref() {
                None | Some("") => result.errors.push(ValidationError {
                    field: String::from("provider.endpoint"),
                    message: String::from(
                        "HTTP provider requires an endpoint (or STRATUM_PROVIDER_ENDPOINT)",
                    ),
                }),
                Some(endpoint)
                    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") =>
                {
                    result.errors.push(ValidationError {
                        field: String::from("provider.endpoint"),
                        message: format!("Endpoint '{endpoint}' must be an http(s) URL"),
                    });
                }
                Some(_) => {}
            },
            ProviderKind::Memory => result.warnings.push(String::from(
                "provider.kind is 'memory': nothing will be provisioned outside this process",
            )),
        }

        if provider.timeout_secs == 0 {
            result.errors.push(ValidationError {
                field: String::from("provider.timeout_secs"),
                message: String::from("Timeout must be positive"),
            });
        }

        let execution = &config.execution;
        if execution.base_delay_ms > execution.max_delay_ms {
            result.warnings.push(format!(
                "execution.base_delay_ms ({}) exceeds max_delay_ms ({}); retries will wait max_delay_ms",
                execution.base_delay_ms, execution.max_delay_ms
            ));
        }
    }

    fn validate_resources(resources: &[ResourceConfig], result: &mut ValidationResult) {
        if resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources defined in stack"));
            return;
        }

        let mut seen = HashSet::new();
        for (i, resource) in resources.iter().enumerate() {
            let field = format!("resources[{i}]");

            if !resource.name.is_empty() && !is_valid_name(&resource.name) {
                result.errors.push(ValidationError {
                    field: format!("{field}.name"),
                    message: format!(
                        "Resource name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                        resource.name
                    ),
                });
            }

            if !seen.insert(resource.name.as_str()) {
                result.errors.push(ValidationError {
                    field: format!("{field}.name"),
                    message: format!("Duplicate resource name: {}", resource.name),
                });
            }

            if !resource.resource_type.is_empty() && !is_valid_type(&resource.resource_type) {
                result.errors.push(ValidationError {
                    field: format!("{field}.type"),
                    message: format!(
                        "Resource type '{}' is invalid. Expected dotted lowercase segments, e.g. 'storage.bucket'.",
                        resource.resource_type
                    ),
                });
            }

            let mut deps = HashSet::new();
            for dep in &resource.depends_on {
                if !deps.insert(dep.as_str()) {
                    result.warnings.push(format!(
                        "{}: '{dep}' listed more than once in depends_on",
                        resource.name
                    ));
                }
            }
        }
    }

    fn validate_types(config: &StackConfig, result: &mut ValidationResult) {
        let declared: HashSet<&str> = config
            .resources
            .iter()
            .map(|r| r.resource_type.as_str())
            .collect();

        for (type_name, schema) in &config.types {
            if !declared.contains(type_name.as_str()) {
                result.warnings.push(format!(
                    "types.{type_name} is not used by any resource"
                ));
            }
            if schema.stabilize_timeout_secs == 0 {
                result.errors.push(ValidationError {
                    field: format!("types.{type_name}.stabilize_timeout_secs"),
                    message: String::from("Stabilization timeout must be positive"),
                });
            }
        }
    }
}

/// Flattens `validator` errors into field paths such as `resources[2].name`.
fn flatten_field_errors(prefix: &str, errors: &ValidationErrors, result: &mut ValidationResult) {
    let join = |field: &str| {
        if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{prefix}.{field}")
        }
    };

    for (field, kind) in errors.errors() {
        match kind {
            ValidationErrorsKind::Field(list) => {
                for error in list {
                    let message = error
                        .message
                        .as_ref()
                        .map_or_else(|| format!("invalid value ({})", error.code), ToString::to_string);
                    result.errors.push(ValidationError {
                        field: join(field),
                        message,
                    });
                }
            }
            ValidationErrorsKind::Struct(inner) => flatten_field_errors(&join(field), inner, result),
            ValidationErrorsKind::List(items) => {
                for (index, inner) in items {
                    flatten_field_errors(&format!("{}[{index}]", join(field)), inner, result);
                }
            }
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

/// Validates a resource type: at least two dot-separated segments, each a
/// lowercase identifier (`storage.bucket`, `api.method`).
fn is_valid_type(resource_type: &str) -> bool {
    let segments: Vec<&str> = resource_type.split('.').collect();
    segments.len() >= 2
        && segments.iter().all(|s| {
            s.chars().next().is_some_and(|c| c.is_ascii_lowercase())
                && s.chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        })
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigParser, STACK_TEMPLATE};

    fn parse(yaml: &str) -> StackConfig {
        ConfigParser::new().parse_yaml(yaml, None).unwrap()
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("analyzer"));
        assert!(is_valid_name("analyzer-role"));
        assert!(is_valid_name("a1"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Analyzer")); // uppercase
        assert!(!is_valid_name("1-bucket")); // starts with number
        assert!(!is_valid_name("my_bucket")); // underscore
        assert!(!is_valid_name("bucket-")); // ends with hyphen
        assert!(!is_valid_name("my--bucket")); // consecutive hyphens
    }

    #[test]
    fn test_resource_types() {
        assert!(is_valid_type("storage.bucket"));
        assert!(is_valid_type("api.rest_method"));
        assert!(!is_valid_type("bucket"));
        assert!(!is_valid_type("Storage.Bucket"));
        assert!(!is_valid_type("storage..bucket"));
    }

    #[test]
    fn test_template_is_valid() {
        let result = ConfigValidator::new().check(&parse(STACK_TEMPLATE));
        assert!(result.is_valid(), "{:?}", result.errors);
    }

    #[test]
    fn test_s3_backend_requires_bucket() {
        let config = parse(
            r"
stack: { name: demo }
state: { backend: s3 }
provider: { kind: memory }
",
        );
        let err = ConfigValidator::new().validate(&config).unwrap_err();
        assert!(matches!(
            err,
            StratumError::Config(ConfigError::ValidationError { field: Some(f), .. }) if f == "state.bucket"
        ));
    }

    #[test]
    fn test_field_rules_are_reported_with_paths() {
        let config = parse(
            r"
stack: { name: demo }
provider: { kind: memory }
execution: { parallelism: 0 }
resources:
  - name: ''
    type: storage.bucket
",
        );
        let result = ConfigValidator::new().check(&config);
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"execution.parallelism"), "{fields:?}");
        assert!(fields.contains(&"resources[0].name"), "{fields:?}");
    }

    #[test]
    fn test_http_provider_requires_endpoint() {
        let config = parse("stack: { name: demo }\n");
        let result = ConfigValidator::new().check(&config);
        assert!(result.errors.iter().any(|e| e.field == "provider.endpoint"));
        assert!(result.warnings.iter().any(|w| w.contains("No resources")));
    }
}

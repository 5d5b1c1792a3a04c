//! Error types for the Stratum provisioning engine.
//!
//! This module provides the error hierarchy for every stage of a
//! provisioning cycle: configuration, graph construction, planning,
//! provider calls, state management, and execution.
//!
//! Errors raised before the first remote call (`Config`, `Graph`, `Plan`,
//! most of `State`) abort the cycle. Provider errors abort only the action
//! that raised them and its dependents.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the Stratum engine.
#[derive(Debug, Error)]
pub enum StratumError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Malformed or cyclic resource declarations.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Unsafe transitions detected while planning.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Control-plane errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Execution errors.
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The stack file was not found.
    #[error("Stack file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The stack file could not be parsed.
    #[error("Failed to parse stack file: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Stack validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },
}

/// Errors raised while building the resource graph.
///
/// These are local: they never reach the control plane.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    /// Two declarations share a logical name.
    #[error("Duplicate resource name: {name}")]
    DuplicateResource {
        /// The duplicated name.
        name: String,
    },

    /// A declaration has an empty name.
    #[error("Resource #{index} has an empty name")]
    EmptyName {
        /// Position of the declaration.
        index: usize,
    },

    /// A declaration has an empty type.
    #[error("Resource '{name}' has an empty type")]
    EmptyType {
        /// Name of the resource.
        name: String,
    },

    /// A `${...}` expression could not be parsed.
    #[error("Invalid reference '{expression}' in {resource}.{property}: {reason}")]
    InvalidReference {
        /// Resource holding the property.
        resource: String,
        /// Property holding the expression.
        property: String,
        /// The offending expression.
        expression: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A reference or explicit dependency names an undeclared resource.
    #[error("Resource '{resource}' references undeclared resource '{target}' (via {via})")]
    UnresolvedReference {
        /// Resource holding the reference.
        resource: String,
        /// The missing target.
        target: String,
        /// Property name, or `depends_on`.
        via: String,
    },

    /// A resource references itself.
    #[error("Resource '{resource}' references itself")]
    SelfReference {
        /// The resource.
        resource: String,
    },

    /// The dependency relation contains a cycle.
    #[error("Dependency cycle detected: {cycle}")]
    Cycle {
        /// The cycle, rendered as `a -> b -> a`.
        cycle: String,
    },
}

/// Planning errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    /// A delete-before-create replacement would delete a resource that a
    /// surviving resource still references.
    #[error(
        "Replacing '{resource}' (delete before create) would orphan '{dependent}', which still references it; \
         use create_before_delete for this type or force '{dependent}' to be replaced as well"
    )]
    WouldOrphan {
        /// The resource being replaced.
        resource: String,
        /// The surviving dependent.
        dependent: String,
    },

    /// Action dependencies could not be ordered.
    #[error("Failed to order plan actions: {message}")]
    DependencyResolutionFailed {
        /// Description of the ordering issue.
        message: String,
    },
}

/// Category of a transient provider error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    /// The control plane throttled the request.
    RateLimited,
    /// The control plane is temporarily unavailable (5xx).
    Unavailable,
    /// The request did not reach the control plane.
    Network,
    /// The control plane has not yet observed a dependency (eventual consistency).
    Consistency,
}

/// Category of a fatal provider error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    /// Missing or rejected credentials.
    Authorization,
    /// The request was rejected as invalid.
    Validation,
    /// An account quota was exhausted.
    Quota,
    /// The resource reached a failed terminal state.
    Provisioning,
    /// The response could not be understood.
    InvalidResponse,
}

/// Control-plane errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Retryable error.
    #[error("{kind} (transient): {message}")]
    Transient {
        /// Category.
        kind: TransientKind,
        /// Message from the control plane.
        message: String,
        /// Server-requested delay before retrying, in seconds.
        retry_after_secs: Option<u64>,
    },

    /// Non-retryable error.
    #[error("{kind}: {message}")]
    Fatal {
        /// Category.
        kind: FatalKind,
        /// Message from the control plane.
        message: String,
    },

    /// The remote resource does not exist.
    #[error("{resource_type} '{id}' not found")]
    NotFound {
        /// Resource type.
        resource_type: String,
        /// Provider-assigned identifier.
        id: String,
    },

    /// The resource did not stabilize in time.
    #[error("Timed out after {waited_secs}s waiting for '{resource}' to become stable")]
    Timeout {
        /// Logical resource name.
        resource: String,
        /// Seconds waited.
        waited_secs: u64,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted. Never repaired automatically.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// A lock this process held expired or was taken over.
    #[error("State lock {lock_id} was lost: {reason}")]
    LockLost {
        /// Identifier of the lost lock.
        lock_id: String,
        /// What happened to it.
        reason: String,
    },

    /// State is locked by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since}, expires: {expires}); wait and retry")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
        /// When the lease runs out.
        expires: String,
    },

    /// Local storage error.
    #[error("State storage error: {message}")]
    Storage {
        /// Description of the storage error.
        message: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch. Never repaired automatically.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Execution errors.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// A reference could not be resolved from recorded outputs.
    #[error("Resource '{resource}' references '{reference}', which has no recorded value")]
    UnresolvedOutput {
        /// Resource being applied.
        resource: String,
        /// The `resource.attribute` reference.
        reference: String,
    },

    /// A resource lifecycle transition was not allowed.
    #[error("Invalid lifecycle transition for '{resource}': {from} -> {to}")]
    InvalidTransition {
        /// Resource name.
        resource: String,
        /// Current lifecycle state.
        from: String,
        /// Requested lifecycle state.
        to: String,
    },

    /// The run was aborted before execution started.
    #[error("Execution aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },
}

/// Result type alias for Stratum operations.
pub type Result<T> = std::result::Result<T, StratumError>;

/// Result type alias for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

impl StratumError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_transient(),
            Self::State(StateError::LockFailed { .. } | StateError::LockedByOther { .. }) => true,
            _ => false,
        }
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Provider(ProviderError::Transient {
                retry_after_secs: Some(secs),
                ..
            }) => Some(*secs),
            Self::Provider(ProviderError::Transient { .. }) => Some(5),
            Self::State(StateError::LockFailed { .. }) => Some(2),
            Self::State(StateError::LockedByOther { .. }) => Some(30),
            _ => None,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a local storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Returns true if this error means the persisted state cannot be trusted.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupted { .. } | Self::VersionMismatch { .. })
    }
}

impl ProviderError {
    /// Creates a transient error.
    #[must_use]
    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        Self::Transient {
            kind,
            message: message.into(),
            retry_after_secs: None,
        }
    }

    /// Creates a fatal error.
    #[must_use]
    pub fn fatal(kind: FatalKind, message: impl Into<String>) -> Self {
        Self::Fatal {
            kind,
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::transient(TransientKind::Network, message)
    }

    /// Returns true if the call may succeed when retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Returns true if the remote resource does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl std::fmt::Display for TransientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RateLimited => "rate limited",
            Self::Unavailable => "service unavailable",
            Self::Network => "network error",
            Self::Consistency => "eventual consistency lag",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for FatalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Authorization => "authorization failed",
            Self::Validation => "validation failed",
            Self::Quota => "quota exceeded",
            Self::Provisioning => "provisioning failed",
            Self::InvalidResponse => "invalid response",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_provider_errors_are_retryable() {
        let err = StratumError::from(ProviderError::Transient {
            kind: TransientKind::RateLimited,
            message: String::from("slow down"),
            retry_after_secs: Some(7),
        });
        assert!(err.is_retryable());
        assert_eq!(err.retry_delay_secs(), Some(7));
    }

    #[test]
    fn test_fatal_provider_errors_are_not_retryable() {
        let err = StratumError::from(ProviderError::fatal(FatalKind::Authorization, "bad token"));
        assert!(!err.is_retryable());
        assert_eq!(err.retry_delay_secs(), None);
    }

    #[test]
    fn test_corruption_classification() {
        assert!(StateError::corrupted("truncated").is_corruption());
        assert!(
            StateError::VersionMismatch {
                expected: String::from("1"),
                found: String::from("0"),
            }
            .is_corruption()
        );
        assert!(!StateError::storage("disk full").is_corruption());
    }
}

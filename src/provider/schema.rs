//! Type metadata: which properties force replacement and how to replace.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Default seconds to wait for a resource to become stable.
pub const DEFAULT_STABILIZE_TIMEOUT_SECS: u64 = 300;

/// Order in which a replacement is carried out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplacePolicy {
    /// Delete the old resource, then create the new one.
    #[default]
    DeleteBeforeCreate,
    /// Create the new resource, then delete the old one.
    CreateBeforeDelete,
}

impl fmt::Display for ReplacePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeleteBeforeCreate => write!(f, "delete before create"),
            Self::CreateBeforeDelete => write!(f, "create before delete"),
        }
    }
}

/// Metadata for one resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeSchema {
    /// Properties that cannot change in place.
    #[serde(default)]
    pub immutable: BTreeSet<String>,

    /// How a replacement is carried out.
    #[serde(default)]
    pub replace: ReplacePolicy,

    /// Output attributes the type publishes, informational.
    #[serde(default)]
    pub outputs: Vec<String>,

    /// Seconds to wait for the resource to become stable.
    #[serde(default = "default_stabilize_timeout")]
    pub stabilize_timeout_secs: u64,
}

const fn default_stabilize_timeout() -> u64 {
    DEFAULT_STABILIZE_TIMEOUT_SECS
}

impl Default for TypeSchema {
    fn default() -> Self {
        Self {
            immutable: BTreeSet::new(),
            replace: ReplacePolicy::default(),
            outputs: Vec::new(),
            stabilize_timeout_secs: DEFAULT_STABILIZE_TIMEOUT_SECS,
        }
    }
}

impl TypeSchema {
    /// Creates a schema with the given immutable properties and policy.
    #[must_use]
    pub fn new<I, S>(immutable: I, replace: ReplacePolicy) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            immutable: immutable.into_iter().map(Into::into).collect(),
            replace,
            ..Self::default()
        }
    }

    /// Returns true if changing `property` forces a replacement.
    #[must_use]
    pub fn is_immutable(&self, property: &str) -> bool {
        self.immutable.contains(property)
    }
}

/// Schemas keyed by resource type.
///
/// Unknown types fall back to the default schema: every property mutable,
/// delete-before-create replacement.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, TypeSchema>,
    fallback: TypeSchema,
}

impl SchemaRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a schema, builder style.
    #[must_use]
    pub fn with(mut self, resource_type: impl Into<String>, schema: TypeSchema) -> Self {
        self.insert(resource_type, schema);
        self
    }

    /// Registers or replaces a schema.
    pub fn insert(&mut self, resource_type: impl Into<String>, schema: TypeSchema) {
        self.schemas.insert(resource_type.into(), schema);
    }

    /// Overlays schemas, replacing existing entries of the same type.
    pub fn merge<I>(&mut self, overrides: I)
    where
        I: IntoIterator<Item = (String, TypeSchema)>,
    {
        self.schemas.extend(overrides);
    }

    /// Returns the schema for a type, or the fallback.
    #[must_use]
    pub fn get(&self, resource_type: &str) -> &TypeSchema {
        self.schemas.get(resource_type).unwrap_or(&self.fallback)
    }

    /// Returns true if a schema was registered for this type.
    #[must_use]
    pub fn contains(&self, resource_type: &str) -> bool {
        self.schemas.contains_key(resource_type)
    }

    /// Returns true if changing `property` of `resource_type` forces a replacement.
    #[must_use]
    pub fn is_immutable(&self, resource_type: &str, property: &str) -> bool {
        self.get(resource_type).is_immutable(property)
    }

    /// Returns the replacement policy of a type.
    #[must_use]
    pub fn policy(&self, resource_type: &str) -> ReplacePolicy {
        self.get(resource_type).replace
    }

    /// Number of registered types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    /// Returns true if no schema is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

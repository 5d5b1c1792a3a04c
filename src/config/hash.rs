//! Configuration hashing for change detection.
//!
//! This module provides deterministic hashing of declared resources so the
//! planner can tell "unchanged" apart from "changed" without a field-by-field
//! walk, and so the state can record what was applied.

use sha2::{Digest, Sha256};

use super::spec::StackConfig;
use crate::graph::{Properties, Resource};

/// Hasher for computing configuration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the whole stack.
    ///
    /// This hash changes when any part of the declared resources changes.
    #[must_use]
    pub fn hash_config(&self, config: &StackConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(config.stack.name.as_bytes());
        hasher.update([0]);
        hasher.update(config.stack.environment.as_bytes());
        hasher.update([0]);

        // Sorted by name for determinism
        let mut resources: Vec<_> = config.resources.iter().collect();
        resources.sort_by(|a, b| a.name.cmp(&b.name));
        for resource in resources {
            hasher.update(resource.name.as_bytes());
            hasher.update([0]);
            hasher.update(
                self.hash_properties(&resource.resource_type, &resource.properties)
                    .as_bytes(),
            );
            let mut deps: Vec<_> = resource.depends_on.iter().collect();
            deps.sort();
            for dep in deps {
                hasher.update(dep.as_bytes());
                hasher.update([0]);
            }
        }

        hex::encode(hasher.finalize())
    }

    /// Computes the change hash of a declared resource.
    ///
    /// Covers the type and the declared properties, references unresolved.
    /// Explicit dependencies only affect ordering and are left out.
    #[must_use]
    pub fn hash_resource(&self, resource: &Resource) -> String {
        self.hash_properties(&resource.resource_type, &resource.properties)
    }

    /// Computes the hash of a type and a property map.
    #[must_use]
    pub fn hash_properties(&self, resource_type: &str, properties: &Properties) -> String {
        let mut hasher = Sha256::new();
        hasher.update(resource_type.as_bytes());
        hasher.update([0]);

        // BTreeMap keys and serde_json objects serialize in sorted order.
        for (key, value) in properties {
            hasher.update(key.as_bytes());
            hasher.update([0]);
            hasher.update(value.to_string().as_bytes());
            hasher.update([0]);
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes to determine if they are equal.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        // Constant-time comparison
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: serde_json::Value) -> Properties {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_properties_hash_deterministic() {
        let hasher = ConfigHasher::new();
        let a = props(json!({ "partition_key": "imageUrl", "billing": { "mode": "on_demand", "class": "std" } }));
        let b = props(json!({ "billing": { "class": "std", "mode": "on_demand" }, "partition_key": "imageUrl" }));

        assert_eq!(
            hasher.hash_properties("nosql.table", &a),
            hasher.hash_properties("nosql.table", &b)
        );
    }

    #[test]
    fn test_type_and_values_change_hash() {
        let hasher = ConfigHasher::new();
        let a = props(json!({ "name": "x" }));
        let b = props(json!({ "name": "y" }));

        assert_ne!(
            hasher.hash_properties("storage.bucket", &a),
            hasher.hash_properties("storage.bucket", &b)
        );
        assert_ne!(
            hasher.hash_properties("storage.bucket", &a),
            hasher.hash_properties("nosql.table", &a)
        );
    }

    #[test]
    fn test_key_value_boundaries_are_unambiguous() {
        let hasher = ConfigHasher::new();
        let a = props(json!({ "ab": "c" }));
        let b = props(json!({ "a": "bc" }));
        assert_ne!(
            hasher.hash_properties("t.t", &a),
            hasher.hash_properties("t.t", &b)
        );
    }

    #[test]
    fn test_short_hash() {
        let hasher = ConfigHasher::new();
        let full_hash = "abcdef1234567890abcdef1234567890";
        let short = hasher.short_hash(full_hash);

        assert_eq!(short, "abcdef12");
        assert_eq!(short.len(), 8);
    }

    #[test]
    fn test_hashes_match() {
        assert!(ConfigHasher::hashes_match("abc123", "abc123"));
        assert!(!ConfigHasher::hashes_match("abc123", "abc124"));
        assert!(!ConfigHasher::hashes_match("abc123", "abc12"));
    }
}

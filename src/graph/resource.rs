//! Resources as nodes of the graph.

use super::value::{Properties, Reference, collect_references};
use crate::config::ResourceConfig;
use crate::error::GraphError;
use serde::Serialize;
use std::collections::BTreeSet;

/// A reference found in a top-level property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropertyReference {
    /// Top-level property holding the reference.
    pub property: String,
    /// The reference itself.
    pub reference: Reference,
}

/// A declared resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resource {
    /// Logical name, unique within a stack.
    pub name: String,
    /// Resource type, as understood by the provider.
    pub resource_type: String,
    /// Declared properties, references unresolved.
    pub properties: Properties,
    /// Dependencies declared with `depends_on`.
    pub explicit_dependencies: BTreeSet<String>,
    /// References found in the properties.
    pub references: Vec<PropertyReference>,
    /// Position in the declaration list.
    pub index: usize,
}

impl Resource {
    /// Builds a resource from its declaration, extracting references.
    ///
    /// # Errors
    ///
    /// Returns `GraphError` for empty names/types and malformed references.
    pub fn from_config(config: &ResourceConfig, index: usize) -> Result<Self, GraphError> {
        if config.name.trim().is_empty() {
            return Err(GraphError::EmptyName { index });
        }
        if config.resource_type.trim().is_empty() {
            return Err(GraphError::EmptyType {
                name: config.name.clone(),
            });
        }

        let mut references = Vec::new();
        for (property, value) in &config.properties {
            let found = collect_references(value).map_err(|e| GraphError::InvalidReference {
                resource: config.name.clone(),
                property: property.clone(),
                expression: e.expression,
                reason: e.reason,
            })?;
            references.extend(found.into_iter().map(|reference| PropertyReference {
                property: property.clone(),
                reference,
            }));
        }

        Ok(Self {
            name: config.name.clone(),
            resource_type: config.resource_type.clone(),
            properties: config.properties.clone(),
            explicit_dependencies: config.depends_on.iter().cloned().collect(),
            references,
            index,
        })
    }

    /// Returns the full dependency set: explicit dependencies plus referenced resources.
    #[must_use]
    pub fn dependencies(&self) -> BTreeSet<&str> {
        self.explicit_dependencies
            .iter()
            .map(String::as_str)
            .chain(self.references.iter().map(|r| r.reference.resource.as_str()))
            .collect()
    }

    /// Returns the top-level properties that reference `target`.
    pub fn properties_referencing<'a>(&'a self, target: &'a str) -> impl Iterator<Item = &'a str> {
        self.references
            .iter()
            .filter(move |r| r.reference.resource == target)
            .map(|r| r.property.as_str())
    }

    /// Returns true if any property references `target`.
    #[must_use]
    pub fn references_resource(&self, target: &str) -> bool {
        self.properties_referencing(target).next().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decl(name: &str, properties: serde_json::Value, depends_on: &[&str]) -> ResourceConfig {
        ResourceConfig {
            name: name.to_string(),
            resource_type: String::from("compute.function"),
            properties: serde_json::from_value(properties).unwrap(),
            depends_on: depends_on.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn test_dependencies_union_explicit_and_references() {
        let config = decl(
            "handler",
            json!({
                "role": "${role.arn}",
                "environment": { "TABLE_NAME": "${table.name}" }
            }),
            &["bucket"],
        );
        let resource = Resource::from_config(&config, 3).unwrap();

        let deps: Vec<_> = resource.dependencies().into_iter().collect();
        assert_eq!(deps, vec!["bucket", "role", "table"]);
        assert_eq!(resource.index, 3);
        assert!(resource.references_resource("table"));
        assert!(!resource.references_resource("bucket"));
        assert_eq!(
            resource.properties_referencing("table").collect::<Vec<_>>(),
            vec!["environment"]
        );
    }

    #[test]
    fn test_empty_name_rejected() {
        let config = decl("  ", json!({}), &[]);
        assert_eq!(
            Resource::from_config(&config, 0),
            Err(GraphError::EmptyName { index: 0 })
        );
    }

    #[test]
    fn test_malformed_reference_rejected() {
        let config = decl("handler", json!({ "role": "${role}" }), &[]);
        let err = Resource::from_config(&config, 0).unwrap_err();
        assert!(matches!(err, GraphError::InvalidReference { property, .. } if property == "role"));
    }

    #[test]
    fn test_serializes_with_references() {
        let config = decl("handler", json!({ "role": "${role.arn}" }), &[]);
        let resource = Resource::from_config(&config, 0).unwrap();

        let value = serde_json::to_value(&resource).unwrap();
        assert_eq!(
            value["references"],
            json!([{
                "property": "role",
                "reference": { "resource": "role", "attribute": "arn" }
            }])
        );
    }
}

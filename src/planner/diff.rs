//! Diff engine for comparing the desired graph against the applied state.
//!
//! Each desired resource is classified as create, update, replace or no
//! change; each applied resource missing from the stack becomes a delete.
//! Resources are visited in topological order so a change is known before
//! any resource that references it is examined.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::debug;

use crate::config::ConfigHasher;
use crate::graph::{Reference, Resource, ResourceGraph, resolve_value};
use crate::provider::{ReplacePolicy, SchemaRegistry};
use crate::state::{AppliedState, ResourceRecord};

/// Placeholder shown for values that only exist once a dependency is applied.
pub const KNOWN_AFTER_APPLY: &str = "(known after apply)";

/// Engine for computing diffs between desired and applied state.
#[derive(Debug, Default)]
pub struct DiffEngine {
    /// Configuration hasher.
    hasher: ConfigHasher,
}

/// Difference for a single resource.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceDiff {
    /// Resource name.
    pub name: String,
    /// Resource type (the desired one when both exist).
    pub resource_type: String,
    /// Type of difference.
    pub diff_type: DiffType,
    /// Details about the difference.
    pub details: Vec<DiffDetail>,
    /// Replacement policy, for replaces.
    pub replacement: Option<ReplacePolicy>,
    /// Provider identifier of the applied instance, if any.
    pub provider_id: Option<String>,
    /// True for a leftover instance from an interrupted replacement.
    pub deposed: bool,
    /// Previous hash (if applicable).
    pub old_hash: Option<String>,
    /// New hash (if applicable).
    pub new_hash: Option<String>,
}

/// Type of difference detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffType {
    /// Resource needs to be created.
    Create,
    /// Resource can be changed in place.
    Update,
    /// Resource must be deleted and created again.
    Replace,
    /// Resource needs to be deleted.
    Delete,
    /// Resource is unchanged.
    NoChange,
}

/// Detail about a specific difference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiffDetail {
    /// Property (or `type`) that differs.
    pub field: String,
    /// Old value.
    pub old_value: Option<Value>,
    /// New value.
    pub new_value: Option<Value>,
    /// True if this change cannot be applied in place.
    pub forces_replacement: bool,
}

/// Complete diff result.
#[derive(Debug, Serialize)]
pub struct DiffResult {
    /// All resource diffs: removed resources in delete order, deposed
    /// instances, then desired resources in topological order.
    pub diffs: Vec<ResourceDiff>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources to update.
    pub updates: usize,
    /// Number of resources to replace.
    pub replaces: usize,
    /// Number of resources (and deposed instances) to delete.
    pub deletes: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: ConfigHasher::new(),
        }
    }

    /// Computes the diff between the desired graph and the applied state.
    #[must_use]
    pub fn compute_diff(
        &self,
        desired: &ResourceGraph,
        previous: &AppliedState,
        schemas: &SchemaRegistry,
    ) -> DiffResult {
        let mut diffs = Vec::new();

        for name in previous.delete_order() {
            if desired.contains(name) {
                continue;
            }
            if let Some(record) = previous.get(name) {
                debug!("Resource {name} was removed from the stack");
                diffs.push(Self::removal(record));
            }
        }

        for deposed in &previous.deposed {
            debug!(
                "Deposed instance {} of {} is still pending deletion",
                deposed.provider_id, deposed.name
            );
            diffs.push(ResourceDiff {
                name: deposed.name.clone(),
                resource_type: deposed.resource_type.clone(),
                diff_type: DiffType::Delete,
                details: Vec::new(),
                replacement: None,
                provider_id: Some(deposed.provider_id.clone()),
                deposed: true,
                old_hash: None,
                new_hash: None,
            });
        }

        let mut changing: HashSet<&str> = HashSet::new();
        for resource in desired.traverse() {
            let new_hash = self.hasher.hash_resource(resource);
            let diff = match previous.get(&resource.name) {
                None => Self::creation(resource, new_hash),
                Some(record) => {
                    Self::change(resource, record, new_hash, previous, &changing, schemas)
                }
            };
            if diff.diff_type != DiffType::NoChange {
                changing.insert(resource.name.as_str());
            }
            diffs.push(diff);
        }

        let count = |t: DiffType| diffs.iter().filter(|d| d.diff_type == t).count();
        let creates = count(DiffType::Create);
        let updates = count(DiffType::Update);
        let replaces = count(DiffType::Replace);
        let deletes = count(DiffType::Delete);
        let unchanged = count(DiffType::NoChange);

        DiffResult {
            diffs,
            creates,
            updates,
            replaces,
            deletes,
            unchanged,
        }
    }

    fn removal(record: &ResourceRecord) -> ResourceDiff {
        ResourceDiff {
            name: record.name.clone(),
            resource_type: record.resource_type.clone(),
            diff_type: DiffType::Delete,
            details: Vec::new(),
            replacement: None,
            provider_id: Some(record.provider_id.clone()),
            deposed: false,
            old_hash: Some(record.config_hash.clone()),
            new_hash: None,
        }
    }

    fn creation(resource: &Resource, new_hash: String) -> ResourceDiff {
        debug!("Resource {} needs to be created", resource.name);
        ResourceDiff {
            name: resource.name.clone(),
            resource_type: resource.resource_type.clone(),
            diff_type: DiffType::Create,
            details: resource
                .properties
                .iter()
                .map(|(field, value)| DiffDetail {
                    field: field.clone(),
                    old_value: None,
                    new_value: Some(value.clone()),
                    forces_replacement: false,
                })
                .collect(),
            replacement: None,
            provider_id: None,
            deposed: false,
            old_hash: None,
            new_hash: Some(new_hash),
        }
    }

    /// Classifies a resource present in both the stack and the state.
    fn change(
        resource: &Resource,
        record: &ResourceRecord,
        new_hash: String,
        previous: &AppliedState,
        changing: &HashSet<&str>,
        schemas: &SchemaRegistry,
    ) -> ResourceDiff {
        let mut details = Vec::new();

        if record.resource_type == resource.resource_type {
            if !ConfigHasher::hashes_match(&record.config_hash, &new_hash) {
                details = Self::property_changes(resource, record, schemas);
            }
        } else {
            details.push(DiffDetail {
                field: String::from("type"),
                old_value: Some(Value::String(record.resource_type.clone())),
                new_value: Some(Value::String(resource.resource_type.clone())),
                forces_replacement: true,
            });
        }

        for (property, new_value) in Self::stale_references(resource, record, previous, changing) {
            if details.iter().any(|d| d.field == property) {
                continue;
            }
            details.push(DiffDetail {
                field: property.to_string(),
                old_value: record.applied_properties.get(property).cloned(),
                new_value: Some(new_value),
                forces_replacement: schemas.is_immutable(&resource.resource_type, property),
            });
        }

        let diff_type = if details.iter().any(|d| d.forces_replacement) {
            DiffType::Replace
        } else if details.is_empty() {
            DiffType::NoChange
        } else {
            DiffType::Update
        };
        debug!("Resource {}: {diff_type}", resource.name);

        ResourceDiff {
            name: resource.name.clone(),
            resource_type: resource.resource_type.clone(),
            diff_type,
            details,
            replacement: (diff_type == DiffType::Replace)
                .then(|| schemas.policy(&resource.resource_type)),
            provider_id: Some(record.provider_id.clone()),
            deposed: false,
            old_hash: Some(record.config_hash.clone()),
            new_hash: Some(new_hash),
        }
    }

    /// Properties whose referenced outputs no longer match what was applied.
    ///
    /// A reference to a resource that is itself changing is only known after
    /// apply. A reference to an unchanged resource is resolved against its
    /// recorded outputs and compared with the applied value, which catches
    /// dependents left behind by an earlier, interrupted run.
    fn stale_references<'r>(
        resource: &'r Resource,
        record: &ResourceRecord,
        previous: &AppliedState,
        changing: &HashSet<&str>,
    ) -> BTreeMap<&'r str, Value> {
        let mut stale = BTreeMap::new();
        for reference in &resource.references {
            if changing.contains(reference.reference.resource.as_str()) {
                stale.insert(
                    reference.property.as_str(),
                    Value::String(KNOWN_AFTER_APPLY.to_string()),
                );
            }
        }

        let lookup = |r: &Reference| {
            previous
                .get(&r.resource)
                .and_then(|dependency| dependency.outputs.get(&r.attribute))
                .cloned()
        };
        for reference in &resource.references {
            let property = reference.property.as_str();
            if stale.contains_key(property) {
                continue;
            }
            let Some(declared) = resource.properties.get(property) else {
                continue;
            };
            if let Ok(resolved) = resolve_value(declared, &lookup) {
                if record.applied_properties.get(property) != Some(&resolved) {
                    stale.insert(property, resolved);
                }
            }
        }
        stale
    }

    /// Compares declared properties key by key.
    fn property_changes(
        resource: &Resource,
        record: &ResourceRecord,
        schemas: &SchemaRegistry,
    ) -> Vec<DiffDetail> {
        let keys: BTreeSet<&String> = resource
            .properties
            .keys()
            .chain(record.properties.keys())
            .collect();

        keys.into_iter()
            .filter_map(|key| {
                let old = record.properties.get(key);
                let new = resource.properties.get(key);
                (old != new).then(|| DiffDetail {
                    field: key.clone(),
                    old_value: old.cloned(),
                    new_value: new.cloned(),
                    forces_replacement: schemas.is_immutable(&resource.resource_type, key),
                })
            })
            .collect()
    }
}

impl DiffResult {
    /// Returns true if there are any changes.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.total_changes() > 0
    }

    /// Returns the total number of changes.
    #[must_use]
    pub const fn total_changes(&self) -> usize {
        self.creates + self.updates + self.replaces + self.deletes
    }

    /// Filters to only diffs that require action.
    #[must_use]
    pub fn actionable_diffs(&self) -> Vec<&ResourceDiff> {
        self.diffs
            .iter()
            .filter(|d| d.diff_type != DiffType::NoChange)
            .collect()
    }

    /// Finds the live (non-deposed) diff of a resource.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResourceDiff> {
        self.diffs.iter().find(|d| d.name == name && !d.deposed)
    }
}

impl std::fmt::Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::NoChange => "no change",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ResourceDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.diff_type)?;
        if let Some(policy) = self.replacement {
            write!(f, " [{policy}]")?;
        }
        if self.diff_type != DiffType::Create && !self.details.is_empty() {
            write!(f, " (")?;
            for (i, detail) in self.details.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", detail.field)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceConfig;
    use crate::provider::{RemoteResource, TypeSchema};
    use serde_json::json;

    fn decl(name: &str, resource_type: &str, properties: Value) -> ResourceConfig {
        ResourceConfig {
            name: name.to_string(),
            resource_type: resource_type.to_string(),
            properties: serde_json::from_value(properties).unwrap(),
            depends_on: Vec::new(),
        }
    }

    fn schemas() -> SchemaRegistry {
        SchemaRegistry::new()
            .with(
                "nosql.table",
                TypeSchema::new(["partition_key"], ReplacePolicy::DeleteBeforeCreate),
            )
            .with(
                "compute.function",
                TypeSchema::new(["runtime"], ReplacePolicy::CreateBeforeDelete),
            )
    }

    /// Records every declared resource as applied.
    fn applied(graph: &ResourceGraph) -> AppliedState {
        let hasher = ConfigHasher::new();
        let mut state = AppliedState::new("test", "dev");
        for resource in graph.traverse() {
            let remote = RemoteResource {
                id: format!("{}-id", resource.name),
                properties: resource.properties.clone(),
                outputs: serde_json::from_value(json!({ "id": format!("{}-id", resource.name), "arn": "x" }))
                    .unwrap(),
            };
            state.insert(ResourceRecord::new(
                resource,
                resource.properties.clone(),
                &remote,
                &hasher.hash_resource(resource),
            ));
        }
        state
    }

    #[test]
    fn test_empty_state_creates_everything() {
        let graph = ResourceGraph::build(&[
            decl("fn", "compute.function", json!({ "table": "${table.name}" })),
            decl("table", "nosql.table", json!({ "partition_key": "id" })),
        ])
        .unwrap();

        let result = DiffEngine::new().compute_diff(
            &graph,
            &AppliedState::new("test", "dev"),
            &schemas(),
        );
        assert_eq!(result.creates, 2);
        let names: Vec<&str> = result.diffs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["table", "fn"]);
    }

    #[test]
    fn test_unchanged_stack_has_no_changes() {
        let decls = [decl("table", "nosql.table", json!({ "partition_key": "id" }))];
        let graph = ResourceGraph::build(&decls).unwrap();
        let state = applied(&graph);

        let result = DiffEngine::new().compute_diff(&graph, &state, &schemas());
        assert!(!result.has_changes());
        assert_eq!(result.unchanged, 1);
    }

    #[test]
    fn test_mutable_change_is_update() {
        let before = ResourceGraph::build(&[decl(
            "table",
            "nosql.table",
            json!({ "partition_key": "id", "billing": "provisioned" }),
        )])
        .unwrap();
        let state = applied(&before);
        let after = ResourceGraph::build(&[decl(
            "table",
            "nosql.table",
            json!({ "partition_key": "id", "billing": "on_demand" }),
        )])
        .unwrap();

        let result = DiffEngine::new().compute_diff(&after, &state, &schemas());
        let diff = result.get("table").unwrap();
        assert_eq!(diff.diff_type, DiffType::Update);
        assert_eq!(diff.details.len(), 1);
        assert_eq!(diff.details[0].field, "billing");
        assert!(!diff.details[0].forces_replacement);
    }

    #[test]
    fn test_immutable_change_is_replace() {
        let before =
            ResourceGraph::build(&[decl("table", "nosql.table", json!({ "partition_key": "id" }))])
                .unwrap();
        let state = applied(&before);
        let after =
            ResourceGraph::build(&[decl("table", "nosql.table", json!({ "partition_key": "url" }))])
                .unwrap();

        let result = DiffEngine::new().compute_diff(&after, &state, &schemas());
        let diff = result.get("table").unwrap();
        assert_eq!(diff.diff_type, DiffType::Replace);
        assert_eq!(diff.replacement, Some(ReplacePolicy::DeleteBeforeCreate));
        assert_eq!(result.updates, 0);
    }

    #[test]
    fn test_type_change_is_replace() {
        let before =
            ResourceGraph::build(&[decl("store", "storage.bucket", json!({}))]).unwrap();
        let state = applied(&before);
        let after = ResourceGraph::build(&[decl("store", "nosql.table", json!({}))]).unwrap();

        let result = DiffEngine::new().compute_diff(&after, &state, &schemas());
        let diff = result.get("store").unwrap();
        assert_eq!(diff.diff_type, DiffType::Replace);
        assert_eq!(diff.details[0].field, "type");
    }

    #[test]
    fn test_removed_resources_are_deleted_dependents_first() {
        let before = ResourceGraph::build(&[
            decl("table", "nosql.table", json!({ "partition_key": "id" })),
            decl("fn", "compute.function", json!({ "table": "${table.name}" })),
            decl("keep", "storage.bucket", json!({})),
        ])
        .unwrap();
        let state = applied(&before);
        let after = ResourceGraph::build(&[decl("keep", "storage.bucket", json!({}))]).unwrap();

        let result = DiffEngine::new().compute_diff(&after, &state, &schemas());
        let deletes: Vec<&str> = result
            .diffs
            .iter()
            .filter(|d| d.diff_type == DiffType::Delete)
            .map(|d| d.name.as_str())
            .collect();
        assert_eq!(deletes, vec!["fn", "table"]);
        assert_eq!(result.get("fn").unwrap().provider_id.as_deref(), Some("fn-id"));
    }

    #[test]
    fn test_replacement_propagates_to_referencing_resources() {
        let before = ResourceGraph::build(&[
            decl("table", "nosql.table", json!({ "partition_key": "id" })),
            decl("fn", "compute.function", json!({ "runtime": "py3", "env": "${table.name}" })),
            decl("pinned", "compute.function", json!({ "runtime": "${table.arn}" })),
            decl("api", "api.rest", json!({ "target": "${pinned.arn}" })),
        ])
        .unwrap();
        let state = applied(&before);
        let after = ResourceGraph::build(&[
            decl("table", "nosql.table", json!({ "partition_key": "url" })),
            decl("fn", "compute.function", json!({ "runtime": "py3", "env": "${table.name}" })),
            decl("pinned", "compute.function", json!({ "runtime": "${table.arn}" })),
            decl("api", "api.rest", json!({ "target": "${pinned.arn}" })),
        ])
        .unwrap();

        let result = DiffEngine::new().compute_diff(&after, &state, &schemas());

        // Mutable reference: updated in place with the new value.
        let function = result.get("fn").unwrap();
        assert_eq!(function.diff_type, DiffType::Update);
        assert_eq!(
            function.details[0].new_value,
            Some(Value::String(KNOWN_AFTER_APPLY.to_string()))
        );

        // Immutable reference: replaced, and the replacement propagates.
        let pinned = result.get("pinned").unwrap();
        assert_eq!(pinned.diff_type, DiffType::Replace);
        assert_eq!(pinned.replacement, Some(ReplacePolicy::CreateBeforeDelete));
        assert_eq!(result.get("api").unwrap().diff_type, DiffType::Update);
    }

    #[test]
    fn test_update_propagates_to_referencing_resources() {
        let before = ResourceGraph::build(&[
            decl("bucket", "storage.bucket", json!({ "name": "images" })),
            decl("fn", "compute.function", json!({ "bucket": "${bucket.name}" })),
        ])
        .unwrap();
        let state = applied(&before);
        let after = ResourceGraph::build(&[
            decl("bucket", "storage.bucket", json!({ "name": "photos" })),
            decl("fn", "compute.function", json!({ "bucket": "${bucket.name}" })),
        ])
        .unwrap();

        let result = DiffEngine::new().compute_diff(&after, &state, &schemas());
        assert_eq!(result.get("bucket").unwrap().diff_type, DiffType::Update);
        let function = result.get("fn").unwrap();
        assert_eq!(function.diff_type, DiffType::Update);
        assert_eq!(function.details[0].field, "bucket");
        assert_eq!(
            function.details[0].new_value,
            Some(Value::String(KNOWN_AFTER_APPLY.to_string()))
        );
    }

    #[test]
    fn test_reference_out_of_step_with_recorded_outputs_is_updated() {
        let graph = ResourceGraph::build(&[
            decl("bucket", "storage.bucket", json!({})),
            decl("fn", "compute.function", json!({ "bucket": "${bucket.arn}" })),
        ])
        .unwrap();
        let mut state = applied(&graph);
        state
            .resources
            .get_mut("fn")
            .unwrap()
            .applied_properties
            .insert(String::from("bucket"), json!("old-arn"));

        let result = DiffEngine::new().compute_diff(&graph, &state, &schemas());
        assert_eq!(result.get("bucket").unwrap().diff_type, DiffType::NoChange);
        let function = result.get("fn").unwrap();
        assert_eq!(function.diff_type, DiffType::Update);
        assert_eq!(function.details[0].old_value, Some(json!("old-arn")));
        assert_eq!(function.details[0].new_value, Some(json!("x")));

        // Once the applied value matches the outputs again, nothing is left to do.
        state
            .resources
            .get_mut("fn")
            .unwrap()
            .applied_properties
            .insert(String::from("bucket"), json!("x"));
        let result = DiffEngine::new().compute_diff(&graph, &state, &schemas());
        assert!(!result.has_changes());
    }

    #[test]
    fn test_deposed_instances_are_deleted() {
        let graph = ResourceGraph::build(&[decl("fn", "compute.function", json!({}))]).unwrap();
        let mut state = applied(&graph);
        state.deposed.push(crate::state::DeposedRecord {
            name: String::from("fn"),
            resource_type: String::from("compute.function"),
            provider_id: String::from("fn-old"),
            deposed_at: chrono::Utc::now(),
        });

        let result = DiffEngine::new().compute_diff(&graph, &state, &schemas());
        assert_eq!(result.deletes, 1);
        let deposed = result.diffs.iter().find(|d| d.deposed).unwrap();
        assert_eq!(deposed.provider_id.as_deref(), Some("fn-old"));
        assert_eq!(result.get("fn").unwrap().diff_type, DiffType::NoChange);
    }
}

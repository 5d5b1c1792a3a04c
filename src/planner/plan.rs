//! Plan types and construction.
//!
//! A plan is a list of actions in a dependency-respecting order. Each action
//! names the indices of earlier actions that must be applied first, so the
//! executor can run independent actions concurrently.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use tracing::debug;

use crate::error::PlanError;
use crate::graph::ResourceGraph;
use crate::provider::{ReplacePolicy, SchemaRegistry};
use crate::state::AppliedState;

use super::diff::{DiffResult, DiffType, ResourceDiff};

/// A complete plan.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Hash of the stack this plan is based on.
    pub config_hash: String,
    /// Planned actions in execution order.
    pub actions: Vec<PlannedAction>,
}

/// A single planned action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedAction {
    /// Action type.
    pub action_type: ActionType,
    /// Logical resource name.
    pub resource_name: String,
    /// Resource type.
    pub resource_type: String,
    /// Provider identifier of the instance acted on (updates and deletes).
    pub provider_id: Option<String>,
    /// Set when this action is one half of a replacement.
    pub replacement: Option<ReplacePolicy>,
    /// True when deleting a leftover instance from an interrupted replacement.
    pub deposed: bool,
    /// Reason for this action.
    pub reason: String,
    /// Hash recorded once the action is applied (creates and updates).
    pub new_hash: Option<String>,
    /// Dependencies (indices of earlier actions that must complete first).
    pub dependencies: Vec<usize>,
}

/// Types of actions in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Create a new remote object.
    Create,
    /// Change an existing remote object in place.
    Update,
    /// Delete a remote object.
    Delete,
}

/// Which side of a resource an action touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Side {
    /// The desired instance (create or update).
    New,
    /// The previously applied instance (delete).
    Old,
}

/// Per-resource classification used while wiring dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Removed,
    Update,
    Replace(ReplacePolicy),
}

impl Plan {
    /// Builds a plan from a diff.
    ///
    /// Replacements expand to `[Delete, Create]` (delete before create) or
    /// `[Create, Delete]` (create before delete). Creates and updates wait for
    /// the new side of every dependency; deletes wait for every resource that
    /// depended on the old instance.
    ///
    /// # Errors
    ///
    /// Returns `PlanError::WouldOrphan` when a delete-before-create
    /// replacement would delete a resource that a surviving resource still
    /// references, and `PlanError::DependencyResolutionFailed` when the
    /// action dependencies cannot be ordered.
    pub fn from_diff(
        diff: &DiffResult,
        desired: &ResourceGraph,
        previous: &AppliedState,
        schemas: &SchemaRegistry,
        config_hash: &str,
    ) -> Result<Self, PlanError> {
        let changes: HashMap<&str, Change> = diff
            .diffs
            .iter()
            .filter(|d| !d.deposed)
            .filter_map(|d| {
                let change = match d.diff_type {
                    DiffType::Delete => Change::Removed,
                    DiffType::Update => Change::Update,
                    DiffType::Replace => {
                        Change::Replace(d.replacement.unwrap_or_else(|| schemas.policy(&d.resource_type)))
                    }
                    DiffType::Create | DiffType::NoChange => return None,
                };
                Some((d.name.as_str(), change))
            })
            .collect();

        Self::check_orphans(&changes, desired, previous)?;

        let mut actions = Vec::new();
        let mut slots: HashMap<(&str, Side), usize> = HashMap::new();

        for resource_diff in &diff.diffs {
            let name = resource_diff.name.as_str();
            match resource_diff.diff_type {
                DiffType::NoChange => {}
                DiffType::Delete if resource_diff.deposed => {
                    actions.push(PlannedAction::delete(
                        resource_diff,
                        None,
                        format!(
                            "deposed instance {} left by an earlier replacement",
                            resource_diff.provider_id.as_deref().unwrap_or("?")
                        ),
                    ));
                }
                DiffType::Delete => {
                    slots.insert((name, Side::Old), actions.len());
                    actions.push(PlannedAction::delete(
                        resource_diff,
                        None,
                        String::from("removed from stack"),
                    ));
                }
                DiffType::Create => {
                    slots.insert((name, Side::New), actions.len());
                    actions.push(PlannedAction::create(
                        resource_diff,
                        None,
                        String::from("declared in stack"),
                    ));
                }
                DiffType::Update => {
                    slots.insert((name, Side::New), actions.len());
                    actions.push(PlannedAction::update(resource_diff));
                }
                DiffType::Replace => {
                    let policy = resource_diff
                        .replacement
                        .unwrap_or_else(|| schemas.policy(&resource_diff.resource_type));
                    let reason = format!("replace ({})", replace_cause(resource_diff));
                    let delete = PlannedAction::delete(resource_diff, Some(policy), reason.clone());
                    let create = PlannedAction::create(resource_diff, Some(policy), reason);
                    let (first, second) = match policy {
                        ReplacePolicy::DeleteBeforeCreate => ((Side::Old, delete), (Side::New, create)),
                        ReplacePolicy::CreateBeforeDelete => ((Side::New, create), (Side::Old, delete)),
                    };
                    for (side, action) in [first, second] {
                        slots.insert((name, side), actions.len());
                        actions.push(action);
                    }
                }
            }
        }

        // Wire dependencies between the generated actions.
        for (index, action) in actions.iter_mut().enumerate() {
            if action.deposed {
                continue;
            }
            let name = action.resource_name.as_str();
            let change = changes.get(name).copied();
            let mut deps = Vec::new();

            match action.action_type {
                ActionType::Create | ActionType::Update => {
                    for dep in desired.dependencies_of(name) {
                        if let Some(&i) = slots.get(&(dep, Side::New)) {
                            deps.push(i);
                        }
                    }
                    if change == Some(Change::Replace(ReplacePolicy::DeleteBeforeCreate))
                        && let Some(&i) = slots.get(&(name, Side::Old))
                    {
                        deps.push(i);
                    }
                }
                ActionType::Delete => {
                    let delete_first =
                        change == Some(Change::Replace(ReplacePolicy::DeleteBeforeCreate));
                    for dependent in previous.dependents_of(name) {
                        let wait_for = match changes.get(dependent) {
                            Some(Change::Removed | Change::Replace(ReplacePolicy::DeleteBeforeCreate)) => {
                                slots.get(&(dependent, Side::Old))
                            }
                            Some(Change::Replace(ReplacePolicy::CreateBeforeDelete)) if !delete_first => {
                                slots.get(&(dependent, Side::Old))
                            }
                            Some(Change::Update) if !delete_first => slots.get(&(dependent, Side::New)),
                            _ => None,
                        };
                        if let Some(&i) = wait_for {
                            deps.push(i);
                        }
                    }
                    if change == Some(Change::Replace(ReplacePolicy::CreateBeforeDelete))
                        && let Some(&i) = slots.get(&(name, Side::New))
                    {
                        deps.push(i);
                    }
                }
            }

            deps.retain(|&i| i != index);
            deps.sort_unstable();
            deps.dedup();
            action.dependencies = deps;
        }

        let actions = order_actions(actions)?;
        debug!("Plan has {} actions", actions.len());

        Ok(Self {
            created_at: Utc::now(),
            config_hash: config_hash.to_string(),
            actions,
        })
    }

    /// Builds a plan that deletes every applied resource, dependents first.
    ///
    /// # Errors
    ///
    /// Returns `PlanError::DependencyResolutionFailed` if the applied
    /// dependencies cannot be ordered.
    pub fn destroy(previous: &AppliedState, config_hash: &str) -> Result<Self, PlanError> {
        let mut actions = Vec::new();
        let mut slots: HashMap<&str, usize> = HashMap::new();

        for name in previous.delete_order() {
            let Some(record) = previous.get(name) else {
                continue;
            };
            slots.insert(name, actions.len());
            actions.push(PlannedAction {
                action_type: ActionType::Delete,
                resource_name: record.name.clone(),
                resource_type: record.resource_type.clone(),
                provider_id: Some(record.provider_id.clone()),
                replacement: None,
                deposed: false,
                reason: String::from("destroy"),
                new_hash: None,
                dependencies: Vec::new(),
            });
        }

        for action in &mut actions {
            let mut deps: Vec<usize> = previous
                .dependents_of(&action.resource_name)
                .into_iter()
                .filter_map(|d| slots.get(d).copied())
                .collect();
            deps.sort_unstable();
            action.dependencies = deps;
        }

        for deposed in &previous.deposed {
            actions.push(PlannedAction {
                action_type: ActionType::Delete,
                resource_name: deposed.name.clone(),
                resource_type: deposed.resource_type.clone(),
                provider_id: Some(deposed.provider_id.clone()),
                replacement: None,
                deposed: true,
                reason: String::from("destroy deposed instance"),
                new_hash: None,
                dependencies: Vec::new(),
            });
        }

        Ok(Self {
            created_at: Utc::now(),
            config_hash: config_hash.to_string(),
            actions: order_actions(actions)?,
        })
    }

    /// Creates an empty plan (no changes needed).
    #[must_use]
    pub fn empty(config_hash: &str) -> Self {
        Self {
            created_at: Utc::now(),
            config_hash: config_hash.to_string(),
            actions: vec![],
        }
    }

    /// Rejects delete-before-create replacements that would leave a
    /// surviving resource referencing a deleted one.
    fn check_orphans(
        changes: &HashMap<&str, Change>,
        desired: &ResourceGraph,
        previous: &AppliedState,
    ) -> Result<(), PlanError> {
        let mut replaced: Vec<&str> = changes
            .iter()
            .filter(|(_, c)| **c == Change::Replace(ReplacePolicy::DeleteBeforeCreate))
            .map(|(name, _)| *name)
            .collect();
        replaced.sort_by_key(|name| desired.declaration_index(name));

        for name in replaced {
            for dependent in previous.dependents_of(name) {
                let survives = !matches!(
                    changes.get(dependent),
                    Some(Change::Removed | Change::Replace(ReplacePolicy::DeleteBeforeCreate))
                );
                let references = desired
                    .get(dependent)
                    .is_some_and(|r| r.references_resource(name));
                if survives && references {
                    return Err(PlanError::WouldOrphan {
                        resource: name.to_string(),
                        dependent: dependent.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Returns true if the plan is empty (no changes).
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Returns the number of actions.
    #[must_use]
    pub const fn action_count(&self) -> usize {
        self.actions.len()
    }

    /// Returns the number of actions of a given type.
    #[must_use]
    pub fn count(&self, action_type: ActionType) -> usize {
        self.actions
            .iter()
            .filter(|a| a.action_type == action_type)
            .count()
    }

    /// Returns the number of create actions.
    #[must_use]
    pub fn create_count(&self) -> usize {
        self.count(ActionType::Create)
    }

    /// Returns the number of update actions.
    #[must_use]
    pub fn update_count(&self) -> usize {
        self.count(ActionType::Update)
    }

    /// Returns the number of delete actions.
    #[must_use]
    pub fn delete_count(&self) -> usize {
        self.count(ActionType::Delete)
    }

    /// Returns the number of resources being replaced.
    #[must_use]
    pub fn replace_count(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| a.replacement.is_some() && a.action_type == ActionType::Create)
            .count()
    }

    /// Returns actions that can be executed immediately (no dependencies).
    #[must_use]
    pub fn ready_actions(&self) -> Vec<&PlannedAction> {
        self.actions
            .iter()
            .filter(|a| a.dependencies.is_empty())
            .collect()
    }

    /// Gets actions that depend on a specific action index.
    #[must_use]
    pub fn dependent_actions(&self, action_idx: usize) -> Vec<(usize, &PlannedAction)> {
        self.actions
            .iter()
            .enumerate()
            .filter(|(_, a)| a.dependencies.contains(&action_idx))
            .collect()
    }
}

/// Names the properties that force a replacement.
fn replace_cause(diff: &ResourceDiff) -> String {
    let fields: Vec<&str> = diff
        .details
        .iter()
        .filter(|d| d.forces_replacement)
        .map(|d| d.field.as_str())
        .collect();
    if fields.is_empty() {
        String::from("replacement requested")
    } else {
        format!("{} cannot change in place", fields.join(", "))
    }
}

/// Reorders actions so every dependency precedes its dependent, keeping
/// generation order wherever dependencies allow.
fn order_actions(actions: Vec<PlannedAction>) -> Result<Vec<PlannedAction>, PlanError> {
    let n = actions.len();
    let mut remaining: Vec<usize> = actions.iter().map(|a| a.dependencies.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, action) in actions.iter().enumerate() {
        for &d in &action.dependencies {
            dependents[d].push(i);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = remaining
        .iter()
        .enumerate()
        .filter(|&(_, &r)| r == 0)
        .map(|(i, _)| Reverse(i))
        .collect();
    let mut order = Vec::with_capacity(n);
    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for &d in &dependents[i] {
            remaining[d] -= 1;
            if remaining[d] == 0 {
                ready.push(Reverse(d));
            }
        }
    }

    if order.len() != n {
        let stuck: Vec<String> = (0..n)
            .filter(|&i| remaining[i] > 0)
            .map(|i| actions[i].to_string())
            .collect();
        return Err(PlanError::DependencyResolutionFailed {
            message: format!("circular action dependencies between: {}", stuck.join("; ")),
        });
    }

    let mut position = vec![0usize; n];
    for (new_index, &old_index) in order.iter().enumerate() {
        position[old_index] = new_index;
    }

    let mut slots: Vec<Option<PlannedAction>> = actions.into_iter().map(Some).collect();
    let mut ordered = Vec::with_capacity(n);
    for old_index in order {
        if let Some(mut action) = slots[old_index].take() {
            action.dependencies = action.dependencies.iter().map(|&d| position[d]).collect();
            action.dependencies.sort_unstable();
            ordered.push(action);
        }
    }
    Ok(ordered)
}

impl PlannedAction {
    fn create(diff: &ResourceDiff, replacement: Option<ReplacePolicy>, reason: String) -> Self {
        Self {
            action_type: ActionType::Create,
            resource_name: diff.name.clone(),
            resource_type: diff.resource_type.clone(),
            provider_id: None,
            replacement,
            deposed: false,
            reason,
            new_hash: diff.new_hash.clone(),
            dependencies: Vec::new(),
        }
    }

    fn update(diff: &ResourceDiff) -> Self {
        let fields: Vec<&str> = diff.details.iter().map(|d| d.field.as_str()).collect();
        Self {
            action_type: ActionType::Update,
            resource_name: diff.name.clone(),
            resource_type: diff.resource_type.clone(),
            provider_id: diff.provider_id.clone(),
            replacement: None,
            deposed: false,
            reason: format!("update {}", fields.join(", ")),
            new_hash: diff.new_hash.clone(),
            dependencies: Vec::new(),
        }
    }

    fn delete(diff: &ResourceDiff, replacement: Option<ReplacePolicy>, reason: String) -> Self {
        Self {
            action_type: ActionType::Delete,
            resource_name: diff.name.clone(),
            resource_type: diff.resource_type.clone(),
            provider_id: diff.provider_id.clone(),
            replacement,
            deposed: diff.deposed,
            reason,
            new_hash: None,
            dependencies: Vec::new(),
        }
    }

    /// Returns a human-readable description of the action.
    #[must_use]
    pub fn description(&self) -> String {
        let verb = match (self.action_type, self.replacement, self.deposed) {
            (ActionType::Delete, _, true) => "Delete deposed",
            (ActionType::Create, Some(_), _) => "Create replacement",
            (ActionType::Delete, Some(_), _) => "Delete replaced",
            (ActionType::Create, None, _) => "Create",
            (ActionType::Update, _, _) => "Update",
            (ActionType::Delete, None, false) => "Delete",
        };
        format!("{verb} {} '{}'", self.resource_type, self.resource_name)
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.action_type, self.resource_name)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.actions.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Plan ({} actions):", self.actions.len())?;
        for (i, action) in self.actions.iter().enumerate() {
            write!(f, "  {i}. {action}")?;
            if !action.dependencies.is_empty() {
                let deps: Vec<String> = action.dependencies.iter().map(ToString::to_string).collect();
                write!(f, " after [{}]", deps.join(", "))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigHasher, ResourceConfig};
    use crate::planner::DiffEngine;
    use crate::provider::{RemoteResource, TypeSchema};
    use crate::state::ResourceRecord;
    use serde_json::{Value, json};

    fn decl(name: &str, resource_type: &str, properties: Value, depends_on: &[&str]) -> ResourceConfig {
        ResourceConfig {
            name: name.to_string(),
            resource_type: resource_type.to_string(),
            properties: serde_json::from_value(properties).unwrap(),
            depends_on: depends_on.iter().map(ToString::to_string).collect(),
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

    fn applied(graph: &ResourceGraph) -> AppliedState {
        let hasher = ConfigHasher::new();
        let mut state = AppliedState::new("test", "dev");
        for resource in graph.traverse() {
            let remote = RemoteResource {
                id: format!("{}-id", resource.name),
                properties: resource.properties.clone(),
                outputs: serde_json::from_value(json!({ "id": format!("{}-id", resource.name) }))
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

    fn plan(desired: &[ResourceConfig], previous: &AppliedState) -> Result<Plan, PlanError> {
        let graph = ResourceGraph::build(desired).unwrap();
        let diff = DiffEngine::new().compute_diff(&graph, previous, &schemas());
        Plan::from_diff(&diff, &graph, previous, &schemas(), "hash")
    }

    fn summary(plan: &Plan) -> Vec<String> {
        plan.actions
            .iter()
            .map(|a| format!("{} {}", a.action_type, a.resource_name))
            .collect()
    }

    fn assert_topologically_consistent(plan: &Plan) {
        for (i, action) in plan.actions.iter().enumerate() {
            assert!(
                action.dependencies.iter().all(|&d| d < i),
                "action {i} ({action}) depends on a later action"
            );
        }
    }

    #[test]
    fn test_first_apply_creates_each_resource_once_in_topological_order() {
        let decls = [
            decl("handler", "compute.function", json!({ "role": "${role.arn}" }), &[]),
            decl("role", "iam.role", json!({}), &[]),
            decl("bucket", "storage.bucket", json!({}), &[]),
            decl("post", "api.method", json!({ "target": "${handler.arn}" }), &["bucket"]),
        ];
        let plan = plan(&decls, &AppliedState::new("test", "dev")).unwrap();

        assert_eq!(
            summary(&plan),
            vec!["create role", "create handler", "create bucket", "create post"]
        );
        assert_eq!(plan.create_count(), 4);
        assert_eq!(plan.actions[1].dependencies, vec![0]);
        assert_eq!(plan.actions[3].dependencies, vec![1, 2]);
        assert_topologically_consistent(&plan);
    }

    #[test]
    fn test_unchanged_stack_plans_nothing() {
        let decls = [decl("role", "iam.role", json!({ "name": "r" }), &[])];
        let state = applied(&ResourceGraph::build(&decls).unwrap());
        assert!(plan(&decls, &state).unwrap().is_empty());
    }

    #[test]
    fn test_immutable_change_delete_before_create() {
        let before = [decl("table", "nosql.table", json!({ "partition_key": "id" }), &[])];
        let state = applied(&ResourceGraph::build(&before).unwrap());
        let after = [decl("table", "nosql.table", json!({ "partition_key": "url" }), &[])];

        let plan = plan(&after, &state).unwrap();
        assert_eq!(summary(&plan), vec!["delete table", "create table"]);
        assert_eq!(plan.actions[1].dependencies, vec![0]);
        assert_eq!(plan.actions[0].provider_id.as_deref(), Some("table-id"));
        assert!(plan.actions.iter().all(|a| a.replacement == Some(ReplacePolicy::DeleteBeforeCreate)));
        assert_eq!(plan.update_count(), 0);
        assert_eq!(plan.replace_count(), 1);
    }

    #[test]
    fn test_immutable_change_create_before_delete() {
        let before = [decl("fn", "compute.function", json!({ "runtime": "py3.11" }), &[])];
        let state = applied(&ResourceGraph::build(&before).unwrap());
        let after = [decl("fn", "compute.function", json!({ "runtime": "py3.12" }), &[])];

        let plan = plan(&after, &state).unwrap();
        assert_eq!(summary(&plan), vec!["create fn", "delete fn"]);
        assert_eq!(plan.actions[1].dependencies, vec![0]);
        assert_eq!(plan.update_count(), 0);
    }

    #[test]
    fn test_removed_resources_deleted_after_dependents() {
        let before = [
            decl("role", "iam.role", json!({}), &[]),
            decl("fn", "compute.function", json!({ "role": "${role.arn}" }), &[]),
            decl("api", "api.rest", json!({ "target": "${fn.arn}" }), &[]),
        ];
        let state = applied(&ResourceGraph::build(&before).unwrap());
        let after = [decl("role", "iam.role", json!({}), &[])];

        let plan = plan(&after, &state).unwrap();
        assert_eq!(summary(&plan), vec!["delete api", "delete fn"]);
        assert_eq!(plan.actions[1].dependencies, vec![0]);
    }

    #[test]
    fn test_delete_waits_for_dependent_update() {
        let before = [
            decl("old-role", "iam.role", json!({}), &[]),
            decl("fn", "compute.function", json!({ "role": "${old-role.arn}" }), &[]),
        ];
        let state = applied(&ResourceGraph::build(&before).unwrap());
        let after = [
            decl("new-role", "iam.role", json!({}), &[]),
            decl("fn", "compute.function", json!({ "role": "${new-role.arn}" }), &[]),
        ];

        let plan = plan(&after, &state).unwrap();
        assert_eq!(
            summary(&plan),
            vec!["create new-role", "update fn", "delete old-role"]
        );
        assert_eq!(plan.actions[1].dependencies, vec![0]);
        assert_eq!(plan.actions[2].dependencies, vec![1]);
        assert_topologically_consistent(&plan);
    }

    #[test]
    fn test_create_before_delete_propagates_to_dependents() {
        let before = [
            decl("fn", "compute.function", json!({ "runtime": "py3.11" }), &[]),
            decl("api", "api.rest", json!({ "target": "${fn.arn}" }), &[]),
        ];
        let state = applied(&ResourceGraph::build(&before).unwrap());
        let after = [
            decl("fn", "compute.function", json!({ "runtime": "py3.12" }), &[]),
            decl("api", "api.rest", json!({ "target": "${fn.arn}" }), &[]),
        ];

        let plan = plan(&after, &state).unwrap();
        assert_eq!(summary(&plan), vec!["create fn", "update api", "delete fn"]);
        assert_eq!(plan.actions[1].dependencies, vec![0]);
        assert_eq!(plan.actions[2].dependencies, vec![0, 1]);
    }

    #[test]
    fn test_delete_before_create_would_orphan_referencing_resource() {
        let before = [
            decl("table", "nosql.table", json!({ "partition_key": "id" }), &[]),
            decl("fn", "compute.function", json!({ "env": "${table.name}" }), &[]),
        ];
        let state = applied(&ResourceGraph::build(&before).unwrap());
        let after = [
            decl("table", "nosql.table", json!({ "partition_key": "url" }), &[]),
            decl("fn", "compute.function", json!({ "env": "${table.name}" }), &[]),
        ];

        let err = plan(&after, &state).unwrap_err();
        assert_eq!(
            err,
            PlanError::WouldOrphan {
                resource: String::from("table"),
                dependent: String::from("fn"),
            }
        );
    }

    #[test]
    fn test_delete_before_create_cascades_through_delete_first_dependents() {
        let before = [
            decl("table", "nosql.table", json!({ "partition_key": "id" }), &[]),
            decl("index", "nosql.table", json!({ "partition_key": "${table.name}" }), &[]),
        ];
        let state = applied(&ResourceGraph::build(&before).unwrap());
        let after = [
            decl("table", "nosql.table", json!({ "partition_key": "url" }), &[]),
            decl("index", "nosql.table", json!({ "partition_key": "${table.name}" }), &[]),
        ];

        let plan = plan(&after, &state).unwrap();
        assert_eq!(
            summary(&plan),
            vec!["delete index", "delete table", "create table", "create index"]
        );
        assert_topologically_consistent(&plan);
    }

    #[test]
    fn test_explicit_dependency_does_not_block_replacement() {
        let before = [
            decl("table", "nosql.table", json!({ "partition_key": "id" }), &[]),
            decl("fn", "compute.function", json!({ "memory": 128 }), &["table"]),
        ];
        let state = applied(&ResourceGraph::build(&before).unwrap());
        let after = [
            decl("table", "nosql.table", json!({ "partition_key": "url" }), &[]),
            decl("fn", "compute.function", json!({ "memory": 128 }), &["table"]),
        ];

        let plan = plan(&after, &state).unwrap();
        assert_eq!(summary(&plan), vec!["delete table", "create table"]);
    }

    #[test]
    fn test_destroy_deletes_dependents_first() {
        let decls = [
            decl("role", "iam.role", json!({}), &[]),
            decl("fn", "compute.function", json!({ "role": "${role.arn}" }), &[]),
            decl("bucket", "storage.bucket", json!({}), &[]),
        ];
        let state = applied(&ResourceGraph::build(&decls).unwrap());

        let plan = Plan::destroy(&state, "hash").unwrap();
        assert_eq!(plan.delete_count(), 3);
        let fn_pos = plan.actions.iter().position(|a| a.resource_name == "fn").unwrap();
        let role_pos = plan.actions.iter().position(|a| a.resource_name == "role").unwrap();
        assert!(fn_pos < role_pos);
        assert_eq!(plan.actions[role_pos].dependencies, vec![fn_pos]);
        assert_topologically_consistent(&plan);
    }
}

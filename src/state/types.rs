//! Persisted state types.
//!
//! The applied state is the record of what the last apply cycle actually
//! provisioned. It is read by the planner and written only from the
//! executor's result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use uuid::Uuid;

use crate::error::StateError;
use crate::graph::{Properties, Resource};
use crate::provider::RemoteResource;

/// Current version of the state format.
pub const STATE_VERSION: &str = "1";

/// Maximum number of history entries kept.
pub const MAX_HISTORY: usize = 100;

/// The last successfully applied graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppliedState {
    /// State format version.
    pub version: String,
    /// Stack name.
    pub stack: String,
    /// Environment name.
    pub environment: String,
    /// Incremented on every write.
    pub serial: u64,
    /// Identifier fixed at first write; distinguishes unrelated states.
    pub lineage: String,
    /// Applied resources by logical name.
    pub resources: BTreeMap<String, ResourceRecord>,
    /// Old halves of replacements whose delete did not complete.
    #[serde(default)]
    pub deposed: Vec<DeposedRecord>,
    /// Hash of the last applied stack.
    #[serde(default)]
    pub config_hash: Option<String>,
    /// When the state was last written.
    pub last_updated: DateTime<Utc>,
    /// Recent apply cycles.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// One applied resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceRecord {
    /// Logical name.
    pub name: String,
    /// Resource type.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Declared properties, references unresolved.
    pub properties: Properties,
    /// Properties as sent to the provider, references resolved.
    #[serde(default)]
    pub applied_properties: Properties,
    /// Provider-assigned identifier.
    pub provider_id: String,
    /// Output attributes.
    #[serde(default)]
    pub outputs: Properties,
    /// Logical names this resource depended on when applied.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Declaration position when applied.
    #[serde(default)]
    pub order: usize,
    /// Hash of the declared type and properties.
    pub config_hash: String,
    /// When the resource was created.
    pub created_at: DateTime<Utc>,
    /// When the resource was last changed.
    pub updated_at: DateTime<Utc>,
}

/// A remote object left behind by an interrupted replacement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeposedRecord {
    /// Logical name of the resource it used to back.
    pub name: String,
    /// Resource type.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Provider-assigned identifier.
    pub provider_id: String,
    /// When it was deposed.
    pub deposed_at: DateTime<Utc>,
}

/// A single entry in the apply history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    /// When the cycle finished.
    pub timestamp: DateTime<Utc>,
    /// Type of operation.
    pub operation: HistoryOperation,
    /// Stack hash at the time.
    pub config_hash: String,
    /// Actions that reached a stable state.
    pub applied: usize,
    /// Actions that failed.
    pub failed: usize,
    /// Actions never started.
    pub skipped: usize,
    /// Whether every action succeeded.
    pub success: bool,
    /// First error, if any.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of recorded operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOperation {
    /// Converge towards the stack file.
    Apply,
    /// Delete everything.
    Destroy,
}

impl AppliedState {
    /// Creates a new empty state with a fresh lineage.
    #[must_use]
    pub fn new(stack: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            stack: stack.to_string(),
            environment: environment.to_string(),
            serial: 0,
            lineage: Uuid::new_v4().to_string(),
            resources: BTreeMap::new(),
            deposed: Vec::new(),
            config_hash: None,
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Checks version and internal consistency.
    ///
    /// # Errors
    ///
    /// Returns `StateError::VersionMismatch` or `StateError::Corrupted`.
    pub fn validate(&self) -> std::result::Result<(), StateError> {
        if self.version != STATE_VERSION {
            return Err(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: self.version.clone(),
            });
        }

        if self.lineage.trim().is_empty() {
            return Err(StateError::corrupted("state has no lineage"));
        }

        for (key, record) in &self.resources {
            if key != &record.name {
                return Err(StateError::corrupted(format!(
                    "record stored under '{key}' is named '{}'",
                    record.name
                )));
            }
            if record.provider_id.trim().is_empty() {
                return Err(StateError::corrupted(format!(
                    "record '{key}' has no provider id"
                )));
            }
            if record.resource_type.trim().is_empty() {
                return Err(StateError::corrupted(format!("record '{key}' has no type")));
            }
        }

        Ok(())
    }

    /// Gets a record by logical name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResourceRecord> {
        self.resources.get(name)
    }

    /// Adds or replaces a record.
    pub fn insert(&mut self, record: ResourceRecord) {
        self.resources.insert(record.name.clone(), record);
    }

    /// Removes a record by logical name.
    pub fn remove(&mut self, name: &str) -> Option<ResourceRecord> {
        self.resources.remove(name)
    }

    /// Number of applied resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns true if nothing is applied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.deposed.is_empty()
    }

    /// Logical names of the records that depended on `name` when applied.
    #[must_use]
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        self.resources
            .values()
            .filter(|r| r.dependencies.iter().any(|d| d == name))
            .map(|r| r.name.as_str())
            .collect()
    }

    /// Logical names in the order they can be deleted: dependents first.
    ///
    /// This is the reverse of a topological order of the applied graph,
    /// with declaration order as tie-break. Records forming a cycle (which
    /// an applied graph never does) are appended in declaration order.
    #[must_use]
    pub fn delete_order(&self) -> Vec<&str> {
        let records: Vec<&ResourceRecord> = {
            let mut v: Vec<_> = self.resources.values().collect();
            v.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.name.cmp(&b.name)));
            v
        };
        let position: HashMap<&str, usize> = records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.name.as_str(), i))
            .collect();

        let mut remaining = vec![0usize; records.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); records.len()];
        for (i, record) in records.iter().enumerate() {
            for dep in &record.dependencies {
                if let Some(&j) = position.get(dep.as_str()) {
                    remaining[i] += 1;
                    dependents[j].push(i);
                }
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = remaining
            .iter()
            .enumerate()
            .filter(|&(_, &d)| d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();
        let mut topo = Vec::with_capacity(records.len());
        let mut placed = vec![false; records.len()];

        while let Some(Reverse(i)) = ready.pop() {
            topo.push(i);
            placed[i] = true;
            for &d in &dependents[i] {
                remaining[d] -= 1;
                if remaining[d] == 0 {
                    ready.push(Reverse(d));
                }
            }
        }
        topo.extend((0..records.len()).filter(|&i| !placed[i]));

        topo.into_iter().rev().map(|i| records[i].name.as_str()).collect()
    }

    /// Adds a history entry, keeping the most recent `MAX_HISTORY`.
    pub fn add_history(&mut self, entry: HistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            let excess = self.history.len() + 1 - MAX_HISTORY;
            self.history.drain(..excess);
        }
        self.history.push(entry);
    }

    /// Marks the state as about to be written.
    pub fn touch(&mut self) {
        self.serial += 1;
        self.last_updated = Utc::now();
    }
}

impl ResourceRecord {
    /// Creates a record for a freshly created resource.
    #[must_use]
    pub fn new(
        resource: &Resource,
        applied_properties: Properties,
        remote: &RemoteResource,
        config_hash: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: resource.name.clone(),
            resource_type: resource.resource_type.clone(),
            properties: resource.properties.clone(),
            applied_properties,
            provider_id: remote.id.clone(),
            outputs: remote.outputs.clone(),
            dependencies: resource.dependencies().into_iter().map(String::from).collect(),
            order: resource.index,
            config_hash: config_hash.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Applies an in-place update, keeping the creation time.
    pub fn apply_update(
        &mut self,
        resource: &Resource,
        applied_properties: Properties,
        remote: &RemoteResource,
        config_hash: &str,
    ) {
        self.properties.clone_from(&resource.properties);
        self.applied_properties = applied_properties;
        if !remote.id.is_empty() {
            self.provider_id.clone_from(&remote.id);
        }
        self.outputs.clone_from(&remote.outputs);
        self.dependencies = resource.dependencies().into_iter().map(String::from).collect();
        self.order = resource.index;
        self.config_hash = config_hash.to_string();
        self.updated_at = Utc::now();
    }
}

impl HistoryEntry {
    /// Creates a history entry from action counts.
    #[must_use]
    pub fn new(
        operation: HistoryOperation,
        config_hash: &str,
        applied: usize,
        failed: usize,
        skipped: usize,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            applied,
            failed,
            skipped,
            success: failed == 0 && skipped == 0,
            error,
        }
    }
}

impl std::fmt::Display for HistoryOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}

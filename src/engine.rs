//! Apply cycles.
//!
//! The engine ties the layers together: it builds the desired graph from a
//! stack, loads the applied state under the lock, plans, executes, and
//! writes the new state exactly once per cycle.

use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{ConfigHasher, StackConfig};
use crate::error::Result;
use crate::graph::ResourceGraph;
use crate::planner::{DiffEngine, DiffResult, ExecutionReport, ExecutorOptions, Plan, PlanExecutor};
use crate::provider::{Provider, SchemaRegistry};
use crate::state::{
    AppliedState, HistoryEntry, HistoryOperation, LeaseGuard, StateStore, generate_holder_id,
    with_lock,
};

/// Drives plan, apply, destroy and drift checks for one stack.
pub struct Engine<'a, S: StateStore + ?Sized> {
    config: &'a StackConfig,
    state_store: &'a S,
    provider: Arc<dyn Provider>,
    schemas: SchemaRegistry,
    hasher: ConfigHasher,
    diff_engine: DiffEngine,
    options: ExecutorOptions,
    abort: Option<watch::Receiver<bool>>,
    holder: String,
}

/// A computed plan and the diff it came from.
#[derive(Debug, Serialize)]
pub struct PlanOutcome {
    /// Per-resource differences.
    pub diff: DiffResult,
    /// Ordered actions.
    pub plan: Plan,
}

/// How an apply or destroy cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStatus {
    /// Nothing to do.
    NoChanges,
    /// The plan was not approved; nothing was executed.
    Declined,
    /// Every action was applied.
    Completed,
    /// At least one action failed or was skipped.
    Partial,
}

/// Result of an apply or destroy cycle.
#[derive(Debug, Serialize)]
pub struct ApplyOutcome {
    /// How the cycle ended.
    pub status: ApplyStatus,
    /// The plan that was (or would have been) executed.
    pub plan: Plan,
    /// Execution report, when anything was executed.
    pub report: Option<ExecutionReport>,
}

/// Kind of drift found on one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriftKind {
    /// The provider no longer knows the resource.
    Missing,
    /// Properties differ from what was last applied.
    Changed {
        /// Differing property names.
        fields: Vec<String>,
    },
}

/// Drift on one applied resource.
#[derive(Debug, Clone, Serialize)]
pub struct DriftEntry {
    /// Logical name.
    pub name: String,
    /// Resource type.
    pub resource_type: String,
    /// Provider identifier.
    pub provider_id: String,
    /// What drifted.
    #[serde(flatten)]
    pub kind: DriftKind,
}

/// Report of drift detection.
#[derive(Debug, Serialize)]
pub struct DriftReport {
    /// Resources that have drifted.
    pub drifted: Vec<DriftEntry>,
    /// Number of applied resources checked.
    pub checked: usize,
    /// Declared resources that were never applied.
    pub unapplied: Vec<String>,
}

impl<'a, S: StateStore + ?Sized> Engine<'a, S> {
    /// Creates an engine.
    ///
    /// Type metadata comes from the provider, overlaid with the stack's
    /// `types` section.
    #[must_use]
    pub fn new(config: &'a StackConfig, state_store: &'a S, provider: Arc<dyn Provider>) -> Self {
        let mut schemas = provider.schemas();
        schemas.merge(config.types.clone());
        Self {
            config,
            state_store,
            provider,
            schemas,
            hasher: ConfigHasher::new(),
            diff_engine: DiffEngine::new(),
            options: ExecutorOptions::from(&config.execution),
            abort: None,
            holder: generate_holder_id(),
        }
    }

    /// Overrides the number of actions in flight.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.options.parallelism = parallelism.max(1);
        self
    }

    /// Overrides the executor options.
    #[must_use]
    pub const fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the abort signal passed to the executor.
    #[must_use]
    pub fn with_abort(mut self, abort: watch::Receiver<bool>) -> Self {
        self.abort = Some(abort);
        self
    }

    /// Sets the lock holder id.
    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// Type metadata in effect.
    #[must_use]
    pub const fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    /// Builds the desired graph.
    ///
    /// # Errors
    ///
    /// Returns a graph error for duplicates, bad references or cycles.
    pub fn graph(&self) -> Result<ResourceGraph> {
        Ok(ResourceGraph::build(&self.config.resources)?)
    }

    /// Loads the applied state, or an empty one on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read or is corrupted.
    pub async fn load_state(&self) -> Result<AppliedState> {
        let state = self.state_store.load().await?;
        Ok(state.unwrap_or_else(|| {
            AppliedState::new(&self.config.stack.name, &self.config.stack.environment)
        }))
    }

    fn compute_plan(&self, graph: &ResourceGraph, state: &AppliedState) -> Result<PlanOutcome> {
        let diff = self.diff_engine.compute_diff(graph, state, &self.schemas);
        info!(
            "Diff: {} creates, {} updates, {} replaces, {} deletes, {} unchanged",
            diff.creates, diff.updates, diff.replaces, diff.deletes, diff.unchanged
        );
        let config_hash = self.hasher.hash_config(self.config);
        let plan = Plan::from_diff(&diff, graph, state, &self.schemas, &config_hash)?;
        Ok(PlanOutcome { diff, plan })
    }

    /// Computes a plan without changing anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph is invalid, the state cannot be read,
    /// or the plan cannot be ordered.
    pub async fn plan(&self) -> Result<PlanOutcome> {
        info!(
            "Planning {}/{}",
            self.config.stack.name, self.config.stack.environment
        );
        let graph = self.graph()?;
        let state = self.load_state().await?;
        self.compute_plan(&graph, &state)
    }

    /// Runs one apply cycle under the state lock.
    ///
    /// `approve` sees the plan before anything runs; resolving to `false`
    /// ends the cycle without touching the provider or the state. The lease
    /// keeps being renewed while it is pending.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid input, lock contention, or a failure to
    /// read or write state. Provider failures are reported per action in the
    /// outcome instead.
    pub async fn apply<F, A>(&self, approve: F) -> Result<ApplyOutcome>
    where
        F: FnOnce(&PlanOutcome) -> A,
        A: Future<Output = bool>,
    {
        info!(
            "Applying {}/{}",
            self.config.stack.name, self.config.stack.environment
        );
        // Invalid declarations fail before the lock is taken.
        let graph = self.graph()?;

        with_lock(self.state_store, &self.holder, |lease| async move {
            let previous = self.load_state().await?;
            let outcome = self.compute_plan(&graph, &previous)?;

            if outcome.plan.is_empty() {
                info!("No changes required");
                return Ok(ApplyOutcome {
                    status: ApplyStatus::NoChanges,
                    plan: outcome.plan,
                    report: None,
                });
            }
            if !approve(&outcome).await {
                info!("Plan not approved; nothing applied");
                return Ok(ApplyOutcome {
                    status: ApplyStatus::Declined,
                    plan: outcome.plan,
                    report: None,
                });
            }

            let report = self.execute(&outcome.plan, &graph, &previous).await;
            self.commit(&lease, HistoryOperation::Apply, &outcome.plan, &report)
                .await?;
            Ok(finished(outcome.plan, report))
        })
        .await
    }

    /// Deletes every applied resource under the state lock.
    ///
    /// # Errors
    ///
    /// Returns an error for lock contention or a failure to read or write
    /// state.
    pub async fn destroy<F, A>(&self, approve: F) -> Result<ApplyOutcome>
    where
        F: FnOnce(&Plan) -> A,
        A: Future<Output = bool>,
    {
        info!(
            "Destroying {}/{}",
            self.config.stack.name, self.config.stack.environment
        );

        with_lock(self.state_store, &self.holder, |lease| async move {
            let previous = self.load_state().await?;
            let config_hash = self.hasher.hash_config(self.config);
            let plan = Plan::destroy(&previous, &config_hash)?;

            if plan.is_empty() {
                info!("Nothing to destroy");
                return Ok(ApplyOutcome {
                    status: ApplyStatus::NoChanges,
                    plan,
                    report: None,
                });
            }
            if !approve(&plan).await {
                info!("Destroy not approved; nothing deleted");
                return Ok(ApplyOutcome {
                    status: ApplyStatus::Declined,
                    plan,
                    report: None,
                });
            }

            let report = self
                .execute(&plan, &ResourceGraph::empty(), &previous)
                .await;
            self.commit(&lease, HistoryOperation::Destroy, &plan, &report)
                .await?;
            Ok(finished(plan, report))
        })
        .await
    }

    async fn execute(
        &self,
        plan: &Plan,
        desired: &ResourceGraph,
        previous: &AppliedState,
    ) -> ExecutionReport {
        let mut executor = PlanExecutor::new(Arc::clone(&self.provider), self.schemas.clone())
            .with_options(self.options);
        if let Some(abort) = &self.abort {
            executor = executor.with_abort(abort.clone());
        }
        executor.execute(plan, desired, previous).await
    }

    /// Stamps and writes the state produced by a run, provided the lock
    /// is still held.
    async fn commit(
        &self,
        lease: &LeaseGuard,
        operation: HistoryOperation,
        plan: &Plan,
        report: &ExecutionReport,
    ) -> Result<()> {
        // The report keeps its copy for callers; the store gets this one.
        let mut state = report.state.clone();
        state.config_hash = Some(plan.config_hash.clone());
        state.touch();
        state.add_history(HistoryEntry::new(
            operation,
            &plan.config_hash,
            report.applied_count(),
            report.failed_count(),
            report.skipped_count(),
            report.first_error(),
        ));

        lease.ensure_held()?;
        self.state_store.save(&state).await?;
        debug!("State saved at serial {}", state.serial);
        Ok(())
    }

    /// Reads every applied resource back from the provider and reports the
    /// ones that are gone or whose properties changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read or a provider read fails.
    pub async fn check_drift(&self) -> Result<DriftReport> {
        info!(
            "Checking for drift in {}/{}",
            self.config.stack.name, self.config.stack.environment
        );
        let state = self.load_state().await?;
        let mut drifted = Vec::new();

        for record in state.resources.values() {
            let remote = self
                .provider
                .read(&record.resource_type, &record.provider_id)
                .await?;

            let kind = match remote {
                None => Some(DriftKind::Missing),
                Some(remote) => {
                    let fields: Vec<String> = record
                        .applied_properties
                        .keys()
                        .chain(remote.properties.keys())
                        .filter(|key| record.applied_properties.get(*key) != remote.properties.get(*key))
                        .cloned()
                        .collect::<BTreeSet<_>>()
                        .into_iter()
                        .collect();
                    (!fields.is_empty()).then_some(DriftKind::Changed { fields })
                }
            };

            if let Some(kind) = kind {
                warn!("Drift on '{}': {kind}", record.name);
                drifted.push(DriftEntry {
                    name: record.name.clone(),
                    resource_type: record.resource_type.clone(),
                    provider_id: record.provider_id.clone(),
                    kind,
                });
            }
        }

        let unapplied = self
            .config
            .resources
            .iter()
            .filter(|r| state.get(&r.name).is_none())
            .map(|r| r.name.clone())
            .collect();

        Ok(DriftReport {
            drifted,
            checked: state.len(),
            unapplied,
        })
    }
}

fn finished(plan: Plan, report: ExecutionReport) -> ApplyOutcome {
    let status = if report.is_success() {
        ApplyStatus::Completed
    } else {
        ApplyStatus::Partial
    };
    ApplyOutcome {
        status,
        plan,
        report: Some(report),
    }
}

impl ApplyOutcome {
    /// Returns true unless an action failed or was skipped.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        !matches!(self.status, ApplyStatus::Partial)
    }
}

impl DriftReport {
    /// Returns true if nothing drifted.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.drifted.is_empty()
    }
}

impl std::fmt::Display for DriftKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing => write!(f, "missing"),
            Self::Changed { fields } => write!(f, "changed ({})", fields.join(", ")),
        }
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.drifted.is_empty() {
            write!(f, "No drift detected across {} resources", self.checked)?;
        } else {
            writeln!(f, "Drift detected:")?;
            for entry in &self.drifted {
                writeln!(f, "  - {} ({}): {}", entry.name, entry.resource_type, entry.kind)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::error::{StateError, StratumError};
    use crate::provider::MemoryProvider;
    use crate::state::{LockInfo, MockStateStore};
    use mockall::predicate::eq;

    const STACK: &str = r"
stack: { name: demo, environment: test }
execution: { base_delay_ms: 1, max_delay_ms: 10, poll_interval_ms: 1 }
resources:
  - name: role
    type: iam.role
    properties: { assumed_by: lambda }
  - name: handler
    type: compute.function
    properties: { role: '${role.arn}' }
";

    fn stack() -> StackConfig {
        ConfigParser::new().parse_yaml(STACK, None).unwrap()
    }

    fn locking_store() -> MockStateStore {
        let mut store = MockStateStore::new();
        store.expect_acquire_lock().returning(|holder| {
            let mut lock = LockInfo::new(holder);
            lock.lock_id = String::from("lock-1");
            Ok(lock)
        });
        store
            .expect_release_lock()
            .with(eq("lock-1"))
            .times(1)
            .returning(|_| Ok(()));
        store
    }

    #[tokio::test]
    async fn test_lock_released_when_save_fails() {
        let config = stack();
        let mut store = locking_store();
        store.expect_load().returning(|| Ok(None));
        store
            .expect_save()
            .times(1)
            .returning(|_| Err(StateError::storage("disk full").into()));

        let provider: Arc<dyn Provider> = Arc::new(MemoryProvider::new());
        let engine = Engine::new(&config, &store, provider);
        let err = engine.apply(|_| async { true }).await.unwrap_err();

        assert!(matches!(err, StratumError::State(StateError::Storage { .. })));
    }

    #[tokio::test]
    async fn test_declined_plan_does_not_touch_provider_or_state() {
        let config = stack();
        let mut store = locking_store();
        store.expect_load().returning(|| Ok(None));
        store.expect_save().never();

        let memory = Arc::new(MemoryProvider::new());
        let provider: Arc<dyn Provider> = memory.clone();
        let outcome = Engine::new(&config, &store, provider)
            .apply(|outcome| {
                assert_eq!(outcome.plan.create_count(), 2);
                async { false }
            })
            .await
            .unwrap();

        assert_eq!(outcome.status, ApplyStatus::Declined);
        assert!(memory.resource_names().is_empty());
    }

    #[tokio::test]
    async fn test_cycle_is_rejected_before_locking() {
        let yaml = r"
stack: { name: demo, environment: test }
resources:
  - { name: a, type: t, properties: { x: '${b.id}' } }
  - { name: b, type: t, properties: { x: '${a.id}' } }
";
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        let mut store = MockStateStore::new();
        store.expect_acquire_lock().never();

        let provider: Arc<dyn Provider> = Arc::new(MemoryProvider::new());
        let err = Engine::new(&config, &store, provider)
            .apply(|_| async { true })
            .await
            .unwrap_err();
        assert!(matches!(err, StratumError::Graph(_)));
    }

    #[tokio::test]
    async fn test_apply_saves_once_with_history() {
        let config = stack();
        let mut store = locking_store();
        store.expect_load().returning(|| Ok(None));
        store
            .expect_save()
            .times(1)
            .withf(|state: &AppliedState| {
                state.len() == 2
                    && state.serial == 1
                    && state.history.len() == 1
                    && state.history[0].success
                    && state.config_hash.is_some()
            })
            .returning(|_| Ok(()));

        let provider: Arc<dyn Provider> = Arc::new(MemoryProvider::new());
        let outcome = Engine::new(&config, &store, provider)
            .apply(|_| async { true })
            .await
            .unwrap();
        assert_eq!(outcome.status, ApplyStatus::Completed);
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_drift_reports_missing_and_changed() {
        let config = stack();
        let dir = tempfile::TempDir::new().unwrap();
        let store = crate::state::LocalStateStore::with_base_dir(dir.path());
        let memory = Arc::new(MemoryProvider::new());
        let provider: Arc<dyn Provider> = memory.clone();
        let engine = Engine::new(&config, &store, provider);

        engine.apply(|_| async { true }).await.unwrap();
        assert!(engine.check_drift().await.unwrap().is_converged());

        memory.forget("role");
        memory.tamper("handler", "role", serde_json::json!("arn:other"));
        let report = engine.check_drift().await.unwrap();

        assert_eq!(report.checked, 2);
        assert_eq!(report.drifted.len(), 2);
        let kinds: Vec<_> = report.drifted.iter().map(|d| (d.name.as_str(), d.kind.clone())).collect();
        assert!(kinds.contains(&("role", DriftKind::Missing)));
        assert!(kinds.contains(&(
            "handler",
            DriftKind::Changed {
                fields: vec![String::from("role")]
            }
        )));
    }

    #[tokio::test]
    async fn test_expired_lease_refuses_save() {
        let config = stack();
        let mut store = MockStateStore::new();
        store.expect_acquire_lock().returning(|holder| {
            let mut lock = LockInfo::new(holder);
            lock.lock_id = String::from("lock-1");
            lock.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
            Ok(lock)
        });
        store.expect_release_lock().times(1).returning(|_| Ok(()));
        store.expect_load().returning(|| Ok(None));
        store.expect_save().never();

        let provider: Arc<dyn Provider> = Arc::new(MemoryProvider::new());
        let err = Engine::new(&config, &store, provider)
            .apply(|_| async { true })
            .await
            .unwrap_err();
        assert!(matches!(err, StratumError::State(StateError::LockLost { .. })));
    }
}

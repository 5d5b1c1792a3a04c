//! Plan executor.
//!
//! A single coordinating loop owns every piece of bookkeeping: outcomes,
//! recorded outputs and the new applied state. Provider calls run as tasks
//! in a `JoinSet` and only hand results back. An action starts once every
//! action it depends on has been applied; a failed action skips everything
//! downstream of it while independent branches carry on.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ExecutionConfig;
use crate::error::{ExecutionError, FatalKind, ProviderError, ProviderResult};
use crate::graph::{Properties, Reference, ResourceGraph, resolve_properties};
use crate::provider::{
    ID_OUTPUT, PollBackoff, Provider, RemoteResource, RemoteStatus, ReplacePolicy, ResourceRequest,
    RetryPolicy, SchemaRegistry,
};
use crate::state::{AppliedState, DeposedRecord, Lifecycle, ResourceRecord};

use super::plan::{ActionType, Plan, PlannedAction};

/// Default number of actions in flight.
pub const DEFAULT_PARALLELISM: usize = 4;

/// Longest interval between two status polls.
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Tuning for a run.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorOptions {
    /// Maximum number of actions in flight.
    pub parallelism: usize,
    /// Retry policy for provider calls.
    pub retry: RetryPolicy,
    /// First interval between status polls.
    pub poll_interval: Duration,
    /// Cap on the poll interval.
    pub max_poll_interval: Duration,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_PARALLELISM,
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_secs(1),
            max_poll_interval: MAX_POLL_INTERVAL,
        }
    }
}

impl From<&ExecutionConfig> for ExecutorOptions {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            parallelism: config.parallelism.max(1),
            retry: RetryPolicy {
                max_attempts: config.max_attempts,
                base_delay: Duration::from_millis(config.base_delay_ms),
                max_delay: Duration::from_millis(config.max_delay_ms),
                ..RetryPolicy::default()
            },
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_poll_interval: MAX_POLL_INTERVAL.max(Duration::from_millis(config.poll_interval_ms)),
        }
    }
}

/// Executor for plans.
pub struct PlanExecutor {
    provider: Arc<dyn Provider>,
    schemas: SchemaRegistry,
    options: ExecutorOptions,
    abort: Option<watch::Receiver<bool>>,
}

/// How an action ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// Reached a stable state.
    Applied,
    /// Started and failed.
    Failed(String),
    /// Never started.
    Skipped(String),
}

/// Result of a single action.
#[derive(Debug, Clone, Serialize)]
pub struct ActionOutcome {
    /// Index of the action in the plan.
    pub index: usize,
    /// Action type.
    pub action_type: ActionType,
    /// Logical resource name.
    pub resource_name: String,
    /// Resource type.
    pub resource_type: String,
    /// Set for either half of a replacement.
    pub replacement: Option<ReplacePolicy>,
    /// How the action ended.
    #[serde(flatten)]
    pub status: OutcomeStatus,
    /// Provider identifier of the instance created or acted on.
    pub provider_id: Option<String>,
    /// Provider calls made, retries included.
    pub attempts: u32,
    /// Wall time spent, polling included.
    pub duration_ms: u64,
}

/// Result of executing a plan.
#[derive(Debug, Serialize)]
pub struct ExecutionReport {
    /// One outcome per planned action, in plan order.
    pub outcomes: Vec<ActionOutcome>,
    /// Final lifecycle of every resource touched or known.
    pub lifecycles: BTreeMap<String, Lifecycle>,
    /// Applied state after this run: the previous state plus exactly the
    /// actions that reached a stable state.
    #[serde(skip)]
    pub state: AppliedState,
    /// Wall time of the run.
    pub duration_ms: u64,
}

/// Provider work for one action, detached from the plan so it can be spawned.
enum Work {
    Create(ResourceRequest),
    Update { id: String, request: ResourceRequest },
    Delete { resource_type: String, id: String },
}

/// Per-action tuning handed to a spawned task.
struct TaskSettings {
    description: String,
    retry: RetryPolicy,
    poll: PollBackoff,
    timeout: Duration,
}

/// What a spawned action hands back.
struct Finished {
    index: usize,
    result: ProviderResult<Option<RemoteResource>>,
    attempts: u32,
    elapsed: Duration,
}

impl PlanExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, schemas: SchemaRegistry) -> Self {
        Self {
            provider,
            schemas,
            options: ExecutorOptions::default(),
            abort: None,
        }
    }

    /// Sets the run options.
    #[must_use]
    pub const fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets an abort signal. Once it reads `true`, actions that have not
    /// started are skipped; actions in flight run to completion.
    #[must_use]
    pub fn with_abort(mut self, abort: watch::Receiver<bool>) -> Self {
        self.abort = Some(abort);
        self
    }

    /// Executes a plan against the provider.
    ///
    /// Never fails as a whole: every provider failure is attached to its
    /// action, and the returned state reflects what was actually applied.
    pub async fn execute(
        &self,
        plan: &Plan,
        desired: &ResourceGraph,
        previous: &AppliedState,
    ) -> ExecutionReport {
        let started = Instant::now();
        let n = plan.actions.len();
        let parallelism = self.options.parallelism.max(1);
        info!(
            "Executing plan with {n} actions (parallelism {parallelism}, provider {})",
            self.provider.name()
        );

        let mut outcomes: Vec<Option<ActionOutcome>> = vec![None; n];
        let mut applied_properties: HashMap<usize, Properties> = HashMap::new();
        let mut state = previous.clone();
        let mut outputs: HashMap<String, Properties> = previous
            .resources
            .iter()
            .map(|(name, record)| (name.clone(), record.outputs.clone()))
            .collect();
        let mut tasks: JoinSet<Finished> = JoinSet::new();
        let mut abort = self.abort.clone();
        let mut cancelled = abort.as_ref().is_some_and(|rx| *rx.borrow());
        let mut running: HashSet<usize> = HashSet::new();

        loop {
            for index in 0..n {
                if outcomes[index].is_some() || running.contains(&index) {
                    continue;
                }
                let action = &plan.actions[index];

                if cancelled {
                    warn!("Skipping {}: cancelled", action.description());
                    outcomes[index] = Some(outcome(index, action, OutcomeStatus::Skipped(String::from("cancelled"))));
                    continue;
                }

                let blocker = action.dependencies.iter().copied().find(|&d| {
                    outcomes[d]
                        .as_ref()
                        .is_some_and(|o| o.status != OutcomeStatus::Applied)
                });
                if let Some(dep) = blocker {
                    let dep_action = &plan.actions[dep];
                    let reason = format!(
                        "dependency '{}' ({}) did not complete",
                        dep_action.resource_name, dep_action.action_type
                    );
                    warn!("Skipping {}: {reason}", action.description());
                    outcomes[index] = Some(outcome(index, action, OutcomeStatus::Skipped(reason)));
                    continue;
                }

                let ready = action.dependencies.iter().all(|&d| {
                    outcomes[d]
                        .as_ref()
                        .is_some_and(|o| o.status == OutcomeStatus::Applied)
                });
                if !ready || tasks.len() >= parallelism {
                    continue;
                }

                match prepare(action, desired, &outputs) {
                    Ok((work, properties)) => {
                        info!("Starting {}", action.description());
                        if let Some(properties) = properties {
                            applied_properties.insert(index, properties);
                        }
                        tasks.spawn(run_action(
                            Arc::clone(&self.provider),
                            index,
                            work,
                            self.settings(action),
                        ));
                        running.insert(index);
                    }
                    Err(e) => {
                        error!("Cannot start {}: {e}", action.description());
                        outcomes[index] =
                            Some(outcome(index, action, OutcomeStatus::Failed(e.to_string())));
                    }
                }
            }

            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                Some(joined) = tasks.join_next() => {
                    let finished = match joined {
                        Ok(finished) => finished,
                        Err(e) => {
                            error!("Provider task ended abnormally: {e}");
                            continue;
                        }
                    };
                    let index = finished.index;
                    running.remove(&index);
                    let action = &plan.actions[index];
                    let elapsed = finished.elapsed;
                    let mut done = match finished.result {
                        Ok(remote) => {
                            let properties = applied_properties.remove(&index).unwrap_or_default();
                            let provider_id = record_success(
                                action,
                                desired,
                                remote,
                                properties,
                                &mut state,
                                &mut outputs,
                            );
                            info!("Completed {} in {}ms", action.description(), elapsed.as_millis());
                            let mut done = outcome(index, action, OutcomeStatus::Applied);
                            done.provider_id = provider_id;
                            done
                        }
                        Err(e) => {
                            error!("Failed {}: {e}", action.description());
                            outcome(index, action, OutcomeStatus::Failed(e.to_string()))
                        }
                    };
                    done.attempts = finished.attempts;
                    done.duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
                    outcomes[index] = Some(done);
                }
                () = abort_requested(&mut abort), if !cancelled => {
                    warn!("Abort requested; waiting for {} in-flight actions", tasks.len());
                    cancelled = true;
                }
                else => break,
            }
        }

        let outcomes: Vec<ActionOutcome> = outcomes
            .into_iter()
            .enumerate()
            .map(|(index, o)| {
                o.unwrap_or_else(|| {
                    outcome(
                        index,
                        &plan.actions[index],
                        OutcomeStatus::Skipped(String::from("not reached")),
                    )
                })
            })
            .collect();

        depose_interrupted_replacements(plan, &outcomes, &mut state);
        refresh_unchanged(plan, desired, &mut state);
        let lifecycles = settle_lifecycles(plan, &outcomes, desired, previous);

        let report = ExecutionReport {
            outcomes,
            lifecycles,
            state,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        info!("{report}");
        report
    }

    /// Everything a spawned action needs besides the provider and its work.
    fn settings(&self, action: &PlannedAction) -> TaskSettings {
        TaskSettings {
            description: action.description(),
            retry: self.options.retry,
            poll: PollBackoff::new(self.options.poll_interval, self.options.max_poll_interval),
            timeout: Duration::from_secs(
                self.schemas
                    .get(&action.resource_type)
                    .stabilize_timeout_secs
                    .max(1),
            ),
        }
    }
}

/// Runs one action's provider calls, stabilization included.
async fn run_action(
    provider: Arc<dyn Provider>,
    index: usize,
    work: Work,
    settings: TaskSettings,
) -> Finished {
    let TaskSettings {
        description,
        retry,
        poll,
        timeout,
    } = settings;
    let began = Instant::now();

    let (result, attempts) = match work {
        Work::Create(request) => {
            let (created, attempts) = retry
                .run(&description, || provider.create(&request))
                .await;
            let result = match created {
                Ok(remote) => stabilize(provider.as_ref(), &request, remote, &retry, poll, timeout)
                    .await
                    .map(Some),
                Err(e) => Err(e),
            };
            (result, attempts)
        }
        Work::Update { id, request } => {
            let (updated, attempts) = retry
                .run(&description, || provider.update(&id, &request))
                .await;
            let result = match updated {
                Ok(mut remote) => {
                    if remote.id.is_empty() {
                        remote.id.clone_from(&id);
                    }
                    stabilize(provider.as_ref(), &request, remote, &retry, poll, timeout)
                        .await
                        .map(Some)
                }
                Err(e) => Err(e),
            };
            (result, attempts)
        }
        Work::Delete { resource_type, id } => {
            let (deleted, attempts) = retry
                .run(&description, || provider.delete(&resource_type, &id))
                .await;
            let result = match deleted {
                Ok(()) => Ok(None),
                Err(ProviderError::NotFound { .. }) => {
                    info!("{description}: already gone");
                    Ok(None)
                }
                Err(e) => Err(e),
            };
            (result, attempts)
        }
    };

    Finished {
        index,
        result,
        attempts,
        elapsed: began.elapsed(),
    }
}

impl std::fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("provider", &self.provider.name())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Resolves references and turns an action into provider work.
///
/// Returns the resolved properties for creates and updates.
fn prepare(
    action: &PlannedAction,
    desired: &ResourceGraph,
    outputs: &HashMap<String, Properties>,
) -> Result<(Work, Option<Properties>), ExecutionError> {
    match action.action_type {
        ActionType::Create | ActionType::Update => {
            let resource = desired.get(&action.resource_name).ok_or_else(|| {
                ExecutionError::Aborted {
                    reason: format!("'{}' is not declared", action.resource_name),
                }
            })?;
            let lookup = |reference: &Reference| {
                outputs
                    .get(&reference.resource)
                    .and_then(|o| o.get(&reference.attribute))
                    .cloned()
            };
            let properties = resolve_properties(&resource.properties, &lookup).map_err(|reference| {
                ExecutionError::UnresolvedOutput {
                    resource: action.resource_name.clone(),
                    reference: reference.to_string(),
                }
            })?;
            let request = ResourceRequest {
                name: resource.name.clone(),
                resource_type: resource.resource_type.clone(),
                properties: properties.clone(),
            };

            let work = if action.action_type == ActionType::Create {
                Work::Create(request)
            } else {
                let id = action.provider_id.clone().ok_or_else(|| ExecutionError::Aborted {
                    reason: format!("update of '{}' has no provider id", action.resource_name),
                })?;
                Work::Update { id, request }
            };
            Ok((work, Some(properties)))
        }
        ActionType::Delete => {
            let id = action.provider_id.clone().ok_or_else(|| ExecutionError::Aborted {
                reason: format!("delete of '{}' has no provider id", action.resource_name),
            })?;
            Ok((
                Work::Delete {
                    resource_type: action.resource_type.clone(),
                    id,
                },
                None,
            ))
        }
    }
}

/// Polls `status` until the resource is stable, failed, or `limit` elapses.
async fn stabilize(
    provider: &dyn Provider,
    request: &ResourceRequest,
    mut remote: RemoteResource,
    retry: &RetryPolicy,
    mut backoff: PollBackoff,
    limit: Duration,
) -> ProviderResult<RemoteResource> {
    let label = format!("status {}", request.name);
    let id = remote.id.clone();

    let wait = async {
        loop {
            let (status, _) = retry
                .run(&label, || provider.status(&request.resource_type, &id))
                .await;
            match status {
                Ok(RemoteStatus::Stable { outputs }) => return Ok(outputs),
                Ok(RemoteStatus::Failed { message }) => {
                    return Err(ProviderError::fatal(FatalKind::Provisioning, message));
                }
                Ok(RemoteStatus::Pending) => {
                    let delay = backoff.next_delay();
                    debug!("{} still pending; polling again in {}ms", request.name, delay.as_millis());
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    };

    let late_outputs = tokio::time::timeout(limit, wait)
        .await
        .map_err(|_| ProviderError::Timeout {
            resource: request.name.clone(),
            waited_secs: limit.as_secs(),
        })??;

    remote.outputs.extend(late_outputs);
    remote
        .outputs
        .entry(ID_OUTPUT.to_string())
        .or_insert_with(|| serde_json::Value::String(id));
    Ok(remote)
}

/// Resolves when the abort signal turns `true`; never if the sender is gone.
async fn abort_requested(abort: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = abort {
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
    std::future::pending::<()>().await;
}

fn outcome(index: usize, action: &PlannedAction, status: OutcomeStatus) -> ActionOutcome {
    ActionOutcome {
        index,
        action_type: action.action_type,
        resource_name: action.resource_name.clone(),
        resource_type: action.resource_type.clone(),
        replacement: action.replacement,
        status,
        provider_id: action.provider_id.clone(),
        attempts: 0,
        duration_ms: 0,
    }
}

/// Applies a successful action to the new state and the output table.
///
/// Returns the provider id the action ended on.
fn record_success(
    action: &PlannedAction,
    desired: &ResourceGraph,
    remote: Option<RemoteResource>,
    properties: Properties,
    state: &mut AppliedState,
    outputs: &mut HashMap<String, Properties>,
) -> Option<String> {
    let name = action.resource_name.as_str();
    let hash = action.new_hash.as_deref().unwrap_or_default();

    match (action.action_type, remote, desired.get(name)) {
        (ActionType::Create, Some(remote), Some(resource)) => {
            outputs.insert(name.to_string(), remote.outputs.clone());
            state.insert(ResourceRecord::new(resource, properties, &remote, hash));
            Some(remote.id)
        }
        (ActionType::Update, Some(remote), Some(resource)) => {
            outputs.insert(name.to_string(), remote.outputs.clone());
            if let Some(record) = state.resources.get_mut(name) {
                record.apply_update(resource, properties, &remote, hash);
            } else {
                state.insert(ResourceRecord::new(resource, properties, &remote, hash));
            }
            Some(remote.id)
        }
        (ActionType::Delete, _, _) => {
            let id = action.provider_id.as_deref().unwrap_or_default();
            if action.deposed {
                state.deposed.retain(|d| d.provider_id != id);
            } else if state.get(name).is_some_and(|r| r.provider_id == id) {
                state.remove(name);
                outputs.remove(name);
            }
            action.provider_id.clone()
        }
        _ => {
            warn!("Nothing to record for {}", action.description());
            None
        }
    }
}

/// Remembers old instances whose create-before-delete replacement finished
/// the create but not the delete.
fn depose_interrupted_replacements(plan: &Plan, outcomes: &[ActionOutcome], state: &mut AppliedState) {
    for (index, action) in plan.actions.iter().enumerate() {
        let interrupted = action.action_type == ActionType::Delete
            && action.replacement == Some(ReplacePolicy::CreateBeforeDelete)
            && outcomes[index].status != OutcomeStatus::Applied;
        if !interrupted {
            continue;
        }
        let created = plan.actions.iter().zip(outcomes).any(|(a, o)| {
            a.resource_name == action.resource_name
                && a.action_type == ActionType::Create
                && a.replacement.is_some()
                && o.status == OutcomeStatus::Applied
        });
        if let (true, Some(id)) = (created, &action.provider_id) {
            warn!(
                "Old instance {id} of '{}' was not deleted; keeping it as deposed",
                action.resource_name
            );
            state.deposed.push(DeposedRecord {
                name: action.resource_name.clone(),
                resource_type: action.resource_type.clone(),
                provider_id: id.clone(),
                deposed_at: chrono::Utc::now(),
            });
        }
    }
}

/// Brings ordering metadata of untouched records up to date.
fn refresh_unchanged(plan: &Plan, desired: &ResourceGraph, state: &mut AppliedState) {
    let touched: HashSet<&str> = plan.actions.iter().map(|a| a.resource_name.as_str()).collect();
    for resource in desired.resources() {
        if touched.contains(resource.name.as_str()) {
            continue;
        }
        if let Some(record) = state.resources.get_mut(&resource.name) {
            record.dependencies = resource.dependencies().into_iter().map(String::from).collect();
            record.order = resource.index;
        }
    }
}

/// Derives each resource's final lifecycle from its action outcomes.
fn settle_lifecycles(
    plan: &Plan,
    outcomes: &[ActionOutcome],
    desired: &ResourceGraph,
    previous: &AppliedState,
) -> BTreeMap<String, Lifecycle> {
    let mut lifecycles: BTreeMap<String, Lifecycle> = previous
        .resources
        .keys()
        .map(|name| (name.clone(), Lifecycle::Applied))
        .collect();
    for resource in desired.resources() {
        lifecycles
            .entry(resource.name.clone())
            .or_insert(Lifecycle::Absent);
    }

    let mut per_resource: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (index, action) in plan.actions.iter().enumerate() {
        if !action.deposed {
            per_resource
                .entry(action.resource_name.as_str())
                .or_default()
                .push(index);
        }
    }

    for (name, indices) in per_resource {
        let lifecycle = lifecycles.entry(name.to_string()).or_insert(Lifecycle::Absent);
        match settle(*lifecycle, name, plan, outcomes, &indices) {
            Ok(settled) => *lifecycle = settled,
            Err(e) => {
                error!("{e}");
                *lifecycle = Lifecycle::Failed;
            }
        }
    }
    lifecycles
}

fn settle(
    initial: Lifecycle,
    name: &str,
    plan: &Plan,
    outcomes: &[ActionOutcome],
    indices: &[usize],
) -> Result<Lifecycle, ExecutionError> {
    let mut lifecycle = initial;
    lifecycle.transition(Lifecycle::Planned, name)?;

    let started = indices
        .iter()
        .any(|&i| !matches!(outcomes[i].status, OutcomeStatus::Skipped(_)));
    if !started {
        lifecycle.transition(Lifecycle::Skipped, name)?;
        return Ok(lifecycle);
    }
    lifecycle.transition(Lifecycle::Applying, name)?;

    let all_applied = indices
        .iter()
        .all(|&i| outcomes[i].status == OutcomeStatus::Applied);
    let target = if !all_applied {
        Lifecycle::Failed
    } else if indices.len() > 1 {
        Lifecycle::Replaced
    } else {
        match plan.actions[indices[0]].action_type {
            ActionType::Create => Lifecycle::Applied,
            ActionType::Update => Lifecycle::Updated,
            ActionType::Delete => Lifecycle::Deleted,
        }
    };
    lifecycle.transition(target, name)?;
    Ok(lifecycle)
}

impl OutcomeStatus {
    /// Returns true for `Applied`.
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

impl ExecutionReport {
    fn count(&self, predicate: impl Fn(&OutcomeStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|o| predicate(&o.status)).count()
    }

    /// Number of actions that reached a stable state.
    #[must_use]
    pub fn applied_count(&self) -> usize {
        self.count(OutcomeStatus::is_applied)
    }

    /// Number of actions that failed.
    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.count(|s| matches!(s, OutcomeStatus::Failed(_)))
    }

    /// Number of actions never started.
    #[must_use]
    pub fn skipped_count(&self) -> usize {
        self.count(|s| matches!(s, OutcomeStatus::Skipped(_)))
    }

    /// Returns true if every action was applied.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.status.is_applied())
    }

    /// The first failure message, if any.
    #[must_use]
    pub fn first_error(&self) -> Option<String> {
        self.outcomes.iter().find_map(|o| match &o.status {
            OutcomeStatus::Failed(message) => {
                Some(format!("{} {}: {message}", o.action_type, o.resource_name))
            }
            _ => None,
        })
    }

    /// Resources whose lifecycle ended in `Failed`.
    #[must_use]
    pub fn failed_resources(&self) -> Vec<&str> {
        self.lifecycles
            .iter()
            .filter(|(_, l)| **l == Lifecycle::Failed)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// The outcome of the action on a resource, last one for replacements.
    #[must_use]
    pub fn outcome_for(&self, resource: &str) -> Option<&ActionOutcome> {
        self.outcomes.iter().rev().find(|o| o.resource_name == resource)
    }
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Applied => write!(f, "applied"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            Self::Skipped(reason) => write!(f, "skipped: {reason}"),
        }
    }
}

impl std::fmt::Display for ExecutionReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Executed {} actions: {} applied, {} failed, {} skipped",
            self.outcomes.len(),
            self.applied_count(),
            self.failed_count(),
            self.skipped_count()
        )
    }
}

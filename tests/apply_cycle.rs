//! End-to-end apply cycles against the in-memory provider.

use std::sync::Arc;

use stratum::config::{ConfigParser, StackConfig};
use stratum::engine::{ApplyStatus, Engine};
use stratum::error::{FatalKind, GraphError, PlanError, ProviderError, StratumError};
use stratum::planner::{ActionType, OutcomeStatus};
use stratum::provider::{JournalEvent, MemoryProvider, Operation, Provider};
use stratum::state::{LocalStateStore, Lifecycle, StateStore};
use tempfile::TempDir;

const IMAGE_ANALYSIS: &str = r"
stack: { name: image-analysis, environment: test }
provider: { kind: memory }
execution: { parallelism: 4, base_delay_ms: 1, max_delay_ms: 5, poll_interval_ms: 1 }
types:
  storage.bucket: { immutable: [bucket_name], replace: delete_before_create }
  iam.role: { immutable: [assumed_by], replace: create_before_delete }
  compute.function: { immutable: [runtime], replace: create_before_delete }
resources:
  - name: handler
    type: compute.function
    properties: { runtime: nodejs18.x, role: '${role.arn}' }
  - name: role
    type: iam.role
    properties: { assumed_by: lambda }
  - name: bucket
    type: storage.bucket
    properties: { bucket_name: images }
  - name: post
    type: api.method
    properties:
      http_method: POST
      target: '${handler.arn}'
      bucket: '${bucket.name}'
";

struct Fixture {
    _dir: TempDir,
    store: LocalStateStore,
    memory: Arc<MemoryProvider>,
}

impl Fixture {
    fn new(memory: MemoryProvider) -> Self {
        let dir = TempDir::new().unwrap();
        let store = LocalStateStore::with_base_dir(dir.path().join(".stratum"));
        Self {
            _dir: dir,
            store,
            memory: Arc::new(memory),
        }
    }

    fn engine<'a>(&'a self, config: &'a StackConfig) -> Engine<'a, LocalStateStore> {
        let provider: Arc<dyn Provider> = self.memory.clone();
        Engine::new(config, &self.store, provider)
    }
}

fn stack(yaml: &str) -> StackConfig {
    ConfigParser::new().parse_yaml(yaml, None).unwrap()
}

fn with_property(yaml: &str, from: &str, to: &str) -> StackConfig {
    assert!(yaml.contains(from));
    stack(&yaml.replace(from, to))
}

fn summary(actions: &[stratum::planner::PlannedAction]) -> Vec<String> {
    actions
        .iter()
        .map(|a| format!("{} {}", a.action_type, a.resource_name))
        .collect()
}

#[tokio::test]
async fn test_first_apply_creates_each_resource_once_in_dependency_order() {
    let config = stack(IMAGE_ANALYSIS);
    let fixture = Fixture::new(MemoryProvider::new());

    let planned = fixture.engine(&config).plan().await.unwrap();
    assert_eq!(
        summary(&planned.plan.actions),
        vec!["create role", "create handler", "create bucket", "create post"]
    );

    let outcome = fixture.engine(&config).apply(|_| async { true }).await.unwrap();
    assert_eq!(outcome.status, ApplyStatus::Completed);
    assert_eq!(fixture.memory.calls(Operation::Create), 4);

    let state = fixture.store.load().await.unwrap().unwrap();
    assert_eq!(state.len(), 4);
    assert_eq!(state.serial, 1);
    let post = state.get("post").unwrap();
    assert_eq!(post.applied_properties["bucket"], "bucket");
    assert_eq!(post.properties["bucket"], "${bucket.name}");
    assert_eq!(post.dependencies, vec!["bucket", "handler"]);
}

#[tokio::test]
async fn test_dependents_start_only_after_dependencies_are_stable() {
    let config = stack(IMAGE_ANALYSIS);
    let fixture = Fixture::new(MemoryProvider::new().with_pending_polls(3));

    fixture.engine(&config).apply(|_| async { true }).await.unwrap();

    let journal = fixture.memory.journal();
    let seq = |op: Operation, name: &str, event: JournalEvent| {
        journal
            .iter()
            .find(|e| e.operation == op && e.resource == name && e.event == event)
            .map(|e| e.seq)
            .unwrap()
    };
    for (dependency, dependent) in [("role", "handler"), ("handler", "post"), ("bucket", "post")] {
        assert!(
            seq(Operation::Status, dependency, JournalEvent::Stable)
                < seq(Operation::Create, dependent, JournalEvent::Started),
            "{dependent} started before {dependency} was stable"
        );
    }
}

#[tokio::test]
async fn test_reapplying_an_unchanged_stack_is_a_no_op() {
    let config = stack(IMAGE_ANALYSIS);
    let fixture = Fixture::new(MemoryProvider::new());

    fixture.engine(&config).apply(|_| async { true }).await.unwrap();
    let planned = fixture.engine(&config).plan().await.unwrap();
    assert!(planned.plan.is_empty());
    assert_eq!(planned.diff.unchanged, 4);

    let outcome = fixture.engine(&config).apply(|_| async { true }).await.unwrap();
    assert_eq!(outcome.status, ApplyStatus::NoChanges);
    assert_eq!(fixture.memory.calls(Operation::Create), 4);
    assert_eq!(fixture.memory.calls(Operation::Update), 0);
}

#[tokio::test]
async fn test_cyclic_declarations_are_rejected_before_planning() {
    let config = stack(
        r"
stack: { name: cyclic, environment: test }
resources:
  - { name: a, type: t, properties: { peer: '${b.id}' } }
  - { name: b, type: t, properties: {}, depends_on: [c] }
  - { name: c, type: t, properties: { peer: '${a.id}' } }
",
    );
    let fixture = Fixture::new(MemoryProvider::new());

    let err = fixture.engine(&config).plan().await.unwrap_err();
    assert!(matches!(err, StratumError::Graph(GraphError::Cycle { .. })));
    assert!(fixture.memory.journal().is_empty());
    assert!(!fixture.store.exists().await.unwrap());
}

#[tokio::test]
async fn test_failure_skips_dependents_and_keeps_independent_work() {
    let config = stack(
        r"
stack: { name: partial, environment: test }
execution: { base_delay_ms: 1, max_delay_ms: 5, poll_interval_ms: 1 }
resources:
  - { name: a, type: storage.bucket, properties: {} }
  - { name: b, type: compute.function, properties: { bucket: '${a.name}' } }
  - { name: c, type: iam.role, properties: {} }
",
    );
    let fixture = Fixture::new(MemoryProvider::new());
    fixture.memory.fail_next(
        Operation::Create,
        "a",
        ProviderError::fatal(FatalKind::Quota, "bucket limit reached"),
    );

    let outcome = fixture.engine(&config).apply(|_| async { true }).await.unwrap();
    assert_eq!(outcome.status, ApplyStatus::Partial);

    let report = outcome.report.unwrap();
    assert_eq!(report.lifecycles["a"], Lifecycle::Failed);
    assert_eq!(report.lifecycles["b"], Lifecycle::Skipped);
    assert_eq!(report.lifecycles["c"], Lifecycle::Applied);
    assert!(matches!(
        &report.outcome_for("b").unwrap().status,
        OutcomeStatus::Skipped(reason) if reason.contains("'a'")
    ));

    let state = fixture.store.load().await.unwrap().unwrap();
    assert_eq!(state.resources.keys().collect::<Vec<_>>(), vec!["c"]);
    assert!(!state.history[0].success);

    // Fixing the cause and re-running completes the rest.
    let retry = fixture.engine(&config).apply(|_| async { true }).await.unwrap();
    assert_eq!(retry.status, ApplyStatus::Completed);
    assert_eq!(summary(&retry.plan.actions), vec!["create a", "create b"]);
}

#[tokio::test]
async fn test_immutable_change_replaces_per_policy() {
    let config = stack(IMAGE_ANALYSIS);
    let fixture = Fixture::new(MemoryProvider::new());
    fixture.engine(&config).apply(|_| async { true }).await.unwrap();

    // delete_before_create on a bucket that `post` still reads from would
    // leave `post` pointing at nothing while the new bucket is created.
    let renamed = with_property(IMAGE_ANALYSIS, "bucket_name: images", "bucket_name: photos");
    let err = fixture.engine(&renamed).plan().await.unwrap_err();
    assert!(matches!(
        err,
        StratumError::Plan(PlanError::WouldOrphan { ref resource, ref dependent })
            if resource == "bucket" && dependent == "post"
    ));

    // create_before_delete: new function first, old one removed last.
    let upgraded = with_property(IMAGE_ANALYSIS, "runtime: nodejs18.x", "runtime: nodejs20.x");
    let planned = fixture.engine(&upgraded).plan().await.unwrap();
    assert_eq!(
        summary(&planned.plan.actions),
        vec!["create handler", "update post", "delete handler"]
    );

    let outcome = fixture.engine(&upgraded).apply(|_| async { true }).await.unwrap();
    assert_eq!(outcome.status, ApplyStatus::Completed);
    let report = outcome.report.unwrap();
    assert_eq!(report.lifecycles["handler"], Lifecycle::Replaced);
    assert_eq!(report.lifecycles["post"], Lifecycle::Updated);
    assert_eq!(fixture.memory.resource_names().len(), 4);
}

#[tokio::test]
async fn test_unreferenced_resource_is_deleted_before_its_replacement() {
    let standalone = r"
stack: { name: buckets, environment: test }
execution: { base_delay_ms: 1, max_delay_ms: 5, poll_interval_ms: 1 }
types:
  storage.bucket: { immutable: [bucket_name], replace: delete_before_create }
resources:
  - { name: bucket, type: storage.bucket, properties: { bucket_name: images } }
";
    let fixture = Fixture::new(MemoryProvider::new());
    fixture.engine(&stack(standalone)).apply(|_| async { true }).await.unwrap();
    let old_id = fixture.memory.find("bucket").unwrap().id;

    let renamed = with_property(standalone, "bucket_name: images", "bucket_name: photos");
    let outcome = fixture.engine(&renamed).apply(|_| async { true }).await.unwrap();
    assert_eq!(summary(&outcome.plan.actions), vec!["delete bucket", "create bucket"]);
    assert_eq!(outcome.status, ApplyStatus::Completed);

    let state = fixture.store.load().await.unwrap().unwrap();
    let record = state.get("bucket").unwrap();
    assert_ne!(record.provider_id, old_id);
    assert_eq!(record.applied_properties["bucket_name"], "photos");
}

#[tokio::test]
async fn test_removed_resources_are_deleted_after_their_dependents() {
    let config = stack(IMAGE_ANALYSIS);
    let fixture = Fixture::new(MemoryProvider::new());
    fixture.engine(&config).apply(|_| async { true }).await.unwrap();

    let trimmed = stack(
        r"
stack: { name: image-analysis, environment: test }
execution: { base_delay_ms: 1, max_delay_ms: 5, poll_interval_ms: 1 }
resources:
  - name: role
    type: iam.role
    properties: { assumed_by: lambda }
",
    );
    let outcome = fixture.engine(&trimmed).apply(|_| async { true }).await.unwrap();
    assert_eq!(outcome.status, ApplyStatus::Completed);
    assert_eq!(
        summary(&outcome.plan.actions),
        vec!["delete post", "delete bucket", "delete handler"]
    );
    assert_eq!(fixture.memory.resource_names(), vec!["role"]);
}

#[tokio::test]
async fn test_destroy_removes_everything_in_reverse_order() {
    let config = stack(IMAGE_ANALYSIS);
    let fixture = Fixture::new(MemoryProvider::new());
    fixture.engine(&config).apply(|_| async { true }).await.unwrap();

    let outcome = fixture.engine(&config).destroy(|_| async { true }).await.unwrap();
    assert_eq!(outcome.status, ApplyStatus::Completed);
    assert!(outcome.plan.actions.iter().all(|a| a.action_type == ActionType::Delete));
    assert!(fixture.memory.resource_names().is_empty());

    let journal = fixture.memory.journal();
    let deleted = |name: &str| {
        journal
            .iter()
            .position(|e| e.resource == name && e.event == JournalEvent::Deleted)
            .unwrap()
    };
    assert!(deleted("post") < deleted("handler"));
    assert!(deleted("post") < deleted("bucket"));
    assert!(deleted("handler") < deleted("role"));

    let state = fixture.store.load().await.unwrap().unwrap();
    assert!(state.is_empty());
    assert_eq!(state.history.len(), 2);

    let again = fixture.engine(&config).destroy(|_| async { true }).await.unwrap();
    assert_eq!(again.status, ApplyStatus::NoChanges);
}

#[tokio::test]
async fn test_lock_is_free_after_every_cycle() {
    let config = stack(IMAGE_ANALYSIS);
    let fixture = Fixture::new(MemoryProvider::new());

    fixture.engine(&config).apply(|_| async { true }).await.unwrap();
    assert!(!fixture.store.is_locked().await.unwrap());

    let held = fixture.store.acquire_lock("someone-else").await.unwrap();
    let err = fixture.engine(&config).apply(|_| async { true }).await.unwrap_err();
    assert!(err.to_string().contains("someone-else"));
    fixture.store.release_lock(&held.lock_id).await.unwrap();
}

const RENAMABLE: &str = r"
stack: { name: renamable, environment: test }
provider: { kind: memory }
execution: { base_delay_ms: 1, max_delay_ms: 5, poll_interval_ms: 1 }
resources:
  - name: bucket
    type: storage.bucket
    properties: { name: images }
  - name: handler
    type: compute.function
    properties: { bucket: '${bucket.name}' }
";

#[tokio::test]
async fn test_updated_outputs_reach_referencing_resources() {
    let fixture = Fixture::new(MemoryProvider::new());
    fixture.engine(&stack(RENAMABLE)).apply(|_| async { true }).await.unwrap();

    let renamed = with_property(RENAMABLE, "name: images", "name: photos");
    let outcome = fixture.engine(&renamed).apply(|_| async { true }).await.unwrap();
    assert_eq!(outcome.status, ApplyStatus::Completed);
    assert_eq!(summary(&outcome.plan.actions), vec!["update bucket", "update handler"]);

    let state = fixture.store.load().await.unwrap().unwrap();
    assert_eq!(state.get("handler").unwrap().applied_properties["bucket"], "photos");
    let remote = fixture.memory.find("handler").unwrap();
    assert_eq!(remote.properties["bucket"], "photos");

    assert!(fixture.engine(&renamed).plan().await.unwrap().plan.is_empty());
}

#[tokio::test]
async fn test_interrupted_propagation_is_picked_up_by_the_next_apply() {
    let fixture = Fixture::new(MemoryProvider::new());
    fixture.engine(&stack(RENAMABLE)).apply(|_| async { true }).await.unwrap();

    fixture.memory.fail_next(
        Operation::Update,
        "handler",
        ProviderError::fatal(FatalKind::Validation, "rejected"),
    );
    let renamed = with_property(RENAMABLE, "name: images", "name: photos");
    let outcome = fixture.engine(&renamed).apply(|_| async { true }).await.unwrap();
    assert_eq!(outcome.status, ApplyStatus::Partial);

    let planned = fixture.engine(&renamed).plan().await.unwrap();
    assert_eq!(summary(&planned.plan.actions), vec!["update handler"]);

    let retry = fixture.engine(&renamed).apply(|_| async { true }).await.unwrap();
    assert_eq!(retry.status, ApplyStatus::Completed);
    assert_eq!(fixture.memory.find("handler").unwrap().properties["bucket"], "photos");
}

//! In-process control plane.
//!
//! Used for dry runs and tests. Supports scripted failures, a configurable
//! number of `Pending` polls before a resource turns stable, artificial
//! latency, and a journal of every call in the order it happened.

use super::{
    ID_OUTPUT, Provider, RemoteResource, RemoteStatus, ResourceRequest, SchemaRegistry, TypeSchema,
};
use crate::error::{ProviderError, ProviderResult};
use crate::graph::Properties;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::trace;

/// Provider operation, used to script failures and filter the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `create`
    Create,
    /// `read`
    Read,
    /// `update`
    Update,
    /// `delete`
    Delete,
    /// `status`
    Status,
}

/// What happened in a journaled call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEvent {
    /// The call started.
    Started,
    /// A status poll reported the resource stable.
    Stable,
    /// The resource was removed.
    Deleted,
    /// The call failed with the given message.
    Failed(String),
}

/// One journal line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    /// Position in the journal.
    pub seq: usize,
    /// The operation.
    pub operation: Operation,
    /// Logical name of the resource.
    pub resource: String,
    /// What happened.
    pub event: JournalEvent,
}

#[derive(Debug, Clone)]
struct StoredResource {
    name: String,
    resource_type: String,
    properties: Properties,
    outputs: Properties,
    pending_polls: u32,
}

impl StoredResource {
    fn to_remote(&self, id: &str) -> RemoteResource {
        RemoteResource {
            id: id.to_string(),
            properties: self.properties.clone(),
            outputs: self.outputs.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    resources: BTreeMap<String, StoredResource>,
    next_id: u64,
    journal: Vec<JournalEntry>,
    failures: HashMap<(Operation, String), VecDeque<ProviderError>>,
}

impl Inner {
    fn record(&mut self, operation: Operation, resource: &str, event: JournalEvent) {
        let seq = self.journal.len();
        self.journal.push(JournalEntry {
            seq,
            operation,
            resource: resource.to_string(),
            event,
        });
    }

    fn take_failure(&mut self, operation: Operation, resource: &str) -> Option<ProviderError> {
        let queue = self.failures.get_mut(&(operation, resource.to_string()))?;
        let error = queue.pop_front();
        if queue.is_empty() {
            self.failures.remove(&(operation, resource.to_string()));
        }
        error
    }

    fn check(&mut self, operation: Operation, resource: &str) -> ProviderResult<()> {
        if let Some(error) = self.take_failure(operation, resource) {
            self.record(operation, resource, JournalEvent::Failed(error.to_string()));
            return Err(error);
        }
        Ok(())
    }
}

/// In-memory `Provider`.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    inner: Mutex<Inner>,
    schemas: SchemaRegistry,
    pending_polls: u32,
    latency: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

struct InFlight<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a type schema.
    #[must_use]
    pub fn with_schema(mut self, resource_type: &str, schema: TypeSchema) -> Self {
        self.schemas.insert(resource_type, schema);
        self
    }

    /// Number of `Pending` polls before a created or updated resource is stable.
    #[must_use]
    pub const fn with_pending_polls(mut self, polls: u32) -> Self {
        self.pending_polls = polls;
        self
    }

    /// Delay added to every create, update and delete.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlight {
            counter: &self.in_flight,
        }
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    /// Makes the next call of `operation` on `resource` fail with `error`.
    ///
    /// Calling this several times queues several failures.
    pub fn fail_next(&self, operation: Operation, resource: &str, error: ProviderError) {
        self.inner()
            .failures
            .entry((operation, resource.to_string()))
            .or_default()
            .push_back(error);
    }

    /// A copy of the call journal.
    #[must_use]
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.inner().journal.clone()
    }

    /// Number of journaled calls of `operation` that started.
    #[must_use]
    pub fn calls(&self, operation: Operation) -> usize {
        self.inner()
            .journal
            .iter()
            .filter(|e| e.operation == operation && e.event == JournalEvent::Started)
            .count()
    }

    /// Highest number of concurrent mutating calls seen.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Logical names of the live resources, sorted.
    #[must_use]
    pub fn resource_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner()
            .resources
            .values()
            .map(|r| r.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Looks up a live resource by logical name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<RemoteResource> {
        self.inner()
            .resources
            .iter()
            .find(|(_, r)| r.name == name)
            .map(|(id, r)| r.to_remote(id))
    }

    /// Removes a resource behind the engine's back.
    pub fn forget(&self, name: &str) {
        self.inner().resources.retain(|_, r| r.name != name);
    }

    /// Changes a property behind the engine's back.
    pub fn tamper(&self, name: &str, property: &str, value: Value) {
        if let Some(resource) = self.inner().resources.values_mut().find(|r| r.name == name) {
            resource.properties.insert(property.to_string(), value);
        }
    }

    fn outputs_for(&self, id: &str, request: &ResourceRequest) -> Properties {
        let display_name = request
            .properties
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(request.name.as_str())
            .to_string();

        let mut outputs = Properties::new();
        outputs.insert(ID_OUTPUT.to_string(), Value::String(id.to_string()));
        outputs.insert(
            String::from("arn"),
            Value::String(format!("mem:{}:{}", request.resource_type, request.name)),
        );
        outputs.insert(String::from("name"), Value::String(display_name));
        for attribute in &self.schemas.get(&request.resource_type).outputs {
            outputs
                .entry(attribute.clone())
                .or_insert_with(|| Value::String(format!("{id}-{attribute}")));
        }
        outputs
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    fn schemas(&self) -> SchemaRegistry {
        self.schemas.clone()
    }

    async fn create(&self, request: &ResourceRequest) -> ProviderResult<RemoteResource> {
        let _in_flight = self.enter();
        {
            let mut inner = self.inner();
            inner.record(Operation::Create, &request.name, JournalEvent::Started);
            inner.check(Operation::Create, &request.name)?;
        }

        self.delay().await;

        let mut inner = self.inner();
        inner.next_id += 1;
        let id = format!("{}-{:04}", request.resource_type.replace('.', "-"), inner.next_id);
        let stored = StoredResource {
            name: request.name.clone(),
            resource_type: request.resource_type.clone(),
            properties: request.properties.clone(),
            outputs: self.outputs_for(&id, request),
            pending_polls: self.pending_polls,
        };
        let remote = stored.to_remote(&id);
        inner.resources.insert(id.clone(), stored);
        trace!("memory: created {} as {id}", request.name);
        Ok(remote)
    }

    async fn read(&self, resource_type: &str, id: &str) -> ProviderResult<Option<RemoteResource>> {
        let mut inner = self.inner();
        let Some(name) = inner.resources.get(id).map(|r| r.name.clone()) else {
            return Ok(None);
        };
        inner.record(Operation::Read, &name, JournalEvent::Started);
        inner.check(Operation::Read, &name)?;
        Ok(inner
            .resources
            .get(id)
            .filter(|r| r.resource_type == resource_type)
            .map(|r| r.to_remote(id)))
    }

    async fn update(&self, id: &str, request: &ResourceRequest) -> ProviderResult<RemoteResource> {
        let _in_flight = self.enter();
        {
            let mut inner = self.inner();
            inner.record(Operation::Update, &request.name, JournalEvent::Started);
            inner.check(Operation::Update, &request.name)?;
        }

        self.delay().await;

        let mut inner = self.inner();
        let Some(stored) = inner.resources.get_mut(id) else {
            return Err(ProviderError::NotFound {
                resource_type: request.resource_type.clone(),
                id: id.to_string(),
            });
        };
        stored.properties.clone_from(&request.properties);
        stored.outputs = self.outputs_for(id, request);
        stored.pending_polls = self.pending_polls;
        Ok(stored.to_remote(id))
    }

    async fn delete(&self, resource_type: &str, id: &str) -> ProviderResult<()> {
        let _in_flight = self.enter();
        let name = {
            let mut inner = self.inner();
            let name = inner
                .resources
                .get(id)
                .map_or_else(|| id.to_string(), |r| r.name.clone());
            inner.record(Operation::Delete, &name, JournalEvent::Started);
            inner.check(Operation::Delete, &name)?;
            name
        };

        self.delay().await;

        let mut inner = self.inner();
        if inner.resources.remove(id).is_none() {
            return Err(ProviderError::NotFound {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
            });
        }
        inner.record(Operation::Delete, &name, JournalEvent::Deleted);
        Ok(())
    }

    async fn status(&self, resource_type: &str, id: &str) -> ProviderResult<RemoteStatus> {
        let mut inner = self.inner();
        let Some(name) = inner.resources.get(id).map(|r| r.name.clone()) else {
            return Err(ProviderError::NotFound {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
            });
        };
        inner.check(Operation::Status, &name)?;

        let Some(stored) = inner.resources.get_mut(id) else {
            return Err(ProviderError::NotFound {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
            });
        };
        if stored.pending_polls > 0 {
            stored.pending_polls -= 1;
            return Ok(RemoteStatus::Pending);
        }

        inner.record(Operation::Status, &name, JournalEvent::Stable);
        Ok(RemoteStatus::Stable {
            outputs: Properties::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FatalKind;
    use serde_json::json;

    fn request(name: &str) -> ResourceRequest {
        ResourceRequest {
            name: name.to_string(),
            resource_type: String::from("storage.bucket"),
            properties: serde_json::from_value(json!({ "name": "images" })).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_create_assigns_id_and_outputs() {
        let provider = MemoryProvider::new();
        let remote = provider.create(&request("bucket")).await.unwrap();

        assert_eq!(remote.id, "storage-bucket-0001");
        assert_eq!(remote.outputs["id"], json!("storage-bucket-0001"));
        assert_eq!(remote.outputs["name"], json!("images"));
        assert_eq!(provider.resource_names(), vec!["bucket"]);
    }

    #[tokio::test]
    async fn test_pending_polls_before_stable() {
        let provider = MemoryProvider::new().with_pending_polls(2);
        let remote = provider.create(&request("bucket")).await.unwrap();

        for _ in 0..2 {
            let status = provider.status("storage.bucket", &remote.id).await.unwrap();
            assert_eq!(status, RemoteStatus::Pending);
        }
        let status = provider.status("storage.bucket", &remote.id).await.unwrap();
        assert!(matches!(status, RemoteStatus::Stable { .. }));
    }

    #[tokio::test]
    async fn test_scripted_failure_is_consumed_once() {
        let provider = MemoryProvider::new();
        provider.fail_next(
            Operation::Create,
            "bucket",
            ProviderError::fatal(FatalKind::Quota, "bucket limit reached"),
        );

        assert!(provider.create(&request("bucket")).await.is_err());
        assert!(provider.create(&request("bucket")).await.is_ok());
        assert_eq!(provider.calls(Operation::Create), 2);
    }

    #[tokio::test]
    async fn test_delete_unknown_is_not_found() {
        let provider = MemoryProvider::new();
        let err = provider.delete("storage.bucket", "nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_read_reflects_tampering() {
        let provider = MemoryProvider::new();
        let remote = provider.create(&request("bucket")).await.unwrap();
        provider.tamper("bucket", "versioning", json!(true));

        let read = provider.read("storage.bucket", &remote.id).await.unwrap().unwrap();
        assert_eq!(read.properties["versioning"], json!(true));

        provider.forget("bucket");
        assert!(provider.read("storage.bucket", &remote.id).await.unwrap().is_none());
    }
}

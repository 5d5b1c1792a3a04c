//! Control-plane abstraction.
//!
//! The engine never talks to a cloud directly: every create, update, delete
//! and status poll goes through a [`Provider`]. This module provides:
//! - The [`Provider`] trait and its request/response types
//! - Type schemas describing immutable properties and replacement policy
//! - Retry and polling backoff
//! - An HTTP provider and an in-memory provider

mod http;
mod memory;
mod retry;
mod schema;

pub use http::HttpProvider;
pub use memory::{JournalEntry, JournalEvent, MemoryProvider, Operation};
pub use retry::{
    DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY_MS, PollBackoff, RetryPolicy,
};
pub use schema::{DEFAULT_STABILIZE_TIMEOUT_SECS, ReplacePolicy, SchemaRegistry, TypeSchema};

use crate::error::ProviderResult;
use crate::graph::Properties;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Output attribute every resource publishes: its provider identifier.
pub const ID_OUTPUT: &str = "id";

/// A create or update request with all references resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceRequest {
    /// Logical name.
    pub name: String,
    /// Resource type.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Resolved properties.
    pub properties: Properties,
}

/// A resource as seen by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteResource {
    /// Provider-assigned identifier.
    pub id: String,
    /// Properties as currently applied.
    #[serde(default)]
    pub properties: Properties,
    /// Output attributes.
    #[serde(default)]
    pub outputs: Properties,
}

/// Provisioning status of a remote resource.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteStatus {
    /// Still converging.
    Pending,
    /// Ready; carries outputs that only became known once stable.
    Stable {
        /// Late outputs, merged over the ones returned by create/update.
        outputs: Properties,
    },
    /// Reached a failed terminal state.
    Failed {
        /// Reason reported by the control plane.
        message: String,
    },
}

/// A remote control plane.
///
/// Implementations map their own failures onto `ProviderError` so the
/// executor can tell transient from fatal errors.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Human-readable name, used in logs.
    fn name(&self) -> &str;

    /// Type metadata known to this provider.
    fn schemas(&self) -> SchemaRegistry {
        SchemaRegistry::new()
    }

    /// Creates a resource.
    async fn create(&self, request: &ResourceRequest) -> ProviderResult<RemoteResource>;

    /// Reads a resource; `None` if it does not exist.
    async fn read(&self, resource_type: &str, id: &str) -> ProviderResult<Option<RemoteResource>>;

    /// Updates a resource in place.
    async fn update(&self, id: &str, request: &ResourceRequest) -> ProviderResult<RemoteResource>;

    /// Deletes a resource.
    async fn delete(&self, resource_type: &str, id: &str) -> ProviderResult<()>;

    /// Polls the provisioning status of a resource.
    async fn status(&self, resource_type: &str, id: &str) -> ProviderResult<RemoteStatus>;
}

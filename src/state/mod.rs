//! State management for the Stratum engine.
//!
//! This module persists what the last apply cycle produced (the applied
//! state), guards it with a lease-based lock, and tracks each resource's
//! lifecycle while a cycle runs.

mod lifecycle;
mod local;
mod lock;
mod s3;
mod store;
mod types;

pub use lifecycle::Lifecycle;
pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{LOCK_EXPIRY_SECS, LOCK_RENEWAL_INTERVAL, LockInfo, generate_holder_id};
pub use s3::S3StateStore;
pub use store::{LeaseGuard, StateStore, with_lock};
#[cfg(test)]
pub(crate) use store::MockStateStore;
pub use types::{
    AppliedState, DeposedRecord, HistoryEntry, HistoryOperation, MAX_HISTORY, ResourceRecord,
    STATE_VERSION,
};

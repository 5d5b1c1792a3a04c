//! State store trait definition.
//!
//! This module defines the common interface for state storage backends and
//! the scoped locking helper every mutating command goes through.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use tokio::sync::watch;
use tokio::time::{Instant, interval_at};
use tracing::{debug, error, warn};

use super::lock::{LOCK_RENEWAL_INTERVAL, LockInfo};
use super::types::AppliedState;
use crate::error::{Result, StateError, StratumError};

/// Trait for state storage backends.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the applied state.
    ///
    /// Returns `None` if no state exists yet.
    async fn load(&self) -> Result<Option<AppliedState>>;

    /// Saves the applied state atomically.
    async fn save(&self, state: &AppliedState) -> Result<()>;

    /// Deletes the applied state.
    async fn delete(&self) -> Result<()>;

    /// Checks if state exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires the state lock.
    ///
    /// Fails with `StateError::LockedByOther` while another holder's lease is live.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Extends the lease of a lock this process holds.
    async fn renew_lock(&self, lock_id: &str) -> Result<LockInfo>;

    /// Releases a lock this process holds. Releasing someone else's lock is an error.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Removes the lock regardless of holder and returns what was removed.
    async fn force_release_lock(&self) -> Result<Option<LockInfo>>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the state is locked by a live lease.
    async fn is_locked(&self) -> Result<bool>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn load(&self) -> Result<Option<AppliedState>> {
        (**self).load().await
    }

    async fn save(&self, state: &AppliedState) -> Result<()> {
        (**self).save(state).await
    }

    async fn delete(&self) -> Result<()> {
        (**self).delete().await
    }

    async fn exists(&self) -> Result<bool> {
        (**self).exists().await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder).await
    }

    async fn renew_lock(&self, lock_id: &str) -> Result<LockInfo> {
        (**self).renew_lock(lock_id).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn force_release_lock(&self) -> Result<Option<LockInfo>> {
        (**self).force_release_lock().await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).get_lock_info().await
    }

    async fn is_locked(&self) -> Result<bool> {
        (**self).is_locked().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}

/// The lease behind a lock held by the body of [`with_lock`].
///
/// Anything that writes state must call [`LeaseGuard::ensure_held`] first.
#[derive(Debug, Clone)]
pub struct LeaseGuard {
    lock: LockInfo,
    lease: watch::Receiver<Lease>,
}

#[derive(Debug, Clone)]
enum Lease {
    Held { expires_at: DateTime<Utc> },
    Lost(String),
}

impl LeaseGuard {
    /// The lock as acquired.
    #[must_use]
    pub const fn info(&self) -> &LockInfo {
        &self.lock
    }

    /// Checks that the lease is still ours and has not run out.
    ///
    /// # Errors
    ///
    /// Returns `StateError::LockLost` once the lease expired or another
    /// holder took the lock over.
    pub fn ensure_held(&self) -> Result<()> {
        let reason = match &*self.lease.borrow() {
            Lease::Held { expires_at } if Utc::now() < *expires_at => return Ok(()),
            Lease::Held { expires_at } => format!("lease expired at {}", expires_at.to_rfc3339()),
            Lease::Lost(reason) => reason.clone(),
        };
        Err(StateError::LockLost {
            lock_id: self.lock.lock_id.clone(),
            reason,
        }
        .into())
    }
}

/// Runs `body` while holding the state lock.
///
/// The lease is renewed every [`LOCK_RENEWAL_INTERVAL`] until `body` finishes,
/// and the lock is released whether `body` succeeds or fails. A release
/// failure is reported only when `body` itself succeeded.
///
/// A renewal that finds the lock taken over or gone, or that fails after the
/// lease ran out, marks the lease lost: [`LeaseGuard::ensure_held`] fails
/// from then on and a successful `body` is turned into `StateError::LockLost`.
/// Actions already running inside `body` are left to finish.
///
/// # Errors
///
/// Returns the lock acquisition error, the error from `body`, a lost lease,
/// or the release error.
pub async fn with_lock<S, F, Fut, T>(store: &S, holder: &str, body: F) -> Result<T>
where
    S: StateStore + ?Sized,
    F: FnOnce(LeaseGuard) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let lock = store.acquire_lock(holder).await?;
    let lock_id = lock.lock_id.clone();
    debug!("Acquired state lock {lock_id}");

    let (lease_tx, lease_rx) = watch::channel(Lease::Held {
        expires_at: lock.expires_at,
    });
    let guard = LeaseGuard {
        lock,
        lease: lease_rx,
    };

    let outcome = {
        let body = body(guard.clone());
        tokio::pin!(body);
        let mut heartbeat = interval_at(
            Instant::now() + LOCK_RENEWAL_INTERVAL,
            LOCK_RENEWAL_INTERVAL,
        );
        let mut lost = false;

        loop {
            tokio::select! {
                result = &mut body => break result,
                _ = heartbeat.tick(), if !lost => {
                    match store.renew_lock(&lock_id).await {
                        Ok(renewed) => {
                            debug!("Renewed state lock until {}", renewed.expires_at);
                            lease_tx.send_replace(Lease::Held {
                                expires_at: renewed.expires_at,
                            });
                        }
                        Err(e) if lease_is_gone(&e) || guard.ensure_held().is_err() => {
                            error!("Lost state lock {lock_id}: {e}");
                            lease_tx.send_replace(Lease::Lost(e.to_string()));
                            lost = true;
                        }
                        Err(e) => warn!("Failed to renew state lock {lock_id}: {e}"),
                    }
                }
            }
        }
    };
    let outcome = match (outcome, guard.ensure_held()) {
        (Ok(_), Err(e)) => Err(e),
        (outcome, _) => outcome,
    };

    match store.release_lock(&lock_id).await {
        Ok(()) => {
            debug!("Released state lock {lock_id}");
            outcome
        }
        Err(e) if outcome.is_ok() => Err(e),
        Err(e) => {
            warn!("Failed to release state lock {lock_id}: {e}");
            outcome
        }
    }
}

/// Renewal errors that mean someone else owns the lock now, or nobody does.
fn lease_is_gone(error: &StratumError) -> bool {
    matches!(
        error,
        StratumError::State(StateError::LockedByOther { .. } | StateError::LockLost { .. })
    )
}

//! S3-based state storage backend.
//!
//! This module provides remote state storage using AWS S3 (or compatible
//! services) for shared stacks. The lock object is created with a conditional
//! `If-None-Match: *` put so two writers cannot both believe they hold it.
//! An expired lock is deleted only if a fresh read still shows the same lease,
//! and a taker reads the lock back to confirm it won.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::ProvideErrorMetadata;
use tracing::{debug, info, warn};

use crate::error::{Result, StateError, StratumError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
use super::store::StateStore;
use super::types::AppliedState;

/// State file key suffix.
const STATE_KEY: &str = "state.json";

/// Lock file key suffix.
const LOCK_KEY: &str = "state.lock";

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix, empty or ending in `/`.
    prefix: String,
}

impl S3StateStore {
    /// Creates a new S3 state store from the ambient AWS configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Ok(Self::with_client(Client::new(&config), bucket, prefix))
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    /// Gets the full S3 key for a file.
    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    /// Gets an object from S3.
    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let bytes = response
                    .body
                    .collect()
                    .await
                    .map_err(|e| StateError::s3(format!("Failed to read S3 object: {e}")))?;

                let content = String::from_utf8(bytes.to_vec())
                    .map_err(|e| StateError::corrupted(format!("Invalid UTF-8 in S3 object: {e}")))?;

                Ok(Some(content))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StateError::s3(format!("S3 get error: {service_err}")).into())
                }
            }
        }
    }

    /// Puts an object to S3.
    async fn put_object(&self, key: &str, content: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| StateError::s3(format!("S3 put error: {e}")))?;

        Ok(())
    }

    /// Puts an object only if no object exists under `key`.
    ///
    /// Returns `false` when the precondition failed.
    async fn put_object_if_absent(&self, key: &str, content: &str) -> Result<bool> {
        let result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .if_none_match("*")
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json")
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                match service_err.code() {
                    Some("PreconditionFailed" | "ConditionalRequestConflict") => Ok(false),
                    _ => Err(StateError::s3(format!("S3 conditional put error: {service_err}")).into()),
                }
            }
        }
    }

    /// Deletes an object from S3.
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StateError::s3(format!("S3 delete error: {e}")))?;

        Ok(())
    }

    /// Checks if an object exists in S3.
    async fn object_exists(&self, key: &str) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(StateError::s3(format!("S3 head error: {service_err}")).into())
                }
            }
        }
    }

    /// Deletes the lock object if it still holds the `expired` lease.
    ///
    /// A renewal or a successor written since `expired` was read is left alone.
    async fn retire_expired_lock(&self, expired: &LockInfo) -> Result<()> {
        match self.read_lock().await? {
            Some(current) if current.same_lease(expired) => {
                warn!(
                    "Taking over expired lock held by {} since {}",
                    expired.holder, expired.acquired_at
                );
                self.delete_object(&self.key(LOCK_KEY)).await
            }
            Some(current) => {
                debug!("Lock changed to {} before takeover", current.lock_id);
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn read_lock(&self) -> Result<Option<LockInfo>> {
        let Some(content) = self.get_object(&self.key(LOCK_KEY)).await? else {
            return Ok(None);
        };
        let lock_info = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse lock: {e}")))?;
        Ok(Some(lock_info))
    }
}

/// Normalizes a key prefix to empty or `segment/.../`.
fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() {
                String::new()
            } else {
                format!("{p}/")
            }
        })
        .unwrap_or_default()
}

fn serialize_lock(lock_info: &LockInfo) -> Result<String> {
    serde_json::to_string_pretty(lock_info)
        .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")).into())
}

fn locked_by(existing: &LockInfo) -> StratumError {
    StratumError::State(StateError::LockedByOther {
        holder: existing.holder.clone(),
        since: existing.acquired_at.to_rfc3339(),
        expires: existing.expires_at.to_rfc3339(),
    })
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self) -> Result<Option<AppliedState>> {
        let key = self.key(STATE_KEY);
        debug!("Loading state from s3://{}/{key}", self.bucket);

        let Some(json) = self.get_object(&key).await? else {
            debug!("No state found in S3");
            return Ok(None);
        };

        let state: AppliedState = serde_json::from_str(&json)
            .map_err(|e| StateError::corrupted(format!("Failed to parse state: {e}")))?;
        state.validate()?;

        info!(
            "Loaded state for stack: {}/{} (serial {})",
            state.stack, state.environment, state.serial
        );
        Ok(Some(state))
    }

    async fn save(&self, state: &AppliedState) -> Result<()> {
        let key = self.key(STATE_KEY);
        info!("Saving state to s3://{}/{key}", self.bucket);

        let content = serde_json::to_string_pretty(state)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;

        // A single PUT replaces the object atomically.
        self.put_object(&key, &content).await?;

        debug!("State saved successfully to S3");
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        let state_key = self.key(STATE_KEY);
        info!("Deleting state from s3://{}/{state_key}", self.bucket);
        self.delete_object(&state_key).await
    }

    async fn exists(&self) -> Result<bool> {
        self.object_exists(&self.key(STATE_KEY)).await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let key = self.key(LOCK_KEY);
        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let lock_info = LockInfo::new(&holder_id);
        let content = serialize_lock(&lock_info)?;

        if !self.put_object_if_absent(&key, &content).await? {
            match self.read_lock().await? {
                Some(existing) if !existing.is_expired() => return Err(locked_by(&existing)),
                Some(existing) => self.retire_expired_lock(&existing).await?,
                None => {}
            }

            // Another taker won between the delete and the put.
            if !self.put_object_if_absent(&key, &content).await? {
                return match self.read_lock().await? {
                    Some(existing) => Err(locked_by(&existing)),
                    None => Err(StateError::LockFailed {
                        message: String::from("Lock object changed during acquisition"),
                    }
                    .into()),
                };
            }

            match self.read_lock().await? {
                Some(current) if current.lock_id == lock_info.lock_id => {}
                Some(current) => return Err(locked_by(&current)),
                None => {
                    return Err(StateError::LockLost {
                        lock_id: lock_info.lock_id.clone(),
                        reason: String::from("the lock object disappeared during takeover"),
                    }
                    .into());
                }
            }
        }

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn renew_lock(&self, lock_id: &str) -> Result<LockInfo> {
        match self.read_lock().await? {
            Some(mut existing) if existing.lock_id == lock_id => {
                existing.refresh();
                self.put_object(&self.key(LOCK_KEY), &serialize_lock(&existing)?)
                    .await?;
                Ok(existing)
            }
            Some(existing) => Err(locked_by(&existing)),
            None => Err(StateError::LockLost {
                lock_id: lock_id.to_string(),
                reason: String::from("the lock no longer exists"),
            }
            .into()),
        }
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        match self.read_lock().await? {
            Some(existing) if existing.lock_id == lock_id => {
                self.delete_object(&self.key(LOCK_KEY)).await?;
                info!("Released state lock: {lock_id}");
                Ok(())
            }
            Some(existing) => Err(StateError::LockFailed {
                message: format!(
                    "Lock {lock_id} is not the current lock (held by {} as {})",
                    existing.holder, existing.lock_id
                ),
            }
            .into()),
            None => {
                debug!("Lock {lock_id} already released");
                Ok(())
            }
        }
    }

    async fn force_release_lock(&self) -> Result<Option<LockInfo>> {
        let existing = self.read_lock().await?;
        if let Some(lock) = &existing {
            warn!("Force-releasing state lock held by {}", lock.holder);
            self.delete_object(&self.key(LOCK_KEY)).await?;
        }
        Ok(existing)
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock().await
    }

    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .read_lock()
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

//! Local file-based state storage backend.
//!
//! State lives in `.stratum/state.json` next to the stack file. Writes go to a
//! temporary file that is synced and renamed over the old state, so a crash
//! leaves either the old or the new state, never a torn one. The lock file is
//! written aside and hard-linked into place, which makes acquisition atomic on
//! one machine and never exposes a half-written lock.
//! An expired lock is renamed to a unique tombstone before it is replaced, so
//! of several processes taking over the same expired lock only one succeeds.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, StateError, StratumError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
use super::store::StateStore;
use super::types::AppliedState;

/// Default state directory name.
pub const STATE_DIR: &str = ".stratum";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Reads of the lock file after a takeover before giving up on it.
const CONFIRM_ATTEMPTS: usize = 5;

/// Pause between those reads.
const CONFIRM_DELAY: Duration = Duration::from_millis(20);

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
}

impl LocalStateStore {
    /// Creates a local state store in `.stratum/` under the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| StratumError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
        }
    }

    /// Creates a new local state store from a custom state file path.
    ///
    /// The lock file sits next to the state file.
    #[must_use]
    pub fn with_state_path(state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let base_dir = state_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
        }
    }

    /// Returns the path of the state file.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir)
                .await
                .map_err(|e| StateError::storage(format!("Failed to create state directory: {e}")))?;
        }
        Ok(())
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        read_lock_at(&self.lock_path).await
    }

    /// Creates the lock file, failing if it already exists.
    ///
    /// Returns `false` when another lock file is present.
    async fn create_lock_file(&self, lock_info: &LockInfo) -> Result<bool> {
        self.ensure_dir().await?;
        let content = serde_json::to_string_pretty(lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        // Linking a fully written file publishes the lock only if none exists.
        let staged = self
            .base_dir
            .join(format!("{LOCK_FILE}.new-{}", Uuid::new_v4()));
        let written = async {
            let mut file = fs::File::create(&staged).await?;
            write_synced(&mut file, content.as_bytes()).await?;
            fs::hard_link(&staged, &self.lock_path).await
        }
        .await;
        if let Err(e) = fs::remove_file(&staged).await
            && e.kind() != ErrorKind::NotFound
        {
            warn!("Failed to remove {}: {e}", staged.display());
        }

        match written {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(StateError::LockFailed {
                message: format!("Failed to create lock file: {e}"),
            }
            .into()),
        }
    }

    /// Overwrites the lock file through a temp file and rename.
    async fn replace_lock_file(&self, lock_info: &LockInfo) -> Result<()> {
        let content = serde_json::to_string_pretty(lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
        write_atomic(&self.lock_path, content.as_bytes())
            .await
            .map_err(|e| StateError::LockFailed {
                message: format!("Failed to write lock file: {e}"),
            })?;
        Ok(())
    }

    /// Moves an expired lock file aside under a unique name.
    ///
    /// Returns `true` only when the file moved was `expired` itself. A racer
    /// may have replaced it since it was read; that lock is put back.
    async fn retire_expired_lock(&self, expired: &LockInfo) -> Result<bool> {
        let tombstone = self
            .base_dir
            .join(format!("{LOCK_FILE}.expired-{}", Uuid::new_v4()));
        match fs::rename(&self.lock_path, &tombstone).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(StateError::LockFailed {
                    message: format!("Failed to move expired lock aside: {e}"),
                }
                .into());
            }
        }

        let moved = read_lock_at(&tombstone).await?;
        let retired = moved.as_ref().is_some_and(|lock| lock.same_lease(expired));
        if !retired {
            // hard_link refuses to overwrite a lock created in the meantime.
            match fs::hard_link(&tombstone, &self.lock_path).await {
                Ok(()) => debug!("Restored lock moved aside during takeover"),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    warn!("Lock replaced while restoring it; the displaced holder loses its lease");
                }
                Err(e) => {
                    return Err(StateError::LockFailed {
                        message: format!("Failed to restore lock file: {e}"),
                    }
                    .into());
                }
            }
        }

        if let Err(e) = fs::remove_file(&tombstone).await {
            warn!("Failed to remove {}: {e}", tombstone.display());
        }
        Ok(retired)
    }

    /// Checks that the lock file holds `lock_info` after a takeover.
    async fn confirm_lock(&self, lock_info: &LockInfo) -> Result<()> {
        for _ in 0..CONFIRM_ATTEMPTS {
            match self.read_lock_file().await? {
                Some(current) if current.lock_id == lock_info.lock_id => return Ok(()),
                Some(current) => return Err(locked_by(&current)),
                // Another taker may have it aside and is restoring it.
                None => tokio::time::sleep(CONFIRM_DELAY).await,
            }
        }
        Err(StateError::LockLost {
            lock_id: lock_info.lock_id.clone(),
            reason: String::from("the lock file disappeared during takeover"),
        }
        .into())
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self) -> Result<()> {
        match fs::remove_file(&self.lock_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            }
            .into()),
        }
    }
}

/// Reads and parses a lock file at `path`.
async fn read_lock_at(path: &Path) -> Result<Option<LockInfo>> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(StateError::LockFailed {
                message: format!("Failed to read lock file: {e}"),
            }
            .into());
        }
    };

    let lock_info: LockInfo = serde_json::from_str(&content)
        .map_err(|e| StateError::corrupted(format!("Failed to parse lock file: {e}")))?;

    Ok(Some(lock_info))
}

/// Writes and fsyncs an open file.
async fn write_synced(file: &mut fs::File, content: &[u8]) -> std::io::Result<()> {
    file.write_all(content).await?;
    file.sync_all().await
}

/// Writes `content` to `<path>.tmp`, syncs it, and renames it over `path`.
async fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut temp_path = path.as_os_str().to_owned();
    temp_path.push(".tmp");
    let temp_path = PathBuf::from(temp_path);
    let mut file = fs::File::create(&temp_path).await?;
    write_synced(&mut file, content).await?;
    fs::rename(&temp_path, path).await
}

fn locked_by(existing: &LockInfo) -> StratumError {
    StratumError::State(StateError::LockedByOther {
        holder: existing.holder.clone(),
        since: existing.acquired_at.to_rfc3339(),
        expires: existing.expires_at.to_rfc3339(),
    })
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<AppliedState>> {
        let content = match fs::read_to_string(&self.state_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("State file does not exist: {}", self.state_path.display());
                return Ok(None);
            }
            Err(e) => {
                return Err(StateError::storage(format!("Failed to read state file: {e}")).into());
            }
        };

        info!("Loading state from: {}", self.state_path.display());

        let state: AppliedState = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse state file: {e}")))?;
        state.validate()?;

        Ok(Some(state))
    }

    async fn save(&self, state: &AppliedState) -> Result<()> {
        self.ensure_dir().await?;

        info!("Saving state to: {}", self.state_path.display());

        let content = serde_json::to_string_pretty(state)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;

        write_atomic(&self.state_path, content.as_bytes())
            .await
            .map_err(|e| StateError::storage(format!("Failed to write state file: {e}")))?;

        debug!("State saved successfully (serial {})", state.serial);
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.state_path).await {
            Ok(()) => info!("Deleted state file: {}", self.state_path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(StateError::storage(format!("Failed to delete state file: {e}")).into());
            }
        }
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let lock_info = LockInfo::new(&holder_id);

        if !self.create_lock_file(&lock_info).await? {
            match self.read_lock_file().await? {
                Some(existing) if !existing.is_expired() => return Err(locked_by(&existing)),
                Some(existing) => {
                    if self.retire_expired_lock(&existing).await? {
                        warn!(
                            "Took over expired lock held by {} since {}",
                            existing.holder, existing.acquired_at
                        );
                    }
                }
                None => {}
            }

            // Another taker won between the retire and the create.
            if !self.create_lock_file(&lock_info).await? {
                return match self.read_lock_file().await? {
                    Some(existing) => Err(locked_by(&existing)),
                    None => Err(StateError::LockFailed {
                        message: String::from("Lock file changed during acquisition"),
                    }
                    .into()),
                };
            }
            self.confirm_lock(&lock_info).await?;
        }

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn renew_lock(&self, lock_id: &str) -> Result<LockInfo> {
        match self.read_lock_file().await? {
            Some(mut existing) if existing.lock_id == lock_id => {
                existing.refresh();
                self.replace_lock_file(&existing).await?;
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
        match self.read_lock_file().await? {
            Some(existing) if existing.lock_id == lock_id => {
                self.delete_lock_file().await?;
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
        let existing = self.read_lock_file().await?;
        if let Some(lock) = &existing {
            warn!("Force-releasing state lock held by {}", lock.holder);
            self.delete_lock_file().await?;
        }
        Ok(existing)
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .read_lock_file()
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path().join(STATE_DIR));
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, _temp) = create_test_store();

        let mut state = AppliedState::new("image-analysis", "dev");
        state.touch();
        store.save(&state).await.expect("Failed to save state");

        let loaded = store
            .load()
            .await
            .expect("Failed to load state")
            .expect("State should exist");

        assert_eq!(loaded.stack, "image-analysis");
        assert_eq!(loaded.environment, "dev");
        assert_eq!(loaded.serial, state.serial);
        assert_eq!(loaded.lineage, state.lineage);
        assert!(!store.state_path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (store, _temp) = create_test_store();

        let result = store.load().await.expect("Load should not fail");
        assert!(result.is_none());
        assert!(!store.exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupted_state_is_rejected() {
        let (store, _temp) = create_test_store();
        store.ensure_dir().await.unwrap();
        fs::write(store.state_path(), "{ not json").await.unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, StratumError::State(StateError::Corrupted { .. })));
    }

    #[tokio::test]
    async fn test_unknown_version_is_rejected() {
        let (store, _temp) = create_test_store();
        let mut state = AppliedState::new("image-analysis", "dev");
        state.version = String::from("99");
        store.save(&state).await.unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(
            err,
            StratumError::State(StateError::VersionMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = assert_ok!(store.acquire_lock("test-holder").await);
        assert!(assert_ok!(store.is_locked().await));

        assert_ok!(store.release_lock(&lock.lock_id).await);
        assert!(!assert_ok!(store.is_locked().await));
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let (store, _temp) = create_test_store();

        let _lock1 = store
            .acquire_lock("holder-1")
            .await
            .expect("Failed to acquire first lock");

        let err = assert_err!(store.acquire_lock("holder-2").await);
        assert!(matches!(
            err,
            StratumError::State(StateError::LockedByOther { ref holder, .. }) if holder == "holder-1"
        ));
    }

    #[tokio::test]
    async fn test_expired_lock_taken_over() {
        let (store, _temp) = create_test_store();
        let mut stale = LockInfo::new("crashed");
        stale.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        assert!(store.create_lock_file(&stale).await.unwrap());
        assert!(!store.is_locked().await.unwrap());

        let lock = store.acquire_lock("fresh").await.unwrap();
        let current = store.get_lock_info().await.unwrap().unwrap();
        assert_eq!(current.lock_id, lock.lock_id);
        assert_eq!(current.holder, "fresh");
    }

    #[tokio::test]
    async fn test_concurrent_takeover_has_one_winner() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(STATE_DIR);
        let first = LocalStateStore::with_base_dir(&dir);
        let second = LocalStateStore::with_base_dir(&dir);

        let mut stale = LockInfo::new("crashed");
        stale.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        assert!(first.create_lock_file(&stale).await.unwrap());

        let (a, b) = tokio::join!(first.acquire_lock("first"), second.acquire_lock("second"));
        let winner = match (a, b) {
            (Ok(lock), Err(err)) | (Err(err), Ok(lock)) => {
                assert!(matches!(
                    err,
                    StratumError::State(StateError::LockedByOther { .. } | StateError::LockFailed { .. })
                ));
                lock
            }
            (a, b) => panic!("expected exactly one holder, got {a:?} and {b:?}"),
        };

        let current = first.get_lock_info().await.unwrap().unwrap();
        assert_eq!(current.lock_id, winner.lock_id);

        let mut leftovers = fs::read_dir(&dir).await.unwrap();
        while let Some(entry) = leftovers.next_entry().await.unwrap() {
            let name = entry.file_name();
            assert!(!name.to_string_lossy().contains("expired"), "{name:?} left behind");
        }
    }

    #[tokio::test]
    async fn test_takeover_leaves_a_renewed_lock_alone() {
        let (store, _temp) = create_test_store();
        let mut stale = LockInfo::new("slow");
        stale.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        assert!(store.create_lock_file(&stale).await.unwrap());

        // The holder renews between the taker's read and its retire.
        let mut renewed = stale.clone();
        renewed.refresh();
        store.replace_lock_file(&renewed).await.unwrap();

        assert!(!store.retire_expired_lock(&stale).await.unwrap());
        let current = store.get_lock_info().await.unwrap().unwrap();
        assert_eq!(current, renewed);
    }

    #[tokio::test]
    async fn test_renew_and_foreign_release() {
        let (store, _temp) = create_test_store();
        let lock = store.acquire_lock("holder").await.unwrap();

        let renewed = store.renew_lock(&lock.lock_id).await.unwrap();
        assert!(renewed.expires_at >= lock.expires_at);

        assert!(store.release_lock("someone-else").await.is_err());
        assert!(store.renew_lock("someone-else").await.is_err());
        assert!(store.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_force_release() {
        let (store, _temp) = create_test_store();
        assert!(store.force_release_lock().await.unwrap().is_none());

        let lock = store.acquire_lock("holder").await.unwrap();
        let removed = store.force_release_lock().await.unwrap().unwrap();
        assert_eq!(removed.lock_id, lock.lock_id);
        assert!(!store.is_locked().await.unwrap());
    }
}

//! Local file-based state storage backend.
//!
//! Each resource's record lives in its own file under
//! `<base>/resources/<kind>/<name>.json`, so commits for different resources
//! never touch the same file. Writes go to a temporary file which is synced
//! and renamed over the record.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, StateError, TerraceError};
use crate::graph::ResourceId;

use super::lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS};
use super::store::StateStore;
use super::types::{StateRecord, StateSnapshot, STATE_VERSION};

/// Default state directory name.
pub const STATE_DIR: &str = ".terrace";

/// Directory holding per-resource records.
const RESOURCES_DIR: &str = "resources";

/// Lock file name.
const LOCK_FILE: &str = "run.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Per-resource write guards.
    guards: Mutex<HashMap<ResourceId, Arc<tokio::sync::Mutex<()>>>>,
}

impl LocalStateStore {
    /// Creates a new local state store under `./.terrace`.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| TerraceError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            guards: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the base directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path of the record file for a resource.
    #[must_use]
    pub fn record_path(&self, id: &ResourceId) -> PathBuf {
        self.base_dir
            .join(RESOURCES_DIR)
            .join(&id.kind)
            .join(format!("{}.json", id.name))
    }

    fn lock_path(&self) -> PathBuf {
        self.base_dir.join(LOCK_FILE)
    }

    /// Returns the write guard for one resource.
    fn guard(&self, id: &ResourceId) -> Arc<tokio::sync::Mutex<()>> {
        let mut guards = self.guards.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(guards.entry(id.clone()).or_default())
    }

    /// Writes `content` to `path` through a synced temporary file.
    async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                StateError::write(format!("Failed to create {}: {e}", parent.display()))
            })?;
        }

        let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));

        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            StateError::write(format!("Failed to create {}: {e}", temp_path.display()))
        })?;
        file.write_all(content).await.map_err(|e| {
            StateError::write(format!("Failed to write {}: {e}", temp_path.display()))
        })?;
        file.sync_all().await.map_err(|e| {
            StateError::write(format!("Failed to sync {}: {e}", temp_path.display()))
        })?;
        drop(file);

        fs::rename(&temp_path, path).await.map_err(|e| {
            StateError::write(format!("Failed to rename onto {}: {e}", path.display()))
        })?;
        Ok(())
    }

    async fn read_record(path: &Path) -> Result<StateRecord> {
        let content = fs::read_to_string(path).await.map_err(|e| {
            StateError::corrupted(format!("Failed to read {}: {e}", path.display()))
        })?;

        let record: StateRecord = serde_json::from_str(&content).map_err(|e| {
            StateError::corrupted(format!("Failed to parse {}: {e}", path.display()))
        })?;

        if record.version != STATE_VERSION {
            return Err(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: record.version,
            }
            .into());
        }

        Ok(record)
    }

    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        let path = self.lock_path();
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path).await.map_err(|e| {
            StateError::corrupted(format!("Failed to read lock file: {e}"))
        })?;
        let lock_info = serde_json::from_str(&content).map_err(|e| {
            StateError::corrupted(format!("Failed to parse lock file: {e}"))
        })?;
        Ok(Some(lock_info))
    }

    async fn delete_lock_file(&self) -> Result<()> {
        let path = self.lock_path();
        if path.exists() {
            fs::remove_file(&path).await.map_err(|e| StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<StateSnapshot> {
        let root = self.base_dir.join(RESOURCES_DIR);
        let mut snapshot = StateSnapshot::new();

        if !root.exists() {
            debug!("No state directory at {}", root.display());
            return Ok(snapshot);
        }

        info!("Loading state from: {}", root.display());

        let mut kinds = fs::read_dir(&root)
            .await
            .map_err(|e| StateError::corrupted(format!("Failed to list {}: {e}", root.display())))?;

        while let Some(kind_dir) = kinds
            .next_entry()
            .await
            .map_err(|e| StateError::corrupted(format!("Failed to list state: {e}")))?
        {
            if !kind_dir.path().is_dir() {
                continue;
            }

            let mut files = fs::read_dir(kind_dir.path())
                .await
                .map_err(|e| StateError::corrupted(format!("Failed to list state: {e}")))?;

            while let Some(entry) = files
                .next_entry()
                .await
                .map_err(|e| StateError::corrupted(format!("Failed to list state: {e}")))?
            {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                        warn!("Ignoring leftover temporary file {}", path.display());
                    }
                    continue;
                }

                let record = Self::read_record(&path).await?;
                snapshot.insert(record.id.clone(), record);
            }
        }

        debug!("Loaded {} state records", snapshot.len());
        Ok(snapshot)
    }

    async fn commit(&self, id: &ResourceId, record: &StateRecord) -> Result<()> {
        id.validate()
            .map_err(|e| StateError::write(format!("Refusing to store {id}: {e}")))?;
        let guard = self.guard(id);
        let _held = guard.lock().await;

        let content = serde_json::to_vec_pretty(record)
            .map_err(|e| StateError::serialization(format!("Failed to serialize {id}: {e}")))?;

        Self::write_atomic(&self.record_path(id), &content).await?;
        debug!("Committed state for {id}");
        Ok(())
    }

    async fn remove(&self, id: &ResourceId) -> Result<()> {
        id.validate()
            .map_err(|e| StateError::write(format!("Refusing to remove {id}: {e}")))?;
        let guard = self.guard(id);
        let _held = guard.lock().await;

        let path = self.record_path(id);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Removed state for {id}");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::write(format!("Failed to remove {}: {e}", path.display())).into()),
        }
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock_file().await? {
            if !existing.is_expired() {
                return Err(StateError::LockedByOther {
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                }
                .into());
            }
            debug!("Expired lock held by {} found, taking over", existing.holder);
        }

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };

        let lock_info = LockInfo::new(&holder_id);
        let content = serde_json::to_vec_pretty(&lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
        Self::write_atomic(&self.lock_path(), &content)
            .await
            .map_err(|e| StateError::LockFailed {
                message: e.to_string(),
            })?;

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );
        Ok(lock_info)
    }

    async fn renew_lock(&self, lock_id: &str) -> Result<LockInfo> {
        let held = self
            .read_lock_file()
            .await?
            .filter(|existing| existing.lock_id == lock_id)
            .ok_or_else(|| StateError::LockLost {
                lock_id: lock_id.to_string(),
            })?;

        let renewed = held.renewed();
        let content = serde_json::to_vec_pretty(&renewed)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
        Self::write_atomic(&self.lock_path(), &content)
            .await
            .map_err(|e| StateError::LockFailed {
                message: e.to_string(),
            })?;

        debug!("Renewed state lock {lock_id} until {}", renewed.expires_at);
        Ok(renewed)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

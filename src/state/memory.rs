//! In-memory state storage backend.
//!
//! Used for embedding the engine in other programs and in tests. Nothing
//! survives the process.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::{Result, StateError};
use crate::graph::ResourceId;

use super::lock::LockInfo;
use super::store::StateStore;
use super::types::{StateRecord, StateSnapshot};

/// In-memory state store.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: RwLock<HashMap<ResourceId, StateRecord>>,
    lock: RwLock<Option<LockInfo>>,
    commits: RwLock<Vec<ResourceId>>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store seeded with records.
    #[must_use]
    pub fn with_records(records: impl IntoIterator<Item = StateRecord>) -> Self {
        let records = records.into_iter().map(|r| (r.id.clone(), r)).collect();
        Self {
            records: RwLock::new(records),
            ..Self::default()
        }
    }

    /// Resources committed so far, in commit order.
    pub async fn commit_log(&self) -> Vec<ResourceId> {
        self.commits.read().await.clone()
    }

    /// Returns the record of one resource.
    pub async fn get(&self, id: &ResourceId) -> Option<StateRecord> {
        self.records.read().await.get(id).cloned()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<StateSnapshot> {
        Ok(self.records.read().await.clone())
    }

    async fn commit(&self, id: &ResourceId, record: &StateRecord) -> Result<()> {
        self.records.write().await.insert(id.clone(), record.clone());
        self.commits.write().await.push(id.clone());
        Ok(())
    }

    async fn remove(&self, id: &ResourceId) -> Result<()> {
        self.records.write().await.remove(id);
        Ok(())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let mut lock = self.lock.write().await;
        if let Some(existing) = lock.as_ref().filter(|l| !l.is_expired()) {
            return Err(StateError::LockedByOther {
                holder: existing.holder.clone(),
                since: existing.acquired_at.to_rfc3339(),
            }
            .into());
        }
        let info = LockInfo::new(holder);
        *lock = Some(info.clone());
        Ok(info)
    }

    async fn renew_lock(&self, lock_id: &str) -> Result<LockInfo> {
        let mut lock = self.lock.write().await;
        match lock.as_mut().filter(|l| l.lock_id == lock_id) {
            Some(held) => {
                *held = held.renewed();
                Ok(held.clone())
            }
            None => Err(StateError::LockLost {
                lock_id: lock_id.to_string(),
            }
            .into()),
        }
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let mut lock = self.lock.write().await;
        if lock.as_ref().is_some_and(|l| l.lock_id == lock_id) {
            *lock = None;
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.lock.read().await.clone())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

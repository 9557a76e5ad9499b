//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.
//! Records are addressed per resource so independent steps can commit
//! concurrently without touching each other's data.

use async_trait::async_trait;

use crate::error::Result;
use crate::graph::ResourceId;

use super::lock::LockInfo;
use super::types::{StateRecord, StateSnapshot};

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads every state record.
    async fn load(&self) -> Result<StateSnapshot>;

    /// Durably stores the record of one resource.
    ///
    /// Returns only once the write is durable. Commits for distinct
    /// resources may run concurrently.
    async fn commit(&self, id: &ResourceId, record: &StateRecord) -> Result<()>;

    /// Removes the record of one resource. Removing a missing record is not
    /// an error.
    async fn remove(&self, id: &ResourceId) -> Result<()>;

    /// Acquires the run lock.
    ///
    /// Returns lock information if successful.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Pushes out the expiry of a held run lock.
    ///
    /// Fails with [`StateError::LockLost`](crate::error::StateError::LockLost)
    /// if the lock is no longer held under `lock_id`.
    async fn renew_lock(&self, lock_id: &str) -> Result<LockInfo>;

    /// Releases the run lock. Does nothing unless it is held under `lock_id`.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

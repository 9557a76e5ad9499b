//! State management module for Terrace.
//!
//! This module provides persistent, per-resource state storage: the
//! last-applied attributes and provider outputs of every resource, plus the
//! run lock that keeps two applies from racing on the same state.

mod local;
mod lock;
mod memory;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS, LOCK_REFRESH_SECS};
pub use memory::MemoryStateStore;
pub use store::StateStore;
pub use types::{DeposedObject, Outputs, StateRecord, StateSnapshot, STATE_VERSION};

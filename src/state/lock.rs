//! Run lock for the state directory.
//!
//! Only one apply or destroy may mutate a state directory at a time. The
//! lock is advisory and expires so that a crashed run cannot wedge the
//! state forever.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 300;

/// How often a running apply renews its lock.
pub const LOCK_REFRESH_SECS: u64 = LOCK_EXPIRY_SECS.unsigned_abs() / 3;

/// Information about a held run lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates lock info for `holder`, expiring after [`LOCK_EXPIRY_SECS`].
    #[must_use]
    pub fn new(holder: &str) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Returns the same lock with its expiry pushed out again.
    #[must_use]
    pub fn renewed(&self) -> Self {
        Self {
            expires_at: Utc::now() + Duration::seconds(LOCK_EXPIRY_SECS),
            ..self.clone()
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }
}

/// Generates a holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get()
        .map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());
    let pid = std::process::id();
    let suffix = &Uuid::new_v4().simple().to_string()[..8];

    format!("{hostname}-{pid}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_lock_is_live() {
        let lock = LockInfo::new("ci-runner");
        assert_eq!(lock.holder, "ci-runner");
        assert!(!lock.is_expired());
        assert!(lock.remaining_secs() > 0);
    }

    #[test]
    fn test_expired_lock() {
        let mut lock = LockInfo::new("ci-runner");
        lock.expires_at = Utc::now() - Duration::seconds(1);
        assert!(lock.is_expired());
        assert_eq!(lock.remaining_secs(), 0);
    }

    #[test]
    fn test_renewed_keeps_identity() {
        let mut lock = LockInfo::new("ci-runner");
        lock.expires_at = Utc::now() - Duration::seconds(1);

        let renewed = lock.renewed();
        assert_eq!(renewed.lock_id, lock.lock_id);
        assert_eq!(renewed.acquired_at, lock.acquired_at);
        assert!(!renewed.is_expired());
    }

    #[test]
    fn test_holder_id_generation() {
        let id1 = generate_holder_id();
        let id2 = generate_holder_id();

        assert_ne!(id1, id2);
        assert!(id1.contains(&std::process::id().to_string()));
    }
}

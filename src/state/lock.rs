//! Run-scoped state locking.
//!
//! A lock is a small JSON document stored next to the state. It expires
//! after [`LOCK_EXPIRY_SECS`] so a crashed run cannot wedge the state forever;
//! every save refreshes it, and a running executor refreshes it every
//! [`HEARTBEAT_SECS`] while provider calls are in flight.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StateError};

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 300;

/// Interval between lock refreshes during long provider calls.
pub const HEARTBEAT_SECS: u64 = 100;

/// Information about a state lock.
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
    /// Creates a new lock for `holder`, or for this process if `holder` is empty.
    #[must_use]
    pub fn new(holder: &str) -> Self {
        let holder = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder,
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Refreshes the lock expiry time.
    pub fn refresh(&mut self) {
        self.expires_at = Utc::now() + chrono::Duration::seconds(LOCK_EXPIRY_SECS);
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }

    /// Error describing this lock as held by someone else.
    #[must_use]
    pub fn conflict(&self) -> StateError {
        StateError::LockConflict {
            holder: self.holder.clone(),
            since: self.acquired_at.to_rfc3339(),
        }
    }
}

/// Checks that a fresh lock may be taken given the lock currently stored.
///
/// # Errors
///
/// Returns [`StateError::LockConflict`] if a live lock is present.
pub fn check_available(existing: Option<&LockInfo>) -> Result<()> {
    match existing {
        Some(lock) if !lock.is_expired() => Err(lock.conflict().into()),
        _ => Ok(()),
    }
}

/// Checks that the stored lock belongs to `lock_id` and returns it.
///
/// # Errors
///
/// Returns [`StateError::LockConflict`] if the backend holds no lock or
/// someone else's.
pub fn check_owner(existing: Option<LockInfo>, lock_id: &str) -> Result<LockInfo> {
    match existing {
        Some(lock) if lock.lock_id == lock_id => Ok(lock),
        Some(lock) => Err(lock.conflict().into()),
        None => Err(StateError::LockConflict {
            holder: "<none>".to_string(),
            since: "lock was released".to_string(),
        }
        .into()),
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get()
        .map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = &Uuid::new_v4().to_string()[..8];

    format!("{hostname}-{pid}-{uuid}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CirrusError;

    #[test]
    fn test_lock_creation() {
        let lock = LockInfo::new("ci-runner");
        assert_eq!(lock.holder, "ci-runner");
        assert!(!lock.is_expired());
        assert!(lock.remaining_secs() > 0);
    }

    #[test]
    fn test_empty_holder_gets_process_id() {
        let lock = LockInfo::new("");
        assert!(lock.holder.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_lock_refresh() {
        let mut lock = LockInfo::new("ci-runner");
        lock.expires_at = Utc::now();
        lock.refresh();

        assert!(lock.remaining_secs() > LOCK_EXPIRY_SECS - 5);
    }

    #[test]
    fn test_expired_lock_is_available() {
        let mut stale = LockInfo::new("crashed-run");
        stale.expires_at = Utc::now() - chrono::Duration::seconds(1);

        assert!(check_available(None).is_ok());
        assert!(check_available(Some(&stale)).is_ok());

        let live = LockInfo::new("other-run");
        assert!(matches!(
            check_available(Some(&live)),
            Err(CirrusError::State(StateError::LockConflict { .. }))
        ));
    }

    #[test]
    fn test_check_owner() {
        let lock = LockInfo::new("me");
        let id = lock.lock_id.clone();

        assert!(check_owner(Some(lock.clone()), &id).is_ok());
        assert!(check_owner(Some(lock), "someone-else").is_err());
        assert!(check_owner(None, &id).is_err());
    }

    #[test]
    fn test_holder_id_generation() {
        let id1 = generate_holder_id();
        let id2 = generate_holder_id();

        assert_ne!(id1, id2);
        assert!(id1.contains(&std::process::id().to_string()));
    }
}

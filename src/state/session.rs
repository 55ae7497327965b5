//! Run-scoped access to the state store.
//!
//! A [`StateSession`] owns the state lock for the length of one run. It is
//! the only writer of the snapshot while open; every mutation is persisted
//! immediately so a crash loses at most the provider call in flight, which
//! the pending journal then points at.

use chrono::Utc;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::error::{Result, StateError};

use super::lock::LockInfo;
use super::store::StateStore;
use super::types::{PendingOperation, RunHistoryEntry, STATE_VERSION, StateRecord, StateSnapshot};

/// An open, locked view of the state for one run.
pub struct StateSession<'a> {
    store: &'a dyn StateStore,
    lock: LockInfo,
    snapshot: StateSnapshot,
    closed: bool,
}

impl<'a> StateSession<'a> {
    /// Acquires the lock, then loads the snapshot.
    ///
    /// A fresh snapshot is created for `project`/`environment` when the
    /// store is empty.
    ///
    /// # Errors
    ///
    /// Returns `LockConflict` if another live run holds the lock, or any
    /// load error (after releasing the lock).
    pub async fn open(
        store: &'a dyn StateStore,
        holder: &str,
        project: &str,
        environment: &str,
    ) -> Result<Self> {
        let lock = store.acquire_lock(holder).await?;

        let snapshot = match load_checked(store).await {
            Ok(Some(snapshot)) => {
                if snapshot.project != project || snapshot.environment != environment {
                    warn!(
                        "State belongs to {}/{}, running as {project}/{environment}",
                        snapshot.project, snapshot.environment
                    );
                }
                snapshot
            }
            Ok(None) => StateSnapshot::new(project, environment),
            Err(e) => {
                store.release_lock(&lock.lock_id).await?;
                return Err(e);
            }
        };

        debug!(
            "Opened state session (backend {}, serial {}, {} records)",
            store.backend_type(),
            snapshot.serial,
            snapshot.records.len()
        );

        Ok(Self {
            store,
            lock,
            snapshot,
            closed: false,
        })
    }

    /// All records keyed by name.
    #[must_use]
    pub const fn records(&self) -> &BTreeMap<String, StateRecord> {
        &self.snapshot.records
    }

    /// Gets one record.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&StateRecord> {
        self.snapshot.get(name)
    }

    /// The current snapshot.
    #[must_use]
    pub const fn snapshot(&self) -> &StateSnapshot {
        &self.snapshot
    }

    /// The lock held by this session.
    #[must_use]
    pub const fn lock(&self) -> &LockInfo {
        &self.lock
    }

    /// Persists the snapshot, bumping its serial.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the write.
    pub async fn save(&mut self) -> Result<()> {
        self.snapshot.serial += 1;
        self.snapshot.last_updated = Utc::now();
        self.store.save(&self.snapshot, &self.lock.lock_id).await
    }

    /// Extends the lock without writing the snapshot.
    ///
    /// Called while provider calls are in flight so a long call cannot
    /// outlive the lock.
    ///
    /// # Errors
    ///
    /// Returns `LockConflict` if the lock was taken over.
    pub async fn heartbeat(&mut self) -> Result<()> {
        self.lock = self.store.refresh_lock(&self.lock.lock_id).await?;
        debug!("Lock {} held until {}", self.lock.lock_id, self.lock.expires_at);
        Ok(())
    }

    /// Journals a provider call and saves.
    ///
    /// # Errors
    ///
    /// Returns an error if the save fails.
    pub async fn begin(&mut self, operation: PendingOperation) -> Result<()> {
        self.snapshot.begin(operation);
        self.save().await
    }

    /// Records a successful create or update and clears its journal entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the save fails.
    pub async fn commit(&mut self, record: StateRecord) -> Result<()> {
        self.snapshot.finish(&record.name);
        self.snapshot.upsert(record);
        self.save().await
    }

    /// Removes a deleted resource and clears its journal entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the save fails.
    pub async fn commit_removal(&mut self, name: &str) -> Result<()> {
        self.snapshot.finish(name);
        self.snapshot.remove(name);
        self.save().await
    }

    /// Clears the journal entry of a call that failed without side effects.
    ///
    /// # Errors
    ///
    /// Returns an error if the save fails.
    pub async fn abandon(&mut self, name: &str) -> Result<()> {
        self.snapshot.finish(name);
        self.save().await
    }

    /// Drops every journal entry after an operator inspected them.
    ///
    /// # Errors
    ///
    /// Returns an error if the save fails.
    pub async fn clear_pending(&mut self) -> Result<Vec<String>> {
        let cleared = self.snapshot.pending_resources();
        self.snapshot.pending.clear();
        self.save().await?;
        Ok(cleared)
    }

    /// Appends a history entry and saves.
    ///
    /// # Errors
    ///
    /// Returns an error if the save fails.
    pub async fn record_history(&mut self, entry: RunHistoryEntry) -> Result<()> {
        self.snapshot.add_history(entry);
        self.save().await
    }

    /// Releases the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be released.
    pub async fn close(mut self) -> Result<()> {
        self.closed = true;
        self.store.release_lock(&self.lock.lock_id).await
    }
}

impl Drop for StateSession<'_> {
    fn drop(&mut self) {
        if !self.closed {
            warn!(
                "State session dropped without closing; lock {} stays until it expires",
                self.lock.lock_id
            );
        }
    }
}

impl std::fmt::Debug for StateSession<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSession")
            .field("backend", &self.store.backend_type())
            .field("lock_id", &self.lock.lock_id)
            .field("serial", &self.snapshot.serial)
            .finish_non_exhaustive()
    }
}

async fn load_checked(store: &dyn StateStore) -> Result<Option<StateSnapshot>> {
    let Some(snapshot) = store.load().await? else {
        return Ok(None);
    };

    if snapshot.version != STATE_VERSION {
        return Err(StateError::VersionMismatch {
            expected: STATE_VERSION.to_string(),
            found: snapshot.version,
        }
        .into());
    }

    Ok(Some(snapshot))
}

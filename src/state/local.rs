//! Local file-based state storage backend.
//!
//! State lives in `.cirrus/state.json` next to the stack file, with the
//! run lock in `.cirrus/state.lock`.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{CirrusError, Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, check_available, check_owner};
use super::store::StateStore;
use super::types::StateSnapshot;

/// Default state directory name.
pub const STATE_DIR: &str = ".cirrus";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

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
    /// Creates a local state store under `.cirrus` in the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| CirrusError::internal(format!("Cannot determine current directory: {e}")))?
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
    #[must_use]
    pub fn with_state_path(state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let base_dir = state_path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let lock_path = state_path.with_extension("lock");

        Self {
            base_dir,
            state_path,
            lock_path,
        }
    }

    /// Path of the state file.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                StateError::backend(format!("Failed to create state directory: {e}"))
            })?;
        }
        Ok(())
    }

    /// Writes `content` to `path` through a temporary file and a rename.
    async fn write_atomic(&self, path: &Path, content: &str) -> Result<()> {
        self.ensure_dir().await?;

        let mut temp_path = path.as_os_str().to_owned();
        temp_path.push(".tmp");
        let temp_path = PathBuf::from(temp_path);

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StateError::backend(format!("Failed to create {}: {e}", temp_path.display())))?;

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StateError::backend(format!("Failed to write {}: {e}", temp_path.display())))?;

        file.sync_all()
            .await
            .map_err(|e| StateError::backend(format!("Failed to sync {}: {e}", temp_path.display())))?;

        fs::rename(&temp_path, path)
            .await
            .map_err(|e| StateError::backend(format!("Failed to rename into {}: {e}", path.display())))?;

        Ok(())
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        let content = match fs::read_to_string(&self.lock_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StateError::corrupted(format!("Failed to read lock file: {e}")).into()),
        };

        let lock_info: LockInfo = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse lock file: {e}")))?;

        Ok(Some(lock_info))
    }

    /// Creates the lock file, failing if another process created it first.
    async fn create_lock_file(&self, lock_info: &LockInfo) -> Result<()> {
        let content = serde_json::to_string_pretty(lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return match self.read_lock_file().await? {
                    Some(winner) => Err(winner.conflict().into()),
                    None => Err(StateError::LockFailed {
                        message: "Lock file vanished during acquisition".to_string(),
                    }
                    .into()),
                };
            }
            Err(e) => {
                return Err(StateError::LockFailed {
                    message: format!("Failed to create lock file: {e}"),
                }
                .into());
            }
        };

        file.write_all(content.as_bytes()).await.map_err(|e| StateError::LockFailed {
            message: format!("Failed to write lock file: {e}"),
        })?;

        file.sync_all().await.map_err(|e| StateError::LockFailed {
            message: format!("Failed to sync lock file: {e}"),
        })?;

        Ok(())
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

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        let content = match fs::read_to_string(&self.state_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("State file does not exist: {}", self.state_path.display());
                return Ok(None);
            }
            Err(e) => {
                return Err(StateError::corrupted(format!("Failed to read state file: {e}")).into());
            }
        };

        info!("Loading state from: {}", self.state_path.display());

        let state: StateSnapshot = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse state file: {e}")))?;

        Ok(Some(state))
    }

    async fn save(&self, state: &StateSnapshot, lock_id: &str) -> Result<()> {
        let mut lock = check_owner(self.read_lock_file().await?, lock_id)?;

        debug!("Saving state to: {} (serial {})", self.state_path.display(), state.serial);

        let content = serde_json::to_string_pretty(state)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;
        self.write_atomic(&self.state_path, &content).await?;

        lock.refresh();
        let lock_content = serde_json::to_string_pretty(&lock)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
        self.write_atomic(&self.lock_path, &lock_content).await?;

        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.state_path).await {
            Ok(()) => info!("Deleted state file: {}", self.state_path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(StateError::backend(format!("Failed to delete state file: {e}")).into());
            }
        }

        self.delete_lock_file().await
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        self.ensure_dir().await?;

        let existing = self.read_lock_file().await?;
        check_available(existing.as_ref())?;
        if existing.is_some() {
            debug!("Expired lock found, taking over");
            self.delete_lock_file().await?;
        }

        let lock_info = LockInfo::new(holder);
        self.create_lock_file(&lock_info).await?;

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
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

    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
        let mut lock = check_owner(self.read_lock_file().await?, lock_id)?;
        lock.refresh();

        let content = serde_json::to_string_pretty(&lock)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
        self.write_atomic(&self.lock_path, &content).await?;

        debug!("Refreshed state lock {lock_id} until {}", lock.expires_at);
        Ok(lock)
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    async fn is_locked(&self) -> Result<bool> {
        if let Some(lock_info) = self.read_lock_file().await? {
            return Ok(!lock_info.is_expired());
        }
        Ok(false)
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

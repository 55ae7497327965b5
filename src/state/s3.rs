//! S3-based state storage backend.
//!
//! Remote state for shared environments: `<prefix>/state.json` and
//! `<prefix>/state.lock` in one bucket. Every write is a single PUT, so a
//! reader sees either the previous snapshot or the new one.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use tracing::{debug, info};

use crate::error::{Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, check_available, check_owner};
use super::store::StateStore;
use super::types::StateSnapshot;

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

/// Normalizes a user supplied prefix to `""` or `"a/b/"`.
fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .map(|p| format!("{p}/"))
        .unwrap_or_default()
}

impl S3StateStore {
    /// Creates a new S3 state store from the ambient AWS configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        let config = if let Some(region) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region.to_string()))
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
                    .map_err(|e| StateError::backend(format!("Failed to read S3 object: {e}")))?;

                let content = String::from_utf8(bytes.to_vec())
                    .map_err(|e| StateError::corrupted(format!("Invalid UTF-8 in S3 object: {e}")))?;

                Ok(Some(content))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StateError::backend(format!("S3 get error: {service_err}")).into())
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
            .map_err(|e| StateError::backend(format!("S3 put error: {e}")))?;

        Ok(())
    }

    /// Deletes an object from S3.
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StateError::backend(format!("S3 delete error: {e}")))?;

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
                    Err(StateError::backend(format!("S3 head error: {service_err}")).into())
                }
            }
        }
    }

    /// Writes a lock document.
    async fn put_lock(&self, lock: &LockInfo) -> Result<()> {
        let content = serde_json::to_string_pretty(lock)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
        self.put_object(&self.key(LOCK_KEY), &content).await
    }
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        let key = self.key(STATE_KEY);
        debug!("Loading state from s3://{}/{key}", self.bucket);

        let Some(json) = self.get_object(&key).await? else {
            debug!("No state found in S3");
            return Ok(None);
        };

        let state: StateSnapshot = serde_json::from_str(&json)
            .map_err(|e| StateError::corrupted(format!("Failed to parse state: {e}")))?;

        info!(
            "Loaded state for {}/{} (serial {})",
            state.project, state.environment, state.serial
        );
        Ok(Some(state))
    }

    async fn save(&self, state: &StateSnapshot, lock_id: &str) -> Result<()> {
        let mut lock = check_owner(self.get_lock_info().await?, lock_id)?;

        let key = self.key(STATE_KEY);
        debug!("Saving state to s3://{}/{key} (serial {})", self.bucket, state.serial);

        let content = serde_json::to_string_pretty(state)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;

        self.put_object(&key, &content).await?;

        lock.refresh();
        self.put_lock(&lock).await
    }

    async fn delete(&self) -> Result<()> {
        let state_key = self.key(STATE_KEY);
        let lock_key = self.key(LOCK_KEY);

        info!("Deleting state from s3://{}/{state_key}", self.bucket);

        self.delete_object(&state_key).await?;
        self.delete_object(&lock_key).await?;

        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        self.object_exists(&self.key(STATE_KEY)).await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let existing = self.get_lock_info().await?;
        check_available(existing.as_ref())?;
        if existing.is_some() {
            debug!("Expired lock found, taking over");
        }

        let lock_info = LockInfo::new(holder);
        self.put_lock(&lock_info).await?;

        // S3 has no compare-and-swap here; read back to detect a racing writer.
        match self.get_lock_info().await? {
            Some(stored) if stored.lock_id == lock_info.lock_id => {}
            Some(stored) => return Err(stored.conflict().into()),
            None => {
                return Err(StateError::LockFailed {
                    message: "Lock object vanished during acquisition".to_string(),
                }
                .into());
            }
        }

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.get_lock_info().await? {
            if existing.lock_id == lock_id {
                self.delete_object(&self.key(LOCK_KEY)).await?;
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
        let mut lock = check_owner(self.get_lock_info().await?, lock_id)?;
        lock.refresh();
        self.put_lock(&lock).await?;

        debug!("Refreshed state lock {lock_id} until {}", lock.expires_at);
        Ok(lock)
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        let Some(content) = self.get_object(&self.key(LOCK_KEY)).await? else {
            return Ok(None);
        };

        let lock_info: LockInfo = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse lock: {e}")))?;

        Ok(Some(lock_info))
    }

    async fn is_locked(&self) -> Result<bool> {
        if let Some(lock_info) = self.get_lock_info().await? {
            return Ok(!lock_info.is_expired());
        }
        Ok(false)
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

//! Persisted key-value state shared by the scheduler, the tracking controller and
//! the storage helpers.
//!
//! Writes are last-write-wins with no transactional isolation. Values written
//! by an earlier process (or half-written before a kill) are read defensively:
//! anything that fails to parse is treated as absent.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

pub const KEY_LAST_SYNC_TIME: &str = "@last_background_geolocation_sync_time";
pub const KEY_LAST_KNOWN_LOCATION: &str = "@last_known_location";
pub const KEY_EMULATOR_MODE: &str = "@emulator_mode_enabled";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage io failed: {0}")]
    Io(String),
    #[error("storage encode failed: {0}")]
    Encode(String),
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn set_item(&self, key: &str, value: String) -> Result<(), StorageError>;
    async fn remove_item(&self, key: &str) -> Result<(), StorageError>;
}

pub fn memory() -> Arc<dyn KeyValueStore> {
    Arc::new(MemoryKeyValueStore::default())
}

#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    values: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: String) -> Result<(), StorageError> {
        self.values.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.values.lock().await.remove(key);
        Ok(())
    }
}

/// Key-value store persisted as a single JSON object on disk.
///
/// The whole file is rewritten on each mutation through a temp file and rename.
#[derive(Debug)]
pub struct FileKeyValueStore {
    path: PathBuf,
    values: Mutex<HashMap<String, String>>,
}

impl FileKeyValueStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let values = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<HashMap<String, String>>(&bytes) {
                Ok(values) => values,
                Err(error) => {
                    tracing::warn!(
                        error = %error,
                        path = %path.display(),
                        "Discarding unreadable key-value file"
                    );
                    HashMap::new()
                }
            },
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(error) => return Err(StorageError::Io(error.to_string())),
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, values: &HashMap<String, String>) -> Result<(), StorageError> {
        let encoded =
            serde_json::to_vec_pretty(values).map_err(|error| StorageError::Encode(error.to_string()))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|error| StorageError::Io(error.to_string()))?;
            }
        }
        let staging = self.path.with_extension("tmp");
        tokio::fs::write(&staging, encoded)
            .await
            .map_err(|error| StorageError::Io(error.to_string()))?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .map_err(|error| StorageError::Io(error.to_string()))
    }
}

#[async_trait]
impl KeyValueStore for FileKeyValueStore {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: String) -> Result<(), StorageError> {
        let mut values = self.values.lock().await;
        values.insert(key.to_string(), value);
        self.persist(&values).await
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let mut values = self.values.lock().await;
        if values.remove(key).is_some() {
            self.persist(&values).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coords {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

/// Last known device position, used when live telemetry is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StoredLocation {
    pub coords: Coords,
    /// Epoch milliseconds.
    pub timestamp: u64,
}

impl StoredLocation {
    #[must_use]
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.timestamp)
    }
}

/// Typed access to the persisted keys.
#[derive(Clone)]
pub struct PersistedState {
    store: Arc<dyn KeyValueStore>,
}

impl PersistedState {
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn last_sync_time(&self) -> Result<Option<u64>, StorageError> {
        let Some(raw) = self.store.get_item(KEY_LAST_SYNC_TIME).await? else {
            return Ok(None);
        };
        match raw.trim().parse::<u64>() {
            Ok(value) => Ok(Some(value)),
            Err(error) => {
                tracing::warn!(error = %error, raw = %raw, "Ignoring corrupt last sync time");
                Ok(None)
            }
        }
    }

    pub async fn set_last_sync_time(&self, now_ms: u64) -> Result<(), StorageError> {
        self.store
            .set_item(KEY_LAST_SYNC_TIME, now_ms.to_string())
            .await
    }

    pub async fn last_location(&self) -> Result<Option<StoredLocation>, StorageError> {
        let Some(raw) = self.store.get_item(KEY_LAST_KNOWN_LOCATION).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<StoredLocation>(&raw) {
            Ok(location) => Ok(Some(location)),
            Err(error) => {
                tracing::warn!(error = %error, "Ignoring corrupt stored location");
                Ok(None)
            }
        }
    }

    pub async fn store_location(&self, location: &StoredLocation) -> Result<(), StorageError> {
        let encoded =
            serde_json::to_string(location).map_err(|error| StorageError::Encode(error.to_string()))?;
        self.store.set_item(KEY_LAST_KNOWN_LOCATION, encoded).await
    }

    pub async fn emulator_mode(&self) -> Result<bool, StorageError> {
        Ok(self
            .store
            .get_item(KEY_EMULATOR_MODE)
            .await?
            .is_some_and(|raw| raw.trim() == "true"))
    }

    pub async fn set_emulator_mode(&self, enabled: bool) -> Result<(), StorageError> {
        self.store
            .set_item(KEY_EMULATOR_MODE, enabled.to_string())
            .await
    }
}

//! Configuration Storage
//!
//! Handles reading/writing the config file to disk.
//! Config location: ~/.port-forwarder/config.json

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::types::{ConfigFile, ConnectionConfig, CONFIG_VERSION};

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },
}

/// Get the configuration directory (~/.port-forwarder)
pub fn config_dir() -> Result<PathBuf, StorageError> {
    dirs::home_dir()
        .map(|home| home.join(".port-forwarder"))
        .ok_or(StorageError::NoConfigDir)
}

/// Get the config file path
pub fn config_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("config.json"))
}

/// Load/save abstraction for the connection list
///
/// The engine only ever persists the ordered list of configs; everything
/// else in the file is left untouched.
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn load(&self) -> Result<Vec<ConnectionConfig>, StorageError>;

    async fn save(&self, connections: &[ConnectionConfig]) -> Result<(), StorageError>;
}

/// JSON config file holding settings and the connection list
///
/// Writes go through a uniquely named sibling file that is renamed over
/// the config, one at a time per storage instance.
pub struct ConfigStorage {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl ConfigStorage {
    /// Storage at the default location
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self::with_path(config_file()?))
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the config file
    ///
    /// A missing file yields the defaults. An unparseable one is moved
    /// aside and also yields the defaults; a file from a newer release is
    /// an error so it is never overwritten.
    pub async fn load_file(&self) -> Result<ConfigFile, StorageError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ConfigFile::default()),
            Err(e) => return Err(e.into()),
        };

        let file: ConfigFile = match serde_json::from_str(&contents) {
            Ok(file) => file,
            Err(e) => {
                warn!("Unreadable config {}: {}", self.path.display(), e);
                self.quarantine().await;
                return Ok(ConfigFile::default());
            }
        };

        if file.version > CONFIG_VERSION {
            return Err(StorageError::VersionTooNew {
                found: file.version,
                supported: CONFIG_VERSION,
            });
        }
        Ok(file)
    }

    /// Replace the config file with `file`
    pub async fn save_file(&self, file: &ConfigFile) -> Result<(), StorageError> {
        let _writing = self.write_lock.lock().await;
        self.write(file).await
    }

    async fn write(&self, file: &ConfigFile) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec_pretty(file)?;
        let staging = self
            .path
            .with_extension(format!("json.{}.tmp", Uuid::new_v4().simple()));
        let written: std::io::Result<()> = async {
            let mut out = fs::File::create(&staging).await?;
            out.write_all(&json).await?;
            out.sync_all().await?;
            fs::rename(&staging, &self.path).await
        }
        .await;

        if let Err(e) = written {
            let _ = fs::remove_file(&staging).await;
            return Err(e.into());
        }
        debug!("Saved {} connection(s) to {}", file.connections.len(), self.path.display());
        Ok(())
    }

    /// Move an unreadable config out of the way, keeping it for inspection
    async fn quarantine(&self) {
        let aside = self.path.with_extension(format!(
            "json.corrupt.{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));
        match fs::rename(&self.path, &aside).await {
            Ok(()) => warn!("Moved unreadable config to {}", aside.display()),
            Err(e) => error!("Failed to move unreadable config aside: {}", e),
        }
    }
}

#[async_trait]
impl ConnectionStore for ConfigStorage {
    async fn load(&self) -> Result<Vec<ConnectionConfig>, StorageError> {
        Ok(self.load_file().await?.connections)
    }

    async fn save(&self, connections: &[ConnectionConfig]) -> Result<(), StorageError> {
        // Settings are kept; only the connection list belongs to the engine
        let _writing = self.write_lock.lock().await;
        let mut file = self.load_file().await?;
        file.connections = connections.to_vec();
        self.write(&file).await
    }
}

/// In-memory store, for embedding without a config file and for tests
#[derive(Default)]
pub struct MemoryConnectionStore {
    connections: Mutex<Vec<ConnectionConfig>>,
    saves: Mutex<usize>,
}

impl MemoryConnectionStore {
    pub fn new(connections: Vec<ConnectionConfig>) -> Self {
        Self {
            connections: Mutex::new(connections),
            saves: Mutex::new(0),
        }
    }

    /// Current stored list
    pub fn snapshot(&self) -> Vec<ConnectionConfig> {
        self.connections.lock().clone()
    }

    /// Number of save calls so far
    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }
}

#[async_trait]
impl ConnectionStore for MemoryConnectionStore {
    async fn load(&self) -> Result<Vec<ConnectionConfig>, StorageError> {
        Ok(self.connections.lock().clone())
    }

    async fn save(&self, connections: &[ConnectionConfig]) -> Result<(), StorageError> {
        *self.connections.lock() = connections.to_vec();
        *self.saves.lock() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_load_nonexistent() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");
        let storage = ConfigStorage::with_path(path);

        let config = storage.load_file().await.unwrap();
        assert_eq!(config.version, CONFIG_VERSION);
        assert!(config.connections.is_empty());
    }

    #[tokio::test]
    async fn test_save_preserves_settings() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nested").join("config.json");
        let storage = ConfigStorage::with_path(path);

        let mut file = ConfigFile::default();
        file.settings.auto_start = true;
        storage.save_file(&file).await.unwrap();

        let conn = ConnectionConfig::new("postgres", "db", "svc/postgres", 5432, 5432);
        storage.save(&[conn.clone()]).await.unwrap();

        let loaded = storage.load_file().await.unwrap();
        assert!(loaded.settings.auto_start);
        assert_eq!(loaded.connections, vec![conn]);
    }

    #[tokio::test]
    async fn test_corrupted_file_is_moved_aside() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        let storage = ConfigStorage::with_path(path);

        let config = storage.load_file().await.unwrap();
        assert!(config.connections.is_empty());

        let backups = std::fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("corrupt"))
            .count();
        assert_eq!(backups, 1);
        assert!(!storage.path().exists());
    }

    #[tokio::test]
    async fn test_newer_version_rejected() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"version": 99}"#).unwrap();
        let storage = ConfigStorage::with_path(path);

        let err = storage.load_file().await.unwrap_err();
        assert!(matches!(err, StorageError::VersionTooNew { found: 99, .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_saves_leave_valid_file() {
        let temp = tempdir().unwrap();
        let storage = Arc::new(ConfigStorage::with_path(temp.path().join("config.json")));

        let mut file = ConfigFile::default();
        file.settings.auto_start = true;
        storage.save_file(&file).await.unwrap();

        let writers: Vec<_> = (0..8u16)
            .map(|i| {
                let storage = storage.clone();
                tokio::spawn(async move {
                    let conn = ConnectionConfig::new("svc", "default", "svc/api", 18000 + i, 80);
                    storage.save(&[conn]).await
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let loaded = storage.load_file().await.unwrap();
        assert!(loaded.settings.auto_start);
        assert_eq!(loaded.connections.len(), 1);

        let leftovers = std::fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_memory_store_counts_saves() {
        let store = MemoryConnectionStore::default();
        let conn = ConnectionConfig::new("api", "prod", "svc/api", 8080, 80);
        store.save(&[conn.clone()]).await.unwrap();
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.load().await.unwrap(), vec![conn]);
    }
}

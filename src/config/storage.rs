//! Configuration Storage
//!
//! Persists the ordered list of saved connections as versioned JSON.
//! Config location: `<config dir>/oxide-remote/connections.json`
//! (`~/.config` on Linux, `~/Library/Application Support` on macOS,
//! `%APPDATA%` on Windows).

use std::path::PathBuf;

use tokio::fs;
use tokio::io::AsyncWriteExt;

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

    #[error("Invalid connection {id}: {source}")]
    Invalid {
        id: String,
        #[source]
        source: super::types::ConfigError,
    },
}

/// Get the configuration directory
pub fn config_dir() -> Result<PathBuf, StorageError> {
    dirs::config_dir()
        .map(|dir| dir.join("oxide-remote"))
        .ok_or(StorageError::NoConfigDir)
}

/// Get the connections file path
pub fn connections_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("connections.json"))
}

/// Configuration storage manager
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    /// Create a new storage manager with default path
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            path: connections_file()?,
        })
    }

    /// Create storage manager with custom path (for testing)
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    async fn ensure_dir(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Load configuration from disk.
    ///
    /// A missing file yields an empty config. A corrupted file is backed up
    /// and replaced by an empty config. Records that fail validation are
    /// skipped with a warning.
    pub async fn load(&self) -> Result<ConfigFile, StorageError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ConfigFile::default()),
            Err(e) => return Err(StorageError::Io(e)),
        };

        let mut config = match serde_json::from_str::<ConfigFile>(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Config file corrupted: {}", e);
                match self.backup().await {
                    Ok(backup_path) => tracing::warn!(
                        "Corrupted config backed up to {:?}, using defaults",
                        backup_path
                    ),
                    Err(backup_err) => {
                        tracing::error!("Failed to backup corrupted config: {}", backup_err)
                    }
                }
                return Ok(ConfigFile::default());
            }
        };

        if config.version > CONFIG_VERSION {
            return Err(StorageError::VersionTooNew {
                found: config.version,
                supported: CONFIG_VERSION,
            });
        }

        config.connections.retain(|c| match c.validate() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Skipping saved connection {}: {}", c.id, e);
                false
            }
        });
        Ok(config)
    }

    /// Save configuration to disk (temp file + rename)
    pub async fn save(&self, config: &ConfigFile) -> Result<(), StorageError> {
        self.ensure_dir().await?;

        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(config)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.path).await?;
        tracing::debug!(
            "Saved {} connections to {:?}",
            config.connections.len(),
            self.path
        );

        Ok(())
    }

    /// Insert or replace a connection by id, preserving list order
    pub async fn upsert(&self, connection: ConnectionConfig) -> Result<(), StorageError> {
        connection.validate().map_err(|source| StorageError::Invalid {
            id: connection.id.clone(),
            source,
        })?;

        let mut config = self.load().await?;
        match config.connections.iter_mut().find(|c| c.id == connection.id) {
            Some(existing) => *existing = connection,
            None => config.connections.push(connection),
        }
        self.save(&config).await
    }

    /// Remove a connection by id; returns whether it existed
    pub async fn remove(&self, id: &str) -> Result<bool, StorageError> {
        let mut config = self.load().await?;
        let before = config.connections.len();
        config.connections.retain(|c| c.id != id);
        if config.connections.len() == before {
            return Ok(false);
        }
        self.save(&config).await?;
        Ok(true)
    }

    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Create a backup of the current config
    pub async fn backup(&self) -> Result<PathBuf, StorageError> {
        let backup_path = self.path.with_extension(format!(
            "json.backup.{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));

        if self.exists().await {
            fs::copy(&self.path, &backup_path).await?;
        }

        Ok(backup_path)
    }
}

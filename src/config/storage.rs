//! `ClientConfig` on disk as pretty-printed JSON

use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::types::{ClientConfig, CONFIG_VERSION};

const CONFIG_FILE_NAME: &str = "config.json";

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

/// `%APPDATA%\OxideSftp` on Windows, `~/.oxidesftp` elsewhere
pub fn config_dir() -> Result<PathBuf, StorageError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("OxideSftp"));
        }
    }

    dirs::home_dir()
        .map(|home| home.join(".oxidesftp"))
        .ok_or(StorageError::NoConfigDir)
}

pub fn config_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    pub fn new() -> Result<Self, StorageError> {
        config_file().map(Self::with_path)
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file yields defaults. So does an unparsable one, after it has
    /// been copied aside.
    pub async fn load(&self) -> Result<ClientConfig, StorageError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ClientConfig::default())
            }
            Err(e) => return Err(e.into()),
        };

        let config: ClientConfig = match serde_json::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Ignoring unreadable config {:?}: {}", self.path, e);
                self.keep_corrupt_copy().await;
                return Ok(ClientConfig::default());
            }
        };

        if config.version > CONFIG_VERSION {
            return Err(StorageError::VersionTooNew {
                found: config.version,
                supported: CONFIG_VERSION,
            });
        }
        Ok(config)
    }

    /// Write through a sibling temp file so a crash never leaves half a config
    pub async fn save(&self, config: &ClientConfig) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec_pretty(config)?;
        let temp_path = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &self.path).await?;
        tracing::debug!("Saved config to {:?}", self.path);
        Ok(())
    }

    async fn keep_corrupt_copy(&self) {
        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let copy = self.path.with_extension(format!("json.backup.{}", stamp));
        match fs::copy(&self.path, &copy).await {
            Ok(_) => tracing::warn!("Unreadable config kept as {:?}, using defaults", copy),
            Err(e) => tracing::error!("Could not keep unreadable config: {}", e),
        }
    }
}

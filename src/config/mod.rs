//! Configuration management for Warden

pub mod schema;

pub use schema::Config;

use crate::error::{WardenError, WardenResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// File name of the persisted file cache table
pub const FILE_CACHES_FILE: &str = "file-caches.json";

/// File name of the persisted writable directory cache table
pub const DIRECTORY_CACHES_FILE: &str = "directory-caches.json";

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("warden")
            .join("config.toml")
    }

    /// Get the default state directory path
    pub fn default_state_dir() -> PathBuf {
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("warden")
    }

    /// Directory holding the persisted cache tables
    pub fn state_dir(config: &Config) -> PathBuf {
        config
            .worker
            .state_dir
            .clone()
            .unwrap_or_else(Self::default_state_dir)
    }

    /// Backing store for writable directory caches
    pub fn caches_dir(config: &Config) -> PathBuf {
        config
            .mounts
            .caches_dir
            .clone()
            .unwrap_or_else(|| Self::state_dir(config).join("caches"))
    }

    /// Backing store for downloaded files
    pub fn downloads_dir(config: &Config) -> PathBuf {
        config
            .mounts
            .downloads_dir
            .clone()
            .unwrap_or_else(|| Self::state_dir(config).join("downloads"))
    }

    /// Snapshot file of the file cache table
    pub fn file_caches_path(config: &Config) -> PathBuf {
        Self::state_dir(config).join(FILE_CACHES_FILE)
    }

    /// Snapshot file of the directory cache table
    pub fn directory_caches_path(config: &Config) -> PathBuf {
        Self::state_dir(config).join(DIRECTORY_CACHES_FILE)
    }

    /// Load configuration, creating default if not exists
    pub async fn load(&self) -> WardenResult<Config> {
        if !self.config_path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Config::default());
        }

        self.load_from_file(&self.config_path).await
    }

    /// Load configuration from a specific file
    pub async fn load_from_file(&self, path: &Path) -> WardenResult<Config> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| WardenError::io(format!("reading config from {}", path.display()), e))?;

        let config: Config = toml::from_str(&content).map_err(|e| WardenError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        validate(&config).map_err(|reason| WardenError::ConfigInvalid {
            path: path.to_path_buf(),
            reason,
        })?;

        Ok(config)
    }

    /// Save configuration to file
    pub async fn save(&self, config: &Config) -> WardenResult<()> {
        self.ensure_config_dir().await?;

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            WardenError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Ensure the config directory exists
    async fn ensure_config_dir(&self) -> WardenResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| WardenError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        Ok(())
    }

    /// Ensure the state, caches and downloads directories exist, readable
    /// only by the worker
    pub async fn ensure_state_dirs(config: &Config) -> WardenResult<()> {
        let dirs = [
            Self::state_dir(config),
            Self::caches_dir(config),
            Self::downloads_dir(config),
        ];

        for dir in &dirs {
            fs::create_dir_all(dir).await.map_err(|e| {
                WardenError::io(format!("creating directory {}", dir.display()), e)
            })?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(0o700);
                std::fs::set_permissions(dir, perms).map_err(|e| {
                    WardenError::io(format!("setting permissions of {}", dir.display()), e)
                })?;
            }
        }

        Ok(())
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Check cross-field constraints serde cannot express
pub fn validate(config: &Config) -> Result<(), String> {
    let ports = &config.ports;
    if ports.capacity == 0 {
        return Err("ports.capacity must be at least 1".to_string());
    }
    let span = ports.capacity as u32 * 4;
    for (name, base) in [
        ("ports.live_log_base", ports.live_log_base),
        ("ports.interactive_base", ports.interactive_base),
        ("ports.proxy_base", ports.proxy_base),
    ] {
        if base == 0 || u32::from(base) + span > 65536 {
            return Err(format!(
                "{} = {} leaves no room for {} task slots",
                name, base, ports.capacity
            ));
        }
    }
    if config.worker.worker_pool_id.split('/').count() != 2 {
        return Err(format!(
            "worker.worker_pool_id must be <provisionerId>/<workerType>, got {:?}",
            config.worker.worker_pool_id
        ));
    }
    Ok(())
}

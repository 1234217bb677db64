//! Configuration schema for Warden
//!
//! Configuration is stored at `~/.config/warden/config.toml`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Worker identity and state
    pub worker: WorkerConfig,

    /// Mounts and caches
    pub mounts: MountsConfig,

    /// HTTP downloads
    pub http: HttpConfig,

    /// Task slot port blocks
    pub ports: PortsConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Enable verbose logging
    pub verbose: bool,

    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            log_format: "text".to_string(),
        }
    }
}

/// Worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker pool this worker claims tasks for (`<provisionerId>/<workerType>`)
    pub worker_pool_id: String,

    /// Directory holding the persisted cache tables (defaults to the state dir)
    pub state_dir: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_pool_id: "warden/default".to_string(),
            state_dir: None,
        }
    }
}

/// Mounts and cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountsConfig {
    /// Enable task mounts
    pub enabled: bool,

    /// Backing store for writable directory caches
    pub caches_dir: Option<PathBuf>,

    /// Backing store for downloaded files
    pub downloads_dir: Option<PathBuf>,

    /// Free space to maintain in the caches directory before mounting
    pub required_free_space_mb: u64,

    /// Query the purge cache service at least this often, even for tasks
    /// without writable caches
    pub purge_query_interval_hours: u32,

    /// Tolerated clock drift between the worker and the purge cache service
    pub purge_clock_skew_minutes: u32,

    /// Scope prefix required per writable cache name
    pub cache_scope_prefix: String,
}

impl Default for MountsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            caches_dir: None,
            downloads_dir: None,
            required_free_space_mb: 10240,
            purge_query_interval_hours: 6,
            purge_clock_skew_minutes: 5,
            cache_scope_prefix: "worker:cache:".to_string(),
        }
    }
}

impl MountsConfig {
    /// Required free space in bytes
    pub fn required_free_space_bytes(&self) -> u64 {
        self.required_free_space_mb.saturating_mul(1024 * 1024)
    }
}

/// HTTP download settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Retries after the first attempt for transient failures
    pub max_retries: u32,

    /// Backoff before the first retry, doubled on every further retry
    pub initial_backoff_ms: u64,

    /// Upper bound for a single backoff
    pub max_backoff_secs: u64,

    /// Overall timeout for a single attempt
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 500,
            max_backoff_secs: 30,
            timeout_secs: 600,
        }
    }
}

/// Port block settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    /// Maximum number of concurrently running task slots
    pub capacity: usize,

    /// Live log GET port of slot 0 (PUT port is GET + 1)
    pub live_log_base: u16,

    /// Interactive shell port of slot 0
    pub interactive_base: u16,

    /// Local proxy port of slot 0
    pub proxy_base: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            capacity: 1,
            live_log_base: 60098,
            interactive_base: 53654,
            proxy_base: 34569,
        }
    }
}

//! Error types for Warden
//!
//! All modules use `WardenResult<T>` as their return type. Every error
//! carries an [`ErrorKind`] that tells the task runner how to resolve the
//! task it happened in.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Warden operations
pub type WardenResult<T> = Result<T, WardenError>;

/// How an error should be resolved by whoever is running the task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The task's mount declarations are invalid. Task resolves as
    /// malformed-payload; the worker is unaffected.
    MalformedPayload,
    /// Content supplied by the task is bad (hash mismatch, corrupt archive,
    /// unreachable url). Task resolves as failed.
    TaskFailure,
    /// Worker bookkeeping and the filesystem have diverged. The worker must
    /// stop taking tasks.
    Internal,
    /// The worker cannot admit a task right now (no free task slot).
    Capacity,
    /// A collaborating service is unreachable; the operation continues with
    /// a non-destructive fallback.
    Degraded,
}

/// All errors that can occur in Warden
#[derive(Error, Debug)]
pub enum WardenError {
    // Payload errors
    #[error("malformed mount payload: {0}")]
    MalformedPayload(String),

    #[error("task.dependencies needs to include {task_id} since one or more of its artifacts are mounted")]
    MissingDependency { task_id: String },

    #[error("unrecognised {what} in payload: {json}")]
    Unrecognised { what: &'static str, json: String },

    // Task-level content errors
    #[error("download {file} of {source_desc} has SHA256 {actual} but task definition explicitly requires {required}; not retrying download as there were no connection failures and HTTP response status code was 200")]
    HashMismatch {
        source_desc: String,
        file: PathBuf,
        actual: String,
        required: String,
    },

    #[error("could not fetch {source_desc}: {reason}")]
    Download { source_desc: String, reason: String },

    #[error("could not resolve index namespace {namespace}: {reason}")]
    IndexLookup { namespace: String, reason: String },

    #[error("not able to extract {path}: {reason}")]
    Archive { path: PathBuf, reason: String },

    #[error("invalid mount path {path}: {reason}")]
    InvalidMountPath { path: PathBuf, reason: String },

    #[error("could not persist cache {key} due to {reason}")]
    CachePersist { key: String, reason: String },

    #[error("invalid base64 content: {0}")]
    InvalidBase64(String),

    // Capacity errors
    #[error("no free task slot: all {capacity} port blocks are allocated")]
    PortsExhausted { capacity: usize },

    // Degraded-service errors
    #[error("purge cache service unavailable: {0}")]
    PurgeService(String),

    // Internal (worker) errors
    #[error("cache {key} is in the cache table but {location} is missing on disk")]
    CacheCorrupt { key: String, location: PathBuf },

    #[error("could not delete cache {key} at {location}: {source}")]
    EvictionFailed {
        key: String,
        location: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not write cache table snapshot {path}: {source}")]
    SnapshotWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("not enough free disk space: {free} bytes free, {required} bytes required, and no caches left to evict")]
    DiskSpaceExhausted { free: u64, required: u64 },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl WardenError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a download error
    pub fn download(source_desc: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Download {
            source_desc: source_desc.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Classify the error for task resolution
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedPayload(_)
            | Self::MissingDependency { .. }
            | Self::Unrecognised { .. } => ErrorKind::MalformedPayload,

            Self::HashMismatch { .. }
            | Self::Download { .. }
            | Self::IndexLookup { .. }
            | Self::Archive { .. }
            | Self::InvalidMountPath { .. }
            | Self::CachePersist { .. }
            | Self::InvalidBase64(_)
            | Self::Io { .. } => ErrorKind::TaskFailure,

            Self::PortsExhausted { .. } => ErrorKind::Capacity,

            Self::PurgeService(_) => ErrorKind::Degraded,

            Self::CacheCorrupt { .. }
            | Self::EvictionFailed { .. }
            | Self::SnapshotWrite { .. }
            | Self::DiskSpaceExhausted { .. }
            | Self::ConfigInvalid { .. }
            | Self::ConfigDirCreate { .. }
            | Self::Json(_)
            | Self::TomlParse(_)
            | Self::TomlSerialize(_)
            | Self::Internal(_)
            | Self::User(_) => ErrorKind::Internal,
        }
    }

    /// Whether the worker itself is at fault and should stop claiming tasks
    pub fn is_worker_fault(&self) -> bool {
        self.kind() == ErrorKind::Internal
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PurgeService(_) | Self::PortsExhausted { .. } | Self::Download { .. }
        )
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::DiskSpaceExhausted { .. } => {
                Some("Lower mounts.required_free_space_mb or free up disk space")
            }
            Self::ConfigInvalid { .. } => Some("Run: warden config show"),
            Self::CacheCorrupt { .. } => Some("Run: warden cache evict <KEY>"),
            _ => None,
        }
    }
}

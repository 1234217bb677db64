//! Services the mount engine depends on
//!
//! The worker talks to the queue (artifact downloads), the index (namespace
//! lookups) and the purge cache service through these traits. Production
//! implementations live with the task runner; tests use in-memory fakes.

use crate::error::WardenResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Artifact access on the queue
#[async_trait]
pub trait Queue: Send + Sync {
    /// Download an artifact of `task_id` to `dest`, returning bytes written.
    /// `run_id` of `None` means the latest run.
    async fn download_artifact_to_file(
        &self,
        task_id: &str,
        run_id: Option<u32>,
        artifact: &str,
        dest: &Path,
    ) -> WardenResult<u64>;
}

/// Task returned by an index lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedTask {
    pub namespace: String,
    pub task_id: String,
}

/// Namespace lookups on the index. Bound to the credentials of the task
/// being mounted, so the index enforces that task's scopes.
#[async_trait]
pub trait Index: Send + Sync {
    /// Resolve `namespace` to the task indexed there
    async fn find_task(&self, namespace: &str) -> WardenResult<IndexedTask>;
}

/// A request to discard a writable cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeRequest {
    pub cache_name: String,

    /// Caches created before this time are stale
    pub before: DateTime<Utc>,
}

/// The purge cache service
#[async_trait]
pub trait PurgeCacheService: Send + Sync {
    /// Purge requests for `worker_pool_id`, limited to those made after
    /// `since` when given
    async fn purge_requests(
        &self,
        worker_pool_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> WardenResult<Vec<PurgeRequest>>;
}

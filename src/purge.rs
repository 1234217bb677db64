//! Purge cache reconciliation
//!
//! Before a task's caches are mounted, the worker asks the purge cache
//! service whether any writable cache has been invalidated and evicts those
//! that predate the request. Clock drift between the worker and the
//! service is absorbed by widening both the query window and the eviction
//! cut-off by a configurable skew.

use crate::cache::CacheTable;
use crate::clients::PurgeCacheService;
use crate::config::schema::MountsConfig;
use crate::error::{WardenError, WardenResult};
use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// Queries the purge cache service on behalf of every task slot
pub struct PurgeCoordinator {
    service: Arc<dyn PurgeCacheService>,
    worker_pool_id: String,
    query_interval: Duration,
    clock_skew: Duration,
    last_queried: Mutex<Option<DateTime<Utc>>>,
}

impl PurgeCoordinator {
    pub fn new(
        service: Arc<dyn PurgeCacheService>,
        worker_pool_id: impl Into<String>,
        config: &MountsConfig,
    ) -> Self {
        Self {
            service,
            worker_pool_id: worker_pool_id.into(),
            query_interval: Duration::hours(i64::from(config.purge_query_interval_hours)),
            clock_skew: Duration::minutes(i64::from(config.purge_clock_skew_minutes)),
            last_queried: Mutex::new(None),
        }
    }

    /// When the service was last queried
    pub fn last_queried(&self) -> Option<DateTime<Utc>> {
        *self.last_queried.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Evict purged caches from `directory_caches`. Returns how many were
    /// evicted.
    pub async fn reconcile(
        &self,
        has_writable_caches: bool,
        directory_caches: &CacheTable,
    ) -> WardenResult<usize> {
        self.reconcile_at(Utc::now(), has_writable_caches, directory_caches)
            .await
    }

    /// [`reconcile`](Self::reconcile) as of `now`.
    ///
    /// Tasks without writable caches only trigger a query once the query
    /// interval has passed, keeping the worker's view from going stale. The
    /// query time is recorded before the call so that an unreachable service
    /// is not hammered by every task.
    pub async fn reconcile_at(
        &self,
        now: DateTime<Utc>,
        has_writable_caches: bool,
        directory_caches: &CacheTable,
    ) -> WardenResult<usize> {
        let since = {
            let mut last = self
                .last_queried
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(previous) = *last {
                if !has_writable_caches && now - previous < self.query_interval {
                    debug!("Purge cache service queried at {}, not querying again", previous);
                    return Ok(0);
                }
            }
            let since = last.map(|previous| previous - self.clock_skew);
            *last = Some(now);
            since
        };

        let requests = self
            .service
            .purge_requests(&self.worker_pool_id, since)
            .await
            .map_err(|e| WardenError::PurgeService(e.to_string()))?;

        let mut evicted = 0;
        for request in requests {
            let Some(cache) = directory_caches.get(&request.cache_name) else {
                continue;
            };
            if cache.created < request.before - self.clock_skew {
                info!(
                    cache = %request.cache_name,
                    "[mounts] Purging cache created at {} (purge requested for caches before {})",
                    cache.created,
                    request.before
                );
                if directory_caches.evict_async(&request.cache_name).await? {
                    evicted += 1;
                }
            }
        }
        Ok(evicted)
    }
}

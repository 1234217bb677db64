//! Per-task mount orchestration

use crate::clients::Index;
use crate::error::{WardenError, WardenResult};
use crate::fsutil::OsIdentity;
use crate::mounts::entry::{MountEntry, Mounted};
use crate::mounts::Mounts;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// The parts of a task payload the mount engine reads
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    /// Raw mount declarations, parsed by [`TaskMount::new`]
    #[serde(default)]
    pub mounts: Vec<serde_json::Value>,

    #[serde(default)]
    pub on_exit_status: OnExitStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnExitStatus {
    /// Exit codes after which the task's writable caches are discarded
    #[serde(default)]
    pub purge_caches: Vec<i64>,
}

/// Everything the mount engine needs to know about a task
#[derive(Clone)]
pub struct TaskContext {
    pub task_id: String,

    /// Root of the task's working directory; mount paths are relative to it
    pub task_dir: PathBuf,

    /// `task.dependencies`
    pub dependencies: Vec<String>,

    pub payload: TaskPayload,

    /// OS user the task command runs as
    pub identity: OsIdentity,

    /// Index client using the task's own credentials
    pub index: Arc<dyn Index>,
}

impl TaskContext {
    /// Context for a task without mounts or dependencies, running as the
    /// worker's own user
    pub fn new(task_id: impl Into<String>, task_dir: PathBuf, index: Arc<dyn Index>) -> Self {
        Self {
            task_id: task_id.into(),
            task_dir,
            dependencies: Vec::new(),
            payload: TaskPayload::default(),
            identity: OsIdentity::current(),
            index,
        }
    }

    pub fn with_payload(mut self, payload: TaskPayload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_identity(mut self, identity: OsIdentity) -> Self {
        self.identity = identity;
        self
    }
}

/// Mounts of a single task, from payload parsing to teardown
pub struct TaskMount {
    mounts: Arc<Mounts>,
    ctx: TaskContext,
    entries: Vec<MountEntry>,
    mounted: Vec<Mounted>,
    required_scopes: BTreeSet<String>,
    referenced_task_ids: BTreeSet<String>,
    payload_error: Option<WardenError>,
}

impl TaskMount {
    /// Parse the task's mount declarations.
    ///
    /// Problems with the payload are recorded rather than returned so the
    /// task can be resolved as malformed-payload when it starts.
    pub fn new(mounts: Arc<Mounts>, ctx: TaskContext) -> Self {
        let mut task_mount = Self {
            mounts,
            ctx,
            entries: Vec::new(),
            mounted: Vec::new(),
            required_scopes: BTreeSet::new(),
            referenced_task_ids: BTreeSet::new(),
            payload_error: None,
        };
        if let Err(e) = task_mount.parse() {
            warn!(task_id = %task_mount.ctx.task_id, "[mounts] {}", e);
            task_mount.payload_error = Some(e);
        }
        task_mount
    }

    fn parse(&mut self) -> WardenResult<()> {
        if !self.mounts.config().enabled && !self.ctx.payload.mounts.is_empty() {
            return Err(WardenError::MalformedPayload(
                "task declares mounts but the mounts feature is disabled on this worker".to_string(),
            ));
        }
        for value in &self.ctx.payload.mounts {
            self.entries.push(MountEntry::from_json(value)?);
        }

        let prefix = &self.mounts.config().cache_scope_prefix;
        for entry in &self.entries {
            self.required_scopes.extend(entry.required_scopes(prefix));
            if let Some(content) = entry.content() {
                self.required_scopes.extend(content.required_scopes());
                self.referenced_task_ids
                    .extend(content.task_dependencies());
            }
        }

        let declared: BTreeSet<&str> = self.ctx.dependencies.iter().map(String::as_str).collect();
        if let Some(missing) = self
            .referenced_task_ids
            .iter()
            .find(|id| !declared.contains(id.as_str()))
        {
            return Err(WardenError::MissingDependency {
                task_id: missing.clone(),
            });
        }
        Ok(())
    }

    /// Scopes the task must hold for its mounts
    pub fn required_scopes(&self) -> impl Iterator<Item = &str> {
        self.required_scopes.iter().map(String::as_str)
    }

    /// Tasks whose artifacts are mounted
    pub fn referenced_task_ids(&self) -> impl Iterator<Item = &str> {
        self.referenced_task_ids.iter().map(String::as_str)
    }

    pub fn payload_error(&self) -> Option<&WardenError> {
        self.payload_error.as_ref()
    }

    /// Entries mounted so far, in mount order
    pub fn mounted(&self) -> &[Mounted] {
        &self.mounted
    }

    /// Purge stale caches, make room on disk, then mount every entry in
    /// order. Stops at the first failing entry; entries mounted before it
    /// are still torn down by [`stop`](Self::stop).
    ///
    /// Tasks without mounts still reconcile purge requests so that the
    /// worker's view of them never goes stale.
    pub async fn start(&mut self) -> WardenResult<()> {
        if let Some(e) = self.payload_error.take() {
            return Err(e);
        }
        if !self.mounts.config().enabled {
            return Ok(());
        }

        let has_writable_caches = self.entries.iter().any(MountEntry::is_writable_cache);
        match self
            .mounts
            .purge()
            .reconcile(has_writable_caches, self.mounts.directory_caches())
            .await
        {
            Ok(0) => {}
            Ok(purged) => info!(task_id = %self.ctx.task_id, "[mounts] Purged {} cache(s)", purged),
            Err(e) if e.is_worker_fault() => return Err(e),
            Err(e) => {
                warn!(
                    task_id = %self.ctx.task_id,
                    "Could not reach purgecache service to see if caches need purging: {}",
                    e
                );
            }
        }

        if self.entries.is_empty() {
            return Ok(());
        }
        self.mounts.garbage_collect().await?;

        for entry in &self.entries {
            match entry.mount(&self.mounts, &self.ctx).await {
                Ok(mounted) => self.mounted.push(mounted),
                Err(e) => {
                    error!(task_id = %self.ctx.task_id, "[mounts] Could not mount {}: {}", entry, e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Tear down every mounted entry and persist the cache tables.
    ///
    /// `exit_code` is the exit code of the task command, or `None` if it
    /// never ran. All errors are collected; teardown never stops early.
    pub async fn stop(&mut self, exit_code: Option<i64>) -> Vec<WardenError> {
        let purge = exit_code.is_some_and(|code| {
            self.ctx.payload.on_exit_status.purge_caches.contains(&code)
        });
        if purge {
            info!(
                task_id = %self.ctx.task_id,
                "[mounts] Purging caches since last command had exit code {} which is listed in task.payload.onExitStatus.purgeCaches",
                exit_code.unwrap_or_default()
            );
        }

        let mut errors = Vec::new();
        for mounted in self.mounted.drain(..) {
            let result = if purge && mounted.entry().is_writable_cache() {
                mounted.evict(&self.mounts).await
            } else {
                mounted.unmount(&self.mounts).await
            };
            if let Err(e) = result {
                error!(
                    task_id = %self.ctx.task_id,
                    "[mounts] Could not unmount {} due to: '{}'",
                    mounted.entry(),
                    e
                );
                errors.push(e);
            }
        }

        errors.extend(self.mounts.save());
        errors
    }
}

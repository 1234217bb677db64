//! Mount entries declared in a task payload

use crate::cache::{Checkout, CheckoutGuard};
use crate::content::ContentSource;
use crate::error::{WardenError, WardenResult};
use crate::fsutil::{self, OsIdentity};
use crate::mounts::archive::{self, ArchiveFormat, Compression};
use crate::mounts::task::TaskContext;
use crate::mounts::Mounts;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

/// A named directory that survives the task and is handed to the next task
/// mounting the same cache name
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WritableDirectoryCache {
    pub cache_name: String,
    pub directory: PathBuf,
    /// Initial content, used only when the cache does not exist yet
    #[serde(default)]
    pub content: Option<ContentSource>,
    #[serde(default)]
    pub format: Option<ArchiveFormat>,
}

/// An archive extracted into a directory of the task
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReadOnlyDirectory {
    pub directory: PathBuf,
    pub content: ContentSource,
    pub format: ArchiveFormat,
}

/// A single file placed in the task directory
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FileMount {
    pub file: PathBuf,
    pub content: ContentSource,
    #[serde(default)]
    pub format: Option<Compression>,
}

/// One entry of `payload.mounts`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountEntry {
    WritableDirectoryCache(WritableDirectoryCache),
    ReadOnlyDirectory(ReadOnlyDirectory),
    File(FileMount),
}

/// How a mounted entry is held until unmount
#[derive(Debug, Clone, PartialEq, Eq)]
enum Lease {
    /// Writable cache checked out of the directory cache table; its files
    /// go back to `location` on unmount
    Cache { location: PathBuf },
    /// Writable cache already mounted by another task slot; the task got a
    /// private directory that is discarded on unmount
    Scratch,
    /// Nothing to give back
    Copy,
}

/// An entry mounted into a task directory
#[derive(Debug)]
pub struct Mounted {
    entry: MountEntry,
    target: PathBuf,
    lease: Lease,
}

impl MountEntry {
    /// Parse one mount declaration, looking for `cacheName`, `directory`
    /// and `file` in that order
    pub fn from_json(value: &serde_json::Value) -> WardenResult<Self> {
        fn parse<T: serde::de::DeserializeOwned>(
            kind: &str,
            value: &serde_json::Value,
        ) -> WardenResult<T> {
            serde_json::from_value(value.clone()).map_err(|e| {
                WardenError::MalformedPayload(format!("invalid {} mount {}: {}", kind, value, e))
            })
        }

        let marker = ["cacheName", "directory", "file"]
            .into_iter()
            .find(|field| value.get(field).is_some());

        match marker {
            Some("cacheName") => {
                let cache: WritableDirectoryCache = parse("writable directory cache", value)?;
                if cache.content.is_some() && cache.format.is_none() {
                    return Err(WardenError::MalformedPayload(format!(
                        "writable directory cache {} has content but no archive format",
                        cache.cache_name
                    )));
                }
                Ok(Self::WritableDirectoryCache(cache))
            }
            Some("directory") => parse("read only directory", value).map(Self::ReadOnlyDirectory),
            Some("file") => parse("file", value).map(Self::File),
            _ => Err(WardenError::Unrecognised {
                what: "mount entry",
                json: value.to_string(),
            }),
        }
    }

    /// Content the entry is populated from, if any
    pub fn content(&self) -> Option<&ContentSource> {
        match self {
            Self::WritableDirectoryCache(c) => c.content.as_ref(),
            Self::ReadOnlyDirectory(d) => Some(&d.content),
            Self::File(f) => Some(&f.content),
        }
    }

    /// Scopes the task needs to mount this entry, excluding content scopes
    pub fn required_scopes(&self, cache_scope_prefix: &str) -> Vec<String> {
        match self {
            Self::WritableDirectoryCache(c) => {
                vec![format!("{}{}", cache_scope_prefix, c.cache_name)]
            }
            _ => Vec::new(),
        }
    }

    pub fn is_writable_cache(&self) -> bool {
        matches!(self, Self::WritableDirectoryCache(_))
    }

    /// Path inside the task directory, as declared
    pub fn declared_path(&self) -> &Path {
        match self {
            Self::WritableDirectoryCache(c) => &c.directory,
            Self::ReadOnlyDirectory(d) => &d.directory,
            Self::File(f) => &f.file,
        }
    }

    /// Materialise the entry in the task directory
    pub async fn mount(&self, mounts: &Mounts, ctx: &TaskContext) -> WardenResult<Mounted> {
        let target = fsutil::resolve_in_task_dir(&ctx.task_dir, self.declared_path()).map_err(
            |reason| WardenError::InvalidMountPath {
                path: self.declared_path().to_path_buf(),
                reason,
            },
        )?;

        let lease = match self {
            Self::WritableDirectoryCache(cache) => {
                mount_writable_cache(cache, &target, mounts, ctx).await?
            }
            Self::ReadOnlyDirectory(dir) => {
                let cached = mounts.ensure_cached(&dir.content, ctx.index.as_ref()).await?;
                let format = dir.format;
                let identity = ctx.identity.clone();
                blocking(target.clone(), move |target| {
                    let name = cached.path.clone();
                    archive::extract(cached.into_file(), &name, format, &target)?;
                    fsutil::grant_access(&target, &identity, true).map_err(|e| {
                        WardenError::io(format!("granting task user access to {}", target.display()), e)
                    })
                })
                .await?;
                Lease::Copy
            }
            Self::File(file) => {
                if target.is_dir() {
                    return Err(WardenError::InvalidMountPath {
                        path: file.file.clone(),
                        reason: "cannot mount file since it already exists as a directory".into(),
                    });
                }
                let cached = mounts.ensure_cached(&file.content, ctx.index.as_ref()).await?;
                let compression = file.format;
                let identity = ctx.identity.clone();
                blocking(target.clone(), move |target| {
                    let name = cached.path.clone();
                    archive::decompress(cached.into_file(), &name, compression, &target)?;
                    fsutil::grant_access(&target, &identity, false).map_err(|e| {
                        WardenError::io(format!("granting task user access to {}", target.display()), e)
                    })
                })
                .await?;
                Lease::Copy
            }
        };

        info!("[mounts] Mounted {} at {}", self, target.display());
        Ok(Mounted {
            entry: self.clone(),
            target,
            lease,
        })
    }
}

async fn mount_writable_cache(
    cache: &WritableDirectoryCache,
    target: &Path,
    mounts: &Mounts,
    ctx: &TaskContext,
) -> WardenResult<Lease> {
    let table = mounts.directory_caches();
    let fresh_location = mounts.caches_dir().join(Uuid::new_v4().to_string());

    match table.check_out(&cache.cache_name, &fresh_location, mounts.worker_identity()) {
        Checkout::Existing(entry) => {
            let guard = CheckoutGuard::new(table, &cache.cache_name, &entry.location);
            info!(
                "[mounts] Moving existing writable directory cache {} from {} to {}",
                cache.cache_name,
                entry.location.display(),
                target.display()
            );
            let previous_uid = entry.owner_uid.unwrap_or(mounts.worker_identity().uid);
            let identity = ctx.identity.clone();
            let source = entry.location.clone();
            blocking(target.to_path_buf(), move |target| {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        WardenError::io(format!("not able to create directory {}", parent.display()), e)
                    })?;
                }
                fsutil::rename_cross_device(&source, &target).map_err(|e| {
                    WardenError::internal(format!(
                        "not able to rename dir {} as {}: {}",
                        source.display(),
                        target.display(),
                        e
                    ))
                })?;
                hand_over(&target, previous_uid, &identity)
            })
            .await?;
            table.set_owner(&cache.cache_name, &ctx.identity);
            guard.commit();
            Ok(Lease::Cache {
                location: entry.location,
            })
        }
        Checkout::Fresh(entry) => {
            let guard = CheckoutGuard::new(table, &cache.cache_name, &entry.location);
            info!(
                "[mounts] No existing writable directory cache '{}' - creating {}",
                cache.cache_name,
                entry.location.display()
            );
            populate(cache, target, mounts, ctx).await?;
            table.set_owner(&cache.cache_name, &ctx.identity);
            guard.commit();
            Ok(Lease::Cache {
                location: entry.location,
            })
        }
        Checkout::Busy => {
            warn!(
                "[mounts] Writable directory cache '{}' is in use by another task; mounting a private copy that will not be persisted",
                cache.cache_name
            );
            populate(cache, target, mounts, ctx).await?;
            Ok(Lease::Scratch)
        }
    }
}

/// Fill a new writable cache from its preload content, or create it empty
async fn populate(
    cache: &WritableDirectoryCache,
    target: &Path,
    mounts: &Mounts,
    ctx: &TaskContext,
) -> WardenResult<()> {
    let preload = match (&cache.content, cache.format) {
        (Some(content), Some(format)) => {
            Some((mounts.ensure_cached(content, ctx.index.as_ref()).await?, format))
        }
        _ => None,
    };
    let worker_uid = mounts.worker_identity().uid;
    let identity = ctx.identity.clone();
    blocking(target.to_path_buf(), move |target| {
        match preload {
            Some((cached, format)) => {
                let name = cached.path.clone();
                archive::extract(cached.into_file(), &name, format, &target)?
            }
            None => std::fs::create_dir_all(&target).map_err(|e| {
                WardenError::io(format!("not able to create directory {}", target.display()), e)
            })?,
        }
        hand_over(&target, worker_uid, &identity)
    })
    .await
}

/// Give the task user everything the previous owner of a cache owned
fn hand_over(target: &Path, previous_uid: u32, identity: &OsIdentity) -> WardenResult<()> {
    fsutil::exchange_ownership(target, previous_uid, identity)
        .and_then(|()| fsutil::grant_access(target, identity, false))
        .map_err(|e| {
            WardenError::internal(format!(
                "could not hand {} over to {}: {}",
                target.display(),
                identity.username,
                e
            ))
        })
}

/// Run filesystem work on the blocking pool
async fn blocking<F>(target: PathBuf, f: F) -> WardenResult<()>
where
    F: FnOnce(PathBuf) -> WardenResult<()> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(target))
        .await
        .map_err(|e| WardenError::internal(format!("mount task failed: {}", e)))?
}

/// Remove a file or directory tree on the blocking pool
async fn remove_blocking(path: PathBuf) -> WardenResult<()> {
    blocking(path, |path| {
        fsutil::remove_path(&path)
            .map_err(|e| WardenError::io(format!("removing {}", path.display()), e))
    })
    .await
}

impl Mounted {
    pub fn entry(&self) -> &MountEntry {
        &self.entry
    }

    /// Absolute path of the mount inside the task directory
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Tear the mount down after the task. Writable caches are moved back
    /// to their cache location; everything else is left for the task
    /// directory cleanup.
    pub async fn unmount(&self, mounts: &Mounts) -> WardenResult<()> {
        let MountEntry::WritableDirectoryCache(cache) = &self.entry else {
            return Ok(());
        };
        let table = mounts.directory_caches();

        match &self.lease {
            Lease::Copy => Ok(()),
            Lease::Scratch => {
                info!(
                    "[mounts] Discarding private copy of writable directory cache '{}'",
                    cache.cache_name
                );
                remove_blocking(self.target.clone()).await
            }
            Lease::Cache { location } => {
                if !table.is_checked_out_at(&cache.cache_name, location) {
                    info!(
                        "[mounts] Writable directory cache '{}' was evicted while mounted; not preserving it",
                        cache.cache_name
                    );
                    return Ok(());
                }
                info!(
                    "[mounts] Preserving cache: Moving {:?} to {:?}",
                    self.target, location
                );
                let (from, to) = (self.target.clone(), location.clone());
                let moved =
                    tokio::task::spawn_blocking(move || fsutil::rename_cross_device(&from, &to))
                        .await
                        .map_err(|e| WardenError::internal(format!("unmount task failed: {}", e)))?;

                match moved {
                    Ok(()) => {
                        if !table.check_in(&cache.cache_name, location) {
                            info!(
                                "[mounts] Writable directory cache '{}' was evicted while being preserved; deleting it",
                                cache.cache_name
                            );
                            remove_blocking(location.clone()).await?;
                        }
                        Ok(())
                    }
                    Err(e) => {
                        // The task moved, deleted or locked the cache. Drop it so a
                        // future task gets a fresh one.
                        table.evict_async(&cache.cache_name).await?;
                        if let Err(cleanup) = remove_blocking(location.clone()).await {
                            warn!(
                                "[mounts] Could not clean up cache location {}: {}",
                                location.display(),
                                cleanup
                            );
                        }
                        Err(WardenError::CachePersist {
                            key: cache.cache_name.clone(),
                            reason: e.to_string(),
                        })
                    }
                }
            }
        }
    }

    /// Discard a writable cache instead of preserving it
    pub async fn evict(&self, mounts: &Mounts) -> WardenResult<()> {
        let MountEntry::WritableDirectoryCache(cache) = &self.entry else {
            return Ok(());
        };
        if let Lease::Cache { location } = &self.lease {
            let table = mounts.directory_caches();
            if table.is_checked_out_at(&cache.cache_name, location) {
                info!(
                    "[mounts] Evicting writable directory cache '{}'",
                    cache.cache_name
                );
                table.evict_async(&cache.cache_name).await?;
            }
        }
        remove_blocking(self.target.clone()).await
    }
}

impl fmt::Display for MountEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WritableDirectoryCache(c) => {
                write!(f, "writable directory cache '{}'", c.cache_name)
            }
            Self::ReadOnlyDirectory(d) => {
                write!(f, "read only directory ({} {})", d.format, d.content)
            }
            Self::File(file) => write!(f, "file ({})", file.content),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::mounts::testing::{mounts, MemoryQueue, NoIndex};
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn context(temp: &TempDir) -> TaskContext {
        let task_dir = temp.path().join("task_1");
        std::fs::create_dir_all(&task_dir).unwrap();
        TaskContext::new("task-1", task_dir, Arc::new(NoIndex))
    }

    #[test]
    fn detects_mount_kinds() {
        let cache = MountEntry::from_json(&json!({
            "cacheName": "gradle",
            "directory": ".gradle"
        }))
        .unwrap();
        assert!(cache.is_writable_cache());
        assert_eq!(cache.required_scopes("worker:cache:"), vec!["worker:cache:gradle"]);
        assert!(cache.content().is_none());

        let dir = MountEntry::from_json(&json!({
            "directory": "toolchain",
            "content": {"url": "https://example.com/toolchain.tar.gz"},
            "format": "tar.gz"
        }))
        .unwrap();
        assert!(matches!(dir, MountEntry::ReadOnlyDirectory(_)));
        assert!(dir.required_scopes("worker:cache:").is_empty());

        let file = MountEntry::from_json(&json!({
            "file": "config/settings.json",
            "content": {"raw": "{}"}
        }))
        .unwrap();
        assert!(matches!(file, MountEntry::File(FileMount { format: None, .. })));
    }

    #[test]
    fn rejects_malformed_entries() {
        let unknown = MountEntry::from_json(&json!({"volume": "x"})).unwrap_err();
        assert!(matches!(unknown, WardenError::Unrecognised { what: "mount entry", .. }));

        let rar = MountEntry::from_json(&json!({
            "directory": "d",
            "content": {"raw": "x"},
            "format": "rar"
        }))
        .unwrap_err();
        assert_eq!(rar.kind(), ErrorKind::MalformedPayload);

        let no_format = MountEntry::from_json(&json!({
            "cacheName": "c",
            "directory": "d",
            "content": {"raw": "x"}
        }))
        .unwrap_err();
        assert_eq!(no_format.kind(), ErrorKind::MalformedPayload);
    }

    #[tokio::test]
    async fn file_mount_decompresses_into_task_dir() {
        let temp = TempDir::new().unwrap();
        let mounts = mounts(&temp, Arc::new(MemoryQueue::default()));
        let ctx = context(&temp);
        let entry = MountEntry::from_json(&json!({
            "file": "etc/greeting.txt",
            "content": {"base64": "aGVsbG8="}
        }))
        .unwrap();

        let mounted = entry.mount(&mounts, &ctx).await.unwrap();

        assert_eq!(mounted.target(), ctx.task_dir.join("etc/greeting.txt"));
        assert_eq!(std::fs::read_to_string(mounted.target()).unwrap(), "hello");
        mounted.unmount(&mounts).await.unwrap();
        assert!(mounted.target().exists());
    }

    #[tokio::test]
    async fn file_mount_over_directory_fails() {
        let temp = TempDir::new().unwrap();
        let mounts = mounts(&temp, Arc::new(MemoryQueue::default()));
        let ctx = context(&temp);
        std::fs::create_dir_all(ctx.task_dir.join("occupied")).unwrap();
        let entry = MountEntry::from_json(&json!({
            "file": "occupied",
            "content": {"raw": "x"}
        }))
        .unwrap();

        let err = entry.mount(&mounts, &ctx).await.unwrap_err();
        assert!(matches!(err, WardenError::InvalidMountPath { .. }));
        assert_eq!(err.kind(), ErrorKind::TaskFailure);
    }

    #[tokio::test]
    async fn escaping_mount_path_is_rejected() {
        let temp = TempDir::new().unwrap();
        let mounts = mounts(&temp, Arc::new(MemoryQueue::default()));
        let ctx = context(&temp);
        let entry = MountEntry::from_json(&json!({
            "file": "../../etc/passwd",
            "content": {"raw": "x"}
        }))
        .unwrap();

        let err = entry.mount(&mounts, &ctx).await.unwrap_err();
        assert!(matches!(err, WardenError::InvalidMountPath { .. }));
        assert!(mounts.file_caches().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn mount_through_planted_symlink_is_rejected() {
        let temp = TempDir::new().unwrap();
        let mounts = mounts(&temp, Arc::new(MemoryQueue::default()));
        let ctx = context(&temp);
        let outside = temp.path().join("outside");
        std::fs::create_dir(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, ctx.task_dir.join("link")).unwrap();

        for declaration in [
            json!({"file": "link/pwned", "content": {"raw": "owned"}}),
            json!({"cacheName": "c", "directory": "link/cache"}),
            json!({"directory": "link", "content": {"raw": "x"}, "format": "tar"}),
        ] {
            let entry = MountEntry::from_json(&declaration).unwrap();
            let err = entry.mount(&mounts, &ctx).await.unwrap_err();
            assert!(
                matches!(err, WardenError::InvalidMountPath { .. }),
                "{}: {:?}",
                declaration,
                err
            );
        }

        assert_eq!(std::fs::read_dir(&outside).unwrap().count(), 0);
        assert!(mounts.directory_caches().is_empty());
    }

    #[tokio::test]
    async fn mount_at_task_dir_itself_is_rejected() {
        let temp = TempDir::new().unwrap();
        let mounts = mounts(&temp, Arc::new(MemoryQueue::default()));
        let ctx = context(&temp);
        std::fs::write(ctx.task_dir.join("keep.txt"), "mine").unwrap();

        for declaration in [
            json!({"cacheName": "c", "directory": "."}),
            json!({"cacheName": "c", "directory": ""}),
            json!({"directory": ".", "content": {"raw": "x"}, "format": "tar"}),
        ] {
            let entry = MountEntry::from_json(&declaration).unwrap();
            let err = entry.mount(&mounts, &ctx).await.unwrap_err();
            assert!(matches!(err, WardenError::InvalidMountPath { .. }));
        }

        assert!(!mounts.directory_caches().contains("c"));
        assert_eq!(
            std::fs::read_to_string(ctx.task_dir.join("keep.txt")).unwrap(),
            "mine"
        );
    }

    #[tokio::test]
    async fn writable_cache_round_trip() {
        let temp = TempDir::new().unwrap();
        let mounts = mounts(&temp, Arc::new(MemoryQueue::default()));
        let ctx = context(&temp);
        let entry = MountEntry::from_json(&json!({
            "cacheName": "cargo",
            "directory": "target"
        }))
        .unwrap();

        let first = entry.mount(&mounts, &ctx).await.unwrap();
        std::fs::write(first.target().join("build.log"), "built").unwrap();
        first.unmount(&mounts).await.unwrap();
        assert!(!first.target().exists());

        let cache = mounts.directory_caches().get("cargo").unwrap();
        assert!(!cache.is_checked_out());
        assert!(cache.location.join("build.log").exists());

        let second = entry.mount(&mounts, &ctx).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(second.target().join("build.log")).unwrap(),
            "built"
        );
        assert_eq!(mounts.directory_caches().get("cargo").unwrap().hits, 2);
    }

    #[tokio::test]
    async fn garbage_collection_racing_a_mount_keeps_the_cache() {
        let temp = TempDir::new().unwrap();
        let mounts = mounts(&temp, Arc::new(MemoryQueue::default()));
        let ctx = context(&temp);
        let entry = MountEntry::from_json(&json!({
            "cacheName": "cargo",
            "directory": "target"
        }))
        .unwrap();
        let first = entry.mount(&mounts, &ctx).await.unwrap();
        std::fs::write(first.target().join("build.log"), "built").unwrap();
        first.unmount(&mounts).await.unwrap();

        let mut candidates =
            crate::cache::gc_candidates(mounts.file_caches(), mounts.directory_caches());
        let second = entry.mount(&mounts, &ctx).await.unwrap();
        assert!(!crate::cache::evict_next(&mut candidates).unwrap());

        second.unmount(&mounts).await.unwrap();
        let cache = mounts.directory_caches().get("cargo").unwrap();
        assert!(!cache.is_checked_out());
        assert_eq!(
            std::fs::read_to_string(cache.location.join("build.log")).unwrap(),
            "built"
        );
    }

    #[tokio::test]
    async fn writable_cache_in_use_gets_private_copy() {
        let temp = TempDir::new().unwrap();
        let mounts = mounts(&temp, Arc::new(MemoryQueue::default()));
        let ctx = context(&temp);
        let other_dir = temp.path().join("task_2");
        std::fs::create_dir_all(&other_dir).unwrap();
        let other = TaskContext::new("task-2", other_dir, Arc::new(NoIndex));
        let entry = MountEntry::from_json(&json!({
            "cacheName": "cargo",
            "directory": "target"
        }))
        .unwrap();

        let held = entry.mount(&mounts, &ctx).await.unwrap();
        let scratch = entry.mount(&mounts, &other).await.unwrap();
        assert!(scratch.target().is_dir());

        scratch.unmount(&mounts).await.unwrap();
        assert!(!scratch.target().exists());
        assert!(mounts.directory_caches().get("cargo").unwrap().is_checked_out());

        held.unmount(&mounts).await.unwrap();
        assert!(!mounts.directory_caches().get("cargo").unwrap().is_checked_out());
    }

    #[tokio::test]
    async fn writable_cache_removed_by_task_is_evicted() {
        let temp = TempDir::new().unwrap();
        let mounts = mounts(&temp, Arc::new(MemoryQueue::default()));
        let ctx = context(&temp);
        let entry = MountEntry::from_json(&json!({
            "cacheName": "cargo",
            "directory": "target"
        }))
        .unwrap();

        let mounted = entry.mount(&mounts, &ctx).await.unwrap();
        std::fs::remove_dir_all(mounted.target()).unwrap();

        let err = mounted.unmount(&mounts).await.unwrap_err();
        assert!(matches!(err, WardenError::CachePersist { .. }));
        assert_eq!(err.kind(), ErrorKind::TaskFailure);
        assert!(!mounts.directory_caches().contains("cargo"));

        // A later task gets a fresh cache
        let again = entry.mount(&mounts, &ctx).await.unwrap();
        assert!(again.target().is_dir());
        assert_eq!(mounts.directory_caches().get("cargo").unwrap().hits, 1);
    }

    #[tokio::test]
    async fn preloaded_writable_cache_is_extracted() {
        let temp = TempDir::new().unwrap();
        let queue = Arc::new(MemoryQueue::default());
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(4);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "seed.txt", &b"seed"[..]).unwrap();
        queue.publish("dep", "public/seed.tar", &builder.into_inner().unwrap());
        let mounts = mounts(&temp, Arc::clone(&queue));
        let ctx = context(&temp);
        let entry = MountEntry::from_json(&json!({
            "cacheName": "seeded",
            "directory": "cache",
            "content": {"taskId": "dep", "artifact": "public/seed.tar"},
            "format": "tar"
        }))
        .unwrap();

        let mounted = entry.mount(&mounts, &ctx).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(mounted.target().join("seed.txt")).unwrap(),
            "seed"
        );
        assert_eq!(mounts.file_caches().len(), 1);
    }

    #[tokio::test]
    async fn failed_preload_leaves_no_cache_entry() {
        let temp = TempDir::new().unwrap();
        let mounts = mounts(&temp, Arc::new(MemoryQueue::default()));
        let ctx = context(&temp);
        let entry = MountEntry::from_json(&json!({
            "cacheName": "seeded",
            "directory": "cache",
            "content": {"taskId": "dep", "artifact": "public/missing.tar"},
            "format": "tar"
        }))
        .unwrap();

        let err = entry.mount(&mounts, &ctx).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::TaskFailure);
        assert!(!mounts.directory_caches().contains("seeded"));
    }
}

//! Task mounts
//!
//! A task's payload may declare mounts that are set up in the task
//! directory before the task command runs and torn down afterwards:
//!
//! - `WritableDirectoryCache`: a named directory persisted between tasks
//! - `ReadOnlyDirectory`: an archive extracted into a directory
//! - `FileMount`: a single (optionally compressed) file
//!
//! Downloaded content and writable caches are kept in the worker-wide
//! [`CacheTable`]s owned by [`Mounts`].

pub mod archive;
pub mod entry;
pub mod task;

pub use archive::{ArchiveFormat, Compression};
pub use entry::{FileMount, MountEntry, Mounted, ReadOnlyDirectory, WritableDirectoryCache};
pub use task::{OnExitStatus, TaskContext, TaskMount, TaskPayload};

use crate::cache::{self, CacheEntry, CacheTable};
use crate::clients::{Index, PurgeCacheService, Queue};
use crate::config::schema::{HttpConfig, MountsConfig};
use crate::config::{Config, ConfigManager};
use crate::content::ContentSource;
use crate::error::{WardenError, WardenResult};
use crate::fsutil::{self, OsIdentity};
use crate::purge::PurgeCoordinator;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Seek};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

/// A file in the file cache, held open so that a concurrent eviction
/// cannot take the content away before it is used
#[derive(Debug)]
pub struct CachedFile {
    pub path: PathBuf,
    pub sha256: String,
    file: File,
}

impl CachedFile {
    /// The open file, positioned at its start
    pub fn into_file(self) -> File {
        self.file
    }
}

impl PartialEq for CachedFile {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path && self.sha256 == other.sha256
    }
}

impl Eq for CachedFile {}

/// Worker-wide mount state shared by all task slots
pub struct Mounts {
    config: MountsConfig,
    http: HttpConfig,
    caches_dir: PathBuf,
    downloads_dir: PathBuf,
    file_caches_path: PathBuf,
    directory_caches_path: PathBuf,
    file_caches: CacheTable,
    directory_caches: CacheTable,
    worker_identity: OsIdentity,
    purge: PurgeCoordinator,
    queue: Arc<dyn Queue>,
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Mounts {
    /// Load both cache tables from the state directory
    pub fn initialise(
        config: &Config,
        queue: Arc<dyn Queue>,
        purge_service: Arc<dyn PurgeCacheService>,
    ) -> WardenResult<Self> {
        let caches_dir = ConfigManager::caches_dir(config);
        let downloads_dir = ConfigManager::downloads_dir(config);
        let file_caches_path = ConfigManager::file_caches_path(config);
        let directory_caches_path = ConfigManager::directory_caches_path(config);

        if let Some(state_dir) = file_caches_path.parent() {
            std::fs::create_dir_all(state_dir).map_err(|e| {
                WardenError::io(format!("creating state directory {}", state_dir.display()), e)
            })?;
        }

        let file_caches = CacheTable::load("file", &file_caches_path, &downloads_dir)?;
        let directory_caches =
            CacheTable::load("directory", &directory_caches_path, &caches_dir)?;

        Ok(Self {
            config: config.mounts.clone(),
            http: config.http.clone(),
            caches_dir,
            downloads_dir,
            file_caches_path,
            directory_caches_path,
            file_caches,
            directory_caches,
            worker_identity: OsIdentity::current(),
            purge: PurgeCoordinator::new(
                purge_service,
                config.worker.worker_pool_id.clone(),
                &config.mounts,
            ),
            queue,
            inflight: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &MountsConfig {
        &self.config
    }

    pub fn file_caches(&self) -> &CacheTable {
        &self.file_caches
    }

    pub fn directory_caches(&self) -> &CacheTable {
        &self.directory_caches
    }

    pub fn purge(&self) -> &PurgeCoordinator {
        &self.purge
    }

    pub fn caches_dir(&self) -> &Path {
        &self.caches_dir
    }

    pub(crate) fn worker_identity(&self) -> &OsIdentity {
        &self.worker_identity
    }

    /// Path of the file holding `source`, downloading it if it is not
    /// cached or the cached copy no longer has the required SHA256.
    ///
    /// Concurrent calls for the same content wait for the first one rather
    /// than downloading twice.
    pub async fn ensure_cached(
        &self,
        source: &ContentSource,
        index: &dyn Index,
    ) -> WardenResult<CachedFile> {
        let source = source.resolve(index).await?;
        let key = source
            .unique_key()
            .ok_or_else(|| WardenError::internal(format!("no cache key for {}", source)))?;

        let lock = {
            let mut map = self.inflight.lock().await;
            Arc::clone(
                map.entry(key.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };

        let result = {
            let _guard = lock.lock().await;
            self.ensure_cached_locked(&source, &key).await
        };

        let mut map = self.inflight.lock().await;
        if Arc::strong_count(&lock) == 2 {
            map.remove(&key);
        }
        result
    }

    async fn ensure_cached_locked(
        &self,
        source: &ContentSource,
        key: &str,
    ) -> WardenResult<CachedFile> {
        let required = source.required_sha256();

        if let Some(entry) = self.file_caches.touch(key) {
            let Some((file, sha256)) = self.open_cached_file(&entry).await? else {
                return self.download(source, key, required).await;
            };
            match required.as_deref() {
                None => {
                    warn!(
                        "[mounts] No SHA256 specified in task mounts for {} - SHA256 from downloaded file {} is {}",
                        key,
                        entry.location.display(),
                        sha256
                    );
                    return Ok(CachedFile {
                        path: entry.location,
                        sha256,
                        file,
                    });
                }
                Some(required) if required == sha256 => {
                    info!(
                        "[mounts] Found existing download for {} ({}) with correct SHA256 {}",
                        key,
                        entry.location.display(),
                        sha256
                    );
                    return Ok(CachedFile {
                        path: entry.location,
                        sha256,
                        file,
                    });
                }
                Some(required) => {
                    info!(
                        "[mounts] Found existing download of {} ({}) with SHA256 {} but task definition explicitly requires {} so deleting it",
                        key,
                        entry.location.display(),
                        sha256,
                        required
                    );
                    drop(file);
                    self.file_caches.evict_async(key).await?;
                }
            }
        }

        self.download(source, key, required).await
    }

    /// Download `source` into a new file cache entry under `key`
    async fn download(
        &self,
        source: &ContentSource,
        key: &str,
        required: Option<String>,
    ) -> WardenResult<CachedFile> {
        let dest = self.downloads_dir.join(Uuid::new_v4().to_string());
        let downloaded = match source.download(self.queue.as_ref(), &self.http, &dest).await {
            Ok(downloaded) => downloaded,
            Err(e) => {
                error!(
                    "[mounts] Could not fetch from {} into file {} due to {}",
                    source,
                    dest.display(),
                    e
                );
                let _ = fsutil::remove_path(&dest);
                return Err(e);
            }
        };

        match required {
            None => warn!(
                "[mounts] Download {} of {} has SHA256 {} but task payload does not declare a required value, so content authenticity cannot be verified",
                dest.display(),
                source,
                downloaded.sha256
            ),
            Some(required) if required != downloaded.sha256 => {
                fsutil::remove_path(&dest).map_err(|e| {
                    WardenError::io(format!("removing mismatched download {}", dest.display()), e)
                })?;
                return Err(WardenError::HashMismatch {
                    source_desc: source.to_string(),
                    file: dest,
                    actual: downloaded.sha256,
                    required,
                });
            }
            Some(_) => info!(
                "[mounts] Content from {} ({}) matches required SHA256 {}",
                source,
                dest.display(),
                downloaded.sha256
            ),
        }

        let file = File::open(&dest)
            .map_err(|e| WardenError::io(format!("opening download {}", dest.display()), e))?;
        self.file_caches
            .insert(CacheEntry::new(key, &dest).with_sha256(downloaded.sha256.clone()));
        Ok(CachedFile {
            path: dest,
            sha256: downloaded.sha256,
            file,
        })
    }

    /// Open a cached file and hash it through the open handle. `None` means
    /// the file was evicted concurrently and should be downloaded again; a
    /// file missing while its entry is still in the table is corruption.
    async fn open_cached_file(&self, entry: &CacheEntry) -> WardenResult<Option<(File, String)>> {
        let location = entry.location.clone();
        let opened = tokio::task::spawn_blocking(move || -> io::Result<(File, String)> {
            let mut file = File::open(&location)?;
            let sha256 = fsutil::sha256_reader(&file)?;
            file.rewind()?;
            Ok((file, sha256))
        })
        .await
        .map_err(|e| WardenError::internal(format!("hash task failed: {}", e)))?;

        match opened {
            Ok(opened) => Ok(Some(opened)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let still_cached = self
                    .file_caches
                    .get(&entry.key)
                    .is_some_and(|current| current.location == entry.location);
                if still_cached {
                    Err(WardenError::CacheCorrupt {
                        key: entry.key.clone(),
                        location: entry.location.clone(),
                    })
                } else {
                    info!(
                        "[mounts] Cached file {} was evicted while being looked up; downloading again",
                        entry.location.display()
                    );
                    Ok(None)
                }
            }
            Err(e) => Err(WardenError::internal(format!(
                "cannot calculate SHA256 of file {} in cache: {}",
                entry.location.display(),
                e
            ))),
        }
    }

    /// Evict caches until the caches directory has the configured free
    /// space. Returns how many caches were evicted.
    pub async fn garbage_collect(&self) -> WardenResult<usize> {
        let resources = cache::gc_candidates(&self.file_caches, &self.directory_caches);
        let required = self.config.required_free_space_bytes();
        let caches_dir = self.caches_dir.clone();
        tokio::task::spawn_blocking(move || {
            cache::run_garbage_collection(resources, required, || {
                fsutil::free_space(&caches_dir).map_err(|e| {
                    WardenError::internal(format!(
                        "cannot determine free space in {}: {}",
                        caches_dir.display(),
                        e
                    ))
                })
            })
        })
        .await
        .map_err(|e| WardenError::internal(format!("garbage collection task failed: {}", e)))?
    }

    /// Persist both cache tables, readable only by the worker
    pub fn save(&self) -> Vec<WardenError> {
        let mut errors = Vec::new();
        for (table, path) in [
            (&self.file_caches, &self.file_caches_path),
            (&self.directory_caches, &self.directory_caches_path),
        ] {
            if let Err(e) = table.save(path) {
                errors.push(e);
            }
        }
        let paths: Vec<&Path> = [&self.file_caches_path, &self.directory_caches_path]
            .into_iter()
            .filter(|p| p.exists())
            .map(PathBuf::as_path)
            .collect();
        if let Err(source) = fsutil::secure_files(&paths) {
            errors.push(WardenError::internal(format!(
                "could not secure cache table snapshots: {}",
                source
            )));
        }
        errors
    }
}

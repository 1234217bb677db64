//! Cache tables
//!
//! A cache table maps a content key to a [`CacheEntry`] describing a file or
//! directory the worker keeps between tasks. The worker owns two tables, one
//! for downloaded files and one for writable directory caches. Both are
//! shared by every task slot, so the map lives behind a mutex and is only
//! reachable through the atomic operations below. The lock is never held
//! across filesystem I/O other than a `stat`.

use crate::cache::resource::{sort_by_rating, Resource, Resources};
use crate::error::{WardenError, WardenResult};
use crate::fsutil::{self, OsIdentity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info, warn};

/// A file or directory kept on the worker between tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// When the entry was first materialised
    pub created: DateTime<Utc>,

    /// Absolute path of the file or directory
    pub location: PathBuf,

    /// Number of tasks that have used this entry, starting at 1
    pub hits: u64,

    /// Key of this entry in its table
    pub key: String,

    /// SHA256 of the content (files only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,

    /// User that last had write access, so ownership can be handed over to
    /// the next task user
    #[serde(rename = "ownerUsername", default)]
    pub owner_username: String,

    #[serde(rename = "mounterUID", default)]
    pub owner_uid: Option<u32>,

    #[serde(rename = "mounterGID", default)]
    pub owner_gid: Option<u32>,

    /// The table tracking this entry. Never serialised; the table already
    /// contains the entry.
    #[serde(skip)]
    table: TableHandle,

    /// Set while a task has the entry mounted
    #[serde(skip)]
    checked_out: bool,
}

impl CacheEntry {
    /// Create a new entry with one hit
    pub fn new(key: impl Into<String>, location: impl Into<PathBuf>) -> Self {
        Self {
            created: Utc::now(),
            location: location.into(),
            hits: 1,
            key: key.into(),
            sha256: None,
            owner_username: String::new(),
            owner_uid: None,
            owner_gid: None,
            table: TableHandle::default(),
            checked_out: false,
        }
    }

    /// Record the SHA256 of a file entry
    pub fn with_sha256(mut self, sha256: impl Into<String>) -> Self {
        self.sha256 = Some(sha256.into());
        self
    }

    /// Record the identity that owns the entry's files
    pub fn with_owner(mut self, owner: &OsIdentity) -> Self {
        self.set_owner(owner);
        self
    }

    fn set_owner(&mut self, owner: &OsIdentity) {
        self.owner_username = owner.username.clone();
        self.owner_uid = Some(owner.uid);
        self.owner_gid = Some(owner.gid);
    }

    /// Whether a task currently has this entry mounted
    pub fn is_checked_out(&self) -> bool {
        self.checked_out
    }
}

impl Resource for CacheEntry {
    /// Number of tasks that used the entry; size on disk does not count
    fn rating(&self) -> f64 {
        self.hits as f64
    }

    /// Garbage collection eviction. An entry a task checked out after it
    /// was listed stays in the table and on disk.
    fn evict(&self) -> WardenResult<bool> {
        if let Some(table) = self.table.upgrade() {
            match table.claim(&self.key, &self.location, false) {
                Claim::CheckedOut => {
                    info!(
                        "[mounts] Not evicting cache {}: a task has mounted it since garbage collection started",
                        self.key
                    );
                    return Ok(false);
                }
                Claim::Idle => info!("[mounts] Removed cache {} from cache table", self.key),
                Claim::Gone => {}
            }
        }
        self.delete_files().map(|()| true)
    }

    fn describe(&self) -> String {
        format!("cache {} at {}", self.key, self.location.display())
    }
}

impl CacheEntry {
    fn delete_files(&self) -> WardenResult<()> {
        info!(
            "[mounts] Deleting cache {} file(s) at {}",
            self.key,
            self.location.display()
        );
        fsutil::remove_path(&self.location).map_err(|source| WardenError::EvictionFailed {
            key: self.key.clone(),
            location: self.location.clone(),
            source,
        })
    }
}

/// What [`CacheTable::claim`] found for an entry
enum Claim {
    /// The entry was not in use and has been removed from the table
    Idle,
    /// A task has the entry mounted
    CheckedOut,
    /// The key is absent or now refers to another location
    Gone,
}

/// Non-owning handle from an entry back to its table
#[derive(Clone, Default)]
struct TableHandle(Weak<TableShared>);

impl TableHandle {
    fn upgrade(&self) -> Option<CacheTable> {
        self.0.upgrade().map(|shared| CacheTable { shared })
    }
}

impl fmt::Debug for TableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.upgrade() {
            Some(shared) => write!(f, "TableHandle({})", shared.name),
            None => write!(f, "TableHandle(detached)"),
        }
    }
}

struct TableShared {
    name: String,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

/// Outcome of checking out a writable cache
#[derive(Debug)]
pub enum Checkout {
    /// The cache existed and is now reserved for the caller
    Existing(CacheEntry),
    /// A new entry was created and reserved for the caller
    Fresh(CacheEntry),
    /// Another task slot has the cache mounted
    Busy,
}

/// Mutex guarded map of content key to cache entry
#[derive(Clone)]
pub struct CacheTable {
    shared: Arc<TableShared>,
}

impl fmt::Debug for CacheTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheTable")
            .field("name", &self.shared.name)
            .field("len", &self.len())
            .finish()
    }
}

impl CacheTable {
    /// Create an empty table
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(TableShared {
                name: name.into(),
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Load a table from its snapshot, creating `resource_dir` (the backing
    /// store of the table's entries) if needed.
    ///
    /// Entries whose backing path no longer exists are dropped with a
    /// warning. A missing or unreadable snapshot gives an empty table. Only
    /// failing to create `resource_dir` is an error.
    pub fn load(name: impl Into<String>, snapshot: &Path, resource_dir: &Path) -> WardenResult<Self> {
        let table = Self::new(name);

        ensure_private_dir(resource_dir)?;

        if !snapshot.exists() {
            info!(
                "No {} file found, creating empty {} cache table",
                snapshot.display(),
                table.name()
            );
            return Ok(table);
        }

        let loaded: HashMap<String, CacheEntry> = match std::fs::read_to_string(snapshot)
            .map_err(|e| e.to_string())
            .and_then(|content| serde_json::from_str(&content).map_err(|e| e.to_string()))
        {
            Ok(loaded) => loaded,
            Err(reason) => {
                warn!(
                    "Could not read cache table {}: {}; starting with an empty table",
                    snapshot.display(),
                    reason
                );
                return Ok(table);
            }
        };

        let mut entries = table.lock();
        for (key, mut entry) in loaded {
            if !entry.location.exists() {
                warn!(
                    "Cache {} missing on worker at {} - corrupt internal state, ignoring",
                    key,
                    entry.location.display()
                );
                continue;
            }
            entry.key = key.clone();
            entry.table = table.handle();
            entries.insert(key, entry);
        }
        debug!("Loaded {} {} cache(s)", entries.len(), table.name());
        drop(entries);

        Ok(table)
    }

    /// Persist the table as a JSON object keyed by content key, readable
    /// only by the worker
    pub fn save(&self, snapshot: &Path) -> WardenResult<()> {
        let ordered: BTreeMap<String, CacheEntry> = self
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        fsutil::write_json_atomic(snapshot, &ordered).map_err(|source| WardenError::SnapshotWrite {
            path: snapshot.to_path_buf(),
            source,
        })
    }

    /// Table name, used in logs
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the table has no entries
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Whether `key` is present
    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// Snapshot of the entry for `key`
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.lock().get(key).cloned()
    }

    /// Count one more use of `key`, returning the updated entry
    pub fn touch(&self, key: &str) -> Option<CacheEntry> {
        let mut entries = self.lock();
        let entry = entries.get_mut(key)?;
        entry.hits += 1;
        Some(entry.clone())
    }

    /// Insert or replace an entry, returning the replaced one
    pub fn insert(&self, mut entry: CacheEntry) -> Option<CacheEntry> {
        entry.table = self.handle();
        self.lock().insert(entry.key.clone(), entry)
    }

    /// Remove an entry from the table without touching the filesystem
    pub fn remove(&self, key: &str) -> Option<CacheEntry> {
        self.lock().remove(key)
    }

    /// Take `key` out of the table for eviction if it still refers to
    /// `location`. A stale snapshot never removes a newer entry stored under
    /// the same key. Checked-out entries are only removed when
    /// `forget_checked_out` is set.
    fn claim(&self, key: &str, location: &Path, forget_checked_out: bool) -> Claim {
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.location != location => Claim::Gone,
            Some(entry) if entry.checked_out => {
                if forget_checked_out {
                    entries.remove(key);
                }
                Claim::CheckedOut
            }
            Some(_) => {
                entries.remove(key);
                Claim::Idle
            }
            None => Claim::Gone,
        }
    }

    /// Remove `key` from the table and delete its files. Returns whether
    /// there was anything to evict.
    ///
    /// A checked-out entry is only forgotten: its files live in a task
    /// directory, and the mount holding them finds the reservation gone on
    /// unmount and leaves them to the task directory cleanup.
    pub fn evict(&self, key: &str) -> WardenResult<bool> {
        let Some(entry) = self.get(key) else {
            return Ok(false);
        };
        match self.claim(key, &entry.location, true) {
            Claim::Idle => entry.delete_files().map(|()| true),
            Claim::CheckedOut => {
                info!(
                    "[mounts] Forgetting cache {} while it is mounted by a task",
                    key
                );
                Ok(true)
            }
            Claim::Gone => Ok(false),
        }
    }

    /// [`evict`](Self::evict) on the blocking thread pool
    pub async fn evict_async(&self, key: &str) -> WardenResult<bool> {
        let table = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || table.evict(&key))
            .await
            .map_err(|e| WardenError::internal(format!("eviction task failed: {}", e)))?
    }

    /// Reserve the writable cache `key` for one task.
    ///
    /// An existing entry gets one more hit. A missing one is created at
    /// `fresh_location`, owned by `owner`. While reserved, the entry's files
    /// live in the task directory rather than at `location`.
    pub fn check_out(&self, key: &str, fresh_location: &Path, owner: &OsIdentity) -> Checkout {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(key) {
            if entry.checked_out {
                return Checkout::Busy;
            }
            entry.hits += 1;
            entry.checked_out = true;
            return Checkout::Existing(entry.clone());
        }

        let mut entry = CacheEntry::new(key, fresh_location).with_owner(owner);
        entry.table = self.handle();
        entry.checked_out = true;
        entries.insert(key.to_string(), entry.clone());
        Checkout::Fresh(entry)
    }

    /// Return a reserved cache whose files are back at `location`. Returns
    /// false if the entry was evicted or replaced while it was checked out.
    pub fn check_in(&self, key: &str, location: &Path) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.checked_out && entry.location == location => {
                entry.checked_out = false;
                true
            }
            _ => false,
        }
    }

    /// Whether `key` is still reserved at `location`
    pub fn is_checked_out_at(&self, key: &str, location: &Path) -> bool {
        self.lock()
            .get(key)
            .is_some_and(|e| e.checked_out && e.location == location)
    }

    /// Undo a reservation that never completed: keep the entry if its files
    /// are still at `location`, otherwise forget it
    fn abandon_checkout(&self, key: &str, location: &Path) {
        let still_on_disk = location.exists();
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        if !entry.checked_out || entry.location != location {
            return;
        }
        if still_on_disk {
            entry.checked_out = false;
        } else {
            warn!("[mounts] Dropping cache {} after an incomplete mount", key);
            entries.remove(key);
        }
    }

    /// Record the identity now owning the files of `key`
    pub fn set_owner(&self, key: &str, owner: &OsIdentity) {
        if let Some(entry) = self.lock().get_mut(key) {
            entry.set_owner(owner);
        }
    }

    /// Snapshot of all entries, oldest first
    pub fn entries(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = self.lock().values().cloned().collect();
        entries.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.key.cmp(&b.key)));
        entries
    }

    /// Entries not currently mounted by a task, least valuable first. Equally
    /// rated entries stay oldest first.
    pub fn sorted_resources(&self) -> Resources {
        let mut resources: Resources = self
            .entries()
            .into_iter()
            .filter(|e| !e.checked_out)
            .map(|e| Box::new(e) as Box<dyn Resource>)
            .collect();
        sort_by_rating(&mut resources);
        resources
    }

    fn handle(&self) -> TableHandle {
        TableHandle(Arc::downgrade(&self.shared))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.shared
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases a checkout unless the mount that took it completes
pub struct CheckoutGuard {
    table: CacheTable,
    key: String,
    location: PathBuf,
    armed: bool,
}

impl CheckoutGuard {
    /// Guard the reservation of `key` at `location`
    pub fn new(table: &CacheTable, key: &str, location: &Path) -> Self {
        Self {
            table: table.clone(),
            key: key.to_string(),
            location: location.to_path_buf(),
            armed: true,
        }
    }

    /// The mount completed; keep the reservation
    pub fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for CheckoutGuard {
    fn drop(&mut self) {
        if self.armed {
            self.table.abandon_checkout(&self.key, &self.location);
        }
    }
}

fn ensure_private_dir(dir: &Path) -> WardenResult<()> {
    std::fs::create_dir_all(dir).map_err(|e| {
        WardenError::internal(format!(
            "not able to create worker cache directory {}: {}",
            dir.display(),
            e
        ))
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).map_err(|e| {
            WardenError::internal(format!(
                "not able to set permissions 0700 on {}: {}",
                dir.display(),
                e
            ))
        })?;
    }
    Ok(())
}

//! Worker-wide content caches
//!
//! Two [`CacheTable`]s are kept per worker: downloaded files (keyed by
//! content source) and writable directory caches (keyed by cache name).
//! Both survive worker restarts through JSON snapshots in the state
//! directory.
//!
//! # Eviction
//!
//! | Trigger | What is evicted |
//! |---------|-----------------|
//! | Free space below `mounts.required_free_space_mb` | Lowest rated caches first |
//! | Cached file no longer matches the required SHA256 | That file |
//! | Purge request from the purge cache service | Matching directory cache |
//! | Task exit code listed in `onExitStatus.purgeCaches` | The task's writable caches |

pub mod resource;
pub mod table;

pub use resource::{evict_next, run_garbage_collection, sort_by_rating, Resource, Resources};
pub use table::{CacheEntry, CacheTable, Checkout, CheckoutGuard};

/// Garbage collection candidates across both tables, least valuable first.
///
/// File caches come before directory caches at equal rating since a
/// download is cheaper to recreate than a writable cache.
pub fn gc_candidates(file_caches: &CacheTable, directory_caches: &CacheTable) -> Resources {
    let mut resources = file_caches.sorted_resources();
    resources.extend(directory_caches.sorted_resources());
    sort_by_rating(&mut resources);
    resources
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn gc_candidates_prefer_files_on_ties() {
        let temp = TempDir::new().unwrap();
        let files = CacheTable::new("file");
        let dirs = CacheTable::new("directory");

        let dir_location = temp.path().join("dir-cache");
        fs::create_dir(&dir_location).unwrap();
        dirs.insert(CacheEntry::new("gradle", &dir_location));

        let file_location = temp.path().join("file-cache");
        fs::write(&file_location, "x").unwrap();
        files.insert(CacheEntry::new("urlcontent:https://example.com/a", &file_location));

        let mut popular = CacheEntry::new("popular", temp.path().join("popular"));
        fs::write(&popular.location, "x").unwrap();
        popular.hits = 10;
        files.insert(popular);

        let described: Vec<String> = gc_candidates(&files, &dirs)
            .iter()
            .map(|r| r.describe())
            .collect();

        assert_eq!(described.len(), 3);
        assert!(described[0].contains("urlcontent:"));
        assert!(described[1].contains("gradle"));
        assert!(described[2].contains("popular"));
    }
}

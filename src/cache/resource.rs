//! Evictable resources and free-space garbage collection

use crate::error::{WardenError, WardenResult};
use std::cmp::Ordering;
use std::fmt;
use tracing::{debug, info};

/// Anything cached on the worker that can be compared by value and deleted
pub trait Resource: Send + Sync {
    /// Relative value; lower ratings are evicted first
    fn rating(&self) -> f64;

    /// Remove the resource from its bookkeeping and delete it from disk.
    /// Returns false if the resource came into use since it was listed and
    /// was left alone.
    fn evict(&self) -> WardenResult<bool>;

    /// Human readable description for logs
    fn describe(&self) -> String;
}

impl fmt::Debug for dyn Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (rating {})", self.describe(), self.rating())
    }
}

/// An ordered list of resources
pub type Resources = Vec<Box<dyn Resource>>;

/// Stable sort by ascending rating; equally rated resources keep their
/// relative order
pub fn sort_by_rating(resources: &mut Resources) {
    resources.sort_by(|a, b| {
        a.rating()
            .partial_cmp(&b.rating())
            .unwrap_or(Ordering::Equal)
    });
}

/// Evict the least valuable resource and drop it from the list. Returns
/// whether it was actually evicted.
pub fn evict_next(resources: &mut Resources) -> WardenResult<bool> {
    if resources.is_empty() {
        return Err(WardenError::internal("no resources left to evict"));
    }
    sort_by_rating(resources);
    let next = resources.remove(0);
    debug!("Evicting {:?}", next);
    next.evict()
}

/// Evict resources, least valuable first, until `free_space` reports at
/// least `required_free` bytes. Returns how many resources were evicted.
///
/// Running out of resources while still short of space is a worker-level
/// problem, not a task problem.
pub fn run_garbage_collection(
    mut resources: Resources,
    required_free: u64,
    mut free_space: impl FnMut() -> WardenResult<u64>,
) -> WardenResult<usize> {
    let mut evicted = 0;
    loop {
        let free = free_space()?;
        if free >= required_free {
            if evicted > 0 {
                info!(
                    "Garbage collection evicted {} cache(s); {} bytes now free",
                    evicted, free
                );
            }
            return Ok(evicted);
        }
        if resources.is_empty() {
            return Err(WardenError::DiskSpaceExhausted {
                free,
                required: required_free,
            });
        }
        if evict_next(&mut resources)? {
            evicted += 1;
        }
    }
}

//! Process-lifetime cache of open series handles.
//!
//! Every distinct locator is opened exactly once, no matter how many delivery
//! threads see its first message at the same time. Entries are never evicted:
//! the key space is bounded by the number of physical sensors, not by message
//! volume.
//!
//! # Locking
//!
//! Lookups take a shared read lock only. A miss upgrades to the exclusive
//! lock, checks the map again (another thread may have created the entry in
//! between), and only then creates. Creation runs under the exclusive lock,
//! so it stalls all lookups for its duration; series creation is rare
//! compared to updates.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

/// Concurrent `locator -> Arc<H>` map with at-most-one creation per key.
#[derive(Debug)]
pub struct HandleCache<H> {
    handles: RwLock<HashMap<PathBuf, Arc<H>>>,
}

impl<H> HandleCache<H> {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self {
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the handle for `locator`, calling `create` if there is none.
    ///
    /// Concurrent callers with the same locator observe the same `Arc`, and
    /// `create` runs at most once per locator that ends up cached. If `create`
    /// fails nothing is cached and the error is returned; a later call will
    /// try again.
    ///
    /// # Errors
    ///
    /// Returns the error produced by `create`.
    pub fn get_or_create<F, E>(&self, locator: &Path, create: F) -> Result<Arc<H>, E>
    where
        F: FnOnce(&Path) -> Result<H, E>,
    {
        if let Some(handle) = self.get(locator) {
            tracing::debug!(locator = %locator.display(), "reusing handle");
            return Ok(handle);
        }

        let mut handles = self.handles.write().unwrap_or_else(PoisonError::into_inner);

        // Re-check: the entry may have been added while waiting for the lock.
        if let Some(handle) = handles.get(locator) {
            tracing::debug!(locator = %locator.display(), "reusing handle created concurrently");
            return Ok(Arc::clone(handle));
        }

        tracing::debug!(locator = %locator.display(), "creating new handle");
        let handle = Arc::new(create(locator)?);
        handles.insert(locator.to_path_buf(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Returns the cached handle for `locator` without creating one.
    pub fn get(&self, locator: &Path) -> Option<Arc<H>> {
        self.handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(locator)
            .cloned()
    }

    /// Returns the number of cached handles.
    pub fn len(&self) -> usize {
        self.handles.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns true if no handle has been created yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a snapshot of every cached `(locator, handle)` pair.
    pub fn handles(&self) -> Vec<(PathBuf, Arc<H>)> {
        self.handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(locator, handle)| (locator.clone(), Arc::clone(handle)))
            .collect()
    }
}

impl<H> Default for HandleCache<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[derive(Debug)]
    struct Dummy(PathBuf);

    fn create_counting(counter: &AtomicUsize) -> impl FnOnce(&Path) -> Result<Dummy, String> + '_ {
        move |locator: &Path| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Dummy(locator.to_path_buf()))
        }
    }

    #[test]
    fn test_creates_once_and_reuses() {
        let cache = HandleCache::new();
        let created = AtomicUsize::new(0);
        let locator = Path::new("/data/a-1-0.rrd");

        let first = cache.get_or_create(locator, create_counting(&created)).unwrap();
        let second = cache.get_or_create(locator, create_counting(&created)).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.0, locator);
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_distinct_keys_get_distinct_handles() {
        let cache = HandleCache::new();
        let created = AtomicUsize::new(0);

        let a = cache.get_or_create(Path::new("a"), create_counting(&created)).unwrap();
        let b = cache.get_or_create(Path::new("b"), create_counting(&created)).unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert!(cache.get(Path::new("a")).is_some());
        assert!(cache.get(Path::new("c")).is_none());
    }

    #[test]
    fn test_failed_creation_is_not_cached() {
        let cache: HandleCache<Dummy> = HandleCache::new();

        let result = cache.get_or_create(Path::new("a"), |_| Err("disk full"));
        assert_eq!(result.unwrap_err(), "disk full");
        assert!(cache.is_empty());

        let created = AtomicUsize::new(0);
        cache.get_or_create(Path::new("a"), create_counting(&created)).unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_concurrent_creation_at_most_once_per_key() {
        const THREADS: usize = 16;
        const KEYS: usize = 25;

        let cache: HandleCache<Dummy> = HandleCache::new();
        let created = AtomicUsize::new(0);
        let barrier = Barrier::new(THREADS);

        let results: Vec<Vec<Arc<Dummy>>> = thread::scope(|s| {
            let workers: Vec<_> = (0..THREADS)
                .map(|t| {
                    let cache = &cache;
                    let created = &created;
                    let barrier = &barrier;
                    s.spawn(move || {
                        barrier.wait();
                        // Each thread walks the keys in a different order
                        (0..KEYS)
                            .map(|k| {
                                let key = PathBuf::from(format!("key-{}", (k + t) % KEYS));
                                cache.get_or_create(&key, create_counting(created)).unwrap()
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(created.load(Ordering::SeqCst), KEYS);
        assert_eq!(cache.len(), KEYS);

        // Every thread saw the cached instance for every key
        for handles in &results {
            for handle in handles {
                let cached = cache.get(&handle.0).unwrap();
                assert!(Arc::ptr_eq(handle, &cached));
            }
        }
    }

    #[test]
    fn test_handles_snapshot() {
        let cache = HandleCache::new();
        let created = AtomicUsize::new(0);
        for name in ["x", "y", "z"] {
            cache.get_or_create(Path::new(name), create_counting(&created)).unwrap();
        }

        let mut locators: Vec<_> = cache.handles().into_iter().map(|(l, _)| l).collect();
        locators.sort();
        assert_eq!(locators, vec![PathBuf::from("x"), PathBuf::from("y"), PathBuf::from("z")]);
    }
}

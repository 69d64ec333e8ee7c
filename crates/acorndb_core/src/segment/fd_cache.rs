//! Descriptor cache for sealed segment files.

use std::collections::HashMap;
use std::fs::File;
use std::sync::Arc;

/// An LRU cache of open segment descriptors.
///
/// Handles are `Arc<File>`s: eviction drops the cache's reference, so a
/// descriptor closes only once the last in-flight read releases it.
/// Recency is tracked with a logical clock rather than wall time.
///
/// When an insert would exceed `capacity`, a single eviction pass closes
/// least-recently-used descriptors until only
/// `clean_threshold × capacity` remain.
pub(crate) struct FdCache {
    capacity: usize,
    clean_threshold: f64,
    tick: u64,
    slots: HashMap<u64, Slot>,
}

struct Slot {
    file: Arc<File>,
    last_used: u64,
}

impl FdCache {
    /// Creates a cache with the given capacity and eviction threshold.
    pub fn new(capacity: usize, clean_threshold: f64) -> Self {
        Self {
            capacity,
            clean_threshold,
            tick: 0,
            slots: HashMap::new(),
        }
    }

    /// Returns the cached descriptor for `file_id`, opening one with
    /// `open` on a miss. The returned handle stays valid even if a later
    /// insert evicts this slot.
    pub fn get<F>(&mut self, file_id: u64, open: F) -> Result<Arc<File>, crate::error::CoreError>
    where
        F: FnOnce() -> Result<Arc<File>, crate::error::CoreError>,
    {
        self.tick += 1;
        if let Some(slot) = self.slots.get_mut(&file_id) {
            slot.last_used = self.tick;
            return Ok(Arc::clone(&slot.file));
        }

        let file = open()?;
        self.insert(file_id, Arc::clone(&file));
        Ok(file)
    }

    /// Inserts an already-open descriptor, evicting first if full.
    pub fn insert(&mut self, file_id: u64, file: Arc<File>) {
        if self.slots.len() >= self.capacity && !self.slots.contains_key(&file_id) {
            self.evict();
        }
        self.tick += 1;
        self.slots.insert(
            file_id,
            Slot {
                file,
                last_used: self.tick,
            },
        );
    }

    /// Drops the slot for `file_id`, if present.
    pub fn remove(&mut self, file_id: u64) {
        self.slots.remove(&file_id);
    }

    /// Number of cached descriptors.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// One eviction pass: close least-recently-used descriptors down to
    /// `clean_threshold × capacity`.
    fn evict(&mut self) {
        let target = ((self.capacity as f64 * self.clean_threshold) as usize).min(self.capacity);
        if self.slots.len() <= target {
            return;
        }

        let mut by_age: Vec<(u64, u64)> = self
            .slots
            .iter()
            .map(|(&id, slot)| (slot.last_used, id))
            .collect();
        by_age.sort_unstable();

        let excess = self.slots.len() - target;
        for &(_, id) in by_age.iter().take(excess) {
            self.slots.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_file(dir: &std::path::Path, name: u64) -> Arc<File> {
        let path = dir.join(format!("{name}.dat"));
        std::fs::write(&path, b"x").unwrap();
        Arc::new(File::open(&path).unwrap())
    }

    #[test]
    fn hit_returns_same_descriptor() {
        let temp = tempdir().unwrap();
        let mut cache = FdCache::new(4, 0.5);

        let first = cache.get(1, || Ok(open_file(temp.path(), 1))).unwrap();
        let second = cache
            .get(1, || panic!("should not reopen on a hit"))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn eviction_retains_threshold_fraction() {
        let temp = tempdir().unwrap();
        let mut cache = FdCache::new(4, 0.5);

        for id in 0..4 {
            cache.get(id, || Ok(open_file(temp.path(), id))).unwrap();
        }
        assert_eq!(cache.len(), 4);

        // Touch 2 and 3 so 0 and 1 are the LRU victims.
        cache.get(2, || unreachable!()).unwrap();
        cache.get(3, || unreachable!()).unwrap();

        cache.get(4, || Ok(open_file(temp.path(), 4))).unwrap();

        // One pass down to 0.5 × 4 = 2, then the new entry lands.
        assert_eq!(cache.len(), 3);
        cache.get(3, || panic!("3 was recently used")).unwrap();
        cache.get(0, || Ok(open_file(temp.path(), 0))).unwrap();
    }

    #[test]
    fn evicted_handle_stays_usable() {
        let temp = tempdir().unwrap();
        let mut cache = FdCache::new(2, 0.5);

        let held = cache.get(0, || Ok(open_file(temp.path(), 0))).unwrap();
        cache.get(1, || Ok(open_file(temp.path(), 1))).unwrap();
        cache.get(2, || Ok(open_file(temp.path(), 2))).unwrap();

        // Slot 0 was evicted, but the held Arc still reads.
        assert!(held.metadata().unwrap().len() > 0);
    }
}

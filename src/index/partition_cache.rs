use std::collections::HashMap;
use std::sync::Arc;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, warn};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::stats::{put, StatusMap, StatusSource};
use crate::storage::layout::StorageLayout;
use crate::storage::partition::{Partition, PartitionHandle, PartitionId};

/// Reconstructs a partition that is not resident
pub trait PartitionLoader: Send + Sync {
    fn load(&self, id: &PartitionId) -> Result<PartitionHandle>;
}

impl<F> PartitionLoader for F
where
    F: Fn(&PartitionId) -> Result<PartitionHandle> + Send + Sync,
{
    fn load(&self, id: &PartitionId) -> Result<PartitionHandle> {
        self(id)
    }
}

/// Loads flushed partitions from the storage directory
pub struct DiskLoader {
    storage: StorageLayout,
}

impl DiskLoader {
    pub fn new(storage: StorageLayout) -> Self {
        DiskLoader { storage }
    }
}

impl PartitionLoader for DiskLoader {
    fn load(&self, id: &PartitionId) -> Result<PartitionHandle> {
        Ok(Partition::load(&self.storage.base_dir, *id)?.into_handle())
    }
}

/// Result of a cache access
pub struct CacheLookup {
    pub partition: PartitionHandle,
    pub evicted: Vec<PartitionId>,
    pub flush_error: Option<Error>,   // Non-fatal: set when a dirty victim could not be persisted
}

impl CacheLookup {
    fn hit(partition: PartitionHandle) -> Self {
        CacheLookup {
            partition,
            evicted: Vec::new(),
            flush_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub resident: usize,
    pub capacity: usize,
    pub pinned: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Bounded LRU cache of sealed partitions.
///
/// The active partition is never resident. Victims that are dirty get
/// flushed before they are dropped; when that flush fails they move to the
/// pinned set, which lives outside the capacity bound until a later flush
/// succeeds.
pub struct PartitionCache {
    entries: LruCache<PartitionId, PartitionHandle>,
    capacity: usize,
    loader: Arc<dyn PartitionLoader>,
    active: Option<PartitionId>,
    pinned: HashMap<PartitionId, PartitionHandle>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl PartitionCache {
    pub fn new(capacity: usize, loader: Arc<dyn PartitionLoader>) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "partition cache capacity must be greater than zero".to_string(),
            ));
        }
        Ok(PartitionCache {
            entries: LruCache::unbounded(),
            capacity,
            loader,
            active: None,
            pinned: HashMap::new(),
            hits: 0,
            misses: 0,
            evictions: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of partitions in LRU order; pinned ones are not counted
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pinned_count(&self) -> usize {
        self.pinned.len()
    }

    pub fn contains(&self, id: &PartitionId) -> bool {
        self.entries.contains(id) || self.pinned.contains_key(id)
    }

    pub fn active(&self) -> Option<PartitionId> {
        self.active
    }

    /// Declares the partition that is being ingested into. It is dropped
    /// from the cache if it happens to be resident.
    pub fn set_active(&mut self, id: Option<PartitionId>) {
        if let Some(id) = id {
            self.entries.pop(&id);
            self.pinned.remove(&id);
        }
        self.active = id;
    }

    /// Resident partition without touching the loader. Marks it as most
    /// recently used.
    pub fn get(&mut self, id: &PartitionId) -> Option<PartitionHandle> {
        if let Some(handle) = self.entries.get(id) {
            return Some(handle.clone());
        }
        self.pinned.get(id).cloned()
    }

    fn lookup_resident(&mut self, id: &PartitionId) -> Result<Option<PartitionHandle>> {
        if self.active == Some(*id) {
            return Err(Error::new(
                ErrorKind::InvalidState,
                format!("partition {} is active and not served by the cache", id),
            ));
        }
        let found = self.get(id);
        if found.is_some() {
            self.hits += 1;
        }
        Ok(found)
    }

    pub fn get_or_load(&mut self, id: &PartitionId) -> Result<CacheLookup> {
        if let Some(handle) = self.lookup_resident(id)? {
            return Ok(CacheLookup::hit(handle));
        }
        self.misses += 1;
        let loaded = self.loader.load(id)?;
        self.admit(*id, loaded)
    }

    /// Inserts an already constructed partition, evicting as needed
    pub fn insert(&mut self, id: PartitionId, handle: PartitionHandle) -> Result<CacheLookup> {
        self.admit(id, handle)
    }

    fn admit(&mut self, id: PartitionId, handle: PartitionHandle) -> Result<CacheLookup> {
        let (partition, detached) = self.place(id, handle)?;
        let flushed = detached.flush();
        let flush_error = self.settle(flushed);
        Ok(CacheLookup {
            partition,
            evicted: detached.evicted,
            flush_error,
        })
    }

    /// Puts `handle` in LRU order and detaches the victims beyond capacity.
    /// Victims move to the pinned set, so they stay visible to `get` until
    /// `settle` sees their flush succeed.
    fn place(&mut self, id: PartitionId, handle: PartitionHandle) -> Result<(PartitionHandle, Detached)> {
        if self.active == Some(id) {
            return Err(Error::new(
                ErrorKind::InvalidState,
                format!("refusing to cache active partition {}", id),
            ));
        }
        // Another loader may have won the race for the same id.
        if let Some(existing) = self.get(&id) {
            return Ok((existing, Detached::default()));
        }
        self.entries.put(id, handle.clone());

        // Earlier failures are retried on every eviction pass.
        let mut detached = self.pinned_snapshot();
        while self.entries.len() > self.capacity {
            let Some((victim, victim_handle)) = self.entries.pop_lru() else {
                break;
            };
            self.evictions += 1;
            detached.evicted.push(victim);
            self.pinned.insert(victim, victim_handle.clone());
            detached.to_flush.push((victim, victim_handle));
        }
        Ok((handle, detached))
    }

    /// Releases the pinned partitions whose flush succeeded and returns the
    /// first failure.
    fn settle(&mut self, flushed: Vec<(PartitionId, PartitionHandle, Result<()>)>) -> Option<Error> {
        let mut first_error = None;
        for (id, handle, result) in flushed {
            match result {
                Ok(()) => {
                    let same = self.pinned.get(&id).is_some_and(|p| Arc::ptr_eq(p, &handle));
                    if same {
                        self.pinned.remove(&id);
                        debug!(partition = %id, "released partition");
                    }
                }
                Err(e) => {
                    warn!(partition = %id, error = %e, "flush of evicted partition failed, keeping it pinned");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error
    }

    fn pinned_snapshot(&self) -> Detached {
        Detached {
            evicted: Vec::new(),
            to_flush: self.pinned.iter().map(|(id, h)| (*id, h.clone())).collect(),
        }
    }

    /// Retries persisting every pinned partition. Partitions that flush
    /// cleanly are released; the first failure is returned.
    pub fn flush_pinned(&mut self) -> Result<()> {
        let flushed = self.pinned_snapshot().flush();
        match self.settle(flushed) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            resident: self.entries.len(),
            capacity: self.capacity,
            pinned: self.pinned.len(),
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
        }
    }
}

/// Partitions taken out of LRU order that still have to reach disk
#[derive(Default)]
struct Detached {
    evicted: Vec<PartitionId>,
    to_flush: Vec<(PartitionId, PartitionHandle)>,
}

impl Detached {
    /// Flushes every detached partition. Takes only the partition locks.
    fn flush(&self) -> Vec<(PartitionId, PartitionHandle, Result<()>)> {
        self.to_flush
            .iter()
            .map(|(id, handle)| {
                let result = {
                    let mut partition = handle.write();
                    if partition.dirty() {
                        partition.flush_to_disk()
                    } else {
                        Ok(())
                    }
                };
                (*id, handle.clone(), result)
            })
            .collect()
    }
}

impl StatusSource for PartitionCache {
    fn fill_status(&self, prefix: &str, status: &mut StatusMap) {
        let stats = self.stats();
        put(status, prefix, "resident", stats.resident);
        put(status, prefix, "capacity", stats.capacity);
        put(status, prefix, "pinned", stats.pinned);
        put(status, prefix, "hits", stats.hits);
        put(status, prefix, "misses", stats.misses);
        put(status, prefix, "evictions", stats.evictions);
        put(status, prefix, "hit_rate", stats.hit_rate());
    }
}

/// Cache shared by the worker threads. Lookups of resident partitions stay
/// under the lock; loads from disk and eviction flushes run outside it.
#[derive(Clone)]
pub struct SharedPartitionCache {
    inner: Arc<Mutex<PartitionCache>>,
    loader: Arc<dyn PartitionLoader>,
}

impl SharedPartitionCache {
    pub fn new(capacity: usize, loader: Arc<dyn PartitionLoader>) -> Result<Self> {
        let cache = PartitionCache::new(capacity, loader.clone())?;
        Ok(SharedPartitionCache {
            inner: Arc::new(Mutex::new(cache)),
            loader,
        })
    }

    pub fn get_or_load(&self, id: &PartitionId) -> Result<CacheLookup> {
        // Fast path: already resident
        {
            let mut cache = self.inner.lock();
            if let Some(handle) = cache.lookup_resident(id)? {
                return Ok(CacheLookup::hit(handle));
            }
            cache.misses += 1;
        }

        // Slow path: load from disk
        let loaded = self.loader.load(id)?;
        let (partition, detached) = self.inner.lock().place(*id, loaded)?;
        if detached.to_flush.is_empty() {
            return Ok(CacheLookup::hit(partition));
        }
        let flushed = detached.flush();
        let flush_error = self.inner.lock().settle(flushed);
        Ok(CacheLookup {
            partition,
            evicted: detached.evicted,
            flush_error,
        })
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut PartitionCache) -> R) -> R {
        f(&mut self.inner.lock())
    }

    pub fn set_active(&self, id: Option<PartitionId>) {
        self.inner.lock().set_active(id);
    }

    pub fn flush_pinned(&self) -> Result<()> {
        let detached = self.inner.lock().pinned_snapshot();
        let flushed = detached.flush();
        match self.inner.lock().settle(flushed) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats()
    }
}

impl StatusSource for SharedPartitionCache {
    fn fill_status(&self, prefix: &str, status: &mut StatusMap) {
        self.inner.lock().fill_status(prefix, status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use chrono::Utc;
    use crate::core::types::{EventId, Value, ValueType};
    use crate::schema::layout::RecordLayout;
    use crate::slice::builder::TableSliceBuilder;

    fn dirty_partition(base: &Path) -> PartitionHandle {
        let layout = Arc::new(RecordLayout::new("conn").with_field("value", ValueType::Count));
        let mut builder = TableSliceBuilder::new(layout, EventId(0));
        builder.add(Utc::now(), vec![Value::Count(1)]);
        let slice = builder.finish().unwrap();
        let mut partition = Partition::new(base, PartitionId::new());
        partition.add(&slice).unwrap();
        partition.into_handle()
    }

    fn counting_loader(calls: Arc<AtomicUsize>) -> Arc<dyn PartitionLoader> {
        Arc::new(move |id: &PartitionId| -> Result<PartitionHandle> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Partition::new(Path::new("/nonexistent"), *id).into_handle())
        })
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let calls = Arc::new(AtomicUsize::new(0));
        let err = PartitionCache::new(0, counting_loader(calls)).err().unwrap();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn evicts_least_recently_used() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut cache = PartitionCache::new(2, counting_loader(calls.clone())).unwrap();
        let (a, b, c) = (PartitionId::new(), PartitionId::new(), PartitionId::new());
        cache.get_or_load(&a).unwrap();
        cache.get_or_load(&b).unwrap();
        cache.get_or_load(&a).unwrap();
        let lookup = cache.get_or_load(&c).unwrap();
        assert_eq!(lookup.evicted, vec![b]);
        assert!(cache.contains(&a));
        assert!(!cache.contains(&b));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.evictions), (1, 3, 1));
    }

    #[test]
    fn active_partition_is_not_served() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut cache = PartitionCache::new(1, counting_loader(calls.clone())).unwrap();
        let id = PartitionId::new();
        cache.set_active(Some(id));
        let err = cache.get_or_load(&id).err().unwrap();
        assert_eq!(err.kind, ErrorKind::InvalidState);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_eviction_flush_pins_partition() {
        let dir = tempfile::TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let mut cache = PartitionCache::new(1, counting_loader(calls)).unwrap();
        let stuck = dirty_partition(&blocker);
        let stuck_id = stuck.read().id();
        cache.insert(stuck_id, stuck.clone()).unwrap();

        let lookup = cache.get_or_load(&PartitionId::new()).unwrap();
        assert_eq!(lookup.evicted, vec![stuck_id]);
        assert!(lookup.flush_error.is_some());
        assert_eq!(cache.pinned_count(), 1);
        assert!(cache.contains(&stuck_id));
        assert!(stuck.read().dirty());

        std::fs::remove_file(&blocker).unwrap();
        cache.flush_pinned().unwrap();
        assert_eq!(cache.pinned_count(), 0);
        assert!(!stuck.read().dirty());
    }

    #[test]
    fn dirty_victim_is_flushed() {
        let dir = tempfile::TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut cache = PartitionCache::new(1, counting_loader(calls)).unwrap();
        let victim = dirty_partition(dir.path());
        let victim_id = victim.read().id();
        cache.insert(victim_id, victim.clone()).unwrap();
        let lookup = cache.get_or_load(&PartitionId::new()).unwrap();
        assert!(lookup.flush_error.is_none());
        assert!(!victim.read().dirty());
        assert!(dir.path().join(victim_id.to_string()).join("meta").exists());
    }

    #[test]
    fn eviction_flush_runs_outside_the_cache_lock() {
        let dir = tempfile::TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = SharedPartitionCache::new(1, counting_loader(calls)).unwrap();
        let victim = dirty_partition(dir.path());
        let victim_id = victim.read().id();
        cache.with(|c| c.insert(victim_id, victim.clone())).unwrap();

        // Holding the partition lock stalls the victim's flush.
        let guard = victim.write();
        let loading = {
            let cache = cache.clone();
            std::thread::spawn(move || cache.get_or_load(&PartitionId::new()).map(|l| l.evicted))
        };
        let (tx, rx) = crossbeam::channel::bounded(1);
        {
            let cache = cache.clone();
            std::thread::spawn(move || {
                while cache.stats().evictions == 0 {
                    std::thread::yield_now();
                }
                let _ = tx.send((cache.stats().pinned, cache.with(|c| c.contains(&victim_id))));
            });
        }
        let observed = rx.recv_timeout(std::time::Duration::from_secs(10));
        drop(guard);
        assert_eq!(observed.unwrap(), (1, true));

        let evicted = loading.join().unwrap().unwrap();
        assert_eq!(evicted, vec![victim_id]);
        assert!(!victim.read().dirty());
        assert_eq!(cache.stats().pinned, 0);
        assert!(!cache.with(|c| c.contains(&victim_id)));
    }
}

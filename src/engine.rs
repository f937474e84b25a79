//! The index engine: partitioned bitmap cache, per-key locking, and the
//! write-behind pipeline in front of the fast and durable stores.
//!
//! Write path: value -> partition key -> per-key write lock ->
//! load-or-create -> add -> mark dirty (or synchronous save). Read path:
//! cache, then fast store, then durable store, warming the cache and the
//! registry on a durable hit. Navigation crosses into at most one adjacent
//! partition, read from the fast store directly so boundary lookups do not
//! churn the cache.
//!
//! One background flusher per engine, started iff `flush_interval_ms > 0`.
//! Each tick writes dirty bitmaps to the fast store and merged pending
//! partitions to the durable store. `close` runs a final flush and stops
//! the flusher within a bounded grace period.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
    },
    thread,
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::{
    bitset::TimeSet,
    cache::{BitsetCache, CachedSet},
    error::{IndexError, Result},
    kv::KvStore,
    locks::KeyLocks,
    partition::{self, REGISTRY_KEY},
    repository::IndexRepository,
    time::Granularity,
};

const CLOSE_GRACE: Duration = Duration::from_secs(5);

type DurableKey = (String, i64, Granularity, u32);

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Capacity of the hot cache, in partition bitmaps.
    pub max_cache_size: usize,
    /// Write-behind period. `0` makes every mark write through
    /// synchronously.
    pub flush_interval_ms: u64,
    /// Whether durable writes happen off the caller's path.
    pub async_write: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_cache_size: 100_000,
            flush_interval_ms: 100,
            async_write: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    pub entity_count: u64,
    pub cache_size: usize,
    pub memory_usage_bytes: u64,
}

struct FlusherHandle {
    shutdown: Sender<()>,
    done: Receiver<()>,
}

pub struct IndexEngine {
    kv: Arc<dyn KvStore>,
    repository: Option<Arc<dyn IndexRepository>>,
    locks: KeyLocks,
    cache: BitsetCache,
    dirty: Mutex<HashSet<String>>,
    pending_durable: Mutex<HashMap<DurableKey, TimeSet>>,
    flush_interval_ms: u64,
    async_write: bool,
    closed: AtomicBool,
    flusher: Mutex<Option<FlusherHandle>>,
}

impl IndexEngine {
    pub fn new(
        kv: Arc<dyn KvStore>,
        repository: Option<Arc<dyn IndexRepository>>,
        options: EngineOptions,
    ) -> Arc<Self> {
        let engine = Arc::new(Self {
            kv,
            repository,
            locks: KeyLocks::new(),
            cache: BitsetCache::new(options.max_cache_size),
            dirty: Mutex::new(HashSet::new()),
            pending_durable: Mutex::new(HashMap::new()),
            flush_interval_ms: options.flush_interval_ms,
            async_write: options.async_write,
            closed: AtomicBool::new(false),
            flusher: Mutex::new(None),
        });

        if options.flush_interval_ms > 0 {
            let handle = spawn_flusher(&engine, options.flush_interval_ms);
            *engine.flusher.lock() = Some(handle);
        }

        engine
    }

    pub fn persistence_enabled(&self) -> bool {
        self.repository.is_some()
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    pub fn repository(&self) -> Option<&Arc<dyn IndexRepository>> {
        self.repository.as_ref()
    }

    /// Adds `index_name` to the registry. Idempotent.
    pub fn create_index(&self, index_name: &str) -> Result<()> {
        self.ensure_open()?;
        ensure_name(index_name)?;
        self.kv.set_add(REGISTRY_KEY, index_name)
    }

    /// True when the registry knows the name, or the durable store holds
    /// any row for it.
    pub fn index_exists(&self, index_name: &str) -> Result<bool> {
        self.ensure_open()?;
        if self.kv.set_is_member(REGISTRY_KEY, index_name)? {
            return Ok(true);
        }
        if let Some(repository) = &self.repository {
            return Ok(repository.count_by_index_name(index_name)? > 0);
        }
        Ok(false)
    }

    /// Removes every trace of an index: fast-store keys, registry entry,
    /// cached bitmaps, and durable rows. Idempotent.
    pub fn delete_index(&self, index_name: &str) -> Result<()> {
        self.ensure_open()?;
        let prefix = partition::index_prefix(index_name);

        // Cached state is discarded, not flushed, so a flush cannot
        // resurrect keys after the delete below.
        for key in self.cache.keys_with_prefix(&prefix) {
            self.cache.remove(&key);
            self.dirty.lock().remove(&key);
        }
        self.pending_durable
            .lock()
            .retain(|(name, _, _, _), _| name != index_name);

        let keys: Vec<String> = self.kv.scan_keys(&prefix)?.into_iter().collect();
        if !keys.is_empty() {
            self.kv.delete(&keys)?;
        }
        self.kv.set_remove(REGISTRY_KEY, index_name)?;

        if let Some(repository) = &self.repository {
            repository.delete_by_index_name(index_name)?;
        }
        info!(index = index_name, "index deleted");
        Ok(())
    }

    pub fn list_indexes(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        self.kv.set_members(REGISTRY_KEY)
    }

    /// Marks one epoch value present.
    pub fn mark(
        &self,
        index_name: &str,
        entity_id: i64,
        granularity: Granularity,
        value: u32,
    ) -> Result<()> {
        self.ensure_open()?;
        let p = partition::partition_of(value, granularity);
        self.mark_partition(index_name, entity_id, granularity, p, &[value])
    }

    /// Marks many values, taking each partition's write lock once.
    pub fn mark_batch(
        &self,
        index_name: &str,
        entity_id: i64,
        granularity: Granularity,
        values: &[u32],
    ) -> Result<()> {
        self.ensure_open()?;
        if values.is_empty() {
            return Ok(());
        }
        let mut by_partition: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        for &value in values {
            by_partition
                .entry(partition::partition_of(value, granularity))
                .or_default()
                .push(value);
        }
        for (p, partition_values) in by_partition {
            self.mark_partition(index_name, entity_id, granularity, p, &partition_values)?;
        }
        Ok(())
    }

    pub fn exists(
        &self,
        index_name: &str,
        entity_id: i64,
        granularity: Granularity,
        value: u32,
    ) -> Result<bool> {
        self.ensure_open()?;
        let key = partition::key_for_value(index_name, granularity, entity_id, value);
        let p = partition::partition_of(value, granularity);
        match self.load_for_read(&key, index_name, entity_id, granularity, p)? {
            Some(entry) => {
                let lock = self.locks.acquire(&key);
                let _shared = lock.read();
                Ok(entry.read().contains(value))
            }
            None => Ok(false),
        }
    }

    /// Largest marked value strictly before `value`, looking into the
    /// previous partition (fast store only) when this one has none.
    pub fn find_prev(
        &self,
        index_name: &str,
        entity_id: i64,
        granularity: Granularity,
        value: u32,
    ) -> Result<Option<u32>> {
        self.ensure_open()?;
        let key = partition::key_for_value(index_name, granularity, entity_id, value);
        let p = partition::partition_of(value, granularity);
        if let Some(entry) = self.load_for_read(&key, index_name, entity_id, granularity, p)? {
            let lock = self.locks.acquire(&key);
            let _shared = lock.read();
            if let Some(prev) = entry.read().prev_of(value) {
                return Ok(Some(prev));
            }
        }

        let Some(prev_key) = partition::prev_partition_key(index_name, granularity, entity_id, value)
        else {
            return Ok(None);
        };
        Ok(self.load_adjacent(&prev_key)?.and_then(|set| set.maximum()))
    }

    /// Smallest marked value strictly after `value`, looking into the next
    /// partition (fast store only) when this one has none.
    pub fn find_next(
        &self,
        index_name: &str,
        entity_id: i64,
        granularity: Granularity,
        value: u32,
    ) -> Result<Option<u32>> {
        self.ensure_open()?;
        let key = partition::key_for_value(index_name, granularity, entity_id, value);
        let p = partition::partition_of(value, granularity);
        if let Some(entry) = self.load_for_read(&key, index_name, entity_id, granularity, p)? {
            let lock = self.locks.acquire(&key);
            let _shared = lock.read();
            if let Some(next) = entry.read().next_of(value) {
                return Ok(Some(next));
            }
        }

        let next_key = partition::next_partition_key(index_name, granularity, entity_id, value);
        Ok(self.load_adjacent(&next_key)?.and_then(|set| set.minimum()))
    }

    /// Drops every cached partition of one entity, flushing dirty entries
    /// first.
    pub fn evict_entity(&self, index_name: &str, entity_id: i64) -> Result<()> {
        self.ensure_open()?;
        for granularity in Granularity::ALL {
            let prefix = partition::entity_prefix(index_name, granularity, entity_id);
            for key in self.cache.keys_with_prefix(&prefix) {
                self.evict_key(&key)?;
            }
        }
        Ok(())
    }

    /// Drops every cached partition of one index, flushing dirty entries
    /// first.
    pub fn evict_index(&self, index_name: &str) -> Result<()> {
        self.ensure_open()?;
        let prefix = partition::index_prefix(index_name);
        for key in self.cache.keys_with_prefix(&prefix) {
            self.evict_key(&key)?;
        }
        Ok(())
    }

    /// Number of distinct DAY partition keys in the fast store. A coarse
    /// proxy: entities seen at other granularities only, or only in the
    /// durable store, are not counted.
    pub fn entity_count(&self, index_name: &str) -> Result<u64> {
        self.ensure_open()?;
        Ok(self.kv.scan_keys(&partition::day_prefix(index_name))?.len() as u64)
    }

    pub fn stats(&self, index_name: &str) -> Result<IndexStats> {
        Ok(IndexStats {
            entity_count: self.entity_count(index_name)?,
            cache_size: self.cache.len(),
            memory_usage_bytes: self.cache.memory_usage(),
        })
    }

    /// Flushes dirty fast-store entries and pending durable partitions.
    /// Failures are logged and retried on the next tick.
    pub fn flush(&self) {
        self.flush_dirty_kv();
        self.flush_pending_durable();
    }

    /// Final flush, then stops the flusher within a bounded grace period.
    /// All subsequent operations fail with `Closed`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.flush();
        if let Some(handle) = self.flusher.lock().take() {
            let _ = handle.shutdown.send(());
            if handle.done.recv_timeout(CLOSE_GRACE).is_err() {
                warn!("flusher did not stop within grace period, abandoning it");
            }
        }
        self.cache.clear();
        self.locks.clear();
        self.dirty.lock().clear();
        self.pending_durable.lock().clear();
        info!("index engine closed");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(IndexError::Closed)
        } else {
            Ok(())
        }
    }

    fn mark_partition(
        &self,
        index_name: &str,
        entity_id: i64,
        granularity: Granularity,
        p: u32,
        values: &[u32],
    ) -> Result<()> {
        let key = partition::key(index_name, granularity, entity_id, p);
        let lock = self.locks.acquire(&key);
        let _exclusive = lock.write();

        let entry = self.load_or_create(&key, index_name, entity_id, granularity, p)?;
        entry.write().add_all(values);

        if self.flush_interval_ms > 0 {
            self.dirty.lock().insert(key.clone());
            if !self.cache.contains(&key) {
                // Lost a race with an eviction of this key; write through
                // so the adds are not dropped with the cache entry.
                self.dirty.lock().remove(&key);
                let bytes = entry.read().serialize();
                self.kv.set(&key, &bytes)?;
            }
        } else {
            let bytes = entry.read().serialize();
            self.kv.set(&key, &bytes)?;
        }

        if let Some(repository) = &self.repository {
            self.submit_durable(repository, index_name, entity_id, granularity, p, &entry)?;
        }
        Ok(())
    }

    /// Load for write under the caller's exclusive key lock: cache, then
    /// fast store, then durable store, else a fresh empty set.
    fn load_or_create(
        &self,
        key: &str,
        index_name: &str,
        entity_id: i64,
        granularity: Granularity,
        p: u32,
    ) -> Result<CachedSet> {
        if let Some(entry) = self.cache.get(key) {
            return Ok(entry);
        }
        let set = match self.kv.get(key)? {
            Some(bytes) if !bytes.is_empty() => match TimeSet::deserialize(&bytes) {
                Ok(set) => set,
                Err(_) => {
                    warn!(key, "corrupt bitmap in fast store, starting from empty");
                    TimeSet::new()
                }
            },
            _ => self
                .load_durable(index_name, entity_id, granularity, p)?
                .unwrap_or_default(),
        };
        let entry = Arc::new(RwLock::new(set));
        self.insert_cached(key, Arc::clone(&entry))?;
        Ok(entry)
    }

    /// Load for read; `None` when no partition bitmap exists anywhere.
    fn load_for_read(
        &self,
        key: &str,
        index_name: &str,
        entity_id: i64,
        granularity: Granularity,
        p: u32,
    ) -> Result<Option<CachedSet>> {
        if let Some(entry) = self.cache.get(key) {
            return Ok(Some(entry));
        }

        let lock = self.locks.acquire(key);
        let _exclusive = lock.write();
        if let Some(entry) = self.cache.get(key) {
            return Ok(Some(entry));
        }

        let set = match self.kv.get(key)? {
            Some(bytes) if !bytes.is_empty() => match TimeSet::deserialize(&bytes) {
                Ok(set) => Some(set),
                Err(_) => {
                    warn!(key, "corrupt bitmap in fast store, treating slot as empty");
                    None
                }
            },
            _ => self.load_durable(index_name, entity_id, granularity, p)?,
        };

        match set {
            Some(set) => {
                let entry = Arc::new(RwLock::new(set));
                self.insert_cached(key, Arc::clone(&entry))?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// Durable fallback for a fast-store miss. A hit warms the registry so
    /// the index is discoverable again after fast-store loss.
    fn load_durable(
        &self,
        index_name: &str,
        entity_id: i64,
        granularity: Granularity,
        p: u32,
    ) -> Result<Option<TimeSet>> {
        let Some(repository) = &self.repository else {
            return Ok(None);
        };
        let Some(bytes) = repository.get_bitmap(index_name, entity_id, granularity, p)? else {
            return Ok(None);
        };
        if bytes.is_empty() {
            return Ok(None);
        }
        let set = match TimeSet::deserialize(&bytes) {
            Ok(set) => set,
            Err(_) => {
                warn!(
                    index = index_name,
                    entity = entity_id,
                    partition = p,
                    "corrupt bitmap in durable store, treating slot as empty"
                );
                return Ok(None);
            }
        };
        if let Err(err) = self.kv.set_add(REGISTRY_KEY, index_name) {
            warn!(index = index_name, "failed to re-register index: {err}");
        }
        Ok(Some(set))
    }

    /// Adjacent-partition load for navigation: fast store only, never the
    /// cache or the durable store.
    fn load_adjacent(&self, key: &str) -> Result<Option<TimeSet>> {
        match self.kv.get(key)? {
            Some(bytes) if !bytes.is_empty() => match TimeSet::deserialize(&bytes) {
                Ok(set) => Ok(Some(set)),
                Err(_) => {
                    warn!(key, "corrupt bitmap in fast store, treating slot as empty");
                    Ok(None)
                }
            },
            _ => Ok(None),
        }
    }

    /// Inserts into the cache; a dirty entry evicted to make room is
    /// written to the fast store before it is lost.
    fn insert_cached(&self, key: &str, entry: CachedSet) -> Result<()> {
        if let Some((evicted_key, evicted)) = self.cache.put(key, entry) {
            if self.dirty.lock().remove(&evicted_key) {
                let bytes = evicted.read().serialize();
                if let Err(err) = self.kv.set(&evicted_key, &bytes) {
                    error!(key = %evicted_key, "flush of evicted dirty entry failed: {err}");
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn evict_key(&self, key: &str) -> Result<()> {
        let Some(entry) = self.cache.remove(key) else {
            return Ok(());
        };
        if self.dirty.lock().remove(key) {
            let bytes = entry.read().serialize();
            self.kv.set(key, &bytes)?;
        }
        Ok(())
    }

    fn submit_durable(
        &self,
        repository: &Arc<dyn IndexRepository>,
        index_name: &str,
        entity_id: i64,
        granularity: Granularity,
        p: u32,
        entry: &CachedSet,
    ) -> Result<()> {
        if self.async_write && self.flush_interval_ms > 0 {
            let snapshot = entry.read().clone();
            self.pending_durable
                .lock()
                .entry((index_name.to_string(), entity_id, granularity, p))
                .and_modify(|pending| pending.union_with(&snapshot))
                .or_insert(snapshot);
            Ok(())
        } else if self.async_write {
            // One-off fire-and-forget. Out-of-order application is fine:
            // merges are commutative unions.
            let repository = Arc::clone(repository);
            let snapshot = entry.read().clone();
            let index_name = index_name.to_string();
            thread::spawn(move || {
                if let Err(err) = persist_partition(
                    repository.as_ref(),
                    &index_name,
                    entity_id,
                    granularity,
                    p,
                    &snapshot,
                ) {
                    error!(
                        index = %index_name,
                        entity = entity_id,
                        partition = p,
                        "async durable write failed: {err}"
                    );
                }
            });
            Ok(())
        } else {
            let snapshot = entry.read().clone();
            persist_partition(
                repository.as_ref(),
                index_name,
                entity_id,
                granularity,
                p,
                &snapshot,
            )
        }
    }

    fn flush_dirty_kv(&self) {
        let keys: Vec<String> = self.dirty.lock().iter().cloned().collect();
        for key in keys {
            let Some(entry) = self.cache.get(&key) else {
                // Entry left the cache; eviction already wrote it out.
                self.dirty.lock().remove(&key);
                continue;
            };
            let bytes = entry.read().serialize();
            match self.kv.set(&key, &bytes) {
                Ok(()) => {
                    self.dirty.lock().remove(&key);
                }
                Err(err) => warn!(key, "write-behind flush failed, retrying next tick: {err}"),
            }
        }
    }

    fn flush_pending_durable(&self) {
        let Some(repository) = &self.repository else {
            return;
        };
        let pending: HashMap<DurableKey, TimeSet> =
            std::mem::take(&mut *self.pending_durable.lock());
        for ((index_name, entity_id, granularity, p), set) in pending {
            if let Err(err) = persist_partition(
                repository.as_ref(),
                &index_name,
                entity_id,
                granularity,
                p,
                &set,
            ) {
                warn!(
                    index = %index_name,
                    entity = entity_id,
                    partition = p,
                    "durable flush failed, retrying next tick: {err}"
                );
                self.pending_durable
                    .lock()
                    .entry((index_name, entity_id, granularity, p))
                    .and_modify(|pending| pending.union_with(&set))
                    .or_insert(set);
            }
        }
    }
}

impl Drop for IndexEngine {
    fn drop(&mut self) {
        self.close();
    }
}

fn ensure_name(index_name: &str) -> Result<()> {
    let printable = !index_name.is_empty()
        && !index_name
            .chars()
            .any(|c| c.is_whitespace() || c.is_control());
    if printable {
        Ok(())
    } else {
        Err(IndexError::NameInvalid(index_name.to_string()))
    }
}

/// Read-merge-write of one partition into the durable store. The stored
/// blob only ever grows: the new set is unioned with whatever is already
/// there.
fn persist_partition(
    repository: &dyn IndexRepository,
    index_name: &str,
    entity_id: i64,
    granularity: Granularity,
    p: u32,
    set: &TimeSet,
) -> Result<()> {
    let mut merged = match repository.get_bitmap(index_name, entity_id, granularity, p)? {
        Some(bytes) if !bytes.is_empty() => match TimeSet::deserialize(&bytes) {
            Ok(existing) => existing,
            Err(_) => {
                warn!(
                    index = index_name,
                    entity = entity_id,
                    partition = p,
                    "corrupt bitmap in durable store, rewriting"
                );
                TimeSet::new()
            }
        },
        _ => TimeSet::new(),
    };
    merged.union_with(set);
    repository.upsert_bitmap(index_name, entity_id, granularity, p, &merged.serialize())
}

fn spawn_flusher(engine: &Arc<IndexEngine>, interval_ms: u64) -> FlusherHandle {
    let weak = Arc::downgrade(engine);
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let interval = Duration::from_millis(interval_ms);

    thread::Builder::new()
        .name("index-flusher".into())
        .spawn(move || {
            loop {
                match shutdown_rx.recv_timeout(interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
                let Some(engine) = weak.upgrade() else {
                    break;
                };
                engine.flush();
            }
            let _ = done_tx.send(());
        })
        .expect("failed to spawn index-flusher thread");

    FlusherHandle {
        shutdown: shutdown_tx,
        done: done_rx,
    }
}

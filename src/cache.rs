// log-enricher - cache.rs
//
// 4.C Persisted caches: generic keyed cache with TTL-less jittered
// eviction and optional state persistence. A disk-backed auxiliary cache
// with its own housekeeping/eviction pass; here, count-based eviction of
// map entries by insertion order, since AppState persistence rather than
// disk space is the bounded resource.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use crate::state::StateStore;
use crate::util::constants::{
    CACHE_TICK_INTERVAL_SECS, CACHE_TICK_JITTER_MAX_SECS, CACHE_TICK_JITTER_MIN_SECS,
    DEFAULT_CACHE_MAX_SIZE,
};

/// Keyed mapping with bounded size and jittered periodic housekeeping.
///
/// Lifecycle: created at engine startup, destroyed at shutdown; concurrent
/// readers, single writer per key courtesy of the `RwLock`.
pub struct PersistedCache<V> {
    name: String,
    map: RwLock<InsertOrderedMap<V>>,
    hits: AtomicU64,
    misses: AtomicU64,
    max_size: usize,
    persisted: bool,
}

/// A map that also records insertion order so housekeeping can trim the
/// oldest-enumerated entries first, without needing per-entry timestamps.
struct InsertOrderedMap<V> {
    entries: HashMap<String, V>,
    order: Vec<String>,
}

impl<V> InsertOrderedMap<V> {
    fn new() -> Self {
        InsertOrderedMap {
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn insert(&mut self, key: String, value: V) {
        if self.entries.insert(key.clone(), value).is_none() {
            self.order.push(key);
        }
    }

    fn trim_to(&mut self, max_size: usize) {
        while self.entries.len() > max_size && !self.order.is_empty() {
            let oldest = self.order.remove(0);
            self.entries.remove(&oldest);
        }
    }
}

impl<V> PersistedCache<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Construct a persisted cache, loading its snapshot from `store` if
    /// `persisted` is true and a snapshot named `name` exists.
    pub fn new(name: impl Into<String>, persisted: bool, store: &StateStore) -> Arc<Self> {
        let name = name.into();
        let mut map = InsertOrderedMap::new();
        if persisted {
            for (key, value) in store.load_cache_snapshot(&name) {
                if let Ok(typed) = serde_json::from_value::<V>(value) {
                    map.insert(key, typed);
                }
            }
        }
        Arc::new(PersistedCache {
            name,
            map: RwLock::new(map),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            max_size: DEFAULT_CACHE_MAX_SIZE,
            persisted,
        })
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let result = self.map.read().entries.get(key).cloned();
        if result.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.map.write().insert(key.into(), value);
    }

    /// Remove a key, if present. Used by background refreshers that drop
    /// entries found to be stale against a live authority.
    pub fn remove(&self, key: &str) {
        let mut map = self.map.write();
        map.entries.remove(key);
        map.order.retain(|k| k != key);
    }

    /// Point-in-time copy of every entry, for background tasks that need
    /// to iterate without holding the lock across `.await` points.
    pub fn snapshot(&self) -> Vec<(String, V)> {
        self.map
            .read()
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.map.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run one housekeeping pass: trim to `max_size`, and — if persisted —
    /// snapshot the whole map into the shared `StateStore`.
    fn housekeeping_tick(&self, store: &StateStore) {
        let mut map = self.map.write();
        map.trim_to(self.max_size);
        if self.persisted {
            let snapshot: HashMap<String, JsonValue> = map
                .entries
                .iter()
                .filter_map(|(k, v)| serde_json::to_value(v).ok().map(|jv| (k.clone(), jv)))
                .collect();
            drop(map);
            store.save_cache_snapshot(&self.name, snapshot);
        }
    }

    /// Spawn the jittered periodic housekeeping task: a randomised 30-530s
    /// initial offset, then a fixed interval. The returned handle is awaited
    /// at shutdown in the application wiring's task-join sequence.
    pub fn spawn_housekeeping(
        self: &Arc<Self>,
        store: Arc<StateStore>,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let initial_delay_secs = rand::thread_rng()
                .gen_range(CACHE_TICK_JITTER_MIN_SECS..=CACHE_TICK_JITTER_MAX_SECS);
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(initial_delay_secs)) => {}
                _ = token.cancelled() => return,
            }

            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(CACHE_TICK_INTERVAL_SECS));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        cache.housekeeping_tick(&store);
                    }
                    _ = token.cancelled() => {
                        cache.housekeeping_tick(&store);
                        return;
                    }
                }
            }
        })
    }
}

/// Type-erased handle letting `PipelineManager` spawn housekeeping for every
/// cache it constructed, regardless of each `PersistedCache<V>`'s value type.
pub trait CacheHousekeeping: Send + Sync {
    fn spawn_housekeeping(
        self: Arc<Self>,
        store: Arc<StateStore>,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()>;
}

impl<V> CacheHousekeeping for PersistedCache<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn spawn_housekeeping(
        self: Arc<Self>,
        store: Arc<StateStore>,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        PersistedCache::spawn_housekeeping(&self, store, token)
    }
}

//! Embedded two-tier key/value store.
//!
//! Entries live either in memory or, after passivation, as marshalled bytes
//! in the passivated tier. Reading a passivated entry activates it again.
//! Listeners observe both transitions and may veto a passivation.

pub mod batch;
pub mod locks;

pub use batch::{Batch, Flags};
pub use locks::LockTable;

use crate::config::CacheConfig;
use crate::error::Result;
use crate::marshal::{BincodeMarshaller, Marshaller};
use crate::subscription::{ListenerRegistry, Subscription};
use batch::Write;
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

/// Key stored in a [`Cache`].
pub trait CacheKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {
    /// Bytes hashed to select the key's owners.
    fn partition_bytes(&self) -> Vec<u8>;

    /// Whether the entry takes part in eviction.
    fn is_evictable(&self) -> bool {
        true
    }
}

/// Value stored in a [`Cache`].
pub trait CacheValue: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Observer of passivation and activation.
///
/// `post_activate` runs while the store's state lock is held and must not
/// call back into the store. `pre_passivate` runs without it and may cascade
/// evictions of other keys.
pub trait CacheListener<K: CacheKey, V: CacheValue>: Send + Sync {
    /// Whether `value` is in use and must stay in memory for now.
    /// Eviction skips such entries instead of failing.
    fn is_in_use(&self, cache: &Cache<K, V>, key: &K, value: &V) -> bool {
        let _ = (cache, key, value);
        false
    }

    /// Called before `value` is moved to the passivated tier.
    /// Returning an error keeps the entry in memory.
    fn pre_passivate(&self, cache: &Cache<K, V>, key: &K, value: &mut V) -> Result<()> {
        let _ = (cache, key, value);
        Ok(())
    }

    /// Called after `value` was read back from the passivated tier.
    fn post_activate(&self, key: &K, value: &mut V) {
        let _ = (key, value);
    }
}

/// Storage tier of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Memory,
    Passivated,
}

/// Statistics snapshot of a cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub memory_entries: usize,
    pub passivated_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub passivations: u64,
    pub activations: u64,
}

struct CacheState<K: Hash + Eq, V> {
    memory: HashMap<K, V>,
    passivated: HashMap<K, Bytes>,
    /// Recency of evictable in-memory keys.
    recency: LruCache<K, ()>,
}

/// Embedded store with per-key locking, batches and passivation.
pub struct Cache<K: CacheKey, V: CacheValue> {
    config: CacheConfig,
    state: Mutex<CacheState<K, V>>,
    locks: LockTable<K>,
    listeners: Arc<ListenerRegistry<dyn CacheListener<K, V>>>,
    marshaller: Arc<dyn Marshaller<V>>,
    this: Weak<Self>,
    next_owner: AtomicU64,
    eviction_pending: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    passivations: AtomicU64,
    activations: AtomicU64,
}

impl<K: CacheKey, V: CacheValue> Cache<K, V> {
    /// Create a store using the given marshaller for the passivated tier.
    pub fn new(config: CacheConfig, marshaller: Arc<dyn Marshaller<V>>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config,
            state: Mutex::new(CacheState {
                memory: HashMap::new(),
                passivated: HashMap::new(),
                recency: LruCache::unbounded(),
            }),
            locks: LockTable::new(),
            listeners: ListenerRegistry::new(),
            marshaller,
            this: this.clone(),
            next_owner: AtomicU64::new(1),
            eviction_pending: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            passivations: AtomicU64::new(0),
            activations: AtomicU64::new(0),
        })
    }

    /// Create a store with the default bincode marshaller.
    pub fn with_config(config: CacheConfig) -> Arc<Self> {
        Self::new(config, Arc::new(BincodeMarshaller::default()))
    }

    /// The store configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Open a new batch.
    pub fn batch(self: &Arc<Self>) -> Batch<K, V> {
        Batch::new(self.clone(), self.next_owner())
    }

    pub(crate) fn locks(&self) -> &LockTable<K> {
        &self.locks
    }

    fn next_owner(&self) -> u64 {
        self.next_owner.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a passivation listener.
    pub fn subscribe(&self, listener: Arc<dyn CacheListener<K, V>>) -> Subscription {
        self.listeners.add(listener)
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Read a committed value, activating it if it is passivated.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let mut state = self.state.lock();
        if let Some(value) = state.memory.get(key).cloned() {
            if key.is_evictable() {
                state.recency.promote(key);
            }
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(value));
        }

        let Some(data) = state.passivated.get(key).cloned() else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let mut value = self.marshaller.read(&data)?;
        for listener in self.listeners.snapshot() {
            listener.post_activate(key, &mut value);
        }

        state.passivated.remove(key);
        state.memory.insert(key.clone(), value.clone());
        if key.is_evictable() {
            state.recency.put(key.clone(), ());
        }
        drop(state);

        self.hits.fetch_add(1, Ordering::Relaxed);
        self.activations.fetch_add(1, Ordering::Relaxed);
        debug!(?key, "Activated entry");

        self.schedule_eviction();
        Ok(Some(value))
    }

    /// Read a committed value from either tier without activating it.
    pub fn peek(&self, key: &K) -> Result<Option<V>> {
        let data = {
            let state = self.state.lock();
            if let Some(value) = state.memory.get(key) {
                return Ok(Some(value.clone()));
            }
            state.passivated.get(key).cloned()
        };
        data.map(|data| self.marshaller.read(&data)).transpose()
    }

    /// Whether a committed entry exists in either tier.
    pub fn contains_key(&self, key: &K) -> bool {
        let state = self.state.lock();
        state.memory.contains_key(key) || state.passivated.contains_key(key)
    }

    /// Tier of a committed entry.
    pub fn tier(&self, key: &K) -> Option<Tier> {
        let state = self.state.lock();
        if state.memory.contains_key(key) {
            Some(Tier::Memory)
        } else if state.passivated.contains_key(key) {
            Some(Tier::Passivated)
        } else {
            None
        }
    }

    /// All committed keys with their tier.
    pub fn keys(&self) -> Vec<(K, Tier)> {
        let state = self.state.lock();
        state
            .memory
            .keys()
            .map(|k| (k.clone(), Tier::Memory))
            .chain(
                state
                    .passivated
                    .keys()
                    .map(|k| (k.clone(), Tier::Passivated)),
            )
            .collect()
    }

    /// Keys currently held in memory.
    pub fn memory_keys(&self) -> Vec<K> {
        self.state.lock().memory.keys().cloned().collect()
    }

    /// Keys currently held in the passivated tier.
    pub fn passivated_keys(&self) -> Vec<K> {
        self.state.lock().passivated.keys().cloned().collect()
    }

    /// Total number of committed entries.
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.memory.len() + state.passivated.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a batch holds the key's lock.
    pub fn is_locked(&self, key: &K) -> bool {
        self.locks.is_locked(key)
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            memory_entries: state.memory.len(),
            passivated_entries: state.passivated.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            passivations: self.passivations.load(Ordering::Relaxed),
            activations: self.activations.load(Ordering::Relaxed),
        }
    }

    /// Move an in-memory entry to the passivated tier.
    ///
    /// Returns `Ok(false)` if the entry is not in memory or is locked by a
    /// batch. A listener error aborts the passivation and is returned.
    pub fn evict(&self, key: &K) -> Result<bool> {
        if !self.config.eviction.is_enabled() {
            return Ok(false);
        }

        let owner = self.next_owner();
        if !self.locks.try_acquire(key, owner) {
            trace!(?key, "Skipping eviction of locked entry");
            return Ok(false);
        }

        let result = self.passivate(key);
        self.locks.release(std::slice::from_ref(key), owner);
        result
    }

    fn passivate(&self, key: &K) -> Result<bool> {
        let Some(mut value) = self.state.lock().memory.get(key).cloned() else {
            return Ok(false);
        };

        let listeners = self.listeners.snapshot();
        if listeners
            .iter()
            .any(|listener| listener.is_in_use(self, key, &value))
        {
            trace!(?key, "Skipping eviction of entry in use");
            return Ok(false);
        }
        for listener in listeners {
            listener.pre_passivate(self, key, &mut value)?;
        }

        let data = self.marshaller.write(&value)?;
        {
            let mut state = self.state.lock();
            state.memory.remove(key);
            state.recency.pop(key);
            state.passivated.insert(key.clone(), data);
        }

        self.passivations.fetch_add(1, Ordering::Relaxed);
        debug!(?key, "Passivated entry");
        Ok(true)
    }

    /// Evict least recently used entries until the memory bound holds.
    ///
    /// Entries that cannot be passivated are skipped and stay in memory.
    pub fn run_pending_tasks(&self) {
        self.eviction_pending.store(false, Ordering::SeqCst);
        let Some(max_entries) = self.config.eviction.max_entries() else {
            return;
        };

        let mut attempts = self.state.lock().recency.len();
        while attempts > 0 {
            attempts -= 1;

            let victim = {
                let state = self.state.lock();
                if state.recency.len() <= max_entries {
                    break;
                }
                state.recency.peek_lru().map(|(key, _)| key.clone())
            };
            let Some(victim) = victim else {
                break;
            };

            match self.evict(&victim) {
                Ok(true) => {}
                Ok(false) => {
                    self.state.lock().recency.promote(&victim);
                }
                Err(e) => {
                    warn!(key = ?victim, error = %e, "Eviction aborted, entry stays in memory");
                    self.state.lock().recency.promote(&victim);
                }
            }
        }
    }

    /// Apply committed batch writes atomically.
    ///
    /// Does not evict; callers run [`Cache::schedule_eviction`] once the
    /// batch's locks are released, so the written keys are candidates too.
    pub(crate) fn apply(&self, writes: HashMap<K, Write<V>>) {
        if writes.is_empty() {
            return;
        }
        {
            let mut state = self.state.lock();
            for (key, write) in writes {
                state.passivated.remove(&key);
                match write {
                    Write::Put(value) => {
                        if key.is_evictable() {
                            state.recency.put(key.clone(), ());
                        }
                        state.memory.insert(key, value);
                    }
                    Write::Remove => {
                        state.recency.pop(&key);
                        state.memory.remove(&key);
                    }
                }
            }
        }
    }

    pub(crate) fn schedule_eviction(&self) {
        let Some(max_entries) = self.config.eviction.max_entries() else {
            return;
        };
        if self.state.lock().recency.len() <= max_entries {
            return;
        }
        if self.eviction_pending.swap(true, Ordering::SeqCst) {
            return;
        }

        match (self.this.upgrade(), tokio::runtime::Handle::try_current()) {
            (Some(cache), Ok(handle)) => {
                handle.spawn(async move { cache.run_pending_tasks() });
            }
            _ => self.run_pending_tasks(),
        }
    }
}

impl<K: CacheKey, V: CacheValue> Debug for Cache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Cache")
            .field("config", &self.config)
            .field("memory_entries", &state.memory.len())
            .field("passivated_entries", &state.passivated.len())
            .field("locks", &self.locks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::time::Duration;

    impl CacheKey for String {
        fn partition_bytes(&self) -> Vec<u8> {
            self.as_bytes().to_vec()
        }

        fn is_evictable(&self) -> bool {
            !self.starts_with("pinned:")
        }
    }

    fn cache(config: CacheConfig) -> Arc<Cache<String, String>> {
        Cache::with_config(config)
    }

    async fn put(cache: &Arc<Cache<String, String>>, key: &str, value: &str) {
        let mut batch = cache.batch();
        batch.put(key.to_string(), value.to_string()).await.unwrap();
        batch.commit().unwrap();
    }

    struct Veto(&'static str);

    impl CacheListener<String, String> for Veto {
        fn pre_passivate(
            &self,
            _cache: &Cache<String, String>,
            key: &String,
            _value: &mut String,
        ) -> Result<()> {
            if key == self.0 {
                return Err(Error::Internal("vetoed".to_string()));
            }
            Ok(())
        }
    }

    struct Suffix;

    impl CacheListener<String, String> for Suffix {
        fn post_activate(&self, _key: &String, value: &mut String) {
            value.push_str("+activated");
        }
    }

    #[tokio::test]
    async fn test_batch_writes_visible_after_commit() {
        let cache = cache(CacheConfig::default());

        let mut batch = cache.batch();
        batch.put("a".to_string(), "1".to_string()).await.unwrap();
        assert_eq!(
            batch.get(&"a".to_string(), Flags::NONE).await.unwrap(),
            Some("1".to_string())
        );
        assert!(!cache.contains_key(&"a".to_string()));

        batch.commit().unwrap();
        assert_eq!(cache.get(&"a".to_string()).unwrap(), Some("1".to_string()));
        assert!(!cache.is_locked(&"a".to_string()));
    }

    #[tokio::test]
    async fn test_discarded_batch_leaves_no_trace() {
        let cache = cache(CacheConfig::default());
        put(&cache, "a", "1").await;

        let mut batch = cache.batch();
        batch.remove(&"a".to_string()).await.unwrap();
        batch.put("b".to_string(), "2".to_string()).await.unwrap();
        drop(batch);

        assert_eq!(cache.peek(&"a".to_string()).unwrap(), Some("1".to_string()));
        assert!(!cache.contains_key(&"b".to_string()));
        assert!(cache.locks().is_empty());
    }

    #[tokio::test]
    async fn test_put_if_absent_returns_existing() {
        let cache = cache(CacheConfig::default());
        put(&cache, "a", "1").await;

        let mut batch = cache.batch();
        let existing = batch
            .put_if_absent("a".to_string(), "2".to_string())
            .await
            .unwrap();
        assert_eq!(existing, Some("1".to_string()));
        assert_eq!(
            batch
                .put_if_absent("b".to_string(), "3".to_string())
                .await
                .unwrap(),
            None
        );
        batch.commit().unwrap();

        assert_eq!(cache.peek(&"a".to_string()).unwrap(), Some("1".to_string()));
        assert_eq!(cache.peek(&"b".to_string()).unwrap(), Some("3".to_string()));
    }

    #[tokio::test]
    async fn test_try_for_update_reports_absent_on_contention() {
        let cache = cache(CacheConfig::default());
        put(&cache, "a", "1").await;

        let mut holder = cache.batch();
        holder
            .get(&"a".to_string(), Flags::FOR_UPDATE)
            .await
            .unwrap();

        let mut other = cache.batch();
        let value = other
            .get(&"a".to_string(), Flags::TRY_FOR_UPDATE)
            .await
            .unwrap();
        assert_eq!(value, None);
        assert!(!other.holds_lock(&"a".to_string()));
    }

    #[tokio::test]
    async fn test_for_update_times_out() {
        let cache = cache(CacheConfig::default().with_lock_timeout(Duration::from_millis(20)));
        put(&cache, "a", "1").await;

        let mut holder = cache.batch();
        holder
            .get(&"a".to_string(), Flags::FOR_UPDATE)
            .await
            .unwrap();

        let mut other = cache.batch();
        let err = other
            .get(&"a".to_string(), Flags::FOR_UPDATE)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_evict_and_activate() {
        let cache = cache(CacheConfig::default().with_eviction(crate::config::EvictionConfig::Manual));
        let _sub = cache.subscribe(Arc::new(Suffix));
        put(&cache, "a", "1").await;

        assert!(cache.evict(&"a".to_string()).unwrap());
        assert_eq!(cache.tier(&"a".to_string()), Some(Tier::Passivated));
        assert_eq!(cache.peek(&"a".to_string()).unwrap(), Some("1".to_string()));

        let value = cache.get(&"a".to_string()).unwrap();
        assert_eq!(value, Some("1+activated".to_string()));
        assert_eq!(cache.tier(&"a".to_string()), Some(Tier::Memory));

        let stats = cache.stats();
        assert_eq!(stats.passivations, 1);
        assert_eq!(stats.activations, 1);
    }

    #[tokio::test]
    async fn test_locked_entries_are_not_evicted() {
        let cache = cache(CacheConfig::default().with_eviction(crate::config::EvictionConfig::Manual));
        put(&cache, "a", "1").await;

        let mut batch = cache.batch();
        batch.get(&"a".to_string(), Flags::FOR_UPDATE).await.unwrap();

        assert!(!cache.evict(&"a".to_string()).unwrap());
        assert_eq!(cache.tier(&"a".to_string()), Some(Tier::Memory));
    }

    #[tokio::test]
    async fn test_veto_keeps_entry_in_memory() {
        let cache = cache(CacheConfig::default().with_eviction(crate::config::EvictionConfig::Manual));
        let _sub = cache.subscribe(Arc::new(Veto("a")));
        put(&cache, "a", "1").await;

        assert!(cache.evict(&"a".to_string()).is_err());
        assert_eq!(cache.tier(&"a".to_string()), Some(Tier::Memory));
    }

    #[tokio::test]
    async fn test_eviction_disabled() {
        let cache = cache(CacheConfig::default());
        put(&cache, "a", "1").await;
        assert!(!cache.evict(&"a".to_string()).unwrap());
    }

    #[test]
    fn test_size_bound_evicts_least_recently_used() {
        let cache = cache(CacheConfig::default().with_max_entries(2));
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        // Outside the runtime eviction runs inline on commit.
        for (k, v) in [("a", "1"), ("b", "2")] {
            let mut batch = cache.batch();
            rt.block_on(batch.put(k.to_string(), v.to_string())).unwrap();
            batch.commit().unwrap();
        }
        cache.get(&"a".to_string()).unwrap();

        let mut batch = cache.batch();
        rt.block_on(batch.put("c".to_string(), "3".to_string())).unwrap();
        batch.commit().unwrap();

        assert_eq!(cache.tier(&"b".to_string()), Some(Tier::Passivated));
        assert_eq!(cache.tier(&"a".to_string()), Some(Tier::Memory));
        assert_eq!(cache.tier(&"c".to_string()), Some(Tier::Memory));
    }

    #[test]
    fn test_size_bound_skips_vetoed_and_pinned() {
        let cache = cache(CacheConfig::default().with_max_entries(1));
        let _sub = cache.subscribe(Arc::new(Veto("a")));
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        for (k, v) in [("pinned:x", "0"), ("a", "1"), ("b", "2")] {
            let mut batch = cache.batch();
            rt.block_on(batch.put(k.to_string(), v.to_string())).unwrap();
            batch.commit().unwrap();
        }

        assert_eq!(cache.tier(&"pinned:x".to_string()), Some(Tier::Memory));
        assert_eq!(cache.tier(&"a".to_string()), Some(Tier::Memory));
        assert_eq!(cache.tier(&"b".to_string()), Some(Tier::Passivated));
    }
}

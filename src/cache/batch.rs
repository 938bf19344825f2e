//! Scoped transactional batches over the embedded store.

use crate::cache::{Cache, CacheKey, CacheValue};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Per-call flags of a batch read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    /// Acquire the key's write lock before reading.
    pub force_write_lock: bool,

    /// Do not wait for a contended lock.
    pub zero_lock_timeout: bool,

    /// Report a contended lock as an absent value instead of an error.
    pub fail_silently: bool,
}

impl Flags {
    /// Plain read without locking.
    pub const NONE: Flags = Flags {
        force_write_lock: false,
        zero_lock_timeout: false,
        fail_silently: false,
    };

    /// Read-for-update: waits for the lock up to the configured timeout.
    pub const FOR_UPDATE: Flags = Flags {
        force_write_lock: true,
        zero_lock_timeout: false,
        fail_silently: false,
    };

    /// Best-effort read-for-update: never waits, absent on contention.
    pub const TRY_FOR_UPDATE: Flags = Flags {
        force_write_lock: true,
        zero_lock_timeout: true,
        fail_silently: true,
    };
}

/// A staged write.
#[derive(Debug, Clone)]
pub(crate) enum Write<V> {
    Put(V),
    Remove,
}

/// A scoped group of store operations.
///
/// Writes are staged and become visible together on [`Batch::commit`].
/// Locks taken by the batch are held until it is committed, discarded or
/// dropped. Dropping an uncommitted batch discards it.
pub struct Batch<K: CacheKey, V: CacheValue> {
    cache: Arc<Cache<K, V>>,
    owner: u64,
    writes: HashMap<K, Write<V>>,
    locked: Vec<K>,
    open: bool,
}

impl<K: CacheKey, V: CacheValue> Batch<K, V> {
    pub(crate) fn new(cache: Arc<Cache<K, V>>, owner: u64) -> Self {
        Self {
            cache,
            owner,
            writes: HashMap::new(),
            locked: Vec::new(),
            open: true,
        }
    }

    /// The store this batch operates on.
    pub fn cache(&self) -> &Arc<Cache<K, V>> {
        &self.cache
    }

    /// Whether the batch holds the write lock of `key`.
    pub fn holds_lock(&self, key: &K) -> bool {
        self.locked.contains(key)
    }

    /// Number of staged writes.
    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    /// Read a value, seeing this batch's own staged writes.
    ///
    /// With [`Flags::fail_silently`], a contended lock yields `Ok(None)`;
    /// otherwise it yields [`Error::Timeout`].
    pub async fn get(&mut self, key: &K, flags: Flags) -> Result<Option<V>> {
        if flags.force_write_lock && !self.lock(key, flags).await? {
            trace!(?key, "Lock contended, reporting absent");
            return Ok(None);
        }

        if let Some(write) = self.writes.get(key) {
            return Ok(match write {
                Write::Put(value) => Some(value.clone()),
                Write::Remove => None,
            });
        }

        self.cache.get(key)
    }

    /// Stage a write of `value` under `key`.
    ///
    /// Repeated puts of one key coalesce into a single write on commit.
    pub async fn put(&mut self, key: K, value: V) -> Result<()> {
        self.lock(&key, Flags::FOR_UPDATE).await?;
        self.writes.insert(key, Write::Put(value));
        Ok(())
    }

    /// Stage a write unless a value exists; returns the existing value.
    pub async fn put_if_absent(&mut self, key: K, value: V) -> Result<Option<V>> {
        if let Some(existing) = self.get(&key, Flags::FOR_UPDATE).await? {
            return Ok(Some(existing));
        }
        self.writes.insert(key, Write::Put(value));
        Ok(None)
    }

    /// Stage removal of `key`; returns the previous value.
    pub async fn remove(&mut self, key: &K) -> Result<Option<V>> {
        self.lock(key, Flags::FOR_UPDATE).await?;
        let previous = match self.writes.get(key) {
            Some(Write::Put(value)) => Some(value.clone()),
            Some(Write::Remove) => None,
            None => self.cache.peek(key)?,
        };
        self.writes.insert(key.clone(), Write::Remove);
        Ok(previous)
    }

    /// Apply all staged writes atomically and release the locks.
    pub fn commit(mut self) -> Result<()> {
        let writes = std::mem::take(&mut self.writes);
        trace!(owner = self.owner, writes = writes.len(), "Committing batch");
        self.cache.apply(writes);
        self.finish();
        self.cache.schedule_eviction();
        Ok(())
    }

    /// Drop all staged writes and release the locks.
    pub fn discard(mut self) {
        trace!(owner = self.owner, writes = self.writes.len(), "Discarding batch");
        self.writes.clear();
        self.finish();
    }

    async fn lock(&mut self, key: &K, flags: Flags) -> Result<bool> {
        let timeout = if flags.zero_lock_timeout {
            Duration::ZERO
        } else {
            self.cache.config().lock_timeout
        };

        if self.cache.locks().acquire(key, self.owner, timeout).await {
            if !self.locked.contains(key) {
                self.locked.push(key.clone());
            }
            Ok(true)
        } else if flags.fail_silently {
            Ok(false)
        } else {
            Err(Error::Timeout)
        }
    }

    fn finish(&mut self) {
        if self.open {
            self.open = false;
            self.cache.locks().release(&self.locked, self.owner);
            self.locked.clear();
        }
    }
}

impl<K: CacheKey, V: CacheValue> Drop for Batch<K, V> {
    fn drop(&mut self) {
        self.finish();
    }
}

impl<K: CacheKey, V: CacheValue> fmt::Debug for Batch<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("owner", &self.owner)
            .field("writes", &self.writes.len())
            .field("locked", &self.locked.len())
            .field("open", &self.open)
            .finish()
    }
}

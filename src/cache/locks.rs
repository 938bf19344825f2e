//! Per-key exclusive locks held by batches.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Exclusive, owner-reentrant locks keyed by cache key.
#[derive(Debug)]
pub struct LockTable<K> {
    /// Key to owning batch id.
    owners: Mutex<HashMap<K, u64>>,

    /// Signalled whenever a lock is released.
    released: Notify,
}

impl<K: Hash + Eq + Clone> LockTable<K> {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self {
            owners: Mutex::new(HashMap::new()),
            released: Notify::new(),
        }
    }

    /// Take the lock if it is free or already held by `owner`.
    pub fn try_acquire(&self, key: &K, owner: u64) -> bool {
        let mut owners = self.owners.lock();
        match owners.get(key) {
            Some(&current) => current == owner,
            None => {
                owners.insert(key.clone(), owner);
                true
            }
        }
    }

    /// Wait up to `timeout` for the lock.
    ///
    /// Returns `false` if the lock is still held by another owner when the
    /// timeout elapses. A zero timeout never waits.
    pub async fn acquire(&self, key: &K, owner: u64, timeout: Duration) -> bool {
        if self.try_acquire(key, owner) {
            return true;
        }
        if timeout.is_zero() {
            return false;
        }

        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // Register before re-checking so a release in between is not missed.
            notified.as_mut().enable();

            if self.try_acquire(key, owner) {
                return true;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_acquire(key, owner);
            }
        }
    }

    /// Release the given keys if they are held by `owner`.
    pub fn release(&self, keys: &[K], owner: u64) {
        if keys.is_empty() {
            return;
        }
        {
            let mut owners = self.owners.lock();
            for key in keys {
                if owners.get(key) == Some(&owner) {
                    owners.remove(key);
                }
            }
        }
        self.released.notify_waiters();
    }

    /// Whether any owner holds the key.
    pub fn is_locked(&self, key: &K) -> bool {
        self.owners.lock().contains_key(key)
    }

    /// Number of held locks.
    pub fn len(&self) -> usize {
        self.owners.lock().len()
    }

    /// Whether no lock is held.
    pub fn is_empty(&self) -> bool {
        self.owners.lock().is_empty()
    }
}

impl<K: Hash + Eq + Clone> Default for LockTable<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_reentrant_for_owner() {
        let locks = LockTable::new();
        assert!(locks.try_acquire(&"a", 1));
        assert!(locks.try_acquire(&"a", 1));
        assert!(!locks.try_acquire(&"a", 2));
        assert!(locks.is_locked(&"a"));
    }

    #[test]
    fn test_release_ignores_other_owners() {
        let locks = LockTable::new();
        assert!(locks.try_acquire(&"a", 1));

        locks.release(&["a"], 2);
        assert!(locks.is_locked(&"a"));

        locks.release(&["a"], 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_zero_timeout_does_not_wait() {
        let locks = LockTable::new();
        assert!(locks.try_acquire(&"a", 1));
        assert!(!locks.acquire(&"a", 2, Duration::ZERO).await);
    }

    #[tokio::test]
    async fn test_waiter_acquires_after_release() {
        let locks = Arc::new(LockTable::new());
        assert!(locks.try_acquire(&"a", 1));

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire(&"a", 2, Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        locks.release(&["a"], 1);

        assert!(waiter.await.unwrap());
        assert!(!locks.try_acquire(&"a", 1));
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let locks = LockTable::new();
        assert!(locks.try_acquire(&"a", 1));
        assert!(!locks.acquire(&"a", 2, Duration::from_millis(30)).await);
    }
}

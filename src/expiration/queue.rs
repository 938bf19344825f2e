//! Pending expirations of one node.

use crate::bean::ExpirationMetaData;
use crate::types::BeanId;
use std::collections::{BTreeMap, HashMap};

/// Order in which due entries are handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOrdering {
    /// Earliest deadline first.
    Deadline,
    /// First scheduled first; used when every bean shares one timeout.
    Insertion,
}

#[derive(Debug, Clone, Copy)]
struct Scheduled {
    expiration: ExpirationMetaData,
    due_ms: u64,
    seq: u64,
}

/// At most one pending expiration per bean.
///
/// Scheduling an identifier that is already queued replaces its entry and
/// moves it behind every other entry in insertion order.
#[derive(Debug)]
pub struct ExpirationQueue {
    ordering: QueueOrdering,
    entries: HashMap<BeanId, Scheduled>,
    order: BTreeMap<(u64, u64), BeanId>,
    next_seq: u64,
}

impl ExpirationQueue {
    pub fn new(ordering: QueueOrdering) -> Self {
        Self {
            ordering,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub fn ordering(&self) -> QueueOrdering {
        self.ordering
    }

    /// Track `id`, replacing any previous entry. Returns whether it replaced.
    pub fn schedule(&mut self, id: BeanId, expiration: ExpirationMetaData) -> bool {
        self.schedule_at(id, expiration, expiration.deadline_ms())
    }

    /// Track `id` with an explicit due time, as done for retries.
    pub fn schedule_at(&mut self, id: BeanId, expiration: ExpirationMetaData, due_ms: u64) -> bool {
        let replaced = self.forget(&id);
        let seq = self.next_seq;
        self.next_seq += 1;

        let entry = Scheduled {
            expiration,
            due_ms,
            seq,
        };
        self.order.insert(self.order_key(&entry), id);
        self.entries.insert(id, entry);
        replaced
    }

    /// Stop tracking `id`. Returns whether it was tracked.
    pub fn forget(&mut self, id: &BeanId) -> bool {
        match self.entries.remove(id) {
            Some(entry) => {
                let key = self.order_key(&entry);
                self.order.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Remove and return the first entry that is due at `now_ms`.
    pub fn poll_expired(&mut self, now_ms: u64) -> Option<(BeanId, ExpirationMetaData)> {
        let id = match self.ordering {
            QueueOrdering::Deadline => self
                .order
                .values()
                .next()
                .copied()
                .filter(|id| self.entries[id].due_ms <= now_ms),
            QueueOrdering::Insertion => self
                .order
                .values()
                .find(|id| self.entries[*id].due_ms <= now_ms)
                .copied(),
        }?;

        let entry = self.entries[&id];
        self.forget(&id);
        Some((id, entry.expiration))
    }

    /// Earliest due time, `None` when nothing is tracked.
    pub fn next_deadline(&self) -> Option<u64> {
        match self.ordering {
            QueueOrdering::Deadline => self.order.keys().next().map(|(due, _)| *due),
            QueueOrdering::Insertion => self.entries.values().map(|e| e.due_ms).min(),
        }
    }

    pub fn contains(&self, id: &BeanId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &BeanId) -> Option<ExpirationMetaData> {
        self.entries.get(id).map(|e| e.expiration)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tracked identifiers in hand-out order.
    pub fn ids(&self) -> Vec<BeanId> {
        self.order.values().copied().collect()
    }

    /// Keep only identifiers for which `keep` holds; returns the dropped ones.
    pub fn retain(&mut self, mut keep: impl FnMut(&BeanId) -> bool) -> Vec<BeanId> {
        let dropped: Vec<BeanId> = self.entries.keys().filter(|id| !keep(*id)).copied().collect();
        for id in &dropped {
            self.forget(id);
        }
        dropped
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn order_key(&self, entry: &Scheduled) -> (u64, u64) {
        match self.ordering {
            QueueOrdering::Deadline => (entry.due_ms, entry.seq),
            QueueOrdering::Insertion => (entry.seq, 0),
        }
    }
}

//! Groups of bean instances stored as one cache entry.

use crate::bean::key::{BeanEntry, BeanKey};
use crate::bean::BeanBatch;
use crate::cache::{CacheValue, Flags};
use crate::error::Result;
use crate::types::{BeanId, GroupId};
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use tracing::trace;

/// Instances of one group, in the order they were added.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeanGroupEntry<T> {
    instances: Vec<(BeanId, T)>,
}

impl<T> BeanGroupEntry<T> {
    pub fn new() -> Self {
        Self {
            instances: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn contains(&self, id: &BeanId) -> bool {
        self.instances.iter().any(|(i, _)| i == id)
    }

    pub fn get(&self, id: &BeanId) -> Option<&T> {
        self.instances.iter().find(|(i, _)| i == id).map(|(_, t)| t)
    }

    pub fn get_mut(&mut self, id: &BeanId) -> Option<&mut T> {
        self.instances
            .iter_mut()
            .find(|(i, _)| i == id)
            .map(|(_, t)| t)
    }

    /// Add or replace an instance; a new instance goes last.
    pub fn insert(&mut self, id: BeanId, instance: T) {
        match self.get_mut(&id) {
            Some(existing) => *existing = instance,
            None => self.instances.push((id, instance)),
        }
    }

    pub fn remove(&mut self, id: &BeanId) -> Option<T> {
        let index = self.instances.iter().position(|(i, _)| i == id)?;
        Some(self.instances.remove(index).1)
    }

    /// Member identifiers in insertion order.
    pub fn ids(&self) -> Vec<BeanId> {
        self.instances.iter().map(|(id, _)| *id).collect()
    }

    /// Instance at `index` in insertion order.
    pub(crate) fn at_mut(&mut self, index: usize) -> Option<(BeanId, &mut T)> {
        self.instances.get_mut(index).map(|(id, t)| (*id, t))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BeanId, &T)> {
        self.instances.iter().map(|(id, t)| (id, t))
    }
}

impl<T> Default for BeanGroupEntry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A group read within a batch.
///
/// Membership changes are buffered per member and merged into the stored
/// entry by [`BeanGroup::flush`]. The group is not locked until then, so
/// beans of one group can be in use at the same time.
#[derive(Debug)]
pub struct BeanGroup<T> {
    id: GroupId,
    entry: BeanGroupEntry<T>,
    touched: Vec<BeanId>,
}

impl<T: CacheValue> BeanGroup<T> {
    fn new(id: GroupId, entry: BeanGroupEntry<T>) -> Self {
        Self {
            id,
            entry,
            touched: Vec::new(),
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn entry(&self) -> &BeanGroupEntry<T> {
        &self.entry
    }

    pub fn instance(&self, id: &BeanId) -> Option<&T> {
        self.entry.get(id)
    }

    /// Mutable access to an instance; the change is written on flush.
    pub fn instance_mut(&mut self, id: &BeanId) -> Option<&mut T> {
        let instance = self.entry.get_mut(id)?;
        if !self.touched.contains(id) {
            self.touched.push(*id);
        }
        Some(instance)
    }

    pub fn add(&mut self, id: BeanId, instance: T) {
        self.entry.insert(id, instance);
        self.touch(id);
    }

    pub fn remove(&mut self, id: &BeanId) -> Option<T> {
        let removed = self.entry.remove(id)?;
        self.touch(*id);
        Some(removed)
    }

    fn touch(&mut self, id: BeanId) {
        if !self.touched.contains(&id) {
            self.touched.push(id);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entry.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        !self.touched.is_empty()
    }

    /// Merge the changed members into the stored entry.
    ///
    /// Locks the group and re-reads it, so changes made through other
    /// handles since this one was read are kept. An emptied group is removed.
    pub async fn flush(&mut self, batch: &mut BeanBatch<T>) -> Result<()> {
        if self.touched.is_empty() {
            return Ok(());
        }

        let key = BeanKey::Group(self.id);
        let mut current = batch
            .get(&key, Flags::FOR_UPDATE)
            .await?
            .and_then(BeanEntry::into_group)
            .unwrap_or_default();
        for id in self.touched.drain(..) {
            match self.entry.get(&id) {
                Some(instance) => current.insert(id, instance.clone()),
                None => {
                    current.remove(&id);
                }
            }
        }

        if current.is_empty() {
            trace!(group_id = %self.id, "Removing empty group");
            batch.remove(&key).await?;
        } else {
            batch.put(key, BeanEntry::Group(current)).await?;
        }
        Ok(())
    }
}

/// Reads and writes group entries.
#[derive(Debug)]
pub struct BeanGroupManager<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T: CacheValue> BeanGroupManager<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }

    /// The group to add a new bean to, empty if it does not exist yet.
    ///
    /// Nothing is written until the group is flushed; concurrent creators
    /// merge into the single stored entry.
    pub async fn create_group(&self, batch: &mut BeanBatch<T>, id: GroupId) -> Result<BeanGroup<T>> {
        let entry = batch
            .get(&BeanKey::Group(id), Flags::NONE)
            .await?
            .and_then(BeanEntry::into_group)
            .unwrap_or_default();
        Ok(BeanGroup::new(id, entry))
    }

    /// Read a group without locking it.
    pub async fn find_group(&self, batch: &mut BeanBatch<T>, id: GroupId) -> Result<Option<BeanGroup<T>>> {
        self.read_group(batch, id, Flags::NONE).await
    }

    /// Read and lock a group without waiting; `None` when absent or contended.
    pub async fn try_group(&self, batch: &mut BeanBatch<T>, id: GroupId) -> Result<Option<BeanGroup<T>>> {
        self.read_group(batch, id, Flags::TRY_FOR_UPDATE).await
    }

    async fn read_group(
        &self,
        batch: &mut BeanBatch<T>,
        id: GroupId,
        flags: Flags,
    ) -> Result<Option<BeanGroup<T>>> {
        let entry = batch.get(&BeanKey::Group(id), flags).await?;
        Ok(entry
            .and_then(BeanEntry::into_group)
            .map(|entry| BeanGroup::new(id, entry)))
    }

    /// Remove a group entry if it has no members.
    ///
    /// Returns whether it was removed.
    pub async fn remove_empty_group(&self, batch: &mut BeanBatch<T>, id: GroupId) -> Result<bool> {
        let key = BeanKey::Group(id);
        let current = batch
            .get(&key, Flags::FOR_UPDATE)
            .await?
            .and_then(BeanEntry::into_group);
        match current {
            Some(entry) if entry.is_empty() => {
                batch.remove(&key).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

impl<T: CacheValue> Default for BeanGroupManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bean::BeanCache;
    use crate::config::CacheConfig;

    #[test]
    fn test_entry_keeps_insertion_order() {
        let (a, b, c) = (BeanId::new(), BeanId::new(), BeanId::new());
        let mut entry = BeanGroupEntry::new();
        entry.insert(a, 1);
        entry.insert(b, 2);
        entry.insert(c, 3);
        entry.insert(a, 10);

        assert_eq!(entry.ids(), vec![a, b, c]);
        assert_eq!(entry.get(&a), Some(&10));
        assert_eq!(entry.remove(&b), Some(2));
        assert_eq!(entry.ids(), vec![a, c]);
    }

    #[tokio::test]
    async fn test_create_group_sees_existing_members() {
        let cache = BeanCache::<u32>::with_config(CacheConfig::default());
        let groups = BeanGroupManager::<u32>::new();
        let group_id = GroupId::new();
        let first = BeanId::new();

        let mut batch = cache.batch();
        let mut group = groups.create_group(&mut batch, group_id).await.unwrap();
        group.add(first, 1);
        group.flush(&mut batch).await.unwrap();
        batch.commit().unwrap();

        let mut batch = cache.batch();
        let group = groups.create_group(&mut batch, group_id).await.unwrap();
        assert_eq!(group.entry().ids(), vec![first]);
        assert!(!group.is_dirty());
    }

    #[tokio::test]
    async fn test_flush_removes_empty_group() {
        let cache = BeanCache::<u32>::with_config(CacheConfig::default());
        let groups = BeanGroupManager::<u32>::new();
        let group_id = GroupId::new();
        let id = BeanId::new();

        let mut batch = cache.batch();
        let mut group = groups.create_group(&mut batch, group_id).await.unwrap();
        group.add(id, 1);
        group.flush(&mut batch).await.unwrap();
        batch.commit().unwrap();

        let mut batch = cache.batch();
        let mut group = groups.find_group(&mut batch, group_id).await.unwrap().unwrap();
        assert_eq!(group.remove(&id), Some(1));
        group.flush(&mut batch).await.unwrap();
        batch.commit().unwrap();

        assert!(!cache.contains_key(&BeanKey::Group(group_id)));
    }

    #[tokio::test]
    async fn test_flush_merges_changes_of_open_handles() {
        let cache = BeanCache::<u32>::with_config(CacheConfig::default());
        let groups = BeanGroupManager::<u32>::new();
        let group_id = GroupId::new();
        let (a, b, c) = (BeanId::new(), BeanId::new(), BeanId::new());

        let mut batch = cache.batch();
        let mut group = groups.create_group(&mut batch, group_id).await.unwrap();
        group.add(a, 1);
        group.flush(&mut batch).await.unwrap();
        batch.commit().unwrap();

        // Two handles read the group before either writes.
        let mut first_batch = cache.batch();
        let mut first = groups.create_group(&mut first_batch, group_id).await.unwrap();
        let mut second_batch = cache.batch();
        let mut second = groups.find_group(&mut second_batch, group_id).await.unwrap().unwrap();

        first.add(b, 2);
        second.add(c, 3);
        assert_eq!(second.remove(&a), Some(1));

        first.flush(&mut first_batch).await.unwrap();
        first_batch.commit().unwrap();
        second.flush(&mut second_batch).await.unwrap();
        second_batch.commit().unwrap();

        let entry = cache
            .peek(&BeanKey::Group(group_id))
            .unwrap()
            .and_then(BeanEntry::into_group)
            .unwrap();
        assert_eq!(entry.ids(), vec![b, c]);
    }

    #[tokio::test]
    async fn test_remove_empty_group_keeps_members() {
        let cache = BeanCache::<u32>::with_config(CacheConfig::default());
        let groups = BeanGroupManager::<u32>::new();
        let group_id = GroupId::new();

        let mut batch = cache.batch();
        let mut group = groups.create_group(&mut batch, group_id).await.unwrap();
        group.add(BeanId::new(), 1);
        group.flush(&mut batch).await.unwrap();
        batch.commit().unwrap();

        let mut batch = cache.batch();
        assert!(!groups.remove_empty_group(&mut batch, group_id).await.unwrap());
        batch.commit().unwrap();
        assert!(cache.contains_key(&BeanKey::Group(group_id)));
    }
}

//! Reads and writes the metadata records of beans.

use crate::bean::key::{BeanEntry, BeanKey};
use crate::bean::metadata::{
    BeanAccessMetaData, BeanCreationMetaData, BeanMetaData, ImmutableBeanMetaData,
};
use crate::bean::BeanBatch;
use crate::cache::{CacheValue, Flags};
use crate::error::Result;
use crate::types::{BeanId, Clock, GroupId};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Stored metadata of one bean.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeanValue {
    pub creation: BeanCreationMetaData,

    /// `None` when no timeout is configured.
    pub access: Option<BeanAccessMetaData>,
}

/// Translates bean identifiers into metadata records.
pub struct BeanFactory<T> {
    bean_name: String,
    timeout: Option<Duration>,
    clock: Arc<dyn Clock>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: CacheValue> BeanFactory<T> {
    pub fn new(bean_name: impl Into<String>, timeout: Option<Duration>, clock: Arc<dyn Clock>) -> Self {
        Self {
            bean_name: bean_name.into(),
            timeout,
            clock,
            _marker: PhantomData,
        }
    }

    pub fn bean_name(&self) -> &str {
        &self.bean_name
    }

    /// Whether access records are kept.
    pub fn tracks_access(&self) -> bool {
        self.timeout.is_some()
    }

    /// Whether a creation record belongs to this bean type.
    pub fn matches(&self, creation: &BeanCreationMetaData) -> bool {
        creation.name == self.bean_name
    }

    /// Write the metadata of a new bean.
    ///
    /// Creation and access records are staged in the same batch.
    pub async fn create_value(
        &self,
        batch: &mut BeanBatch<T>,
        id: BeanId,
        group_id: GroupId,
    ) -> Result<BeanValue> {
        let now = self.clock.now_ms();
        let creation = BeanCreationMetaData {
            name: self.bean_name.clone(),
            group_id,
            created_ms: now,
        };
        batch
            .put(BeanKey::Creation(id), BeanEntry::Creation(creation.clone()))
            .await?;

        let access = if self.tracks_access() {
            let access = BeanAccessMetaData {
                last_accessed_ms: now,
            };
            batch
                .put(BeanKey::Access(id), BeanEntry::Access(access))
                .await?;
            Some(access)
        } else {
            None
        };

        debug!(bean_id = %id, %group_id, "Created bean metadata");
        Ok(BeanValue { creation, access })
    }

    /// Read the metadata for update, waiting for locks.
    pub async fn find_value(&self, batch: &mut BeanBatch<T>, id: BeanId) -> Result<Option<BeanValue>> {
        self.read_value(batch, id, Flags::FOR_UPDATE).await
    }

    /// Read the metadata for update without waiting.
    ///
    /// Returns `None` if the bean does not exist or its records are locked;
    /// [`BeanBatch::holds_lock`] tells the two apart.
    pub async fn try_value(&self, batch: &mut BeanBatch<T>, id: BeanId) -> Result<Option<BeanValue>> {
        self.read_value(batch, id, Flags::TRY_FOR_UPDATE).await
    }

    async fn read_value(
        &self,
        batch: &mut BeanBatch<T>,
        id: BeanId,
        flags: Flags,
    ) -> Result<Option<BeanValue>> {
        let creation = batch
            .get(&BeanKey::Creation(id), flags)
            .await?
            .and_then(|entry| entry.as_creation().cloned());
        let Some(creation) = creation else {
            return Ok(None);
        };

        let access = if self.tracks_access() {
            let access = batch
                .get(&BeanKey::Access(id), flags)
                .await?
                .and_then(|entry| entry.as_access().copied());
            if access.is_none() && !batch.holds_lock(&BeanKey::Access(id)) {
                return Ok(None);
            }
            // Records written before a timeout was configured.
            Some(access.unwrap_or(BeanAccessMetaData {
                last_accessed_ms: creation.created_ms,
            }))
        } else {
            None
        };

        Ok(Some(BeanValue { creation, access }))
    }

    /// Remove the metadata of a bean. Absent records are not an error.
    pub async fn remove(&self, batch: &mut BeanBatch<T>, id: BeanId) -> Result<bool> {
        batch.remove(&BeanKey::Creation(id)).await?;
        batch.remove(&BeanKey::Access(id)).await?;
        debug!(bean_id = %id, "Removed bean metadata");
        Ok(true)
    }

    /// Metadata view with deferred access updates.
    pub fn create_bean_metadata(&self, id: BeanId, value: BeanValue) -> BeanMetaData {
        BeanMetaData::new(id, value.creation, value.access, self.timeout)
    }

    /// Read-only metadata view.
    pub fn create_immutable_bean_metadata(&self, id: BeanId, value: BeanValue) -> ImmutableBeanMetaData {
        ImmutableBeanMetaData::new(id, value.creation, value.access, self.timeout)
    }
}

impl<T> fmt::Debug for BeanFactory<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeanFactory")
            .field("bean_name", &self.bean_name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bean::BeanCache;
    use crate::config::CacheConfig;
    use crate::types::ManualClock;

    fn factory(timeout: Option<Duration>) -> BeanFactory<u32> {
        BeanFactory::new("Cart", timeout, Arc::new(ManualClock::new(10_000)))
    }

    #[tokio::test]
    async fn test_create_writes_both_records() {
        let cache = BeanCache::<u32>::with_config(CacheConfig::default());
        let factory = factory(Some(Duration::from_secs(1)));
        let (id, group_id) = (BeanId::new(), GroupId::new());

        let mut batch = cache.batch();
        let value = factory.create_value(&mut batch, id, group_id).await.unwrap();
        assert!(!cache.contains_key(&BeanKey::Creation(id)));
        batch.commit().unwrap();

        assert!(cache.contains_key(&BeanKey::Creation(id)));
        assert!(cache.contains_key(&BeanKey::Access(id)));
        assert_eq!(value.access.map(|a| a.last_accessed_ms), Some(10_000));

        let mut batch = cache.batch();
        let found = factory.find_value(&mut batch, id).await.unwrap();
        assert_eq!(found, Some(value));
    }

    #[tokio::test]
    async fn test_immortal_beans_have_no_access_record() {
        let cache = BeanCache::<u32>::with_config(CacheConfig::default());
        let factory = factory(None);
        let id = BeanId::new();

        let mut batch = cache.batch();
        factory.create_value(&mut batch, id, GroupId::new()).await.unwrap();
        batch.commit().unwrap();

        assert!(cache.contains_key(&BeanKey::Creation(id)));
        assert!(!cache.contains_key(&BeanKey::Access(id)));
    }

    #[tokio::test]
    async fn test_try_value_does_not_wait() {
        let cache = BeanCache::<u32>::with_config(CacheConfig::default());
        let factory = factory(Some(Duration::from_secs(1)));
        let id = BeanId::new();

        let mut batch = cache.batch();
        factory.create_value(&mut batch, id, GroupId::new()).await.unwrap();
        batch.commit().unwrap();

        let mut holder = cache.batch();
        factory.find_value(&mut holder, id).await.unwrap().unwrap();

        let mut other = cache.batch();
        assert_eq!(factory.try_value(&mut other, id).await.unwrap(), None);
        assert!(!other.holds_lock(&BeanKey::Creation(id)));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let cache = BeanCache::<u32>::with_config(CacheConfig::default());
        let factory = factory(Some(Duration::from_secs(1)));
        let id = BeanId::new();

        let mut batch = cache.batch();
        assert!(factory.remove(&mut batch, id).await.unwrap());
        batch.commit().unwrap();

        let mut batch = cache.batch();
        factory.create_value(&mut batch, id, GroupId::new()).await.unwrap();
        batch.commit().unwrap();

        let mut batch = cache.batch();
        assert!(factory.remove(&mut batch, id).await.unwrap());
        batch.commit().unwrap();
        assert!(cache.is_empty());
    }
}

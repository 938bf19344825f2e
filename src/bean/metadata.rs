//! Bean metadata records and the views assembled from them.

use crate::types::{BeanId, GroupId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Immutable identity of a bean, written once at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeanCreationMetaData {
    /// Name of the bean type.
    pub name: String,

    pub group_id: GroupId,

    /// Creation time in milliseconds since the Unix epoch.
    pub created_ms: u64,
}

/// Mutable access record, present only for beans with a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeanAccessMetaData {
    pub last_accessed_ms: u64,
}

/// What the expiration scheduler needs to know about a bean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpirationMetaData {
    pub timeout: Duration,
    pub last_accessed_ms: u64,
}

impl ExpirationMetaData {
    pub fn new(timeout: Duration, last_accessed_ms: u64) -> Self {
        Self {
            timeout,
            last_accessed_ms,
        }
    }

    /// Time at which the bean expires.
    pub fn deadline_ms(&self) -> u64 {
        self.last_accessed_ms
            .saturating_add(self.timeout.as_millis() as u64)
    }

    /// A zero timeout never reports expiry here; such beans are removed on
    /// release instead.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        !self.timeout.is_zero() && now_ms >= self.deadline_ms()
    }
}

fn expiration(timeout: Option<Duration>, access: Option<&BeanAccessMetaData>) -> Option<ExpirationMetaData> {
    match (timeout, access) {
        (Some(timeout), Some(access)) => Some(ExpirationMetaData::new(timeout, access.last_accessed_ms)),
        _ => None,
    }
}

/// Metadata of an active bean.
///
/// Access updates are deferred: [`BeanMetaData::set_last_accessed`] only
/// changes the in-memory copy, and the owning bean writes the record once
/// when it is closed.
#[derive(Debug, Clone)]
pub struct BeanMetaData {
    id: BeanId,
    creation: BeanCreationMetaData,
    /// `None` for immortal beans.
    access: Option<BeanAccessMetaData>,
    timeout: Option<Duration>,
    dirty: bool,
}

impl BeanMetaData {
    pub(crate) fn new(
        id: BeanId,
        creation: BeanCreationMetaData,
        access: Option<BeanAccessMetaData>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            id,
            creation,
            access,
            timeout,
            dirty: false,
        }
    }

    pub fn id(&self) -> BeanId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.creation.name
    }

    pub fn group_id(&self) -> GroupId {
        self.creation.group_id
    }

    pub fn created_ms(&self) -> u64 {
        self.creation.created_ms
    }

    /// Last access time, `None` for immortal beans.
    pub fn last_accessed_ms(&self) -> Option<u64> {
        self.access.map(|a| a.last_accessed_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Whether the bean was idle for at least its timeout.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expiration().is_some_and(|e| e.is_expired(now_ms))
    }

    /// Scheduling input, `None` for immortal beans.
    pub fn expiration(&self) -> Option<ExpirationMetaData> {
        expiration(self.timeout, self.access.as_ref())
    }

    /// Record an access. Immortal beans have nothing to record.
    pub fn set_last_accessed(&mut self, now_ms: u64) {
        if let Some(access) = self.access.as_mut() {
            access.last_accessed_ms = now_ms;
            self.dirty = true;
        }
    }

    /// Whether an access update is waiting to be written.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Take the pending access update, if any.
    pub(crate) fn take_access_update(&mut self) -> Option<BeanAccessMetaData> {
        if std::mem::take(&mut self.dirty) {
            self.access
        } else {
            None
        }
    }

    /// Read-only copy of this metadata.
    pub fn to_immutable(&self) -> ImmutableBeanMetaData {
        ImmutableBeanMetaData {
            id: self.id,
            creation: self.creation.clone(),
            access: self.access,
            timeout: self.timeout,
        }
    }
}

/// Read-only bean metadata, used by expiration checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImmutableBeanMetaData {
    id: BeanId,
    creation: BeanCreationMetaData,
    access: Option<BeanAccessMetaData>,
    timeout: Option<Duration>,
}

impl ImmutableBeanMetaData {
    pub(crate) fn new(
        id: BeanId,
        creation: BeanCreationMetaData,
        access: Option<BeanAccessMetaData>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            id,
            creation,
            access,
            timeout,
        }
    }

    pub fn id(&self) -> BeanId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.creation.name
    }

    pub fn group_id(&self) -> GroupId {
        self.creation.group_id
    }

    pub fn last_accessed_ms(&self) -> Option<u64> {
        self.access.map(|a| a.last_accessed_ms)
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expiration().is_some_and(|e| e.is_expired(now_ms))
    }

    pub fn expiration(&self) -> Option<ExpirationMetaData> {
        expiration(self.timeout, self.access.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creation() -> BeanCreationMetaData {
        BeanCreationMetaData {
            name: "Cart".to_string(),
            group_id: GroupId::new(),
            created_ms: 1_000,
        }
    }

    #[test]
    fn test_expiry_boundary() {
        let expiration = ExpirationMetaData::new(Duration::from_millis(500), 1_000);
        assert_eq!(expiration.deadline_ms(), 1_500);
        assert!(!expiration.is_expired(1_499));
        assert!(expiration.is_expired(1_500));
    }

    #[test]
    fn test_zero_timeout_never_expires() {
        let expiration = ExpirationMetaData::new(Duration::ZERO, 1_000);
        assert!(!expiration.is_expired(u64::MAX));
    }

    #[test]
    fn test_immortal_bean() {
        let mut metadata = BeanMetaData::new(BeanId::new(), creation(), None, None);
        metadata.set_last_accessed(5_000);

        assert!(!metadata.is_dirty());
        assert_eq!(metadata.last_accessed_ms(), None);
        assert_eq!(metadata.expiration(), None);
        assert!(!metadata.is_expired(u64::MAX));
    }

    #[test]
    fn test_deferred_access_update() {
        let access = BeanAccessMetaData {
            last_accessed_ms: 1_000,
        };
        let mut metadata = BeanMetaData::new(
            BeanId::new(),
            creation(),
            Some(access),
            Some(Duration::from_secs(1)),
        );

        metadata.set_last_accessed(1_200);
        metadata.set_last_accessed(1_400);
        assert!(metadata.is_dirty());

        let update = metadata.take_access_update();
        assert_eq!(update.map(|a| a.last_accessed_ms), Some(1_400));
        assert_eq!(metadata.take_access_update(), None);

        let immutable = metadata.to_immutable();
        assert!(!immutable.is_expired(2_399));
        assert!(immutable.is_expired(2_400));
    }
}

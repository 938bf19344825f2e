//! Cache keys and values of bean records.

use crate::bean::group::BeanGroupEntry;
use crate::bean::metadata::{BeanAccessMetaData, BeanCreationMetaData};
use crate::cache::CacheKey;
use crate::types::{BeanId, GroupId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Key of a bean record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BeanKey {
    Creation(BeanId),
    Access(BeanId),
    Group(GroupId),
}

impl BeanKey {
    /// The bean a metadata key belongs to.
    pub fn bean_id(&self) -> Option<BeanId> {
        match self {
            BeanKey::Creation(id) | BeanKey::Access(id) => Some(*id),
            BeanKey::Group(_) => None,
        }
    }
}

impl CacheKey for BeanKey {
    /// Creation and access records of one bean share an owner.
    fn partition_bytes(&self) -> Vec<u8> {
        match self {
            BeanKey::Creation(id) | BeanKey::Access(id) => id.as_bytes().to_vec(),
            BeanKey::Group(id) => id.as_bytes().to_vec(),
        }
    }

    /// Only groups are evicted by size; metadata follows them.
    fn is_evictable(&self) -> bool {
        matches!(self, BeanKey::Group(_))
    }
}

/// Value of a bean record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "T: Serialize", deserialize = "T: DeserializeOwned"))]
pub enum BeanEntry<T> {
    Creation(BeanCreationMetaData),
    Access(BeanAccessMetaData),
    Group(BeanGroupEntry<T>),
}

impl<T> BeanEntry<T> {
    pub fn as_creation(&self) -> Option<&BeanCreationMetaData> {
        match self {
            BeanEntry::Creation(creation) => Some(creation),
            _ => None,
        }
    }

    pub fn as_access(&self) -> Option<&BeanAccessMetaData> {
        match self {
            BeanEntry::Access(access) => Some(access),
            _ => None,
        }
    }

    pub fn into_group(self) -> Option<BeanGroupEntry<T>> {
        match self {
            BeanEntry::Group(group) => Some(group),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_keys_share_partition() {
        let id = BeanId::new();
        assert_eq!(
            BeanKey::Creation(id).partition_bytes(),
            BeanKey::Access(id).partition_bytes()
        );
        assert_eq!(BeanKey::Creation(id).bean_id(), Some(id));
        assert_eq!(BeanKey::Group(GroupId::from(id)).bean_id(), None);
    }

    #[test]
    fn test_only_groups_are_evictable() {
        let id = BeanId::new();
        assert!(!BeanKey::Creation(id).is_evictable());
        assert!(!BeanKey::Access(id).is_evictable());
        assert!(BeanKey::Group(GroupId::from(id)).is_evictable());
    }
}

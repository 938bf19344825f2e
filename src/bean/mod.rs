//! Beans, their stored records and the factories that read and write them.
//!
//! Each bean is stored as three logical records in the cache:
//!
//! ```text
//! BeanKey::Creation(id) ─► BeanCreationMetaData { name, group_id }
//! BeanKey::Access(id)   ─► BeanAccessMetaData { last_accessed_ms }  (timeout only)
//! BeanKey::Group(gid)   ─► BeanGroupEntry { id ─► instance, ... }
//! ```

mod facade;
mod factory;
mod group;
mod key;
mod metadata;

pub use facade::Bean;
pub use factory::{BeanFactory, BeanValue};
pub use group::{BeanGroup, BeanGroupEntry, BeanGroupManager};
pub use key::{BeanEntry, BeanKey};
pub use metadata::{
    BeanAccessMetaData, BeanCreationMetaData, BeanMetaData, ExpirationMetaData,
    ImmutableBeanMetaData,
};

use crate::cache::{Batch, Cache};
use crate::error::LifecycleError;
use crate::types::BeanId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

/// The cache holding the records of beans of type `T`.
pub type BeanCache<T> = Cache<BeanKey, BeanEntry<T>>;

/// A batch over a [`BeanCache`].
pub type BeanBatch<T> = Batch<BeanKey, BeanEntry<T>>;

/// A stateful bean instance.
///
/// Instances are serialized when their group is passivated; the callbacks
/// run on the copy that is written out or read back.
pub trait BeanInstance: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Identifier of this instance.
    fn id(&self) -> BeanId;

    /// Called after the instance was read back from the passivated tier.
    fn post_activate(&mut self) -> Result<(), LifecycleError> {
        Ok(())
    }

    /// Called before the instance is written to the passivated tier.
    /// An error aborts passivation of the whole group.
    fn pre_passivate(&mut self) -> Result<(), LifecycleError> {
        Ok(())
    }
}

/// Notified with the instance of a bean that was removed or expired.
pub trait RemoveListener<T>: Send + Sync {
    fn removed(&self, id: &BeanId, instance: &T);
}

impl<T, F> RemoveListener<T> for F
where
    F: Fn(&BeanId, &T) + Send + Sync,
{
    fn removed(&self, id: &BeanId, instance: &T) {
        self(id, instance)
    }
}

/// Supplies identifiers for new beans.
pub trait IdentifierFactory: Send + Sync + Debug {
    fn create_identifier(&self) -> BeanId;
}

/// Random UUID identifiers.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdentifierFactory;

impl IdentifierFactory for UuidIdentifierFactory {
    fn create_identifier(&self) -> BeanId {
        BeanId::new()
    }
}

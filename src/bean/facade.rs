//! Per-access bean handle.

use crate::bean::group::BeanGroup;
use crate::bean::key::{BeanEntry, BeanKey};
use crate::bean::metadata::BeanMetaData;
use crate::bean::{BeanBatch, BeanInstance, RemoveListener};
use crate::error::{Error, Result};
use crate::manager::ManagerInner;
use crate::types::{BeanId, GroupId};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;
use tracing::{debug, warn};

/// A bean acquired from a [`BeanManager`](crate::manager::BeanManager).
///
/// The handle owns the batch its records were read in, so the bean's
/// metadata records stay locked until the handle is closed or dropped. The
/// group is locked only while closing, when this bean's changes are merged
/// into it. Dropping without [`Bean::close`] discards every change.
pub struct Bean<T: BeanInstance> {
    id: BeanId,
    metadata: BeanMetaData,
    group: BeanGroup<T>,
    batch: Option<BeanBatch<T>>,
    valid: AtomicBool,
    manager: Weak<ManagerInner<T>>,
}

impl<T: BeanInstance> Bean<T> {
    pub(crate) fn new(
        metadata: BeanMetaData,
        group: BeanGroup<T>,
        batch: BeanBatch<T>,
        manager: Weak<ManagerInner<T>>,
    ) -> Self {
        Self {
            id: metadata.id(),
            metadata,
            group,
            batch: Some(batch),
            valid: AtomicBool::new(true),
            manager,
        }
    }

    pub fn id(&self) -> BeanId {
        self.id
    }

    pub fn group_id(&self) -> GroupId {
        self.group.id()
    }

    pub fn metadata(&self) -> &BeanMetaData {
        &self.metadata
    }

    /// The bean instance, `None` once removed.
    pub fn instance(&self) -> Option<&T> {
        self.group.instance(&self.id)
    }

    /// Mutable access to the instance; changes are written on close.
    pub fn instance_mut(&mut self) -> Option<&mut T> {
        self.group.instance_mut(&self.id)
    }

    /// Whether the bean has not been removed.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Whether the bean was idle for at least its timeout.
    pub fn is_expired(&self) -> bool {
        self.manager
            .upgrade()
            .is_some_and(|manager| self.metadata.is_expired(manager.clock.now_ms()))
    }

    /// Remove the bean, notifying `listener` with its instance.
    ///
    /// Only the first call removes; later calls return `Ok(false)`. The
    /// removal becomes visible when the bean is closed.
    pub async fn remove(&mut self, listener: Option<&dyn RemoveListener<T>>) -> Result<bool> {
        let removed = self.remove_with(listener).await?;
        if removed {
            if let Some(manager) = self.manager.upgrade() {
                manager.metrics.beans_removed.inc();
            }
        }
        Ok(removed)
    }

    async fn remove_with(&mut self, listener: Option<&dyn RemoveListener<T>>) -> Result<bool> {
        let manager = self.manager.upgrade().ok_or(Error::NotStarted)?;
        let Some(batch) = self.batch.as_mut() else {
            return Ok(false);
        };
        if self
            .valid
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }

        manager.factory.remove(batch, self.id).await?;
        let instance = self.group.remove(&self.id);
        if let (Some(listener), Some(instance)) = (listener, instance.as_ref()) {
            listener.removed(&self.id, instance);
        }

        debug!(bean_id = %self.id, group_id = %self.group.id(), "Removed bean");
        Ok(true)
    }

    /// Remove the bean as expired, notifying the manager's expiration listener.
    pub(crate) async fn expire(&mut self) -> Result<bool> {
        let manager = self.manager.upgrade().ok_or(Error::NotStarted)?;
        let listener = manager.expiration_listener.clone();
        let removed = self.remove_with(listener.as_deref()).await?;
        if removed {
            manager.metrics.beans_expired.inc();
        }
        Ok(removed)
    }

    /// Release the bean.
    ///
    /// Records the access, writes all pending changes and hands the bean to
    /// the expiration scheduler. With a zero timeout the bean is removed
    /// instead.
    pub async fn close(mut self) -> Result<()> {
        let manager = self.manager.upgrade().ok_or(Error::NotStarted)?;

        if self.is_valid() {
            if manager.config.timeout.is_some_and(|t| t.is_zero()) {
                self.expire().await?;
            } else {
                self.metadata.set_last_accessed(manager.clock.now_ms());
            }
        }

        let Some(mut batch) = self.batch.take() else {
            return Ok(());
        };
        if let Some(access) = self.metadata.take_access_update() {
            if self.is_valid() {
                batch
                    .put(BeanKey::Access(self.id), BeanEntry::Access(access))
                    .await?;
            }
        }
        self.group.flush(&mut batch).await?;
        batch.commit()?;

        if !self.is_valid() {
            return Ok(());
        }
        if let (Some(expiration), Some(scheduler)) = (self.metadata.expiration(), manager.scheduler()) {
            if let Err(e) = scheduler.schedule(self.id, expiration).await {
                warn!(bean_id = %self.id, error = %e, "Failed to schedule expiration");
            }
        }
        Ok(())
    }
}

impl<T: BeanInstance> fmt::Debug for Bean<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bean")
            .field("id", &self.id)
            .field("group_id", &self.group.id())
            .field("valid", &self.is_valid())
            .field("open", &self.batch.is_some())
            .finish()
    }
}

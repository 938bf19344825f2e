//! Removal of beans whose timeout has elapsed.

use crate::bean::{Bean, BeanInstance, BeanKey, ExpirationMetaData};
use crate::error::{Error, Result};
use crate::expiration::{ExpirationOutcome, ExpirationTask};
use crate::manager::ManagerInner;
use crate::types::BeanId;
use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

/// Expires one bean on behalf of a manager.
///
/// The task never waits for a lock: a bean in use is retried later, and a
/// bean that was touched since it was scheduled is retried at its new
/// deadline.
pub struct BeanExpirationTask<T: BeanInstance> {
    manager: Weak<ManagerInner<T>>,
}

impl<T: BeanInstance> BeanExpirationTask<T> {
    pub(crate) fn new(manager: Weak<ManagerInner<T>>) -> Self {
        Self { manager }
    }

    async fn run(&self, manager: &Arc<ManagerInner<T>>, id: BeanId) -> Result<ExpirationOutcome> {
        let node_id = manager.config.node_id;
        let creation_key = BeanKey::Creation(id);
        if manager.topology.is_clustered()
            && !manager.topology.is_primary_owner(&creation_key, node_id)
        {
            trace!(bean_id = %id, node_id, "Not the primary owner, skipping expiration");
            return Ok(ExpirationOutcome::Skipped);
        }

        let now = manager.clock.now_ms();
        let retry_at = now + manager.config.scheduler.retry_interval.as_millis() as u64;

        let mut batch = manager.cache.batch();
        let Some(value) = manager.factory.try_value(&mut batch, id).await? else {
            if manager.cache.contains_key(&creation_key) {
                trace!(bean_id = %id, "Bean in use, retrying expiration");
                return Ok(ExpirationOutcome::Retry { at_ms: retry_at });
            }
            return Ok(ExpirationOutcome::Skipped);
        };

        let mut metadata = manager.factory.create_bean_metadata(id, value);
        if !metadata.is_expired(now) {
            return Ok(match metadata.expiration() {
                Some(expiration) => ExpirationOutcome::Retry {
                    at_ms: expiration.deadline_ms(),
                },
                None => ExpirationOutcome::Skipped,
            });
        }

        let group_id = metadata.group_id();
        let Some(group) = manager.groups.try_group(&mut batch, group_id).await? else {
            if !batch.holds_lock(&BeanKey::Group(group_id)) {
                trace!(bean_id = %id, %group_id, "Group in use, retrying expiration");
                return Ok(ExpirationOutcome::Retry { at_ms: retry_at });
            }
            warn!(bean_id = %id, %group_id, "Expired bean has no group, removing metadata");
            manager.factory.remove(&mut batch, id).await?;
            batch.commit()?;
            return Ok(ExpirationOutcome::Removed);
        };

        // Expiration is not an access.
        metadata.take_access_update();
        let mut bean = Bean::new(metadata, group, batch, Arc::downgrade(manager));
        bean.expire().await?;
        bean.close().await?;
        debug!(bean_id = %id, %group_id, "Expired bean");
        Ok(ExpirationOutcome::Removed)
    }
}

#[async_trait]
impl<T: BeanInstance> ExpirationTask for BeanExpirationTask<T> {
    async fn expire(&self, id: BeanId, _expiration: ExpirationMetaData) -> ExpirationOutcome {
        let Some(manager) = self.manager.upgrade() else {
            return ExpirationOutcome::Skipped;
        };

        let outcome = match self.run(&manager, id).await {
            Ok(outcome) => outcome,
            Err(Error::Timeout) => ExpirationOutcome::Retry {
                at_ms: manager.clock.now_ms()
                    + manager.config.scheduler.retry_interval.as_millis() as u64,
            },
            Err(e) => {
                warn!(bean_id = %id, error = %e, "Failed to expire bean");
                ExpirationOutcome::Failed
            }
        };
        manager
            .metrics
            .expiration_outcomes
            .inc([outcome.label()]);
        outcome
    }
}

//! Passivation of bean groups.
//!
//! A group is written to the passivated tier as a unit. Every instance gets
//! its pre-passivate callback first; if one of them fails, the instances
//! already prepared are re-activated and the group stays in memory. The
//! metadata records of each member follow the group out of memory.
//!
//! Managers of one cluster share the store, so each of them registers a
//! listener. Group callbacks run only on the primary owner of the group key.
//! A group with a member in use is not passivated.

use crate::bean::{BeanCache, BeanEntry, BeanInstance, BeanKey};
use crate::cache::{Cache, CacheListener};
use crate::cluster::Topology;
use crate::error::{Error, Result};
use crate::metrics::BeanMetrics;
use crate::partitioning::OwnershipRole;
use crate::types::{BeanId, NodeId};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

/// Store listener that drives bean callbacks on passivation and activation.
pub struct BeanGroupPassivation<T> {
    node_id: NodeId,
    topology: Arc<Topology>,
    metrics: Arc<BeanMetrics>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: BeanInstance> BeanGroupPassivation<T> {
    pub fn new(node_id: NodeId, topology: Arc<Topology>, metrics: Arc<BeanMetrics>) -> Self {
        Self {
            node_id,
            topology,
            metrics,
            _marker: PhantomData,
        }
    }

    /// Whether this node runs the callbacks of the group stored under `key`.
    fn handles(&self, key: &BeanKey) -> bool {
        !self.topology.is_clustered()
            || self.topology.role(key, self.node_id) == OwnershipRole::Primary
    }

    fn evict_metadata(cache: &BeanCache<T>, key: BeanKey) {
        if let Err(e) = cache.evict(&key) {
            warn!(?key, error = %e, "Failed to passivate bean metadata");
        }
    }
}

impl<T: BeanInstance> CacheListener<BeanKey, BeanEntry<T>> for BeanGroupPassivation<T> {
    fn is_in_use(&self, cache: &Cache<BeanKey, BeanEntry<T>>, key: &BeanKey, value: &BeanEntry<T>) -> bool {
        let (BeanKey::Group(_), BeanEntry::Group(entry)) = (key, value) else {
            return false;
        };
        entry
            .iter()
            .any(|(id, _)| cache.is_locked(&BeanKey::Creation(*id)))
    }

    fn pre_passivate(
        &self,
        cache: &Cache<BeanKey, BeanEntry<T>>,
        key: &BeanKey,
        value: &mut BeanEntry<T>,
    ) -> Result<()> {
        let entry = match (key, value) {
            (BeanKey::Group(_), BeanEntry::Group(entry)) if self.handles(key) => entry,
            (BeanKey::Creation(id), _) => {
                Self::evict_metadata(cache, BeanKey::Access(*id));
                return Ok(());
            }
            _ => return Ok(()),
        };

        let mut prepared: Vec<BeanId> = Vec::with_capacity(entry.len());
        let mut index = 0;
        while let Some((id, instance)) = entry.at_mut(index) {
            if let Err(e) = instance.pre_passivate() {
                // Undo the callbacks that already ran, in reverse.
                for undo in (0..index).rev() {
                    if let Some((prepared_id, instance)) = entry.at_mut(undo) {
                        if let Err(e) = instance.post_activate() {
                            warn!(bean_id = %prepared_id, error = %e, "Failed to reactivate bean after aborted passivation");
                        }
                    }
                }
                self.metrics.passivation_failures.inc();
                warn!(?key, bean_id = %id, error = %e, "Bean refused passivation, group stays in memory");
                return Err(Error::Passivation {
                    id,
                    reason: e.to_string(),
                });
            }
            prepared.push(id);
            index += 1;
        }

        for id in prepared {
            self.metrics.passivations.inc();
            Self::evict_metadata(cache, BeanKey::Creation(id));
        }
        debug!(?key, members = entry.len(), "Passivating bean group");
        Ok(())
    }

    fn post_activate(&self, key: &BeanKey, value: &mut BeanEntry<T>) {
        let BeanEntry::Group(entry) = value else {
            return;
        };
        if !self.handles(key) {
            return;
        }

        let mut index = 0;
        while let Some((id, instance)) = entry.at_mut(index) {
            index += 1;
            match instance.post_activate() {
                Ok(()) => self.metrics.activations.inc(),
                Err(e) => {
                    self.metrics.activation_failures.inc();
                    warn!(?key, bean_id = %id, error = %e, "Bean activation callback failed");
                }
            }
        }
    }
}

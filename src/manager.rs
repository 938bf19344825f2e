//! Bean manager: the entry point for creating and finding beans.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      BeanManager                         │
//! │  create_bean / find_bean / remove_bean / counts          │
//! └──────────────────────────────────────────────────────────┘
//!        │                   │                     │
//!        ▼                   ▼                     ▼
//! ┌──────────────┐   ┌────────────────┐   ┌─────────────────────┐
//! │ BeanFactory  │   │ BeanGroupMgr   │   │ Scheduler           │
//! │ creation +   │   │ group entries  │   │ Local or            │
//! │ access recs  │   │                │   │ PrimaryOwner        │
//! └──────────────┘   └────────────────┘   └─────────────────────┘
//!        │                   │                     │
//!        └─────────┬─────────┘                     ▼
//!                  ▼                     ┌─────────────────────┐
//!         ┌─────────────────┐            │ BeanExpirationTask  │
//!         │   BeanCache     │◄───────────┤ (tryValue, no wait) │
//!         │ + passivation   │            └─────────────────────┘
//!         └─────────────────┘
//! ```

use crate::affinity::Affinity;
use crate::bean::{
    Bean, BeanCache, BeanEntry, BeanFactory, BeanGroupManager, BeanInstance, BeanKey,
    IdentifierFactory, RemoveListener, UuidIdentifierFactory,
};
use crate::cache::Tier;
use crate::cluster::{CommandDispatcher, LocalCommandDispatcher, Topology};
use crate::config::{BeanManagerConfig, CacheConfig};
use crate::error::{Error, Result};
use crate::expiration::{
    BeanExpirationTask, LocalScheduler, PrimaryOwnerScheduler, QueueOrdering, ScheduleRescan,
    Scheduler, SchedulerCommandHandler,
};
use crate::metrics::{BeanMetrics, BeanMetricsSnapshot};
use crate::passivation::BeanGroupPassivation;
use crate::subscription::Subscription;
use crate::types::{BeanId, Clock, GroupId, SystemClock};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

struct Running {
    scheduler: Option<Arc<dyn Scheduler>>,
    local: Option<Arc<LocalScheduler>>,
    subscriptions: Vec<Subscription>,
}

/// State shared by a manager and the beans it hands out.
pub(crate) struct ManagerInner<T: BeanInstance> {
    pub(crate) config: BeanManagerConfig,
    pub(crate) cache: Arc<BeanCache<T>>,
    pub(crate) topology: Arc<Topology>,
    pub(crate) dispatcher: Arc<dyn CommandDispatcher>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) factory: BeanFactory<T>,
    pub(crate) groups: BeanGroupManager<T>,
    pub(crate) expiration_listener: Option<Arc<dyn RemoveListener<T>>>,
    pub(crate) metrics: Arc<BeanMetrics>,
    identifier_factory: Arc<dyn IdentifierFactory>,
    state: Mutex<Option<Running>>,
}

impl<T: BeanInstance> ManagerInner<T> {
    /// The active scheduler, `None` when stopped or when beans do not expire.
    pub(crate) fn scheduler(&self) -> Option<Arc<dyn Scheduler>> {
        self.state
            .lock()
            .as_ref()
            .and_then(|running| running.scheduler.clone())
    }

    fn is_started(&self) -> bool {
        self.state.lock().is_some()
    }

    fn owns(&self, key: &BeanKey) -> bool {
        !self.topology.is_clustered() || self.topology.is_primary_owner(key, self.config.node_id)
    }
}

impl<T: BeanInstance> Drop for ManagerInner<T> {
    fn drop(&mut self) {
        if let Some(local) = self.state.get_mut().take().and_then(|running| running.local) {
            local.shutdown_now();
        }
    }
}

/// Builder for [`BeanManager`].
pub struct BeanManagerBuilder<T: BeanInstance> {
    config: BeanManagerConfig,
    cache: Option<Arc<BeanCache<T>>>,
    topology: Option<Arc<Topology>>,
    dispatcher: Option<Arc<dyn CommandDispatcher>>,
    clock: Option<Arc<dyn Clock>>,
    expiration_listener: Option<Arc<dyn RemoveListener<T>>>,
    identifier_factory: Option<Arc<dyn IdentifierFactory>>,
}

impl<T: BeanInstance> BeanManagerBuilder<T> {
    pub fn new(config: BeanManagerConfig) -> Self {
        Self {
            config,
            cache: None,
            topology: None,
            dispatcher: None,
            clock: None,
            expiration_listener: None,
            identifier_factory: None,
        }
    }

    /// Use a shared store. Defaults to a private store without eviction.
    pub fn with_cache(mut self, cache: Arc<BeanCache<T>>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Use a shared cluster view. Defaults to a single-node topology.
    pub fn with_topology(mut self, topology: Arc<Topology>) -> Self {
        self.topology = Some(topology);
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn CommandDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Listener told about every bean removed because it expired.
    pub fn with_expiration_listener(mut self, listener: Arc<dyn RemoveListener<T>>) -> Self {
        self.expiration_listener = Some(listener);
        self
    }

    pub fn with_identifier_factory(mut self, factory: Arc<dyn IdentifierFactory>) -> Self {
        self.identifier_factory = Some(factory);
        self
    }

    pub fn build(self) -> Result<BeanManager<T>> {
        self.config.validate()?;

        let config = self.config;
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let dispatcher: Arc<dyn CommandDispatcher> = match self.dispatcher {
            Some(dispatcher) => dispatcher,
            None => Arc::new(LocalCommandDispatcher::new()),
        };
        let identifier_factory: Arc<dyn IdentifierFactory> = match self.identifier_factory {
            Some(factory) => factory,
            None => Arc::new(UuidIdentifierFactory),
        };
        let topology = self
            .topology
            .unwrap_or_else(|| Topology::local(config.node_id));
        let cache = self
            .cache
            .unwrap_or_else(|| BeanCache::with_config(CacheConfig::default()));
        let factory = BeanFactory::new(config.bean_name.clone(), config.timeout, clock.clone());

        let inner = ManagerInner {
            cache,
            topology,
            dispatcher,
            clock,
            factory,
            groups: BeanGroupManager::new(),
            expiration_listener: self.expiration_listener,
            metrics: Arc::new(BeanMetrics::new()),
            identifier_factory,
            state: Mutex::new(None),
            config,
        };
        Ok(BeanManager {
            inner: Arc::new(inner),
        })
    }
}

/// Manages the beans of one type on one node.
pub struct BeanManager<T: BeanInstance> {
    inner: Arc<ManagerInner<T>>,
}

impl<T: BeanInstance> Clone for BeanManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: BeanInstance> BeanManager<T> {
    pub fn builder(config: BeanManagerConfig) -> BeanManagerBuilder<T> {
        BeanManagerBuilder::new(config)
    }

    pub fn config(&self) -> &BeanManagerConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &Arc<BeanCache<T>> {
        &self.inner.cache
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.inner.topology
    }

    pub fn is_started(&self) -> bool {
        self.inner.is_started()
    }

    /// Start the manager.
    ///
    /// Registers the passivation listener (unless the store is persistent)
    /// and, when beans expire, the expiration scheduler. In a clustered
    /// topology the scheduler also accepts forwarded commands and rescans
    /// the store for owned beans, once now and on every topology change.
    /// Must be called within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        inner.config.validate()?;

        let mut state = inner.state.lock();
        if state.is_some() {
            return Ok(());
        }

        let mut subscriptions = Vec::new();
        if !inner.cache.config().persistent {
            let passivation = Arc::new(BeanGroupPassivation::<T>::new(
                inner.config.node_id,
                inner.topology.clone(),
                inner.metrics.clone(),
            ));
            subscriptions.push(inner.cache.subscribe(passivation));
        }

        let (scheduler, local) = match inner.config.timeout {
            Some(timeout) if !timeout.is_zero() => {
                let (scheduler, local) = self.start_scheduler(timeout, &mut subscriptions);
                (Some(scheduler), Some(local))
            }
            _ => (None, None),
        };

        *state = Some(Running {
            scheduler,
            local,
            subscriptions,
        });
        info!(
            bean_name = %inner.config.bean_name,
            node_id = inner.config.node_id,
            clustered = inner.topology.is_clustered(),
            timeout = ?inner.config.timeout,
            "Bean manager started"
        );
        Ok(())
    }

    fn start_scheduler(
        &self,
        timeout: Duration,
        subscriptions: &mut Vec<Subscription>,
    ) -> (Arc<dyn Scheduler>, Arc<LocalScheduler>) {
        let inner = &self.inner;
        let task = Arc::new(BeanExpirationTask::new(Arc::downgrade(inner)));

        if !inner.topology.is_clustered() {
            let local = LocalScheduler::new(
                QueueOrdering::Insertion,
                task,
                inner.clock.clone(),
                inner.config.scheduler.clone(),
            );
            local.start();
            let scheduler: Arc<dyn Scheduler> = local.clone();
            return (scheduler, local);
        }

        let node_id = inner.config.node_id;
        let bean_name = inner.config.bean_name.as_str();
        let local = LocalScheduler::new(
            QueueOrdering::Deadline,
            task,
            inner.clock.clone(),
            inner.config.scheduler.clone(),
        );
        local.start();

        subscriptions.push(inner.dispatcher.register(
            node_id,
            bean_name,
            Arc::new(SchedulerCommandHandler::new(local.clone())),
        ));

        let rescan = Arc::new(ScheduleRescan::new(
            node_id,
            bean_name,
            timeout,
            inner.cache.clone(),
            &inner.topology,
            local.clone(),
        ));
        subscriptions.push(inner.topology.subscribe(rescan.clone()));
        rescan.rescan(&inner.topology);

        let scheduler: Arc<dyn Scheduler> = Arc::new(PrimaryOwnerScheduler::new(
            node_id,
            bean_name,
            inner.topology.clone(),
            inner.dispatcher.clone(),
            local.clone(),
        ));
        (scheduler, local)
    }

    /// Stop the manager.
    ///
    /// Unregisters all listeners and stops the scheduler, waiting up to the
    /// configured stop timeout for a running expiration to finish.
    pub async fn stop(&self) {
        let Some(running) = self.inner.state.lock().take() else {
            return;
        };
        drop(running.subscriptions);
        drop(running.scheduler);

        let drained = match running.local {
            Some(local) => local.stop(self.inner.config.stop_timeout).await,
            None => true,
        };
        info!(
            bean_name = %self.inner.config.bean_name,
            node_id = self.inner.config.node_id,
            drained,
            "Bean manager stopped"
        );
    }

    fn ensure_started(&self) -> Result<()> {
        if self.inner.is_started() {
            Ok(())
        } else {
            Err(Error::NotStarted)
        }
    }

    /// Create a bean for `instance` in the given group.
    ///
    /// The returned bean holds its records locked until it is closed; it is
    /// not scheduled for expiration before then.
    pub async fn create_bean(&self, instance: T, group_id: GroupId) -> Result<Bean<T>> {
        self.ensure_started()?;
        let inner = &self.inner;
        let id = instance.id();

        let mut batch = inner.cache.batch();
        let value = inner.factory.create_value(&mut batch, id, group_id).await?;
        let mut group = inner.groups.create_group(&mut batch, group_id).await?;
        group.add(id, instance);

        inner.metrics.beans_created.inc();
        debug!(bean_id = %id, %group_id, "Created bean");

        let metadata = inner.factory.create_bean_metadata(id, value);
        Ok(Bean::new(metadata, group, batch, Arc::downgrade(inner)))
    }

    /// Find a bean for use.
    ///
    /// Returns `None` if the bean does not exist, lost its instance, or has
    /// expired; an expired bean is removed before returning. Any pending
    /// expiration is cancelled. Fails with [`Error::Timeout`] if the bean's
    /// records stay locked longer than the store's lock timeout.
    pub async fn find_bean(&self, id: BeanId) -> Result<Option<Bean<T>>> {
        self.ensure_started()?;
        let inner = &self.inner;

        let mut batch = inner.cache.batch();
        let Some(value) = inner.factory.find_value(&mut batch, id).await? else {
            return Ok(None);
        };

        if let Some(scheduler) = inner.scheduler() {
            if let Err(e) = scheduler.cancel(id).await {
                warn!(bean_id = %id, error = %e, "Failed to cancel expiration");
            }
        }

        let metadata = inner.factory.create_bean_metadata(id, value);
        let group_id = metadata.group_id();
        let group = match inner.groups.find_group(&mut batch, group_id).await? {
            Some(group) if group.instance(&id).is_some() => group,
            other => {
                warn!(bean_id = %id, %group_id, "Bean has no instance, purging its metadata");
                inner.factory.remove(&mut batch, id).await?;
                if other.is_some() {
                    inner.groups.remove_empty_group(&mut batch, group_id).await?;
                }
                batch.commit()?;
                return Ok(None);
            }
        };

        let mut bean = Bean::new(metadata, group, batch, Arc::downgrade(inner));
        if bean.is_expired() {
            debug!(bean_id = %id, "Found bean has expired");
            bean.expire().await?;
            bean.close().await?;
            return Ok(None);
        }
        Ok(Some(bean))
    }

    /// Remove a bean by identifier. Returns whether it existed.
    pub async fn remove_bean(&self, id: BeanId) -> Result<bool> {
        let Some(mut bean) = self.find_bean(id).await? else {
            return Ok(false);
        };
        let removed = bean.remove(None).await?;
        bean.close().await?;
        Ok(removed)
    }

    pub fn identifier_factory(&self) -> Arc<dyn IdentifierFactory> {
        self.inner.identifier_factory.clone()
    }

    /// Number of beans in memory whose group this node owns.
    pub fn active_count(&self) -> usize {
        self.count(Tier::Memory)
    }

    /// Number of passivated beans whose group this node owns.
    pub fn passive_count(&self) -> usize {
        self.count(Tier::Passivated)
    }

    fn count(&self, tier: Tier) -> usize {
        let inner = &self.inner;
        let keys = match tier {
            Tier::Memory => inner.cache.memory_keys(),
            Tier::Passivated => inner.cache.passivated_keys(),
        };

        keys.into_iter()
            .filter(|key| matches!(key, BeanKey::Group(_)) && inner.owns(key))
            .map(|key| match inner.cache.peek(&key) {
                Ok(Some(BeanEntry::Group(entry))) => entry.len(),
                Ok(_) => 0,
                Err(e) => {
                    warn!(?key, error = %e, "Failed to read group while counting");
                    0
                }
            })
            .sum()
    }

    /// Affinity for requests that do not target an existing bean.
    pub fn strong_affinity(&self) -> Affinity {
        if self.inner.topology.is_clustered() {
            Affinity::Cluster(self.inner.config.cluster_name.clone())
        } else {
            Affinity::None
        }
    }

    /// Preferred node for requests targeting `id`: the owner of its records.
    pub fn weak_affinity(&self, id: BeanId) -> Affinity {
        if !self.inner.topology.is_clustered() {
            return Affinity::None;
        }
        self.inner
            .topology
            .primary_owner(&BeanKey::Creation(id))
            .map_or(Affinity::None, Affinity::Node)
    }

    pub fn metrics(&self) -> BeanMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// The timer holder of this node, `None` when beans do not expire.
    pub fn local_scheduler(&self) -> Option<Arc<LocalScheduler>> {
        self.inner
            .state
            .lock()
            .as_ref()
            .and_then(|running| running.local.clone())
    }
}

impl<T: BeanInstance> fmt::Debug for BeanManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeanManager")
            .field("bean_name", &self.inner.config.bean_name)
            .field("node_id", &self.inner.config.node_id)
            .field("started", &self.inner.is_started())
            .finish()
    }
}

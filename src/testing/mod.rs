//! Testing utilities for bean managers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TestCluster                          │
//! │                                                             │
//! │   BeanManager(1)   BeanManager(2)   ...   BeanManager(n)    │
//! │         │                │                      │           │
//! │         └────────────────┼──────────────────────┘           │
//! │                          ▼                                  │
//! │     shared BeanCache · Topology · LocalCommandDispatcher    │
//! │                          │                                  │
//! │                 ExpirationLog (node, bean)                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every manager sees the same store, as members of a distributed cache
//! would. Nodes join and leave through the shared [`Topology`], which is
//! what moves expiration timers between them.

mod utils;

#[cfg(test)]
mod cluster_tests;

pub use utils::{wait_for, wait_for_result};

use crate::bean::{BeanCache, BeanInstance};
use crate::cluster::{LocalCommandDispatcher, Topology};
use crate::config::{BeanManagerConfig, CacheConfig};
use crate::error::{LifecycleError, Result};
use crate::manager::BeanManager;
use crate::types::{BeanId, Clock, NodeId, SystemClock};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Lifecycle callback observed on a [`RecordingBean`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// `pre_passivate` was called, whether or not it succeeded.
    Passivate,
    Activate,
}

fn journal() -> &'static Mutex<HashMap<BeanId, Vec<LifecycleEvent>>> {
    static JOURNAL: OnceLock<Mutex<HashMap<BeanId, Vec<LifecycleEvent>>>> = OnceLock::new();
    JOURNAL.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Bean instance that records its lifecycle callbacks.
///
/// Callbacks run on copies that are serialized with the group, so events
/// are kept in a process-wide journal keyed by bean identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingBean {
    pub id: BeanId,
    pub value: u64,
    pub fail_passivate: bool,
    pub fail_activate: bool,
}

impl RecordingBean {
    pub fn new() -> Self {
        Self {
            id: BeanId::new(),
            value: 0,
            fail_passivate: false,
            fail_activate: false,
        }
    }

    /// A bean whose `pre_passivate` fails.
    pub fn refusing_passivation() -> Self {
        Self {
            fail_passivate: true,
            ..Self::new()
        }
    }

    /// A bean whose `post_activate` fails.
    pub fn failing_activation() -> Self {
        Self {
            fail_activate: true,
            ..Self::new()
        }
    }

    /// Callbacks recorded for `id` so far.
    pub fn events(id: &BeanId) -> Vec<LifecycleEvent> {
        journal().lock().get(id).cloned().unwrap_or_default()
    }

    fn record(&self, event: LifecycleEvent) {
        journal().lock().entry(self.id).or_default().push(event);
    }
}

impl Default for RecordingBean {
    fn default() -> Self {
        Self::new()
    }
}

impl BeanInstance for RecordingBean {
    fn id(&self) -> BeanId {
        self.id
    }

    fn post_activate(&mut self) -> std::result::Result<(), LifecycleError> {
        self.record(LifecycleEvent::Activate);
        if self.fail_activate {
            return Err(LifecycleError::new("activation refused"));
        }
        Ok(())
    }

    fn pre_passivate(&mut self) -> std::result::Result<(), LifecycleError> {
        self.record(LifecycleEvent::Passivate);
        if self.fail_passivate {
            return Err(LifecycleError::new("passivation refused"));
        }
        Ok(())
    }
}

/// Expirations observed across a cluster, by node.
#[derive(Debug, Default)]
pub struct ExpirationLog {
    entries: Mutex<Vec<(NodeId, BeanId)>>,
}

impl ExpirationLog {
    pub fn record(&self, node_id: NodeId, id: BeanId) {
        self.entries.lock().push((node_id, id));
    }

    pub fn entries(&self) -> Vec<(NodeId, BeanId)> {
        self.entries.lock().clone()
    }

    /// Number of times each bean was expired.
    pub fn counts(&self) -> BTreeMap<BeanId, usize> {
        let mut counts = BTreeMap::new();
        for (_, id) in self.entries.lock().iter() {
            *counts.entry(*id).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// In-process cluster of bean managers sharing one store.
pub struct TestCluster<T: BeanInstance> {
    pub cache: Arc<BeanCache<T>>,
    pub topology: Arc<Topology>,
    pub dispatcher: Arc<LocalCommandDispatcher>,
    pub expirations: Arc<ExpirationLog>,
    clock: Arc<dyn Clock>,
    config: BeanManagerConfig,
    managers: BTreeMap<NodeId, BeanManager<T>>,
}

impl<T: BeanInstance> TestCluster<T> {
    /// A cluster for beans named `bean_name`, keeping `num_owners` copies.
    pub fn new(bean_name: &str, timeout: Option<Duration>, num_owners: usize) -> Self {
        let mut config = BeanManagerConfig::new(bean_name, 0);
        config.timeout = timeout;
        Self {
            cache: BeanCache::with_config(CacheConfig::default()),
            topology: Topology::distributed(num_owners),
            dispatcher: Arc::new(LocalCommandDispatcher::new()),
            expirations: Arc::new(ExpirationLog::default()),
            clock: Arc::new(SystemClock),
            config,
            managers: BTreeMap::new(),
        }
    }

    /// Use a different store configuration. Only valid before nodes are added.
    pub fn with_cache_config(mut self, config: CacheConfig) -> Self {
        self.cache = BeanCache::with_config(config);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Start a manager for `node_id` and let it join the topology.
    pub fn add_node(&mut self, node_id: NodeId) -> Result<BeanManager<T>> {
        let mut config = self.config.clone();
        config.node_id = node_id;

        let log = self.expirations.clone();
        let listener = Arc::new(move |id: &BeanId, _instance: &T| log.record(node_id, *id));
        let manager = BeanManager::builder(config)
            .with_cache(self.cache.clone())
            .with_topology(self.topology.clone())
            .with_dispatcher(self.dispatcher.clone())
            .with_clock(self.clock.clone())
            .with_expiration_listener(listener)
            .build()?;
        manager.start()?;
        self.topology.join(node_id);

        self.managers.insert(node_id, manager.clone());
        Ok(manager)
    }

    /// Leave the topology and stop the node's manager.
    pub async fn remove_node(&mut self, node_id: NodeId) -> bool {
        let Some(manager) = self.managers.remove(&node_id) else {
            return false;
        };
        self.topology.leave(node_id);
        manager.stop().await;
        true
    }

    pub fn manager(&self, node_id: NodeId) -> Option<&BeanManager<T>> {
        self.managers.get(&node_id)
    }

    /// Any running manager.
    pub fn any_manager(&self) -> Option<&BeanManager<T>> {
        self.managers.values().next()
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        self.managers.keys().copied().collect()
    }

    /// Expiration timers held by each node.
    pub fn scheduled(&self) -> BTreeMap<NodeId, Vec<BeanId>> {
        self.managers
            .iter()
            .map(|(node_id, manager)| {
                let ids = manager
                    .local_scheduler()
                    .map(|local| local.scheduled_ids())
                    .unwrap_or_default();
                (*node_id, ids)
            })
            .collect()
    }

    /// Stop every node.
    pub async fn shutdown(mut self) {
        for node_id in self.nodes() {
            self.remove_node(node_id).await;
        }
    }
}

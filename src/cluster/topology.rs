//! Cluster view shared by the nodes of one cluster.

use crate::cache::CacheKey;
use crate::cluster::events::{TopologyChangeEvent, TopologyListener};
use crate::partitioning::{HashRing, OwnershipRole};
use crate::subscription::{ListenerRegistry, Subscription};
use crate::types::NodeId;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// How the backing store distributes entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Single node; every key is owned locally.
    Local,
    /// Entries are partitioned across members.
    Distributed,
}

/// Membership and key ownership of a cluster.
pub struct Topology {
    mode: CacheMode,
    ring: RwLock<HashRing>,
    version: AtomicU64,
    listeners: Arc<ListenerRegistry<dyn TopologyListener>>,
}

impl Topology {
    /// A non-clustered topology consisting of `node_id` only.
    pub fn local(node_id: NodeId) -> Arc<Self> {
        let mut ring = HashRing::new(1);
        ring.add_node(node_id);
        Arc::new(Self::with_ring(CacheMode::Local, ring))
    }

    /// An empty distributed topology keeping `num_owners` copies of each key.
    pub fn distributed(num_owners: usize) -> Arc<Self> {
        Arc::new(Self::with_ring(
            CacheMode::Distributed,
            HashRing::new(num_owners),
        ))
    }

    fn with_ring(mode: CacheMode, ring: HashRing) -> Self {
        Self {
            mode,
            ring: RwLock::new(ring),
            version: AtomicU64::new(0),
            listeners: ListenerRegistry::new(),
        }
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    /// Whether ownership is coordinated across members.
    pub fn is_clustered(&self) -> bool {
        self.mode == CacheMode::Distributed
    }

    /// Version, bumped on every membership change.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Current members, sorted.
    pub fn members(&self) -> Vec<NodeId> {
        self.ring.read().nodes().to_vec()
    }

    pub fn is_member(&self, node_id: NodeId) -> bool {
        self.ring.read().contains_node(node_id)
    }

    /// Add a member and notify listeners. Returns `false` if already present.
    pub fn join(&self, node_id: NodeId) -> bool {
        self.change(node_id, |ring| ring.add_node(node_id))
    }

    /// Remove a member and notify listeners. Returns `false` if absent.
    pub fn leave(&self, node_id: NodeId) -> bool {
        self.change(node_id, |ring| ring.remove_node(node_id))
    }

    fn change(&self, node_id: NodeId, apply: impl FnOnce(&mut HashRing) -> bool) -> bool {
        let event = {
            let mut ring = self.ring.write();
            let previous = ring.nodes().to_vec();
            if !apply(&mut ring) {
                return false;
            }
            TopologyChangeEvent {
                version: self.version.fetch_add(1, Ordering::SeqCst) + 1,
                previous,
                current: ring.nodes().to_vec(),
            }
        };

        info!(
            node_id,
            version = event.version,
            members = ?event.current,
            "Topology changed"
        );
        for listener in self.listeners.snapshot() {
            listener.topology_changed(&event);
        }
        true
    }

    /// Primary owner of a key, `None` when the cluster has no members.
    pub fn primary_owner<K: CacheKey>(&self, key: &K) -> Option<NodeId> {
        self.ring.read().primary(&key.partition_bytes())
    }

    /// All owners of a key; the first one is the primary.
    pub fn owners<K: CacheKey>(&self, key: &K) -> Vec<NodeId> {
        self.ring.read().owners(&key.partition_bytes())
    }

    /// Role of `node_id` for the key.
    pub fn role<K: CacheKey>(&self, key: &K, node_id: NodeId) -> OwnershipRole {
        self.ring
            .read()
            .ownership(&key.partition_bytes())
            .map_or(OwnershipRole::None, |ownership| ownership.role(node_id))
    }

    /// Whether `node_id` is the primary owner of the key.
    pub fn is_primary_owner<K: CacheKey>(&self, key: &K, node_id: NodeId) -> bool {
        self.role(key, node_id) == OwnershipRole::Primary
    }

    /// Register a topology listener.
    pub fn subscribe(&self, listener: Arc<dyn TopologyListener>) -> Subscription {
        self.listeners.add(listener)
    }
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topology")
            .field("mode", &self.mode)
            .field("version", &self.version())
            .field("members", &self.members())
            .finish()
    }
}

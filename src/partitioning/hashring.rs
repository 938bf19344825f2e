//! Consistent hash ring with virtual nodes.

use crate::partitioning::ownership::KeyOwnership;
use crate::types::NodeId;
use std::collections::BTreeMap;
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Number of virtual nodes per member.
pub const DEFAULT_VNODES_PER_NODE: usize = 128;

/// A consistent hash ring for distributing keys across members.
#[derive(Debug, Clone)]
pub struct HashRing {
    /// Ring position to owning member.
    vnodes: BTreeMap<u64, NodeId>,

    vnodes_per_node: usize,

    /// Number of owners of each key.
    num_owners: usize,

    /// Members, sorted.
    nodes: Vec<NodeId>,
}

impl HashRing {
    /// Create an empty ring.
    pub fn new(num_owners: usize) -> Self {
        Self::with_vnodes(num_owners, DEFAULT_VNODES_PER_NODE)
    }

    /// Create an empty ring with a custom vnode count.
    pub fn with_vnodes(num_owners: usize, vnodes_per_node: usize) -> Self {
        Self {
            vnodes: BTreeMap::new(),
            vnodes_per_node: vnodes_per_node.max(1),
            num_owners: num_owners.max(1),
            nodes: Vec::new(),
        }
    }

    pub fn num_owners(&self) -> usize {
        self.num_owners
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn contains_node(&self, node_id: NodeId) -> bool {
        self.nodes.contains(&node_id)
    }

    /// Add a member. Returns `false` if it was already present.
    pub fn add_node(&mut self, node_id: NodeId) -> bool {
        if self.nodes.contains(&node_id) {
            return false;
        }

        self.nodes.push(node_id);
        self.nodes.sort_unstable();
        for i in 0..self.vnodes_per_node {
            self.vnodes.insert(Self::vnode_position(node_id, i), node_id);
        }
        true
    }

    /// Remove a member. Returns `false` if it was not present.
    pub fn remove_node(&mut self, node_id: NodeId) -> bool {
        if !self.nodes.contains(&node_id) {
            return false;
        }

        self.nodes.retain(|&n| n != node_id);
        for i in 0..self.vnodes_per_node {
            let position = Self::vnode_position(node_id, i);
            if self.vnodes.get(&position) == Some(&node_id) {
                self.vnodes.remove(&position);
            }
        }
        true
    }

    /// Primary owner of the key, `None` if the ring is empty.
    pub fn primary(&self, key: &[u8]) -> Option<NodeId> {
        self.owners_n(key, 1).into_iter().next()
    }

    /// Up to `num_owners` distinct owners; the first is the primary.
    pub fn owners(&self, key: &[u8]) -> Vec<NodeId> {
        self.owners_n(key, self.num_owners)
    }

    /// Ownership details of a key.
    pub fn ownership(&self, key: &[u8]) -> Option<KeyOwnership> {
        let owners = self.owners(key);
        let (primary, backups) = owners.split_first()?;
        Some(KeyOwnership {
            key_hash: Self::hash_key(key),
            primary: *primary,
            backups: backups.to_vec(),
        })
    }

    pub fn is_primary(&self, key: &[u8], node_id: NodeId) -> bool {
        self.primary(key) == Some(node_id)
    }

    fn owners_n(&self, key: &[u8], count: usize) -> Vec<NodeId> {
        if self.vnodes.is_empty() {
            return Vec::new();
        }

        let limit = count.min(self.nodes.len());
        let mut owners = Vec::with_capacity(limit);
        let hash = Self::hash_key(key);

        for (_, &node_id) in self.vnodes.range(hash..).chain(self.vnodes.iter()) {
            if !owners.contains(&node_id) {
                owners.push(node_id);
                if owners.len() >= limit {
                    break;
                }
            }
        }
        owners
    }

    fn vnode_position(node_id: NodeId, index: usize) -> u64 {
        Self::hash_key(format!("{}:{}", node_id, index).as_bytes())
    }

    /// xxHash64 of the key bytes.
    pub fn hash_key(key: &[u8]) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(key);
        hasher.finish()
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new(2)
    }
}

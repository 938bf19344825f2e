//! Cluster topology change events.

use crate::types::NodeId;

/// A change of the cluster's membership, and with it of key ownership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyChangeEvent {
    /// Topology version after the change.
    pub version: u64,

    /// Members before the change, sorted.
    pub previous: Vec<NodeId>,

    /// Members after the change, sorted.
    pub current: Vec<NodeId>,
}

impl TopologyChangeEvent {
    /// Members present after but not before the change.
    pub fn joined(&self) -> Vec<NodeId> {
        self.current
            .iter()
            .filter(|n| !self.previous.contains(n))
            .copied()
            .collect()
    }

    /// Members present before but not after the change.
    pub fn left(&self) -> Vec<NodeId> {
        self.previous
            .iter()
            .filter(|n| !self.current.contains(n))
            .copied()
            .collect()
    }

    /// Whether `node_id` is a member after the change.
    pub fn is_member(&self, node_id: NodeId) -> bool {
        self.current.contains(&node_id)
    }
}

/// Listener for topology changes.
///
/// Called synchronously on the thread that changed the topology, after the
/// new ownership is in effect.
pub trait TopologyListener: Send + Sync + 'static {
    fn topology_changed(&self, event: &TopologyChangeEvent);
}

/// Topology listener that logs changes.
pub struct LoggingTopologyListener;

impl TopologyListener for LoggingTopologyListener {
    fn topology_changed(&self, event: &TopologyChangeEvent) {
        for node_id in event.joined() {
            tracing::info!(node_id, version = event.version, "Node joined cluster");
        }
        for node_id in event.left() {
            tracing::info!(node_id, version = event.version, "Node left cluster");
        }
        if event.current.is_empty() {
            tracing::warn!(version = event.version, "Cluster has no members");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_joined_and_left() {
        let event = TopologyChangeEvent {
            version: 3,
            previous: vec![1, 2],
            current: vec![2, 3],
        };

        assert_eq!(event.joined(), vec![3]);
        assert_eq!(event.left(), vec![1]);
        assert!(event.is_member(2));
        assert!(!event.is_member(1));
    }
}

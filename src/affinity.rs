//! Routing hints for requests targeting a bean.

use crate::types::NodeId;
use std::fmt;

/// Where requests for a bean should be sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Affinity {
    /// Any node will do.
    None,
    /// Any member of the named cluster.
    Cluster(String),
    /// The given node, which owns the bean's records.
    Node(NodeId),
}

impl Affinity {
    pub fn is_none(&self) -> bool {
        matches!(self, Affinity::None)
    }
}

impl fmt::Display for Affinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Affinity::None => write!(f, "none"),
            Affinity::Cluster(name) => write!(f, "cluster:{name}"),
            Affinity::Node(node_id) => write!(f, "node:{node_id}"),
        }
    }
}
